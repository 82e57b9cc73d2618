pub mod manager;
pub mod memory;
pub mod merger;
pub mod run;


pub use manager::SpillManager;
pub use memory::{MemoryBudget, OverLimit};
pub use merger::KWayMerger;
pub use run::{RunReader, RunWriter, SpilledRun};

/// Disk activity of one query, summed over all of its operators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpillStats {
    pub runs_spilled: usize,
    pub records_spilled: usize,
    pub bytes_spilled: u64,
    pub peak_memory_bytes: usize,
}
