pub mod accumulator;
pub mod group;
pub mod limit;
pub mod sort;


pub use accumulator::{AccumulatorOp, AccumulatorSpec, AccumulatorState};
pub use group::{GroupSpec, SpillableGrouper};
pub use limit::LimitOperator;
pub use sort::{SortMode, SortSpec, SpillableSorter};

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::document::Document;
use crate::error::Result;
use crate::spill::SpillManager;

/// A pull-based, owned sequence of documents. Each stage owns its upstream.
pub type DocumentStream = Box<dyn Iterator<Item = Result<Document>> + Send>;

/// What every stateful operator of one query is constructed with.
#[derive(Clone)]
pub struct OperatorContext {
    pub allow_disk_use: bool,
    pub memory_limit: usize,
    pub top_k_document_estimate_bytes: usize,
    pub parallel_sort: bool,
    pub merge_fan_in: usize,
    pub spill: Arc<SpillManager>,
}

impl OperatorContext {
    pub fn new(config: &EngineConfig, allow_disk_use: bool, spill: Arc<SpillManager>) -> Self {
        Self {
            allow_disk_use,
            memory_limit: config.memory_limit(),
            top_k_document_estimate_bytes: config.top_k_document_estimate_bytes,
            parallel_sort: config.parallel_sort,
            merge_fan_in: config.merge_fan_in,
            spill,
        }
    }

    pub fn with_memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit;
        self
    }
}
