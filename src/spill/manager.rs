use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::constants::{RUN_FILE_EXTENSION, RUN_FILE_PREFIX, TEMP_DIR_PREFIX};
use crate::error::{EngineError, Result};
use crate::spill::merger::KWayMerger;
use crate::spill::run::{RunWriter, SpilledRun};
use crate::spill::SpillStats;

/// Owns the transient directory of one query and hands out run files.
///
/// The directory is created on the first spill, so queries that stay in memory
/// never touch the disk. Dropping the manager removes the directory and
/// anything still in it.
pub struct SpillManager {
    parent_directory: PathBuf,
    io_buffer_size: usize,
    directory: Mutex<Option<TempDir>>,
    next_run_id: AtomicUsize,
    stats: Mutex<SpillStats>,
}

impl SpillManager {
    pub fn new(parent_directory: PathBuf, io_buffer_size: usize) -> Self {
        Self {
            parent_directory,
            io_buffer_size,
            directory: Mutex::new(None),
            next_run_id: AtomicUsize::new(0),
            stats: Mutex::new(SpillStats::default()),
        }
    }

    pub fn io_buffer_size(&self) -> usize {
        self.io_buffer_size
    }

    /// The query's spill directory, if anything has been spilled yet.
    pub fn directory(&self) -> Option<PathBuf> {
        self.directory.lock().as_ref().map(|dir| dir.path().to_path_buf())
    }

    fn ensure_directory(&self) -> Result<PathBuf> {
        let mut directory = self.directory.lock();
        if let Some(dir) = directory.as_ref() {
            return Ok(dir.path().to_path_buf());
        }

        std::fs::create_dir_all(&self.parent_directory)
            .map_err(|e| EngineError::io(&self.parent_directory, e))?;
        let dir = tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .tempdir_in(&self.parent_directory)
            .map_err(|e| EngineError::io(&self.parent_directory, e))?;
        let path = dir.path().to_path_buf();
        debug!("Created spill directory {}", path.display());
        *directory = Some(dir);
        Ok(path)
    }

    /// Starts a new run owned by `operator`.
    pub fn create_run<T: Serialize>(&self, operator: &str) -> Result<RunWriter<T>> {
        let directory = self.ensure_directory()?;
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let path = directory.join(format!(
            "{}{}_{}{}",
            RUN_FILE_PREFIX, operator, run_id, RUN_FILE_EXTENSION
        ));
        RunWriter::create(run_id, path, self.io_buffer_size)
    }

    /// Writes `records` (already in run order) as one sealed run.
    pub fn write_run<'a, T, I>(&self, operator: &str, records: I) -> Result<SpilledRun>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let mut writer = self.create_run(operator)?;
        for record in records {
            writer.append(record)?;
        }
        self.seal(operator, writer)
    }

    /// Merges runs `fan_in` at a time into longer runs until no more than
    /// `fan_in` remain, so the final merge keeps a bounded number of files
    /// open. Each merged run holds at most `limit` records.
    pub fn reduce_runs<T>(
        &self,
        operator: &str,
        mut runs: Vec<SpilledRun>,
        fan_in: usize,
        limit: Option<u64>,
    ) -> Result<Vec<SpilledRun>>
    where
        T: Serialize + DeserializeOwned + Ord,
    {
        let fan_in = fan_in.max(2);
        let keep = limit.map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));
        let mut passes = 0;

        while runs.len() > fan_in {
            let batch: Vec<SpilledRun> = runs.drain(..fan_in).collect();
            let readers = batch
                .into_iter()
                .map(|run| run.into_reader::<T>(self.io_buffer_size))
                .collect::<Result<Vec<_>>>()?;

            let mut writer = self.create_run(operator)?;
            for record in KWayMerger::new(readers).take(keep) {
                writer.append(&record?)?;
            }
            runs.push(self.seal(operator, writer)?);
            passes += 1;
        }

        if passes > 0 {
            debug!(
                "{} combined runs in {} intermediate merges, {} left for the final merge",
                operator,
                passes,
                runs.len()
            );
        }
        Ok(runs)
    }

    fn seal<T: Serialize>(&self, operator: &str, writer: RunWriter<T>) -> Result<SpilledRun> {
        let run = writer.finish()?;

        let mut stats = self.stats.lock();
        stats.runs_spilled += 1;
        stats.records_spilled += run.record_count();
        stats.bytes_spilled += run.file_size_bytes();
        debug!(
            "Spilled run {} for {}: {} records, {} bytes",
            run.run_id(),
            operator,
            run.record_count(),
            run.file_size_bytes()
        );
        Ok(run)
    }

    pub fn record_peak_memory(&self, bytes: usize) {
        let mut stats = self.stats.lock();
        stats.peak_memory_bytes = stats.peak_memory_bytes.max(bytes);
    }

    pub fn stats(&self) -> SpillStats {
        self.stats.lock().clone()
    }

    /// Removes the spill directory now instead of waiting for drop.
    pub fn cleanup(&self) {
        if let Some(dir) = self.directory.lock().take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove spill directory {}: {}", path.display(), e);
            } else {
                debug!("Removed spill directory {}", path.display());
            }
        }
    }

    pub fn parent_directory(&self) -> &Path {
        &self.parent_directory
    }
}
