use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::debug;

use crate::constants::SORT_ENTRY_OVERHEAD_BYTES;
use crate::document::Document;
use crate::error::{EngineError, ResourceKind, Result};
use crate::expression::{SortKey, SortPattern};
use crate::operators::{DocumentStream, OperatorContext};
use crate::spill::{KWayMerger, MemoryBudget, OverLimit, RunReader, SpilledRun};

const OPERATOR_NAME: &str = "sort";

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub pattern: SortPattern,
    /// Set when a `$limit` directly follows the sort.
    pub limit: Option<u64>,
}

impl SortSpec {
    pub fn new(pattern: SortPattern) -> Self {
        Self {
            pattern,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn parse(spec: &serde_json::Value) -> Result<Self> {
        Ok(Self::new(SortPattern::parse(spec)?))
    }

    pub fn mode(&self, context: &OperatorContext) -> SortMode {
        SortMode::select(
            self.limit,
            context.memory_limit,
            context.top_k_document_estimate_bytes,
        )
    }
}

/// How a sorter holds its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    /// Bounded heap of the best `limit` documents seen so far.
    TopK { limit: usize },
    /// Buffer, spill sorted runs, merge. `limit` truncates every run and the output.
    External { limit: Option<u64> },
}

impl SortMode {
    /// Top-k is only chosen when `limit` documents of the estimated size fit
    /// under the ceiling; the limit is never used to size an allocation.
    pub fn select(limit: Option<u64>, memory_limit: usize, document_estimate_bytes: usize) -> Self {
        match limit {
            Some(limit) => {
                let fits = usize::try_from(limit)
                    .ok()
                    .and_then(|limit| limit.checked_mul(document_estimate_bytes))
                    .map_or(false, |bytes| bytes <= memory_limit);
                if fits {
                    SortMode::TopK {
                        limit: limit as usize,
                    }
                } else {
                    SortMode::External { limit: Some(limit) }
                }
            }
            None => SortMode::External { limit: None },
        }
    }

    pub fn error_kind(&self) -> ResourceKind {
        match self {
            SortMode::TopK { .. } | SortMode::External { limit: Some(_) } => {
                ResourceKind::SortingWithLimit
            }
            SortMode::External { limit: None } => ResourceKind::Sorting,
        }
    }

    fn limit(&self) -> Option<u64> {
        match *self {
            SortMode::TopK { limit } => Some(limit as u64),
            SortMode::External { limit } => limit,
        }
    }
}

/// A buffered document with its extracted key. The arrival sequence breaks
/// ties, which keeps the sort stable across runs.
#[derive(Debug, Serialize, Deserialize)]
struct SortEntry {
    key: SortKey,
    seq: u64,
    document: Document,
}

impl SortEntry {
    fn approximate_size(&self) -> usize {
        self.key.approximate_size() + self.document.approximate_size() + SORT_ENTRY_OVERHEAD_BYTES
    }
}

impl PartialEq for SortEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortEntry {}

impl PartialOrd for SortEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

fn truncate_to_limit(entries: &mut Vec<SortEntry>, limit: Option<u64>) {
    if let Some(limit) = limit {
        entries.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }
}

fn document_too_large(kind: ResourceKind, over: OverLimit) -> EngineError {
    EngineError::resource_exceeded(
        kind,
        over.ceiling,
        format!(
            "a single document of {} bytes exceeds the sort budget",
            over.requested
        ),
    )
}

enum SortPhase {
    Consuming,
    Emitting(std::vec::IntoIter<SortEntry>),
    Merging(KWayMerger<SortEntry, RunReader<SortEntry>>),
    Done,
}

/// Blocking sort that consumes its whole upstream before producing output.
pub struct SpillableSorter {
    pattern: SortPattern,
    mode: SortMode,
    context: OperatorContext,
    budget: MemoryBudget,
    upstream: Option<DocumentStream>,
    buffer: Vec<SortEntry>,
    heap: BinaryHeap<SortEntry>,
    runs: Vec<SpilledRun>,
    remaining: Option<u64>,
    next_seq: u64,
    phase: SortPhase,
}

impl SpillableSorter {
    pub fn new(spec: SortSpec, upstream: DocumentStream, context: OperatorContext) -> Self {
        let mode = spec.mode(&context);
        debug!("$sort on {} fields using {:?}", spec.pattern.components().len(), mode);
        Self {
            pattern: spec.pattern,
            mode,
            budget: MemoryBudget::new(context.memory_limit),
            context,
            upstream: Some(upstream),
            buffer: Vec::new(),
            heap: BinaryHeap::new(),
            runs: Vec::new(),
            remaining: mode.limit(),
            next_seq: 0,
            phase: SortPhase::Consuming,
        }
    }

    /// The current mode. A top-k sort that outgrows its budget reports
    /// `External` from then on.
    pub fn mode(&self) -> SortMode {
        self.mode
    }

    fn consume(&mut self) -> Result<()> {
        if let Some(upstream) = self.upstream.take() {
            for document in upstream {
                let document = document?;
                let entry = SortEntry {
                    key: self.pattern.key_for(&document),
                    seq: self.next_seq,
                    document,
                };
                self.next_seq += 1;

                match self.mode {
                    SortMode::TopK { limit } => self.push_top_k(entry, limit)?,
                    SortMode::External { .. } => self.push_external(entry)?,
                }
            }
        }

        if let SortMode::TopK { .. } = self.mode {
            let sorted = std::mem::take(&mut self.heap).into_sorted_vec();
            debug!("$sort top-k kept {} documents", sorted.len());
            self.phase = SortPhase::Emitting(sorted.into_iter());
            return Ok(());
        }

        if self.runs.is_empty() {
            let mut sorted = std::mem::take(&mut self.buffer);
            self.sort_entries(&mut sorted);
            truncate_to_limit(&mut sorted, self.remaining);
            debug!("$sort finished in memory with {} documents", sorted.len());
            self.phase = SortPhase::Emitting(sorted.into_iter());
            return Ok(());
        }

        if !self.buffer.is_empty() {
            self.spill_buffer()?;
        }
        let runs = self.context.spill.reduce_runs::<SortEntry>(
            OPERATOR_NAME,
            std::mem::take(&mut self.runs),
            self.context.merge_fan_in,
            self.remaining,
        )?;
        let io_buffer_size = self.context.spill.io_buffer_size();
        let readers = runs
            .into_iter()
            .map(|run| run.into_reader(io_buffer_size))
            .collect::<Result<Vec<_>>>()?;

        debug!("$sort merging {} runs", readers.len());
        self.budget.reset();
        self.phase = SortPhase::Merging(KWayMerger::new(readers));
        Ok(())
    }

    fn push_top_k(&mut self, entry: SortEntry, limit: usize) -> Result<()> {
        if limit == 0 {
            return Ok(());
        }

        if self.heap.len() >= limit {
            match self.heap.peek() {
                Some(worst) if entry >= *worst => return Ok(()),
                _ => {}
            }
            if let Some(evicted) = self.heap.pop() {
                self.budget.release(evicted.approximate_size());
            }
        }

        if self.budget.reserve(entry.approximate_size()).is_err() {
            if !self.context.allow_disk_use {
                return Err(EngineError::disk_use_required(
                    ResourceKind::SortingWithLimit,
                    self.budget.ceiling(),
                ));
            }

            debug!(
                "$sort top-k of {} outgrew {} bytes, switching to external sort",
                limit,
                self.budget.ceiling()
            );
            self.buffer = std::mem::take(&mut self.heap).into_vec();
            self.mode = SortMode::External {
                limit: Some(limit as u64),
            };
            return self.push_external(entry);
        }

        self.heap.push(entry);
        Ok(())
    }

    fn push_external(&mut self, entry: SortEntry) -> Result<()> {
        let size = entry.approximate_size();
        if self.budget.reserve(size).is_err() {
            let kind = self.mode.error_kind();
            if !self.context.allow_disk_use {
                return Err(EngineError::disk_use_required(kind, self.budget.ceiling()));
            }

            self.spill_buffer()?;
            self.budget
                .reserve(size)
                .map_err(|over| document_too_large(kind, over))?;
        }

        self.buffer.push(entry);
        Ok(())
    }

    fn sort_entries(&self, entries: &mut [SortEntry]) {
        // (key, seq) is unique, so an unstable sort is still deterministic
        if self.context.parallel_sort {
            entries.par_sort_unstable();
        } else {
            entries.sort_unstable();
        }
    }

    fn spill_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            self.budget.reset();
            return Ok(());
        }

        let mut entries = std::mem::take(&mut self.buffer);
        self.sort_entries(&mut entries);
        truncate_to_limit(&mut entries, self.remaining);

        let run = self.context.spill.write_run(OPERATOR_NAME, entries.iter())?;
        debug!(
            "$sort spilled {} documents ({} bytes in memory) to run {}",
            entries.len(),
            self.budget.used(),
            run.run_id()
        );
        self.runs.push(run);
        self.budget.reset();
        Ok(())
    }

    fn next_merged(&mut self) -> Option<Result<Document>> {
        if self.remaining == Some(0) {
            return None;
        }

        let merger = match &mut self.phase {
            SortPhase::Merging(merger) => merger,
            _ => return None,
        };

        let entry = merger.next()?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(entry.map(|entry| entry.document))
    }

    fn finish(&mut self) {
        self.context.spill.record_peak_memory(self.budget.peak());
        self.phase = SortPhase::Done;
    }

    fn abort(&mut self) {
        self.upstream = None;
        self.buffer = Vec::new();
        self.heap = BinaryHeap::new();
        self.runs.clear();
        self.finish();
    }
}

impl Iterator for SpillableSorter {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.phase {
                SortPhase::Consuming => {
                    if let Err(e) = self.consume() {
                        self.abort();
                        return Some(Err(e));
                    }
                }
                SortPhase::Emitting(entries) => match entries.next() {
                    Some(entry) => return Some(Ok(entry.document)),
                    None => {
                        self.finish();
                        return None;
                    }
                },
                SortPhase::Merging(_) => {
                    return match self.next_merged() {
                        Some(Ok(document)) => Some(Ok(document)),
                        Some(Err(e)) => {
                            self.abort();
                            Some(Err(e))
                        }
                        None => {
                            self.finish();
                            None
                        }
                    };
                }
                SortPhase::Done => return None,
            }
        }
    }
}
