use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::hash_map::{self, Entry};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::constants::GROUP_ENTRY_OVERHEAD_BYTES;
use crate::document::{Document, Value};
use crate::error::{EngineError, ResourceKind, Result};
use crate::expression::Expression;
use crate::operators::accumulator::{states_size, AccumulatorSpec, AccumulatorState};
use crate::operators::{DocumentStream, OperatorContext};
use crate::spill::{KWayMerger, MemoryBudget, OverLimit, RunReader, SpilledRun};

const OPERATOR_NAME: &str = "group";

/// `{_id: <key expression>, <field>: {<accumulator>: <expression>}, ...}`
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub key: Expression,
    pub accumulators: Vec<AccumulatorSpec>,
}

impl GroupSpec {
    pub fn new(key: Expression, accumulators: Vec<AccumulatorSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        for acc in &accumulators {
            if acc.output_field == "_id" || acc.output_field.contains('.') || acc.output_field.starts_with('$') {
                return Err(EngineError::invalid_argument(format!(
                    "invalid $group output field '{}'",
                    acc.output_field
                )));
            }
            if !seen.insert(acc.output_field.as_str()) {
                return Err(EngineError::invalid_argument(format!(
                    "duplicate $group output field '{}'",
                    acc.output_field
                )));
            }
        }
        Ok(Self { key, accumulators })
    }

    pub fn parse(spec: &serde_json::Value) -> Result<Self> {
        let map = spec
            .as_object()
            .ok_or_else(|| EngineError::invalid_argument("$group must be an object"))?;
        let key = map
            .get("_id")
            .ok_or_else(|| EngineError::invalid_argument("$group requires an _id expression"))?;

        let accumulators = map
            .iter()
            .filter(|(field, _)| field.as_str() != "_id")
            .map(|(field, acc)| AccumulatorSpec::parse(field, acc))
            .collect::<Result<Vec<_>>>()?;

        Self::new(Expression::parse(key)?, accumulators)
    }

    fn partial_states(&self, document: &Document, seq: u64) -> Vec<AccumulatorState> {
        self.accumulators
            .iter()
            .map(|acc| {
                let mut state = AccumulatorState::init(acc.op);
                state.update(acc.argument.evaluate_optional(document), seq);
                state
            })
            .collect()
    }

    fn output_document(&self, key: Value, states: Vec<AccumulatorState>) -> Document {
        let mut document = Document::with_capacity(1 + states.len());
        document.insert("_id", key);
        for (acc, state) in self.accumulators.iter().zip(states) {
            document.insert(acc.output_field.clone(), state.finalize());
        }
        document
    }
}

/// One group as written to a run. Runs are ordered by key only.
#[derive(Debug, Serialize, Deserialize)]
struct GroupEntry {
    key: Value,
    states: Vec<AccumulatorState>,
}

impl GroupEntry {
    fn approximate_size(&self) -> usize {
        entry_size(&self.key, states_size(&self.states))
    }

    fn merge(&mut self, other: GroupEntry) {
        for (state, partial) in self.states.iter_mut().zip(other.states) {
            state.merge(partial);
        }
    }
}

impl PartialEq for GroupEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for GroupEntry {}

impl PartialOrd for GroupEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

fn entry_size(key: &Value, states_bytes: usize) -> usize {
    key.approximate_size() + states_bytes + GROUP_ENTRY_OVERHEAD_BYTES
}

fn single_group_too_large(over: OverLimit) -> EngineError {
    EngineError::resource_exceeded(
        ResourceKind::Grouping,
        over.ceiling,
        format!(
            "a single group needs {} bytes, which cannot fit even after spilling",
            over.requested.saturating_add(over.used)
        ),
    )
}

enum GroupPhase {
    Accumulating,
    Emitting(hash_map::IntoIter<Value, Vec<AccumulatorState>>),
    Merging(KWayMerger<GroupEntry, RunReader<GroupEntry>>),
    Done,
}

/// Hash group-by that spills partial groups as key-ordered runs when its
/// budget runs out, then merges the runs key by key.
pub struct SpillableGrouper {
    spec: GroupSpec,
    context: OperatorContext,
    budget: MemoryBudget,
    upstream: Option<DocumentStream>,
    table: HashMap<Value, Vec<AccumulatorState>>,
    runs: Vec<SpilledRun>,
    pending: Option<GroupEntry>,
    next_seq: u64,
    phase: GroupPhase,
}

impl SpillableGrouper {
    pub fn new(spec: GroupSpec, upstream: DocumentStream, context: OperatorContext) -> Self {
        Self {
            spec,
            budget: MemoryBudget::new(context.memory_limit),
            context,
            upstream: Some(upstream),
            table: HashMap::new(),
            runs: Vec::new(),
            pending: None,
            next_seq: 0,
            phase: GroupPhase::Accumulating,
        }
    }

    fn accumulate(&mut self) -> Result<()> {
        if let Some(upstream) = self.upstream.take() {
            for document in upstream {
                self.absorb(document?)?;
            }
        }

        if self.runs.is_empty() {
            debug!("$group finished in memory with {} groups", self.table.len());
            let table = std::mem::take(&mut self.table);
            self.phase = GroupPhase::Emitting(table.into_iter());
            return Ok(());
        }

        if !self.table.is_empty() {
            self.spill_table()?;
        }
        let runs = self.context.spill.reduce_runs::<GroupEntry>(
            OPERATOR_NAME,
            std::mem::take(&mut self.runs),
            self.context.merge_fan_in,
            None,
        )?;
        let io_buffer_size = self.context.spill.io_buffer_size();
        let readers = runs
            .into_iter()
            .map(|run| run.into_reader(io_buffer_size))
            .collect::<Result<Vec<_>>>()?;

        debug!("$group merging {} runs", readers.len());
        self.budget.reset();
        self.phase = GroupPhase::Merging(KWayMerger::new(readers));
        Ok(())
    }

    fn absorb(&mut self, document: Document) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let key = self.spec.key.evaluate(&document);
        let partial = self.spec.partial_states(&document, seq);
        drop(document);
        let partial_size = states_size(&partial);

        // An existing group grows by at most the size of the partial state
        let needed = if self.table.contains_key(&key) {
            partial_size
        } else {
            entry_size(&key, partial_size)
        };

        if self.budget.reserve(needed).is_err() {
            if !self.context.allow_disk_use {
                return Err(EngineError::disk_use_required(
                    ResourceKind::Grouping,
                    self.budget.ceiling(),
                ));
            }

            self.spill_table()?;
            self.budget
                .reserve(entry_size(&key, partial_size))
                .map_err(single_group_too_large)?;
            self.table.insert(key, partial);
            return Ok(());
        }

        match self.table.entry(key) {
            Entry::Occupied(mut entry) => {
                let states = entry.get_mut();
                let before = states_size(states);
                for (state, part) in states.iter_mut().zip(partial) {
                    state.merge(part);
                }
                let after = states_size(states);
                let growth = after.saturating_sub(before);
                self.budget
                    .release(needed.saturating_sub(growth) + before.saturating_sub(after));
            }
            Entry::Vacant(entry) => {
                entry.insert(partial);
            }
        }
        Ok(())
    }

    fn spill_table(&mut self) -> Result<()> {
        if self.table.is_empty() {
            self.budget.reset();
            return Ok(());
        }

        let mut entries: Vec<GroupEntry> = std::mem::take(&mut self.table)
            .into_iter()
            .map(|(key, states)| GroupEntry { key, states })
            .collect();
        if self.context.parallel_sort {
            entries.par_sort_unstable_by(|a, b| a.key.cmp(&b.key));
        } else {
            entries.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        }

        let run = self.context.spill.write_run(OPERATOR_NAME, entries.iter())?;
        debug!(
            "$group spilled {} groups ({} bytes in memory) to run {}",
            entries.len(),
            self.budget.used(),
            run.run_id()
        );
        self.runs.push(run);
        self.budget.reset();
        Ok(())
    }

    fn next_merged_group(&mut self) -> Result<Option<Document>> {
        let merger = match &mut self.phase {
            GroupPhase::Merging(merger) => merger,
            _ => return Ok(None),
        };

        let mut current = match self.pending.take() {
            Some(entry) => entry,
            None => match merger.next() {
                Some(entry) => entry?,
                None => return Ok(None),
            },
        };

        // Only the group being merged is resident
        self.budget.reset();
        self.budget
            .reserve(current.approximate_size())
            .map_err(single_group_too_large)?;

        while let Some(next) = merger.next() {
            let next = next?;
            if next.key != current.key {
                self.pending = Some(next);
                break;
            }
            // Charge only what the merged state grew by
            let before = current.approximate_size();
            current.merge(next);
            let after = current.approximate_size();
            if after > before {
                self.budget
                    .reserve(after - before)
                    .map_err(single_group_too_large)?;
            } else {
                self.budget.release(before - after);
            }
        }

        Ok(Some(self.spec.output_document(current.key, current.states)))
    }

    fn finish(&mut self) {
        self.context.spill.record_peak_memory(self.budget.peak());
        self.phase = GroupPhase::Done;
    }

    fn abort(&mut self) {
        self.upstream = None;
        self.table.clear();
        self.runs.clear();
        self.pending = None;
        self.finish();
    }
}

impl Iterator for SpillableGrouper {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.phase {
                GroupPhase::Accumulating => {
                    if let Err(e) = self.accumulate() {
                        self.abort();
                        return Some(Err(e));
                    }
                }
                GroupPhase::Emitting(entries) => match entries.next() {
                    Some((key, states)) => return Some(Ok(self.spec.output_document(key, states))),
                    None => {
                        self.finish();
                        return None;
                    }
                },
                GroupPhase::Merging(_) => {
                    return match self.next_merged_group() {
                        Ok(Some(document)) => Some(Ok(document)),
                        Ok(None) => {
                            self.finish();
                            None
                        }
                        Err(e) => {
                            self.abort();
                            Some(Err(e))
                        }
                    };
                }
                GroupPhase::Done => return None,
            }
        }
    }
}
