use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::error::{EngineError, Result};

/// Lazily merges N individually ordered sources into one ordered sequence.
///
/// Holds one head per source in a binary heap, so memory stays O(N) however
/// large the runs are. Items that compare equal come out in source order.
pub struct KWayMerger<T, I> {
    sources: Vec<I>,
    heap: BinaryHeap<Reverse<MergeEntry<T>>>,
    primed: bool,
    failed: bool,
    pending_error: Option<EngineError>,
}

#[derive(Debug)]
struct MergeEntry<T> {
    item: T,
    source: usize,
}

impl<T: Ord> PartialEq for MergeEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for MergeEntry<T> {}

impl<T: Ord> PartialOrd for MergeEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for MergeEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item
            .cmp(&other.item)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl<T, I> KWayMerger<T, I>
where
    T: Ord,
    I: Iterator<Item = Result<T>>,
{
    pub fn new(sources: Vec<I>) -> Self {
        let capacity = sources.len();
        Self {
            sources,
            heap: BinaryHeap::with_capacity(capacity),
            primed: false,
            failed: false,
            pending_error: None,
        }
    }

    fn pull(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            let item = next?;
            self.heap.push(Reverse(MergeEntry { item, source }));
        }
        Ok(())
    }

    fn prime(&mut self) -> Result<()> {
        self.primed = true;
        for source in 0..self.sources.len() {
            self.pull(source)?;
        }
        Ok(())
    }

    fn fail(&mut self) {
        self.failed = true;
        self.heap.clear();
        self.sources.clear();
    }
}

impl<T, I> Iterator for KWayMerger<T, I>
where
    T: Ord,
    I: Iterator<Item = Result<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if let Some(e) = self.pending_error.take() {
            self.fail();
            return Some(Err(e));
        }

        if !self.primed {
            if let Err(e) = self.prime() {
                self.fail();
                return Some(Err(e));
            }
        }

        let Reverse(entry) = self.heap.pop()?;
        // A failed refill is reported on the following pull
        if let Err(e) = self.pull(entry.source) {
            self.pending_error = Some(e);
        }
        Some(Ok(entry.item))
    }
}
