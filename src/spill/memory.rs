use std::fmt;

/// Returned by [`MemoryBudget::reserve`] when a reservation would cross the
/// ceiling. The budget is left untouched; the caller decides to spill or fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverLimit {
    pub requested: usize,
    pub used: usize,
    pub ceiling: usize,
}

impl fmt::Display for OverLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reserving {} bytes with {} of {} bytes in use",
            self.requested, self.used, self.ceiling
        )
    }
}

/// Running in-memory byte count for one stateful operator.
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    ceiling: usize,
    used: usize,
    peak: usize,
}

impl MemoryBudget {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            used: 0,
            peak: 0,
        }
    }

    pub fn reserve(&mut self, bytes: usize) -> Result<(), OverLimit> {
        match self.used.checked_add(bytes) {
            Some(total) if total <= self.ceiling => {
                self.used = total;
                self.peak = self.peak.max(total);
                Ok(())
            }
            _ => Err(OverLimit {
                requested: bytes,
                used: self.used,
                ceiling: self.ceiling,
            }),
        }
    }

    pub fn release(&mut self, bytes: usize) {
        self.used = self.used.saturating_sub(bytes);
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn remaining(&self) -> usize {
        self.ceiling.saturating_sub(self.used)
    }

    /// Highest usage seen since construction.
    pub fn peak(&self) -> usize {
        self.peak
    }
}
