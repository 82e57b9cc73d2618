use crate::document::Document;
use crate::error::Result;
use crate::operators::DocumentStream;

/// Passes through at most `limit` documents. Once the limit is reached the
/// upstream is dropped, which releases any spilled runs it still holds.
pub struct LimitOperator {
    upstream: Option<DocumentStream>,
    remaining: u64,
}

impl LimitOperator {
    pub fn new(upstream: DocumentStream, limit: u64) -> Self {
        Self {
            upstream: (limit > 0).then_some(upstream),
            remaining: limit,
        }
    }
}

impl Iterator for LimitOperator {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let upstream = self.upstream.as_mut()?;
        let next = upstream.next();

        match &next {
            Some(Ok(_)) => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.upstream = None;
                }
            }
            Some(Err(_)) | None => self.upstream = None,
        }
        next
    }
}
