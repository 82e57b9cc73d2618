use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::document::Document;
use crate::error::{EngineError, Result};
use crate::operators::{
    DocumentStream, LimitOperator, OperatorContext, SpillableGrouper, SpillableSorter,
};
use crate::pipeline::cancellation::CancellationToken;
use crate::pipeline::request::AggregateRequest;
use crate::pipeline::stage::Stage;
use crate::spill::SpillManager;
use crate::utils::format_bytes;

/// Summary of one executed pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    pub documents_in: u64,
    pub documents_out: u64,
    pub runs_spilled: usize,
    pub records_spilled: usize,
    pub bytes_spilled: u64,
    pub peak_memory_bytes: usize,
    pub elapsed_ms: u64,
}

/// Builds operator chains for aggregate requests and hands back their output
/// as a lazy stream.
pub struct ExecutionCoordinator {
    config: EngineConfig,
    cancellation: CancellationToken,
}

impl ExecutionCoordinator {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancellation: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `request` over in-memory documents.
    pub fn execute<I>(&self, request: AggregateRequest, source: I) -> Result<PipelineStream>
    where
        I: IntoIterator<Item = Document>,
        I::IntoIter: Send + 'static,
    {
        self.execute_stream(request, Box::new(source.into_iter().map(Ok)))
    }

    /// Parses a JSON request and runs it. Nothing is read from `source` when
    /// the request is malformed.
    pub fn execute_json<I>(&self, request: &serde_json::Value, source: I) -> Result<PipelineStream>
    where
        I: IntoIterator<Item = Document>,
        I::IntoIter: Send + 'static,
    {
        self.execute(AggregateRequest::from_json(request)?, source)
    }

    /// Runs `request` over a fallible source; a source error fails the query.
    pub fn execute_stream(
        &self,
        request: AggregateRequest,
        source: DocumentStream,
    ) -> Result<PipelineStream> {
        request.validate()?;
        if self.cancellation.is_cancelled() {
            return Err(EngineError::Interrupted);
        }

        let spill = Arc::new(SpillManager::new(
            self.config.temp_directory.clone(),
            self.config.io_buffer_size_bytes(),
        ));
        let context = OperatorContext::new(&self.config, request.allow_disk_use, spill.clone());

        info!(
            "Running {} stage pipeline (allowDiskUse: {}, per-operator limit: {})",
            request.pipeline.len(),
            request.allow_disk_use,
            format_bytes(context.memory_limit as u64)
        );

        let documents_in = Arc::new(AtomicU64::new(0));
        let source: DocumentStream = Box::new(CountingSource {
            upstream: source,
            count: documents_in.clone(),
        });

        let mut stream = self.guard(source);
        for stage in coalesce_sort_limits(request.pipeline) {
            let operator: DocumentStream = match stage {
                Stage::Group(spec) => Box::new(SpillableGrouper::new(spec, stream, context.clone())),
                Stage::Sort(spec) => Box::new(SpillableSorter::new(spec, stream, context.clone())),
                Stage::Limit(limit) => Box::new(LimitOperator::new(stream, limit)),
            };
            stream = self.guard(operator);
        }

        Ok(PipelineStream {
            chain: Some(stream),
            spill,
            documents_in,
            documents_out: 0,
            started: Instant::now(),
            elapsed_ms: None,
        })
    }

    fn guard(&self, upstream: DocumentStream) -> DocumentStream {
        Box::new(CancellationGuard {
            upstream,
            cancellation: self.cancellation.clone(),
        })
    }
}

/// Pushes the smallest of the `$limit`s directly following a `$sort` into the
/// sort. The limit stages themselves stay in place.
fn coalesce_sort_limits(mut stages: Vec<Stage>) -> Vec<Stage> {
    for i in 0..stages.len() {
        let smallest = stages[i + 1..]
            .iter()
            .map_while(|stage| match stage {
                Stage::Limit(limit) => Some(*limit),
                _ => None,
            })
            .min();

        if let (Stage::Sort(spec), Some(limit)) = (&mut stages[i], smallest) {
            spec.limit = Some(spec.limit.map_or(limit, |existing| existing.min(limit)));
        }
    }
    stages
}

struct CancellationGuard {
    upstream: DocumentStream,
    cancellation: CancellationToken,
}

impl Iterator for CancellationGuard {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancellation.is_cancelled() {
            return Some(Err(EngineError::Interrupted));
        }
        self.upstream.next()
    }
}

struct CountingSource {
    upstream: DocumentStream,
    count: Arc<AtomicU64>,
}

impl Iterator for CountingSource {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.upstream.next();
        if let Some(Ok(_)) = next {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        next
    }
}

/// Output of an executing pipeline.
///
/// Fused after the first error or after the last document. Either way the
/// operator chain is dropped and the query's spill directory removed before
/// the terminating item is returned.
pub struct PipelineStream {
    chain: Option<DocumentStream>,
    spill: Arc<SpillManager>,
    documents_in: Arc<AtomicU64>,
    documents_out: u64,
    started: Instant,
    elapsed_ms: Option<u64>,
}

impl PipelineStream {
    pub fn stats(&self) -> ExecutionStats {
        let spill = self.spill.stats();
        ExecutionStats {
            documents_in: self.documents_in.load(Ordering::Relaxed),
            documents_out: self.documents_out,
            runs_spilled: spill.runs_spilled,
            records_spilled: spill.records_spilled,
            bytes_spilled: spill.bytes_spilled,
            peak_memory_bytes: spill.peak_memory_bytes,
            elapsed_ms: self
                .elapsed_ms
                .unwrap_or_else(|| self.started.elapsed().as_millis() as u64),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.chain.is_none()
    }

    fn close(&mut self) {
        self.chain = None;
        self.spill.cleanup();
        self.elapsed_ms = Some(self.started.elapsed().as_millis() as u64);
    }
}

impl Iterator for PipelineStream {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let chain = self.chain.as_mut()?;
        match chain.next() {
            Some(Ok(document)) => {
                self.documents_out += 1;
                Some(Ok(document))
            }
            Some(Err(e)) => {
                self.close();
                warn!("Pipeline failed with code {}: {}", e.code(), e);
                Some(Err(e))
            }
            None => {
                self.close();
                let stats = self.stats();
                info!(
                    "Pipeline finished: {} in, {} out, {} runs spilled ({}), peak operator memory {}",
                    stats.documents_in,
                    stats.documents_out,
                    stats.runs_spilled,
                    format_bytes(stats.bytes_spilled),
                    format_bytes(stats.peak_memory_bytes as u64)
                );
                None
            }
        }
    }
}

impl Drop for PipelineStream {
    fn drop(&mut self) {
        if self.chain.is_some() {
            self.close();
        }
    }
}
