// Document model and expressions evaluated against it
pub mod document;
pub mod expression;

// Spill machinery: memory budgets, run files and the k-way merge
pub mod spill;

// Blocking, spill-capable operators and the pipeline that chains them
pub mod operators;
pub mod pipeline;

pub mod config;
pub mod constants;
pub mod error;
pub mod utils;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use document::{Document, Value};
pub use error::{EngineError, ResourceKind};
pub use pipeline::{
    AggregateRequest, CancellationToken, ExecutionCoordinator, ExecutionStats, PipelineStream,
    Stage,
};

use anyhow::Result;

/// Runs `request` over `documents` on tokio's blocking pool and collects the
/// whole result.
pub async fn aggregate(
    config: EngineConfig,
    request: AggregateRequest,
    documents: Vec<Document>,
) -> Result<(Vec<Document>, ExecutionStats)> {
    let coordinator = ExecutionCoordinator::new(config)?;

    tokio::task::spawn_blocking(move || -> Result<(Vec<Document>, ExecutionStats)> {
        let mut stream = coordinator.execute(request, documents)?;
        let results = stream.by_ref().collect::<error::Result<Vec<_>>>()?;
        Ok((results, stream.stats()))
    })
    .await?
}
