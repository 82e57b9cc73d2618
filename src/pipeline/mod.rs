pub mod cancellation;
pub mod coordinator;
pub mod request;
pub mod stage;

#[cfg(test)]
mod tests;

pub use cancellation::CancellationToken;
pub use coordinator::{ExecutionCoordinator, ExecutionStats, PipelineStream};
pub use request::AggregateRequest;
pub use stage::Stage;
