pub mod pipeline;
pub mod config;
pub mod sources;
pub mod sinks;
pub mod transform;
pub mod scheduler;
pub mod observability;
pub mod metrics_server;

pub use pipeline::{CycleReport, IngestionPipeline, PipelineError};
pub use scheduler::PollingScheduler;
