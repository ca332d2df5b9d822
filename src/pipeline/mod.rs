pub mod metrics;
pub mod runner;

pub use metrics::{MetricsSnapshot, StreamMetrics};
pub use runner::{
    build_runners, run_streams, BatchOutcome, MetricsRegistry, PipelineError, StreamRunner,
};
