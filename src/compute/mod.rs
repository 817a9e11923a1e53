//! Per-run computation: references, sources, metrics and the result store.
pub mod engine;
pub mod kernel;
pub mod ledger;
pub mod metrics;
pub mod references;
pub mod sources;
pub mod transform;

pub use engine::{ComputationContext, EngineError, PercentileQuery};
pub use ledger::{ComputationError, ComputedMetric, ComputedSource, SourceMetadata};
pub use metrics::{MetricInput, MetricResult, MetricValue, SeriesStats, ThresholdEvaluation};
pub use references::{PathResolver, References};
pub use transform::TransformInput;
