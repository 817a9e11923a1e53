//! Percentile-aware cash-flow engine for wind projects.
//!
//! A declarative [`Registry`] of sources and metrics is validated once, then a
//! [`ComputationContext`] recomputes every source series and metric for all
//! configured percentiles. Results are cached per percentile, so switching the
//! active selection is a lookup. Every computed value carries an audit trail.

pub mod analysis;
pub mod audit;
pub mod compute;
pub mod display;
pub mod finance;
pub mod logging;
pub mod settings;
pub mod store;

pub use analysis::telemetry::RunReport;
pub use analysis::validation::ConfigurationError;
pub use compute::{
    ComputationContext, ComputationError, ComputedMetric, ComputedSource, EngineError, MetricResult, MetricValue,
    PathResolver,
};
pub use settings::{load_settings, EngineSettings};
pub use store::{FunctionTable, PercentileSelection, Registry, RegistryDocument};
