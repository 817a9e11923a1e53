//! Closed table of named user functions.
//!
//! Registry entries refer to custom transformers and calculators by name. The
//! names are checked against this table when the registry loads, so an unknown
//! key surfaces as a configuration error instead of a failure mid-run.

use crate::compute::metrics::{MetricInput, MetricValue};
use crate::compute::transform::TransformInput;
use crate::store::types::PercentileTimeSeries;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type TransformerFn =
    Arc<dyn Fn(&TransformInput<'_>) -> Result<Vec<PercentileTimeSeries>, String> + Send + Sync>;

pub type CalculatorFn = Arc<dyn Fn(&MetricInput<'_>) -> Result<MetricValue, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FunctionTable {
    transformers: BTreeMap<String, TransformerFn>,
    calculators: BTreeMap<String, CalculatorFn>,
}

impl FunctionTable {
    pub fn new() -> Self { Self::default() }

    pub fn register_transformer<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&TransformInput<'_>) -> Result<Vec<PercentileTimeSeries>, String> + Send + Sync + 'static,
    {
        self.transformers.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn register_calculator<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&MetricInput<'_>) -> Result<MetricValue, String> + Send + Sync + 'static,
    {
        self.calculators.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn transformer(&self, name: &str) -> Option<&TransformerFn> { self.transformers.get(name) }

    pub fn calculator(&self, name: &str) -> Option<&CalculatorFn> { self.calculators.get(name) }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTable")
            .field("transformers", &self.transformers.keys().collect::<Vec<_>>())
            .field("calculators", &self.calculators.keys().collect::<Vec<_>>())
            .finish()
    }
}
