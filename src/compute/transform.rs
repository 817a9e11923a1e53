//! Transformer step of the source pipeline.
//!
//! With no transformer configured the raw value goes through the default
//! resolution policy:
//! - `Scalar` is broadcast over years `1..=project_life` for every percentile.
//! - `Series` is replicated to every percentile.
//! - `Percentiles` passes through; missing percentiles are filled from the primary.
//! - `Object` cannot be interpreted and is reported as unavailable.
use crate::compute::kernel;
use crate::compute::ledger::{ComputationError, LedgerView};
use crate::compute::references::References;
use crate::settings::EngineSettings;
use crate::store::functions::FunctionTable;
use crate::store::types::{CombineOp, DataValue, PercentileTimeSeries, TransformerKind};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Everything a transformer may look at. Custom transformers receive this too.
pub struct TransformInput<'a> {
    pub source_id: &'a str,
    pub raw: Option<&'a DataValue>,
    pub has_percentiles: bool,
    pub available_percentiles: &'a [u32],
    pub primary_percentile: u32,
    pub references: &'a References,
    /// Sources finalized in earlier waves.
    pub view: LedgerView<'a>,
    pub settings: &'a EngineSettings,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transformed {
    /// One series per available percentile, in configured order.
    pub series: Vec<PercentileTimeSeries>,
    pub warnings: Vec<String>,
    /// Sources and references consulted.
    pub consulted: Vec<String>,
}

pub fn run_transformer(
    kind: Option<&TransformerKind>,
    input: &TransformInput<'_>,
    functions: &FunctionTable,
) -> Result<Transformed, ComputationError> {
    let mut out = Transformed::default();
    let series = match kind {
        None => default_resolution(input, &mut out.warnings)?,
        Some(TransformerKind::PerTurbine) => {
            let mut series = default_resolution(input, &mut out.warnings)?;
            scale(&mut series, input.settings.num_wtgs);
            series
        }
        Some(TransformerKind::ScaleByReference { reference }) => {
            let mut series = default_resolution(input, &mut out.warnings)?;
            out.consulted.push(reference.clone());
            match input.references.scalar(reference) {
                Some(factor) => scale(&mut series, factor),
                None => out.warnings.push(format!("reference '{}' unavailable, left unscaled", reference)),
            }
            series
        }
        Some(TransformerKind::Combine { sources, op }) => {
            out.consulted.extend(sources.iter().cloned());
            combine(input, sources, *op, &mut out.warnings)
        }
        Some(TransformerKind::Custom { name }) => {
            let f = functions
                .transformer(name)
                .ok_or_else(|| ComputationError::Transformer { name: name.clone(), message: "not registered".into() })?;
            let produced = match catch_unwind(AssertUnwindSafe(|| f(input))) {
                Ok(Ok(series)) => series,
                Ok(Err(message)) => return Err(ComputationError::Transformer { name: name.clone(), message }),
                Err(_) => return Err(ComputationError::Panicked(name.clone())),
            };
            conform_percentiles(produced, input.available_percentiles, input.primary_percentile, &mut out.warnings)?
        }
    };
    out.series = series;
    Ok(out)
}

fn default_resolution(input: &TransformInput<'_>, warnings: &mut Vec<String>) -> Result<Vec<PercentileTimeSeries>, ComputationError> {
    let percentiles = input.available_percentiles;
    match input.raw {
        None => Err(ComputationError::DataUnavailable(format!("no raw data for '{}'", input.source_id))),
        Some(DataValue::Scalar(v)) => Ok(kernel::expand_scalar(*v, percentiles, input.settings.project_life)),
        Some(DataValue::Series(points)) => Ok(kernel::replicate_series(points, percentiles)),
        Some(DataValue::Percentiles(list)) => {
            conform_percentiles(list.clone(), percentiles, input.primary_percentile, warnings)
        }
        Some(DataValue::Object(_)) => Err(ComputationError::DataUnavailable(format!(
            "raw data for '{}' is an object and needs a transformer",
            input.source_id
        ))),
    }
}

/// Orders series by `available` and fills gaps from the primary percentile.
///
/// Every series is rebuilt with ascending, unique years; percentiles outside
/// `available` are dropped.
pub fn conform_percentiles(
    produced: Vec<PercentileTimeSeries>,
    available: &[u32],
    primary: u32,
    warnings: &mut Vec<String>,
) -> Result<Vec<PercentileTimeSeries>, ComputationError> {
    let find = |p: u32| produced.iter().find(|s| s.percentile == p);
    let fallback = find(primary).ok_or_else(|| {
        ComputationError::DataUnavailable(format!("primary percentile P{} missing from transformer output", primary))
    })?;

    let mut out = Vec::with_capacity(available.len());
    for &p in available {
        match find(p) {
            Some(s) => out.push(PercentileTimeSeries::new(p, s.points.clone())),
            None => {
                warnings.push(format!("P{} missing, filled from P{}", p, primary));
                out.push(PercentileTimeSeries::new(p, fallback.points.clone()));
            }
        }
    }
    Ok(out)
}

fn combine(input: &TransformInput<'_>, members: &[String], op: CombineOp, warnings: &mut Vec<String>) -> Vec<PercentileTimeSeries> {
    let empty = PercentileTimeSeries::empty(0);
    input
        .available_percentiles
        .iter()
        .map(|&p| {
            let found: Vec<&PercentileTimeSeries> = members
                .iter()
                .map(|id| match input.view.source_series(id, p) {
                    Some(s) => s,
                    None => {
                        warnings.push(format!("member '{}' has no P{} series", id, p));
                        &empty
                    }
                })
                .collect();
            match op {
                CombineOp::Sum => kernel::sum_series(p, found),
                CombineOp::Net => kernel::net_series(p, found),
            }
        })
        .collect()
}

fn scale(series: &mut [PercentileTimeSeries], factor: f64) {
    for point in series.iter_mut().flat_map(|s| s.points.iter_mut()) {
        point.value *= factor;
    }
}
