//! Two-tier metrics: foundational series, then analytical scalars.
use crate::audit::{AuditEntry, AuditOp, AuditTrail};
use crate::compute::kernel;
use crate::compute::ledger::{ComputationError, ComputedMetric, Ledger, LedgerView};
use crate::compute::references::References;
use crate::finance::{self, FinanceError};
use crate::settings::EngineSettings;
use crate::store::types::{
    CalculatorKind, CoverageAggregate, MetricDefinition, MetricFormat, PercentileTimeSeries, ThresholdRule,
    TimeSeriesPoint,
};
use crate::store::Registry;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Series(Vec<TimeSeriesPoint>),
    Object(serde_json::Value),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_series(&self) -> Option<&[TimeSeriesPoint]> {
        match self {
            MetricValue::Series(points) => Some(points),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub total: f64,
    pub count: usize,
}

impl SeriesStats {
    pub fn of(points: &[TimeSeriesPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let total: f64 = points.iter().map(|p| p.value).sum();
        Some(Self {
            min: points.iter().map(|p| p.value).fold(f64::INFINITY, f64::min),
            max: points.iter().map(|p| p.value).fold(f64::NEG_INFINITY, f64::max),
            mean: total / points.len() as f64,
            total,
            count: points.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdEvaluation {
    pub annotation: String,
    pub priority: i32,
    /// Position of the winning rule in the declared list.
    pub rule_index: usize,
}

/// One metric at one percentile. A failure leaves `value` empty and sets `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub value: Option<MetricValue>,
    pub formatted: Option<String>,
    pub error: Option<ComputationError>,
    pub stats: Option<SeriesStats>,
    pub threshold: Option<ThresholdEvaluation>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// What a calculator sees: earlier results at a single percentile.
pub struct MetricInput<'a> {
    pub metric_id: &'a str,
    pub percentile: u32,
    pub view: LedgerView<'a>,
    pub references: &'a References,
    pub settings: &'a EngineSettings,
}

impl<'a> MetricInput<'a> {
    pub fn source_series(&self, id: &str) -> Option<&'a PercentileTimeSeries> {
        self.view.source_series(id, self.percentile)
    }

    pub fn metric_value(&self, id: &str) -> Option<&'a MetricValue> { self.view.metric_value(id, self.percentile) }

    pub fn reference(&self, id: &str) -> Option<f64> { self.references.scalar(id) }

    /// A foundational metric series, or a source series, under `id`.
    pub fn series(&self, id: &str) -> Option<PercentileTimeSeries> {
        if let Some(points) = self.metric_value(id).and_then(MetricValue::as_series) {
            return Some(PercentileTimeSeries::new(self.percentile, points.to_vec()));
        }
        self.source_series(id).cloned()
    }
}

type Calculated = (MetricValue, BTreeMap<String, serde_json::Value>);

/// Built-in calculator dispatch. Custom calculators run behind `catch_unwind`.
pub fn calculate(def: &MetricDefinition, input: &MetricInput<'_>, registry: &Registry) -> Result<Calculated, ComputationError> {
    let mut meta = BTreeMap::new();
    let value = match &def.calculate {
        CalculatorKind::SumSources { sources } => MetricValue::Series(sum_available(input, sources, &mut meta)?.points),
        CalculatorKind::NetSources { plus, minus } => {
            let gains = sum_available(input, plus, &mut meta)?;
            let losses = sum_available(input, minus, &mut meta).unwrap_or_else(|_| PercentileTimeSeries::empty(input.percentile));
            MetricValue::Series(kernel::net_series(input.percentile, [&gains, &losses]).points)
        }
        CalculatorKind::Irr { cashflow } => {
            let outcome = finance::irr(&required_series(input, cashflow)?.points);
            meta.insert("iterations".into(), json!(outcome.iterations));
            if outcome.degenerate {
                meta.insert("warning".into(), json!("cash flows have no sign change, IRR reported as 0"));
            } else if !outcome.converged {
                return Err(calculation(FinanceError::NonConvergence {
                    iterations: outcome.iterations,
                    residual: outcome.residual,
                }));
            }
            if outcome.clamped {
                meta.insert("warning".into(), json!("IRR clamped to [-95%, 1000%]"));
            }
            MetricValue::Scalar(outcome.rate)
        }
        CalculatorKind::Npv { cashflow, rate } => {
            let r = input
                .reference(rate)
                .ok_or_else(|| ComputationError::DataUnavailable(format!("discount rate '{}' unavailable", rate)))?;
            meta.insert("rate".into(), json!(r));
            MetricValue::Scalar(finance::npv(&required_series(input, cashflow)?.points, r).map_err(calculation)?)
        }
        CalculatorKind::Payback { cashflow } => {
            let outcome = finance::payback_period(&required_series(input, cashflow)?.points, input.settings.project_life as f64);
            meta.insert("recovered".into(), json!(outcome.recovered));
            MetricValue::Scalar(outcome.years)
        }
        CalculatorKind::Coverage { cashflow, obligation, aggregate } => {
            let ratios = finance::coverage_ratios(
                &required_series(input, cashflow)?,
                &required_series(input, obligation)?,
                input.settings.first_operational_year,
            )
            .map_err(calculation)?;
            meta.insert("years".into(), json!(ratios.per_year.len()));
            MetricValue::Scalar(match aggregate {
                CoverageAggregate::Min => ratios.min,
                CoverageAggregate::Avg => ratios.avg,
            })
        }
        CalculatorKind::Total { input: id } => match input.metric_value(id) {
            Some(MetricValue::Scalar(v)) => MetricValue::Scalar(*v),
            _ => MetricValue::Scalar(required_series(input, id)?.total()),
        },
        CalculatorKind::Custom { name } => {
            let f = registry
                .functions
                .calculator(name)
                .ok_or_else(|| ComputationError::Calculation(format!("calculator '{}' not registered", name)))?;
            match catch_unwind(AssertUnwindSafe(|| f(input))) {
                Ok(Ok(value)) => value,
                Ok(Err(message)) => return Err(ComputationError::Calculation(message)),
                Err(_) => return Err(ComputationError::Panicked(name.clone())),
            }
        }
    };
    Ok((value, meta))
}

fn required_series(input: &MetricInput<'_>, id: &str) -> Result<PercentileTimeSeries, ComputationError> {
    input
        .series(id)
        .ok_or_else(|| ComputationError::DataUnavailable(format!("'{}' has no P{} series", id, input.percentile)))
}

fn calculation(e: FinanceError) -> ComputationError { ComputationError::Calculation(e.to_string()) }

/// Sums whichever inputs exist; missing ones are listed in metadata.
fn sum_available(
    input: &MetricInput<'_>,
    ids: &[String],
    meta: &mut BTreeMap<String, serde_json::Value>,
) -> Result<PercentileTimeSeries, ComputationError> {
    let found: Vec<PercentileTimeSeries> = ids.iter().filter_map(|id| input.series(id)).collect();
    let missing: Vec<&String> = ids.iter().filter(|id| input.series(id).is_none()).collect();
    if !missing.is_empty() {
        let entry = meta.entry("missing_inputs".to_string()).or_insert_with(|| json!([]));
        if let Some(list) = entry.as_array_mut() {
            list.extend(missing.iter().map(|m| json!(m)));
        }
    }
    if found.is_empty() && !ids.is_empty() {
        return Err(ComputationError::DataUnavailable(format!("none of {:?} available at P{}", ids, input.percentile)));
    }
    Ok(kernel::sum_series(input.percentile, found.iter()))
}

/// Highest priority matching rule wins; equal priorities keep the earlier rule.
pub fn evaluate_thresholds(rules: &[ThresholdRule], value: f64) -> Option<ThresholdEvaluation> {
    let mut best: Option<ThresholdEvaluation> = None;
    for (i, rule) in rules.iter().enumerate() {
        if !rule.predicate.matches(value) {
            continue;
        }
        if best.as_ref().map_or(true, |b| rule.priority > b.priority) {
            best = Some(ThresholdEvaluation { annotation: rule.annotation.clone(), priority: rule.priority, rule_index: i });
        }
    }
    best
}

pub fn format_value(value: &MetricValue, format: MetricFormat, currency: &str) -> Option<String> {
    let v = match value {
        MetricValue::Scalar(v) => *v,
        MetricValue::Series(points) => points.iter().map(|p| p.value).sum(),
        MetricValue::Object(_) => return None,
    };
    Some(match format {
        MetricFormat::Percent => format!("{:.2}%", v * 100.0),
        MetricFormat::Currency => format!("{} {:.2}", currency, v),
        MetricFormat::Ratio => format!("{:.2}x", v),
        MetricFormat::Years => format!("{:.1} years", v),
        MetricFormat::Number => format!("{:.2}", v),
    })
}

/// Shared inputs of the metric tiers.
pub(crate) struct MetricStage<'a> {
    pub registry: &'a Registry,
    pub settings: &'a EngineSettings,
    pub references: &'a References,
}

impl<'a> MetricStage<'a> {
    /// Evaluates `def` at every available percentile in parallel.
    pub fn compute(&self, def: &MetricDefinition, ledger: &Ledger) -> ComputedMetric {
        let view = LedgerView::new(self.registry, ledger);
        let evaluated: Vec<(u32, MetricResult, AuditTrail)> = self
            .settings
            .available_percentiles
            .par_iter()
            .map(|&p| {
                let (result, trail) = self.evaluate(def, p, view);
                (p, result, trail)
            })
            .collect();

        let mut results = BTreeMap::new();
        let mut audit_trail = AuditTrail::new();
        for (p, result, trail) in evaluated {
            results.insert(p, result);
            audit_trail.append(trail);
        }
        ComputedMetric { id: def.id.clone(), tier: def.tier, format: def.format, results, audit_trail }
    }

    fn evaluate(&self, def: &MetricDefinition, percentile: u32, view: LedgerView<'_>) -> (MetricResult, AuditTrail) {
        let started = Instant::now();
        let mut trail = AuditTrail::new();
        let input = MetricInput { metric_id: &def.id, percentile, view, references: self.references, settings: self.settings };
        let deps = &def.depends_on;
        let dependency_ids = deps.sources.iter().chain(&deps.metrics).chain(&deps.references).cloned();

        let outcome = calculate(def, &input, self.registry);
        let mut entry = AuditEntry::new(AuditOp::Calculate).at(percentile).depends_on(dependency_ids);

        let result = match outcome {
            Ok((value, metadata)) => {
                if let Some(points) = value.as_series() {
                    entry = entry.sample(points);
                }
                if metadata.contains_key("warning") || metadata.contains_key("missing_inputs") {
                    entry = entry.warn();
                }
                entry = entry.details(json!({ "calculator": def.calculate, "metadata": metadata }));
                MetricResult {
                    formatted: format_value(&value, def.format, &self.settings.currency),
                    stats: value.as_series().and_then(SeriesStats::of),
                    threshold: None,
                    error: None,
                    value: Some(value),
                    metadata,
                }
            }
            Err(error) => {
                warn!(metric = %def.id, percentile, %error, "metric has no value");
                entry = entry.details(json!({ "calculator": def.calculate, "error": error.to_string() })).error();
                MetricResult {
                    value: None,
                    formatted: None,
                    error: Some(error),
                    stats: None,
                    threshold: None,
                    metadata: BTreeMap::new(),
                }
            }
        };
        trail.push(entry.timed(started));

        let mut result = result;
        if let Some(v) = result.value.as_ref().and_then(MetricValue::as_scalar) {
            result.threshold = evaluate_thresholds(&def.thresholds, v);
            if let Some(t) = &result.threshold {
                trail.push(
                    AuditEntry::new(AuditOp::Threshold)
                        .at(percentile)
                        .details(json!({ "value": v, "annotation": t.annotation, "rule": t.rule_index })),
                );
            }
        }
        (result, trail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::ThresholdPredicate;
    use rstest::rstest;

    fn rule(predicate: ThresholdPredicate, priority: i32, annotation: &str) -> ThresholdRule {
        ThresholdRule { predicate, priority, annotation: annotation.into() }
    }

    #[test]
    fn test_highest_priority_match_wins() {
        let rules = vec![
            rule(ThresholdPredicate::Below(1.3), 1, "tight"),
            rule(ThresholdPredicate::Below(1.2), 5, "breach"),
            rule(ThresholdPredicate::Above(2.0), 9, "comfortable"),
        ];
        assert_eq!(evaluate_thresholds(&rules, 1.1).unwrap().annotation, "breach");
        assert_eq!(evaluate_thresholds(&rules, 1.25).unwrap().annotation, "tight");
        assert!(evaluate_thresholds(&rules, 1.5).is_none());
    }

    #[test]
    fn test_equal_priority_keeps_declaration_order() {
        let rules = vec![
            rule(ThresholdPredicate::AtLeast(0.0), 3, "first"),
            rule(ThresholdPredicate::AtLeast(0.0), 3, "second"),
        ];
        let eval = evaluate_thresholds(&rules, 1.0).unwrap();
        assert_eq!((eval.annotation.as_str(), eval.rule_index), ("first", 0));
    }

    #[rstest]
    #[case(MetricFormat::Percent, 0.0812, "8.12%")]
    #[case(MetricFormat::Ratio, 1.3456, "1.35x")]
    #[case(MetricFormat::Years, 7.26, "7.3 years")]
    #[case(MetricFormat::Currency, 1500.0, "EUR 1500.00")]
    #[case(MetricFormat::Number, 2.0, "2.00")]
    fn test_formatting(#[case] format: MetricFormat, #[case] value: f64, #[case] expected: &str) {
        assert_eq!(format_value(&MetricValue::Scalar(value), format, "EUR").as_deref(), Some(expected));
    }

    #[test]
    fn test_series_stats() {
        let points = vec![TimeSeriesPoint::new(1, 2.0), TimeSeriesPoint::new(2, -1.0), TimeSeriesPoint::new(3, 5.0)];
        let stats = SeriesStats::of(&points).unwrap();
        assert_eq!((stats.min, stats.max, stats.total, stats.count), (-1.0, 5.0, 6.0, 3));
        assert_eq!(stats.mean, 2.0);
        assert!(SeriesStats::of(&[]).is_none());
    }
}
