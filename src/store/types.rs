use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dense index of a source or metric inside the loaded registry.
/// Sources occupy `0..sources.len()`, metrics follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl EntityId {
    #[inline(always)]
    pub fn index(&self) -> usize { self.0 as usize }
    pub fn new(idx: usize) -> Self { Self(idx as u32) }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub year: u32,
    pub value: f64,
}

impl TimeSeriesPoint {
    pub fn new(year: u32, value: f64) -> Self { Self { year, value } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileTimeSeries {
    pub percentile: u32,
    pub points: Vec<TimeSeriesPoint>,
}

impl PercentileTimeSeries {
    pub fn new(percentile: u32, mut points: Vec<TimeSeriesPoint>) -> Self {
        points.sort_by_key(|p| p.year);
        points.dedup_by_key(|p| p.year);
        Self { percentile, points }
    }

    pub fn empty(percentile: u32) -> Self { Self { percentile, points: Vec::new() } }

    pub fn is_empty(&self) -> bool { self.points.is_empty() }

    /// Binary search on the ascending year invariant.
    pub fn value_at(&self, year: u32) -> Option<f64> {
        self.points
            .binary_search_by_key(&year, |p| p.year)
            .ok()
            .map(|i| self.points[i].value)
    }

    pub fn total(&self) -> f64 { self.points.iter().map(|p| p.value).sum() }
}

/// A value handed out by the external `resolvePath` accessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Scalar(f64),
    Series(Vec<TimeSeriesPoint>),
    Percentiles(Vec<PercentileTimeSeries>),
    Object(serde_json::Value),
}

impl DataValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            DataValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn has_percentiles(&self) -> bool { matches!(self, DataValue::Percentiles(_)) }

    /// Converts loosely-typed JSON into the narrowest matching variant.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Number(n) => n.as_f64().map(DataValue::Scalar),
            other => Some(serde_json::from_value(other.clone()).unwrap_or(DataValue::Object(other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Direct,
    Indirect,
    Virtual,
}

impl SourceKind {
    /// Wave rank: direct sources first, virtual last.
    pub fn rank(&self) -> u8 {
        match self {
            SourceKind::Direct => 0,
            SourceKind::Indirect => 1,
            SourceKind::Virtual => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDef {
    pub id: String,
    pub path: Vec<String>,
}

impl ReferenceDef {
    pub fn new(id: &str, path: &[&str]) -> Self {
        Self { id: id.to_string(), path: path.iter().map(|s| s.to_string()).collect() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiplierOp {
    Multiply,
    Compound,
    Simple,
    Summation,
}

/// Selects the already-computed sources aggregated by a `summation` multiplier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFilter {
    Category(String),
    Ids(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplierDef {
    pub operand_id: String,
    pub operation: MultiplierOp,
    #[serde(default)]
    pub base_year: u32,
    #[serde(default)]
    pub filter: Option<SourceFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineOp {
    /// Sum of all members.
    Sum,
    /// First member minus the rest.
    Net,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformerKind {
    PerTurbine,
    ScaleByReference { reference: String },
    Combine { sources: Vec<String>, op: CombineOp },
    Custom { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub unit: Option<String>,
    pub kind: SourceKind,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub path: Option<Vec<String>>,
    #[serde(default)]
    pub references: Vec<ReferenceDef>,
    #[serde(default)]
    pub transformer: Option<TransformerKind>,
    #[serde(default)]
    pub multipliers: Vec<MultiplierDef>,
}

impl SourceDefinition {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricTier {
    Foundational,
    Analytical,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependsOn {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageAggregate {
    Min,
    Avg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalculatorKind {
    SumSources { sources: Vec<String> },
    NetSources { plus: Vec<String>, minus: Vec<String> },
    Irr { cashflow: String },
    Npv { cashflow: String, rate: String },
    Payback { cashflow: String },
    Coverage { cashflow: String, obligation: String, aggregate: CoverageAggregate },
    Total { input: String },
    Custom { name: String },
}

impl CalculatorKind {
    /// Ids this calculator reads; each must be declared in `dependsOn`.
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            CalculatorKind::SumSources { sources } => sources.iter().map(String::as_str).collect(),
            CalculatorKind::NetSources { plus, minus } => {
                plus.iter().chain(minus.iter()).map(String::as_str).collect()
            }
            CalculatorKind::Irr { cashflow } | CalculatorKind::Payback { cashflow } => vec![cashflow],
            CalculatorKind::Npv { cashflow, rate } => vec![cashflow, rate],
            CalculatorKind::Coverage { cashflow, obligation, .. } => vec![cashflow, obligation],
            CalculatorKind::Total { input } => vec![input],
            CalculatorKind::Custom { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFormat {
    Percent,
    Currency,
    Ratio,
    Years,
    #[default]
    Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdPredicate {
    Below(f64),
    AtMost(f64),
    Above(f64),
    AtLeast(f64),
    Between { min: f64, max: f64 },
}

impl ThresholdPredicate {
    pub fn matches(&self, value: f64) -> bool {
        match *self {
            ThresholdPredicate::Below(t) => value < t,
            ThresholdPredicate::AtMost(t) => value <= t,
            ThresholdPredicate::Above(t) => value > t,
            ThresholdPredicate::AtLeast(t) => value >= t,
            ThresholdPredicate::Between { min, max } => value >= min && value <= max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub predicate: ThresholdPredicate,
    #[serde(default)]
    pub priority: i32,
    pub annotation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub tier: MetricTier,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: DependsOn,
    pub calculate: CalculatorKind,
    #[serde(default)]
    pub thresholds: Vec<ThresholdRule>,
    #[serde(default)]
    pub usage: Vec<String>,
    #[serde(default)]
    pub format: MetricFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionStrategy {
    Unified,
    PerSource,
}

/// The user's percentile choice. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileSelection {
    pub strategy: SelectionStrategy,
    #[serde(default)]
    pub unified: Option<u32>,
    #[serde(default)]
    pub per_source: BTreeMap<String, u32>,
}

impl PercentileSelection {
    pub fn unified(p: u32) -> Self {
        Self { strategy: SelectionStrategy::Unified, unified: Some(p), per_source: BTreeMap::new() }
    }

    pub fn per_source(map: BTreeMap<String, u32>) -> Self {
        Self { strategy: SelectionStrategy::PerSource, unified: None, per_source: map }
    }

    /// Picks the percentile applying to `entity_id`, falling back to `primary`.
    pub fn resolve(&self, entity_id: &str, primary: u32) -> u32 {
        match self.strategy {
            SelectionStrategy::Unified => self.unified.unwrap_or(primary),
            SelectionStrategy::PerSource => self.per_source.get(entity_id).copied().unwrap_or(primary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_sorted_and_deduplicated() {
        let s = PercentileTimeSeries::new(50, vec![
            TimeSeriesPoint::new(3, 3.0),
            TimeSeriesPoint::new(1, 1.0),
            TimeSeriesPoint::new(1, 9.0),
        ]);
        assert_eq!(s.points.iter().map(|p| p.year).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(s.value_at(3), Some(3.0));
        assert_eq!(s.value_at(2), None);
    }

    #[test]
    fn test_data_value_from_json() {
        assert_eq!(DataValue::from_json(serde_json::json!(2.5)), Some(DataValue::Scalar(2.5)));
        assert_eq!(DataValue::from_json(serde_json::Value::Null), None);
        let series = DataValue::from_json(serde_json::json!([{"year": 1, "value": 4.0}])).unwrap();
        assert_eq!(series, DataValue::Series(vec![TimeSeriesPoint::new(1, 4.0)]));
        let pct = DataValue::from_json(serde_json::json!([
            {"percentile": 50, "points": [{"year": 1, "value": 4.0}]}
        ])).unwrap();
        assert!(pct.has_percentiles());
        let obj = DataValue::from_json(serde_json::json!({"a": 1})).unwrap();
        assert!(matches!(obj, DataValue::Object(_)));
    }

    #[test]
    fn test_selection_resolution() {
        let unified = PercentileSelection::unified(90);
        assert_eq!(unified.resolve("anything", 50), 90);

        let mut map = BTreeMap::new();
        map.insert("energy".to_string(), 10);
        let per = PercentileSelection::per_source(map);
        assert_eq!(per.resolve("energy", 50), 10);
        assert_eq!(per.resolve("opex", 50), 50);
    }

    #[test]
    fn test_threshold_predicates() {
        assert!(ThresholdPredicate::Below(1.2).matches(1.1));
        assert!(!ThresholdPredicate::Below(1.2).matches(1.2));
        assert!(ThresholdPredicate::AtMost(1.2).matches(1.2));
        assert!(ThresholdPredicate::Between { min: 1.0, max: 2.0 }.matches(2.0));
    }
}
