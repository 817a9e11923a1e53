//! Registry builders shared by unit tests.
use super::functions::FunctionTable;
use super::registry::{Registry, RegistryDocument};
use super::types::*;
use crate::analysis::validation::ConfigurationError;
use crate::compute::metrics::MetricValue;

fn strings(items: &[&str]) -> Vec<String> { items.iter().map(|s| s.to_string()).collect() }

pub fn direct(id: &str, path: &[&str], priority: i32) -> SourceDefinition {
    SourceDefinition {
        id: id.into(),
        name: String::new(),
        category: String::new(),
        unit: None,
        kind: SourceKind::Direct,
        priority,
        path: Some(strings(path)),
        references: vec![],
        transformer: None,
        multipliers: vec![],
    }
}

pub fn multiply_by(operand: &str) -> MultiplierDef {
    MultiplierDef { operand_id: operand.into(), operation: MultiplierOp::Multiply, base_year: 0, filter: None }
}

pub fn indirect(id: &str, path: &[&str], operand: &str, priority: i32) -> SourceDefinition {
    SourceDefinition {
        kind: SourceKind::Indirect,
        multipliers: vec![multiply_by(operand)],
        ..direct(id, path, priority)
    }
}

pub fn virtual_sum(id: &str, members: &[&str], priority: i32) -> SourceDefinition {
    SourceDefinition {
        kind: SourceKind::Virtual,
        path: None,
        transformer: Some(TransformerKind::Combine { sources: strings(members), op: CombineOp::Sum }),
        ..direct(id, &[], priority)
    }
}

pub fn foundational(id: &str, sources: &[&str]) -> MetricDefinition {
    MetricDefinition {
        id: id.into(),
        name: String::new(),
        tier: MetricTier::Foundational,
        priority: 0,
        depends_on: DependsOn { sources: strings(sources), ..Default::default() },
        calculate: CalculatorKind::SumSources { sources: strings(sources) },
        thresholds: vec![],
        usage: vec![],
        format: MetricFormat::Number,
    }
}

pub fn analytical(id: &str, metrics: &[&str], priority: i32) -> MetricDefinition {
    MetricDefinition {
        tier: MetricTier::Analytical,
        priority,
        depends_on: DependsOn { metrics: strings(metrics), ..Default::default() },
        calculate: CalculatorKind::Custom { name: "noop".into() },
        ..foundational(id, &[])
    }
}

pub fn noop_functions() -> FunctionTable {
    let mut table = FunctionTable::new();
    table.register_calculator("noop", |_| Ok(MetricValue::Scalar(0.0)));
    table
}

pub fn registry_with(metrics: Vec<MetricDefinition>) -> Result<Registry, ConfigurationError> {
    Registry::load(RegistryDocument { metrics, ..Default::default() }, noop_functions())
}
