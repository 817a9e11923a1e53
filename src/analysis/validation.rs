//! Structural rules applied to registry entries before anything is computed.
use crate::store::functions::FunctionTable;
use crate::store::types::{
    CalculatorKind, MetricDefinition, MetricTier, MultiplierOp, SourceDefinition, SourceKind,
    ThresholdPredicate, TransformerKind,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Duplicate id '{id}' in registry")]
    DuplicateId { id: String },
    #[error("Source '{source_id}' of kind {kind:?} requires a path")]
    MissingPath { source_id: String, kind: SourceKind },
    #[error("Virtual source '{source_id}' must not declare a path")]
    ForbiddenPath { source_id: String },
    #[error("Direct source '{source_id}' must not declare multipliers")]
    ForbiddenMultipliers { source_id: String },
    #[error("Indirect source '{source_id}' requires at least one multiplier")]
    MissingMultipliers { source_id: String },
    #[error("Virtual source '{source_id}' requires a transformer")]
    MissingTransformer { source_id: String },
    #[error("Summation multiplier on '{source_id}' has no source filter")]
    MissingFilter { source_id: String },
    #[error("'{entity}' refers to unknown function '{name}'")]
    UnknownFunction { entity: String, name: String },
    #[error("'{entity}' depends on unknown {kind} '{dependency}'")]
    UnresolvedDependency { entity: String, kind: &'static str, dependency: String },
    #[error("Foundational metric '{metric}' must not depend on metric '{dependency}'")]
    FoundationalMetricDependency { metric: String, dependency: String },
    #[error("Metric '{metric}' reads '{input}' which is not declared in dependsOn")]
    UndeclaredInput { metric: String, input: String },
    #[error("Source '{source_id}' consumes '{dependency}' which is not computed in an earlier wave")]
    OrderingViolation { source_id: String, dependency: String },
    #[error("Cyclic metric dependency among {members:?}")]
    CyclicDependency { members: Vec<String> },
    #[error("Invalid threshold on '{metric}': {message}")]
    InvalidThreshold { metric: String, message: String },
    #[error("Malformed registry document: {0}")]
    Malformed(String),
    #[error("{} configuration errors: {}", .0.len(), join_messages(.0))]
    Multiple(Vec<ConfigurationError>),
}

fn join_messages(errors: &[ConfigurationError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl ConfigurationError {
    /// Collapses a batch of findings into a single error, or `Ok` when empty.
    pub fn from_batch(mut errors: Vec<ConfigurationError>) -> Result<(), ConfigurationError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigurationError::Multiple(errors)),
        }
    }
}

/// Field-presence rules per source kind, plus function-table lookups.
pub(crate) fn check_source(def: &SourceDefinition, functions: &FunctionTable) -> Vec<ConfigurationError> {
    let mut errors = Vec::new();
    let id = || def.id.clone();

    match def.kind {
        SourceKind::Direct => {
            if def.path.is_none() {
                errors.push(ConfigurationError::MissingPath { source_id: id(), kind: def.kind });
            }
            if !def.multipliers.is_empty() {
                errors.push(ConfigurationError::ForbiddenMultipliers { source_id: id() });
            }
        }
        SourceKind::Indirect => {
            if def.path.is_none() {
                errors.push(ConfigurationError::MissingPath { source_id: id(), kind: def.kind });
            }
            if def.multipliers.is_empty() {
                errors.push(ConfigurationError::MissingMultipliers { source_id: id() });
            }
        }
        SourceKind::Virtual => {
            if def.path.is_some() {
                errors.push(ConfigurationError::ForbiddenPath { source_id: id() });
            }
            if def.transformer.is_none() {
                errors.push(ConfigurationError::MissingTransformer { source_id: id() });
            }
        }
    }

    if let Some(TransformerKind::Custom { name }) = &def.transformer {
        if functions.transformer(name).is_none() {
            errors.push(ConfigurationError::UnknownFunction { entity: id(), name: name.clone() });
        }
    }

    for m in &def.multipliers {
        if m.operation == MultiplierOp::Summation && m.filter.is_none() {
            errors.push(ConfigurationError::MissingFilter { source_id: id() });
        }
    }
    errors
}

/// Tier rules, declared inputs and threshold sanity for one metric.
pub(crate) fn check_metric(def: &MetricDefinition, functions: &FunctionTable) -> Vec<ConfigurationError> {
    let mut errors = Vec::new();

    if def.tier == MetricTier::Foundational {
        for dep in &def.depends_on.metrics {
            errors.push(ConfigurationError::FoundationalMetricDependency {
                metric: def.id.clone(),
                dependency: dep.clone(),
            });
        }
    }

    if let CalculatorKind::Custom { name } = &def.calculate {
        if functions.calculator(name).is_none() {
            errors.push(ConfigurationError::UnknownFunction { entity: def.id.clone(), name: name.clone() });
        }
    }

    let declared = |input: &str| {
        def.depends_on.sources.iter().any(|s| s == input)
            || def.depends_on.metrics.iter().any(|m| m == input)
            || def.depends_on.references.iter().any(|r| r == input)
    };
    for input in def.calculate.inputs() {
        if !declared(input) {
            errors.push(ConfigurationError::UndeclaredInput { metric: def.id.clone(), input: input.to_string() });
        }
    }

    for rule in &def.thresholds {
        if let ThresholdPredicate::Between { min, max } = rule.predicate {
            if min > max {
                errors.push(ConfigurationError::InvalidThreshold {
                    metric: def.id.clone(),
                    message: format!("range [{}, {}] is empty", min, max),
                });
            }
        }
    }
    errors
}
