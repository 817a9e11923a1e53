//! Source pipeline: references, fetch, transform, then the multiplier chain.
use crate::audit::{AuditEntry, AuditOp, AuditTrail};
use crate::compute::kernel::{self, Operand};
use crate::compute::ledger::{ComputationError, ComputedSource, Ledger, LedgerView, SourceMetadata};
use crate::compute::references::{resolve_references, PathResolver, References};
use crate::compute::transform::{run_transformer, TransformInput};
use crate::settings::EngineSettings;
use crate::store::types::{DataValue, MultiplierDef, MultiplierOp, PercentileTimeSeries, SourceDefinition, SourceFilter};
use crate::store::Registry;
use rayon::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

/// Shared, read-only inputs of one recompute's source waves.
pub(crate) struct SourceStage<'a> {
    pub registry: &'a Registry,
    pub settings: &'a EngineSettings,
    pub resolver: &'a dyn PathResolver,
    pub globals: &'a References,
}

impl<'a> SourceStage<'a> {
    /// Computes one source against the sources already in `ledger`.
    ///
    /// Never fails: a source that cannot be produced comes back with an empty
    /// series per percentile and its error recorded.
    pub fn compute(&self, def: &SourceDefinition, ledger: &Ledger) -> ComputedSource {
        let started = Instant::now();
        let mut trail = AuditTrail::new();
        let view = LedgerView::new(self.registry, ledger);

        // 1. References (local over global)
        let references = self.globals.merged_with(resolve_references(&def.references, self.resolver));
        let unresolved: Vec<&str> = references.unresolved().collect();
        let mut entry = AuditEntry::new(AuditOp::ResolveReferences)
            .details(json!({ "resolved": references.ids().count() - unresolved.len(), "unresolved": unresolved }))
            .depends_on(def.references.iter().map(|r| r.id.clone()));
        if !unresolved.is_empty() {
            debug!(source = %def.id, ?unresolved, "references unresolved");
            entry = entry.warn();
        }
        trail.push(entry);

        // 2. Fetch
        let raw = def.path.as_ref().and_then(|path| {
            let value = self.resolver.resolve_path(path);
            let mut entry = AuditEntry::new(AuditOp::Fetch).details(json!({ "path": path, "found": value.is_some() }));
            if value.is_none() {
                warn!(source = %def.id, path = %path.join("."), "path does not resolve");
                entry = entry.warn();
            }
            trail.push(entry);
            value
        });

        let metadata = SourceMetadata {
            name: def.display_name().to_string(),
            category: def.category.clone(),
            kind: def.kind,
            priority: def.priority,
            unit: def.unit.clone(),
            currency: self.settings.currency.clone(),
            has_percentiles: raw.as_ref().map_or(false, DataValue::has_percentiles),
        };

        // 3. Transform
        let input = TransformInput {
            source_id: &def.id,
            raw: raw.as_ref(),
            has_percentiles: metadata.has_percentiles,
            available_percentiles: &self.settings.available_percentiles,
            primary_percentile: self.settings.primary_percentile,
            references: &references,
            view,
            settings: self.settings,
        };
        let op = if def.transformer.is_some() { AuditOp::Transform } else { AuditOp::Expand };
        let transform_started = Instant::now();
        let transformed = match run_transformer(def.transformer.as_ref(), &input, &self.registry.functions) {
            Ok(t) => t,
            Err(error) => {
                warn!(source = %def.id, %error, "source left empty");
                let entry = AuditEntry::new(op).details(json!({ "error": error.to_string() })).timed(transform_started);
                trail.push(match error {
                    ComputationError::DataUnavailable(_) => entry.warn(),
                    _ => entry.error(),
                });
                return self.failed(def, metadata, trail, error);
            }
        };
        let primary = transformed.series.iter().find(|s| s.percentile == self.settings.primary_percentile);
        let mut entry = AuditEntry::new(op)
            .details(json!({ "transformer": def.transformer, "warnings": transformed.warnings }))
            .depends_on(transformed.consulted.iter().cloned())
            .sample(primary.map_or(&[][..], |s| &s.points[..]))
            .timed(transform_started);
        if !transformed.warnings.is_empty() {
            entry = entry.warn();
        }
        trail.push(entry);

        // 4. Multipliers, one chain per percentile
        let chains: Vec<(PercentileTimeSeries, AuditTrail)> = transformed
            .series
            .into_par_iter()
            .map(|series| self.apply_chain(def, series, &references, view))
            .collect();

        let mut series = BTreeMap::new();
        for (s, chain_trail) in chains {
            trail.append(chain_trail);
            series.insert(s.percentile, s);
        }
        debug!(source = %def.id, elapsed_ms = started.elapsed().as_secs_f64() * 1000.0, "source computed");

        ComputedSource { id: def.id.clone(), series, metadata, audit_trail: trail, error: None }
    }

    fn apply_chain(
        &self,
        def: &SourceDefinition,
        mut series: PercentileTimeSeries,
        references: &References,
        view: LedgerView<'_>,
    ) -> (PercentileTimeSeries, AuditTrail) {
        let mut trail = AuditTrail::new();
        let p = series.percentile;

        for (index, m) in def.multipliers.iter().enumerate() {
            let started = Instant::now();
            let mut details = json!({ "index": index, "operation": m.operation, "base_year": m.base_year });
            let mut entry = AuditEntry::new(AuditOp::Multiply).at(p);

            if m.operation == MultiplierOp::Summation {
                let members = self.summation_members(def, m);
                let found: Vec<&PercentileTimeSeries> =
                    members.iter().filter_map(|id| view.source_series(id, p)).collect();
                if found.len() < members.len() {
                    entry = entry.warn();
                }
                details["members"] = json!(members);
                details["found"] = json!(found.len());
                series = kernel::sum_series(p, found);
                entry = entry.depends_on(members);
            } else {
                let owned;
                let operand = match self.operand(&m.operand_id, p, references, view) {
                    Some(OperandValue::Scalar(v)) => Some(Operand::Scalar(v)),
                    Some(OperandValue::Borrowed(s)) => Some(Operand::Series(s)),
                    Some(OperandValue::Owned(s)) => {
                        owned = s;
                        Some(Operand::Series(&owned))
                    }
                    None => None,
                };
                match operand {
                    Some(operand) => {
                        let skipped = kernel::apply_multiplier(&mut series, m.operation, operand, m.base_year);
                        if !skipped.is_empty() {
                            entry = entry.warn();
                            details["skipped_years"] = json!(skipped);
                        }
                    }
                    None => {
                        warn!(source = %def.id, operand = %m.operand_id, percentile = p, "operand unavailable, no adjustment");
                        details["unavailable"] = json!(true);
                        entry = entry.warn();
                    }
                }
                details["operand"] = json!(m.operand_id);
                entry = entry.depends_on([m.operand_id.clone()]);
            }

            trail.push(entry.details(details).sample(&series.points).timed(started));
        }
        (series, trail)
    }

    /// Already computed sources selected by a summation filter, excluding `def` itself.
    fn summation_members(&self, def: &SourceDefinition, m: &MultiplierDef) -> Vec<String> {
        match &m.filter {
            Some(SourceFilter::Category(category)) => self
                .registry
                .sources
                .iter()
                .filter(|s| &s.category == category && s.id != def.id)
                .map(|s| s.id.clone())
                .collect(),
            Some(SourceFilter::Ids(ids)) => ids.iter().filter(|id| **id != def.id).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Operand at the same percentile as the series it adjusts.
    fn operand<'v>(
        &self,
        id: &str,
        percentile: u32,
        references: &References,
        view: LedgerView<'v>,
    ) -> Option<OperandValue<'v>> {
        if self.registry.is_source_id(id) {
            return view.source_series(id, percentile).map(OperandValue::Borrowed);
        }
        match references.get(id)? {
            DataValue::Scalar(v) => Some(OperandValue::Scalar(*v)),
            DataValue::Series(points) => Some(OperandValue::Owned(PercentileTimeSeries::new(percentile, points.clone()))),
            DataValue::Percentiles(list) => list
                .iter()
                .find(|s| s.percentile == percentile)
                .map(|s| OperandValue::Owned(PercentileTimeSeries::new(percentile, s.points.clone()))),
            DataValue::Object(_) => None,
        }
    }

    fn failed(&self, def: &SourceDefinition, metadata: SourceMetadata, trail: AuditTrail, error: ComputationError) -> ComputedSource {
        let series = self
            .settings
            .available_percentiles
            .iter()
            .map(|&p| (p, PercentileTimeSeries::empty(p)))
            .collect();
        ComputedSource { id: def.id.clone(), series, metadata, audit_trail: trail, error: Some(error) }
    }
}

enum OperandValue<'v> {
    Scalar(f64),
    Borrowed(&'v PercentileTimeSeries),
    Owned(PercentileTimeSeries),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLevel;
    use crate::store::test_support::{direct, indirect};
    use crate::store::types::ReferenceDef;
    use crate::store::{EntityId, FunctionTable, RegistryDocument};
    use serde_json::Value;

    fn run(doc: RegistryDocument, data: &Value, settings: &EngineSettings) -> Ledger {
        let registry = Registry::load(doc, FunctionTable::new()).unwrap();
        let globals = resolve_references(&registry.global_references, data);
        let stage = SourceStage { registry: &registry, settings, resolver: data, globals: &globals };
        let mut ledger = Ledger::new(&registry);
        for wave in registry.source_waves() {
            let done: Vec<(EntityId, ComputedSource)> =
                wave.iter().map(|&id| (id, stage.compute(registry.source(id).unwrap(), &ledger))).collect();
            for (id, c) in done {
                ledger.insert_source(id, c);
            }
        }
        ledger
    }

    fn settings() -> EngineSettings { EngineSettings::new(vec![50, 90], 50, 3) }

    #[test]
    fn test_indirect_source_escalates_by_reference() {
        let mut opex = indirect("opex", &["opex"], "escalation", 0);
        opex.multipliers[0].operation = MultiplierOp::Compound;
        opex.multipliers[0].base_year = 1;
        let doc = RegistryDocument {
            global_references: vec![ReferenceDef::new("escalation", &["esc"])],
            sources: vec![opex],
            ..Default::default()
        };
        let data = serde_json::json!({"opex": 100.0, "esc": 0.1});
        let ledger = run(doc, &data, &settings());

        let opex = ledger.source(EntityId(0)).unwrap();
        let p90 = opex.at(90).unwrap();
        assert!((p90.value_at(3).unwrap() - 121.0).abs() < 1e-9);
        assert_eq!(p90.value_at(1), Some(100.0));
        assert!(opex.error.is_none());
        assert_eq!(opex.audit_trail.get_references(), vec!["escalation"]);
    }

    #[test]
    fn test_operand_source_uses_same_percentile() {
        let doc = RegistryDocument {
            sources: vec![direct("availability", &["avail"], 0), indirect("energy", &["energy"], "availability", 0)],
            ..Default::default()
        };
        let data = serde_json::json!({
            "energy": 10.0,
            "avail": [
                {"percentile": 50, "points": [{"year": 1, "value": 0.9}]},
                {"percentile": 90, "points": [{"year": 1, "value": 0.5}]}
            ]
        });
        let ledger = run(doc, &data, &settings());
        let energy = ledger.source(EntityId(1)).unwrap();
        assert_eq!(energy.at(50).unwrap().value_at(1), Some(9.0));
        assert_eq!(energy.at(90).unwrap().value_at(1), Some(5.0));
        // Years 2 and 3 have no availability value and stay unadjusted.
        assert_eq!(energy.at(90).unwrap().value_at(2), Some(10.0));
        assert_eq!(energy.audit_trail.worst_level(), Some(AuditLevel::Warning));
    }

    #[test]
    fn test_unresolved_path_degrades_to_empty_series() {
        let doc = RegistryDocument {
            sources: vec![direct("missing", &["nowhere"], 0), direct("energy", &["energy"], 0)],
            ..Default::default()
        };
        let data = serde_json::json!({"energy": 1.0});
        let ledger = run(doc, &data, &settings());

        let missing = ledger.source(EntityId(0)).unwrap();
        assert!(matches!(missing.error, Some(ComputationError::DataUnavailable(_))));
        assert!(missing.series.values().all(|s| s.is_empty()));
        assert_eq!(missing.audit_trail.worst_level(), Some(AuditLevel::Warning));

        let energy = ledger.source(EntityId(1)).unwrap();
        assert_eq!(energy.at(50).unwrap().total(), 3.0);
    }

    #[test]
    fn test_summation_by_category_excludes_self() {
        let mut turbines = direct("turbines", &["t"], 0);
        turbines.category = "capex".into();
        let mut bop = direct("bop", &["b"], 0);
        bop.category = "capex".into();
        let mut total = indirect("capex_total", &["t"], "unused", 0);
        total.category = "capex".into();
        total.multipliers = vec![MultiplierDef {
            operand_id: String::new(),
            operation: MultiplierOp::Summation,
            base_year: 0,
            filter: Some(SourceFilter::Category("capex".into())),
        }];
        let doc = RegistryDocument { sources: vec![turbines, bop, total], ..Default::default() };
        let data = serde_json::json!({"t": 5.0, "b": 2.0});
        let ledger = run(doc, &data, &settings());

        let total = ledger.source(EntityId(2)).unwrap();
        assert_eq!(total.at(50).unwrap().value_at(2), Some(7.0));
        assert_eq!(total.audit_trail.get_references(), vec!["turbines", "bop"]);
    }
}
