use crate::compute::ledger::Ledger;
use crate::compute::metrics::MetricValue;
use crate::store::{EntityId, Registry};
use std::collections::HashMap;
use std::fmt::Write;

/// Renders the dependency tree behind `target` at one percentile.
///
/// Walks an explicit stack over entity ids. An entity reached a second time is
/// printed once more as a back-reference instead of being expanded again.
pub fn format_trace(registry: &Registry, ledger: &Ledger, target: EntityId, percentile: u32) -> String {
    let mut output = String::new();
    if target.index() >= registry.count() {
        let _ = writeln!(output, "Error: Invalid entity id {:?}", target);
        return output;
    }

    let _ = writeln!(output, "AUDIT TRACE for '{}' at P{}:", registry.entity_name(target), percentile);
    let _ = writeln!(output, "--------------------------------------------------");

    let tracer = Tracer { registry, ledger, percentile };
    let mut visited_at_level: HashMap<EntityId, usize> = HashMap::new();
    let mut stack = vec![Frame { id: target, level: 1, prefix: String::new() }];

    while let Some(Frame { id, level, prefix }) = stack.pop() {
        let name = registry.entity_name(id);
        if let Some(&first) = visited_at_level.get(&id) {
            let _ = writeln!(output, "{}{} (see above, L{})", prefix, name, first);
            continue;
        }
        visited_at_level.insert(id, level);
        let _ = writeln!(output, "{}[L{}] {} {}", prefix, level, name, tracer.describe(id));

        let stem = child_stem(&prefix);
        let parents = registry.get_parents(id);
        let references = tracer.external_references(id);
        let total = parents.len() + references.len();

        // Non-entity references are leaves; print them before descending.
        for (i, reference) in references.iter().enumerate() {
            let connector = if i + 1 == total { "`--" } else { "|--" };
            let _ = writeln!(output, "{}{} ref {}", stem, connector, reference);
        }

        // Reverse push so the first parent is printed first.
        for (i, &parent) in parents.iter().enumerate().rev() {
            let connector = if references.len() + i + 1 == total { "`--" } else { "|--" };
            stack.push(Frame { id: parent, level: level + 1, prefix: format!("{}{}", stem, connector) });
        }
    }
    output
}

struct Frame {
    id: EntityId,
    level: usize,
    prefix: String,
}

struct Tracer<'a> {
    registry: &'a Registry,
    ledger: &'a Ledger,
    percentile: u32,
}

impl<'a> Tracer<'a> {
    fn describe(&self, id: EntityId) -> String {
        if let Some(source) = self.ledger.source(id) {
            let kind = format!("({:?})", source.metadata.kind).to_lowercase();
            if let Some(error) = &source.error {
                return format!("{} [Err: {}]", kind, error);
            }
            return match source.at(self.percentile) {
                Some(s) if !s.is_empty() => format!("{} [total={:.3}, years={}]", kind, s.total(), s.points.len()),
                Some(_) => format!("{} [empty]", kind),
                None => format!("{} [?]", kind),
            };
        }
        if let Some(metric) = self.ledger.metric(id) {
            let tier = format!("({:?})", metric.tier).to_lowercase();
            return match metric.at(self.percentile) {
                Some(r) => match (&r.value, &r.error) {
                    (_, Some(error)) => format!("{} [Err: {}]", tier, error),
                    (Some(MetricValue::Scalar(v)), _) => match &r.threshold {
                        Some(t) => format!("{} [{:.4}] <{}>", tier, v, t.annotation),
                        None => format!("{} [{:.4}]", tier, v),
                    },
                    (Some(MetricValue::Series(points)), _) => match points.first() {
                        Some(p) => format!("{} [{:.3}, ...]", tier, p.value),
                        None => format!("{} [empty]", tier),
                    },
                    (Some(MetricValue::Object(v)), _) => format!("{} {}", tier, v),
                    (None, None) => format!("{} [?]", tier),
                },
                None => format!("{} [?]", tier),
            };
        }
        "[not computed]".to_string()
    }

    /// References consulted in the audit trail that are not registry entities.
    fn external_references(&self, id: EntityId) -> Vec<String> {
        let trail = match (self.ledger.source(id), self.ledger.metric(id)) {
            (Some(s), _) => &s.audit_trail,
            (None, Some(m)) => &m.audit_trail,
            _ => return Vec::new(),
        };
        trail
            .get_references()
            .into_iter()
            .filter(|r| self.registry.id_of(r).is_none())
            .map(str::to_string)
            .collect()
    }
}

fn child_stem(prefix: &str) -> String { prefix.replace("`--", "   ").replace("|--", "|  ") }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::ledger::ResultStore;
    use crate::compute::references::resolve_references;
    use crate::compute::sources::SourceStage;
    use crate::settings::EngineSettings;
    use crate::store::test_support::{direct, indirect, virtual_sum};
    use crate::store::types::ReferenceDef;
    use crate::store::{FunctionTable, RegistryDocument};

    #[test]
    fn test_trace_shows_shared_dependency_once() {
        let doc = RegistryDocument {
            global_references: vec![ReferenceDef::new("esc", &["esc"])],
            sources: vec![
                direct("energy", &["energy"], 0),
                indirect("opex", &["opex"], "esc", 0),
                virtual_sum("both", &["energy", "opex"], 0),
                virtual_sum("twice", &["both", "energy"], 1),
            ],
            ..Default::default()
        };
        let registry = Registry::load(doc, FunctionTable::new()).unwrap();
        let data = serde_json::json!({"energy": 2.0, "opex": 1.0, "esc": 3.0});
        let settings = EngineSettings::new(vec![50], 50, 2);
        let globals = resolve_references(&registry.global_references, &data);
        let stage = SourceStage { registry: &registry, settings: &settings, resolver: &data, globals: &globals };

        let mut ledger = Ledger::new(&registry);
        for wave in registry.source_waves() {
            for &id in wave {
                let computed = stage.compute(registry.source(id).unwrap(), &ledger);
                ledger.insert_source(id, computed);
            }
        }
        let store = ResultStore::new();
        let ticket = store.begin();
        assert!(store.commit(ticket, ledger));

        let twice = registry.id_of("twice").unwrap();
        let out = format_trace(&registry, &store.snapshot(), twice, 50);
        let lines: Vec<&str> = out.lines().collect();

        assert!(lines[0].contains("'twice' at P50"));
        // twice = (energy + opex * esc) + energy over two years
        assert!(lines[2].starts_with("[L1] twice (virtual) [total=14.000"));
        assert!(lines[3].starts_with("|--[L2] energy (direct)"));
        assert!(lines[4].starts_with("`--[L2] both"));
        assert!(out.contains("   |--energy (see above, L2)"));
        assert!(out.contains("`--[L3] opex (indirect) [total=6.000"));
        assert!(out.contains("`-- ref esc"));
        assert_eq!(out.matches("] energy").count(), 1);
    }

    #[test]
    fn test_invalid_target() {
        let registry = Registry::load(RegistryDocument::default(), FunctionTable::new()).unwrap();
        let out = format_trace(&registry, &Ledger::default(), EntityId(7), 50);
        assert!(out.starts_with("Error"));
    }
}
