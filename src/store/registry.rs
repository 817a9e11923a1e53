use super::functions::FunctionTable;
use super::types::*;
use crate::analysis::topology;
use crate::analysis::validation::{self, ConfigurationError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Declarative registry as it arrives from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub global_references: Vec<ReferenceDef>,
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
}

/// Validated, read-only registry with precomputed execution plans.
#[derive(Debug, Clone)]
pub struct Registry {
    pub sources: Vec<SourceDefinition>,
    pub metrics: Vec<MetricDefinition>,
    pub global_references: Vec<ReferenceDef>,
    pub(crate) functions: FunctionTable,

    // Topology (CSR parents + linked-list children)
    parents_flat: Vec<EntityId>,
    parents_ranges: Vec<(u32, u32)>,
    first_child: Vec<u32>,
    child_targets: Vec<EntityId>,
    next_child: Vec<u32>,

    index: HashMap<String, EntityId>,

    // Execution plans
    source_waves: Vec<Vec<EntityId>>,
    foundational_waves: Vec<Vec<EntityId>>,
    analytical_levels: Vec<Vec<EntityId>>,
}

impl Registry {
    pub fn from_json(json: &str, functions: FunctionTable) -> Result<Self, ConfigurationError> {
        let doc: RegistryDocument =
            serde_json::from_str(json).map_err(|e| ConfigurationError::Malformed(e.to_string()))?;
        Self::load(doc, functions)
    }

    /// Validates the document and builds the dependency topology.
    ///
    /// Either the whole registry loads or a descriptive error is returned;
    /// nothing is ever partially loaded.
    pub fn load(doc: RegistryDocument, functions: FunctionTable) -> Result<Self, ConfigurationError> {
        let RegistryDocument { global_references, sources, metrics } = doc;
        let mut errors = Vec::new();

        // 1. Unique ids
        let mut index = HashMap::with_capacity(sources.len() + metrics.len());
        let ids = sources.iter().map(|s| &s.id).chain(metrics.iter().map(|m| &m.id));
        for (i, id) in ids.enumerate() {
            if index.insert(id.clone(), EntityId::new(i)).is_some() {
                errors.push(ConfigurationError::DuplicateId { id: id.clone() });
            }
        }
        let mut seen_refs = HashSet::new();
        for r in &global_references {
            if !seen_refs.insert(r.id.as_str()) {
                errors.push(ConfigurationError::DuplicateId { id: r.id.clone() });
            }
        }

        // 2. Structural rules
        for s in &sources {
            errors.extend(validation::check_source(s, &functions));
        }
        for m in &metrics {
            errors.extend(validation::check_metric(m, &functions));
        }

        let mut registry = Registry {
            sources,
            metrics,
            global_references,
            functions,
            parents_flat: Vec::new(),
            parents_ranges: Vec::new(),
            first_child: Vec::new(),
            child_targets: Vec::new(),
            next_child: Vec::new(),
            index,
            source_waves: Vec::new(),
            foundational_waves: Vec::new(),
            analytical_levels: Vec::new(),
        };

        // 3. Dependency edges
        let mut all_parents = Vec::with_capacity(registry.count());
        for i in 0..registry.sources.len() {
            all_parents.push(registry.source_parents(&registry.sources[i], &mut errors));
        }
        for i in 0..registry.metrics.len() {
            all_parents.push(registry.metric_parents(&registry.metrics[i], &mut errors));
        }
        ConfigurationError::from_batch(errors)?;

        for parents in &all_parents {
            registry.push_node(parents);
        }

        // 4. Plans
        registry.source_waves = topology::priority_waves(
            registry.sources.iter().enumerate().map(|(i, s)| (EntityId::new(i), (s.kind.rank(), s.priority))),
        );
        registry.foundational_waves = topology::priority_waves(
            registry
                .metric_ids_in(MetricTier::Foundational)
                .map(|id| (id, registry.priority_of(id))),
        );
        let analytical: Vec<EntityId> = registry.metric_ids_in(MetricTier::Analytical).collect();
        registry.analytical_levels = topology::layered_order(&registry, &analytical, |id| registry.priority_of(id))
            .map_err(|members| ConfigurationError::CyclicDependency {
                members: members.iter().map(|&m| registry.entity_name(m).to_string()).collect(),
            })?;

        Ok(registry)
    }

    /// Source ids a source consumes, checked for existence and wave ordering.
    fn source_parents(&self, def: &SourceDefinition, errors: &mut Vec<ConfigurationError>) -> Vec<EntityId> {
        let mut deps: Vec<(&str, &'static str)> = Vec::new();
        let known_reference = |id: &str| {
            self.global_references.iter().any(|r| r.id == id) || def.references.iter().any(|r| r.id == id)
        };

        match &def.transformer {
            Some(TransformerKind::Combine { sources, .. }) => {
                deps.extend(sources.iter().map(|s| (s.as_str(), "source")));
            }
            Some(TransformerKind::ScaleByReference { reference }) if !known_reference(reference.as_str()) => {
                errors.push(ConfigurationError::UnresolvedDependency {
                    entity: def.id.clone(),
                    kind: "reference",
                    dependency: reference.clone(),
                });
            }
            _ => {}
        }

        for m in &def.multipliers {
            match (&m.operation, &m.filter) {
                (MultiplierOp::Summation, Some(SourceFilter::Ids(ids))) => {
                    deps.extend(ids.iter().filter(|s| **s != def.id).map(|s| (s.as_str(), "source")));
                }
                // Category members are edges too, so they obey wave ordering.
                (MultiplierOp::Summation, Some(SourceFilter::Category(category))) => {
                    deps.extend(
                        self.sources
                            .iter()
                            .filter(|s| &s.category == category && s.id != def.id)
                            .map(|s| (s.id.as_str(), "source")),
                    );
                }
                (MultiplierOp::Summation, None) => {}
                _ if self.is_source_id(&m.operand_id) => deps.push((m.operand_id.as_str(), "source")),
                _ if known_reference(m.operand_id.as_str()) => {}
                _ => errors.push(ConfigurationError::UnresolvedDependency {
                    entity: def.id.clone(),
                    kind: "operand",
                    dependency: m.operand_id.clone(),
                }),
            }
        }

        let own_key = (def.kind.rank(), def.priority);
        let mut parents = Vec::new();
        for (dep, kind) in deps {
            match self.index.get(dep).copied().filter(|&id| self.is_source(id)) {
                Some(id) => {
                    let dep_def = &self.sources[id.index()];
                    if (dep_def.kind.rank(), dep_def.priority) >= own_key {
                        errors.push(ConfigurationError::OrderingViolation {
                            source_id: def.id.clone(),
                            dependency: dep.to_string(),
                        });
                    }
                    parents.push(id);
                }
                None => errors.push(ConfigurationError::UnresolvedDependency {
                    entity: def.id.clone(),
                    kind,
                    dependency: dep.to_string(),
                }),
            }
        }
        parents.sort();
        parents.dedup();
        parents
    }

    fn metric_parents(&self, def: &MetricDefinition, errors: &mut Vec<ConfigurationError>) -> Vec<EntityId> {
        let mut parents = Vec::new();
        let mut unresolved = |kind: &'static str, dep: &str| {
            errors.push(ConfigurationError::UnresolvedDependency {
                entity: def.id.clone(),
                kind,
                dependency: dep.to_string(),
            })
        };

        for s in &def.depends_on.sources {
            match self.index.get(s).copied().filter(|&id| self.is_source(id)) {
                Some(id) => parents.push(id),
                None => unresolved("source", s.as_str()),
            }
        }
        for m in &def.depends_on.metrics {
            match self.index.get(m).copied().filter(|&id| !self.is_source(id)) {
                Some(id) => parents.push(id),
                None => unresolved("metric", m.as_str()),
            }
        }
        for r in &def.depends_on.references {
            if !self.global_references.iter().any(|g| &g.id == r) {
                unresolved("reference", r.as_str());
            }
        }
        parents.sort();
        parents.dedup();
        parents
    }

    fn push_node(&mut self, parents: &[EntityId]) -> EntityId {
        let id = EntityId::new(self.parents_ranges.len());

        // 1. Parents (CSR append)
        let start = self.parents_flat.len() as u32;
        self.parents_flat.extend_from_slice(parents);
        self.parents_ranges.push((start, parents.len() as u32));
        self.first_child.push(u32::MAX);

        // 2. Children (adjacency list prepend)
        for &parent in parents {
            let p_idx = parent.index();
            let head = self.first_child[p_idx];
            let new_edge = self.child_targets.len() as u32;
            self.child_targets.push(id);
            self.next_child.push(head);
            self.first_child[p_idx] = new_edge;
        }
        id
    }

    // --- Topology accessors ---

    pub fn count(&self) -> usize { self.sources.len() + self.metrics.len() }

    #[inline(always)]
    pub fn get_parents(&self, id: EntityId) -> &[EntityId] {
        match self.parents_ranges.get(id.index()) {
            Some(&(start, count)) => &self.parents_flat[start as usize..(start + count) as usize],
            None => &[],
        }
    }

    pub fn children(&self, id: EntityId) -> impl Iterator<Item = EntityId> + '_ {
        let mut edge_idx = self.first_child.get(id.index()).copied().unwrap_or(u32::MAX);
        std::iter::from_fn(move || {
            if edge_idx == u32::MAX {
                return None;
            }
            let child = self.child_targets[edge_idx as usize];
            edge_idx = self.next_child[edge_idx as usize];
            Some(child)
        })
    }

    pub fn source_waves(&self) -> &[Vec<EntityId>] { &self.source_waves }
    pub fn foundational_waves(&self) -> &[Vec<EntityId>] { &self.foundational_waves }
    pub fn analytical_levels(&self) -> &[Vec<EntityId>] { &self.analytical_levels }

    // --- Lookups ---

    pub fn id_of(&self, id: &str) -> Option<EntityId> { self.index.get(id).copied() }

    pub fn is_source(&self, id: EntityId) -> bool { id.index() < self.sources.len() }

    pub fn is_source_id(&self, id: &str) -> bool { self.id_of(id).map_or(false, |e| self.is_source(e)) }

    pub fn source(&self, id: EntityId) -> Option<&SourceDefinition> { self.sources.get(id.index()) }

    pub fn metric(&self, id: EntityId) -> Option<&MetricDefinition> {
        id.index().checked_sub(self.sources.len()).and_then(|i| self.metrics.get(i))
    }

    pub fn metric_id(&self, metric_index: usize) -> EntityId { EntityId::new(self.sources.len() + metric_index) }

    fn metric_ids_in(&self, tier: MetricTier) -> impl Iterator<Item = EntityId> + '_ {
        self.metrics
            .iter()
            .enumerate()
            .filter(move |(_, m)| m.tier == tier)
            .map(|(i, _)| self.metric_id(i))
    }

    pub fn entity_name(&self, id: EntityId) -> &str {
        match (self.source(id), self.metric(id)) {
            (Some(s), _) => &s.id,
            (None, Some(m)) => &m.id,
            _ => "<unknown>",
        }
    }

    pub fn priority_of(&self, id: EntityId) -> i32 {
        match (self.source(id), self.metric(id)) {
            (Some(s), _) => s.priority,
            (None, Some(m)) => m.priority,
            _ => i32::MAX,
        }
    }

    pub fn metrics_by_usage(&self, tag: &str) -> Vec<&MetricDefinition> {
        self.metrics.iter().filter(|m| m.usage.iter().any(|u| u == tag)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::*;

    #[test]
    fn test_load_builds_waves_in_kind_then_priority_order() {
        let doc = RegistryDocument {
            global_references: vec![ReferenceDef::new("escalation", &["finance", "escalation"])],
            sources: vec![
                virtual_sum("total", &["energy", "opex"], 0),
                direct("energy", &["energy"], 5),
                indirect("opex", &["opex"], "escalation", 0),
                direct("capex", &["capex"], 1),
            ],
            metrics: vec![],
        };
        let reg = Registry::load(doc, FunctionTable::new()).expect("valid registry");
        let waves: Vec<Vec<&str>> = reg
            .source_waves()
            .iter()
            .map(|w| w.iter().map(|&id| reg.entity_name(id)).collect())
            .collect();
        assert_eq!(waves, vec![vec!["capex"], vec!["energy"], vec!["opex"], vec!["total"]]);
        assert_eq!(reg.get_parents(reg.id_of("total").unwrap()).len(), 2);
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let doc = RegistryDocument {
            sources: vec![direct("energy", &["a"], 0), direct("energy", &["b"], 1)],
            ..Default::default()
        };
        let err = Registry::load(doc, FunctionTable::new()).unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateId { id: "energy".into() });
    }

    #[test]
    fn test_same_wave_dependency_is_an_ordering_violation() {
        let doc = RegistryDocument {
            sources: vec![
                direct("early", &["a"], 0),
                indirect("peer", &["c"], "late", 0),
                indirect("late", &["b"], "early", 0),
            ],
            ..Default::default()
        };
        let err = Registry::load(doc, FunctionTable::new()).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::OrderingViolation { source_id: "peer".into(), dependency: "late".into() }
        );
    }

    #[test]
    fn test_category_summation_members_are_ordered_parents() {
        let summed = |id: &str, priority: i32| {
            let mut s = indirect(id, &[id], "unused", priority);
            s.category = "capex".into();
            s.multipliers = vec![MultiplierDef {
                operand_id: String::new(),
                operation: MultiplierOp::Summation,
                base_year: 0,
                filter: Some(SourceFilter::Category("capex".into())),
            }];
            s
        };
        let mut turbines = direct("turbines", &["t"], 0);
        turbines.category = "capex".into();

        let doc = RegistryDocument { sources: vec![turbines.clone(), summed("total", 0)], ..Default::default() };
        let reg = Registry::load(doc, FunctionTable::new()).expect("member in an earlier wave");
        let total = reg.id_of("total").unwrap();
        assert_eq!(reg.get_parents(total).to_vec(), vec![reg.id_of("turbines").unwrap()]);
        assert_eq!(reg.children(reg.id_of("turbines").unwrap()).collect::<Vec<_>>(), vec![total]);

        let mut peer = indirect("peer", &["p"], "turbines", 0);
        peer.category = "capex".into();
        let doc = RegistryDocument { sources: vec![turbines, peer, summed("total", 0)], ..Default::default() };
        let err = Registry::load(doc, FunctionTable::new()).unwrap_err();
        assert_eq!(err, ConfigurationError::OrderingViolation { source_id: "total".into(), dependency: "peer".into() });
    }

    #[test]
    fn test_unresolved_metric_dependency_is_fatal() {
        let doc = RegistryDocument {
            metrics: vec![analytical("irr", &["missing"], 0)],
            ..Default::default()
        };
        let err = Registry::load(doc, noop_functions()).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnresolvedDependency { kind: "metric", .. }));
    }

    #[test]
    fn test_from_json_and_usage_lookup() {
        let json = r#"{
            "global_references": [{"id": "discount_rate", "path": ["finance", "discount"]}],
            "sources": [
                {"id": "energy", "kind": "direct", "path": ["energy"], "category": "revenue"}
            ],
            "metrics": [
                {"id": "cf", "tier": "foundational", "depends_on": {"sources": ["energy"]},
                 "calculate": {"type": "sum_sources", "sources": ["energy"]}},
                {"id": "npv", "tier": "analytical", "usage": ["summary"], "format": "currency",
                 "depends_on": {"metrics": ["cf"], "references": ["discount_rate"]},
                 "calculate": {"type": "npv", "cashflow": "cf", "rate": "discount_rate"}}
            ]
        }"#;
        let reg = Registry::from_json(json, FunctionTable::new()).expect("valid json registry");
        assert_eq!(reg.metrics_by_usage("summary").len(), 1);
        assert_eq!(reg.analytical_levels().len(), 1);
        assert_eq!(reg.foundational_waves().len(), 1);

        let bad = Registry::from_json("{\"sources\": 3}", FunctionTable::new()).unwrap_err();
        assert!(matches!(bad, ConfigurationError::Malformed(_)));
    }
}
