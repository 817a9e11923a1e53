//! `ComputationContext`: the immutable registry, scenario settings and the
//! percentile result store, plus the outbound query API.
use crate::analysis::telemetry::{RunReport, Stage};
use crate::analysis::topology;
use crate::compute::ledger::{ComputedMetric, ComputedSource, Ledger, ResultStore};
use crate::compute::metrics::{MetricResult, MetricStage};
use crate::compute::references::{resolve_references, PathResolver};
use crate::compute::sources::SourceStage;
use crate::display::trace;
use crate::settings::{EngineSettings, SettingsError};
use crate::store::types::{EntityId, MetricDefinition, PercentileSelection, PercentileTimeSeries};
use crate::store::Registry;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Recompute {ticket} superseded by a newer request (generation {current})")]
    Superseded { ticket: u64, current: u64 },
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Either a fixed percentile or the user's selection.
#[derive(Debug, Clone, Copy)]
pub enum PercentileQuery<'a> {
    Percentile(u32),
    Selection(&'a PercentileSelection),
}

impl From<u32> for PercentileQuery<'_> {
    fn from(p: u32) -> Self { PercentileQuery::Percentile(p) }
}

impl<'a> From<&'a PercentileSelection> for PercentileQuery<'a> {
    fn from(s: &'a PercentileSelection) -> Self { PercentileQuery::Selection(s) }
}

#[derive(Debug)]
pub struct ComputationContext {
    registry: Arc<Registry>,
    settings: EngineSettings,
    store: ResultStore,
}

impl ComputationContext {
    pub fn new(registry: Arc<Registry>, settings: EngineSettings) -> Result<Self, EngineError> {
        settings.validate()?;
        Ok(Self { registry, settings, store: ResultStore::new() })
    }

    pub fn registry(&self) -> &Registry { &self.registry }

    pub fn settings(&self) -> &EngineSettings { &self.settings }

    /// Recomputes every source and metric for all available percentiles.
    ///
    /// Waves are barriers: each wave reads only results of earlier waves.
    /// Between waves the run checks whether a newer request superseded it and,
    /// if so, discards its staged results.
    pub fn recompute(&self, resolver: &dyn PathResolver) -> Result<RunReport, EngineError> {
        let ticket = self.store.begin();
        let started = Instant::now();
        let registry: &Registry = &self.registry;
        let mut report = RunReport::new(ticket);
        let mut ledger = Ledger::new(registry);
        info!(generation = ticket, sources = registry.sources.len(), metrics = registry.metrics.len(), "recompute started");

        let globals = resolve_references(&registry.global_references, resolver);
        for id in globals.unresolved() {
            warn!(reference = %id, "global reference unresolved");
        }

        // 1. Sources: direct, indirect, virtual; priority groups within each
        let stage = SourceStage { registry, settings: &self.settings, resolver, globals: &globals };
        for (index, wave) in registry.source_waves().iter().enumerate() {
            self.checkpoint(ticket)?;
            let wave_started = Instant::now();
            let computed: Vec<(EntityId, ComputedSource)> = wave
                .par_iter()
                .filter_map(|&id| registry.source(id).map(|def| (id, stage.compute(def, &ledger))))
                .collect();
            report.record_sources(index, &computed.iter().map(|(_, c)| c).collect::<Vec<_>>(), wave_started);
            debug!(wave = index, size = computed.len(), "source wave done");
            for (id, c) in computed {
                ledger.insert_source(id, c);
            }
        }

        // 2. Foundational tier, then analytical levels
        let stage = MetricStage { registry, settings: &self.settings, references: &globals };
        let tiers = [(Stage::Foundational, registry.foundational_waves()), (Stage::Analytical, registry.analytical_levels())];
        for (tier, waves) in tiers {
            for (index, wave) in waves.iter().enumerate() {
                self.checkpoint(ticket)?;
                let wave_started = Instant::now();
                let computed: Vec<(EntityId, ComputedMetric)> = wave
                    .par_iter()
                    .filter_map(|&id| registry.metric(id).map(|def| (id, stage.compute(def, &ledger))))
                    .collect();
                report.record_metrics(tier, index, &computed.iter().map(|(_, c)| c).collect::<Vec<_>>(), wave_started);
                for (id, c) in computed {
                    ledger.insert_metric(id, c);
                }
            }
        }

        // 3. Publish
        self.checkpoint(ticket)?;
        if !self.store.commit(ticket, ledger) {
            return Err(self.superseded(ticket));
        }
        report.finish(started);
        info!(
            generation = ticket,
            failures = report.failure_count(),
            duration_ms = report.duration_ms,
            "recompute committed"
        );
        Ok(report)
    }

    fn checkpoint(&self, ticket: u64) -> Result<(), EngineError> {
        if self.store.is_current(ticket) { Ok(()) } else { Err(self.superseded(ticket)) }
    }

    fn superseded(&self, ticket: u64) -> EngineError {
        let current = self.store.generation();
        info!(ticket, current, "stale recompute discarded");
        EngineError::Superseded { ticket, current }
    }

    /// Drops all cached results; readers see nothing until the next recompute.
    pub fn invalidate(&self) { self.store.invalidate() }

    pub fn generation(&self) -> u64 { self.store.generation() }

    // --- Queries (never recompute) ---

    /// Every computed source restricted to percentile `p`.
    pub fn get_data_by_percentile(&self, p: u32) -> Vec<ComputedSource> {
        self.store.snapshot().sources().filter_map(|s| s.restricted_to(p)).collect()
    }

    pub fn get_data_by_source_id(&self, id: &str) -> Option<Arc<ComputedSource>> {
        let eid = self.registry.id_of(id)?;
        self.store.snapshot().source(eid).cloned()
    }

    pub fn get_data_by_category(&self, category: &str) -> Vec<Arc<ComputedSource>> {
        self.store.snapshot().sources().filter(|s| s.metadata.category == category).cloned().collect()
    }

    pub fn get_computed_metric(&self, id: &str) -> Option<Arc<ComputedMetric>> {
        let eid = self.registry.id_of(id)?;
        self.store.snapshot().metric(eid).cloned()
    }

    /// The metric's result at a fixed percentile, or at the one the selection
    /// assigns to this metric id.
    pub fn get_metric_result<'q>(&self, id: &str, query: impl Into<PercentileQuery<'q>>) -> Option<MetricResult> {
        let percentile = self.percentile_for(id, query.into());
        self.get_computed_metric(id)?.at(percentile).cloned()
    }

    pub fn get_metrics_by_usage(&self, tag: &str) -> Vec<&MetricDefinition> { self.registry.metrics_by_usage(tag) }

    /// The source series the selection picks for `id`.
    pub fn select_source_series(&self, id: &str, selection: &PercentileSelection) -> Option<PercentileTimeSeries> {
        let percentile = self.percentile_for(id, selection.into());
        self.get_data_by_source_id(id)?.at(percentile).cloned()
    }

    fn percentile_for(&self, id: &str, query: PercentileQuery<'_>) -> u32 {
        match query {
            PercentileQuery::Percentile(p) => p,
            PercentileQuery::Selection(s) => s.resolve(id, self.settings.primary_percentile),
        }
    }

    /// Ids of every entity that would change if `id` changed, sorted.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let Some(eid) = self.registry.id_of(id) else { return Vec::new() };
        let mut out: Vec<String> = topology::downstream_from(&self.registry, &[eid])
            .into_iter()
            .filter(|&n| n != eid)
            .map(|n| self.registry.entity_name(n).to_string())
            .collect();
        out.sort();
        out
    }

    /// Text rendering of the dependency tree behind `id` at `percentile`.
    pub fn trace(&self, id: &str, percentile: u32) -> Option<String> {
        let eid = self.registry.id_of(id)?;
        Some(trace::format_trace(&self.registry, &self.store.snapshot(), eid, percentile))
    }
}
