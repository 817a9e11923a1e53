use crate::compute::ledger::{ComputationError, ComputedMetric, ComputedSource};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Sources,
    Foundational,
    Analytical,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaveSummary {
    pub stage: Stage,
    pub index: usize,
    pub entities: usize,
    /// Entities with at least one failed percentile.
    pub failed: usize,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityFailure {
    pub id: String,
    /// `None` when the entity failed as a whole (sources).
    pub percentile: Option<u32>,
    pub error: ComputationError,
}

/// Outcome of one recompute: what ran, in which waves, and what failed.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub generation: u64,
    pub waves: Vec<WaveSummary>,
    pub source_failures: Vec<EntityFailure>,
    pub metric_failures: Vec<EntityFailure>,
    pub duration_ms: f64,
}

impl RunReport {
    pub fn new(generation: u64) -> Self {
        Self { generation, waves: Vec::new(), source_failures: Vec::new(), metric_failures: Vec::new(), duration_ms: 0.0 }
    }

    pub fn record_sources(&mut self, index: usize, computed: &[&ComputedSource], started: Instant) {
        let failures: Vec<EntityFailure> = computed
            .iter()
            .filter_map(|s| {
                let error = s.error.clone()?;
                Some(EntityFailure { id: s.id.clone(), percentile: None, error })
            })
            .collect();
        self.push_wave(Stage::Sources, index, computed.len(), failures.len(), started);
        self.source_failures.extend(failures);
    }

    pub fn record_metrics(&mut self, stage: Stage, index: usize, computed: &[&ComputedMetric], started: Instant) {
        let mut failed = 0;
        for m in computed {
            let before = self.metric_failures.len();
            self.metric_failures.extend(m.results.iter().filter_map(|(&p, r)| {
                let error = r.error.clone()?;
                Some(EntityFailure { id: m.id.clone(), percentile: Some(p), error })
            }));
            if self.metric_failures.len() > before {
                failed += 1;
            }
        }
        self.push_wave(stage, index, computed.len(), failed, started);
    }

    fn push_wave(&mut self, stage: Stage, index: usize, entities: usize, failed: usize, started: Instant) {
        self.waves.push(WaveSummary { stage, index, entities, failed, duration_ms: elapsed_ms(started) });
    }

    /// Sorts failures by entity id then percentile and stamps the total duration.
    pub fn finish(&mut self, started: Instant) {
        let key = |f: &EntityFailure| (f.id.clone(), f.percentile);
        self.source_failures.sort_by_key(key);
        self.metric_failures.sort_by_key(key);
        self.duration_ms = elapsed_ms(started);
    }

    pub fn is_clean(&self) -> bool { self.source_failures.is_empty() && self.metric_failures.is_empty() }

    pub fn failure_count(&self) -> usize { self.source_failures.len() + self.metric_failures.len() }
}

fn elapsed_ms(started: Instant) -> f64 { started.elapsed().as_secs_f64() * 1000.0 }
