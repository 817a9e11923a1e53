//! Per-run dense result storage plus the shared, atomically swapped result store.

use crate::audit::AuditTrail;
use crate::compute::metrics::{MetricResult, MetricValue};
use crate::store::{EntityId, MetricFormat, MetricTier, PercentileTimeSeries, Registry, SourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Failure of one entity. Never propagated across an entity boundary:
/// it is stored next to the (empty) result instead.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComputationError {
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),
    #[error("Calculation failed: {0}")]
    Calculation(String),
    #[error("Transformer '{name}' failed: {message}")]
    Transformer { name: String, message: String },
    #[error("User function '{0}' panicked")]
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub name: String,
    pub category: String,
    pub kind: SourceKind,
    pub priority: i32,
    pub unit: Option<String>,
    pub currency: String,
    pub has_percentiles: bool,
}

/// One source's percentile-indexed series. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedSource {
    pub id: String,
    pub series: BTreeMap<u32, PercentileTimeSeries>,
    pub metadata: SourceMetadata,
    pub audit_trail: AuditTrail,
    pub error: Option<ComputationError>,
}

impl ComputedSource {
    pub fn at(&self, percentile: u32) -> Option<&PercentileTimeSeries> { self.series.get(&percentile) }

    /// A copy holding only `percentile`, or `None` if it was never computed.
    pub fn restricted_to(&self, percentile: u32) -> Option<ComputedSource> {
        let series = self.series.get(&percentile)?.clone();
        Some(ComputedSource {
            series: BTreeMap::from([(percentile, series)]),
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedMetric {
    pub id: String,
    pub tier: MetricTier,
    pub format: MetricFormat,
    pub results: BTreeMap<u32, MetricResult>,
    pub audit_trail: AuditTrail,
}

impl ComputedMetric {
    pub fn at(&self, percentile: u32) -> Option<&MetricResult> { self.results.get(&percentile) }
}

/// Dense storage of one run's results, indexed by `EntityId`.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    source_count: usize,
    sources: Vec<Option<Arc<ComputedSource>>>,
    metrics: Vec<Option<Arc<ComputedMetric>>>,
}

impl Ledger {
    pub fn new(registry: &Registry) -> Self {
        Self {
            source_count: registry.sources.len(),
            sources: vec![None; registry.sources.len()],
            metrics: vec![None; registry.metrics.len()],
        }
    }

    #[inline(always)]
    pub fn source(&self, id: EntityId) -> Option<&Arc<ComputedSource>> {
        self.sources.get(id.index())?.as_ref()
    }

    #[inline(always)]
    pub fn metric(&self, id: EntityId) -> Option<&Arc<ComputedMetric>> {
        let idx = id.index().checked_sub(self.source_count)?;
        self.metrics.get(idx)?.as_ref()
    }

    pub fn insert_source(&mut self, id: EntityId, value: ComputedSource) {
        if let Some(slot) = self.sources.get_mut(id.index()) {
            *slot = Some(Arc::new(value));
        }
    }

    pub fn insert_metric(&mut self, id: EntityId, value: ComputedMetric) {
        if let Some(slot) = id.index().checked_sub(self.source_count).and_then(|i| self.metrics.get_mut(i)) {
            *slot = Some(Arc::new(value));
        }
    }

    pub fn sources(&self) -> impl Iterator<Item = &Arc<ComputedSource>> { self.sources.iter().flatten() }

    pub fn metrics(&self) -> impl Iterator<Item = &Arc<ComputedMetric>> { self.metrics.iter().flatten() }
}

/// Read-only view used by transformers and calculators to reach earlier results by id.
#[derive(Clone, Copy)]
pub struct LedgerView<'a> {
    pub registry: &'a Registry,
    pub ledger: &'a Ledger,
}

impl<'a> LedgerView<'a> {
    pub fn new(registry: &'a Registry, ledger: &'a Ledger) -> Self { Self { registry, ledger } }

    pub fn source(&self, id: &str) -> Option<&'a ComputedSource> {
        let eid = self.registry.id_of(id)?;
        self.ledger.source(eid).map(|s| s.as_ref())
    }

    /// `None` for a failed source: its empty placeholder series is not data.
    pub fn source_series(&self, id: &str, percentile: u32) -> Option<&'a PercentileTimeSeries> {
        self.source(id).filter(|s| s.error.is_none())?.at(percentile)
    }

    pub fn sources_in_category(&self, category: &str) -> Vec<&'a ComputedSource> {
        self.ledger.sources().filter(|s| s.metadata.category == category).map(|s| s.as_ref()).collect()
    }

    pub fn metric(&self, id: &str) -> Option<&'a ComputedMetric> {
        let eid = self.registry.id_of(id)?;
        self.ledger.metric(eid).map(|m| m.as_ref())
    }

    pub fn metric_value(&self, id: &str, percentile: u32) -> Option<&'a MetricValue> {
        self.metric(id)?.at(percentile)?.value.as_ref()
    }
}

/// Shared store of the last committed run.
///
/// Readers take an `Arc` snapshot, so they always see a complete ledger; a
/// commit swaps the whole ledger under the write lock.
#[derive(Debug, Default)]
pub struct ResultStore {
    current: RwLock<Arc<Ledger>>,
    generation: AtomicU64,
}

impl ResultStore {
    pub fn new() -> Self { Self::default() }

    /// Starts a new run; any run holding an older ticket is now stale.
    pub fn begin(&self) -> u64 { self.generation.fetch_add(1, Ordering::SeqCst) + 1 }

    pub fn is_current(&self, ticket: u64) -> bool { self.generation.load(Ordering::SeqCst) == ticket }

    pub fn generation(&self) -> u64 { self.generation.load(Ordering::SeqCst) }

    /// Publishes `ledger` if `ticket` is still the newest run. Returns whether it was stored.
    pub fn commit(&self, ticket: u64, ledger: Ledger) -> bool {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !self.is_current(ticket) {
            return false;
        }
        *guard = Arc::new(ledger);
        true
    }

    /// Drops committed results and supersedes any run in flight.
    pub fn invalidate(&self) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        *guard = Arc::new(Ledger::default());
    }

    pub fn snapshot(&self) -> Arc<Ledger> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}
