use crate::store::types::TimeSeriesPoint;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Number of leading points copied into an entry as a data sample.
pub const SAMPLE_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    ResolveReferences,
    Fetch,
    Expand,
    Transform,
    Multiply,
    Calculate,
    Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub step: u32,
    pub timestamp_ms: u64,
    pub op_type: AuditOp,
    pub level: AuditLevel,
    pub percentile: Option<u32>,
    pub details: serde_json::Value,
    pub dependency_ids: SmallVec<[String; 4]>,
    pub sample: Vec<TimeSeriesPoint>,
    pub duration_ms: f64,
}

impl AuditEntry {
    pub fn new(op_type: AuditOp) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            step: 0,
            timestamp_ms,
            op_type,
            level: AuditLevel::Info,
            percentile: None,
            details: serde_json::Value::Null,
            dependency_ids: SmallVec::new(),
            sample: Vec::new(),
            duration_ms: 0.0,
        }
    }

    pub fn at(mut self, percentile: u32) -> Self {
        self.percentile = Some(percentile);
        self
    }

    pub fn warn(mut self) -> Self {
        self.level = self.level.max(AuditLevel::Warning);
        self
    }

    pub fn error(mut self) -> Self {
        self.level = AuditLevel::Error;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn sample(mut self, points: &[TimeSeriesPoint]) -> Self {
        self.sample = points.iter().take(SAMPLE_LEN).copied().collect();
        self
    }

    pub fn timed(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self
    }
}

/// Ordered log for one entity. Entries are only ever appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditTrail {
    entries: Vec<AuditEntry>,
}

impl AuditTrail {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, mut entry: AuditEntry) {
        entry.step = self.entries.len() as u32;
        self.entries.push(entry);
    }

    /// Appends another trail, renumbering its steps after ours.
    pub fn append(&mut self, other: AuditTrail) {
        for entry in other.entries {
            self.push(entry);
        }
    }

    pub fn get_trail(&self) -> &[AuditEntry] { &self.entries }

    /// Every dependency id consulted, first occurrence order, without repeats.
    pub fn get_references(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for id in self.entries.iter().flat_map(|e| e.dependency_ids.iter()) {
            if !seen.contains(&id.as_str()) {
                seen.push(id.as_str());
            }
        }
        seen
    }

    pub fn worst_level(&self) -> Option<AuditLevel> { self.entries.iter().map(|e| e.level).max() }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}
