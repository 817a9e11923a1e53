//! Append-only record of every computation step behind a computed entity.
mod trail;

pub use trail::{AuditEntry, AuditLevel, AuditOp, AuditTrail, SAMPLE_LEN};
