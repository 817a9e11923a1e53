//! Named reference resolution against externally owned project data.
use crate::store::types::{DataValue, ReferenceDef};
use serde_json::Value;
use std::collections::BTreeMap;

/// Read accessor into project/scenario data (`resolvePath`).
///
/// `None` means the path does not resolve. It is never coerced to zero.
pub trait PathResolver: Sync {
    fn resolve_path(&self, path: &[String]) -> Option<DataValue>;
}

/// Walks object keys, or array indices when a segment parses as one.
impl PathResolver for Value {
    fn resolve_path(&self, path: &[String]) -> Option<DataValue> {
        let mut node = self;
        for segment in path {
            node = match node {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        DataValue::from_json(node.clone())
    }
}

impl<F> PathResolver for F
where
    F: Fn(&[String]) -> Option<DataValue> + Sync,
{
    fn resolve_path(&self, path: &[String]) -> Option<DataValue> { self(path) }
}

/// Resolved references keyed by id. An unresolved id maps to `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct References {
    values: BTreeMap<String, Option<DataValue>>,
}

impl References {
    pub fn get(&self, id: &str) -> Option<&DataValue> { self.values.get(id)?.as_ref() }

    pub fn scalar(&self, id: &str) -> Option<f64> { self.get(id)?.as_scalar() }

    pub fn contains(&self, id: &str) -> bool { self.values.contains_key(id) }

    /// Declared but not resolvable.
    pub fn is_unset(&self, id: &str) -> bool { matches!(self.values.get(id), Some(None)) }

    /// Overlays `local` on top of `self`; local entries win on id collision.
    pub fn merged_with(&self, local: References) -> References {
        let mut values = self.values.clone();
        values.extend(local.values);
        References { values }
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &str> {
        self.values.iter().filter(|(_, v)| v.is_none()).map(|(k, _)| k.as_str())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> { self.values.keys().map(String::as_str) }
}

pub fn resolve_references(defs: &[ReferenceDef], resolver: &dyn PathResolver) -> References {
    let values = defs.iter().map(|d| (d.id.clone(), resolver.resolve_path(&d.path))).collect();
    References { values }
}
