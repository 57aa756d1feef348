//! Normalizer: reshape API objects into an entity table keyed by kind then id.

use std::collections::BTreeMap;

use serde::Serialize;
use skiff_core::{CoreResult, ResourceId, ResourceKey, ResourceKind};

/// `{ <entity table>: { <id>: object } }`
pub type EntityTable = BTreeMap<String, BTreeMap<ResourceId, serde_json::Value>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NormalizedResult {
    One(ResourceId),
    Many(Vec<ResourceId>),
}

impl Default for NormalizedResult {
    fn default() -> Self {
        NormalizedResult::Many(Vec::new())
    }
}

impl NormalizedResult {
    fn ids(&self) -> Vec<ResourceId> {
        match self {
            NormalizedResult::One(id) => vec![id.clone()],
            NormalizedResult::Many(ids) => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Normalized {
    pub entities: EntityTable,
    pub result: NormalizedResult,
}

impl Normalized {
    /// Deep-merge `other` into `self`: by entity table, then id, then field.
    /// Entity merging is order-independent for disjoint ids; `result` becomes
    /// the union of both results in first-seen order.
    pub fn merge(mut self, other: Normalized) -> Normalized {
        for (table, rows) in other.entities {
            let dst = self.entities.entry(table).or_default();
            for (id, value) in rows {
                match dst.get_mut(&id) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        dst.insert(id, value);
                    }
                }
            }
        }
        let mut ids = self.result.ids();
        for id in other.result.ids() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.result = NormalizedResult::Many(ids);
        self
    }

    pub fn get(&self, kind: ResourceKind, id: &ResourceId) -> Option<&serde_json::Value> {
        self.entities.get(kind.plural()).and_then(|rows| rows.get(id))
    }
}

/// Normalize a single object of `kind`.
pub fn normalize(kind: ResourceKind, data: &serde_json::Value) -> CoreResult<Normalized> {
    normalize_with(kind, data, &[])
}

/// Normalize a single object after deep-merging `extras` (view settings,
/// inspection info) into it, later extras winning.
pub fn normalize_with(kind: ResourceKind, data: &serde_json::Value, extras: &[serde_json::Value]) -> CoreResult<Normalized> {
    let id = ResourceKey::from_value(data)?.id();
    let mut value = data.clone();
    for extra in extras {
        deep_merge(&mut value, extra.clone());
    }
    let mut rows = BTreeMap::new();
    rows.insert(id.clone(), value);
    let mut entities = EntityTable::new();
    entities.insert(kind.plural().to_string(), rows);
    Ok(Normalized { entities, result: NormalizedResult::One(id) })
}

/// Normalize a JSON array of objects of `kind`. A non-array normalizes to empty.
pub fn normalize_list(kind: ResourceKind, data: &serde_json::Value) -> CoreResult<Normalized> {
    let mut rows = BTreeMap::new();
    let mut ids = Vec::new();
    for item in data.as_array().map(|a| a.as_slice()).unwrap_or_default() {
        let id = ResourceKey::from_value(item)?.id();
        ids.push(id.clone());
        rows.insert(id, item.clone());
    }
    let mut entities = EntityTable::new();
    entities.insert(kind.plural().to_string(), rows);
    Ok(Normalized { entities, result: NormalizedResult::Many(ids) })
}

/// Recursive object merge; non-object values in `src` overwrite `dst`.
pub fn deep_merge(dst: &mut serde_json::Value, src: serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(d), serde_json::Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (d, s) => *d = s,
    }
}
