//! Metrics importer: turns weavelet metric deltas into full snapshots.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::MetricsError;
use crate::protos::{MetricDef, MetricType, MetricsUpdate};

/// Current value of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub id: u64,
    pub name: String,
    pub typ: MetricType,
    pub help: String,
    pub labels: BTreeMap<String, String>,
    pub bounds: Vec<f64>,
    pub value: f64,
    pub counts: Vec<u64>,
}

impl MetricSnapshot {
    fn from_def(def: MetricDef) -> Self {
        Self {
            id: def.id,
            name: def.name,
            typ: def.typ,
            help: def.help,
            labels: def.labels,
            bounds: def.bounds,
            value: 0.0,
            counts: Vec::new(),
        }
    }
}

/// Accumulates metric definitions across updates.
///
/// A weavelet sends each definition once, then only values. The importer
/// remembers definitions so every import can return complete snapshots.
/// Not shared: the owner serializes calls to `import`.
#[derive(Debug, Default)]
pub struct MetricsImporter {
    metrics: HashMap<u64, MetricSnapshot>,
}

impl MetricsImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `update` and returns every known metric, sorted by id.
    ///
    /// On error nothing from `update` is applied.
    pub fn import(&mut self, update: MetricsUpdate) -> Result<Vec<MetricSnapshot>, MetricsError> {
        // checked against stored defs and earlier defs of the same update
        let mut incoming: HashMap<u64, &str> = HashMap::new();
        for def in &update.defs {
            let known = self
                .metrics
                .get(&def.id)
                .map(|m| m.name.as_str())
                .or_else(|| incoming.get(&def.id).copied());
            if let Some(old) = known
                && old != def.name
            {
                return Err(MetricsError::Redefined {
                    id: def.id,
                    old: old.to_string(),
                    new: def.name.clone(),
                });
            }
            incoming.insert(def.id, &def.name);
        }
        if let Some(value) = update
            .values
            .iter()
            .find(|v| !self.metrics.contains_key(&v.id) && !incoming.contains_key(&v.id))
        {
            return Err(MetricsError::UnknownMetric(value.id));
        }

        for def in update.defs {
            // a repeated definition keeps the value seen so far
            self.metrics
                .entry(def.id)
                .or_insert_with(|| MetricSnapshot::from_def(def));
        }
        for value in update.values {
            if let Some(metric) = self.metrics.get_mut(&value.id) {
                metric.value = value.value;
                metric.counts = value.counts;
            }
        }

        let mut snapshots: Vec<MetricSnapshot> = self.metrics.values().cloned().collect();
        snapshots.sort_by_key(|m| m.id);
        Ok(snapshots)
    }
}
