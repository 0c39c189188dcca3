//! Per-tenant admission counters.
//!
//! Counters only ever grow and live as long as the process does.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::Serialize;

use crate::ratelimit::TenantKey;

/// Counters for one `(organization, region)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsEntry {
    /// Requests admitted
    pub allowed_count: u64,
    /// Requests denied
    pub throttled_count: u64,
    /// Highest `capacity - remaining` seen on a denial
    pub burst_used_max: f64,
}

/// Registry of admission outcomes keyed by `{organization_id}:{region}`.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    entries: Mutex<HashMap<String, MetricsEntry>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one decision.
    ///
    /// `capacity` and `remaining` describe the bucket that decided; on a
    /// denial they feed the burst high-water mark.
    pub fn bump(&self, tenant: &TenantKey, allowed: bool, capacity: f64, remaining: f64) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(tenant.metrics_label()).or_default();

        if allowed {
            entry.allowed_count += 1;
        } else {
            entry.throttled_count += 1;
            let burst_used = (capacity - remaining).max(0.0);
            if burst_used > entry.burst_used_max {
                entry.burst_used_max = burst_used;
            }
        }
    }

    /// Copy of every entry, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, MetricsEntry> {
        self.entries
            .lock()
            .iter()
            .map(|(label, entry)| (label.clone(), *entry))
            .collect()
    }

    /// Entry for a single tenant pair.
    pub fn get(&self, tenant: &TenantKey) -> Option<MetricsEntry> {
        self.entries.lock().get(&tenant.metrics_label()).copied()
    }
}
