use crate::model::DetectionRecord;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latest detection per agent. Entries are replaced whole, never merged.
///
/// Records sit behind an `Arc` so a published snapshot shares them with the
/// cache instead of copying frame payloads.
#[derive(Debug, Default, Clone)]
pub struct DetectionCache {
    entries: BTreeMap<String, Arc<DetectionRecord>>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, agent_id: &str, record: DetectionRecord) -> Option<Arc<DetectionRecord>> {
        self.entries.insert(agent_id.to_string(), Arc::new(record))
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<Arc<DetectionRecord>> {
        self.entries.remove(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&DetectionRecord> {
        self.entries.get(agent_id).map(Arc::as_ref)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.entries.contains_key(agent_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &DetectionRecord> {
        self.entries.values().map(Arc::as_ref)
    }

    /// Map for a snapshot; only the `Arc` handles are cloned.
    pub fn shared(&self) -> BTreeMap<String, Arc<DetectionRecord>> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone)]
struct QuarantinedDetection {
    record: DetectionRecord,
    first_seen: Instant,
}

/// Detections that arrived before their agent joined.
///
/// Held apart from [`DetectionCache`] so they are never rendered or counted as
/// active alerts. Each entry expires `grace_window` after the first report for
/// its agent; later reports replace the record but keep the original deadline.
#[derive(Debug, Clone)]
pub struct OrphanQuarantine {
    grace_window: Duration,
    max_entries: usize,
    entries: HashMap<String, QuarantinedDetection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineAdmission {
    Held,
    Replaced,
    /// Admitted after evicting the oldest entry to stay within bounds.
    HeldWithEviction(String),
    /// Zero capacity, nothing is ever held.
    Refused,
}

impl OrphanQuarantine {
    pub fn new(grace_window: Duration, max_entries: usize) -> Self {
        Self {
            grace_window,
            max_entries,
            entries: HashMap::new(),
        }
    }

    pub fn hold(&mut self, record: DetectionRecord, now: Instant) -> QuarantineAdmission {
        if self.max_entries == 0 {
            return QuarantineAdmission::Refused;
        }
        if let Some(existing) = self.entries.get_mut(&record.agent_id) {
            existing.record = record;
            return QuarantineAdmission::Replaced;
        }

        let mut evicted = None;
        if self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.first_seen)
                .map(|(agent_id, _)| agent_id.clone());
            if let Some(agent_id) = oldest {
                self.entries.remove(&agent_id);
                evicted = Some(agent_id);
            }
        }
        self.entries.insert(
            record.agent_id.clone(),
            QuarantinedDetection {
                record,
                first_seen: now,
            },
        );
        match evicted {
            Some(agent_id) => QuarantineAdmission::HeldWithEviction(agent_id),
            None => QuarantineAdmission::Held,
        }
    }

    /// Hands the held record back if it is still inside its grace window.
    pub fn release(&mut self, agent_id: &str, now: Instant) -> Option<DetectionRecord> {
        let entry = self.entries.remove(agent_id)?;
        if self.expired(&entry, now) {
            return None;
        }
        Some(entry.record)
    }

    pub fn discard(&mut self, agent_id: &str) -> bool {
        self.entries.remove(agent_id).is_some()
    }

    /// Evicts every entry past its grace window and returns their agent ids, sorted.
    pub fn reap(&mut self, now: Instant) -> Vec<String> {
        let mut expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.expired(entry, now))
            .map(|(agent_id, _)| agent_id.clone())
            .collect();
        expired.sort();
        for agent_id in &expired {
            self.entries.remove(agent_id);
        }
        expired
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.entries.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn expired(&self, entry: &QuarantinedDetection, now: Instant) -> bool {
        now.saturating_duration_since(entry.first_seen) > self.grace_window
    }
}
