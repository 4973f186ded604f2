//! Latest opportunity per triangle.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::exchange::Venue;
use crate::position::{TriangleKey, TriangularOpportunity};

/// Keeps only the most recent detection of each triangle.
///
/// Older detections are dropped when a newer one for the same key arrives,
/// so an id that was superseded no longer resolves.
#[derive(Debug, Default)]
pub struct OpportunityBook {
    latest: DashMap<TriangleKey, TriangularOpportunity>,
    by_id: DashMap<Uuid, TriangleKey>,
}

impl OpportunityBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a detection. Returns false if a newer one is already held.
    pub fn record(&self, opportunity: TriangularOpportunity) -> bool {
        let key = opportunity.key();
        if let Some(existing) = self.latest.get(&key) {
            if existing.detected_at > opportunity.detected_at {
                return false;
            }
        }
        let id = opportunity.id;
        if let Some(previous) = self.latest.insert(key.clone(), opportunity) {
            self.by_id.remove(&previous.id);
        }
        self.by_id.insert(id, key);
        true
    }

    pub fn get(&self, id: Uuid) -> Option<TriangularOpportunity> {
        let key = self.by_id.get(&id)?.clone();
        self.latest
            .get(&key)
            .filter(|o| o.id == id)
            .map(|o| o.clone())
    }

    /// Remove and return `id` if it is still the latest detection.
    pub fn take(&self, id: Uuid) -> Option<TriangularOpportunity> {
        let (_, key) = self.by_id.remove(&id)?;
        let (_, opportunity) = self.latest.remove_if(&key, |_, o| o.id == id)?;
        Some(opportunity)
    }

    /// Drop the detection held for `key`, if any.
    pub fn forget(&self, key: &TriangleKey) -> Option<TriangularOpportunity> {
        let (_, opportunity) = self.latest.remove(key)?;
        self.by_id.remove(&opportunity.id);
        Some(opportunity)
    }

    pub fn latest(&self, key: &TriangleKey) -> Option<TriangularOpportunity> {
        self.latest.get(key).map(|o| o.clone())
    }

    /// Current opportunities, best realistic profit first.
    pub fn ranked(&self, exchange: Option<Venue>) -> Vec<TriangularOpportunity> {
        let mut all: Vec<TriangularOpportunity> = self
            .latest
            .iter()
            .filter(|o| exchange.map_or(true, |v| o.exchange == v))
            .map(|o| o.clone())
            .collect();
        all.sort_by(|a, b| b.realistic_profit_pct.cmp(&a.realistic_profit_pct));
        all
    }

    /// Drop detections older than `max_age`. Returns how many were removed.
    pub fn prune(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        self.prune_where(None, max_age, now)
    }

    /// Like [`OpportunityBook::prune`], restricted to one exchange.
    pub fn prune_exchange(&self, exchange: Venue, max_age: Duration, now: DateTime<Utc>) -> usize {
        self.prune_where(Some(exchange), max_age, now)
    }

    fn prune_where(&self, exchange: Option<Venue>, max_age: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - max_age;
        let stale: Vec<(TriangleKey, Uuid)> = self
            .latest
            .iter()
            .filter(|o| exchange.map_or(true, |v| o.exchange == v))
            .filter(|o| o.detected_at < cutoff)
            .map(|o| (o.key().clone(), o.id))
            .collect();
        for (key, id) in &stale {
            self.latest.remove(key);
            self.by_id.remove(id);
        }
        stale.len()
    }

    /// Forget everything detected on `exchange`.
    pub fn clear_exchange(&self, exchange: Venue) {
        self.latest.retain(|key, o| {
            let keep = key.exchange != exchange;
            if !keep {
                self.by_id.remove(&o.id);
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
