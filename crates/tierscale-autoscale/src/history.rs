//! In-memory decision history for cooldown and flap prevention.
//!
//! One bounded ring buffer per cluster tier. Nothing here is durable: a
//! restart forgets the recent window, which only loosens flap prevention
//! for that window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use tierscale_core::{ClusterKey, HistoryEntry, ScalingAction, Tier};

/// Bounded history of one cluster tier.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    /// Survives ring eviction so cooldown is never lost to a burst of holds.
    last_change: Option<u64>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            last_change: None,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if entry.action != ScalingAction::NoChange {
            self.last_change = Some(self.last_change.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Timestamp (ms) of the most recent scaling action.
    pub fn last_change(&self) -> Option<u64> {
        self.last_change
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Entries no older than `window` at `now_ms`.
    pub fn within(&self, now_ms: u64, window: Duration) -> impl Iterator<Item = &HistoryEntry> {
        let since = now_ms.saturating_sub(window.as_millis() as u64);
        self.entries.iter().filter(move |e| e.timestamp >= since)
    }

    /// Drop entries older than `max_age`.
    pub fn prune(&mut self, now_ms: u64, max_age: Duration) {
        let since = now_ms.saturating_sub(max_age.as_millis() as u64);
        while self.entries.front().is_some_and(|e| e.timestamp < since) {
            self.entries.pop_front();
        }
    }
}

/// Both tier histories of a cluster, locked together.
#[derive(Debug, Clone)]
pub struct ClusterHistory {
    pub primaries: History,
    pub secondaries: History,
}

impl ClusterHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            primaries: History::new(capacity),
            secondaries: History::new(capacity),
        }
    }

    pub fn tier(&self, tier: Tier) -> &History {
        match tier {
            Tier::Primaries => &self.primaries,
            Tier::Secondaries => &self.secondaries,
        }
    }

    pub fn tier_mut(&mut self, tier: Tier) -> &mut History {
        match tier {
            Tier::Primaries => &mut self.primaries,
            Tier::Secondaries => &mut self.secondaries,
        }
    }
}

/// Histories of every cluster, each behind its own exclusive lock.
pub struct HistoryStore {
    capacity: usize,
    clusters: RwLock<HashMap<ClusterKey, Arc<Mutex<ClusterHistory>>>>,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clusters: RwLock::new(HashMap::new()),
        }
    }

    /// Exclusive access to one cluster's history. Held for a whole
    /// reconciliation so overlapping cycles cannot interleave.
    pub async fn lock(&self, cluster: &str) -> OwnedMutexGuard<ClusterHistory> {
        let existing = self.clusters.read().await.get(cluster).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => self
                .clusters
                .write()
                .await
                .entry(cluster.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ClusterHistory::new(self.capacity))))
                .clone(),
        };
        slot.lock_owned().await
    }

    /// Copy of a cluster's history, if it has one.
    pub async fn snapshot(&self, cluster: &str) -> Option<ClusterHistory> {
        let slot = self.clusters.read().await.get(cluster).cloned()?;
        let guard = slot.lock().await;
        Some(guard.clone())
    }

    /// Forget a cluster entirely.
    pub async fn remove(&self, cluster: &str) {
        self.clusters.write().await.remove(cluster);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: ScalingAction, from: u32, to: u32, timestamp: u64) -> HistoryEntry {
        HistoryEntry {
            action,
            from_replicas: from,
            to_replicas: to,
            timestamp,
        }
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut h = History::new(2);
        h.push(entry(ScalingAction::ScaleUp, 3, 5, 1));
        h.push(entry(ScalingAction::NoChange, 5, 5, 2));
        h.push(entry(ScalingAction::NoChange, 5, 5, 3));
        assert_eq!(h.len(), 2);
        assert_eq!(h.iter().next().unwrap().timestamp, 2);
        // The evicted scale-up still counts for cooldown.
        assert_eq!(h.last_change(), Some(1));
    }

    #[test]
    fn within_window() {
        let mut h = History::new(8);
        h.push(entry(ScalingAction::ScaleUp, 3, 5, 1_000));
        h.push(entry(ScalingAction::ScaleDown, 5, 3, 50_000));
        let recent: Vec<_> = h.within(60_000, Duration::from_secs(30)).collect();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].action, ScalingAction::ScaleDown);
    }

    #[test]
    fn prune_by_age() {
        let mut h = History::new(8);
        h.push(entry(ScalingAction::ScaleUp, 3, 5, 1_000));
        h.push(entry(ScalingAction::NoChange, 5, 5, 90_000));
        h.prune(100_000, Duration::from_secs(60));
        assert_eq!(h.len(), 1);
    }

    #[tokio::test]
    async fn store_isolates_clusters() {
        let store = HistoryStore::new(4);
        {
            let mut a = store.lock("db/a").await;
            a.primaries.push(entry(ScalingAction::ScaleUp, 3, 5, 10));
        }
        let _b = store.lock("db/b").await;
        assert_eq!(store.snapshot("db/a").await.unwrap().primaries.len(), 1);
        assert!(store.snapshot("db/c").await.is_none());
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_cluster() {
        let store = Arc::new(HistoryStore::new(4));
        let guard = store.lock("db/a").await;

        let s = store.clone();
        let waiter = tokio::spawn(async move {
            let mut h = s.lock("db/a").await;
            h.secondaries.push(entry(ScalingAction::ScaleUp, 2, 3, 20));
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(store.snapshot("db/a").await.unwrap().secondaries.len(), 1);
    }
}
