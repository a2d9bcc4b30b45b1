// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Last-access bookkeeping per scenario.
//!
//! Shared by request handlers (which touch scenarios) and the idle reaper
//! (which scales idle ones down). Process lifetime only; nothing is persisted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Scenario id to last-access timestamp.
#[derive(Debug, Clone, Default)]
pub struct IdleTracker {
    entries: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl IdleTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access now.
    pub async fn touch(&self, scenario_id: &str) {
        self.touch_at(scenario_id, Utc::now()).await;
    }

    /// Record an access at `at`. Never moves a timestamp backwards.
    pub async fn touch_at(&self, scenario_id: &str, at: DateTime<Utc>) {
        let mut entries = self.entries.lock().await;
        let last = entries.entry(scenario_id.to_string()).or_insert(at);
        if at > *last {
            *last = at;
        }
    }

    /// Start tracking at `at` unless already tracked. Returns whether it was added.
    pub async fn adopt(&self, scenario_id: &str, at: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(scenario_id) {
            return false;
        }
        entries.insert(scenario_id.to_string(), at);
        true
    }

    /// Last recorded access.
    pub async fn last_access(&self, scenario_id: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().await.get(scenario_id).copied()
    }

    /// Stop tracking a scenario. Returns whether it was tracked.
    pub async fn untrack(&self, scenario_id: &str) -> bool {
        self.entries.lock().await.remove(scenario_id).is_some()
    }

    /// Stop tracking a scenario unless it was touched after `seen`.
    ///
    /// The reaper scales down outside the lock; a request may touch the
    /// scenario in between and must not lose its entry.
    pub async fn untrack_if_idle_since(&self, scenario_id: &str, seen: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(scenario_id) {
            Some(last) if *last <= seen => {
                entries.remove(scenario_id);
                true
            }
            _ => false,
        }
    }

    /// Scenarios last accessed before `cutoff`, oldest first.
    pub async fn idle_before(&self, cutoff: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        let entries = self.entries.lock().await;
        let mut idle: Vec<_> = entries
            .iter()
            .filter(|(_, last)| **last < cutoff)
            .map(|(id, last)| (id.clone(), *last))
            .collect();
        idle.sort_by_key(|(_, last)| *last);
        idle
    }

    /// Number of tracked scenarios.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is tracked.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_touch_never_goes_backwards() {
        let tracker = IdleTracker::new();
        let now = Utc::now();

        tracker.touch_at("a", now).await;
        tracker.touch_at("a", now - Duration::minutes(5)).await;

        assert_eq!(tracker.last_access("a").await, Some(now));
    }

    #[tokio::test]
    async fn test_idle_before() {
        let tracker = IdleTracker::new();
        let now = Utc::now();
        tracker.touch_at("old", now - Duration::hours(2)).await;
        tracker.touch_at("older", now - Duration::hours(3)).await;
        tracker.touch_at("fresh", now).await;

        let idle = tracker.idle_before(now - Duration::minutes(30)).await;
        let ids: Vec<_> = idle.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["older", "old"]);
    }

    #[tokio::test]
    async fn test_untrack_if_idle_since_keeps_fresh_touch() {
        let tracker = IdleTracker::new();
        let seen = Utc::now() - Duration::hours(1);
        tracker.touch_at("a", seen).await;
        tracker.touch_at("b", seen).await;
        tracker.touch_at("b", Utc::now()).await;

        assert!(tracker.untrack_if_idle_since("a", seen).await);
        assert!(!tracker.untrack_if_idle_since("b", seen).await);
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_adopt_does_not_overwrite() {
        let tracker = IdleTracker::new();
        let earlier = Utc::now() - Duration::hours(1);
        tracker.touch_at("a", earlier).await;

        assert!(!tracker.adopt("a", Utc::now()).await);
        assert!(tracker.adopt("b", Utc::now()).await);
        assert_eq!(tracker.last_access("a").await, Some(earlier));
    }

    #[tokio::test]
    async fn test_shared_between_clones() {
        let tracker = IdleTracker::new();
        let handle = tracker.clone();
        handle.touch("a").await;

        assert!(tracker.last_access("a").await.is_some());
        assert!(tracker.untrack("a").await);
        assert!(handle.is_empty().await);
    }
}
