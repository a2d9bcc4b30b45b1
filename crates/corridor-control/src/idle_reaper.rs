// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that scales idle router services to zero.
//!
//! Request handlers record scenario accesses in the [`IdleTracker`]. Every
//! tick, scenarios whose last access is older than the idle window get their
//! service's desired count set to zero and are dropped from tracking. A
//! failure on one service is logged and the tick moves on to the next.
//!
//! On start, live services carrying the prefix that nobody tracks yet (for
//! example after a control plane restart) are adopted as accessed "now", so
//! they are reaped one idle window later instead of running forever. A failed
//! adoption is retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::idle_tracker::IdleTracker;
use crate::naming::ServiceName;
use crate::platform::{Orchestrator, PlatformError, UpdateServiceRequest};
use crate::retry::RetryPolicy;

/// Configuration for the idle reaper.
#[derive(Debug, Clone)]
pub struct IdleReaperConfig {
    /// How often to look for idle scenarios.
    pub poll_interval: Duration,
    /// Time since last access before a service is scaled to zero.
    pub idle_window: Duration,
    /// Service name prefix; only these services are adopted.
    pub service_prefix: String,
    /// Backoff for each remote call.
    pub retry: RetryPolicy,
}

impl Default for IdleReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            idle_window: Duration::from_secs(1800), // 30 minutes
            service_prefix: "router".to_string(),
            retry: RetryPolicy::default().with_attempts(3),
        }
    }
}

impl IdleReaperConfig {
    /// Derive from the control plane configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.reaper_interval,
            idle_window: config.idle_window,
            service_prefix: config.service_prefix.clone(),
            retry: RetryPolicy::new(
                config.retry_attempts.min(3),
                config.retry_base,
                config.retry_cap,
            ),
        }
    }
}

/// Counts from one reaper tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Services scaled to zero.
    pub scaled_down: u32,
    /// Entries dropped without a scale-down (service gone or already at zero).
    pub released: u32,
    /// Services that could not be handled; they stay tracked.
    pub errors: u32,
}

enum Reaped {
    ScaledDown,
    Released,
}

/// Background worker that scales idle services to zero.
pub struct IdleReaper {
    orchestrator: Arc<dyn Orchestrator>,
    tracker: IdleTracker,
    config: IdleReaperConfig,
    shutdown: Arc<Notify>,
}

impl IdleReaper {
    /// Create a new idle reaper.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        tracker: IdleTracker,
        config: IdleReaperConfig,
    ) -> Self {
        Self {
            orchestrator,
            tracker,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop.
    ///
    /// Adopts untracked services, then reaps idle scenarios every
    /// `poll_interval`. Adoption is retried on each tick until it succeeds. The loop exits when the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            idle_window_secs = self.config.idle_window.as_secs(),
            "Idle reaper started"
        );

        let mut adopted = self.try_adopt().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Idle reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if !adopted {
                        adopted = self.try_adopt().await;
                    }
                    self.reap_idle(Utc::now()).await;
                }
            }
        }

        info!("Idle reaper stopped");
    }

    async fn try_adopt(&self) -> bool {
        match self.adopt_untracked(Utc::now()).await {
            Ok(0) => true,
            Ok(adopted) => {
                info!(adopted, "Adopted untracked services");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to adopt untracked services, retrying next tick");
                false
            }
        }
    }

    /// Track live, scaled-up services with the prefix that nobody tracks yet.
    pub async fn adopt_untracked(&self, now: DateTime<Utc>) -> Result<usize, PlatformError> {
        let services = self
            .config
            .retry
            .run("list_services", || self.orchestrator.list_services())
            .await?;

        let mut adopted = 0;
        for service in services {
            if !service.is_live() || service.desired_count == 0 {
                continue;
            }
            let Some(scenario_id) = ServiceName::scenario_id(&service.name, &self.config.service_prefix)
            else {
                continue;
            };
            if self.tracker.adopt(scenario_id, now).await {
                debug!(service = %service.name, "Adopted service");
                adopted += 1;
            }
        }
        Ok(adopted)
    }

    /// Scale down every scenario idle for longer than the window as of `now`.
    pub async fn reap_idle(&self, now: DateTime<Utc>) -> ReapSummary {
        let mut summary = ReapSummary::default();
        let cutoff = chrono::Duration::from_std(self.config.idle_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window));
        let Some(cutoff) = cutoff else {
            debug!("Idle window reaches past the clock range, nothing is idle");
            return summary;
        };

        for (scenario_id, last_access) in self.tracker.idle_before(cutoff).await {
            match self.reap_one(&scenario_id, last_access).await {
                Ok(Reaped::ScaledDown) => {
                    info!(
                        scenario_id = %scenario_id,
                        idle_mins = (now - last_access).num_minutes(),
                        "Scaled idle service to zero"
                    );
                    summary.scaled_down += 1;
                }
                Ok(Reaped::Released) => summary.released += 1,
                Err(e) => {
                    error!(scenario_id = %scenario_id, error = %e, "Failed to scale down idle service");
                    summary.errors += 1;
                }
            }
        }

        if summary != ReapSummary::default() {
            info!(
                scaled_down = summary.scaled_down,
                released = summary.released,
                errors = summary.errors,
                "Reaper tick completed"
            );
        } else {
            debug!("Reaper tick completed, nothing idle");
        }
        summary
    }

    async fn reap_one(
        &self,
        scenario_id: &str,
        last_access: DateTime<Utc>,
    ) -> Result<Reaped, PlatformError> {
        let Ok(name) = ServiceName::for_scenario(&self.config.service_prefix, scenario_id) else {
            warn!(scenario_id, "Dropping untrackable scenario id");
            self.tracker.untrack(scenario_id).await;
            return Ok(Reaped::Released);
        };
        let retry = self.config.retry;

        let service = retry
            .run("describe_service", || {
                self.orchestrator.describe_service(name.as_str())
            })
            .await?;
        // Gone, or already scaled down by someone else (guard or teardown).
        if service.is_none_or(|s| !s.is_live() || s.desired_count == 0) {
            self.tracker.untrack(scenario_id).await;
            return Ok(Reaped::Released);
        }

        let request = UpdateServiceRequest::scale(name.as_str(), 0);
        match retry
            .run("update_service", || self.orchestrator.update_service(&request))
            .await
        {
            Ok(_) => {
                self.tracker
                    .untrack_if_idle_since(scenario_id, last_access)
                    .await;
                Ok(Reaped::ScaledDown)
            }
            Err(PlatformError::NotFound(_)) => {
                self.tracker.untrack(scenario_id).await;
                Ok(Reaped::Released)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryPlatform;

    #[test]
    fn test_config_default() {
        let config = IdleReaperConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.idle_window, Duration::from_secs(1800));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_shutdown_handle() {
        let reaper = IdleReaper::new(
            Arc::new(MemoryPlatform::default()),
            IdleTracker::new(),
            IdleReaperConfig::default(),
        );
        let handle = reaper.shutdown_handle();
        assert!(Arc::strong_count(&handle) >= 2);
    }

    #[tokio::test]
    async fn test_reap_empty_tracker() {
        let reaper = IdleReaper::new(
            Arc::new(MemoryPlatform::default()),
            IdleTracker::new(),
            IdleReaperConfig::default(),
        );
        assert_eq!(reaper.reap_idle(Utc::now()).await, ReapSummary::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let reaper = Arc::new(IdleReaper::new(
            Arc::new(MemoryPlatform::default()),
            IdleTracker::new(),
            IdleReaperConfig::default(),
        ));
        let shutdown = reaper.shutdown_handle();
        let task = {
            let reaper = reaper.clone();
            tokio::spawn(async move { reaper.run().await })
        };

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.notify_one();
        task.await.unwrap();
    }
}
