// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fail-loop guard for fresh deployments.
//!
//! After a rollout the platform keeps relaunching crashed replicas on its own.
//! The guard watches the service for a bounded window and, once enough
//! replicas of the new revision have stopped, forces the desired count to
//! zero. It never deletes anything: a later `ensure` redeploys.
//!
//! The guard owns scale-downs it triggers. It drops the scenario from the
//! idle tracker so the idle reaper never acts on the same service.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::idle_tracker::IdleTracker;
use crate::platform::{JobStatus, Orchestrator, UpdateServiceRequest};
use crate::reconciler::Deployment;
use crate::retry::RetryPolicy;

/// Configuration for the fail-loop guard.
#[derive(Debug, Clone)]
pub struct FailLoopGuardConfig {
    /// How long to watch a deployment.
    pub window: Duration,
    /// How often to look.
    pub poll_interval: Duration,
    /// Stopped replicas of the new revision tolerated before scaling to zero.
    pub threshold: u32,
    /// Backoff for the forced scale-down.
    pub retry: RetryPolicy,
}

impl Default for FailLoopGuardConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            threshold: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl FailLoopGuardConfig {
    /// Derive from the control plane configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            window: config.guard_window,
            poll_interval: config.guard_poll_interval,
            threshold: config.guard_threshold.max(1),
            retry: RetryPolicy::new(config.retry_attempts, config.retry_base, config.retry_cap),
        }
    }
}

/// How a watched deployment ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GuardOutcome {
    /// Running replicas of the new revision reached the desired count.
    Healthy {
        /// Stopped replicas seen before that.
        failures: u32,
    },
    /// The new revision kept crashing; desired count forced to zero.
    ScaledDown {
        /// Stopped replicas seen.
        failures: u32,
    },
    /// The window ran out without a verdict.
    WindowElapsed {
        /// Stopped replicas seen.
        failures: u32,
    },
    /// The service disappeared while being watched.
    Gone,
}

/// Watches fresh deployments for crash loops.
pub struct FailLoopGuard {
    orchestrator: Arc<dyn Orchestrator>,
    tracker: IdleTracker,
    config: FailLoopGuardConfig,
}

impl FailLoopGuard {
    /// Create a new guard.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        tracker: IdleTracker,
        config: FailLoopGuardConfig,
    ) -> Self {
        Self {
            orchestrator,
            tracker,
            config,
        }
    }

    /// Watch `deployment` until it is healthy, scaled down, or the window ends.
    ///
    /// Remote failures are logged and the watch continues.
    pub async fn watch(&self, deployment: &Deployment) -> GuardOutcome {
        let service = deployment.service.as_str();
        // An unrepresentable window never elapses.
        let deadline = Instant::now().checked_add(self.config.window);
        let mut stopped: HashSet<String> = HashSet::new();
        let mut scale_down_pending = false;

        info!(
            service,
            revision = %deployment.template_id,
            window_secs = self.config.window.as_secs(),
            "Watching deployment"
        );

        loop {
            match self.orchestrator.describe_service(service).await {
                Ok(Some(svc)) if !svc.is_live() => return GuardOutcome::Gone,
                Ok(None) => return GuardOutcome::Gone,
                Ok(Some(svc))
                    if svc.template_id == deployment.template_id
                        && svc.primary_running_count >= svc.desired_count =>
                {
                    info!(
                        service,
                        running_count = svc.primary_running_count,
                        failures = stopped.len(),
                        "Deployment healthy"
                    );
                    return GuardOutcome::Healthy {
                        failures: count(&stopped),
                    };
                }
                Ok(Some(svc)) => debug!(
                    service,
                    revision = %svc.template_id,
                    running_count = svc.primary_running_count,
                    total_running_count = svc.running_count,
                    desired_count = svc.desired_count,
                    "Deployment not healthy yet"
                ),
                Err(e) => warn!(service, error = %e, "Failed to describe service"),
            }

            match self
                .orchestrator
                .list_service_jobs(service, JobStatus::Stopped)
                .await
            {
                Ok(jobs) => stopped.extend(
                    jobs.into_iter()
                        .filter(|j| j.template_id == deployment.template_id)
                        .map(|j| j.id),
                ),
                Err(e) => warn!(service, error = %e, "Failed to list stopped jobs"),
            }

            if scale_down_pending || count(&stopped) >= self.config.threshold {
                scale_down_pending = true;
                if self.scale_down(deployment, count(&stopped)).await {
                    return GuardOutcome::ScaledDown {
                        failures: count(&stopped),
                    };
                }
            }

            if let Some(deadline) = deadline
                && Instant::now()
                    .checked_add(self.config.poll_interval)
                    .is_none_or(|next| next > deadline)
            {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        warn!(
            service,
            failures = stopped.len(),
            "Deployment watch window elapsed"
        );
        GuardOutcome::WindowElapsed {
            failures: count(&stopped),
        }
    }

    /// Force desired count to zero. Returns whether it took effect.
    async fn scale_down(&self, deployment: &Deployment, failures: u32) -> bool {
        let request = UpdateServiceRequest::scale(&deployment.service, 0);
        match self
            .config
            .retry
            .run("update_service", || {
                self.orchestrator.update_service(&request)
            })
            .await
        {
            Ok(_) => {
                self.tracker.untrack(&deployment.scenario_id).await;
                warn!(
                    service = %deployment.service,
                    revision = %deployment.template_id,
                    failures,
                    "Fail loop detected, scaled service to zero"
                );
                true
            }
            Err(e) => {
                warn!(service = %deployment.service, error = %e, "Failed to scale down fail-looping service");
                false
            }
        }
    }
}

fn count(stopped: &HashSet<String>) -> u32 {
    u32::try_from(stopped.len()).unwrap_or(u32::MAX)
}
