// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service teardown.
//!
//! Scale to zero, wait a bounded time for replicas to drain, delete the
//! service, then delete its discovery registration. Deletion proceeds even if
//! draining did not finish, and resources that are already gone count as
//! deleted. The registration is always removed explicitly since not every
//! platform cascades it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::idle_tracker::IdleTracker;
use crate::naming::ServiceName;
use crate::platform::{Discovery, Orchestrator, PlatformError, UpdateServiceRequest};
use crate::retry::{PollConfig, RetryPolicy};

/// Configuration for teardown.
#[derive(Debug, Clone)]
pub struct TeardownConfig {
    /// Drain wait between scale-down and deletion.
    pub drain: PollConfig,
    /// Backoff for every remote call.
    pub retry: RetryPolicy,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            drain: PollConfig::new(Duration::from_secs(2), 30),
            retry: RetryPolicy::default(),
        }
    }
}

impl TeardownConfig {
    /// Derive from the control plane configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::new(config.retry_attempts, config.retry_base, config.retry_cap),
            ..Self::default()
        }
    }
}

/// What teardown found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// The service did not exist when teardown started.
    pub already_absent: bool,
    /// Replicas reached zero before deletion.
    pub drained: bool,
    /// A discovery registration was removed.
    pub registration_removed: bool,
    /// Non-fatal problems.
    pub diagnostics: Vec<String>,
}

/// Deletes services and their registrations.
pub struct Teardown {
    orchestrator: Arc<dyn Orchestrator>,
    discovery: Arc<dyn Discovery>,
    tracker: IdleTracker,
    service_prefix: String,
    config: TeardownConfig,
}

impl Teardown {
    /// Create a new teardown handler.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        discovery: Arc<dyn Discovery>,
        tracker: IdleTracker,
        service_prefix: impl Into<String>,
        config: TeardownConfig,
    ) -> Self {
        Self {
            orchestrator,
            discovery,
            tracker,
            service_prefix: service_prefix.into(),
            config,
        }
    }

    /// Delete a service and its registration.
    ///
    /// Succeeds when both are gone afterwards, whether or not they existed.
    pub async fn delete(&self, service: &str) -> Result<TeardownReport> {
        let retry = self.config.retry;
        let mut report = TeardownReport::default();

        let request = UpdateServiceRequest::scale(service, 0);
        match retry
            .run("update_service", || self.orchestrator.update_service(&request))
            .await
        {
            Ok(_) => {
                self.untrack(service).await;
                report.drained = self.wait_for_drain(service).await;
                if !report.drained {
                    warn!(service, "Replicas still running, deleting anyway");
                    report
                        .diagnostics
                        .push(format!("service {service} did not drain before deletion"));
                }
                match retry
                    .run("delete_service", || self.orchestrator.delete_service(service))
                    .await
                {
                    Ok(()) => info!(service, "Service deleted"),
                    Err(e) if e.is_not_found() => debug!(service, "Service already deleted"),
                    Err(e) => return Err(e.into()),
                }
            }
            Err(PlatformError::NotFound(_)) => {
                debug!(service, "Service already absent");
                self.untrack(service).await;
                report.already_absent = true;
            }
            Err(e) => return Err(e.into()),
        }

        self.remove_registration(service, &mut report).await;
        Ok(report)
    }

    // Only once the service is at zero or gone; until then the reaper owns it.
    async fn untrack(&self, service: &str) {
        if let Some(scenario_id) = ServiceName::scenario_id(service, &self.service_prefix) {
            self.tracker.untrack(scenario_id).await;
        }
    }

    /// Poll until no replica runs. Returns whether that happened in budget.
    async fn wait_for_drain(&self, service: &str) -> bool {
        let poll = self.config.drain;
        for attempt in 0..poll.max_attempts {
            match self.orchestrator.describe_service(service).await {
                Ok(Some(svc)) if svc.running_count == 0 || !svc.is_live() => return true,
                Ok(None) => return true,
                Ok(Some(svc)) => debug!(service, attempt, running_count = svc.running_count, "Draining"),
                Err(e) => warn!(service, attempt, error = %e, "Failed to describe service"),
            }
            tokio::time::sleep(poll.interval).await;
        }
        false
    }

    async fn remove_registration(&self, service: &str, report: &mut TeardownReport) {
        let retry = self.config.retry;
        let registration = match retry
            .run("find_registration", || self.discovery.find_registration(service))
            .await
        {
            Ok(Some(registration)) => registration,
            Ok(None) => return,
            Err(e) => {
                warn!(service, error = %e, "Failed to look up registration");
                report
                    .diagnostics
                    .push(format!("unable to look up registration: {e}"));
                return;
            }
        };

        match retry
            .run("delete_registration", || {
                self.discovery.delete_registration(&registration.id)
            })
            .await
        {
            Ok(()) => {
                info!(service, registration = %registration.id, "Registration deleted");
                report.registration_removed = true;
            }
            Err(PlatformError::NotFound(_)) => {}
            Err(e) => {
                warn!(service, registration = %registration.id, error = %e, "Failed to delete registration");
                report
                    .diagnostics
                    .push(format!("unable to delete registration {}: {e}", registration.id));
            }
        }
    }
}
