// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-scenario operations.
//!
//! [`ControlPlane`] wires the components together along the request paths:
//!
//! ```text
//! build_and_deploy:  JobRunner ──(exit 0)──▶ ServiceReconciler ──▶ FailLoopGuard
//!                        │
//!                        └──(failure)──▶ log tail back to the caller
//!
//! delete_scenario:   Teardown
//! touch:             IdleTracker
//! ```
//!
//! Editing a scenario is another `build_and_deploy` with new inputs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::env_overlay::EnvOverlay;
use crate::error::Result;
use crate::fail_loop_guard::{FailLoopGuard, FailLoopGuardConfig, GuardOutcome};
use crate::idle_tracker::IdleTracker;
use crate::job_runner::{JobOutcome, JobRequest, JobRunner, JobRunnerConfig};
use crate::platform::{Discovery, LogSink, Orchestrator, TemplateRef};
use crate::reconciler::{Deployment, EnsureRequest, ReconcilerConfig, ServiceReconciler};
use crate::teardown::{Teardown, TeardownConfig, TeardownReport};

/// Inputs of one build and deploy.
#[derive(Debug, Clone, Default)]
pub struct ScenarioRequest {
    /// Scenario to build.
    pub scenario_id: String,
    /// Environment overrides for the build job.
    pub build_env: BTreeMap<String, String>,
    /// Environment overrides for the router service.
    pub router_env: BTreeMap<String, String>,
    /// Router image override; the configured default otherwise.
    pub router_image: Option<String>,
    /// Router replicas.
    pub desired_count: u32,
}

impl ScenarioRequest {
    /// A single-replica deploy with no overrides.
    pub fn new(scenario_id: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            desired_count: 1,
            ..Default::default()
        }
    }
}

/// Result of [`ControlPlane::build_and_deploy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// The build job failed; nothing was deployed.
    BuildFailed {
        /// Exit code, log tail and diagnostics of the build.
        job: JobOutcome,
    },
    /// The router service was rolled out and watched.
    Deployed {
        /// Build job that produced the artifacts.
        job: JobOutcome,
        /// What was rolled out.
        deployment: Deployment,
        /// Verdict of the fail-loop guard.
        guard: GuardOutcome,
    },
}

/// Build, deploy and delete scenarios.
pub struct ControlPlane {
    config: Config,
    tracker: IdleTracker,
    job_runner: JobRunner,
    reconciler: ServiceReconciler,
    guard: FailLoopGuard,
    teardown: Teardown,
}

impl ControlPlane {
    /// Wire all components from `config` over the given platform APIs.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        discovery: Arc<dyn Discovery>,
        logs: Arc<dyn LogSink>,
        config: Config,
    ) -> Self {
        Self::with_tracker(orchestrator, discovery, logs, config, IdleTracker::new())
    }

    /// Like [`new`](Self::new), sharing an existing idle tracker.
    pub fn with_tracker(
        orchestrator: Arc<dyn Orchestrator>,
        discovery: Arc<dyn Discovery>,
        logs: Arc<dyn LogSink>,
        config: Config,
        tracker: IdleTracker,
    ) -> Self {
        let job_runner = JobRunner::new(
            orchestrator.clone(),
            logs,
            JobRunnerConfig::from_config(&config),
        );
        let reconciler = ServiceReconciler::new(
            orchestrator.clone(),
            discovery.clone(),
            ReconcilerConfig::from_config(&config),
        );
        let guard = FailLoopGuard::new(
            orchestrator.clone(),
            tracker.clone(),
            FailLoopGuardConfig::from_config(&config),
        );
        let teardown = Teardown::new(
            orchestrator,
            discovery,
            tracker.clone(),
            config.service_prefix.clone(),
            TeardownConfig::from_config(&config),
        );

        Self {
            config,
            tracker,
            job_runner,
            reconciler,
            guard,
            teardown,
        }
    }

    /// The shared idle tracker.
    pub fn tracker(&self) -> &IdleTracker {
        &self.tracker
    }

    /// The configuration this control plane was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the build job, then roll out the router and watch it.
    ///
    /// A failed build returns [`DeployOutcome::BuildFailed`] with the job's
    /// log tail and leaves any running router untouched.
    pub async fn build_and_deploy(&self, request: &ScenarioRequest) -> Result<DeployOutcome> {
        let scenario_id = request.scenario_id.as_str();
        // Reject bad ids before anything is launched.
        let service = self.reconciler.service_name(scenario_id)?;

        let job = self
            .job_runner
            .submit_and_wait(&JobRequest {
                template: TemplateRef::Family(self.config.builder_family.clone()),
                image: self.config.builder_image.clone(),
                shape: self.config.builder_shape(),
                env: EnvOverlay::for_scenario(scenario_id, &self.config.region)
                    .with_overrides(request.build_env.clone()),
            })
            .await?;

        if !job.success {
            warn!(
                scenario_id,
                exit_code = ?job.exit_code,
                diagnostics = ?job.diagnostics,
                "Build failed, not deploying"
            );
            return Ok(DeployOutcome::BuildFailed { job });
        }

        let deployment = self
            .reconciler
            .ensure(&EnsureRequest {
                scenario_id: scenario_id.to_string(),
                template_family: self.config.router_family.clone(),
                image: request
                    .router_image
                    .clone()
                    .or_else(|| self.config.router_image.clone()),
                env: EnvOverlay::default().with_overrides(request.router_env.clone()),
                desired_count: request.desired_count,
                port: self.config.router_port,
            })
            .await?;
        self.tracker.touch(scenario_id).await;

        let guard = self.guard.watch(&deployment).await;
        info!(scenario_id, service = %service, guard = ?guard, "Scenario deployed");

        Ok(DeployOutcome::Deployed {
            job,
            deployment,
            guard,
        })
    }

    /// Tear down a scenario's router service and registration.
    pub async fn delete_scenario(&self, scenario_id: &str) -> Result<TeardownReport> {
        let service = self.reconciler.service_name(scenario_id)?;
        let report = self.teardown.delete(service.as_str()).await?;
        info!(
            scenario_id,
            already_absent = report.already_absent,
            drained = report.drained,
            "Scenario deleted"
        );
        Ok(report)
    }

    /// Record an access from a warm-up or health path.
    pub async fn touch(&self, scenario_id: &str) {
        self.tracker.touch(scenario_id).await;
    }
}
