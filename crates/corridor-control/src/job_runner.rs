// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One-off build jobs.
//!
//! A job runs a template revision to completion. The runner resolves (or
//! registers) the revision, launches exactly one job with the caller's
//! environment as a per-run override, polls until the job stops, and reads
//! back its exit code and the tail of its log stream.
//!
//! Template revisions and launched jobs are never rolled back: a failed build
//! leaves its revision registered and its stopped job on record.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::env_overlay::EnvOverlay;
use crate::error::Result;
use crate::platform::{
    ContainerSpec, Job, LaunchOutcome, LogConfig, LogSink, NetworkConfig, Orchestrator,
    PlatformError, ResourceShape, RunJobRequest, TaskTemplate, TemplateRef, TemplateSpec,
};
use crate::retry::{PollConfig, RetryPolicy};

/// Log pages read before giving up on a stream that never repeats its token.
const MAX_LOG_PAGES: usize = 10_000;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Network placement of jobs.
    pub network: NetworkConfig,
    /// Execution identity for newly registered revisions.
    pub execution_role: Option<String>,
    /// Run identity for newly registered revisions.
    pub task_role: Option<String>,
    /// Container name for newly registered revisions.
    pub container_name: String,
    /// Log routing for newly registered revisions.
    pub log: LogConfig,
    /// How long and how often to wait for a job to stop.
    pub poll: PollConfig,
    /// Log lines kept, most recent last.
    pub log_tail_lines: usize,
    /// Backoff for template and log calls.
    pub retry: RetryPolicy,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            execution_role: None,
            task_role: None,
            container_name: "builder".to_string(),
            log: LogConfig {
                group: "/corridor/builder".to_string(),
                region: "ap-northeast-1".to_string(),
                stream_prefix: "builder".to_string(),
            },
            poll: PollConfig::within(Duration::from_secs(6), Duration::from_secs(4 * 3600)),
            log_tail_lines: 400,
            retry: RetryPolicy::default(),
        }
    }
}

impl JobRunnerConfig {
    /// Derive from the control plane configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            network: config.network.clone(),
            execution_role: config.execution_role.clone(),
            task_role: config.task_role.clone(),
            log: LogConfig {
                group: config.builder_log_group.clone(),
                region: config.region.clone(),
                stream_prefix: "builder".to_string(),
            },
            poll: PollConfig::within(config.job_poll_interval, config.job_timeout),
            retry: RetryPolicy::new(config.retry_attempts, config.retry_base, config.retry_cap),
            ..Self::default()
        }
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Template family or concrete revision.
    pub template: TemplateRef,
    /// Image for a revision registered on demand.
    pub image: Option<String>,
    /// Resources for a revision registered on demand.
    pub shape: ResourceShape,
    /// Per-run environment.
    pub env: EnvOverlay,
}

/// Result of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    /// True iff the job stopped with exit code 0.
    pub success: bool,
    /// Job handle, if a job was launched.
    pub job_id: Option<String>,
    /// `family:revision` the job ran.
    pub template_id: Option<String>,
    /// Exit code, if the platform reported one.
    pub exit_code: Option<i32>,
    /// Most recent log lines, oldest first.
    pub log_tail: Vec<String>,
    /// Non-fatal problems met while running or inspecting the job.
    pub diagnostics: Vec<String>,
}

/// Runs one-off jobs to completion.
pub struct JobRunner {
    orchestrator: Arc<dyn Orchestrator>,
    logs: Arc<dyn LogSink>,
    config: JobRunnerConfig,
}

impl JobRunner {
    /// Create a new job runner.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        logs: Arc<dyn LogSink>,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            orchestrator,
            logs,
            config,
        }
    }

    /// Launch one job, wait for it to stop, and report how it went.
    ///
    /// Configuration and remote errors before the launch are returned as
    /// errors. Once a launch was attempted, every problem is reported in the
    /// outcome instead.
    pub async fn submit_and_wait(&self, request: &JobRequest) -> Result<JobOutcome> {
        let template = self.resolve_template(request).await?;
        let template_id = template.id();

        let run = RunJobRequest {
            template_id: template_id.clone(),
            container: template.spec.container.name.clone(),
            env: request.env.to_overrides(),
            network: self.config.network.clone(),
        };

        // Launching is not idempotent; a retried launch could run the build twice.
        let job = match self.orchestrator.run_job(&run).await? {
            LaunchOutcome::Launched(job) => job,
            LaunchOutcome::Rejected(failures) => {
                warn!(template = %template_id, ?failures, "Job launch rejected");
                return Ok(JobOutcome {
                    template_id: Some(template_id),
                    diagnostics: vec![format!("launch rejected: {}", failures.join("; "))],
                    ..Default::default()
                });
            }
        };
        info!(job_id = %job.id, template = %template_id, "Job launched");

        let mut outcome = JobOutcome {
            job_id: Some(job.id.clone()),
            template_id: Some(template_id),
            ..Default::default()
        };

        match self.wait_for_stop(&job.id).await {
            Some(job) if job.status.is_terminal() => {
                outcome.exit_code = job.exit_code;
                outcome.success = job.exit_code == Some(0);
                if job.exit_code.is_none() {
                    outcome.diagnostics.push(format!(
                        "missing exit code for job {} ({})",
                        job.id,
                        job.stopped_reason.as_deref().unwrap_or("no stop reason")
                    ));
                }
            }
            Some(job) => outcome.diagnostics.push(format!(
                "job {} still {:?} after {:?}",
                job.id,
                job.status,
                self.config.poll.interval * self.config.poll.max_attempts
            )),
            None => outcome
                .diagnostics
                .push(format!("job {} could not be described", job.id)),
        }

        outcome.log_tail = self
            .tail_logs(&template, &job, &mut outcome.diagnostics)
            .await;

        info!(
            job_id = %job.id,
            success = outcome.success,
            exit_code = ?outcome.exit_code,
            log_lines = outcome.log_tail.len(),
            "Job finished"
        );
        Ok(outcome)
    }

    /// Find the revision to run, registering one for a family if needed.
    async fn resolve_template(&self, request: &JobRequest) -> Result<TaskTemplate> {
        let retry = self.config.retry;

        if let TemplateRef::Revision { family, revision } = &request.template {
            let template = retry
                .run("describe_template", || {
                    self.orchestrator.describe_template(family, *revision)
                })
                .await?;
            return template
                .ok_or_else(|| PlatformError::NotFound(format!("{family}:{revision}")).into());
        }

        let family = request.template.family();
        let latest = retry
            .run("latest_template", || self.orchestrator.latest_template(family))
            .await?;

        // An explicit image only reuses a revision that already runs it.
        if let Some(latest) = latest {
            let reusable = match &request.image {
                Some(image) => latest.spec.container.image == *image,
                None => true,
            };
            if reusable {
                debug!(template = %latest.id(), "Reusing template revision");
                return Ok(latest);
            }
        }

        let image = request
            .image
            .clone()
            .ok_or_else(|| ConfigError::MissingImage(family.to_string()))?;
        let spec = TemplateSpec {
            family: family.to_string(),
            shape: request.shape,
            execution_role: self.config.execution_role.clone(),
            task_role: self.config.task_role.clone(),
            container: ContainerSpec {
                name: self.config.container_name.clone(),
                image,
                port: None,
                env: Default::default(),
                log: Some(self.config.log.clone()),
            },
        };
        let template = retry
            .run("register_template", || {
                self.orchestrator.register_template(&spec)
            })
            .await?;
        info!(template = %template.id(), image = %spec.container.image, "Registered template revision");
        Ok(template)
    }

    /// Poll until the job stops or the poll budget runs out, then look once more.
    async fn wait_for_stop(&self, job_id: &str) -> Option<Job> {
        let poll = self.config.poll;
        for attempt in 0..poll.max_attempts {
            match self.orchestrator.describe_job(job_id).await {
                Ok(Some(job)) if job.status.is_terminal() => return Some(job),
                Ok(Some(job)) => debug!(job_id, attempt, status = ?job.status, "Job not stopped yet"),
                Ok(None) => debug!(job_id, attempt, "Job not visible yet"),
                Err(e) => warn!(job_id, attempt, error = %e, "Failed to describe job"),
            }
            tokio::time::sleep(poll.interval).await;
        }

        warn!(job_id, "Gave up waiting for job to stop, inspecting it directly");
        match self
            .config
            .retry
            .run("describe_job", || self.orchestrator.describe_job(job_id))
            .await
        {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id, error = %e, "Failed to describe job");
                None
            }
        }
    }

    /// Read the job's log stream head to tail, keeping the last lines.
    async fn tail_logs(
        &self,
        template: &TaskTemplate,
        job: &Job,
        diagnostics: &mut Vec<String>,
    ) -> Vec<String> {
        let Some(log) = &template.spec.container.log else {
            diagnostics.push(format!("template {} has no log routing", template.id()));
            return Vec::new();
        };
        let stream = log.stream_name(&template.spec.container.name, &job.id);
        let keep = self.config.log_tail_lines;

        let mut tail = VecDeque::with_capacity(keep.min(1024));
        let mut token: Option<String> = None;
        for _ in 0..MAX_LOG_PAGES {
            let page = match self
                .config
                .retry
                .run("fetch_logs", || {
                    self.logs.fetch_page(&log.group, &stream, token.as_deref())
                })
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(job_id = %job.id, stream = %stream, error = %e, "Failed to fetch job logs");
                    diagnostics.push(format!("unable to fetch logs: {e}"));
                    break;
                }
            };

            for line in page.lines {
                if tail.len() == keep {
                    tail.pop_front();
                }
                if keep > 0 {
                    tail.push_back(line);
                }
            }
            if page.next_token.is_none() || page.next_token == token {
                break;
            }
            token = page.next_token;
        }

        tail.into()
    }
}
