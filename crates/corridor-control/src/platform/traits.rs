// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Platform trait definitions.
//!
//! Defines the abstract control APIs the control plane drives: the container
//! orchestrator, the service discovery namespace and the log sink.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes a control API uses for throttling, overload or internal errors.
const TRANSIENT_CODES: &[&str] = &[
    "ThrottlingException",
    "Throttling",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalFailure",
    "InternalServerError",
    "ServerException",
    "RequestTimeout",
    "RequestTimeoutException",
];

/// Errors from platform control API calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PlatformError {
    /// The control API could not be reached.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The request did not complete in time.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The control API rejected the request.
    #[error("{code}: {message}")]
    Api {
        /// Error code reported by the platform.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// The addressed resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl PlatformError {
    /// Create an API error from a code and message.
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Should this call be retried?
    ///
    /// Connectivity and timeout failures are transient, as are API errors
    /// carrying a throttling, overload or internal-error code. Everything
    /// else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Connection(_) | PlatformError::Timeout(_) => true,
            PlatformError::Api { code, .. } => TRANSIENT_CODES.contains(&code.as_str()),
            PlatformError::NotFound(_) | PlatformError::AlreadyExists(_) => false,
        }
    }

    /// Whether the resource was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

/// Result type for platform operations.
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

// ============================================================================
// Templates
// ============================================================================

/// CPU and memory reservation of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceShape {
    /// CPU units (1024 = one vCPU).
    pub cpu: u32,
    /// Memory in MiB.
    pub memory_mib: u32,
}

impl ResourceShape {
    /// Create a resource shape.
    pub fn new(cpu: u32, memory_mib: u32) -> Self {
        Self { cpu, memory_mib }
    }
}

/// Where a container's stdout/stderr is shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log group.
    pub group: String,
    /// Region of the log group.
    pub region: String,
    /// Stream prefix; streams are named `<prefix>/<container>/<job id>`.
    pub stream_prefix: String,
}

impl LogConfig {
    /// Name of the stream a job's container writes to.
    pub fn stream_name(&self, container: &str, job_id: &str) -> String {
        format!("{}/{}/{}", self.stream_prefix, container, job_id)
    }
}

/// The single essential container of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// TCP port the container listens on.
    pub port: Option<u16>,
    /// Environment baked into the template.
    pub env: BTreeMap<String, String>,
    /// Log routing.
    pub log: Option<LogConfig>,
}

/// Everything needed to register a template revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Template family.
    pub family: String,
    /// Resource reservation.
    pub shape: ResourceShape,
    /// Identity used by the platform to pull images and ship logs.
    pub execution_role: Option<String>,
    /// Identity assumed by the running container.
    pub task_role: Option<String>,
    /// The container.
    pub container: ContainerSpec,
}

/// An immutable, registered template revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Revision number, increasing per family.
    pub revision: u32,
    /// Registered contents.
    pub spec: TemplateSpec,
}

impl TaskTemplate {
    /// Template family.
    pub fn family(&self) -> &str {
        &self.spec.family
    }

    /// `family:revision` identifier.
    pub fn id(&self) -> String {
        format!("{}:{}", self.spec.family, self.revision)
    }
}

/// Reference to a template: a whole family (latest active revision) or one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateRef {
    /// Latest active revision of the family, registering one if needed.
    Family(String),
    /// A concrete revision.
    Revision {
        /// Template family.
        family: String,
        /// Revision number.
        revision: u32,
    },
}

impl TemplateRef {
    /// Template family.
    pub fn family(&self) -> &str {
        match self {
            TemplateRef::Family(family) => family,
            TemplateRef::Revision { family, .. } => family,
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Network placement for tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Subnets tasks are placed in.
    pub subnets: Vec<String>,
    /// Security groups attached to task interfaces.
    pub security_groups: Vec<String>,
    /// Whether tasks get a public address.
    pub assign_public_ip: bool,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted, not yet placed.
    Provisioning,
    /// Placed, container starting.
    Pending,
    /// Container running.
    Running,
    /// Terminal.
    Stopped,
}

impl JobStatus {
    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Stopped)
    }
}

/// A task run by the orchestrator, either one-off or on behalf of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque job handle.
    pub id: String,
    /// `family:revision` the job runs.
    pub template_id: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Exit code of the essential container, once terminal.
    pub exit_code: Option<i32>,
    /// Why the platform stopped the job.
    pub stopped_reason: Option<String>,
    /// Service that launched the job, if any.
    pub service: Option<String>,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
}

/// Request to launch one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunJobRequest {
    /// `family:revision` to run.
    pub template_id: String,
    /// Container the overrides apply to.
    pub container: String,
    /// Per-run environment overrides.
    pub env: BTreeMap<String, String>,
    /// Network placement.
    pub network: NetworkConfig,
}

/// Outcome of a launch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The job was accepted.
    Launched(Job),
    /// The platform reported placement failures instead of a job.
    Rejected(Vec<String>),
}

// ============================================================================
// Services
// ============================================================================

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Serving.
    Active,
    /// Deletion in progress.
    Draining,
    /// Deleted; the name is free again.
    Inactive,
}

/// Rollout policy of a service deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPolicy {
    /// Lower bound of healthy replicas during a rollout, percent of desired.
    pub minimum_healthy_percent: u32,
    /// Upper bound of replicas during a rollout, percent of desired.
    pub maximum_percent: u32,
    /// Whether the platform's deployment circuit breaker is on.
    pub circuit_breaker: bool,
    /// Whether a tripped breaker rolls back to the last good revision.
    pub rollback: bool,
}

impl DeploymentPolicy {
    /// Stop old replicas before starting new ones, roll back on failure.
    ///
    /// Replicas bind a fixed port, so old and new must never overlap.
    pub fn replace_with_rollback() -> Self {
        Self {
            minimum_healthy_percent: 0,
            maximum_percent: 100,
            circuit_breaker: true,
            rollback: true,
        }
    }
}

/// A long-running, replica-managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service name.
    pub name: String,
    /// Lifecycle state.
    pub status: ServiceStatus,
    /// Requested replicas.
    pub desired_count: u32,
    /// Replicas currently running, across all deployments.
    pub running_count: u32,
    /// Running replicas of the primary deployment only.
    pub primary_running_count: u32,
    /// `family:revision` of the primary deployment.
    pub template_id: String,
    /// Attached discovery registration.
    pub registration_id: Option<String>,
    /// Number of deployments started, including the initial one.
    pub deployments: u32,
}

impl Service {
    /// Whether the service exists from the caller's point of view.
    pub fn is_live(&self) -> bool {
        self.status != ServiceStatus::Inactive
    }
}

/// Request to create a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateServiceRequest {
    /// Service name.
    pub name: String,
    /// `family:revision` to run.
    pub template_id: String,
    /// Requested replicas.
    pub desired_count: u32,
    /// Network placement.
    pub network: NetworkConfig,
    /// Registration to attach.
    pub registration_id: Option<String>,
    /// Rollout policy.
    pub deployment: DeploymentPolicy,
    /// Allow interactive commands in running containers.
    pub enable_execute_command: bool,
}

/// Request to update a service in place. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateServiceRequest {
    /// Service name.
    pub name: String,
    /// New `family:revision`.
    pub template_id: Option<String>,
    /// New replica count.
    pub desired_count: Option<u32>,
    /// Roll replicas even if nothing else changed.
    pub force_new_deployment: bool,
    /// New rollout policy.
    pub deployment: Option<DeploymentPolicy>,
    /// Registration to attach.
    pub registration_id: Option<String>,
}

impl UpdateServiceRequest {
    /// Only change the replica count.
    pub fn scale(name: impl Into<String>, desired_count: u32) -> Self {
        Self {
            name: name.into(),
            desired_count: Some(desired_count),
            ..Default::default()
        }
    }
}

// ============================================================================
// Discovery and logs
// ============================================================================

/// Request to register a name in the discovery namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    /// Name to register; always the service name.
    pub name: String,
    /// Namespace the name lives in.
    pub namespace_id: String,
    /// TTL of the A records.
    pub dns_ttl_secs: u32,
    /// Failed health checks before an address is withdrawn.
    pub failure_threshold: u32,
}

impl RegistrationRequest {
    /// Multivalue A records with a short TTL.
    pub fn new(name: impl Into<String>, namespace_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace_id: namespace_id.into(),
            dns_ttl_secs: 10,
            failure_threshold: 1,
        }
    }
}

/// A name registered in the discovery namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Registration id, attached to the service.
    pub id: String,
    /// Registered name.
    pub name: String,
    /// Namespace.
    pub namespace_id: String,
}

/// One page of log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogPage {
    /// Lines, oldest first.
    pub lines: Vec<String>,
    /// Token for the next page; equals the request token once the end is reached.
    pub next_token: Option<String>,
}

// ============================================================================
// Traits
// ============================================================================

/// Container orchestration control API, bound to one cluster.
///
/// Implementations are PURE API clients: no retries, no idempotence logic.
/// Both are layered on top by the control plane.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Register a new immutable revision of `spec.family`.
    async fn register_template(&self, spec: &TemplateSpec) -> PlatformResult<TaskTemplate>;

    /// Latest active revision of a family.
    async fn latest_template(&self, family: &str) -> PlatformResult<Option<TaskTemplate>>;

    /// A specific revision.
    async fn describe_template(
        &self,
        family: &str,
        revision: u32,
    ) -> PlatformResult<Option<TaskTemplate>>;

    /// Launch exactly one job.
    async fn run_job(&self, request: &RunJobRequest) -> PlatformResult<LaunchOutcome>;

    /// Current state of a job.
    async fn describe_job(&self, job_id: &str) -> PlatformResult<Option<Job>>;

    /// Jobs launched by a service with the given status.
    async fn list_service_jobs(&self, service: &str, status: JobStatus)
    -> PlatformResult<Vec<Job>>;

    /// Current state of a service, including inactive ones.
    async fn describe_service(&self, name: &str) -> PlatformResult<Option<Service>>;

    /// All services in the cluster.
    async fn list_services(&self) -> PlatformResult<Vec<Service>>;

    /// Create a service. Fails with `AlreadyExists` if a live one has the name.
    async fn create_service(&self, request: &CreateServiceRequest) -> PlatformResult<Service>;

    /// Update a live service in place.
    async fn update_service(&self, request: &UpdateServiceRequest) -> PlatformResult<Service>;

    /// Delete a service. Fails with `NotFound` if none is live.
    async fn delete_service(&self, name: &str) -> PlatformResult<()>;

    /// Whether a registration can be attached when the service is created.
    ///
    /// When false, the reconciler creates the service bare and attaches the
    /// registration with a follow-up update.
    fn attaches_registry_on_create(&self) -> bool {
        true
    }
}

/// Service discovery control API, bound to one namespace.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Namespace name, the suffix of every discoverable name.
    async fn namespace_name(&self) -> PlatformResult<String>;

    /// Register a name. Fails with `AlreadyExists` if it is taken.
    async fn create_registration(
        &self,
        request: &RegistrationRequest,
    ) -> PlatformResult<Registration>;

    /// Look a registration up by name.
    async fn find_registration(&self, name: &str) -> PlatformResult<Option<Registration>>;

    /// Remove a registration. Fails with `NotFound` if absent.
    async fn delete_registration(&self, id: &str) -> PlatformResult<()>;

    /// Register a name, or return the existing registration for it.
    async fn create_or_get(&self, request: &RegistrationRequest) -> PlatformResult<Registration> {
        match self.create_registration(request).await {
            Err(PlatformError::AlreadyExists(_)) => self
                .find_registration(&request.name)
                .await?
                .ok_or_else(|| PlatformError::NotFound(request.name.clone())),
            other => other,
        }
    }
}

/// Paginated log retrieval.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Fetch a page of a stream, oldest first.
    async fn fetch_page(
        &self,
        group: &str,
        stream: &str,
        token: Option<&str>,
    ) -> PlatformResult<LogPage>;
}
