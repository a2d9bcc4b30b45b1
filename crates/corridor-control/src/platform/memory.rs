// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory platform.
//!
//! Implements the orchestrator, discovery and log sink APIs over process
//! memory. Jobs and services are simulated: one-off jobs stop after a
//! configurable number of polls with a scripted exit code, services converge
//! to their desired count immediately unless their image is marked failing,
//! in which case every poll of their stopped jobs observes a new crash.
//!
//! Faults can be injected per operation to exercise retry and isolation paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::traits::*;

/// Scripted result of the next one-off job.
#[derive(Debug, Clone, Default)]
pub struct JobScript {
    /// Exit code reported once the job stops. `None` simulates a missing code.
    pub exit_code: Option<i32>,
    /// Lines written to the job's log stream.
    pub logs: Vec<String>,
}

impl JobScript {
    /// A job that exits with `code` after writing `logs`.
    pub fn exits(code: i32, logs: &[&str]) -> Self {
        Self {
            exit_code: Some(code),
            logs: logs.iter().map(|l| l.to_string()).collect(),
        }
    }
}

#[derive(Default)]
struct State {
    templates: HashMap<String, Vec<TaskTemplate>>,
    jobs: Vec<Job>,
    job_results: HashMap<String, (u32, Option<i32>)>,
    job_scripts: VecDeque<JobScript>,
    launch_rejections: VecDeque<Vec<String>>,
    run_requests: Vec<RunJobRequest>,
    create_requests: Vec<CreateServiceRequest>,
    update_requests: Vec<UpdateServiceRequest>,
    job_polls: u32,
    services: HashMap<String, Service>,
    draining: HashMap<String, u32>,
    drain_polls: u32,
    // Replicas of a replaced revision still counted, with the polls left.
    previous_replicas: HashMap<String, (u32, u32)>,
    overlap_polls: u32,
    failing_images: HashSet<String>,
    registrations: HashMap<String, Registration>,
    next_registration: u64,
    logs: HashMap<(String, String), Vec<String>>,
    faults: HashMap<&'static str, VecDeque<PlatformError>>,
    calls: HashMap<&'static str, usize>,
}

impl State {
    fn template(&self, template_id: &str) -> Option<&TaskTemplate> {
        let (family, revision) = template_id.rsplit_once(':')?;
        let revision: u32 = revision.parse().ok()?;
        self.templates
            .get(family)?
            .iter()
            .find(|t| t.revision == revision)
    }

    fn image_fails(&self, template_id: &str) -> bool {
        self.template(template_id)
            .map(|t| self.failing_images.contains(&t.spec.container.image))
            .unwrap_or(false)
    }

    fn converge(&mut self, name: &str) {
        let Some(service) = self.services.get(name) else {
            return;
        };
        let failing = self.image_fails(&service.template_id);
        let desired = service.desired_count;
        let running = service.primary_running_count;

        let next = if failing {
            0
        } else if desired < running && self.drain_polls > 0 {
            self.draining.insert(name.to_string(), self.drain_polls);
            running
        } else {
            desired
        };
        let previous = self.previous_replicas.get(name).map_or(0, |(_, n)| *n);
        if let Some(service) = self.services.get_mut(name) {
            service.primary_running_count = next;
            service.running_count = next + previous;
        }
    }
}

/// In-memory orchestrator, discovery namespace and log sink.
pub struct MemoryPlatform {
    state: Arc<Mutex<State>>,
    namespace_name: String,
    attaches_registry_on_create: bool,
    log_page_size: usize,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new("corridor.local")
    }
}

impl MemoryPlatform {
    /// Create a platform whose discovery namespace is `namespace_name`.
    pub fn new(namespace_name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            namespace_name: namespace_name.into(),
            attaches_registry_on_create: true,
            log_page_size: 50,
        }
    }

    /// A platform that rejects registrations on service creation.
    pub fn without_registry_on_create(mut self) -> Self {
        self.attaches_registry_on_create = false;
        self
    }

    /// Set how many log lines one page holds.
    pub fn with_log_page_size(mut self, size: usize) -> Self {
        self.log_page_size = size.max(1);
        self
    }

    async fn enter(&self, op: &'static str) -> PlatformResult<MutexGuard<'_, State>> {
        // Let concurrent callers interleave between API calls.
        tokio::task::yield_now().await;
        let mut state = self.state.lock().await;
        *state.calls.entry(op).or_default() += 1;
        if let Some(err) = state.faults.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }

    /// Fail the next call of `op` with `error`. Faults queue up per operation.
    pub async fn inject_fault(&self, op: &'static str, error: PlatformError) {
        let mut state = self.state.lock().await;
        state.faults.entry(op).or_default().push_back(error);
    }

    /// Number of calls made to `op`, including faulted ones.
    pub async fn calls(&self, op: &str) -> usize {
        let state = self.state.lock().await;
        state.calls.get(op).copied().unwrap_or(0)
    }

    /// Script the result of the next launched job.
    pub async fn push_job_script(&self, script: JobScript) {
        self.state.lock().await.job_scripts.push_back(script);
    }

    /// Reject the next launch with placement failures.
    pub async fn reject_next_launch(&self, failures: &[&str]) {
        let failures = failures.iter().map(|f| f.to_string()).collect();
        self.state.lock().await.launch_rejections.push_back(failures);
    }

    /// Number of polls a one-off job reports as running before it stops.
    pub async fn set_job_polls(&self, polls: u32) {
        self.state.lock().await.job_polls = polls;
    }

    /// Number of service polls a scale-down takes to drain. `u32::MAX` never drains.
    pub async fn set_drain_polls(&self, polls: u32) {
        self.state.lock().await.drain_polls = polls;
    }

    /// Number of service polls the replicas of a replaced revision keep
    /// counting towards `running_count` after a redeploy.
    pub async fn set_overlap_polls(&self, polls: u32) {
        self.state.lock().await.overlap_polls = polls;
    }

    /// Make every replica of `image` crash on start.
    pub async fn fail_image(&self, image: &str) {
        self.state
            .lock()
            .await
            .failing_images
            .insert(image.to_string());
    }

    /// Register a template out of band, as an operator would for base templates.
    pub async fn seed_template(&self, spec: TemplateSpec) -> TaskTemplate {
        let mut state = self.state.lock().await;
        register(&mut state, spec)
    }

    /// Snapshot of a service.
    pub async fn service(&self, name: &str) -> Option<Service> {
        self.state.lock().await.services.get(name).cloned()
    }

    /// Snapshot of all services.
    pub async fn services(&self) -> Vec<Service> {
        let state = self.state.lock().await;
        let mut services: Vec<_> = state.services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Snapshot of all registrations.
    pub async fn registrations(&self) -> Vec<Registration> {
        let state = self.state.lock().await;
        let mut registrations: Vec<_> = state.registrations.values().cloned().collect();
        registrations.sort_by(|a, b| a.name.cmp(&b.name));
        registrations
    }

    /// All revisions of a family.
    pub async fn templates(&self, family: &str) -> Vec<TaskTemplate> {
        let state = self.state.lock().await;
        state.templates.get(family).cloned().unwrap_or_default()
    }

    /// Launch requests received so far.
    pub async fn run_requests(&self) -> Vec<RunJobRequest> {
        self.state.lock().await.run_requests.clone()
    }

    /// Service create requests received so far.
    pub async fn create_requests(&self) -> Vec<CreateServiceRequest> {
        self.state.lock().await.create_requests.clone()
    }

    /// Service update requests received so far.
    pub async fn update_requests(&self) -> Vec<UpdateServiceRequest> {
        self.state.lock().await.update_requests.clone()
    }

    /// Append lines to a log stream.
    pub async fn append_logs(&self, group: &str, stream: &str, lines: &[&str]) {
        let mut state = self.state.lock().await;
        state
            .logs
            .entry((group.to_string(), stream.to_string()))
            .or_default()
            .extend(lines.iter().map(|l| l.to_string()));
    }

    /// Update a service directly, bypassing fault injection.
    pub async fn set_desired_count(&self, name: &str, desired_count: u32) {
        let mut state = self.state.lock().await;
        if let Some(service) = state.services.get_mut(name) {
            service.desired_count = desired_count;
        }
        state.converge(name);
    }
}

fn register(state: &mut State, spec: TemplateSpec) -> TaskTemplate {
    let revisions = state.templates.entry(spec.family.clone()).or_default();
    let revision = revisions.last().map(|t| t.revision + 1).unwrap_or(1);
    let template = TaskTemplate { revision, spec };
    revisions.push(template.clone());
    template
}

#[async_trait]
impl Orchestrator for MemoryPlatform {
    async fn register_template(&self, spec: &TemplateSpec) -> PlatformResult<TaskTemplate> {
        let mut state = self.enter("register_template").await?;
        Ok(register(&mut state, spec.clone()))
    }

    async fn latest_template(&self, family: &str) -> PlatformResult<Option<TaskTemplate>> {
        let state = self.enter("latest_template").await?;
        Ok(state.templates.get(family).and_then(|t| t.last().cloned()))
    }

    async fn describe_template(
        &self,
        family: &str,
        revision: u32,
    ) -> PlatformResult<Option<TaskTemplate>> {
        let state = self.enter("describe_template").await?;
        Ok(state.template(&format!("{family}:{revision}")).cloned())
    }

    async fn run_job(&self, request: &RunJobRequest) -> PlatformResult<LaunchOutcome> {
        let mut state = self.enter("run_job").await?;
        state.run_requests.push(request.clone());

        if let Some(failures) = state.launch_rejections.pop_front() {
            return Ok(LaunchOutcome::Rejected(failures));
        }
        let Some(template) = state.template(&request.template_id).cloned() else {
            return Err(PlatformError::api(
                "InvalidParameterException",
                format!("Unable to find task definition {}", request.template_id),
            ));
        };

        let script = state.job_scripts.pop_front().unwrap_or(JobScript {
            exit_code: Some(0),
            logs: Vec::new(),
        });
        let job = Job {
            id: Uuid::new_v4().to_string(),
            template_id: request.template_id.clone(),
            status: JobStatus::Provisioning,
            exit_code: None,
            stopped_reason: None,
            service: None,
            created_at: Utc::now(),
        };

        if let Some(log) = &template.spec.container.log {
            let stream = log.stream_name(&template.spec.container.name, &job.id);
            state
                .logs
                .entry((log.group.clone(), stream))
                .or_default()
                .extend(script.logs);
        }
        let polls = state.job_polls;
        state
            .job_results
            .insert(job.id.clone(), (polls, script.exit_code));
        state.jobs.push(job.clone());

        Ok(LaunchOutcome::Launched(job))
    }

    async fn describe_job(&self, job_id: &str) -> PlatformResult<Option<Job>> {
        let mut state = self.enter("describe_job").await?;

        let transition = match state.job_results.get_mut(job_id) {
            Some((0, exit_code)) => Some((JobStatus::Stopped, *exit_code)),
            Some((remaining, _)) => {
                *remaining -= 1;
                Some((JobStatus::Running, None))
            }
            None => None,
        };

        let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(None);
        };
        if let Some((status, exit_code)) = transition
            && !job.status.is_terminal()
        {
            job.status = status;
            if status.is_terminal() {
                job.exit_code = exit_code;
                job.stopped_reason = Some("Essential container in task exited".to_string());
            }
        }
        Ok(Some(job.clone()))
    }

    async fn list_service_jobs(
        &self,
        service: &str,
        status: JobStatus,
    ) -> PlatformResult<Vec<Job>> {
        let mut state = self.enter("list_service_jobs").await?;

        // A crash-looping service has lost another replica since the last look.
        if let Some(svc) = state.services.get(service).cloned()
            && svc.is_live()
            && svc.desired_count > 0
            && state.image_fails(&svc.template_id)
        {
            state.jobs.push(Job {
                id: Uuid::new_v4().to_string(),
                template_id: svc.template_id.clone(),
                status: JobStatus::Stopped,
                exit_code: Some(1),
                stopped_reason: Some("Essential container in task exited".to_string()),
                service: Some(service.to_string()),
                created_at: Utc::now(),
            });
        }

        Ok(state
            .jobs
            .iter()
            .filter(|j| j.service.as_deref() == Some(service) && j.status == status)
            .cloned()
            .collect())
    }

    async fn describe_service(&self, name: &str) -> PlatformResult<Option<Service>> {
        let mut state = self.enter("describe_service").await?;

        let replaced = match state.previous_replicas.get_mut(name) {
            Some((0, replicas)) => Some(*replicas),
            Some((remaining, _)) => {
                *remaining -= 1;
                None
            }
            None => None,
        };
        if let Some(replicas) = replaced {
            state.previous_replicas.remove(name);
            if let Some(service) = state.services.get_mut(name) {
                service.running_count = service.running_count.saturating_sub(replicas);
            }
        }

        let drained = match state.draining.get_mut(name) {
            Some(remaining) if *remaining == u32::MAX => false,
            Some(remaining) if *remaining > 1 => {
                *remaining -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if drained {
            state.draining.remove(name);
            if let Some(service) = state.services.get_mut(name) {
                service.running_count = service.desired_count;
                service.primary_running_count = service.desired_count;
            }
        }
        Ok(state.services.get(name).cloned())
    }

    async fn list_services(&self) -> PlatformResult<Vec<Service>> {
        let state = self.enter("list_services").await?;
        let mut services: Vec<_> = state
            .services
            .values()
            .filter(|s| s.is_live())
            .cloned()
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn create_service(&self, request: &CreateServiceRequest) -> PlatformResult<Service> {
        let mut state = self.enter("create_service").await?;
        state.create_requests.push(request.clone());

        if state
            .services
            .get(&request.name)
            .is_some_and(Service::is_live)
        {
            return Err(PlatformError::AlreadyExists(request.name.clone()));
        }
        if request.registration_id.is_some() && !self.attaches_registry_on_create {
            return Err(PlatformError::api(
                "InvalidParameterException",
                "serviceRegistries cannot be set when creating this service",
            ));
        }
        if state.template(&request.template_id).is_none() {
            return Err(PlatformError::api(
                "InvalidParameterException",
                format!("Unable to find task definition {}", request.template_id),
            ));
        }

        state.services.insert(
            request.name.clone(),
            Service {
                name: request.name.clone(),
                status: ServiceStatus::Active,
                desired_count: request.desired_count,
                running_count: 0,
                primary_running_count: 0,
                template_id: request.template_id.clone(),
                registration_id: request.registration_id.clone(),
                deployments: 1,
            },
        );
        state.draining.remove(&request.name);
        state.previous_replicas.remove(&request.name);
        state.converge(&request.name);
        Ok(state.services[&request.name].clone())
    }

    async fn update_service(&self, request: &UpdateServiceRequest) -> PlatformResult<Service> {
        let mut state = self.enter("update_service").await?;
        state.update_requests.push(request.clone());

        if let Some(template_id) = &request.template_id
            && state.template(template_id).is_none()
        {
            return Err(PlatformError::api(
                "InvalidParameterException",
                format!("Unable to find task definition {template_id}"),
            ));
        }
        let Some(service) = state
            .services
            .get_mut(&request.name)
            .filter(|s| s.is_live())
        else {
            return Err(PlatformError::NotFound(request.name.clone()));
        };

        let mut redeploy = request.force_new_deployment;
        if let Some(template_id) = &request.template_id {
            redeploy |= *template_id != service.template_id;
            service.template_id = template_id.clone();
        }
        if let Some(count) = request.desired_count {
            service.desired_count = count;
        }
        if let Some(registration_id) = &request.registration_id {
            service.registration_id = Some(registration_id.clone());
        }
        let replaced = service.primary_running_count;
        if redeploy {
            service.deployments += 1;
        }

        let overlap = state.overlap_polls;
        if redeploy && overlap > 0 && replaced > 0 {
            state
                .previous_replicas
                .insert(request.name.clone(), (overlap, replaced));
        }
        state.converge(&request.name);
        Ok(state.services[&request.name].clone())
    }

    async fn delete_service(&self, name: &str) -> PlatformResult<()> {
        let mut state = self.enter("delete_service").await?;
        state.draining.remove(name);
        state.previous_replicas.remove(name);
        match state.services.get_mut(name).filter(|s| s.is_live()) {
            Some(service) => {
                service.status = ServiceStatus::Inactive;
                service.desired_count = 0;
                service.running_count = 0;
                service.primary_running_count = 0;
                Ok(())
            }
            None => Err(PlatformError::NotFound(name.to_string())),
        }
    }

    fn attaches_registry_on_create(&self) -> bool {
        self.attaches_registry_on_create
    }
}

#[async_trait]
impl Discovery for MemoryPlatform {
    async fn namespace_name(&self) -> PlatformResult<String> {
        let _state = self.enter("namespace_name").await?;
        Ok(self.namespace_name.clone())
    }

    async fn create_registration(
        &self,
        request: &RegistrationRequest,
    ) -> PlatformResult<Registration> {
        let mut state = self.enter("create_registration").await?;
        if state.registrations.contains_key(&request.name) {
            return Err(PlatformError::AlreadyExists(request.name.clone()));
        }
        state.next_registration += 1;
        let registration = Registration {
            id: format!("srv-{:06}", state.next_registration),
            name: request.name.clone(),
            namespace_id: request.namespace_id.clone(),
        };
        state
            .registrations
            .insert(request.name.clone(), registration.clone());
        Ok(registration)
    }

    async fn find_registration(&self, name: &str) -> PlatformResult<Option<Registration>> {
        let state = self.enter("find_registration").await?;
        Ok(state.registrations.get(name).cloned())
    }

    async fn delete_registration(&self, id: &str) -> PlatformResult<()> {
        let mut state = self.enter("delete_registration").await?;
        let name = state
            .registrations
            .values()
            .find(|r| r.id == id)
            .map(|r| r.name.clone())
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))?;
        state.registrations.remove(&name);
        Ok(())
    }
}

#[async_trait]
impl LogSink for MemoryPlatform {
    async fn fetch_page(
        &self,
        group: &str,
        stream: &str,
        token: Option<&str>,
    ) -> PlatformResult<LogPage> {
        let state = self.enter("fetch_page").await?;
        let Some(lines) = state.logs.get(&(group.to_string(), stream.to_string())) else {
            return Err(PlatformError::api(
                "ResourceNotFoundException",
                format!("The specified log stream does not exist: {stream}"),
            ));
        };

        let start = token
            .and_then(|t| t.strip_prefix("f/"))
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0)
            .min(lines.len());
        let end = (start + self.log_page_size).min(lines.len());

        Ok(LogPage {
            lines: lines[start..end].to_vec(),
            next_token: Some(format!("f/{end}")),
        })
    }
}
