// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router service reconciliation.
//!
//! `ensure` drives one scenario's service to the requested image, environment
//! and replica count:
//!
//! 1. create or reuse the discovery registration named after the service
//! 2. fetch the latest base template of the router family
//! 3. register a derived revision (env overlay, image, port, log routing)
//! 4. update the live service in place, or create it
//! 5. read the service back and return the revision it runs together with
//!    the discoverable name, without waiting for health
//!
//! Every step is idempotent against the remote control plane, so repeated or
//! concurrent calls for one scenario converge on one service and one
//! registration. There is no local lock.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::env_overlay::{EnvOverlay, REGION_VAR, SCENARIO_ID_VAR};
use crate::error::Result;
use crate::naming::ServiceName;
use crate::platform::{
    CreateServiceRequest, DeploymentPolicy, Discovery, LogConfig, NetworkConfig, Orchestrator,
    PlatformError, Registration, RegistrationRequest, Service, TaskTemplate, TemplateSpec,
    UpdateServiceRequest,
};
use crate::retry::RetryPolicy;

/// Configuration for the service reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Discovery namespace for registrations.
    pub namespace_id: String,
    /// Service name prefix.
    pub service_prefix: String,
    /// Region injected into the container environment.
    pub region: String,
    /// Network placement of replicas.
    pub network: NetworkConfig,
    /// Log routing of derived revisions.
    pub log: LogConfig,
    /// Rollout policy for creates and updates.
    pub deployment: DeploymentPolicy,
    /// Backoff for every remote call.
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            namespace_id: String::new(),
            service_prefix: "router".to_string(),
            region: "ap-northeast-1".to_string(),
            network: NetworkConfig::default(),
            log: LogConfig {
                group: "/corridor/router".to_string(),
                region: "ap-northeast-1".to_string(),
                stream_prefix: "router".to_string(),
            },
            deployment: DeploymentPolicy::replace_with_rollback(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Derive from the control plane configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace_id: config.namespace_id.clone(),
            service_prefix: config.service_prefix.clone(),
            region: config.region.clone(),
            network: config.network.clone(),
            log: LogConfig {
                group: config.router_log_group.clone(),
                region: config.region.clone(),
                stream_prefix: "router".to_string(),
            },
            retry: RetryPolicy::new(config.retry_attempts, config.retry_base, config.retry_cap),
            ..Self::default()
        }
    }
}

/// Desired state of one scenario's service.
#[derive(Debug, Clone)]
pub struct EnsureRequest {
    /// Scenario the service serves.
    pub scenario_id: String,
    /// Family of the pre-provisioned base template.
    pub template_family: String,
    /// Image override; the base template's image otherwise.
    pub image: Option<String>,
    /// Caller environment overrides.
    pub env: EnvOverlay,
    /// Requested replicas.
    pub desired_count: u32,
    /// Port the router listens on.
    pub port: u16,
}

/// What `ensure` rolled out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deployment {
    /// Scenario id.
    pub scenario_id: String,
    /// Service name.
    pub service: String,
    /// Discoverable network name (`<service>.<namespace>`).
    pub dns_name: String,
    /// `family:revision` the service runs, as read back after the write.
    pub template_id: String,
    /// Whether this call created the service.
    pub created: bool,
}

/// Creates or updates router services.
pub struct ServiceReconciler {
    orchestrator: Arc<dyn Orchestrator>,
    discovery: Arc<dyn Discovery>,
    config: ReconcilerConfig,
}

impl ServiceReconciler {
    /// Create a new reconciler.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        discovery: Arc<dyn Discovery>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            orchestrator,
            discovery,
            config,
        }
    }

    /// Service name for a scenario.
    pub fn service_name(&self, scenario_id: &str) -> std::result::Result<ServiceName, ConfigError> {
        ServiceName::for_scenario(&self.config.service_prefix, scenario_id)
    }

    /// Ensure the scenario's service exists and runs a fresh revision.
    pub async fn ensure(&self, request: &EnsureRequest) -> Result<Deployment> {
        let name = self.service_name(&request.scenario_id)?;
        let retry = self.config.retry;

        let registration_request =
            RegistrationRequest::new(name.as_str(), &self.config.namespace_id);
        let registration = retry
            .run("create_registration", || {
                self.discovery.create_or_get(&registration_request)
            })
            .await?;
        debug!(service = %name, registration = %registration.id, "Registration ready");

        let family = request.template_family.as_str();
        let base = retry
            .run("latest_template", || self.orchestrator.latest_template(family))
            .await?
            .ok_or_else(|| ConfigError::MissingBaseTemplate(family.to_string()))?;

        let spec = self.derive_spec(&base, request);
        let template = retry
            .run("register_template", || {
                self.orchestrator.register_template(&spec)
            })
            .await?;
        info!(
            scenario_id = %request.scenario_id,
            base = %base.id(),
            revision = %template.id(),
            "Registered service revision"
        );

        let existing = retry
            .run("describe_service", || {
                self.orchestrator.describe_service(name.as_str())
            })
            .await?
            .filter(Service::is_live);

        let (service, created) = match existing {
            Some(existing) => {
                let service = self
                    .update(&name, &template, request.desired_count, &registration, Some(&existing))
                    .await?;
                (service, false)
            }
            None => {
                self.create(&name, &template, request.desired_count, &registration)
                    .await?
            }
        };

        // A concurrent ensure may have rolled the service on since our write.
        let template_id = match retry
            .run("describe_service", || {
                self.orchestrator.describe_service(name.as_str())
            })
            .await
        {
            Ok(Some(current)) if current.is_live() => current.template_id,
            Ok(_) => service.template_id.clone(),
            Err(e) => {
                warn!(service = %name, error = %e, "Failed to re-read service revision");
                service.template_id.clone()
            }
        };
        if template_id != service.template_id {
            warn!(
                service = %name,
                written = %service.template_id,
                current = %template_id,
                "Service revision superseded by a concurrent ensure"
            );
        }

        let namespace = retry
            .run("namespace_name", || self.discovery.namespace_name())
            .await?;
        let dns_name = name.discoverable(&namespace);

        info!(
            scenario_id = %request.scenario_id,
            service = %name,
            revision = %template_id,
            desired_count = service.desired_count,
            created,
            dns_name = %dns_name,
            "Service reconciled"
        );

        Ok(Deployment {
            scenario_id: request.scenario_id.clone(),
            service: name.to_string(),
            dns_name,
            template_id,
            created,
        })
    }

    /// Clone the base revision with this scenario's container settings.
    fn derive_spec(&self, base: &TaskTemplate, request: &EnsureRequest) -> TemplateSpec {
        let overlay = request
            .env
            .clone()
            .with_system(SCENARIO_ID_VAR, &request.scenario_id)
            .with_system(REGION_VAR, &self.config.region);

        let mut spec = base.spec.clone();
        spec.container.env = overlay.apply(&base.spec.container.env);
        if let Some(image) = &request.image {
            spec.container.image = image.clone();
        }
        spec.container.port = Some(request.port);
        spec.container.log = Some(self.config.log.clone());
        spec
    }

    /// Create the service; falls back to an update if another caller won the race.
    async fn create(
        &self,
        name: &ServiceName,
        template: &TaskTemplate,
        desired_count: u32,
        registration: &Registration,
    ) -> Result<(Service, bool)> {
        let attach = self.orchestrator.attaches_registry_on_create();
        let request = CreateServiceRequest {
            name: name.to_string(),
            template_id: template.id(),
            desired_count,
            network: self.config.network.clone(),
            registration_id: attach.then(|| registration.id.clone()),
            deployment: self.config.deployment,
            enable_execute_command: true,
        };

        match self
            .config
            .retry
            .run("create_service", || {
                self.orchestrator.create_service(&request)
            })
            .await
        {
            Ok(service) if attach => Ok((service, true)),
            Ok(service) => {
                debug!(service = %name, "Attaching registration after create");
                let service = self
                    .update(name, template, desired_count, registration, Some(&service))
                    .await?;
                Ok((service, true))
            }
            Err(PlatformError::AlreadyExists(_)) => {
                warn!(service = %name, "Service appeared concurrently, updating instead");
                let service = self
                    .update(name, template, desired_count, registration, None)
                    .await?;
                Ok((service, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Point the live service at `template` and force a fresh rollout.
    async fn update(
        &self,
        name: &ServiceName,
        template: &TaskTemplate,
        desired_count: u32,
        registration: &Registration,
        current: Option<&Service>,
    ) -> Result<Service> {
        let attached = current
            .and_then(|s| s.registration_id.as_deref())
            .is_some_and(|id| id == registration.id);

        let request = UpdateServiceRequest {
            name: name.to_string(),
            template_id: Some(template.id()),
            desired_count: Some(desired_count),
            force_new_deployment: true,
            deployment: Some(self.config.deployment),
            registration_id: (!attached).then(|| registration.id.clone()),
        };

        let service = self
            .config
            .retry
            .run("update_service", || {
                self.orchestrator.update_service(&request)
            })
            .await?;
        Ok(service)
    }
}
