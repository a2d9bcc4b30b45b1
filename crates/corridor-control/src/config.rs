// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for corridor-control.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::platform::{NetworkConfig, ResourceShape};

/// Control plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Region injected into every task environment and log routing.
    pub region: String,
    /// Cluster identity all tasks and services are placed in.
    pub cluster: String,
    /// Network placement for jobs and services.
    pub network: NetworkConfig,
    /// Discovery namespace that router registrations live in.
    pub namespace_id: String,
    /// Task family for build jobs.
    pub builder_family: String,
    /// Task family of the pre-provisioned router base template.
    pub router_family: String,
    /// Default builder image (required to register a builder revision).
    pub builder_image: Option<String>,
    /// Default router image override.
    pub router_image: Option<String>,
    /// Identity the platform uses to pull images and ship logs.
    pub execution_role: Option<String>,
    /// Identity the running containers assume.
    pub task_role: Option<String>,
    /// Log group for build job output.
    pub builder_log_group: String,
    /// Log group for router service output.
    pub router_log_group: String,
    /// Prefix for service names (`<prefix>-<scenario_id>`).
    pub service_prefix: String,
    /// Port routers listen on.
    pub router_port: u16,
    /// Time since last access before a service is scaled to zero.
    pub idle_window: Duration,
    /// Idle reaper tick interval.
    pub reaper_interval: Duration,
    /// Fail-loop observation window after a deploy.
    pub guard_window: Duration,
    /// Fail-loop poll interval.
    pub guard_poll_interval: Duration,
    /// Stopped tasks tolerated before a forced scale-down.
    pub guard_threshold: u32,
    /// Attempt budget for transient remote failures.
    pub retry_attempts: u32,
    /// Base backoff delay.
    pub retry_base: Duration,
    /// Backoff ceiling.
    pub retry_cap: Duration,
    /// Upper bound on waiting for a build job.
    pub job_timeout: Duration,
    /// Build job poll interval.
    pub job_poll_interval: Duration,
}

impl Config {
    /// Load a `.env` file if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("No .env file loaded: {}", e);
        }
        Self::from_env()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let region = var_or("CORRIDOR_REGION", "ap-northeast-1");
        let cluster = required("CORRIDOR_CLUSTER")?;
        let namespace_id = required("CORRIDOR_NAMESPACE_ID")?;

        let subnets = list("CORRIDOR_SUBNETS");
        if subnets.is_empty() {
            return Err(ConfigError::MissingEnvVar("CORRIDOR_SUBNETS"));
        }
        let security_groups = list("CORRIDOR_SECURITY_GROUPS");
        if security_groups.is_empty() {
            return Err(ConfigError::MissingEnvVar("CORRIDOR_SECURITY_GROUPS"));
        }
        let assign_public_ip = std::env::var("CORRIDOR_ASSIGN_PUBLIC_IP")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            region,
            cluster,
            network: NetworkConfig {
                subnets,
                security_groups,
                assign_public_ip,
            },
            namespace_id,
            builder_family: var_or("CORRIDOR_BUILDER_FAMILY", "builder"),
            router_family: var_or("CORRIDOR_ROUTER_FAMILY", "router"),
            builder_image: optional("CORRIDOR_BUILDER_IMAGE"),
            router_image: optional("CORRIDOR_ROUTER_IMAGE"),
            execution_role: optional("CORRIDOR_EXECUTION_ROLE"),
            task_role: optional("CORRIDOR_TASK_ROLE"),
            builder_log_group: var_or("CORRIDOR_BUILDER_LOG_GROUP", "/corridor/builder"),
            router_log_group: var_or("CORRIDOR_ROUTER_LOG_GROUP", "/corridor/router"),
            service_prefix: var_or("CORRIDOR_SERVICE_PREFIX", "router"),
            router_port: parsed("CORRIDOR_ROUTER_PORT", 8081)?,
            idle_window: secs("CORRIDOR_IDLE_WINDOW_SECS", 1800)?,
            reaper_interval: secs("CORRIDOR_REAPER_INTERVAL_SECS", 60)?,
            guard_window: secs("CORRIDOR_GUARD_WINDOW_SECS", 300)?,
            guard_poll_interval: secs("CORRIDOR_GUARD_POLL_SECS", 5)?,
            guard_threshold: parsed("CORRIDOR_GUARD_THRESHOLD", 3)?,
            retry_attempts: parsed::<u32>("CORRIDOR_RETRY_ATTEMPTS", 5)?.max(1),
            retry_base: Duration::from_millis(parsed("CORRIDOR_RETRY_BASE_MS", 500)?),
            retry_cap: Duration::from_millis(parsed("CORRIDOR_RETRY_CAP_MS", 20_000)?),
            job_timeout: secs("CORRIDOR_JOB_TIMEOUT_SECS", 4 * 3600)?,
            job_poll_interval: secs("CORRIDOR_JOB_POLL_SECS", 6)?,
        })
    }

    /// Resource shape for build jobs.
    pub fn builder_shape(&self) -> ResourceShape {
        ResourceShape::new(2048, 4096)
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::MissingEnvVar(name))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    optional(name).unwrap_or_else(|| default.to_string())
}

fn list(name: &str) -> Vec<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

fn secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parsed(name, default).map(Duration::from_secs)
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
    /// No image was supplied and no registered revision exists to fall back on.
    #[error("No image supplied and no active revision of task family {0}")]
    MissingImage(String),
    /// The base template for a service family was never provisioned.
    #[error("No active base template for task family {0}")]
    MissingBaseTemplate(String),
    /// The scenario id cannot be turned into a service name.
    #[error("Invalid scenario id {0:?}: use 1-63 lowercase letters, digits or '-'")]
    InvalidScenarioId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; keep every mutation in this one test.
    #[test]
    fn test_from_env() {
        // SAFETY: no other test in this crate touches CORRIDOR_* variables.
        unsafe {
            std::env::remove_var("CORRIDOR_CLUSTER");
            std::env::set_var("CORRIDOR_NAMESPACE_ID", "ns-123");
            std::env::set_var("CORRIDOR_SUBNETS", "subnet-a, subnet-b,");
            std::env::set_var("CORRIDOR_SECURITY_GROUPS", "sg-1");
        }
        assert_eq!(
            Config::from_env().unwrap_err(),
            ConfigError::MissingEnvVar("CORRIDOR_CLUSTER")
        );

        unsafe {
            std::env::set_var("CORRIDOR_CLUSTER", "cluster-1");
            std::env::set_var("CORRIDOR_ROUTER_PORT", "eighty");
        }
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue {
                name: "CORRIDOR_ROUTER_PORT",
                ..
            })
        ));

        unsafe {
            std::env::remove_var("CORRIDOR_ROUTER_PORT");
            std::env::set_var("CORRIDOR_IDLE_WINDOW_SECS", "600");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.cluster, "cluster-1");
        assert_eq!(config.network.subnets, vec!["subnet-a", "subnet-b"]);
        assert!(config.network.assign_public_ip);
        assert_eq!(config.router_port, 8081);
        assert_eq!(config.idle_window, Duration::from_secs(600));
        assert_eq!(config.guard_threshold, 3);
        assert_eq!(config.service_prefix, "router");
        assert!(config.builder_image.is_none());
    }
}
