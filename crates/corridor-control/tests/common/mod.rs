// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for corridor-control tests.
//!
//! Provides TestContext wiring an in-memory platform with fast timings and a
//! provisioned router base template.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use corridor_control::Config;
use corridor_control::platform::{
    ContainerSpec, LogConfig, MemoryPlatform, NetworkConfig, ResourceShape, TaskTemplate,
    TemplateSpec,
};

pub const NAMESPACE: &str = "corridor.local";
pub const BASE_ROUTER_IMAGE: &str = "router:base";
pub const BUILDER_IMAGE: &str = "builder:1";

/// Test context around one in-memory platform.
pub struct TestContext {
    pub platform: Arc<MemoryPlatform>,
    pub config: Config,
}

impl TestContext {
    /// Platform with a provisioned router base template.
    pub async fn new() -> Self {
        Self::with_platform(MemoryPlatform::new(NAMESPACE)).await
    }

    /// Like [`new`](Self::new) over a customised platform.
    pub async fn with_platform(platform: MemoryPlatform) -> Self {
        let platform = Arc::new(platform);
        seed_router_base(&platform).await;
        Self {
            platform,
            config: test_config(),
        }
    }
}

/// Configuration with short timings, built without touching the environment.
pub fn test_config() -> Config {
    Config {
        region: "ap-northeast-1".to_string(),
        cluster: "corridor-test".to_string(),
        network: NetworkConfig {
            subnets: vec!["subnet-a".to_string()],
            security_groups: vec!["sg-a".to_string()],
            assign_public_ip: true,
        },
        namespace_id: "ns-test".to_string(),
        builder_family: "builder".to_string(),
        router_family: "router".to_string(),
        builder_image: Some(BUILDER_IMAGE.to_string()),
        router_image: None,
        execution_role: None,
        task_role: None,
        builder_log_group: "/corridor/builder".to_string(),
        router_log_group: "/corridor/router".to_string(),
        service_prefix: "router".to_string(),
        router_port: 8081,
        idle_window: Duration::from_secs(1800),
        reaper_interval: Duration::from_secs(60),
        guard_window: Duration::from_secs(300),
        guard_poll_interval: Duration::from_secs(5),
        guard_threshold: 3,
        retry_attempts: 5,
        retry_base: Duration::from_millis(10),
        retry_cap: Duration::from_millis(100),
        job_timeout: Duration::from_secs(600),
        job_poll_interval: Duration::from_secs(1),
    }
}

/// Register the router base template, as an operator would.
pub async fn seed_router_base(platform: &MemoryPlatform) -> TaskTemplate {
    platform
        .seed_template(TemplateSpec {
            family: "router".to_string(),
            shape: ResourceShape::new(512, 1024),
            execution_role: None,
            task_role: None,
            container: ContainerSpec {
                name: "router".to_string(),
                image: BASE_ROUTER_IMAGE.to_string(),
                port: Some(8081),
                env: BTreeMap::from([
                    ("JAVA_OPTS".to_string(), "-Xmx512m".to_string()),
                    ("SCENARIO_ID".to_string(), "unset".to_string()),
                ]),
                log: Some(LogConfig {
                    group: "/corridor/router".to_string(),
                    region: "ap-northeast-1".to_string(),
                    stream_prefix: "router".to_string(),
                }),
            },
        })
        .await
}

/// Environment map from pairs.
pub fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
