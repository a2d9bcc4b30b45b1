// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for corridor-control.
//!
//! [`ControlPlaneRuntime`] wires a [`ControlPlane`] and starts the idle reaper
//! inside an existing tokio application. Request handlers call into
//! [`ControlPlaneRuntime::plane`]; the reaper shares its idle tracker.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use corridor_control::{Config, runtime::ControlPlaneRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let platform = Arc::new(MyCloudAdapter::connect().await?);
//!
//!     let runtime = ControlPlaneRuntime::builder()
//!         .orchestrator(platform.clone())
//!         .discovery(platform.clone())
//!         .log_sink(platform)
//!         .config(Config::load()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve requests with runtime.plane() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::control_plane::ControlPlane;
use crate::idle_reaper::{IdleReaper, IdleReaperConfig};
use crate::idle_tracker::IdleTracker;
use crate::platform::{Discovery, LogSink, Orchestrator};

/// Builder for creating a [`ControlPlaneRuntime`].
#[derive(Default)]
pub struct ControlPlaneRuntimeBuilder {
    orchestrator: Option<Arc<dyn Orchestrator>>,
    discovery: Option<Arc<dyn Discovery>>,
    log_sink: Option<Arc<dyn LogSink>>,
    config: Option<Config>,
    reaper_config: Option<IdleReaperConfig>,
}

impl ControlPlaneRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the orchestrator API (required).
    pub fn orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Set the discovery API (required).
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Set the log API (required).
    pub fn log_sink(mut self, log_sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(log_sink);
        self
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the reaper settings derived from the configuration.
    pub fn reaper_config(mut self, config: IdleReaperConfig) -> Self {
        self.reaper_config = Some(config);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlPlaneRuntimeConfig> {
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| anyhow::anyhow!("orchestrator is required"))?;
        let discovery = self
            .discovery
            .ok_or_else(|| anyhow::anyhow!("discovery is required"))?;
        let log_sink = self
            .log_sink
            .ok_or_else(|| anyhow::anyhow!("log_sink is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let reaper_config = self
            .reaper_config
            .unwrap_or_else(|| IdleReaperConfig::from_config(&config));

        Ok(ControlPlaneRuntimeConfig {
            orchestrator,
            discovery,
            log_sink,
            config,
            reaper_config,
        })
    }
}

/// Configuration for a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeConfig {
    orchestrator: Arc<dyn Orchestrator>,
    discovery: Arc<dyn Discovery>,
    log_sink: Arc<dyn LogSink>,
    config: Config,
    reaper_config: IdleReaperConfig,
}

impl ControlPlaneRuntimeConfig {
    /// Start the runtime, spawning the idle reaper.
    pub async fn start(self) -> Result<ControlPlaneRuntime> {
        let tracker = IdleTracker::new();

        let reaper = IdleReaper::new(self.orchestrator.clone(), tracker.clone(), self.reaper_config);
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        info!(
            cluster = %self.config.cluster,
            region = %self.config.region,
            service_prefix = %self.config.service_prefix,
            "ControlPlaneRuntime started"
        );

        let plane = Arc::new(ControlPlane::with_tracker(
            self.orchestrator,
            self.discovery,
            self.log_sink,
            self.config,
            tracker,
        ));

        Ok(ControlPlaneRuntime {
            plane,
            reaper_handle,
            reaper_shutdown,
        })
    }
}

/// A running control plane embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination. Requests in
/// flight on [`plane`](Self::plane) are not cancelled.
pub struct ControlPlaneRuntime {
    plane: Arc<ControlPlane>,
    reaper_handle: JoinHandle<()>,
    reaper_shutdown: Arc<Notify>,
}

impl ControlPlaneRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlPlaneRuntimeBuilder {
        ControlPlaneRuntimeBuilder::new()
    }

    /// The control plane serving requests.
    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    /// Check if the idle reaper is still running.
    pub fn is_running(&self) -> bool {
        !self.reaper_handle.is_finished()
    }

    /// Stop the idle reaper and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControlPlaneRuntime shutting down...");
        self.reaper_shutdown.notify_one();

        match self.reaper_handle.await {
            Ok(()) => {
                info!("ControlPlaneRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Idle reaper task panicked: {}", e);
                Err(anyhow::anyhow!("idle reaper task panicked: {}", e))
            }
        }
    }
}
