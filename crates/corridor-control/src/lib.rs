// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Corridor Control - Per-Scenario Compute Lifecycle
//!
//! This crate provides the control plane for tenant scenarios. Each scenario
//! is built by a one-off job and then served by a long-running, discoverable
//! router service on a managed container platform. The crate drives those
//! resources through the platform's remote control APIs; it owns no state
//! besides an in-memory idle tracker.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Request handlers (embedder)                        │
//! │            build / edit scenario · delete scenario · warm-up             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     corridor-control (This Crate)                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │     Job     │  │   Service   │  │  Fail-Loop  │  │  Teardown   │     │
//! │  │   Runner    │─▶│ Reconciler  │─▶│    Guard    │  │             │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! │  ┌─────────────┐  ┌─────────────┐                                        │
//! │  │    Idle     │◀─│    Idle     │◀── touch                               │
//! │  │   Reaper    │  │   Tracker   │                                        │
//! │  └─────────────┘  └─────────────┘                                        │
//! │              every remote call goes through the RetryPolicy              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                         │                        │
//!           ▼                         ▼                        ▼
//! ┌───────────────────┐   ┌───────────────────────┐   ┌──────────────────┐
//! │   Orchestrator    │   │  Discovery namespace  │   │    Log streams   │
//! │ templates · jobs  │   │  DNS registrations    │   │                  │
//! │ services          │   │                       │   │                  │
//! └───────────────────┘   └───────────────────────┘   └──────────────────┘
//! ```
//!
//! # Control Flow
//!
//! | Request | Path |
//! |---------|------|
//! | Build / edit | Job Runner, then (exit 0 only) Service Reconciler, then Fail-Loop Guard |
//! | Delete | Teardown |
//! | Warm-up / health | Idle Tracker touch |
//! | (background) | Idle Reaper, every tick |
//!
//! # Service Lifecycle
//!
//! ```text
//!   ensure ──▶ ┌──────────┐   running == desired   ┌─────────┐
//!              │ ROLLING  │───────────────────────▶│ HEALTHY │
//!              └────┬─────┘                        └────┬────┘
//!                   │ threshold stopped replicas        │ idle window
//!                   ▼                                   ▼
//!             ┌────────────┐                      ┌────────────┐
//!             │ SCALED TO 0│◀──── ensure again ──▶│ SCALED TO 0│
//!             └─────┬──────┘                      └─────┬──────┘
//!                   └──────────────┬─────────────────────┘
//!                                  │ delete
//!                                  ▼
//!                            ┌──────────┐
//!                            │  GONE    │
//!                            └──────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables (and a `.env` file):
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CORRIDOR_CLUSTER` | Yes | - | Cluster all tasks and services run in |
//! | `CORRIDOR_NAMESPACE_ID` | Yes | - | Discovery namespace for registrations |
//! | `CORRIDOR_SUBNETS` | Yes | - | Comma-separated subnets |
//! | `CORRIDOR_SECURITY_GROUPS` | Yes | - | Comma-separated security groups |
//! | `CORRIDOR_REGION` | No | `ap-northeast-1` | Region injected as `REGION` |
//! | `CORRIDOR_ASSIGN_PUBLIC_IP` | No | `true` | Public IP for tasks |
//! | `CORRIDOR_BUILDER_FAMILY` | No | `builder` | Build job template family |
//! | `CORRIDOR_ROUTER_FAMILY` | No | `router` | Router base template family |
//! | `CORRIDOR_BUILDER_IMAGE` | No | - | Build image |
//! | `CORRIDOR_ROUTER_IMAGE` | No | - | Router image override |
//! | `CORRIDOR_EXECUTION_ROLE` | No | - | Execution identity |
//! | `CORRIDOR_TASK_ROLE` | No | - | Task identity |
//! | `CORRIDOR_BUILDER_LOG_GROUP` | No | `/corridor/builder` | Build job logs |
//! | `CORRIDOR_ROUTER_LOG_GROUP` | No | `/corridor/router` | Router logs |
//! | `CORRIDOR_SERVICE_PREFIX` | No | `router` | Service name prefix |
//! | `CORRIDOR_ROUTER_PORT` | No | `8081` | Router port |
//! | `CORRIDOR_IDLE_WINDOW_SECS` | No | `1800` | Idle time before scale-down |
//! | `CORRIDOR_REAPER_INTERVAL_SECS` | No | `60` | Idle reaper tick |
//! | `CORRIDOR_GUARD_WINDOW_SECS` | No | `300` | Fail-loop watch window |
//! | `CORRIDOR_GUARD_POLL_SECS` | No | `5` | Fail-loop poll interval |
//! | `CORRIDOR_GUARD_THRESHOLD` | No | `3` | Stopped replicas before scale-down |
//! | `CORRIDOR_RETRY_ATTEMPTS` | No | `5` | Attempts per remote call |
//! | `CORRIDOR_RETRY_BASE_MS` | No | `500` | Base backoff |
//! | `CORRIDOR_RETRY_CAP_MS` | No | `20000` | Backoff ceiling |
//! | `CORRIDOR_JOB_TIMEOUT_SECS` | No | `14400` | Build job wait limit |
//! | `CORRIDOR_JOB_POLL_SECS` | No | `6` | Build job poll interval |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for control plane operations
//! - [`platform`]: Remote API traits and the in-memory platform
//! - [`retry`]: Backoff with jitter and bounded polling
//! - [`job_runner`]: One-off build jobs
//! - [`reconciler`]: Router service create/update
//! - [`fail_loop_guard`]: Crash-loop detection after a rollout
//! - [`idle_tracker`]: Last access per scenario
//! - [`idle_reaper`]: Scale idle services to zero
//! - [`teardown`]: Service and registration deletion
//! - [`control_plane`]: Per-scenario operations
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for control plane operations.
pub mod error;

/// Remote control API traits and an in-memory implementation.
pub mod platform;

/// Exponential backoff with jitter for remote calls.
pub mod retry;

/// Service names derived from scenario ids.
pub mod naming;

/// Container environment merging.
pub mod env_overlay;

/// One-off build jobs.
pub mod job_runner;

/// Router service reconciliation.
pub mod reconciler;

/// Crash-loop detection for fresh deployments.
pub mod fail_loop_guard;

/// Last-access tracking per scenario.
pub mod idle_tracker;

/// Background worker for scaling idle services to zero.
pub mod idle_reaper;

/// Service and registration teardown.
pub mod teardown;

/// Per-scenario build, deploy and delete.
pub mod control_plane;

/// Embeddable runtime for corridor-control.
pub mod runtime;

pub use config::Config;
pub use control_plane::{ControlPlane, DeployOutcome, ScenarioRequest};
pub use error::Error;
