// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for idle_reaper module - scaling idle scenarios to zero.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common::TestContext;
use corridor_control::env_overlay::EnvOverlay;
use corridor_control::idle_reaper::{IdleReaper, IdleReaperConfig, ReapSummary};
use corridor_control::idle_tracker::IdleTracker;
use corridor_control::platform::{Orchestrator, PlatformError};
use corridor_control::reconciler::{EnsureRequest, ReconcilerConfig, ServiceReconciler};

async fn deploy(ctx: &TestContext, scenario_id: &str) {
    ServiceReconciler::new(
        ctx.platform.clone(),
        ctx.platform.clone(),
        ReconcilerConfig::from_config(&ctx.config),
    )
    .ensure(&EnsureRequest {
        scenario_id: scenario_id.to_string(),
        template_family: "router".to_string(),
        image: None,
        env: EnvOverlay::default(),
        desired_count: 1,
        port: 8081,
    })
    .await
    .unwrap();
}

fn reaper(ctx: &TestContext, tracker: &IdleTracker) -> IdleReaper {
    IdleReaper::new(
        ctx.platform.clone(),
        tracker.clone(),
        IdleReaperConfig::from_config(&ctx.config),
    )
}

async fn desired_count(ctx: &TestContext, service: &str) -> u32 {
    ctx.platform.service(service).await.unwrap().desired_count
}

#[tokio::test(start_paused = true)]
async fn test_idle_scenario_scaled_down_and_untracked() {
    let ctx = TestContext::new().await;
    deploy(&ctx, "stale").await;
    deploy(&ctx, "fresh").await;
    let tracker = IdleTracker::new();
    let now = Utc::now();
    tracker.touch_at("stale", now - ChronoDuration::minutes(31)).await;
    tracker.touch_at("fresh", now - ChronoDuration::minutes(5)).await;

    let summary = reaper(&ctx, &tracker).reap_idle(now).await;

    assert_eq!(
        summary,
        ReapSummary {
            scaled_down: 1,
            ..Default::default()
        }
    );
    assert_eq!(desired_count(&ctx, "router-stale").await, 0);
    assert_eq!(desired_count(&ctx, "router-fresh").await, 1);
    assert!(tracker.last_access("stale").await.is_none());
    assert!(tracker.last_access("fresh").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failure_on_one_service_does_not_abort_tick() {
    let ctx = TestContext::new().await;
    deploy(&ctx, "first").await;
    deploy(&ctx, "second").await;
    let tracker = IdleTracker::new();
    let now = Utc::now();
    // Oldest first: "first" is reaped first and hits the fault.
    tracker.touch_at("first", now - ChronoDuration::hours(3)).await;
    tracker.touch_at("second", now - ChronoDuration::hours(2)).await;
    ctx.platform
        .inject_fault(
            "update_service",
            PlatformError::api("AccessDeniedException", "denied"),
        )
        .await;

    let summary = reaper(&ctx, &tracker).reap_idle(now).await;

    assert_eq!(summary.errors, 1);
    assert_eq!(summary.scaled_down, 1);
    assert_eq!(desired_count(&ctx, "router-first").await, 1);
    assert_eq!(desired_count(&ctx, "router-second").await, 0);
    // Kept for the next tick.
    assert!(tracker.last_access("first").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_missing_or_scaled_down_services_released() {
    let ctx = TestContext::new().await;
    deploy(&ctx, "zeroed").await;
    ctx.platform.set_desired_count("router-zeroed", 0).await;
    let tracker = IdleTracker::new();
    let now = Utc::now();
    tracker.touch_at("zeroed", now - ChronoDuration::hours(1)).await;
    tracker.touch_at("vanished", now - ChronoDuration::hours(1)).await;

    let summary = reaper(&ctx, &tracker).reap_idle(now).await;

    assert_eq!(summary.released, 2);
    assert_eq!(summary.scaled_down, 0);
    assert!(tracker.is_empty().await);
    assert_eq!(ctx.platform.calls("update_service").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_adopts_untracked_live_services() {
    let ctx = TestContext::new().await;
    deploy(&ctx, "orphan").await;
    deploy(&ctx, "known").await;
    deploy(&ctx, "parked").await;
    ctx.platform.set_desired_count("router-parked", 0).await;
    deploy(&ctx, "gone").await;
    ctx.platform.delete_service("router-gone").await.unwrap();
    let tracker = IdleTracker::new();
    let now = Utc::now();
    let known_at = now - ChronoDuration::minutes(10);
    tracker.touch_at("known", known_at).await;

    let adopted = reaper(&ctx, &tracker).adopt_untracked(now).await.unwrap();

    assert_eq!(adopted, 1);
    assert_eq!(tracker.last_access("orphan").await, Some(now));
    assert_eq!(tracker.last_access("known").await, Some(known_at));
    assert!(tracker.last_access("parked").await.is_none());
    assert!(tracker.last_access("gone").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_adopted_service_reaped_after_window() {
    let ctx = TestContext::new().await;
    deploy(&ctx, "orphan").await;
    let tracker = IdleTracker::new();
    let reaper = reaper(&ctx, &tracker);
    let start = Utc::now();

    reaper.adopt_untracked(start).await.unwrap();
    let early = reaper.reap_idle(start + ChronoDuration::minutes(29)).await;
    let late = reaper.reap_idle(start + ChronoDuration::minutes(31)).await;

    assert_eq!(early, ReapSummary::default());
    assert_eq!(late.scaled_down, 1);
    assert_eq!(desired_count(&ctx, "router-orphan").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_adoption_retried_on_next_tick() {
    let ctx = TestContext::new().await;
    deploy(&ctx, "orphan").await;
    for _ in 0..3 {
        ctx.platform
            .inject_fault("list_services", PlatformError::Timeout("slow".into()))
            .await;
    }
    let tracker = IdleTracker::new();
    let reaper = Arc::new(reaper(&ctx, &tracker));
    let shutdown = reaper.shutdown_handle();
    let task = {
        let reaper = reaper.clone();
        tokio::spawn(async move { reaper.run().await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ctx.platform.calls("list_services").await, 3);
    assert!(tracker.last_access("orphan").await.is_none());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ctx.platform.calls("list_services").await, 4);
    assert!(tracker.last_access("orphan").await.is_some());

    // Adopted once; later ticks do not list again.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ctx.platform.calls("list_services").await, 4);

    shutdown.notify_one();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_idle_window_beyond_clock_range_reaps_nothing() {
    let ctx = TestContext::new().await;
    deploy(&ctx, "ancient").await;
    let tracker = IdleTracker::new();
    let now = Utc::now();
    tracker.touch_at("ancient", now - ChronoDuration::days(365)).await;
    let config = IdleReaperConfig {
        idle_window: Duration::from_secs(100_000_000_000_000),
        ..IdleReaperConfig::from_config(&ctx.config)
    };
    let reaper = IdleReaper::new(ctx.platform.clone(), tracker.clone(), config);

    let summary = reaper.reap_idle(now).await;

    assert_eq!(summary, ReapSummary::default());
    assert_eq!(desired_count(&ctx, "router-ancient").await, 1);
}
