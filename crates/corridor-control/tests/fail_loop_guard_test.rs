// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for fail_loop_guard module - forcing crash-looping deployments to zero.

mod common;

use std::time::Duration;

use common::TestContext;
use corridor_control::env_overlay::EnvOverlay;
use corridor_control::fail_loop_guard::{FailLoopGuard, FailLoopGuardConfig, GuardOutcome};
use corridor_control::idle_tracker::IdleTracker;
use corridor_control::platform::{Orchestrator, PlatformError};
use corridor_control::reconciler::{Deployment, EnsureRequest, ReconcilerConfig, ServiceReconciler};

async fn deploy(ctx: &TestContext, scenario_id: &str, image: &str) -> Deployment {
    ServiceReconciler::new(
        ctx.platform.clone(),
        ctx.platform.clone(),
        ReconcilerConfig::from_config(&ctx.config),
    )
    .ensure(&EnsureRequest {
        scenario_id: scenario_id.to_string(),
        template_family: "router".to_string(),
        image: Some(image.to_string()),
        env: EnvOverlay::default(),
        desired_count: 1,
        port: 8081,
    })
    .await
    .unwrap()
}

fn guard(ctx: &TestContext, tracker: &IdleTracker) -> FailLoopGuard {
    FailLoopGuard::new(
        ctx.platform.clone(),
        tracker.clone(),
        FailLoopGuardConfig::from_config(&ctx.config),
    )
}

#[tokio::test(start_paused = true)]
async fn test_crash_loop_scaled_to_zero_at_threshold() {
    let ctx = TestContext::new().await;
    ctx.platform.fail_image("img:bad").await;
    let deployment = deploy(&ctx, "alpha", "img:bad").await;
    let tracker = IdleTracker::new();
    tracker.touch("alpha").await;

    let outcome = guard(&ctx, &tracker).watch(&deployment).await;

    assert_eq!(outcome, GuardOutcome::ScaledDown { failures: 3 });
    let service = ctx.platform.service("router-alpha").await.unwrap();
    assert_eq!(service.desired_count, 0);
    assert!(service.is_live(), "guard must not delete the service");
    assert!(tracker.last_access("alpha").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_healthy_deployment_left_running() {
    let ctx = TestContext::new().await;
    let deployment = deploy(&ctx, "beta", "img:good").await;
    let tracker = IdleTracker::new();
    tracker.touch("beta").await;

    let outcome = guard(&ctx, &tracker).watch(&deployment).await;

    assert_eq!(outcome, GuardOutcome::Healthy { failures: 0 });
    let service = ctx.platform.service("router-beta").await.unwrap();
    assert_eq!(service.desired_count, 1);
    assert_eq!(ctx.platform.calls("update_service").await, 0);
    assert!(tracker.last_access("beta").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_replicas_of_replaced_revision_do_not_count_as_healthy() {
    let ctx = TestContext::new().await;
    ctx.platform.fail_image("img:bad").await;
    deploy(&ctx, "eta", "img:good").await;
    ctx.platform.set_overlap_polls(3).await;

    let deployment = deploy(&ctx, "eta", "img:bad").await;
    let service = ctx.platform.service("router-eta").await.unwrap();
    assert_eq!(service.running_count, 1);
    assert_eq!(service.primary_running_count, 0);

    let outcome = guard(&ctx, &IdleTracker::new()).watch(&deployment).await;

    assert_eq!(outcome, GuardOutcome::ScaledDown { failures: 3 });
    assert_eq!(
        ctx.platform.service("router-eta").await.unwrap().desired_count,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_window_does_not_overflow() {
    let ctx = TestContext::new().await;
    let deployment = deploy(&ctx, "theta", "img:good").await;
    let config = FailLoopGuardConfig {
        window: Duration::MAX,
        ..FailLoopGuardConfig::default()
    };
    let guard = FailLoopGuard::new(ctx.platform.clone(), IdleTracker::new(), config);

    let outcome = guard.watch(&deployment).await;

    assert_eq!(outcome, GuardOutcome::Healthy { failures: 0 });
}

#[tokio::test(start_paused = true)]
async fn test_failures_of_previous_revision_ignored() {
    let ctx = TestContext::new().await;
    ctx.platform.fail_image("img:bad").await;
    deploy(&ctx, "gamma", "img:bad").await;
    for _ in 0..5 {
        ctx.platform
            .list_service_jobs("router-gamma", corridor_control::platform::JobStatus::Stopped)
            .await
            .unwrap();
    }

    let fixed = deploy(&ctx, "gamma", "img:good").await;
    let outcome = guard(&ctx, &IdleTracker::new()).watch(&fixed).await;

    assert_eq!(outcome, GuardOutcome::Healthy { failures: 0 });
}

#[tokio::test(start_paused = true)]
async fn test_window_elapses_below_threshold() {
    let ctx = TestContext::new().await;
    ctx.platform.fail_image("img:bad").await;
    let deployment = deploy(&ctx, "delta", "img:bad").await;
    let config = FailLoopGuardConfig {
        window: Duration::from_secs(20),
        poll_interval: Duration::from_secs(5),
        threshold: 100,
        ..FailLoopGuardConfig::default()
    };
    let guard = FailLoopGuard::new(ctx.platform.clone(), IdleTracker::new(), config);

    let outcome = guard.watch(&deployment).await;

    let GuardOutcome::WindowElapsed { failures } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert!((4..=5).contains(&failures));
    assert_eq!(
        ctx.platform.service("router-delta").await.unwrap().desired_count,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_deleted_service_is_gone() {
    let ctx = TestContext::new().await;
    let deployment = deploy(&ctx, "epsilon", "img:good").await;
    ctx.platform.delete_service("router-epsilon").await.unwrap();

    let outcome = guard(&ctx, &IdleTracker::new()).watch(&deployment).await;

    assert_eq!(outcome, GuardOutcome::Gone);
}

#[tokio::test(start_paused = true)]
async fn test_scale_down_retried_and_remote_errors_tolerated() {
    let ctx = TestContext::new().await;
    ctx.platform.fail_image("img:bad").await;
    let deployment = deploy(&ctx, "zeta", "img:bad").await;
    ctx.platform
        .inject_fault("describe_service", PlatformError::Timeout("slow".into()))
        .await;
    ctx.platform
        .inject_fault(
            "update_service",
            PlatformError::api("ThrottlingException", "Rate exceeded"),
        )
        .await;

    let outcome = guard(&ctx, &IdleTracker::new()).watch(&deployment).await;

    assert!(matches!(outcome, GuardOutcome::ScaledDown { .. }));
    assert_eq!(ctx.platform.calls("update_service").await, 2);
    assert_eq!(
        ctx.platform.service("router-zeta").await.unwrap().desired_count,
        0
    );
}
