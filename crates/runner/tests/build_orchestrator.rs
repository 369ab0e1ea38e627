#![forbid(unsafe_code)]

mod support;

use envrun_core::{BuildStatus, EventPayload};
use envrun_runner::{BuildSettings, EnsureOptions, EnsureOutcome, OrchestratorError, WaitMode};
use envrun_storage::PointerInsertRequest;
use std::time::Duration;
use support::{FakeBuilder, Harness};
use tokio::sync::mpsc;

fn blocking(force: bool) -> EnsureOptions {
    EnsureOptions {
        force,
        ..EnsureOptions::default()
    }
}

fn interactive() -> EnsureOptions {
    EnsureOptions {
        wait: WaitMode::Interactive,
        ..EnsureOptions::default()
    }
}

fn active(outcome: EnsureOutcome) -> (envrun_storage::EnvPointerRow, bool) {
    match outcome {
        EnsureOutcome::Active { pointer, reused } => (pointer, reused),
        EnsureOutcome::Building => panic!("expected an active environment"),
    }
}

#[tokio::test]
async fn fresh_resource_builds_once_then_reuses() {
    let h = Harness::new();
    let builds = h.builds();

    let (first, reused) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("first ensure"),
    );
    assert!(!reused);
    assert_eq!(first.status, BuildStatus::Active);
    assert!(first.python_path.is_some());
    assert!(std::path::Path::new(&first.env_path).is_dir());
    assert_eq!(h.builder.calls(), 1);

    h.clock.advance(Duration::from_secs(5));
    let (second, reused) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("second ensure"),
    );
    assert!(reused);
    assert_eq!(second.build_id, first.build_id);
    assert_eq!(second.last_used_at_ms, Some(support::START_MS + 5_000));
    assert_eq!(h.builder.calls(), 1);
}

#[tokio::test]
async fn concurrent_forced_ensures_share_one_build() {
    let h = Harness::with_builder(FakeBuilder::gated());
    let builds = h.builds();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let builds = builds.clone();
        let tenant = h.tenant.clone();
        let resource = h.resource.clone();
        tasks.push(tokio::spawn(async move {
            builds.ensure(&tenant, &resource, blocking(true)).await
        }));
    }

    h.builder.wait_for_calls(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.builder.release();

    let mut build_ids = Vec::new();
    for task in tasks {
        let (pointer, reused) = active(task.await.expect("join").expect("ensure"));
        assert!(!reused);
        build_ids.push(pointer.build_id);
    }
    build_ids.dedup();
    assert_eq!(build_ids.len(), 1);
    assert_eq!(h.builder.calls(), 1);
}

#[tokio::test]
async fn concurrent_callers_observe_the_shared_failure() {
    let h = Harness::with_builder(FakeBuilder::gated());
    h.builder.fail_with(Some("engine wheel missing"));
    let builds = h.builds();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let builds = builds.clone();
        let tenant = h.tenant.clone();
        let resource = h.resource.clone();
        tasks.push(tokio::spawn(async move {
            builds.ensure(&tenant, &resource, blocking(true)).await
        }));
    }
    h.builder.wait_for_calls(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.builder.release();

    for task in tasks {
        let err = task.await.expect("join").expect_err("build must fail");
        match err {
            OrchestratorError::Execution { message, .. } => {
                assert!(message.contains("engine wheel missing"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(h.builder.calls(), 1);
}

#[tokio::test]
async fn builder_failure_marks_pointer_failed_and_removes_dir() {
    let h = Harness::new();
    h.builder.fail_with(Some("pip install exploded"));
    let builds = h.builds();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = EnsureOptions {
        progress: Some(tx),
        ..EnsureOptions::default()
    };
    let err = builds
        .ensure(&h.tenant, &h.resource, options)
        .await
        .expect_err("build must fail");
    let OrchestratorError::Execution { id, message } = err else {
        panic!("expected an execution error");
    };
    assert!(message.contains("pip install exploded"));

    let row = builds.get_build(&id).expect("failed row");
    assert_eq!(row.status, BuildStatus::Failed);
    assert_eq!(row.error.as_deref(), Some(message.as_str()));
    assert!(row.retired_at_ms.is_some());
    assert!(!std::path::Path::new(&row.env_path).exists());
    assert!(builds.active_build(&h.tenant, &h.resource).expect("active").is_none());

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.id, id);
        kinds.push(event.payload.type_name());
        if let EventPayload::Completed { status, error, .. } = &event.payload {
            assert_eq!(status, "FAILED");
            assert!(error.is_some());
        }
    }
    assert_eq!(kinds, vec!["created", "started", "step", "completed"]);

    let logs = builds.list_build_logs(&id, 0, 50).expect("build logs");
    assert!(
        logs.entries
            .iter()
            .any(|entry| entry.message.contains("pip install exploded"))
    );

    h.builder.fail_with(None);
    let (pointer, _) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("retry succeeds"),
    );
    assert_ne!(pointer.build_id, id);
    assert_eq!(h.builder.calls(), 2);
}

#[tokio::test]
async fn ttl_expiry_triggers_rebuild() {
    let h = Harness::new();
    let builds = h.builds_with(BuildSettings {
        ttl: Some(Duration::from_secs(60)),
        ..Harness::build_settings()
    });

    let (first, _) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("first"),
    );
    assert_eq!(first.expires_at_ms, Some(support::START_MS + 60_000));

    h.clock.advance(Duration::from_secs(59));
    let (same, reused) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("within ttl"),
    );
    assert!(reused);
    assert_eq!(same.build_id, first.build_id);

    h.clock.advance(Duration::from_secs(1));
    let (second, reused) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("expired"),
    );
    assert!(!reused);
    assert_ne!(second.build_id, first.build_id);
    assert_eq!(h.builder.calls(), 2);

    let old = builds.get_build(&first.build_id).expect("old row");
    assert_eq!(old.status, BuildStatus::Inactive);
}

#[tokio::test]
async fn resource_change_invalidates_environment() {
    let h = Harness::new();
    let builds = h.builds();

    let (first, _) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("first"),
    );

    h.write_resource_file("rules.yaml", "threshold: 4\n");
    let (second, reused) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("after content change"),
    );
    assert!(!reused);
    assert_ne!(second.fingerprint.content_digest, first.fingerprint.content_digest);

    h.write_resource_file("manifest.json", r#"{"version": "7"}"#);
    let (third, _) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("after version bump"),
    );
    assert_eq!(third.fingerprint.resource_version, "7");
    assert_eq!(h.builder.calls(), 3);

    let rows = builds
        .list_builds(&h.tenant, &h.resource, 10)
        .expect("list builds");
    let active_rows = rows
        .iter()
        .filter(|row| row.status == BuildStatus::Active)
        .count();
    assert_eq!(active_rows, 1);
}

#[tokio::test]
async fn pinned_engine_version_mismatch_rebuilds() {
    let h = Harness::new();
    h.write_resource_file("manifest.json", r#"{"engine_version": "1.0.0"}"#);
    let builds = h.builds();

    active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("first"),
    );
    let (_, reused) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("pin satisfied"),
    );
    assert!(reused);

    h.write_resource_file("manifest.json", r#"{"engine_version": "2.0.0"}"#);
    let (rebuilt, reused) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("pin changed"),
    );
    assert!(!reused);
    assert_eq!(rebuilt.fingerprint.engine_version.as_deref(), Some("1.0.0"));

    // The builder keeps installing 1.0.0, so the 2.0.0 pin is never satisfied.
    let (_, reused) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("pin still unmet"),
    );
    assert!(!reused);
    assert_eq!(h.builder.calls(), 3);
}

fn insert_building(h: &Harness, build_id: &str, started_ms: i64) {
    let env_path = h.builds().env_dir(&h.tenant, &h.resource, build_id);
    std::fs::create_dir_all(&env_path).expect("env dir");
    h.store
        .with(|s| {
            s.pointer_insert_building(
                &h.tenant,
                &h.resource,
                PointerInsertRequest {
                    build_id: build_id.to_string(),
                    fingerprint: Default::default(),
                    env_path: env_path.to_string_lossy().into_owned(),
                    now_ms: started_ms,
                },
            )
        })
        .expect("insert stale row");
}

#[tokio::test]
async fn stale_building_row_is_healed_before_building() {
    let h = Harness::new();
    let builds = h.builds();
    insert_building(&h, "crashed", support::START_MS - 61_000);

    let (pointer, _) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("ensure after crash"),
    );
    assert_ne!(pointer.build_id, "crashed");
    assert_eq!(h.builder.calls(), 1);

    let crashed = builds.get_build("crashed").expect("crashed row");
    assert_eq!(crashed.status, BuildStatus::Failed);
    assert_eq!(crashed.error.as_deref(), Some("timeout"));
    assert!(!std::path::Path::new(&crashed.env_path).exists());
}

#[tokio::test]
async fn fresh_building_row_is_joined_until_wait_timeout() {
    let h = Harness::new();
    let builds = h.builds_with(BuildSettings {
        wait_timeout: Duration::from_millis(60),
        ..Harness::build_settings()
    });
    insert_building(&h, "in-flight", support::START_MS - 1_000);

    let err = builds
        .ensure(&h.tenant, &h.resource, blocking(false))
        .await
        .expect_err("wait must time out");
    assert!(matches!(err, OrchestratorError::AlreadyInProgress { .. }));
    assert_eq!(h.builder.calls(), 0);

    let outcome = builds
        .ensure(&h.tenant, &h.resource, interactive())
        .await
        .expect("interactive ensure");
    assert_eq!(outcome, EnsureOutcome::Building);
}

#[tokio::test]
async fn interactive_ensure_returns_building_and_build_completes() {
    let h = Harness::with_builder(FakeBuilder::gated());
    let builds = h.builds();

    let outcome = builds
        .ensure(&h.tenant, &h.resource, interactive())
        .await
        .expect("start build");
    assert_eq!(outcome, EnsureOutcome::Building);
    assert!(outcome.pointer().is_none());

    h.builder.wait_for_calls(1).await;
    let again = builds
        .ensure(&h.tenant, &h.resource, interactive())
        .await
        .expect("join build");
    assert_eq!(again, EnsureOutcome::Building);

    h.builder.release();
    let (pointer, reused) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("wait for build"),
    );
    assert_eq!(pointer.status, BuildStatus::Active);
    assert!(!reused);
    assert_eq!(h.builder.calls(), 1);
}

#[tokio::test]
async fn interactive_caller_can_wait_for_the_started_build_to_settle() {
    let h = Harness::with_builder(FakeBuilder::gated());
    let builds = h.builds();

    let outcome = builds
        .ensure(&h.tenant, &h.resource, interactive())
        .await
        .expect("start build");
    assert_eq!(outcome, EnsureOutcome::Building);
    h.builder.wait_for_calls(1).await;

    let waiter = {
        let builds = builds.clone();
        let (tenant, resource) = (h.tenant.clone(), h.resource.clone());
        tokio::spawn(async move { builds.wait_settled(&tenant, &resource).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "must wait while the build is BUILDING");

    h.builder.release();
    let settled = waiter
        .await
        .expect("waiter task")
        .expect("settled")
        .expect("newest row");
    assert_eq!(settled.status, BuildStatus::Active);
    assert_eq!(
        builds
            .active_build(&h.tenant, &h.resource)
            .expect("active")
            .map(|row| row.build_id),
        Some(settled.build_id)
    );
}

#[tokio::test]
async fn wait_settled_reports_a_failed_build() {
    let h = Harness::with_builder(FakeBuilder::gated());
    h.builder.fail_with(Some("pip exploded"));
    let builds = h.builds();

    builds
        .ensure(&h.tenant, &h.resource, interactive())
        .await
        .expect("start build");
    h.builder.release();
    let settled = builds
        .wait_settled(&h.tenant, &h.resource)
        .await
        .expect("settled")
        .expect("newest row");
    assert_eq!(settled.status, BuildStatus::Failed);
    assert!(!std::path::Path::new(&settled.env_path).exists());
}

#[tokio::test]
async fn prune_removes_retired_rows_after_retention() {
    let h = Harness::new();
    let builds = h.builds_with(BuildSettings {
        retention: Duration::from_secs(60),
        ..Harness::build_settings()
    });

    let (first, _) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(false))
            .await
            .expect("first"),
    );
    let (second, _) = active(
        builds
            .ensure(&h.tenant, &h.resource, blocking(true))
            .await
            .expect("forced"),
    );
    assert_eq!(
        builds.get_build(&first.build_id).expect("first row").status,
        BuildStatus::Inactive
    );

    h.clock.advance(Duration::from_secs(30));
    assert!(
        builds
            .prune(&h.tenant, &h.resource)
            .await
            .expect("prune")
            .is_empty()
    );

    h.clock.advance(Duration::from_secs(31));
    let pruned = builds.prune(&h.tenant, &h.resource).await.expect("prune");
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].build_id, first.build_id);
    assert!(!std::path::Path::new(&first.env_path).exists());
    assert!(matches!(
        builds.get_build(&first.build_id),
        Err(OrchestratorError::NotFound(_))
    ));

    let remaining = builds
        .list_builds(&h.tenant, &h.resource, 10)
        .expect("list builds");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].build_id, second.build_id);
    assert!(std::path::Path::new(&second.env_path).is_dir());
}

#[tokio::test]
async fn unknown_resource_is_not_found() {
    let h = Harness::new();
    let builds = h.builds();
    let missing = envrun_core::ids::ResourceId::try_new("ghost").expect("resource");
    let err = builds
        .ensure(&h.tenant, &missing, blocking(false))
        .await
        .expect_err("no such resource");
    assert!(matches!(err, OrchestratorError::NotFound(_)));
    assert_eq!(h.builder.calls(), 0);
}
