//! End-to-end tests of the sync engine against an emulated remote.

use cdcsync_engine::{
    BackoffConfig, SnapshotProtocol, SyncConfig, SyncEngine, SyncError, SyncMode, SyncResult,
    SyncState,
};
use cdcsync_protocol::{Change, ChangeList, CLUSTER_TABLE};
use cdcsync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(10);

fn config(remote: &MockRemote, dir: &TempDir, protocol: SnapshotProtocol) -> SyncConfig {
    let uri = remote.uri();
    SyncConfig::new(&uri, &uri, &uri, CLUSTER_ID)
        .with_consumer("key", "secret")
        .with_instance_name("edge-test")
        .with_data_dir(dir.path())
        .with_snapshot_protocol(protocol)
        .with_backoff(BackoffConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            2.0,
        ))
        .with_long_poll_block(Duration::from_secs(1))
        .with_http_timeout(Duration::from_secs(5))
        .with_publish_timeout(Duration::from_secs(5))
}

async fn remote_with_one_scope() -> MockRemote {
    let remote = MockRemote::start(CLUSTER_ID).await;
    remote
        .set_boot_snapshot(boot_snapshot(CLUSTER_ID, &[("s1", "scope-a")]))
        .await;
    remote
        .set_data_snapshot(data_snapshot(
            "snap-1",
            CLUSTER_ID,
            &[("s1", "scope-a")],
            &[("a1", "first")],
        ))
        .await;
    remote
}

async fn start(config: SyncConfig) -> (Arc<SyncEngine>, JoinHandle<SyncResult<()>>) {
    let engine = Arc::new(SyncEngine::new(config).await.unwrap());
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };
    (engine, runner)
}

async fn wait_for_polling(remote: &MockRemote) {
    assert!(
        eventually(WAIT, move || async move { !remote.change_requests().is_empty() }).await,
        "engine never polled for changes"
    );
}

async fn stop(engine: &SyncEngine, runner: JoinHandle<SyncResult<()>>) {
    engine.close().await.unwrap();
    let result = tokio::time::timeout(WAIT, runner).await.unwrap().unwrap();
    assert!(result.is_ok(), "run ended with {result:?}");
}

async fn app_count(engine: &SyncEngine) -> i64 {
    let pool = engine.store().current_pool().unwrap();
    sqlx::query_scalar("SELECT count(*) FROM kms_app")
        .fetch_one(&pool)
        .await
        .unwrap()
}

async fn stored_sequence(engine: &SyncEngine) -> String {
    let pool = engine.store().current_pool().unwrap();
    engine.store().last_sequence(&pool).await.unwrap()
}

#[tokio::test]
async fn bootstraps_and_applies_changes() {
    let remote = remote_with_one_scope().await;
    let dir = TempDir::new().unwrap();
    let (engine, runner) = start(config(&remote, &dir, SnapshotProtocol::Json)).await;
    wait_for_polling(&remote).await;

    let requests = remote.snapshot_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].scopes, vec![CLUSTER_ID]);
    assert_eq!(requests[1].scopes, vec!["scope-a", CLUSTER_ID]);
    assert_eq!(requests[1].accept, "application/json");
    assert_eq!(engine.identity().read().last_snapshot, "snap-1");
    assert_eq!(engine.state(), SyncState::Polling);

    let first = &remote.change_requests()[0];
    assert_eq!(first.since, None);
    assert_eq!(first.block.as_deref(), Some("0"));
    assert_eq!(first.snapshot.as_deref(), Some("snap-1"));

    remote.push_changes(ChangeList::new("", "10", vec![app_insert("a2", "second")]));
    let e = &*engine;
    assert!(eventually(WAIT, move || async move { app_count(e).await == 2 }).await);
    let r = &remote;
    assert!(
        eventually(WAIT, move || async move {
            r.change_requests()
                .iter()
                .any(|r| r.since.as_deref() == Some("10") && r.block.as_deref() == Some("1"))
        })
        .await
    );
    assert_eq!(stored_sequence(&engine).await, "10");

    let stats = engine.stats();
    assert_eq!(stats.snapshots_delivered, 1);
    assert_eq!(stats.batches_delivered, 1);
    assert_eq!(stats.last_sequence.as_deref(), Some("10"));

    stop(&engine, runner).await;
    assert_eq!(engine.state(), SyncState::Closed);
}

#[tokio::test]
async fn scope_insert_batch_yields_two_scopes() {
    let remote = remote_with_one_scope().await;
    let dir = TempDir::new().unwrap();
    let (engine, runner) = start(config(&remote, &dir, SnapshotProtocol::Sqlite)).await;
    wait_for_polling(&remote).await;
    assert_eq!(engine.scope_cache().read_all().await.unwrap(), vec!["scope-a"]);

    remote
        .set_data_snapshot(data_snapshot(
            "snap-2",
            CLUSTER_ID,
            &[("s1", "scope-a"), ("s2", "scope-b")],
            &[("a1", "first")],
        ))
        .await;
    remote.push_changes(ChangeList::new(
        "",
        "3",
        vec![scope_insert("s2", CLUSTER_ID, "scope-b")],
    ));

    let r = &remote;
    assert!(
        eventually(WAIT, move || async move {
            r.snapshot_requests()
                .iter()
                .any(|req| req.scopes == ["scope-a", "scope-b", CLUSTER_ID])
        })
        .await,
        "no snapshot was requested for the new scope"
    );
    let e = &*engine;
    assert!(
        eventually(WAIT, move || async move {
            e.identity().read().last_snapshot == "snap-2"
        })
        .await
    );
    assert_eq!(
        engine.scope_cache().read_all().await.unwrap(),
        vec!["scope-a", "scope-b"]
    );
    let pool = engine.store().current_pool().unwrap();
    let stored_scopes: i64 = sqlx::query_scalar("SELECT count(*) FROM edgex_data_scope")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stored_scopes, 2);
    assert!(remote
        .snapshot_requests()
        .iter()
        .all(|req| req.accept == "application/transicator+sqlite"));

    stop(&engine, runner).await;
}

#[tokio::test]
async fn unknown_table_triggers_new_snapshot() {
    let remote = remote_with_one_scope().await;
    let dir = TempDir::new().unwrap();
    let (engine, runner) = start(config(&remote, &dir, SnapshotProtocol::Json)).await;
    wait_for_polling(&remote).await;

    remote
        .set_data_snapshot(data_snapshot(
            "snap-2",
            CLUSTER_ID,
            &[("s1", "scope-a")],
            &[("a1", "first")],
        ))
        .await;
    remote.push_changes(ChangeList::new(
        "",
        "4",
        vec![Change::insert("kms.unknown", app_row("x", "y"))],
    ));

    let r = &remote;
    assert!(eventually(WAIT, move || async move { r.snapshot_requests().len() >= 3 }).await);
    let e = &*engine;
    assert!(
        eventually(WAIT, move || async move {
            e.identity().read().last_snapshot == "snap-2"
        })
        .await
    );
    assert_eq!(stored_sequence(&engine).await, "");
    assert_eq!(app_count(&engine).await, 1);

    stop(&engine, runner).await;
}

#[tokio::test]
async fn snapshot_too_old_triggers_new_snapshot() {
    let remote = remote_with_one_scope().await;
    remote.snapshot_too_old(1);
    let dir = TempDir::new().unwrap();
    let (engine, runner) = start(config(&remote, &dir, SnapshotProtocol::Json)).await;

    let r = &remote;
    assert!(eventually(WAIT, move || async move { r.snapshot_requests().len() >= 3 }).await);
    assert!(eventually(WAIT, move || async move { r.change_requests().len() >= 2 }).await);
    assert_eq!(engine.state(), SyncState::Polling);

    stop(&engine, runner).await;
}

#[tokio::test]
async fn revoked_token_is_replaced() {
    let remote = remote_with_one_scope().await;
    let dir = TempDir::new().unwrap();
    let (engine, runner) = start(config(&remote, &dir, SnapshotProtocol::Json)).await;
    wait_for_polling(&remote).await;
    assert_eq!(remote.tokens_issued(), 1);

    remote.revoke_tokens();
    let r = &remote;
    assert!(eventually(WAIT, move || async move { r.tokens_issued() >= 2 }).await);
    assert!(remote.unauthorized_requests() >= 1);

    remote.push_changes(ChangeList::new("", "8", vec![app_insert("a2", "second")]));
    let e = &*engine;
    assert!(eventually(WAIT, move || async move { app_count(e).await == 2 }).await);

    stop(&engine, runner).await;
}

#[tokio::test]
async fn failed_apply_does_not_advance_cursor() {
    let remote = remote_with_one_scope().await;
    let dir = TempDir::new().unwrap();
    let (engine, runner) = start(config(&remote, &dir, SnapshotProtocol::Json)).await;
    wait_for_polling(&remote).await;

    remote.push_changes(ChangeList::new(
        "",
        "9",
        vec![
            app_insert("a2", "second"),
            Change::delete(APP_TABLE, app_row("missing", "gone")),
        ],
    ));
    let r = &remote;
    assert!(eventually(WAIT, move || async move { r.pending_changes() == 0 }).await);
    let seen = remote.change_requests().len();
    assert!(eventually(WAIT, move || async move { r.change_requests().len() > seen }).await);

    assert_eq!(app_count(&engine).await, 1);
    assert_eq!(stored_sequence(&engine).await, "");
    assert!(remote.change_requests().iter().all(|req| req.since.is_none()));
    assert_eq!(engine.state(), SyncState::Polling);

    stop(&engine, runner).await;
}

#[tokio::test]
async fn illegal_cluster_write_is_fatal() {
    let remote = remote_with_one_scope().await;
    let dir = TempDir::new().unwrap();
    let (engine, runner) = start(config(&remote, &dir, SnapshotProtocol::Json)).await;
    wait_for_polling(&remote).await;

    remote.push_changes(ChangeList::new(
        "",
        "2",
        vec![Change::insert(CLUSTER_TABLE, cluster_row("other"))],
    ));
    let result = tokio::time::timeout(WAIT, runner).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(SyncError::IllegalTableOperation { .. })
    ));
    assert_eq!(engine.state(), SyncState::Failed);
    assert!(engine.last_error().is_some());
    tokio::time::timeout(WAIT, engine.close())
        .await
        .expect("close hung after a fatal error")
        .unwrap();
    assert_eq!(engine.state(), SyncState::Failed);
}

#[tokio::test]
async fn restart_resumes_from_local_snapshot() {
    let remote = remote_with_one_scope().await;
    let dir = TempDir::new().unwrap();

    let (engine, runner) = start(config(&remote, &dir, SnapshotProtocol::Json)).await;
    wait_for_polling(&remote).await;
    let instance_id = engine.identity().read().instance_id.clone();
    remote.push_changes(ChangeList::new("", "7", vec![app_insert("a2", "second")]));
    let e = &*engine;
    assert!(eventually(WAIT, move || async move { stored_sequence(e).await == "7" }).await);
    stop(&engine, runner).await;
    drop(engine);

    let polls_before = remote.change_requests().len();
    let (engine, runner) = start(config(&remote, &dir, SnapshotProtocol::Json)).await;
    let r = &remote;
    assert!(
        eventually(WAIT, move || async move {
            r.change_requests().len() > polls_before
        })
        .await
    );
    assert_eq!(remote.snapshot_requests().len(), 2);
    assert_eq!(
        remote.change_requests()[polls_before].since.as_deref(),
        Some("7")
    );
    assert_eq!(engine.identity().read().instance_id, instance_id);
    assert!(!engine.identity().read().is_new);
    assert_eq!(app_count(&engine).await, 2);
    stop(&engine, runner).await;
    drop(engine);

    let offline = config(&remote, &dir, SnapshotProtocol::Json)
        .with_consumer("", "")
        .with_mode(SyncMode::Offline);
    let (engine, runner) = start(offline).await;
    let e = &*engine;
    assert!(eventually(WAIT, move || async move { e.state() == SyncState::Offline }).await);
    assert_eq!(app_count(&engine).await, 2);
    assert_eq!(remote.snapshot_requests().len(), 2);
    stop(&engine, runner).await;
}
