/// Two-phase commit tests
///
/// XA lifecycle across in-memory backends: retry short-circuit, journal
/// handoff and convergence, commit-lock exclusion and terminal idempotence.
/// Run with: cargo test --test xa_tests

use shardxa::recovery::XA_CHECK_FILE;
use shardxa::{
    BackendConfig, BackendRegistry, Fault, MemoryDriver, ProxyConfig, ProxyError, Request,
    TxnState, XaRecoveryState, XaState,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config(dir: &Path) -> ProxyConfig {
    ProxyConfig::new(dir)
        .xa_retry_backoff(Duration::from_millis(5))
        .xa_max_retries(4)
        .xa_check_interval(Duration::from_secs(60))
}

fn open(config: ProxyConfig, driver: &Arc<MemoryDriver>, shards: &[&str]) -> BackendRegistry {
    let registry = BackendRegistry::open(config, driver.clone()).unwrap();
    for shard in shards {
        registry
            .add(BackendConfig::new(shard, &format!("{}:3306", shard)))
            .unwrap();
    }
    registry
}

fn journal_xids(dir: &Path) -> Vec<String> {
    let raw = std::fs::read_to_string(dir.join("xacheck").join(XA_CHECK_FILE)).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    value["xacommit-errs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["xaid"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_two_phase_commit_across_backends() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let registry = open(config(dir.path()), &driver, &["s0", "s1"]);

    let mut txn = registry.create_transaction();
    txn.begin();
    txn.execute(&Request::scatter("INSERT INTO t VALUES (1)").write())
        .await
        .unwrap();
    txn.commit().await.unwrap();
    txn.finish().await;

    for shard in ["s0:3306", "s1:3306"] {
        let server = driver.server(shard);
        let statements: Vec<String> = server
            .query_log()
            .into_iter()
            .map(|e| e.query)
            .filter(|q| q.starts_with("XA"))
            .map(|q| q.split(' ').take(2).collect::<Vec<_>>().join(" "))
            .collect();
        assert_eq!(statements, vec!["XA START", "XA END", "XA PREPARE", "XA COMMIT"]);
        assert_eq!(server.committed_xids(), vec![txn.xid().to_string()]);
    }
    assert_eq!(txn.state(), TxnState::Finishing);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_prepare_rolls_back_prepared_shards() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let registry = open(config(dir.path()), &driver, &["s0", "s1"]);
    driver.server("s1:3306").inject(
        "XA PREPARE",
        Fault::Error(ProxyError::server(1402, "XA100", "XA_RBROLLBACK: Transaction branch was rolled back")),
        None,
    );

    let mut txn = registry.create_transaction();
    txn.begin();
    txn.execute(&Request::scatter("INSERT INTO t VALUES (1)").write())
        .await
        .unwrap();
    let err = txn.commit().await.unwrap_err();
    assert!(matches!(err, ProxyError::Server { code: 1402, .. }));
    assert_eq!(txn.xa_state(), XaState::RollbackFinished);
    txn.abort().await;

    for shard in ["s0:3306", "s1:3306"] {
        let server = driver.server(shard);
        assert!(server.prepared_xids().is_empty());
        assert!(server.committed_xids().is_empty());
        assert_eq!(server.rolled_back_xids(), vec![txn.xid().to_string()]);
    }
    let xa_check = registry.transaction_manager().xa_check();
    assert!(xa_check.entries().await.is_empty());
    assert_eq!(xa_check.check_once().await.unwrap(), 0);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_xid_stops_retries_after_first_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let registry = open(config(dir.path()), &driver, &["s0"]);
    let server = driver.server("s0:3306");
    server.inject(
        "XA COMMIT",
        Fault::Error(ProxyError::server(1397, "XAE04", "XAER_NOTA: Unknown XID")),
        None,
    );

    let mut txn = registry.create_transaction();
    txn.begin();
    txn.execute(&Request::single("UPDATE t SET a = 1").write())
        .await
        .unwrap();
    txn.commit().await.unwrap();

    assert_eq!(server.count_queries("XA COMMIT"), 1);
    assert_eq!(txn.xa_state(), XaState::CommitFinished);
    assert_eq!(txn.errors(), 0);
    assert!(registry.transaction_manager().xa_check().entries().await.is_empty());
    txn.finish().await;
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_retries_then_journals() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let registry = open(config(dir.path()), &driver, &["s0", "s1"]);
    let flaky = driver.server("s1:3306");

    let mut txn = registry.create_transaction();
    txn.begin();
    txn.execute(&Request::scatter("DELETE FROM t").write())
        .await
        .unwrap();
    // prepare everywhere, then lose s1 for the whole second phase
    flaky.inject(
        "XA COMMIT",
        Fault::Error(ProxyError::ServerUnavailable("EOF".into())),
        None,
    );
    txn.commit().await.unwrap();

    // first attempt on the branch connection, the rest on fresh ones
    assert_eq!(flaky.count_queries("XA COMMIT"), 4);
    assert!(flaky.dial_count() >= 4);
    assert_eq!(journal_xids(dir.path()), vec![txn.xid().to_string()]);
    let entries = registry.transaction_manager().xa_check().entries().await;
    assert_eq!(entries[0].state, XaRecoveryState::Commit);
    txn.finish().await;
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_journal_converges_within_two_ticks() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let registry = open(config(dir.path()), &driver, &["s0", "s1"]);
    let holder = driver.server("s1:3306");
    holder.prepare_xid("RXID-20260101000000-7");
    holder.inject(
        "XA COMMIT",
        Fault::Error(ProxyError::ServerUnavailable("EOF".into())),
        Some(1),
    );

    let check = registry.transaction_manager().xa_check();
    check
        .write_failure_record("RXID-20260101000000-7", XaRecoveryState::Commit)
        .await
        .unwrap();
    assert_eq!(journal_xids(dir.path()).len(), 1);

    assert_eq!(check.check_once().await.unwrap(), 1);
    assert_eq!(journal_xids(dir.path()).len(), 1);

    assert_eq!(check.check_once().await.unwrap(), 0);
    assert!(check.entries().await.is_empty());
    assert!(journal_xids(dir.path()).is_empty());
    assert!(holder.prepared_xids().is_empty());
    assert_eq!(holder.committed_xids(), vec!["RXID-20260101000000-7".to_string()]);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_journal_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    driver.server("s0:3306").prepare_xid("MULTRXID-20260101000000-3");

    let first = open(config(dir.path()), &driver, &["s0"]);
    first
        .transaction_manager()
        .xa_check()
        .write_failure_record("MULTRXID-20260101000000-3", XaRecoveryState::Rollback)
        .await
        .unwrap();
    first.close().await.unwrap();

    let ticking = config(dir.path()).xa_check_interval(Duration::from_millis(50));
    let second = open(ticking, &driver, &["s0"]);
    assert_eq!(second.transaction_manager().xa_check().entries().await.len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(second.transaction_manager().xa_check().entries().await.is_empty());
    assert_eq!(
        driver.server("s0:3306").rolled_back_xids(),
        vec!["MULTRXID-20260101000000-3".to_string()]
    );
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_reads_never_overlap_second_phase() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let registry = Arc::new(open(config(dir.path()), &driver, &["s0", "s1"]));
    for shard in ["s0:3306", "s1:3306"] {
        let server = driver.server(shard);
        server.inject("SELECT", Fault::Delay(Duration::from_millis(5)), None);
        server.inject("XA COMMIT", Fault::Delay(Duration::from_millis(5)), None);
    }

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..6 {
        let registry = Arc::clone(&registry);
        tasks.spawn(async move {
            for _ in 0..5 {
                let mut txn = registry.create_transaction();
                txn.begin();
                if i % 3 == 0 {
                    txn.execute(&Request::scatter("UPDATE t SET a = a + 1").write())
                        .await
                        .unwrap();
                    txn.commit().await.unwrap();
                } else {
                    txn.execute(&Request::scatter("SELECT a FROM t")).await.unwrap();
                }
                txn.finish().await;
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    let log: Vec<_> = ["s0:3306", "s1:3306"]
        .iter()
        .flat_map(|shard| driver.server(shard).query_log())
        .collect();
    let reads: Vec<_> = log.iter().filter(|e| e.query.starts_with("SELECT")).collect();
    let commits: Vec<_> = log.iter().filter(|e| e.query.starts_with("XA COMMIT")).collect();
    assert_eq!(reads.len(), 4 * 5 * 2);
    assert_eq!(commits.len(), 2 * 5 * 2);

    for read in &reads {
        for commit in &commits {
            let overlap = read.started < commit.finished && commit.started < read.finished;
            assert!(!overlap, "read {:?} overlapped commit {:?}", read.query, commit.query);
        }
    }
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_abort_then_finish_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let registry = open(config(dir.path()), &driver, &["s0", "s1"]);

    let mut txn = registry.create_transaction();
    txn.begin();
    txn.execute(&Request::scatter("INSERT INTO t VALUES (1)").write())
        .await
        .unwrap();
    txn.abort().await;
    let kills: u64 = ["s0:3306", "s1:3306"]
        .iter()
        .map(|s| driver.server(s).kill_count())
        .sum();
    let idle: Vec<usize> = registry.stats().unwrap().iter().map(|s| s.idle).collect();

    txn.finish().await;
    txn.abort().await;

    assert_eq!(kills, 2);
    let kills_after: u64 = ["s0:3306", "s1:3306"]
        .iter()
        .map(|s| driver.server(s).kill_count())
        .sum();
    assert_eq!(kills_after, 2);
    let idle_after: Vec<usize> = registry.stats().unwrap().iter().map(|s| s.idle).collect();
    assert_eq!(idle, idle_after);
    assert_eq!(txn.state(), TxnState::Aborting);
    assert!(txn.execute(&Request::scatter("SELECT 1")).await.is_err());
    // the aborted branches died with their sessions
    assert!(driver.server("s0:3306").prepared_xids().is_empty());
    assert_eq!(registry.transaction_manager().live_count(), 0);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_finish_then_abort_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let registry = open(config(dir.path()), &driver, &["s0"]);

    let mut txn = registry.create_transaction();
    txn.execute(&Request::single("SELECT 1")).await.unwrap();
    txn.finish().await;
    txn.abort().await;

    assert_eq!(driver.server("s0:3306").kill_count(), 0);
    assert_eq!(registry.stats().unwrap()[0].idle, 1);
    assert_eq!(txn.state(), TxnState::Finishing);
    registry.close().await.unwrap();
}
