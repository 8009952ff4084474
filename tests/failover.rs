use std::sync::Arc;
use std::time::Duration;

use replicadb::testkit::MockBackend;
use replicadb::{BackendError, Cluster, ClusterConfig, ClusterError, Value};

fn setup(ids: &[&str], config: ClusterConfig) -> (Arc<Cluster>, Vec<MockBackend>) {
    let mocks: Vec<MockBackend> = ids.iter().map(|id| MockBackend::new(id)).collect();
    let cluster = Cluster::builder(config)
        .backends(mocks.iter().map(|m| m.backend()))
        .build()
        .unwrap();
    cluster.start().unwrap();
    (cluster, mocks)
}

fn live_ids(cluster: &Cluster) -> Vec<String> {
    cluster
        .balancer()
        .list()
        .iter()
        .map(|b| b.id().to_string())
        .collect()
}

#[test]
fn dead_backend_isolated_on_write() {
    let (cluster, mocks) = setup(&["db1", "db2", "db3"], ClusterConfig::default());
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    mocks[1].set_alive(false);
    let count = stmt.execute_update("UPDATE accounts SET balance = 0").unwrap();
    assert_eq!(count, 1);

    assert_eq!(live_ids(&cluster), vec!["db1", "db3"]);
    assert_eq!(mocks[0].executed(), vec!["UPDATE accounts SET balance = 0"]);
    assert!(mocks[1].executed().is_empty());
    assert_eq!(mocks[2].executed(), vec!["UPDATE accounts SET balance = 0"]);
}

#[test]
fn application_error_on_every_backend_is_raised() {
    let (cluster, mocks) = setup(&["db1", "db2"], ClusterConfig::default());
    for m in &mocks {
        m.fail_on("DROP", BackendError::with_state("permission denied", "42501"));
    }
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    let err = stmt.execute("DROP TABLE audit").unwrap_err();
    assert_eq!(err.backend_id(), Some("db1"));
    assert_eq!(
        err.backend_error().and_then(|e| e.sql_state.as_deref()),
        Some("42501")
    );
    assert_eq!(live_ids(&cluster), vec!["db1", "db2"]);
}

#[test]
fn diverging_backend_deactivated() {
    let (cluster, mocks) = setup(&["db1", "db2"], ClusterConfig::default());
    mocks[1].fail_on("INSERT", BackendError::with_state("duplicate key", "23505"));
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    assert_eq!(stmt.execute_update("INSERT INTO orders VALUES (1)").unwrap(), 1);
    assert_eq!(live_ids(&cluster), vec!["db1"]);
}

#[test]
fn dead_backend_dropped_while_application_error_raised() {
    let (cluster, mocks) = setup(&["db1", "db2"], ClusterConfig::default());
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    mocks[0].set_alive(false);
    mocks[1].fail_on("UPDATE", BackendError::with_state("value too long", "22001"));
    let err = stmt.execute_update("UPDATE customers SET name = 'x'").unwrap_err();

    assert!(matches!(err, ClusterError::Backend { .. }));
    assert_eq!(err.backend_id(), Some("db2"));
    assert_eq!(
        err.backend_error().and_then(|e| e.sql_state.as_deref()),
        Some("22001")
    );
    assert_eq!(live_ids(&cluster), vec!["db2"]);
}

#[test]
fn manual_commit_failure_keeps_backend_active() {
    let (cluster, mocks) = setup(&["db1", "db2"], ClusterConfig::default());
    let conn = cluster.connect().unwrap();
    conn.set_auto_commit(false).unwrap();
    let stmt = conn.create_statement().unwrap();

    mocks[1].set_alive(false);
    let err = stmt
        .execute_update("UPDATE accounts SET balance = 1")
        .unwrap_err();
    assert!(matches!(err, ClusterError::Backend { ref backend, .. } if backend == "db2"));
    assert_eq!(live_ids(&cluster), vec!["db1", "db2"]);

    // The transaction ended with the failure; back in autocommit the dead
    // backend is removed as usual.
    conn.set_auto_commit(true).unwrap();
    assert!(!cluster.balancer().contains(&mocks[1].backend()));
}

#[test]
fn every_backend_dead() {
    let (cluster, mocks) = setup(&["db1", "db2"], ClusterConfig::default());
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();
    for m in &mocks {
        m.set_alive(false);
    }

    let err = stmt.execute_update("DELETE FROM sessions").unwrap_err();
    assert!(matches!(err, ClusterError::AllBackendsFailed { ref backend, .. } if backend == "db1"));
    assert!(cluster.balancer().is_empty());

    let err = stmt.execute_update("DELETE FROM sessions").unwrap_err();
    assert!(matches!(err, ClusterError::NoAvailableBackend { .. }));
}

#[test]
fn slow_backend_times_out() {
    let config = ClusterConfig {
        fan_out_timeout_ms: 100,
        ..ClusterConfig::default()
    };
    let (cluster, mocks) = setup(&["db1", "db2"], config);
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    // Still answers the probe, so the timeout counts as divergence.
    mocks[1].set_delay(Some(Duration::from_millis(500)));
    assert_eq!(stmt.execute_update("UPDATE t SET a = 1").unwrap(), 1);
    assert_eq!(live_ids(&cluster), vec!["db1"]);
}

#[test]
fn reactivated_backend_not_used_through_stale_handles() {
    let (cluster, mocks) = setup(&["db1", "db2"], ClusterConfig::default());
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    assert!(cluster.deactivate(&mocks[1].backend()));
    stmt.execute_update("UPDATE t SET a = 1").unwrap();
    assert!(cluster.activate(&mocks[1].backend()));
    stmt.execute_update("UPDATE t SET a = 2").unwrap();

    assert_eq!(mocks[0].executed().len(), 2);
    assert!(mocks[1].executed().is_empty());
    assert!(mocks[1].calls().contains(&"close_statement".to_string()));
}

#[test]
fn single_read_retries_on_next_backend() {
    let config = ClusterConfig {
        balancer: replicadb::BalancerKind::Simple,
        ..ClusterConfig::default()
    };
    let (cluster, mocks) = setup(&["db1", "db2"], config);
    for m in &mocks {
        m.on_query("FROM items", &["name"], vec![vec!["lamp".into()]]);
    }
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    mocks[0].set_alive(false);
    let rs = stmt.execute_query("SELECT name FROM items").unwrap();
    assert!(rs.next().unwrap());
    assert_eq!(rs.value(0).unwrap(), Value::from("lamp"));
    assert_eq!(live_ids(&cluster), vec!["db2"]);
}

#[test]
fn detector_sweep_and_restart_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("membership.log");
    let mocks = [MockBackend::new("db1"), MockBackend::new("db2")];

    let cluster = Cluster::builder(ClusterConfig::default())
        .backends(mocks.iter().map(|m| m.backend()))
        .state_manager(Arc::new(replicadb::FileStateManager::new(&path)))
        .build()
        .unwrap();
    cluster.start().unwrap();
    mocks[0].set_alive(false);
    assert_eq!(cluster.detect_failures(), vec!["db1"]);
    cluster.stop().unwrap();

    mocks[0].set_alive(true);
    let restarted = Cluster::builder(ClusterConfig::default())
        .backends(mocks.iter().map(|m| m.backend()))
        .state_manager(Arc::new(replicadb::FileStateManager::new(&path)))
        .build()
        .unwrap();
    restarted.start().unwrap();
    assert_eq!(live_ids(&restarted), vec!["db2"]);
}
