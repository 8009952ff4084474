use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use replicadb::lock::{LocalLockManager, Lock, LockManager};
use replicadb::testkit::MockBackend;
use replicadb::{
    BackendError, Cluster, ClusterConfig, ClusterError, ColumnProperties, DatabaseProperties,
    MetaDataCache, TableProperties, Value,
};

/// Lock manager that logs acquisitions and releases.
#[derive(Default)]
struct Recording {
    inner: LocalLockManager,
    events: Arc<Mutex<Vec<String>>>,
}

struct RecordingLock {
    inner: Arc<dyn Lock>,
    events: Arc<Mutex<Vec<String>>>,
}

impl Lock for RecordingLock {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn try_lock_for(&self, timeout: Duration) -> bool {
        let granted = self.inner.try_lock_for(timeout);
        if granted {
            self.events.lock().push(format!("lock {}", self.name()));
        }
        granted
    }

    fn unlock(&self) {
        self.events.lock().push(format!("unlock {}", self.name()));
        self.inner.unlock();
    }
}

impl LockManager for Recording {
    fn read_lock(&self, name: &str) -> Arc<dyn Lock> {
        Arc::new(RecordingLock {
            inner: self.inner.read_lock(name),
            events: self.events.clone(),
        })
    }

    fn write_lock(&self, name: &str) -> Arc<dyn Lock> {
        Arc::new(RecordingLock {
            inner: self.inner.write_lock(name),
            events: self.events.clone(),
        })
    }
}

fn schema() -> MetaDataCache {
    MetaDataCache::fixed(DatabaseProperties {
        locators_update_copy: true,
        supports_select_for_update: true,
        tables: vec![
            TableProperties::new(
                "T",
                vec![
                    ColumnProperties::new("id", "INTEGER").auto_increment(true),
                    ColumnProperties::new("name", "VARCHAR"),
                ],
            ),
            TableProperties::new(
                "tbl",
                vec![ColumnProperties::new("id", "INTEGER")
                    .with_default("GENERATED ALWAYS AS IDENTITY")],
            ),
        ],
    })
}

fn setup(
    config: ClusterConfig,
    locks: Arc<dyn LockManager>,
) -> (Arc<Cluster>, Vec<MockBackend>) {
    let mocks = vec![MockBackend::new("db1"), MockBackend::new("db2")];
    let cluster = Cluster::builder(config)
        .backends(mocks.iter().map(|m| m.backend()))
        .metadata_cache(Arc::new(schema()))
        .lock_manager(locks)
        .build()
        .unwrap();
    cluster.start().unwrap();
    (cluster, mocks)
}

#[test]
fn auto_increment_insert_replicated_under_table_lock() {
    let recording = Arc::new(Recording::default());
    let (cluster, mocks) = setup(ClusterConfig::default(), recording.clone());
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    let sql = "INSERT INTO T (name) VALUES ('x')";
    assert_eq!(stmt.execute_update(sql).unwrap(), 1);

    assert_eq!(mocks[0].executed(), vec![sql]);
    assert_eq!(mocks[1].executed(), vec![sql]);
    assert_eq!(*recording.events.lock(), vec!["lock T", "unlock T"]);
    assert_eq!(stmt.generated_keys().unwrap(), vec![vec![Value::Int(1)]]);
}

#[test]
fn batch_locks_in_sorted_order_and_releases_in_reverse() {
    let recording = Arc::new(Recording::default());
    let (cluster, mocks) = setup(ClusterConfig::default(), recording.clone());
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    stmt.add_batch("INSERT INTO tbl VALUES (NEXT VALUE FOR seq2)")
        .unwrap();
    stmt.add_batch("UPDATE counters SET n = NEXT VALUE FOR seq1")
        .unwrap();
    assert_eq!(stmt.pending_batch().unwrap().len(), 2);

    assert_eq!(stmt.execute_batch().unwrap(), vec![1, 1]);
    assert!(stmt.pending_batch().unwrap().is_empty());
    assert_eq!(mocks[1].executed().len(), 2);
    assert_eq!(
        *recording.events.lock(),
        vec![
            "lock seq1",
            "lock seq2",
            "lock tbl",
            "unlock tbl",
            "unlock seq2",
            "unlock seq1"
        ]
    );
}

#[test]
fn locks_released_when_every_backend_fails() {
    let recording = Arc::new(Recording::default());
    let (cluster, mocks) = setup(ClusterConfig::default(), recording.clone());
    for m in &mocks {
        m.fail_on("INSERT", BackendError::new("check constraint"));
    }
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    assert!(stmt.execute_update("INSERT INTO T (name) VALUES ('y')").is_err());
    assert_eq!(*recording.events.lock(), vec!["lock T", "unlock T"]);

    let free = thread::spawn(move || {
        let lock = recording.inner.write_lock("T");
        let granted = lock.try_lock_for(Duration::from_millis(100));
        if granted {
            lock.unlock();
        }
        granted
    })
    .join()
    .unwrap();
    assert!(free);
}

#[test]
fn lock_timeout_fails_without_fan_out() {
    let locks = Arc::new(LocalLockManager::new());
    let config = ClusterConfig {
        lock_timeout_ms: 50,
        ..ClusterConfig::default()
    };
    let (cluster, mocks) = setup(config, locks.clone());
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();

    let (held_tx, held_rx) = crossbeam_channel::bounded(0);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let holder = thread::spawn(move || {
        let lock = locks.write_lock("T");
        assert!(lock.try_lock_for(Duration::from_secs(1)));
        held_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        lock.unlock();
    });
    held_rx.recv().unwrap();

    let err = stmt
        .execute_update("INSERT INTO T (name) VALUES ('z')")
        .unwrap_err();
    assert!(matches!(err, ClusterError::LockTimeout { ref name, .. } if name == "T"));
    assert!(mocks[0].executed().is_empty());
    assert!(mocks[1].executed().is_empty());

    release_tx.send(()).unwrap();
    holder.join().unwrap();
    assert_eq!(stmt.execute_update("INSERT INTO T (name) VALUES ('z')").unwrap(), 1);
}

#[test]
fn concurrent_identity_inserts_apply_in_same_order_everywhere() {
    let (cluster, mocks) = setup(ClusterConfig::default(), Arc::new(LocalLockManager::new()));

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let cluster = cluster.clone();
            thread::spawn(move || {
                let conn = cluster.connect().unwrap();
                let stmt = conn.create_statement().unwrap();
                for i in 0..10 {
                    stmt.execute_update(&format!("INSERT INTO T (name) VALUES ('{t}-{i}')"))
                        .unwrap();
                }
                conn.close().unwrap();
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let first = mocks[0].executed();
    assert_eq!(first.len(), 40);
    assert_eq!(first, mocks[1].executed());
}

#[test]
fn late_backends_finish_before_lock_is_released() {
    let config = ClusterConfig {
        fan_out_timeout_ms: 50,
        ..ClusterConfig::default()
    };
    let (cluster, mocks) = setup(config, Arc::new(LocalLockManager::new()));
    let conn = cluster.connect().unwrap();
    let stmt = conn.create_statement().unwrap();
    let slow_conn = cluster.connect().unwrap();
    let slow_stmt = slow_conn.create_statement().unwrap();

    mocks[0].set_delay(Some(Duration::from_millis(400)));
    mocks[1].set_delay(Some(Duration::from_millis(100)));
    let slow = thread::spawn(move || slow_stmt.execute_update("INSERT INTO T (name) VALUES ('a')"));

    thread::sleep(Duration::from_millis(150));
    for m in &mocks {
        m.set_delay(None);
    }
    assert_eq!(stmt.execute_update("INSERT INTO T (name) VALUES ('b')").unwrap(), 1);

    let err = slow.join().unwrap().unwrap_err();
    assert!(err.backend_error().is_some_and(|e| e.timed_out));
    assert_eq!(cluster.balancer().len(), 2);

    let expected = vec![
        "INSERT INTO T (name) VALUES ('a')",
        "INSERT INTO T (name) VALUES ('b')",
    ];
    assert_eq!(mocks[0].executed(), expected);
    assert_eq!(mocks[1].executed(), expected);
}
