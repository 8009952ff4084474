//! Scriptable in-memory backends for tests and benches.
//!
//! A [`MockBackend`] implements the connectivity and physical-handle traits
//! over shared state the test can inspect and steer: executed SQL is
//! recorded, queries return canned rows, and the backend can be killed, made
//! to fail matching statements, or slowed down.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{
    Backend, Connection, Connector, FetchDirection, MoreResults, ResultSet, Row, Statement,
    StatementOptions, Value,
};
use crate::error::{BackendError, BackendResult};

struct CannedQuery {
    pattern: String,
    columns: Vec<String>,
    rows: Vec<Row>,
}

struct FailureRule {
    pattern: String,
    error: BackendError,
}

#[derive(Default)]
struct MockState {
    dead: AtomicBool,
    executed: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
    queries: Mutex<Vec<CannedQuery>>,
    failures: Mutex<Vec<FailureRule>>,
    delay: Mutex<Option<Duration>>,
    next_key: AtomicI64,
    open_cursors: AtomicUsize,
    open_connections: AtomicUsize,
}

impl MockState {
    fn check_alive(&self) -> BackendResult<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(BackendError::with_state("connection refused", "08006"));
        }
        Ok(())
    }

    fn call(&self, name: impl Into<String>) -> BackendResult<()> {
        self.check_alive()?;
        self.calls.lock().push(name.into());
        Ok(())
    }

    /// Records `sql` after applying the delay and failure rules.
    fn run(&self, sql: &str) -> BackendResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.check_alive()?;
        let failure = self
            .failures
            .lock()
            .iter()
            .find(|rule| sql.contains(&rule.pattern))
            .map(|rule| rule.error.clone());
        if let Some(error) = failure {
            return Err(error);
        }
        self.executed.lock().push(sql.to_string());
        Ok(())
    }

    fn canned(&self, sql: &str) -> (Vec<String>, Vec<Row>) {
        self.queries
            .lock()
            .iter()
            .find(|q| sql.contains(&q.pattern))
            .map(|q| (q.columns.clone(), q.rows.clone()))
            .unwrap_or_default()
    }
}

/// An in-memory backend. Clones share state.
#[derive(Clone)]
pub struct MockBackend {
    backend: Arc<Backend>,
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new(id: &str) -> Self {
        Self::with_weight(id, 1)
    }

    pub fn with_weight(id: &str, weight: u32) -> Self {
        let state = Arc::new(MockState::default());
        let backend = Backend::with_weight(
            id,
            weight,
            Arc::new(MockConnector {
                state: state.clone(),
            }),
        );
        Self { backend, state }
    }

    pub fn backend(&self) -> Arc<Backend> {
        self.backend.clone()
    }

    pub fn id(&self) -> &str {
        self.backend.id()
    }

    /// A dead backend fails its liveness probe and every operation.
    pub fn set_alive(&self, alive: bool) {
        self.state.dead.store(!alive, Ordering::SeqCst);
    }

    /// Queries containing `pattern` return `columns` and `rows`.
    pub fn on_query(&self, pattern: &str, columns: &[&str], rows: Vec<Row>) {
        self.state.queries.lock().push(CannedQuery {
            pattern: pattern.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        });
    }

    /// Statements containing `pattern` fail with `error`.
    pub fn fail_on(&self, pattern: &str, error: BackendError) {
        self.state.failures.lock().push(FailureRule {
            pattern: pattern.to_string(),
            error,
        });
    }

    pub fn clear_failures(&self) {
        self.state.failures.lock().clear();
    }

    /// Sleeps before executing each statement.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.state.delay.lock() = delay;
    }

    /// SQL executed successfully, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    /// Driver calls other than statement execution, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().clone()
    }

    pub fn open_cursors(&self) -> usize {
        self.state.open_cursors.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }
}

struct MockConnector {
    state: Arc<MockState>,
}

impl Connector for MockConnector {
    fn connect(&self) -> BackendResult<Box<dyn Connection>> {
        self.state.call("connect")?;
        self.state.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            open: true,
        }))
    }

    fn is_alive(&self) -> bool {
        !self.state.dead.load(Ordering::SeqCst)
    }
}

struct MockConnection {
    state: Arc<MockState>,
    open: bool,
}

impl Connection for MockConnection {
    fn create_statement(&mut self, _options: StatementOptions) -> BackendResult<Box<dyn Statement>> {
        self.state.call("create_statement")?;
        Ok(Box::new(MockStatement {
            state: self.state.clone(),
            batch: Vec::new(),
            last: LastResult::None,
            keys: Vec::new(),
            warnings: Vec::new(),
            fetch_size: 0,
            fetch_direction: FetchDirection::Forward,
            max_rows: 0,
            query_timeout: Duration::ZERO,
        }))
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> BackendResult<()> {
        self.state.call(format!("set_auto_commit({auto_commit})"))
    }

    fn set_read_only(&mut self, read_only: bool) -> BackendResult<()> {
        self.state.call(format!("set_read_only({read_only})"))
    }

    fn commit(&mut self) -> BackendResult<()> {
        self.state.call("commit")
    }

    fn rollback(&mut self) -> BackendResult<()> {
        self.state.call("rollback")
    }

    fn close(&mut self) -> BackendResult<()> {
        if std::mem::take(&mut self.open) {
            self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        self.state.call("close_connection")
    }
}

enum LastResult {
    None,
    Update(u64),
    Rows(Vec<String>, Vec<Row>),
}

struct MockStatement {
    state: Arc<MockState>,
    batch: Vec<String>,
    last: LastResult,
    keys: Vec<Row>,
    warnings: Vec<String>,
    fetch_size: usize,
    fetch_direction: FetchDirection,
    max_rows: usize,
    query_timeout: Duration,
}

fn is_query(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_lowercase();
    head.starts_with("select") || head.starts_with("with")
}

impl MockStatement {
    fn apply(&mut self, sql: &str) -> BackendResult<u64> {
        self.state.run(sql)?;
        if sql.trim_start().to_ascii_lowercase().starts_with("insert") {
            let key = self.state.next_key.fetch_add(1, Ordering::SeqCst) + 1;
            self.keys = vec![vec![Value::Int(key)]];
        } else {
            self.keys.clear();
        }
        Ok(1)
    }

    fn cursor(&self, columns: Vec<String>, rows: Vec<Row>) -> Box<dyn ResultSet> {
        self.state.open_cursors.fetch_add(1, Ordering::SeqCst);
        Box::new(MockResultSet {
            state: self.state.clone(),
            columns,
            rows: rows.into_iter(),
            open: true,
        })
    }
}

impl Statement for MockStatement {
    fn execute(&mut self, sql: &str) -> BackendResult<bool> {
        if is_query(sql) {
            self.state.run(sql)?;
            let (columns, rows) = self.state.canned(sql);
            self.last = LastResult::Rows(columns, rows);
            Ok(true)
        } else {
            let count = self.apply(sql)?;
            self.last = LastResult::Update(count);
            Ok(false)
        }
    }

    fn execute_update(&mut self, sql: &str) -> BackendResult<u64> {
        let count = self.apply(sql)?;
        self.last = LastResult::Update(count);
        Ok(count)
    }

    fn execute_query(&mut self, sql: &str) -> BackendResult<Box<dyn ResultSet>> {
        self.state.run(sql)?;
        let (columns, rows) = self.state.canned(sql);
        self.last = LastResult::None;
        Ok(self.cursor(columns, rows))
    }

    fn add_batch(&mut self, sql: &str) -> BackendResult<()> {
        self.state.check_alive()?;
        self.batch.push(sql.to_string());
        Ok(())
    }

    fn clear_batch(&mut self) -> BackendResult<()> {
        self.state.check_alive()?;
        self.batch.clear();
        Ok(())
    }

    fn execute_batch(&mut self) -> BackendResult<Vec<u64>> {
        let batch = std::mem::take(&mut self.batch);
        batch.iter().map(|sql| self.apply(sql)).collect()
    }

    fn result_set(&mut self) -> BackendResult<Option<Box<dyn ResultSet>>> {
        self.state.check_alive()?;
        match std::mem::replace(&mut self.last, LastResult::None) {
            LastResult::Rows(columns, rows) => Ok(Some(self.cursor(columns, rows))),
            other => {
                self.last = other;
                Ok(None)
            }
        }
    }

    fn update_count(&mut self) -> BackendResult<Option<u64>> {
        self.state.check_alive()?;
        Ok(match self.last {
            LastResult::Update(count) => Some(count),
            _ => None,
        })
    }

    fn more_results(&mut self, _current: MoreResults) -> BackendResult<bool> {
        self.state.call("more_results")?;
        self.last = LastResult::None;
        Ok(false)
    }

    fn generated_keys(&mut self) -> BackendResult<Vec<Row>> {
        self.state.check_alive()?;
        Ok(self.keys.clone())
    }

    fn warnings(&mut self) -> BackendResult<Vec<String>> {
        self.state.check_alive()?;
        Ok(self.warnings.clone())
    }

    fn clear_warnings(&mut self) -> BackendResult<()> {
        self.state.check_alive()?;
        self.warnings.clear();
        Ok(())
    }

    fn fetch_size(&mut self) -> BackendResult<usize> {
        self.state.check_alive()?;
        Ok(self.fetch_size)
    }

    fn set_fetch_size(&mut self, rows: usize) -> BackendResult<()> {
        self.state.call(format!("set_fetch_size({rows})"))?;
        self.fetch_size = rows;
        Ok(())
    }

    fn fetch_direction(&mut self) -> BackendResult<FetchDirection> {
        self.state.check_alive()?;
        Ok(self.fetch_direction)
    }

    fn set_fetch_direction(&mut self, direction: FetchDirection) -> BackendResult<()> {
        self.state.call(format!("set_fetch_direction({direction:?})"))?;
        self.fetch_direction = direction;
        Ok(())
    }

    fn max_rows(&mut self) -> BackendResult<usize> {
        self.state.check_alive()?;
        Ok(self.max_rows)
    }

    fn set_max_rows(&mut self, rows: usize) -> BackendResult<()> {
        self.state.call(format!("set_max_rows({rows})"))?;
        self.max_rows = rows;
        Ok(())
    }

    fn query_timeout(&mut self) -> BackendResult<Duration> {
        self.state.check_alive()?;
        Ok(self.query_timeout)
    }

    fn set_query_timeout(&mut self, timeout: Duration) -> BackendResult<()> {
        self.state.call(format!("set_query_timeout({}ms)", timeout.as_millis()))?;
        self.query_timeout = timeout;
        Ok(())
    }

    fn set_cursor_name(&mut self, name: &str) -> BackendResult<()> {
        self.state.call(format!("set_cursor_name({name})"))
    }

    fn close(&mut self) -> BackendResult<()> {
        self.state.call("close_statement")
    }
}

struct MockResultSet {
    state: Arc<MockState>,
    columns: Vec<String>,
    rows: std::vec::IntoIter<Row>,
    open: bool,
}

impl MockResultSet {
    fn release(&mut self) {
        if std::mem::take(&mut self.open) {
            self.state.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl ResultSet for MockResultSet {
    fn columns(&self) -> BackendResult<Vec<String>> {
        Ok(self.columns.clone())
    }

    fn next_row(&mut self) -> BackendResult<Option<Row>> {
        self.state.check_alive()?;
        Ok(self.rows.next())
    }

    fn close(&mut self) -> BackendResult<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MockResultSet {
    fn drop(&mut self) {
        self.release();
    }
}
