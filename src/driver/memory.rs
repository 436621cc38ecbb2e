//! In-process scripted driver.
//!
//! Records every driver interaction as a [`DriverEvent`] and lets callers
//! script row counts, query results and failures. The batcher and context
//! test suites run against it, and it doubles as a stand-in connection
//! provider when embedding the session layer without a real database.

use super::{
    Connection, ConnectionProvider, GeneratedKeys, PrepareOptions, ResultSet, RowCount, SqlError,
    SqlResult, SqlWarning, Statement,
};
use crate::core::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Driver call recorded by [`MemoryDatabase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    ConnectionOpened(u64),
    ConnectionClosed(u64),
    Prepared {
        statement: u64,
        sql: String,
        callable: bool,
        scrollable: bool,
        generated_keys: bool,
    },
    FetchSize { statement: u64, rows: u32 },
    QueryTimeout { statement: u64, seconds: u32 },
    MaxRows { statement: u64, rows: u64 },
    ExecutedUpdate { statement: u64, sql: String },
    ExecutedQuery { statement: u64, sql: String },
    BatchAdded { statement: u64 },
    BatchExecuted { statement: u64, sql: String, size: usize },
    Cancelled { statement: u64 },
    StatementClosed { statement: u64, sql: String },
    ResultSetClosed { result_set: u64 },
    FindColumn { result_set: u64, name: String },
    AutoCommit { connection: u64, enabled: bool },
    Committed(u64),
    RolledBack(u64),
}

/// Driver call that can be made to fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fault {
    GetConnection,
    CloseConnection,
    /// Preparing any statement whose SQL contains the given text.
    Prepare(String),
    ExecuteUpdate,
    ExecuteQuery,
    ExecuteBatch,
    ResetMaxRows,
    CloseStatement,
    CloseResultSet,
    Cancel,
    AutoCommit,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct QueryData {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Default)]
struct DriverState {
    events: Vec<DriverEvent>,
    next_id: u64,
    faults: HashMap<Fault, SqlError>,
    update_counts: VecDeque<u64>,
    batch_counts: VecDeque<Vec<RowCount>>,
    queries: HashMap<String, QueryData>,
    warnings: Vec<SqlWarning>,
    open_connections: usize,
    open_statements: usize,
    open_result_sets: usize,
    next_key: i64,
}

impl DriverState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, fault: &Fault) -> SqlResult<()> {
        match self.faults.get(fault) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn check_prepare(&self, sql: &str) -> SqlResult<()> {
        for (fault, err) in &self.faults {
            if let Fault::Prepare(fragment) = fault {
                if sql.contains(fragment.as_str()) {
                    return Err(err.clone());
                }
            }
        }
        Ok(())
    }
}

type SharedState = Arc<Mutex<DriverState>>;

fn lock(state: &SharedState) -> SqlResult<MutexGuard<'_, DriverState>> {
    state
        .lock()
        .map_err(|_| SqlError::with_state("driver state poisoned", "HY000"))
}

/// Scripted in-memory database acting as a [`ConnectionProvider`].
#[derive(Clone)]
pub struct MemoryDatabase {
    state: SharedState,
    aggressive_release: bool,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DriverState::default())),
            aggressive_release: true,
        }
    }

    /// Declare whether connections may be released after each statement.
    pub fn with_aggressive_release(mut self, supported: bool) -> Self {
        self.aggressive_release = supported;
        self
    }

    /// Register the columns and rows a query returns.
    pub fn register_query(&self, sql: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        if let Ok(mut state) = self.state.lock() {
            state.queries.insert(
                sql.to_string(),
                QueryData {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    rows,
                },
            );
        }
    }

    /// Queue the row count returned by the next `execute_update`.
    pub fn script_update_count(&self, rows: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.update_counts.push_back(rows);
        }
    }

    /// Queue the row counts returned by the next `execute_batch`.
    pub fn script_batch_counts(&self, counts: Vec<RowCount>) {
        if let Ok(mut state) = self.state.lock() {
            state.batch_counts.push_back(counts);
        }
    }

    pub fn add_warning(&self, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.warnings.push(SqlWarning {
                message: message.to_string(),
                sql_state: None,
            });
        }
    }

    pub fn fail(&self, fault: Fault, error: SqlError) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.insert(fault, error);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.clear();
        }
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        self.state
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    pub fn clear_events(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.events.clear();
        }
    }

    /// Number of statements prepared so far.
    pub fn prepared_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, DriverEvent::Prepared { .. }))
            .count()
    }

    /// Sizes of every executed batch, in execution order.
    pub fn executed_batches(&self) -> Vec<usize> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                DriverEvent::BatchExecuted { size, .. } => Some(*size),
                _ => None,
            })
            .collect()
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().map(|s| s.open_connections).unwrap_or(0)
    }

    pub fn open_statements(&self) -> usize {
        self.state.lock().map(|s| s.open_statements).unwrap_or(0)
    }

    pub fn open_result_sets(&self) -> usize {
        self.state.lock().map(|s| s.open_result_sets).unwrap_or(0)
    }

    /// Open a connection outside the provider contract, e.g. to hand a
    /// user-supplied connection to a session.
    pub fn connect(&self) -> SqlResult<Arc<MemoryConnection>> {
        let mut state = lock(&self.state)?;
        state.check(&Fault::GetConnection)?;
        let id = state.next_id();
        state.open_connections += 1;
        state.events.push(DriverEvent::ConnectionOpened(id));
        Ok(Arc::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            auto_commit: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }
}

impl ConnectionProvider for MemoryDatabase {
    fn get_connection(&self) -> SqlResult<Arc<dyn Connection>> {
        let connection: Arc<dyn Connection> = self.connect()?;
        Ok(connection)
    }

    fn close_connection(&self, connection: Arc<dyn Connection>) -> SqlResult<()> {
        lock(&self.state)?.check(&Fault::CloseConnection)?;
        connection.close()
    }

    fn supports_aggressive_release(&self) -> bool {
        self.aggressive_release
    }
}

pub struct MemoryConnection {
    id: u64,
    state: SharedState,
    auto_commit: AtomicBool,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> SqlResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SqlError::with_state("connection is closed", "08003"));
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn prepare(&self, sql: &str, options: &PrepareOptions) -> SqlResult<Arc<dyn Statement>> {
        self.ensure_open()?;
        let mut state = lock(&self.state)?;
        state.check_prepare(sql)?;
        let id = state.next_id();
        state.open_statements += 1;
        state.events.push(DriverEvent::Prepared {
            statement: id,
            sql: sql.to_string(),
            callable: options.callable,
            scrollable: options.scroll.is_some_and(|mode| mode.is_scrollable()),
            generated_keys: options.generated_keys != GeneratedKeys::None,
        });
        Ok(Arc::new(MemoryStatement {
            id,
            sql: sql.to_string(),
            state: Arc::clone(&self.state),
            local: Mutex::new(StatementState::default()),
        }))
    }

    fn auto_commit(&self) -> SqlResult<bool> {
        self.ensure_open()?;
        Ok(self.auto_commit.load(Ordering::SeqCst))
    }

    fn set_auto_commit(&self, auto_commit: bool) -> SqlResult<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state)?;
        state.check(&Fault::AutoCommit)?;
        self.auto_commit.store(auto_commit, Ordering::SeqCst);
        state.events.push(DriverEvent::AutoCommit {
            connection: self.id,
            enabled: auto_commit,
        });
        Ok(())
    }

    fn commit(&self) -> SqlResult<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state)?;
        state.check(&Fault::Commit)?;
        state.events.push(DriverEvent::Committed(self.id));
        Ok(())
    }

    fn rollback(&self) -> SqlResult<()> {
        self.ensure_open()?;
        lock(&self.state)?.events.push(DriverEvent::RolledBack(self.id));
        Ok(())
    }

    fn is_closed(&self) -> SqlResult<bool> {
        Ok(self.closed.load(Ordering::SeqCst))
    }

    fn warnings(&self) -> SqlResult<Vec<SqlWarning>> {
        Ok(lock(&self.state)?.warnings.clone())
    }

    fn clear_warnings(&self) -> SqlResult<()> {
        lock(&self.state)?.warnings.clear();
        Ok(())
    }

    fn close(&self) -> SqlResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = lock(&self.state)?;
            state.open_connections = state.open_connections.saturating_sub(1);
            state.events.push(DriverEvent::ConnectionClosed(self.id));
        }
        Ok(())
    }
}

#[derive(Default)]
struct StatementState {
    params: HashMap<usize, Value>,
    pending_batch: usize,
    query_timeout: u32,
    max_rows: u64,
    out_parameters: HashMap<usize, Option<Value>>,
    last_update: u64,
    closed: bool,
}

pub struct MemoryStatement {
    id: u64,
    sql: String,
    state: SharedState,
    local: Mutex<StatementState>,
}

impl MemoryStatement {
    fn local(&self) -> SqlResult<MutexGuard<'_, StatementState>> {
        let local = self
            .local
            .lock()
            .map_err(|_| SqlError::with_state("statement state poisoned", "HY000"))?;
        if local.closed {
            return Err(SqlError::with_state("statement is closed", "HY010"));
        }
        Ok(local)
    }

    fn new_result_set(&self, state: &mut DriverState, data: QueryData) -> Arc<dyn ResultSet> {
        let id = state.next_id();
        state.open_result_sets += 1;
        Arc::new(MemoryResultSet {
            id,
            state: Arc::clone(&self.state),
            columns: data.columns,
            rows: data.rows,
            cursor: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn run_update(&self, local: &mut StatementState) -> SqlResult<u64> {
        let mut state = lock(&self.state)?;
        state.check(&Fault::ExecuteUpdate)?;
        let rows = state.update_counts.pop_front().unwrap_or(1);
        state.events.push(DriverEvent::ExecutedUpdate {
            statement: self.id,
            sql: self.sql.clone(),
        });
        local.last_update = rows;
        for value in local.out_parameters.values_mut() {
            *value = Some(Value::Integer(rows as i64));
        }
        Ok(rows)
    }
}

impl Statement for MemoryStatement {
    fn bind(&self, index: usize, value: Value) -> SqlResult<()> {
        self.local()?.params.insert(index, value);
        Ok(())
    }

    fn register_out_parameter(&self, index: usize) -> SqlResult<()> {
        self.local()?.out_parameters.insert(index, None);
        Ok(())
    }

    fn out_parameter(&self, index: usize) -> SqlResult<Value> {
        match self.local()?.out_parameters.get(&index) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Ok(Value::Null),
            None => Err(SqlError::with_state(
                format!("parameter {} was not registered as OUT", index),
                "07009",
            )),
        }
    }

    fn execute_update(&self) -> SqlResult<u64> {
        let mut local = self.local()?;
        self.run_update(&mut local)
    }

    fn execute_query(&self) -> SqlResult<Arc<dyn ResultSet>> {
        let _local = self.local()?;
        let mut state = lock(&self.state)?;
        state.check(&Fault::ExecuteQuery)?;
        state.events.push(DriverEvent::ExecutedQuery {
            statement: self.id,
            sql: self.sql.clone(),
        });
        let data = state.queries.get(&self.sql).cloned().unwrap_or_default();
        Ok(self.new_result_set(&mut state, data))
    }

    fn execute(&self) -> SqlResult<Option<Arc<dyn ResultSet>>> {
        let returns_rows = lock(&self.state)?.queries.contains_key(&self.sql);
        if returns_rows {
            self.execute_query().map(Some)
        } else {
            self.execute_update().map(|_| None)
        }
    }

    fn add_batch(&self) -> SqlResult<()> {
        let mut local = self.local()?;
        local.pending_batch += 1;
        local.params.clear();
        lock(&self.state)?
            .events
            .push(DriverEvent::BatchAdded { statement: self.id });
        Ok(())
    }

    fn execute_batch(&self) -> SqlResult<Vec<RowCount>> {
        let mut local = self.local()?;
        let size = std::mem::take(&mut local.pending_batch);
        let mut state = lock(&self.state)?;
        state.check(&Fault::ExecuteBatch)?;
        state.events.push(DriverEvent::BatchExecuted {
            statement: self.id,
            sql: self.sql.clone(),
            size,
        });
        Ok(state
            .batch_counts
            .pop_front()
            .unwrap_or_else(|| vec![RowCount::Affected(1); size]))
    }

    fn generated_keys(&self) -> SqlResult<Arc<dyn ResultSet>> {
        let _local = self.local()?;
        let mut state = lock(&self.state)?;
        state.next_key += 1;
        let data = QueryData {
            columns: vec!["id".to_string()],
            rows: vec![vec![Value::Integer(state.next_key)]],
        };
        Ok(self.new_result_set(&mut state, data))
    }

    fn set_fetch_size(&self, rows: u32) -> SqlResult<()> {
        let _local = self.local()?;
        lock(&self.state)?.events.push(DriverEvent::FetchSize {
            statement: self.id,
            rows,
        });
        Ok(())
    }

    fn query_timeout(&self) -> SqlResult<u32> {
        Ok(self.local()?.query_timeout)
    }

    fn set_query_timeout(&self, seconds: u32) -> SqlResult<()> {
        self.local()?.query_timeout = seconds;
        lock(&self.state)?.events.push(DriverEvent::QueryTimeout {
            statement: self.id,
            seconds,
        });
        Ok(())
    }

    fn max_rows(&self) -> SqlResult<u64> {
        Ok(self.local()?.max_rows)
    }

    fn set_max_rows(&self, rows: u64) -> SqlResult<()> {
        let mut local = self.local()?;
        let mut state = lock(&self.state)?;
        if rows == 0 {
            state.check(&Fault::ResetMaxRows)?;
        }
        local.max_rows = rows;
        state.events.push(DriverEvent::MaxRows {
            statement: self.id,
            rows,
        });
        Ok(())
    }

    fn cancel(&self) -> SqlResult<()> {
        let _local = self.local()?;
        let mut state = lock(&self.state)?;
        state.check(&Fault::Cancel)?;
        state
            .events
            .push(DriverEvent::Cancelled { statement: self.id });
        Ok(())
    }

    fn close(&self) -> SqlResult<()> {
        let mut local = self
            .local
            .lock()
            .map_err(|_| SqlError::with_state("statement state poisoned", "HY000"))?;
        if local.closed {
            return Ok(());
        }
        let mut state = lock(&self.state)?;
        state.check(&Fault::CloseStatement)?;
        local.closed = true;
        state.open_statements = state.open_statements.saturating_sub(1);
        state.events.push(DriverEvent::StatementClosed {
            statement: self.id,
            sql: self.sql.clone(),
        });
        Ok(())
    }
}

pub struct MemoryResultSet {
    id: u64,
    state: SharedState,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    cursor: Mutex<Option<usize>>,
    closed: AtomicBool,
}

impl MemoryResultSet {
    fn ensure_open(&self) -> SqlResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SqlError::with_state("result set is closed", "HY010"));
        }
        Ok(())
    }
}

impl ResultSet for MemoryResultSet {
    fn next(&self) -> SqlResult<bool> {
        self.ensure_open()?;
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| SqlError::with_state("cursor poisoned", "HY000"))?;
        let next = cursor.map_or(0, |row| row + 1);
        *cursor = Some(next);
        Ok(next < self.rows.len())
    }

    fn get(&self, column: usize) -> SqlResult<Value> {
        self.ensure_open()?;
        let cursor = self
            .cursor
            .lock()
            .map_err(|_| SqlError::with_state("cursor poisoned", "HY000"))?;
        let row = cursor
            .and_then(|row| self.rows.get(row))
            .ok_or_else(|| SqlError::with_state("cursor is not on a row", "24000"))?;
        column
            .checked_sub(1)
            .and_then(|index| row.get(index))
            .cloned()
            .ok_or_else(|| SqlError::with_state(format!("invalid column index {}", column), "07009"))
    }

    fn find_column(&self, name: &str) -> SqlResult<usize> {
        self.ensure_open()?;
        lock(&self.state)?.events.push(DriverEvent::FindColumn {
            result_set: self.id,
            name: name.to_string(),
        });
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
            .map(|index| index + 1)
            .ok_or_else(|| SqlError::with_state(format!("column '{}' not found", name), "42S22"))
    }

    fn column_count(&self) -> SqlResult<usize> {
        Ok(self.columns.len())
    }

    fn close(&self) -> SqlResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = lock(&self.state)?;
        state.check(&Fault::CloseResultSet)?;
        self.closed.store(true, Ordering::SeqCst);
        state.open_result_sets = state.open_result_sets.saturating_sub(1);
        state
            .events
            .push(DriverEvent::ResultSetClosed { result_set: self.id });
        Ok(())
    }
}
