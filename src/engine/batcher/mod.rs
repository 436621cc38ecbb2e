// ============================================================================
// Statement Batcher
// ============================================================================
//
// Owns every statement and cursor a session hands out: prepares them on the
// session's connection, keeps the ones callers must close in registries,
// accumulates batched DML behind a single batch statement, and sweeps
// everything up when the session releases its resources.
//
// The batcher never holds a connection itself. Each operation that touches
// the driver is given a ConnectionSource, so release policy changes made by
// the owner take effect on the very next statement.
//
// ============================================================================

mod strategy;

pub use strategy::{
    BatchFailure, BatchResult, BatchStrategy, BatchingStrategy, NonBatchingStrategy, strategy_for,
};

use crate::config::Settings;
use crate::core::{Error, Result};
use crate::dialect::Dialect;
use crate::driver::{
    Connection, ConnectionProvider, GeneratedKeys, PrepareOptions, ResultSet, ScrollMode, Statement,
};
use crate::engine::column_cache::{CachingResultSet, ColumnNameCache};
use crate::engine::expectation::Expectation;
use crate::engine::interceptor::Interceptor;
use crate::engine::sql_logger::SqlStatementLogger;
use crate::engine::statistics::{ResourceCounters, ResourceStats, StatisticsCollector};
use crate::services::JdbcServices;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{Level, debug, trace, warn};

/// Where the batcher gets its connection and whom it tells when a
/// statement has been closed.
pub trait ConnectionSource {
    fn connection(&mut self) -> Result<Arc<dyn Connection>>;

    /// Called after each statement close outside a bulk release.
    fn after_statement(&mut self, batcher_has_open_resources: bool) -> Result<()>;
}

/// A statement handed out by the batcher.
#[derive(Clone)]
pub struct TrackedStatement {
    id: u64,
    sql: Arc<str>,
    statement: Arc<dyn Statement>,
}

impl TrackedStatement {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// SQL as prepared, after interceptor rewriting.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn statement(&self) -> &Arc<dyn Statement> {
        &self.statement
    }
}

impl Deref for TrackedStatement {
    type Target = dyn Statement;

    fn deref(&self) -> &Self::Target {
        self.statement.as_ref()
    }
}

impl fmt::Debug for TrackedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedStatement")
            .field("id", &self.id)
            .field("sql", &self.sql)
            .finish()
    }
}

/// A cursor handed out by the batcher.
#[derive(Clone)]
pub struct TrackedResultSet {
    id: u64,
    result_set: Arc<dyn ResultSet>,
}

impl TrackedResultSet {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn result_set(&self) -> &Arc<dyn ResultSet> {
        &self.result_set
    }
}

impl Deref for TrackedResultSet {
    type Target = dyn ResultSet;

    fn deref(&self) -> &Self::Target {
        self.result_set.as_ref()
    }
}

impl fmt::Debug for TrackedResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedResultSet")
            .field("id", &self.id)
            .finish()
    }
}

/// Obtain a physical connection from the provider.
pub(crate) fn open_physical(
    provider: &dyn ConnectionProvider,
    dialect: &dyn Dialect,
) -> Result<Arc<dyn Connection>> {
    debug!("opening JDBC connection");
    provider
        .get_connection()
        .map_err(|e| dialect.convert(e, "Cannot open connection", None))
}

/// Hand a physical connection back to the provider, reporting any pending
/// warnings first. Already closed connections are left alone.
pub(crate) fn close_physical(
    provider: &dyn ConnectionProvider,
    dialect: &dyn Dialect,
    connection: Arc<dyn Connection>,
) -> Result<()> {
    let closed = connection
        .is_closed()
        .map_err(|e| dialect.convert(e, "Cannot close connection", None))?;
    if closed {
        return Ok(());
    }
    log_and_clear_warnings(connection.as_ref());
    provider
        .close_connection(connection)
        .map_err(|e| dialect.convert(e, "Cannot close connection", None))
}

fn log_and_clear_warnings(connection: &dyn Connection) {
    match connection.warnings() {
        Ok(warnings) => {
            for warning in &warnings {
                warn!(sql_state = ?warning.sql_state, "SQL Warning: {}", warning.message);
            }
        }
        Err(e) => debug!("could not log warnings: {}", e),
    }
    if let Err(e) = connection.clear_warnings() {
        debug!("could not clear warnings: {}", e);
    }
}

pub struct Batcher {
    settings: Arc<Settings>,
    strategy: Box<dyn BatchStrategy>,
    provider: Arc<dyn ConnectionProvider>,
    dialect: Arc<dyn Dialect>,
    interceptor: Arc<dyn Interceptor>,
    sql_logger: SqlStatementLogger,
    statistics: Option<Arc<dyn StatisticsCollector>>,
    counters: Arc<ResourceCounters>,

    // debug-only counts, see log_open_statement
    open_statements: usize,
    open_result_sets: usize,

    statements_to_close: BTreeMap<u64, TrackedStatement>,
    result_sets_to_close: BTreeMap<u64, TrackedResultSet>,
    batch: Option<TrackedStatement>,
    last_query: Option<TrackedStatement>,

    /// Transaction deadline in epoch seconds.
    deadline: Option<i64>,
    releasing: bool,
    next_id: u64,
}

impl Batcher {
    pub fn new(services: &JdbcServices) -> Self {
        Self::with_strategy(services, strategy_for(services.settings().batch_size))
    }

    pub fn with_strategy(services: &JdbcServices, strategy: Box<dyn BatchStrategy>) -> Self {
        let settings = services.settings();
        Self {
            settings: Arc::new(settings.clone()),
            strategy,
            provider: Arc::clone(services.provider()),
            dialect: Arc::clone(services.dialect()),
            interceptor: Arc::clone(services.interceptor()),
            sql_logger: SqlStatementLogger::new(settings.show_sql, settings.format_sql),
            statistics: services.statistics().cloned(),
            counters: Arc::clone(services.resource_counters()),
            open_statements: 0,
            open_result_sets: 0,
            statements_to_close: BTreeMap::new(),
            result_sets_to_close: BTreeMap::new(),
            batch: None,
            last_query: None,
            deadline: None,
            releasing: false,
            next_id: 0,
        }
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    // ------------------------------------------------------------------
    // Preparation
    // ------------------------------------------------------------------

    /// Prepare a statement the caller executes immediately and closes with
    /// [`Batcher::close_statement`]. Any pending batch runs first.
    pub fn prepare_statement(
        &mut self,
        source: &mut dyn ConnectionSource,
        sql: &str,
        generated_keys: GeneratedKeys,
    ) -> Result<TrackedStatement> {
        let options = PrepareOptions {
            generated_keys,
            ..Default::default()
        };
        self.prepare_immediate(source, sql, options)
    }

    pub fn prepare_callable_statement(
        &mut self,
        source: &mut dyn ConnectionSource,
        sql: &str,
    ) -> Result<TrackedStatement> {
        let options = PrepareOptions {
            callable: true,
            ..Default::default()
        };
        self.prepare_immediate(source, sql, options)
    }

    /// Prepare a query statement. It stays registered until closed with
    /// [`Batcher::close_query_statement`] or swept by
    /// [`Batcher::close_statements`]. Without an explicit `scroll_mode` a
    /// scrollable cursor uses the dialect's default.
    pub fn prepare_query_statement(
        &mut self,
        source: &mut dyn ConnectionSource,
        sql: &str,
        scrollable: bool,
        scroll_mode: Option<ScrollMode>,
    ) -> Result<TrackedStatement> {
        self.prepare_query(source, sql, scrollable, scroll_mode, false)
    }

    pub fn prepare_callable_query_statement(
        &mut self,
        source: &mut dyn ConnectionSource,
        sql: &str,
        scrollable: bool,
        scroll_mode: Option<ScrollMode>,
    ) -> Result<TrackedStatement> {
        self.prepare_query(source, sql, scrollable, scroll_mode, true)
    }

    /// The batch statement for `sql`. Identical SQL reuses the current
    /// batch statement; different SQL executes and closes it first.
    pub fn prepare_batch_statement(
        &mut self,
        source: &mut dyn ConnectionSource,
        sql: &str,
    ) -> Result<TrackedStatement> {
        self.prepare_batch(source, sql, false)
    }

    pub fn prepare_batch_callable_statement(
        &mut self,
        source: &mut dyn ConnectionSource,
        sql: &str,
    ) -> Result<TrackedStatement> {
        self.prepare_batch(source, sql, true)
    }

    fn prepare_immediate(
        &mut self,
        source: &mut dyn ConnectionSource,
        sql: &str,
        options: PrepareOptions,
    ) -> Result<TrackedStatement> {
        self.check_support(false, &options.generated_keys)?;
        let sql = self.rewrite(sql)?;
        self.remaining_timeout()?;
        self.execute_batch(source)?;
        self.prepare_tracked(source, sql, options, false)
    }

    fn prepare_query(
        &mut self,
        source: &mut dyn ConnectionSource,
        sql: &str,
        scrollable: bool,
        scroll_mode: Option<ScrollMode>,
        callable: bool,
    ) -> Result<TrackedStatement> {
        self.check_support(scrollable, &GeneratedKeys::None)?;
        let sql = self.rewrite(sql)?;
        self.remaining_timeout()?;
        self.execute_batch(source)?;

        let scroll = scrollable
            .then(|| scroll_mode.unwrap_or_else(|| self.dialect.default_scroll_mode()));
        let options = PrepareOptions {
            callable,
            scroll,
            generated_keys: GeneratedKeys::None,
        };
        let statement = self.prepare_tracked(source, sql, options, true)?;
        self.statements_to_close
            .insert(statement.id, statement.clone());
        if scrollable {
            self.last_query = Some(statement.clone());
        }
        Ok(statement)
    }

    fn prepare_batch(
        &mut self,
        source: &mut dyn ConnectionSource,
        sql: &str,
        callable: bool,
    ) -> Result<TrackedStatement> {
        let sql = self.rewrite(sql)?;
        if let Some(batch) = &self.batch {
            if batch.sql == sql {
                debug!("reusing prepared statement");
                self.sql_logger.log_statement(&sql);
                return Ok(batch.clone());
            }
        }
        self.remaining_timeout()?;
        self.execute_batch(source)?;
        let options = PrepareOptions {
            callable,
            ..Default::default()
        };
        let statement = self.prepare_tracked(source, sql, options, false)?;
        self.batch = Some(statement.clone());
        Ok(statement)
    }

    fn check_support(&self, scrollable: bool, generated_keys: &GeneratedKeys) -> Result<()> {
        if scrollable && !self.settings.scrollable_result_sets {
            return Err(Error::Assertion("scrollable result sets are not enabled".into()));
        }
        if *generated_keys != GeneratedKeys::None && !self.settings.get_generated_keys {
            return Err(Error::Assertion(
                "getGeneratedKeys() support is not enabled".into(),
            ));
        }
        Ok(())
    }

    fn rewrite(&self, sql: &str) -> Result<Arc<str>> {
        let sql = self.interceptor.on_prepare_statement(sql);
        if sql.trim().is_empty() {
            return Err(Error::Assertion(
                "Interceptor::on_prepare_statement() returned an empty string".into(),
            ));
        }
        Ok(Arc::from(sql))
    }

    /// Seconds left before the transaction deadline.
    fn remaining_timeout(&self) -> Result<Option<u32>> {
        let Some(deadline) = self.deadline else {
            return Ok(None);
        };
        let remaining = deadline - Utc::now().timestamp();
        if remaining <= 0 {
            return Err(Error::TransactionTimeout);
        }
        Ok(Some(u32::try_from(remaining).unwrap_or(u32::MAX)))
    }

    fn prepare_tracked(
        &mut self,
        source: &mut dyn ConnectionSource,
        sql: Arc<str>,
        options: PrepareOptions,
        query: bool,
    ) -> Result<TrackedStatement> {
        self.sql_logger.log_statement(&sql);
        let connection = source.connection()?;
        trace!(callable = options.callable, "preparing statement");
        let statement = connection
            .prepare(&sql, &options)
            .map_err(|e| self.dialect.convert(e, "could not prepare statement", Some(&*sql)))?;
        self.next_id += 1;
        let tracked = TrackedStatement {
            id: self.next_id,
            sql,
            statement,
        };

        if let Err(err) = self.configure(&tracked, query) {
            if let Err(close_err) = tracked.close() {
                warn!("could not close statement after failed setup: {}", close_err);
            }
            return Err(err);
        }

        self.log_open_statement();
        if let Some(statistics) = &self.statistics {
            statistics.prepare_statement();
        }
        Ok(tracked)
    }

    fn configure(&self, statement: &TrackedStatement, query: bool) -> Result<()> {
        if let Some(seconds) = self.remaining_timeout()? {
            statement
                .set_query_timeout(seconds)
                .map_err(|e| self.dialect.convert(e, "could not set query timeout", Some(statement.sql())))?;
        }
        if query {
            if let Some(rows) = self.settings.fetch_size {
                statement
                    .set_fetch_size(rows)
                    .map_err(|e| self.dialect.convert(e, "could not set fetch size", Some(statement.sql())))?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Add the operation currently bound on the batch statement.
    pub fn add_to_batch(&mut self, expectation: Arc<dyn Expectation>) -> Result<()> {
        let batch = self
            .batch
            .clone()
            .ok_or_else(|| Error::Assertion("no batch statement has been prepared".into()))?;
        self.strategy
            .add_to_batch(batch.statement.as_ref(), expectation)
            .map_err(|failure| self.convert_failure(failure, &batch.sql))
    }

    /// Execute the pending batch, if any, and close its statement.
    pub fn execute_batch(&mut self, source: &mut dyn ConnectionSource) -> Result<()> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };
        let executed = self
            .strategy
            .execute_batch(batch.statement.as_ref())
            .map_err(|failure| self.convert_failure(failure, &batch.sql));
        let closed = self.close_prepared(Some(source), &batch);
        executed.and(closed)
    }

    /// Drop the pending batch after a failure elsewhere. Close failures are
    /// logged so the original failure is what the caller sees.
    pub fn abort_batch(&mut self, source: &mut dyn ConnectionSource) {
        let Some(batch) = self.batch.take() else {
            return;
        };
        self.strategy.discard();
        if let Err(e) = self.close_prepared(Some(source), &batch) {
            warn!("could not close batch statement: {}", e);
        }
    }

    pub fn pending_batch_size(&self) -> usize {
        if self.batch.is_some() {
            self.strategy.pending()
        } else {
            0
        }
    }

    pub fn batch_sql(&self) -> Option<&str> {
        self.batch.as_ref().map(|b| b.sql())
    }

    fn convert_failure(&self, failure: BatchFailure, sql: &str) -> Error {
        match failure {
            BatchFailure::Driver { error, action } => self.dialect.convert(error, action, Some(sql)),
            BatchFailure::Outcome(err) => err,
        }
    }

    // ------------------------------------------------------------------
    // Result sets
    // ------------------------------------------------------------------

    /// Execute a query statement and register its cursor.
    pub fn get_result_set(&mut self, statement: &TrackedStatement) -> Result<TrackedResultSet> {
        let result_set = statement
            .execute_query()
            .map_err(|e| self.dialect.convert(e, "could not execute query", Some(statement.sql())))?;
        Ok(self.register_result_set(result_set))
    }

    /// Execute a callable statement and register the cursor the dialect
    /// extracts from it.
    pub fn get_callable_result_set(&mut self, statement: &TrackedStatement) -> Result<TrackedResultSet> {
        let result_set = self
            .dialect
            .result_set_from_callable(statement.statement.as_ref())
            .map_err(|e| self.dialect.convert(e, "could not execute query", Some(statement.sql())))?;
        Ok(self.register_result_set(result_set))
    }

    fn register_result_set(&mut self, result_set: Arc<dyn ResultSet>) -> TrackedResultSet {
        let result_set: Arc<dyn ResultSet> = if self.settings.wrap_result_sets {
            let columns = result_set.column_count().unwrap_or(0);
            Arc::new(CachingResultSet::new(
                result_set,
                Arc::new(ColumnNameCache::new(columns)),
            ))
        } else {
            result_set
        };
        self.next_id += 1;
        let tracked = TrackedResultSet {
            id: self.next_id,
            result_set,
        };
        self.result_sets_to_close.insert(tracked.id, tracked.clone());
        self.log_open_results();
        tracked
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Close a query statement and, if given, its cursor. Each is only
    /// closed if still registered; the cursor goes first.
    pub fn close_query_statement(
        &mut self,
        source: &mut dyn ConnectionSource,
        statement: &TrackedStatement,
        result_set: Option<&TrackedResultSet>,
    ) -> Result<()> {
        let still_tracked = self.statements_to_close.remove(&statement.id).is_some();
        let mut outcome = Ok(());
        if let Some(result_set) = result_set {
            if self.result_sets_to_close.remove(&result_set.id).is_some() {
                self.log_close_results();
                if let Err(e) = result_set.close() {
                    outcome = Err(self.dialect.convert(e, "could not close result set", Some(statement.sql())));
                }
            }
        }
        if still_tracked {
            outcome = outcome.and(self.close_query(Some(source), statement));
        }
        outcome
    }

    /// Close a statement obtained from one of the prepare operations.
    pub fn close_statement(
        &mut self,
        source: &mut dyn ConnectionSource,
        statement: &TrackedStatement,
    ) -> Result<()> {
        if self.statements_to_close.remove(&statement.id).is_some() {
            return self.close_query(Some(source), statement);
        }
        if self.batch.as_ref().is_some_and(|b| b.id == statement.id) {
            self.batch = None;
            self.strategy.discard();
        }
        self.close_prepared(Some(source), statement)
    }

    /// Close the batch statement and every registered cursor and statement.
    ///
    /// Every close is attempted; failures are logged and returned, never
    /// raised, and both registries are empty afterwards.
    pub fn close_statements(&mut self) -> Vec<Error> {
        self.releasing = true;
        let mut failures = Vec::new();

        if let Some(batch) = self.batch.take() {
            self.strategy.discard();
            self.log_close_statement();
            if let Err(e) = batch.close() {
                warn!("could not close a JDBC prepared statement: {}", e);
                failures.push(self.dialect.convert(e, "could not close a JDBC prepared statement", Some(batch.sql())));
            }
        }

        for (_, result_set) in std::mem::take(&mut self.result_sets_to_close) {
            self.log_close_results();
            if let Err(e) = result_set.close() {
                warn!("could not close a JDBC result set: {}", e);
                failures.push(self.dialect.convert(e, "could not close a JDBC result set", None));
            }
        }

        for (_, statement) in std::mem::take(&mut self.statements_to_close) {
            if let Err(e) = self.close_query(None, &statement) {
                warn!("could not close a JDBC statement: {}", e);
                failures.push(e);
            }
        }

        self.last_query = None;
        self.releasing = false;
        failures
    }

    fn close_query(
        &mut self,
        source: Option<&mut dyn ConnectionSource>,
        statement: &TrackedStatement,
    ) -> Result<()> {
        reset_statement(statement);
        let closed = self.close_prepared(source, statement);
        if self.last_query.as_ref().is_some_and(|q| q.id == statement.id) {
            self.last_query = None;
        }
        closed
    }

    fn close_prepared(
        &mut self,
        source: Option<&mut dyn ConnectionSource>,
        statement: &TrackedStatement,
    ) -> Result<()> {
        self.log_close_statement();
        trace!("closing statement");
        let closed = statement
            .close()
            .map_err(|e| self.dialect.convert(e, "could not close statement", Some(statement.sql())));
        if closed.is_ok() {
            if let Some(statistics) = &self.statistics {
                statistics.close_statement();
            }
        }
        let released = match source {
            Some(source) if !self.releasing => source.after_statement(self.has_open_resources()),
            _ => Ok(()),
        };
        closed.and(released)
    }

    /// Cancel the most recently prepared scrollable query, if still open.
    pub fn cancel_last_query(&self) -> Result<()> {
        if let Some(query) = &self.last_query {
            query
                .cancel()
                .map_err(|e| self.dialect.convert(e, "Cannot cancel query", Some(query.sql())))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    pub fn open_connection(&self) -> Result<Arc<dyn Connection>> {
        open_physical(self.provider.as_ref(), self.dialect.as_ref())
    }

    pub fn close_connection(&self, connection: Arc<dyn Connection>) -> Result<()> {
        debug!("closing JDBC connection ({})", self.open_resource_stats());
        close_physical(self.provider.as_ref(), self.dialect.as_ref(), connection)
    }

    // ------------------------------------------------------------------
    // Timeouts and bookkeeping
    // ------------------------------------------------------------------

    pub fn set_transaction_timeout(&mut self, seconds: u32) {
        self.deadline = Some(Utc::now().timestamp() + i64::from(seconds));
    }

    pub fn unset_transaction_timeout(&mut self) {
        self.deadline = None;
    }

    pub fn transaction_deadline(&self) -> Option<i64> {
        self.deadline
    }

    /// Registered statements or cursors are still waiting to be closed.
    pub fn has_open_resources(&self) -> bool {
        !self.statements_to_close.is_empty() || !self.result_sets_to_close.is_empty()
    }

    pub fn registered_statements(&self) -> usize {
        self.statements_to_close.len()
    }

    pub fn registered_result_sets(&self) -> usize {
        self.result_sets_to_close.len()
    }

    /// Open counts for this batcher. Only tracked while debug logging is
    /// enabled; zero otherwise.
    pub fn open_resource_stats(&self) -> ResourceStats {
        ResourceStats {
            open_statements: self.open_statements,
            open_result_sets: self.open_result_sets,
        }
    }

    fn log_open_statement(&mut self) {
        if tracing::enabled!(Level::DEBUG) {
            if self.open_statements == 0 {
                debug!(
                    "about to open statement (open statements: 0, globally: {})",
                    self.counters.stats().open_statements
                );
            }
            self.open_statements += 1;
            self.counters.statement_opened();
        }
    }

    fn log_close_statement(&mut self) {
        if tracing::enabled!(Level::DEBUG) && self.open_statements > 0 {
            self.open_statements -= 1;
            self.counters.statement_closed();
            if self.open_statements == 0 {
                debug!(
                    "about to close statement (open statements: 1, globally: {})",
                    self.counters.stats().open_statements + 1
                );
            }
        }
    }

    fn log_open_results(&mut self) {
        if tracing::enabled!(Level::DEBUG) {
            if self.open_result_sets == 0 {
                debug!(
                    "about to open result set (open result sets: 0, globally: {})",
                    self.counters.stats().open_result_sets
                );
            }
            self.open_result_sets += 1;
            self.counters.result_set_opened();
        }
    }

    fn log_close_results(&mut self) {
        if tracing::enabled!(Level::DEBUG) && self.open_result_sets > 0 {
            self.open_result_sets -= 1;
            self.counters.result_set_closed();
            if self.open_result_sets == 0 {
                debug!(
                    "about to close result set (open result sets: 1, globally: {})",
                    self.counters.stats().open_result_sets + 1
                );
            }
        }
    }
}

/// Undo max-rows and query-timeout changes before a statement is closed;
/// some pools hand the same driver statement out again.
fn reset_statement(statement: &TrackedStatement) {
    let reset = (|| {
        if statement.max_rows()? != 0 {
            statement.set_max_rows(0)?;
        }
        if statement.query_timeout()? != 0 {
            statement.set_query_timeout(0)?;
        }
        Ok::<(), crate::driver::SqlError>(())
    })();
    if let Err(e) = reset {
        warn!("exception clearing maxRows/queryTimeout: {}", e);
    }
}

impl fmt::Debug for Batcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batcher")
            .field("batch_sql", &self.batch_sql())
            .field("pending", &self.pending_batch_size())
            .field("statements", &self.statements_to_close.len())
            .field("result_sets", &self.result_sets_to_close.len())
            .field("deadline", &self.deadline)
            .finish()
    }
}
