// ============================================================================
// Connection Manager
// ============================================================================
//
// Owns the session's single physical connection and the batcher working on
// it. The connection is opened lazily and handed back to the provider
// according to the release mode:
//
//   AfterStatement    after every statement once the batcher holds nothing
//   AfterTransaction  when the transaction completes (or after each
//                     statement while in autocommit)
//   OnClose           only when the session closes
//
// A connection supplied by the application is never released; the manager
// only forgets it on close.
//
// ============================================================================

use crate::config::ConnectionReleaseMode;
use crate::core::{Error, Result};
use crate::dialect::Dialect;
use crate::driver::{Connection, ConnectionProvider, GeneratedKeys, ScrollMode, SqlError};
use crate::engine::batcher::{self, Batcher, ConnectionSource, TrackedResultSet, TrackedStatement};
use crate::engine::expectation::Expectation;
use crate::engine::statistics::StatisticsCollector;
use crate::services::JdbcServices;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace};

/// Answers whether a transaction is currently in progress for the session.
pub trait TransactionProbe {
    fn is_transaction_in_progress(&self) -> bool;
}

/// Probe with a fixed answer, for managers used outside a context.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProbe(pub bool);

impl TransactionProbe for FixedProbe {
    fn is_transaction_in_progress(&self) -> bool {
        self.0
    }
}

/// What a cleanup did.
#[derive(Default)]
pub struct Cleanup {
    /// A connection was held and has been released (or forgotten).
    pub performed: bool,
    /// The application-supplied connection, handed back to the caller.
    pub supplied_connection: Option<Arc<dyn Connection>>,
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanup")
            .field("performed", &self.performed)
            .field("supplied_connection", &self.supplied_connection.is_some())
            .finish()
    }
}

/// Serializable part of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerState {
    pub release_mode: ConnectionReleaseMode,
    pub closed: bool,
    pub flushing: bool,
    pub supplied: bool,
}

/// Connection state kept apart from the batcher so both can be borrowed at
/// once while statements are being prepared.
struct ConnectionSlot {
    provider: Arc<dyn ConnectionProvider>,
    dialect: Arc<dyn Dialect>,
    statistics: Option<Arc<dyn StatisticsCollector>>,
    connection: Option<Arc<dyn Connection>>,
    release_mode: ConnectionReleaseMode,
    supplied: bool,
    closed: bool,
    flushing: bool,
    /// Usable flag of the outstanding borrowed proxy.
    borrowed: Option<Arc<AtomicBool>>,
}

impl ConnectionSlot {
    fn connection(&mut self) -> Result<Arc<dyn Connection>> {
        if self.closed {
            return Err(Error::Session("connection manager has been closed".into()));
        }
        if let Some(connection) = &self.connection {
            return Ok(Arc::clone(connection));
        }
        let connection = batcher::open_physical(self.provider.as_ref(), self.dialect.as_ref())?;
        self.connection = Some(Arc::clone(&connection));
        if let Some(statistics) = &self.statistics {
            statistics.connect();
        }
        Ok(connection)
    }

    fn is_auto_commit(&self) -> Result<bool> {
        let Some(connection) = &self.connection else {
            return Ok(true);
        };
        let convert = |e: SqlError| self.dialect.convert(e, "could not inspect JDBC autocommit mode", None);
        if connection.is_closed().map_err(convert)? {
            return Ok(true);
        }
        connection.auto_commit().map_err(convert)
    }

    fn is_aggressive_release(&self, probe: &dyn TransactionProbe) -> bool {
        match self.release_mode {
            ConnectionReleaseMode::AfterStatement => true,
            ConnectionReleaseMode::AfterTransaction => {
                self.is_auto_commit().unwrap_or(true) && !probe.is_transaction_in_progress()
            }
            ConnectionReleaseMode::OnClose => false,
        }
    }

    fn is_aggressive_release_no_transaction_check(&self) -> bool {
        match self.release_mode {
            ConnectionReleaseMode::AfterStatement => true,
            ConnectionReleaseMode::AfterTransaction => self.is_auto_commit().unwrap_or(true),
            ConnectionReleaseMode::OnClose => false,
        }
    }

    fn after_statement(&mut self, batcher_has_open_resources: bool, probe: &dyn TransactionProbe) {
        if !self.is_aggressive_release(probe) {
            return;
        }
        if self.flushing {
            debug!("skipping aggressive release due to flush cycle");
        } else if batcher_has_open_resources {
            debug!("skipping aggressive release due to open resources on batcher");
        } else if self.is_borrowed() {
            debug!("skipping aggressive release due to borrowed connection");
        } else {
            self.aggressive_release();
        }
    }

    fn aggressive_release(&mut self) {
        if !self.supplied {
            debug!("aggressively releasing JDBC connection");
            self.close_connection();
        }
    }

    fn close_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = batcher::close_physical(
                self.provider.as_ref(),
                self.dialect.as_ref(),
                connection,
            ) {
                debug!("exception closing connection; assuming it is no longer open: {}", e);
            }
        }
    }

    /// A proxy closed by the application clears the flag without touching
    /// the slot, so presence alone does not mean borrowed.
    fn is_borrowed(&self) -> bool {
        self.borrowed
            .as_ref()
            .is_some_and(|usable| usable.load(Ordering::SeqCst))
    }

    fn release_borrowed(&mut self) {
        if let Some(usable) = self.borrowed.take() {
            usable.store(false, Ordering::SeqCst);
        }
    }
}

/// [`ConnectionSource`] backed by the manager's slot.
struct ManagedSource<'a> {
    slot: &'a mut ConnectionSlot,
    probe: Box<dyn TransactionProbe + 'a>,
}

impl ConnectionSource for ManagedSource<'_> {
    fn connection(&mut self) -> Result<Arc<dyn Connection>> {
        self.slot.connection()
    }

    fn after_statement(&mut self, batcher_has_open_resources: bool) -> Result<()> {
        self.slot
            .after_statement(batcher_has_open_resources, self.probe.as_ref());
        Ok(())
    }
}

pub struct ConnectionManager {
    slot: ConnectionSlot,
    batcher: Batcher,
}

impl ConnectionManager {
    /// A manager for `services`. Supplying a connection forces
    /// [`ConnectionReleaseMode::OnClose`].
    pub fn new(
        services: &JdbcServices,
        release_mode: ConnectionReleaseMode,
        supplied_connection: Option<Arc<dyn Connection>>,
    ) -> Self {
        let supplied = supplied_connection.is_some();
        Self {
            slot: ConnectionSlot {
                provider: Arc::clone(services.provider()),
                dialect: Arc::clone(services.dialect()),
                statistics: services.statistics().cloned(),
                connection: supplied_connection,
                release_mode: if supplied {
                    ConnectionReleaseMode::OnClose
                } else {
                    release_mode
                },
                supplied,
                closed: false,
                flushing: false,
                borrowed: None,
            },
            batcher: Batcher::new(services),
        }
    }

    /// Rebuild a manager from serialized state. The connection is not
    /// restored; a supplied one must be handed back with
    /// [`ConnectionManager::manual_reconnect`].
    pub fn restore(services: &JdbcServices, state: ManagerState) -> Self {
        let mut manager = Self::new(services, state.release_mode, None);
        manager.slot.supplied = state.supplied;
        manager.slot.closed = state.closed;
        manager.slot.flushing = state.flushing;
        manager
    }

    pub fn state(&self) -> ManagerState {
        ManagerState {
            release_mode: self.slot.release_mode,
            closed: self.slot.closed,
            flushing: self.slot.flushing,
            supplied: self.slot.supplied,
        }
    }

    pub fn batcher(&self) -> &Batcher {
        &self.batcher
    }

    pub fn batcher_mut(&mut self) -> &mut Batcher {
        &mut self.batcher
    }

    /// Statement operations on the batcher, drawing connections from this
    /// manager.
    pub fn statements<'a>(&'a mut self, probe: Box<dyn TransactionProbe + 'a>) -> Statements<'a> {
        Statements {
            batcher: &mut self.batcher,
            source: ManagedSource {
                slot: &mut self.slot,
                probe,
            },
        }
    }

    pub fn release_mode(&self) -> ConnectionReleaseMode {
        self.slot.release_mode
    }

    pub fn is_supplied_connection(&self) -> bool {
        self.slot.supplied
    }

    pub fn is_closed(&self) -> bool {
        self.slot.closed
    }

    /// The physical connection, opened on first use.
    pub fn connection(&mut self) -> Result<Arc<dyn Connection>> {
        self.slot.connection()
    }

    pub fn has_borrowed_connection(&self) -> bool {
        self.slot.is_borrowed()
    }

    /// Usable flag for the borrowed proxy, shared by every borrow until the
    /// borrow is released or a proxy is closed.
    pub(crate) fn borrow_flag(&mut self) -> Result<Arc<AtomicBool>> {
        if self.slot.closed {
            return Err(Error::Session("connection manager has been closed".into()));
        }
        match &self.slot.borrowed {
            Some(usable) if usable.load(Ordering::SeqCst) => Ok(Arc::clone(usable)),
            _ => {
                let usable = Arc::new(AtomicBool::new(true));
                self.slot.borrowed = Some(Arc::clone(&usable));
                Ok(usable)
            }
        }
    }

    /// Make the outstanding borrowed proxy unusable.
    pub fn release_borrowed_connection(&mut self) {
        self.slot.release_borrowed();
    }

    /// Autocommit state of the connection. No connection, or a closed one,
    /// counts as autocommit.
    pub fn is_auto_commit(&self) -> Result<bool> {
        self.slot.is_auto_commit()
    }

    pub fn is_aggressive_release(&self, probe: &dyn TransactionProbe) -> bool {
        self.slot.is_aggressive_release(probe)
    }

    pub fn is_currently_connected(&self) -> bool {
        if self.slot.supplied {
            self.slot.connection.is_some()
        } else {
            !self.slot.closed
        }
    }

    /// Whether the physical connection is currently held.
    pub fn holds_connection(&self) -> bool {
        self.slot.connection.is_some()
    }

    pub fn after_statement(&mut self, probe: &dyn TransactionProbe) {
        let open = self.batcher.has_open_resources();
        self.slot.after_statement(open, probe);
    }

    /// Revoke the borrowed proxy, apply the post-transaction release policy
    /// and clear the deadline.
    pub fn after_transaction(&mut self) {
        self.slot.release_borrowed();
        match self.slot.release_mode {
            ConnectionReleaseMode::AfterTransaction => self.slot.aggressive_release(),
            _ if self.slot.is_aggressive_release_no_transaction_check()
                && self.batcher.has_open_resources() =>
            {
                info!(
                    "forcing batcher resource cleanup on transaction completion; forgot to close a scrollable result or iterator?"
                );
                self.batcher.close_statements();
                self.slot.aggressive_release();
            }
            ConnectionReleaseMode::OnClose => debug!(
                "transaction completed on session with on_close connection release mode; be sure to close the session to release JDBC resources!"
            ),
            _ => {}
        }
        self.batcher.unset_transaction_timeout();
    }

    pub fn flush_beginning(&mut self) {
        trace!("registering flush begin");
        self.slot.flushing = true;
    }

    pub fn flush_ending(&mut self, probe: &dyn TransactionProbe) {
        trace!("registering flush end");
        self.slot.flushing = false;
        self.after_statement(probe);
    }

    pub fn is_flushing(&self) -> bool {
        self.slot.flushing
    }

    /// Release everything and refuse further connections.
    pub fn close(&mut self) -> Cleanup {
        let cleanup = self.cleanup();
        self.slot.closed = true;
        cleanup
    }

    /// Release everything but stay usable; the next statement reconnects.
    pub fn manual_disconnect(&mut self) -> Cleanup {
        self.cleanup()
    }

    /// Resume with a new application-supplied connection, or with the
    /// provider when none is given.
    pub fn manual_reconnect(&mut self, supplied_connection: Option<Arc<dyn Connection>>) {
        if let Some(connection) = supplied_connection {
            self.slot.connection = Some(connection);
        }
    }

    fn cleanup(&mut self) -> Cleanup {
        self.slot.release_borrowed();
        if self.slot.connection.is_none() {
            trace!("connection already null in cleanup: no action");
            return Cleanup::default();
        }
        trace!("performing cleanup");
        self.batcher.close_statements();
        let supplied_connection = if self.slot.supplied {
            self.slot.connection.take()
        } else {
            self.slot.close_connection();
            None
        };
        Cleanup {
            performed: true,
            supplied_connection,
        }
    }

    /// Serializable only while nothing live would be lost.
    pub fn is_ready_for_serialization(&self) -> bool {
        if self.slot.supplied {
            self.slot.connection.is_none()
        } else {
            !self.batcher.has_open_resources()
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("release_mode", &self.slot.release_mode)
            .field("connected", &self.slot.connection.is_some())
            .field("supplied", &self.slot.supplied)
            .field("closed", &self.slot.closed)
            .field("borrowed", &self.slot.is_borrowed())
            .field("batcher", &self.batcher)
            .finish()
    }
}

/// Generates `Statements` methods that pass the managed connection source
/// through to the batcher method of the same name.
macro_rules! batcher_forward {
    ($(fn $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;)*) => {
        $(
            pub fn $name(&mut self, $($arg: $ty),*) -> $ret {
                self.batcher.$name(&mut self.source, $($arg),*)
            }
        )*
    };
}

/// Batcher operations bound to the manager's connection.
pub struct Statements<'a> {
    batcher: &'a mut Batcher,
    source: ManagedSource<'a>,
}

impl Statements<'_> {
    pub fn batcher(&mut self) -> &mut Batcher {
        self.batcher
    }

    batcher_forward! {
        fn prepare_statement(sql: &str, generated_keys: GeneratedKeys) -> Result<TrackedStatement>;
        fn prepare_callable_statement(sql: &str) -> Result<TrackedStatement>;
        fn prepare_query_statement(sql: &str, scrollable: bool, scroll_mode: Option<ScrollMode>) -> Result<TrackedStatement>;
        fn prepare_callable_query_statement(sql: &str, scrollable: bool, scroll_mode: Option<ScrollMode>) -> Result<TrackedStatement>;
        fn prepare_batch_statement(sql: &str) -> Result<TrackedStatement>;
        fn prepare_batch_callable_statement(sql: &str) -> Result<TrackedStatement>;
        fn execute_batch() -> Result<()>;
        fn abort_batch() -> ();
        fn close_query_statement(statement: &TrackedStatement, result_set: Option<&TrackedResultSet>) -> Result<()>;
        fn close_statement(statement: &TrackedStatement) -> Result<()>;
    }

    pub fn add_to_batch(&mut self, expectation: Arc<dyn Expectation>) -> Result<()> {
        self.batcher.add_to_batch(expectation)
    }

    pub fn get_result_set(&mut self, statement: &TrackedStatement) -> Result<TrackedResultSet> {
        self.batcher.get_result_set(statement)
    }

    pub fn get_callable_result_set(&mut self, statement: &TrackedStatement) -> Result<TrackedResultSet> {
        self.batcher.get_callable_result_set(statement)
    }

    pub fn cancel_last_query(&self) -> Result<()> {
        self.batcher.cancel_last_query()
    }

    /// Close everything the batcher holds; see [`Batcher::close_statements`].
    pub fn close_statements(&mut self) -> Vec<Error> {
        self.batcher.close_statements()
    }
}
