// ============================================================================
// JDBC Context
// ============================================================================
//
// Mediates between a session, its connection manager and whatever demarcates
// transactions. At most one completion callback is registered per logical
// transaction, either by the session's own transaction object or as a
// synchronization with an external manager:
//
//   unregistered ──register──> registered ──completion──> unregistered
//
// Completion always runs the same path: statistics, the connection release
// policy, clearing the callback, then telling the owning session.
//
// ============================================================================

pub mod borrowed;
pub mod manager;
pub mod synchronization;

pub use borrowed::BorrowedConnection;
pub use manager::{
    Cleanup, ConnectionManager, FixedProbe, ManagerState, Statements, TransactionProbe,
};
pub use synchronization::ContextSynchronization;

use crate::core::{Error, Result};
use crate::driver::{Connection, SqlError};
use crate::services::JdbcServices;
use crate::transaction::jta::{Synchronization, TxStatus};
use crate::transaction::{LocalTransaction, LocalTransactionState, TransactionFactory, TransactionKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info_span, trace, warn};
use uuid::Uuid;

pub type SharedContext = Arc<Mutex<JdbcContext>>;

/// The session a context works for.
///
/// Hooks receive the session transaction object when there is one. They run
/// while the context is locked and must not lock it again; `managed_flush`
/// gets the context itself for that reason.
pub trait SessionOwner: Send + Sync {
    fn is_closed(&self) -> bool {
        false
    }

    fn is_flush_mode_never(&self) -> bool {
        false
    }

    /// Flush pending changes through `context`.
    fn managed_flush(&self, context: &mut JdbcContext) -> Result<()>;

    /// The context closed itself on transaction completion.
    fn managed_close(&self) {}

    fn after_transaction_begin(&self, _transaction: Option<&LocalTransaction>) {}

    fn before_transaction_completion(&self, _transaction: Option<&LocalTransaction>) {}

    fn after_transaction_completion(
        &self,
        _success: bool,
        _transaction: Option<&LocalTransaction>,
    ) {
    }
}

/// Serialized form of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: Uuid,
    /// Only set when the callback lives with an external manager; a callback
    /// owned by the session transaction object does not survive.
    pub callback_registered: bool,
    pub manager: manager::ManagerState,
}

struct ContextProbe<'a> {
    factory: &'a dyn TransactionFactory,
    local: Option<&'a LocalTransaction>,
}

impl TransactionProbe for ContextProbe<'_> {
    fn is_transaction_in_progress(&self) -> bool {
        self.factory
            .is_transaction_in_progress(self.local)
            .unwrap_or_else(|e| {
                warn!("could not determine transaction status: {}", e);
                false
            })
    }
}

pub struct JdbcContext {
    id: Uuid,
    services: JdbcServices,
    owner: Arc<dyn SessionOwner>,
    manager: ConnectionManager,
    callback_registered: bool,
    local: Option<LocalTransaction>,
    this: Weak<Mutex<JdbcContext>>,
}

impl JdbcContext {
    /// Create a context for `owner`, optionally on a connection the
    /// application supplies.
    pub fn open(
        services: JdbcServices,
        owner: Arc<dyn SessionOwner>,
        supplied_connection: Option<Arc<dyn Connection>>,
    ) -> Result<SharedContext> {
        let release_mode = services.release_mode();
        let manager = ConnectionManager::new(&services, release_mode, supplied_connection);
        let context = Self::shared(Uuid::new_v4(), services, owner, manager, false);
        {
            let mut guard = context.lock()?;
            let settings = guard.services.settings();
            let register = settings.auto_close_session
                || settings.flush_before_completion
                || release_mode == crate::config::ConnectionReleaseMode::AfterTransaction;
            if register {
                guard.register_synchronization_if_possible()?;
            }
        }
        Ok(context)
    }

    fn shared(
        id: Uuid,
        services: JdbcServices,
        owner: Arc<dyn SessionOwner>,
        manager: ConnectionManager,
        callback_registered: bool,
    ) -> SharedContext {
        Arc::new_cyclic(|this| {
            Mutex::new(Self {
                id,
                services,
                owner,
                manager,
                callback_registered,
                local: None,
                this: this.clone(),
            })
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn services(&self) -> &JdbcServices {
        &self.services
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn connection_manager_mut(&mut self) -> &mut ConnectionManager {
        &mut self.manager
    }

    pub fn is_closed(&self) -> bool {
        self.manager.is_closed()
    }

    pub fn is_callback_registered(&self) -> bool {
        self.callback_registered
    }

    /// Statement operations on the session's connection.
    pub fn statements(&mut self) -> Statements<'_> {
        let probe = ContextProbe {
            factory: self.services.transaction_factory().as_ref(),
            local: self.local.as_ref(),
        };
        self.manager.statements(Box::new(probe))
    }

    pub fn is_transaction_in_progress(&self) -> Result<bool> {
        self.services
            .transaction_factory()
            .is_transaction_in_progress(self.local.as_ref())
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    pub fn connection(&mut self) -> Result<Arc<dyn Connection>> {
        if self.owner.is_closed() {
            return Err(Error::Session("Session is closed".into()));
        }
        self.manager.connection()
    }

    /// A handle to the session's connection for application code. A
    /// supplied connection is handed out as is.
    pub fn borrow_connection(&mut self) -> Result<Arc<dyn Connection>> {
        if self.manager.is_supplied_connection() {
            return self.manager.connection();
        }
        let connection = self.connection()?;
        let usable = self.manager.borrow_flag()?;
        Ok(Arc::new(BorrowedConnection::new(connection, usable)))
    }

    pub fn release_borrowed_connection(&mut self) {
        self.manager.release_borrowed_connection();
    }

    pub fn flush_beginning(&mut self) {
        self.manager.flush_beginning();
    }

    pub fn flush_ending(&mut self) {
        let probe = ContextProbe {
            factory: self.services.transaction_factory().as_ref(),
            local: self.local.as_ref(),
        };
        self.manager.flush_ending(&probe);
    }

    /// Release everything. Returns the supplied connection, if any.
    pub fn close(&mut self) -> Option<Arc<dyn Connection>> {
        let cleanup = self.manager.close();
        self.cleaned_up(cleanup)
    }

    pub fn manual_disconnect(&mut self) -> Option<Arc<dyn Connection>> {
        let cleanup = self.manager.manual_disconnect();
        self.cleaned_up(cleanup)
    }

    pub fn manual_reconnect(&mut self, supplied_connection: Option<Arc<dyn Connection>>) {
        self.manager.manual_reconnect(supplied_connection);
    }

    fn cleaned_up(&mut self, cleanup: Cleanup) -> Option<Arc<dyn Connection>> {
        if cleanup.performed {
            self.connection_cleaned_up();
        }
        cleanup.supplied_connection
    }

    /// The connection went away without a registered callback; the
    /// transaction outcome is unknown and reported as a failure.
    pub fn connection_cleaned_up(&mut self) {
        if !self.callback_registered {
            self.finish_transaction(false, None);
        }
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    /// Register a synchronization with the external transaction manager if
    /// one can be registered at all.
    pub fn register_synchronization_if_possible(&mut self) -> Result<bool> {
        if self.callback_registered {
            return Ok(true);
        }
        let factory = Arc::clone(self.services.transaction_factory());
        if factory.callbacks_local_to_transactions() {
            return Ok(false);
        }
        let Some(manager) = factory.transaction_manager() else {
            return Ok(false);
        };
        if !self.is_transaction_in_progress()? {
            trace!("transaction factory reported no active transaction; synchronization not registered");
            return Ok(false);
        }

        let wrap = |e| Error::Transaction {
            message: "could not register synchronization with JTA TransactionManager".into(),
            source: Some(e),
        };
        let Some(transaction) = manager.transaction().map_err(wrap)? else {
            return Ok(false);
        };
        if transaction.status().map_err(wrap)?.is_marked_rollback() {
            debug!("transaction is marked for rollback; skipping synchronization registration");
            return Ok(false);
        }
        if self.local.is_none() {
            self.local = Some(factory.create_transaction());
        }
        let synchronization =
            ContextSynchronization::new(self.this.clone(), Arc::clone(&self.owner), Arc::clone(&transaction));
        transaction
            .register_synchronization(Box::new(synchronization))
            .map_err(wrap)?;
        self.callback_registered = true;
        debug!(context = %self.id, "successfully registered synchronization");
        Ok(true)
    }

    /// Claim the completion callback. Returns `false` when it is already
    /// taken.
    pub fn register_callback_if_necessary(&mut self) -> bool {
        if self.callback_registered {
            false
        } else {
            self.callback_registered = true;
            true
        }
    }

    // ------------------------------------------------------------------
    // Transaction notifications
    // ------------------------------------------------------------------

    pub fn after_transaction_begin(&mut self) {
        trace!("after transaction begin");
        self.owner.after_transaction_begin(self.local.as_ref());
    }

    pub fn before_transaction_completion(&mut self) {
        trace!("before transaction completion");
        self.owner.before_transaction_completion(self.local.as_ref());
    }

    pub fn after_transaction_completion(&mut self, success: bool) {
        let transaction = self.local.take();
        self.finish_transaction(success, transaction.as_ref());
    }

    fn finish_transaction(&mut self, success: bool, transaction: Option<&LocalTransaction>) {
        trace!(success, "after transaction completion");
        if let Some(statistics) = self.services.statistics() {
            statistics.end_transaction(success);
        }
        self.manager.after_transaction();
        self.callback_registered = false;
        self.local = None;
        self.owner.after_transaction_completion(success, transaction);
    }

    /// A query ran outside any transaction. In autocommit it counts as a
    /// completed transaction of its own.
    pub fn after_nontransactional_query(&mut self, success: bool) -> Result<()> {
        trace!("after autocommit");
        let auto_commit = self.manager.is_auto_commit()?;
        self.manager.after_transaction();
        if auto_commit {
            self.owner
                .after_transaction_completion(success, self.local.as_ref());
        }
        Ok(())
    }

    /// Close the session if it is configured to close on completion.
    /// Returns whether it did; the caller then notifies the owner.
    pub(crate) fn close_if_auto_close(&mut self) -> bool {
        if self.services.settings().auto_close_session
            && !self.owner.is_closed()
            && !self.manager.is_closed()
        {
            trace!("automatically closing session");
            self.close();
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Session transaction
    // ------------------------------------------------------------------

    /// The session transaction object, created on first use.
    pub fn transaction(&mut self) -> &LocalTransaction {
        let factory = self.services.transaction_factory();
        self.local.get_or_insert_with(|| factory.create_transaction())
    }

    /// The session transaction object, if one exists.
    pub fn current_transaction(&self) -> Option<&LocalTransaction> {
        self.local.as_ref()
    }

    fn local_mut(&mut self) -> Result<&mut LocalTransaction> {
        self.local
            .as_mut()
            .ok_or_else(|| Error::transaction("Transaction not successfully started"))
    }

    fn convert(&self, err: SqlError, message: &str) -> Error {
        self.services.dialect().convert(err, message, None)
    }

    pub fn set_transaction_timeout(&mut self, seconds: u32) -> Result<()> {
        let factory = Arc::clone(self.services.transaction_factory());
        let transaction = self.local.get_or_insert_with(|| factory.create_transaction());
        if !transaction.is_jdbc() {
            return Err(Error::transaction("cannot set transaction timeout in CMT"));
        }
        transaction.set_timeout(seconds);
        Ok(())
    }

    pub fn register_local_synchronization(
        &mut self,
        synchronization: Box<dyn Synchronization>,
    ) -> Result<()> {
        let factory = Arc::clone(self.services.transaction_factory());
        self.local
            .get_or_insert_with(|| factory.create_transaction())
            .register_synchronization(synchronization)
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        let factory = Arc::clone(self.services.transaction_factory());
        let transaction = self.local.get_or_insert_with(|| factory.create_transaction());
        match transaction.state() {
            LocalTransactionState::Active => return Ok(()),
            LocalTransactionState::CommitFailed => {
                return Err(Error::transaction(
                    "cannot re-start transaction after failed commit",
                ));
            }
            LocalTransactionState::Committed | LocalTransactionState::RolledBack => {
                *transaction = factory.create_transaction();
            }
            LocalTransactionState::NotBegun => {}
        }
        let span = info_span!("begin", context = %self.id);
        let _enter = span.enter();
        debug!("begin");
        if transaction.is_jdbc() {
            self.begin_jdbc()
        } else {
            self.begin_container()
        }
    }

    fn begin_jdbc(&mut self) -> Result<()> {
        let connection = self.connection()?;
        let toggle = connection
            .auto_commit()
            .and_then(|auto_commit| {
                if auto_commit {
                    debug!("disabling autocommit");
                    connection.set_auto_commit(false)?;
                }
                Ok(auto_commit)
            })
            .map_err(|e| {
                error!("JDBC begin failed: {}", e);
                self.convert(e, "JDBC begin failed")
            })?;

        let callback = self.register_callback_if_necessary();
        let transaction = self.local_mut()?;
        transaction.mark_begun(toggle, callback);
        if let Some(seconds) = transaction.timeout().filter(|s| *s > 0) {
            self.manager.batcher_mut().set_transaction_timeout(seconds);
        }
        self.after_transaction_begin();
        Ok(())
    }

    fn begin_container(&mut self) -> Result<()> {
        if !self.register_synchronization_if_possible()? {
            return Err(Error::transaction(
                "Could not register synchronization for container transaction",
            ));
        }
        self.local_mut()?.mark_begun(false, false);
        self.after_transaction_begin();
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        let transaction = self.local_mut()?;
        if !transaction.state().is_active() {
            return Err(Error::transaction("Transaction not successfully started"));
        }
        let jdbc = transaction.is_jdbc();
        let span = info_span!("commit", context = %self.id);
        let _enter = span.enter();
        debug!("commit");
        if jdbc {
            self.commit_jdbc()
        } else {
            self.commit_container()
        }
    }

    fn commit_jdbc(&mut self) -> Result<()> {
        let callback = self.local_mut()?.owns_callback();
        if callback && !self.owner.is_flush_mode_never() {
            let owner = Arc::clone(&self.owner);
            owner.managed_flush(self)?;
        }

        self.local_mut()?.notify_before_completion();
        if callback {
            self.before_transaction_completion();
        }

        match self.commit_and_reset_auto_commit() {
            Ok(()) => {
                debug!("committed JDBC connection");
                self.local_mut()?.mark(LocalTransactionState::Committed);
                self.complete_local(callback, true, TxStatus::Committed);
                self.close_if_required(callback);
                Ok(())
            }
            Err(e) => {
                error!("JDBC commit failed: {}", e);
                self.local_mut()?.mark(LocalTransactionState::CommitFailed);
                if let Some(failed) = self.complete_local(callback, false, TxStatus::Unknown) {
                    self.local = Some(failed);
                }
                self.close_if_required(callback);
                Err(e)
            }
        }
    }

    fn commit_container(&mut self) -> Result<()> {
        let flush = !self.owner.is_flush_mode_never()
            && !self.services.settings().flush_before_completion;
        if flush {
            let owner = Arc::clone(&self.owner);
            owner.managed_flush(self)?;
        }
        self.local_mut()?.mark(LocalTransactionState::Committed);
        Ok(())
    }

    pub fn rollback_transaction(&mut self) -> Result<()> {
        let transaction = self.local_mut()?;
        let jdbc = transaction.is_jdbc();
        match transaction.state() {
            LocalTransactionState::Active => {}
            LocalTransactionState::CommitFailed if jdbc => {
                debug!("rollback after failed commit; nothing to roll back");
                self.local = None;
                return Ok(());
            }
            _ => return Err(Error::transaction("Transaction not successfully started")),
        }
        let span = info_span!("rollback", context = %self.id);
        let _enter = span.enter();
        debug!("rollback");
        if jdbc {
            self.rollback_jdbc()
        } else {
            self.rollback_container()
        }
    }

    fn rollback_jdbc(&mut self) -> Result<()> {
        let callback = self.local_mut()?.owns_callback();
        let outcome = self.rollback_and_reset_auto_commit();
        let status = match &outcome {
            Ok(()) => {
                debug!("rolled back JDBC connection");
                self.local_mut()?.mark(LocalTransactionState::RolledBack);
                TxStatus::RolledBack
            }
            Err(e) => {
                error!("JDBC rollback failed: {}", e);
                TxStatus::Unknown
            }
        };
        if let Some(transaction) = &self.local {
            transaction.notify_after_completion(status);
        }
        if callback {
            self.after_transaction_completion(false);
        }
        self.close_if_required(callback);
        outcome
    }

    fn rollback_container(&mut self) -> Result<()> {
        let wrap = |e| Error::Transaction {
            message: "Could not set transaction to rollback only".into(),
            source: Some(e),
        };
        let manager = match self.local_mut()?.kind() {
            TransactionKind::ContainerManaged(Some(manager)) => Arc::clone(manager),
            _ => return Err(Error::transaction("no transaction manager available")),
        };
        manager
            .transaction()
            .map_err(wrap)?
            .ok_or_else(|| Error::transaction("no transaction is bound to the manager"))?
            .set_rollback_only()
            .map_err(wrap)?;
        self.local_mut()?.mark(LocalTransactionState::RolledBack);
        Ok(())
    }

    /// Run completion for a local transaction and its synchronizations.
    /// Returns the transaction object when completion detached it.
    fn complete_local(
        &mut self,
        callback: bool,
        success: bool,
        status: TxStatus,
    ) -> Option<LocalTransaction> {
        let detached = if callback {
            let transaction = self.local.take();
            self.finish_transaction(success, transaction.as_ref());
            transaction
        } else {
            None
        };
        if let Some(transaction) = detached.as_ref().or(self.local.as_ref()) {
            transaction.notify_after_completion(status);
        }
        detached
    }

    fn commit_and_reset_auto_commit(&mut self) -> Result<()> {
        let connection = self.connection()?;
        let outcome = connection
            .commit()
            .map_err(|e| self.convert(e, "JDBC commit failed"));
        self.restore_auto_commit(connection.as_ref());
        outcome
    }

    fn rollback_and_reset_auto_commit(&mut self) -> Result<()> {
        let connection = self.connection()?;
        let outcome = connection
            .rollback()
            .map_err(|e| self.convert(e, "JDBC rollback failed"));
        self.restore_auto_commit(connection.as_ref());
        outcome
    }

    fn restore_auto_commit(&self, connection: &dyn Connection) {
        let toggle = self.local.as_ref().is_some_and(|t| t.toggles_auto_commit());
        if toggle {
            debug!("re-enabling autocommit");
            if let Err(e) = connection.set_auto_commit(true) {
                error!("Could not toggle autocommit: {}", e);
            }
        }
    }

    fn close_if_required(&mut self, callback: bool) {
        if callback && self.close_if_auto_close() {
            self.owner.managed_close();
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Result<ContextSnapshot> {
        if !self.manager.is_ready_for_serialization() {
            return Err(Error::Serialization(
                "Cannot serialize a JDBC context while connected".into(),
            ));
        }
        let callbacks_local = self
            .services
            .transaction_factory()
            .callbacks_local_to_transactions();
        Ok(ContextSnapshot {
            id: self.id,
            callback_registered: self.callback_registered && !callbacks_local,
            manager: self.manager.state(),
        })
    }

    /// MessagePack encoding of [`JdbcContext::snapshot`].
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(&self.snapshot()?)?)
    }

    pub fn restore(
        services: JdbcServices,
        owner: Arc<dyn SessionOwner>,
        snapshot: ContextSnapshot,
    ) -> SharedContext {
        let manager = ConnectionManager::restore(&services, snapshot.manager);
        Self::shared(
            snapshot.id,
            services,
            owner,
            manager,
            snapshot.callback_registered,
        )
    }

    pub fn deserialize(
        services: JdbcServices,
        owner: Arc<dyn SessionOwner>,
        bytes: &[u8],
    ) -> Result<SharedContext> {
        let snapshot: ContextSnapshot = rmp_serde::from_slice(bytes)?;
        Ok(Self::restore(services, owner, snapshot))
    }
}

impl fmt::Debug for JdbcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JdbcContext")
            .field("id", &self.id)
            .field("callback_registered", &self.callback_registered)
            .field("transaction", &self.local)
            .field("manager", &self.manager)
            .finish()
    }
}
