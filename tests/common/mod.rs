#![allow(dead_code)]

use session_jdbc::context::{JdbcContext, SessionOwner};
use session_jdbc::driver::Connection;
use session_jdbc::driver::memory::MemoryDatabase;
use session_jdbc::engine::ConnectionSource;
use session_jdbc::transaction::LocalTransaction;
use session_jdbc::transaction::jta::{
    JtaError, JtaResult, JtaTransaction, Synchronization, TransactionManager, TxStatus,
};
use session_jdbc::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ----------------------------------------------------------------------------
// Connection source
// ----------------------------------------------------------------------------

/// Opens connections on demand and records after-statement calls.
pub struct RecordingSource {
    db: MemoryDatabase,
    connection: Option<Arc<dyn Connection>>,
    pub after_statement_calls: Vec<bool>,
}

impl RecordingSource {
    pub fn new(db: &MemoryDatabase) -> Self {
        Self {
            db: db.clone(),
            connection: None,
            after_statement_calls: Vec::new(),
        }
    }
}

impl ConnectionSource for RecordingSource {
    fn connection(&mut self) -> Result<Arc<dyn Connection>> {
        if let Some(connection) = &self.connection {
            return Ok(Arc::clone(connection));
        }
        let connection: Arc<dyn Connection> = self
            .db
            .connect()
            .map_err(|e| Error::General(e.to_string()))?;
        self.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    fn after_statement(&mut self, batcher_has_open_resources: bool) -> Result<()> {
        self.after_statement_calls.push(batcher_has_open_resources);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Session owner
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct TestOwner {
    pub events: Mutex<Vec<String>>,
    pub flushes: AtomicUsize,
    pub closed: AtomicBool,
    pub flush_mode_never: AtomicBool,
    pub fail_flush: AtomicBool,
}

impl TestOwner {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl SessionOwner for TestOwner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_flush_mode_never(&self) -> bool {
        self.flush_mode_never.load(Ordering::SeqCst)
    }

    fn managed_flush(&self, context: &mut JdbcContext) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.record("flush".into());
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(Error::General("flush failed".into()));
        }
        context.statements().execute_batch()
    }

    fn managed_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.record("close".into());
    }

    fn after_transaction_begin(&self, _transaction: Option<&LocalTransaction>) {
        self.record("begin".into());
    }

    fn before_transaction_completion(&self, _transaction: Option<&LocalTransaction>) {
        self.record("before".into());
    }

    fn after_transaction_completion(&self, success: bool, _transaction: Option<&LocalTransaction>) {
        self.record(format!("after:{}", success));
    }
}

// ----------------------------------------------------------------------------
// Transaction manager
// ----------------------------------------------------------------------------

pub struct TestJtaTransaction {
    status: Mutex<TxStatus>,
    synchronizations: Mutex<Vec<Box<dyn Synchronization>>>,
    refuse_registration: AtomicBool,
    status_unavailable: AtomicBool,
}

impl TestJtaTransaction {
    fn new() -> Self {
        Self {
            status: Mutex::new(TxStatus::Active),
            synchronizations: Mutex::new(Vec::new()),
            refuse_registration: AtomicBool::new(false),
            status_unavailable: AtomicBool::new(false),
        }
    }

    /// Make `register_synchronization` fail with a system error.
    pub fn refuse_registration(&self, refuse: bool) {
        self.refuse_registration.store(refuse, Ordering::SeqCst);
    }

    /// Make `status` fail with a system error.
    pub fn status_unavailable(&self, unavailable: bool) {
        self.status_unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn current_status(&self) -> TxStatus {
        *self.status.lock().unwrap()
    }

    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.lock().unwrap().len()
    }

    fn set_status(&self, status: TxStatus) {
        *self.status.lock().unwrap() = status;
    }
}

impl JtaTransaction for TestJtaTransaction {
    fn status(&self) -> JtaResult<TxStatus> {
        if self.status_unavailable.load(Ordering::SeqCst) {
            return Err(JtaError::System("status unavailable".into()));
        }
        Ok(self.current_status())
    }

    fn register_synchronization(&self, synchronization: Box<dyn Synchronization>) -> JtaResult<()> {
        if self.refuse_registration.load(Ordering::SeqCst) {
            return Err(JtaError::System("registration refused".into()));
        }
        if self.status()?.is_marked_rollback() {
            return Err(JtaError::Rollback("transaction is marked for rollback".into()));
        }
        self.synchronizations.lock().unwrap().push(synchronization);
        Ok(())
    }

    fn set_rollback_only(&self) -> JtaResult<()> {
        self.set_status(TxStatus::MarkedRollback);
        Ok(())
    }
}

/// Single-threaded stand-in for an application server's manager.
#[derive(Default)]
pub struct TestTransactionManager {
    current: Mutex<Option<Arc<TestJtaTransaction>>>,
}

impl TestTransactionManager {
    pub fn begin(&self) -> Arc<TestJtaTransaction> {
        let transaction = Arc::new(TestJtaTransaction::new());
        *self.current.lock().unwrap() = Some(Arc::clone(&transaction));
        transaction
    }

    pub fn current(&self) -> Option<Arc<TestJtaTransaction>> {
        self.current.lock().unwrap().clone()
    }

    /// Run the two completion phases the way a container would. A failing
    /// before-completion callback or a rollback-only mark rolls back.
    pub fn commit(&self) -> TxStatus {
        let Some(transaction) = self.current() else {
            return TxStatus::NoTransaction;
        };
        let synchronizations = std::mem::take(&mut *transaction.synchronizations.lock().unwrap());
        let mut failed = transaction.current_status().is_marked_rollback();
        if !failed {
            for synchronization in &synchronizations {
                if synchronization.before_completion().is_err() {
                    failed = true;
                }
            }
        }
        failed |= transaction.current_status().is_marked_rollback();
        let status = if failed {
            TxStatus::RolledBack
        } else {
            TxStatus::Committed
        };
        transaction.set_status(status);
        *self.current.lock().unwrap() = None;
        for synchronization in &synchronizations {
            synchronization.after_completion(status);
        }
        status
    }

    pub fn mark_rollback_only(&self) {
        if let Some(transaction) = self.current() {
            transaction.set_status(TxStatus::MarkedRollback);
        }
    }
}

impl TransactionManager for TestTransactionManager {
    fn status(&self) -> JtaResult<TxStatus> {
        match self.current() {
            Some(transaction) => transaction.status(),
            None => Ok(TxStatus::NoTransaction),
        }
    }

    fn transaction(&self) -> JtaResult<Option<Arc<dyn JtaTransaction>>> {
        Ok(self
            .current()
            .map(|t| t as Arc<dyn JtaTransaction>))
    }
}

/// Records local synchronization callbacks.
#[derive(Clone, Default)]
pub struct RecordingSynchronization(pub Arc<Mutex<Vec<String>>>);

impl Synchronization for RecordingSynchronization {
    fn before_completion(&self) -> Result<()> {
        self.0.lock().unwrap().push("before".into());
        Ok(())
    }

    fn after_completion(&self, status: TxStatus) {
        self.0.lock().unwrap().push(format!("after:{}", status));
    }
}
