// ============================================================================
// Session Transaction Object
// ============================================================================
//
// The transaction handle a session drives directly. A JDBC transaction owns
// demarcation on the physical connection (autocommit off on begin, commit or
// rollback on completion). A container-managed transaction only observes the
// ambient transaction of an external manager.
//
// State transitions:
//   NotBegun ──begin──> Active ──commit──> Committed
//                         │  └───commit error──> CommitFailed
//                         └──rollback──> RolledBack
//
// ============================================================================

use super::jta::{Synchronization, TransactionManager, TxStatus};
use crate::core::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTransactionState {
    NotBegun,
    Active,
    Committed,
    RolledBack,
    /// The commit reached the database and failed; only rollback is allowed.
    CommitFailed,
}

impl LocalTransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for LocalTransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotBegun => write!(f, "NOT_BEGUN"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::RolledBack => write!(f, "ROLLED_BACK"),
            Self::CommitFailed => write!(f, "COMMIT_FAILED"),
        }
    }
}

pub enum TransactionKind {
    /// Demarcated on the session's own connection.
    Jdbc,
    /// Demarcated by an external manager.
    ContainerManaged(Option<Arc<dyn TransactionManager>>),
}

impl fmt::Debug for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jdbc => write!(f, "Jdbc"),
            Self::ContainerManaged(manager) => f
                .debug_tuple("ContainerManaged")
                .field(&manager.is_some())
                .finish(),
        }
    }
}

pub struct LocalTransaction {
    id: Uuid,
    kind: TransactionKind,
    state: LocalTransactionState,

    /// Autocommit was on when the transaction began and must be restored.
    toggle_auto_commit: bool,

    /// This transaction owns the context's completion callback.
    callback: bool,

    timeout: Option<u32>,
    synchronizations: Vec<Box<dyn Synchronization>>,
    started_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("callback", &self.callback)
            .field("synchronizations", &self.synchronizations.len())
            .finish()
    }
}

impl LocalTransaction {
    fn with_kind(kind: TransactionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: LocalTransactionState::NotBegun,
            toggle_auto_commit: false,
            callback: false,
            timeout: None,
            synchronizations: Vec::new(),
            started_at: None,
        }
    }

    pub fn jdbc() -> Self {
        Self::with_kind(TransactionKind::Jdbc)
    }

    pub fn container_managed(manager: Option<Arc<dyn TransactionManager>>) -> Self {
        Self::with_kind(TransactionKind::ContainerManaged(manager))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &TransactionKind {
        &self.kind
    }

    pub fn is_jdbc(&self) -> bool {
        matches!(self.kind, TransactionKind::Jdbc)
    }

    pub fn state(&self) -> LocalTransactionState {
        self.state
    }

    pub fn was_committed(&self) -> bool {
        self.state == LocalTransactionState::Committed
    }

    pub fn was_rolled_back(&self) -> bool {
        self.state == LocalTransactionState::RolledBack
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Whether work done now is part of this transaction.
    pub fn is_active(&self) -> Result<bool> {
        if !self.state.is_active() {
            return Ok(false);
        }
        match &self.kind {
            TransactionKind::Jdbc | TransactionKind::ContainerManaged(None) => Ok(true),
            TransactionKind::ContainerManaged(Some(manager)) => {
                let status = manager.status().map_err(|e| Error::Transaction {
                    message: "could not determine transaction status".into(),
                    source: Some(e),
                })?;
                Ok(status == TxStatus::Active)
            }
        }
    }

    pub fn timeout(&self) -> Option<u32> {
        self.timeout
    }

    /// Timeout in seconds applied when the transaction begins.
    pub fn set_timeout(&mut self, seconds: u32) {
        self.timeout = Some(seconds);
    }

    pub fn owns_callback(&self) -> bool {
        self.callback
    }

    pub(crate) fn toggles_auto_commit(&self) -> bool {
        self.toggle_auto_commit
    }

    pub(crate) fn mark_begun(&mut self, toggle_auto_commit: bool, callback: bool) {
        self.state = LocalTransactionState::Active;
        self.toggle_auto_commit = toggle_auto_commit;
        self.callback = callback;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark(&mut self, state: LocalTransactionState) {
        self.state = state;
    }

    /// Register a callback run around completion of this transaction.
    pub fn register_synchronization(
        &mut self,
        synchronization: Box<dyn Synchronization>,
    ) -> Result<()> {
        match &self.kind {
            TransactionKind::Jdbc | TransactionKind::ContainerManaged(None) => {
                self.synchronizations.push(synchronization);
                Ok(())
            }
            TransactionKind::ContainerManaged(Some(manager)) => {
                let wrap = |e| Error::Transaction {
                    message: "could not register synchronization".into(),
                    source: Some(e),
                };
                let transaction = manager
                    .transaction()
                    .map_err(wrap)?
                    .ok_or_else(|| Error::transaction("no transaction is bound to the manager"))?;
                transaction.register_synchronization(synchronization).map_err(wrap)
            }
        }
    }

    /// Failures are logged, never propagated, so one callback cannot stop
    /// the commit.
    pub(crate) fn notify_before_completion(&self) {
        for synchronization in &self.synchronizations {
            if let Err(e) = synchronization.before_completion() {
                error!(transaction = %self.id, "exception calling user Synchronization: {}", e);
            }
        }
    }

    pub(crate) fn notify_after_completion(&self, status: TxStatus) {
        for synchronization in &self.synchronizations {
            synchronization.after_completion(status);
        }
    }
}
