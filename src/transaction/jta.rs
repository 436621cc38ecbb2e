// ============================================================================
// External Transaction Manager Contracts
// ============================================================================
//
// A container-managed transaction is observed, never driven: the session
// asks the manager for the ambient transaction, checks its status, and hangs
// a Synchronization on it so completion is reported back.
//
// ============================================================================

use super::{LocalTransaction, TransactionFactory};
use crate::config::ConnectionReleaseMode;
use crate::core::{Error, Result};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Status codes reported by a transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    MarkedRollback,
    Prepared,
    Committed,
    RolledBack,
    Unknown,
    NoTransaction,
    Preparing,
    Committing,
    RollingBack,
}

impl TxStatus {
    /// Work can still be enlisted in the transaction.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Active | Self::MarkedRollback)
    }

    /// The transaction is doomed or already rolling back.
    pub fn is_rollback(&self) -> bool {
        matches!(
            self,
            Self::MarkedRollback | Self::RolledBack | Self::RollingBack
        )
    }

    pub fn is_marked_rollback(&self) -> bool {
        matches!(self, Self::MarkedRollback)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::MarkedRollback => "MARKED_ROLLBACK",
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLEDBACK",
            Self::Unknown => "UNKNOWN",
            Self::NoTransaction => "NO_TRANSACTION",
            Self::Preparing => "PREPARING",
            Self::Committing => "COMMITTING",
            Self::RollingBack => "ROLLING_BACK",
        };
        f.write_str(name)
    }
}

/// Failure raised by a transaction manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JtaError {
    #[error("system exception: {0}")]
    System(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("transaction rolled back: {0}")]
    Rollback(String),
}

pub type JtaResult<T> = std::result::Result<T, JtaError>;

/// Callback invoked around the completion of a transaction.
pub trait Synchronization: Send + Sync {
    fn before_completion(&self) -> Result<()>;

    fn after_completion(&self, status: TxStatus);
}

/// The ambient transaction owned by the manager.
pub trait JtaTransaction: Send + Sync {
    fn status(&self) -> JtaResult<TxStatus>;

    fn register_synchronization(&self, synchronization: Box<dyn Synchronization>) -> JtaResult<()>;

    fn set_rollback_only(&self) -> JtaResult<()>;
}

pub trait TransactionManager: Send + Sync {
    fn status(&self) -> JtaResult<TxStatus>;

    /// The transaction bound to the calling thread, if any.
    fn transaction(&self) -> JtaResult<Option<Arc<dyn JtaTransaction>>>;
}

/// Transactions are demarcated by an external manager. Completion callbacks
/// are registered with that manager, so the connection can be released after
/// every statement by default.
#[derive(Clone)]
pub struct JtaTransactionFactory {
    manager: Option<Arc<dyn TransactionManager>>,
}

impl JtaTransactionFactory {
    pub fn new(manager: Arc<dyn TransactionManager>) -> Self {
        Self {
            manager: Some(manager),
        }
    }

    /// A factory for environments where no manager can be looked up.
    pub fn without_manager() -> Self {
        Self { manager: None }
    }
}

impl fmt::Debug for JtaTransactionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JtaTransactionFactory")
            .field("has_manager", &self.manager.is_some())
            .finish()
    }
}

impl TransactionFactory for JtaTransactionFactory {
    fn create_transaction(&self) -> LocalTransaction {
        LocalTransaction::container_managed(self.manager.clone())
    }

    fn callbacks_local_to_transactions(&self) -> bool {
        false
    }

    fn is_transaction_in_progress(&self, local: Option<&LocalTransaction>) -> Result<bool> {
        match &self.manager {
            Some(manager) => {
                let status = manager.status().map_err(|e| Error::Transaction {
                    message: "could not determine transaction status".into(),
                    source: Some(e),
                })?;
                Ok(status.is_in_progress())
            }
            None => match local {
                Some(tx) => tx.is_active(),
                None => Ok(false),
            },
        }
    }

    fn default_release_mode(&self) -> ConnectionReleaseMode {
        ConnectionReleaseMode::AfterStatement
    }

    fn transaction_manager(&self) -> Option<Arc<dyn TransactionManager>> {
        self.manager.clone()
    }
}
