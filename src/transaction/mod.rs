// ============================================================================
// Transaction Coordination Module
// ============================================================================
//
// A session either demarcates transactions itself on its JDBC connection or
// joins the transaction of an external manager. The factory decides which,
// and with it where completion callbacks live and which connection release
// mode applies by default.
//
// ============================================================================

pub mod jta;
pub mod local;

pub use jta::{JtaTransactionFactory, Synchronization, TransactionManager, TxStatus};
pub use local::{LocalTransaction, LocalTransactionState, TransactionKind};

use crate::config::ConnectionReleaseMode;
use crate::core::Result;
use std::sync::Arc;

pub trait TransactionFactory: Send + Sync {
    /// A fresh, not yet begun, session transaction.
    fn create_transaction(&self) -> LocalTransaction;

    /// Completion callbacks can only come from the session's own transaction
    /// object; nothing can be registered with an external manager.
    fn callbacks_local_to_transactions(&self) -> bool;

    fn is_transaction_in_progress(&self, local: Option<&LocalTransaction>) -> Result<bool>;

    /// Release mode used when the configured mode is `auto`.
    fn default_release_mode(&self) -> ConnectionReleaseMode;

    fn transaction_manager(&self) -> Option<Arc<dyn TransactionManager>> {
        None
    }
}

/// Transactions demarcated on the session's own connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct JdbcTransactionFactory;

impl TransactionFactory for JdbcTransactionFactory {
    fn create_transaction(&self) -> LocalTransaction {
        LocalTransaction::jdbc()
    }

    fn callbacks_local_to_transactions(&self) -> bool {
        true
    }

    fn is_transaction_in_progress(&self, local: Option<&LocalTransaction>) -> Result<bool> {
        match local {
            Some(tx) => tx.is_active(),
            None => Ok(false),
        }
    }

    fn default_release_mode(&self) -> ConnectionReleaseMode {
        ConnectionReleaseMode::AfterTransaction
    }
}
