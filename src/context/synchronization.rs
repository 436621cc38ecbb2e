use super::{JdbcContext, SessionOwner};
use crate::core::{Error, Result};
use crate::transaction::jta::{JtaTransaction, Synchronization, TxStatus};
use std::sync::{Arc, Mutex, Weak};
use tracing::{error, trace, warn};

/// Callback registered with an external transaction so the session hears
/// about completion of a transaction it did not demarcate.
pub struct ContextSynchronization {
    context: Weak<Mutex<JdbcContext>>,
    owner: Arc<dyn SessionOwner>,
    transaction: Arc<dyn JtaTransaction>,
}

impl ContextSynchronization {
    pub(crate) fn new(
        context: Weak<Mutex<JdbcContext>>,
        owner: Arc<dyn SessionOwner>,
        transaction: Arc<dyn JtaTransaction>,
    ) -> Self {
        Self {
            context,
            owner,
            transaction,
        }
    }

    fn set_rollback_only(&self) {
        if let Err(e) = self.transaction.set_rollback_only() {
            error!("could not set transaction to rollback only: {}", e);
        }
    }
}

impl Synchronization for ContextSynchronization {
    fn before_completion(&self) -> Result<()> {
        trace!("transaction before completion callback");
        let context = self
            .context
            .upgrade()
            .ok_or_else(|| Error::Session("session has been dropped".into()))?;
        let mut context = context.lock()?;

        let status = match self.transaction.status() {
            Ok(status) => status,
            Err(e) => {
                self.set_rollback_only();
                context.before_transaction_completion();
                return Err(Error::Transaction {
                    message: "could not determine transaction status in before_completion()".into(),
                    source: Some(e),
                });
            }
        };

        let flush = context.services().settings().flush_before_completion
            && !self.owner.is_flush_mode_never()
            && !status.is_rollback();
        let flushed = if flush {
            trace!("automatically flushing session");
            self.owner.managed_flush(&mut context)
        } else {
            Ok(())
        };
        if flushed.is_err() {
            self.set_rollback_only();
        }
        context.before_transaction_completion();
        flushed
    }

    fn after_completion(&self, status: TxStatus) {
        trace!(%status, "transaction after completion callback");
        let Some(context) = self.context.upgrade() else {
            warn!("transaction completed after its session was dropped");
            return;
        };
        let closed = match context.lock() {
            Ok(mut context) => {
                context.after_transaction_completion(status == TxStatus::Committed);
                context.close_if_auto_close()
            }
            Err(e) => {
                error!("could not complete transaction for session: {}", e);
                false
            }
        };
        if closed {
            self.owner.managed_close();
        }
    }
}
