use crate::core::{Error, Result};
use crate::driver::{Connection, PrepareOptions, SqlError, SqlResult, SqlWarning, Statement};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const REVOKED: &str = "connection proxy not usable after transaction completion";

/// Stand-in for the session's physical connection handed to application
/// code. Calls go straight to the connection held when the borrow began;
/// `close` gives the borrow back instead of closing anything. Once the
/// session's transaction completes the handle fails every call.
///
/// The session never releases its connection while a borrow is outstanding,
/// and it revokes the borrow before letting the connection go.
pub struct BorrowedConnection {
    connection: Arc<dyn Connection>,
    usable: Arc<AtomicBool>,
}

impl BorrowedConnection {
    pub(crate) fn new(connection: Arc<dyn Connection>, usable: Arc<AtomicBool>) -> Self {
        Self { connection, usable }
    }

    pub fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }

    /// Fails with [`Error::ConnectionRevoked`] once the borrow has ended.
    pub fn check_usable(&self) -> Result<()> {
        if self.is_usable() {
            Ok(())
        } else {
            Err(Error::ConnectionRevoked)
        }
    }

    fn target(&self) -> SqlResult<&dyn Connection> {
        if !self.is_usable() {
            return Err(SqlError::with_state(REVOKED, "08003"));
        }
        Ok(self.connection.as_ref())
    }
}

impl fmt::Debug for BorrowedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowedConnection")
            .field("usable", &self.is_usable())
            .finish()
    }
}

impl Connection for BorrowedConnection {
    fn prepare(&self, sql: &str, options: &PrepareOptions) -> SqlResult<Arc<dyn Statement>> {
        self.target()?.prepare(sql, options)
    }

    fn auto_commit(&self) -> SqlResult<bool> {
        self.target()?.auto_commit()
    }

    fn set_auto_commit(&self, auto_commit: bool) -> SqlResult<()> {
        self.target()?.set_auto_commit(auto_commit)
    }

    fn commit(&self) -> SqlResult<()> {
        self.target()?.commit()
    }

    fn rollback(&self) -> SqlResult<()> {
        self.target()?.rollback()
    }

    fn is_closed(&self) -> SqlResult<bool> {
        self.target()?.is_closed()
    }

    fn warnings(&self) -> SqlResult<Vec<SqlWarning>> {
        self.target()?.warnings()
    }

    fn clear_warnings(&self) -> SqlResult<()> {
        self.target()?.clear_warnings()
    }

    /// Ends the borrow. The manager sees the cleared flag and may release
    /// its connection again.
    fn close(&self) -> SqlResult<()> {
        self.usable.store(false, Ordering::SeqCst);
        Ok(())
    }
}
