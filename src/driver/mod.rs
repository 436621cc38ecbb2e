// ============================================================================
// Driver Contracts
// ============================================================================
//
// The physical database driver is consumed through these traits. Handles are
// shared (`Arc`) and take `&self`, the same way a driver's statement and
// cursor objects stay usable while the owning connection is referenced
// elsewhere.
//
// ============================================================================

pub mod memory;

use crate::core::Value;
use std::fmt;
use std::sync::Arc;

/// Failure reported by the driver.
///
/// Never returned from this crate's public API directly: every driver failure
/// is translated through the dialect's converter first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub message: String,
    pub sql_state: Option<String>,
    pub vendor_code: i32,
}

impl SqlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
            vendor_code: 0,
        }
    }

    pub fn with_state(message: impl Into<String>, sql_state: &str) -> Self {
        Self {
            message: message.into(),
            sql_state: Some(sql_state.to_string()),
            vendor_code: 0,
        }
    }

    pub fn vendor_code(mut self, code: i32) -> Self {
        self.vendor_code = code;
        self
    }

    /// First two characters of the SQLState, the class code.
    pub fn state_class(&self) -> Option<&str> {
        self.sql_state
            .as_deref()
            .filter(|state| state.len() >= 2)
            .map(|state| &state[..2])
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql_state {
            Some(state) => write!(
                f,
                "{} [SQLState: {}, error code: {}]",
                self.message, state, self.vendor_code
            ),
            None => write!(f, "{} [error code: {}]", self.message, self.vendor_code),
        }
    }
}

impl std::error::Error for SqlError {}

pub type SqlResult<T> = std::result::Result<T, SqlError>;

/// Warning chained on a connection by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlWarning {
    pub message: String,
    pub sql_state: Option<String>,
}

/// Outcome the driver reports for one entry of an executed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCount {
    Affected(u64),
    /// The driver executed the entry but cannot report how many rows it touched.
    SuccessNoInfo,
    /// The driver reports this entry as failed while continuing the batch.
    ExecuteFailed,
}

/// Cursor movement a scrollable result set supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollMode {
    ForwardOnly,
    ScrollInsensitive,
    ScrollSensitive,
}

impl ScrollMode {
    pub fn is_scrollable(&self) -> bool {
        !matches!(self, Self::ForwardOnly)
    }
}

/// How generated keys should be made available after an insert.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GeneratedKeys {
    #[default]
    None,
    /// Let the driver decide which columns to return.
    Auto,
    /// Return exactly these columns.
    Columns(Vec<String>),
}

/// Options the batcher passes along when asking the driver for a statement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrepareOptions {
    pub callable: bool,
    pub scroll: Option<ScrollMode>,
    pub generated_keys: GeneratedKeys,
}

/// A physical connection.
pub trait Connection: Send + Sync {
    fn prepare(&self, sql: &str, options: &PrepareOptions) -> SqlResult<Arc<dyn Statement>>;

    fn auto_commit(&self) -> SqlResult<bool>;

    fn set_auto_commit(&self, auto_commit: bool) -> SqlResult<()>;

    fn commit(&self) -> SqlResult<()>;

    fn rollback(&self) -> SqlResult<()>;

    fn is_closed(&self) -> SqlResult<bool>;

    fn warnings(&self) -> SqlResult<Vec<SqlWarning>> {
        Ok(Vec::new())
    }

    fn clear_warnings(&self) -> SqlResult<()> {
        Ok(())
    }

    fn close(&self) -> SqlResult<()>;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connection")
    }
}

/// A prepared or callable statement.
pub trait Statement: Send + Sync {
    fn bind(&self, index: usize, value: Value) -> SqlResult<()>;

    fn register_out_parameter(&self, index: usize) -> SqlResult<()>;

    fn out_parameter(&self, index: usize) -> SqlResult<Value>;

    fn execute_update(&self) -> SqlResult<u64>;

    fn execute_query(&self) -> SqlResult<Arc<dyn ResultSet>>;

    /// Runs the statement and returns whatever cursor it produced, if any.
    fn execute(&self) -> SqlResult<Option<Arc<dyn ResultSet>>>;

    fn add_batch(&self) -> SqlResult<()>;

    fn execute_batch(&self) -> SqlResult<Vec<RowCount>>;

    fn generated_keys(&self) -> SqlResult<Arc<dyn ResultSet>>;

    fn set_fetch_size(&self, rows: u32) -> SqlResult<()>;

    fn query_timeout(&self) -> SqlResult<u32>;

    fn set_query_timeout(&self, seconds: u32) -> SqlResult<()>;

    fn max_rows(&self) -> SqlResult<u64>;

    fn set_max_rows(&self, rows: u64) -> SqlResult<()>;

    fn cancel(&self) -> SqlResult<()>;

    fn close(&self) -> SqlResult<()>;
}

/// A cursor over query results. Columns are 1-based.
pub trait ResultSet: Send + Sync {
    fn next(&self) -> SqlResult<bool>;

    fn get(&self, column: usize) -> SqlResult<Value>;

    fn find_column(&self, name: &str) -> SqlResult<usize>;

    fn column_count(&self) -> SqlResult<usize>;

    fn get_by_name(&self, name: &str) -> SqlResult<Value> {
        let index = self.find_column(name)?;
        self.get(index)
    }

    fn close(&self) -> SqlResult<()>;
}

/// Hands out and takes back physical connections.
pub trait ConnectionProvider: Send + Sync {
    fn get_connection(&self) -> SqlResult<Arc<dyn Connection>>;

    fn close_connection(&self, connection: Arc<dyn Connection>) -> SqlResult<()>;

    /// Whether connections may be released after every statement and
    /// re-acquired later within the same transaction.
    fn supports_aggressive_release(&self) -> bool {
        false
    }
}
