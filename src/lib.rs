// ============================================================================
// session-jdbc Library
// ============================================================================
//
// JDBC-level resource management for an ORM session: statement preparation,
// batching with row-count verification, cursor tracking, connection release
// policies and coordination with local or external transactions.
//
// ============================================================================

//! # Example
//!
//! ```
//! use session_jdbc::driver::memory::MemoryDatabase;
//! use session_jdbc::engine::BasicExpectation;
//! use session_jdbc::{JdbcContext, JdbcServices, Result, SessionOwner, Settings, Value};
//! use std::sync::Arc;
//!
//! struct Session;
//!
//! impl SessionOwner for Session {
//!     fn managed_flush(&self, context: &mut JdbcContext) -> Result<()> {
//!         context.statements().execute_batch()
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let db = MemoryDatabase::new();
//! let services = JdbcServices::new(Settings::new().batch_size(20), Arc::new(db.clone()))?;
//! let context = JdbcContext::open(services, Arc::new(Session), None)?;
//! let mut context = context.lock()?;
//!
//! context.begin_transaction()?;
//! {
//!     let mut statements = context.statements();
//!     for id in 0..3 {
//!         let insert = statements.prepare_batch_statement("INSERT INTO users VALUES (?)")?;
//!         insert.bind(1, Value::Integer(id)).unwrap();
//!         statements.add_to_batch(Arc::new(BasicExpectation::new(1)))?;
//!     }
//! }
//! context.commit_transaction()?;
//!
//! assert_eq!(db.executed_batches(), vec![3]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod core;
pub mod dialect;
pub mod driver;
pub mod engine;
pub mod services;
pub mod transaction;

pub use config::{ConnectionReleaseMode, ReleaseModeSetting, Settings};
pub use context::{
    BorrowedConnection, ConnectionManager, ContextSnapshot, JdbcContext, SessionOwner,
    SharedContext, Statements,
};
pub use core::{Error, JdbcErrorKind, Result, Value};
pub use dialect::{Dialect, GenericDialect};
pub use engine::{Batcher, Expectation, ResultCheckStyle, TrackedResultSet, TrackedStatement};
pub use services::JdbcServices;
pub use transaction::{
    JdbcTransactionFactory, JtaTransactionFactory, LocalTransaction, TransactionFactory,
};
