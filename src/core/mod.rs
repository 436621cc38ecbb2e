pub mod error;
pub mod value;

pub use error::{Error, JdbcErrorKind, Result};
pub use value::Value;
