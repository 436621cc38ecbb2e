//! Vendor abstraction consulted by the batcher: scrollable cursor support,
//! result extraction from callable statements, and translation of driver
//! failures into [`Error`].

use crate::core::{Error, JdbcErrorKind};
use crate::driver::{ResultSet, ScrollMode, SqlError, SqlResult, Statement};
use std::sync::Arc;

pub trait Dialect: Send + Sync {
    fn name(&self) -> &str;

    /// Scroll mode to request when the caller asks for a scrollable cursor
    /// without naming one.
    fn default_scroll_mode(&self) -> ScrollMode {
        ScrollMode::ScrollInsensitive
    }

    /// Offset the caller must add to parameter positions when a callable
    /// statement returns its cursor through an OUT parameter.
    fn register_result_set_out_parameter(&self, _statement: &dyn Statement, position: usize) -> SqlResult<usize> {
        Ok(position)
    }

    /// Run a callable statement and hand back the cursor it produced.
    fn result_set_from_callable(&self, statement: &dyn Statement) -> SqlResult<Arc<dyn ResultSet>> {
        statement
            .execute()?
            .ok_or_else(|| SqlError::with_state("callable statement returned no result set", "02000"))
    }

    /// Translate a driver failure, keeping the SQL text for diagnostics.
    fn convert(&self, error: SqlError, message: &str, sql: Option<&str>) -> Error {
        Error::Jdbc {
            kind: classify(&error),
            message: message.to_string(),
            sql: sql.map(str::to_string),
            source: error,
        }
    }
}

/// Map a driver failure onto a category from its SQLState class code.
pub fn classify(error: &SqlError) -> JdbcErrorKind {
    match error.state_class() {
        Some("23") | Some("27") | Some("44") => JdbcErrorKind::ConstraintViolation,
        Some("07") | Some("37") | Some("42") | Some("65") | Some("S0") | Some("20") => {
            JdbcErrorKind::SqlGrammar
        }
        Some("08") => JdbcErrorKind::Connection,
        Some("40") | Some("61") => JdbcErrorKind::LockAcquisition,
        Some("21") | Some("22") => JdbcErrorKind::DataException,
        _ => JdbcErrorKind::Generic,
    }
}

/// Dialect with standard SQLState conversion and no vendor extensions.
#[derive(Debug, Default, Clone)]
pub struct GenericDialect;

impl Dialect for GenericDialect {
    fn name(&self) -> &str {
        "generic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_state_class() {
        let cases = [
            ("23505", JdbcErrorKind::ConstraintViolation),
            ("42P01", JdbcErrorKind::SqlGrammar),
            ("08006", JdbcErrorKind::Connection),
            ("40001", JdbcErrorKind::LockAcquisition),
            ("22003", JdbcErrorKind::DataException),
            ("HY000", JdbcErrorKind::Generic),
        ];
        for (state, kind) in cases {
            assert_eq!(classify(&SqlError::with_state("x", state)), kind, "{}", state);
        }
        assert_eq!(classify(&SqlError::new("no state")), JdbcErrorKind::Generic);
    }

    #[test]
    fn test_convert_keeps_sql_and_message() {
        let err = GenericDialect.convert(
            SqlError::with_state("duplicate key", "23505"),
            "could not insert",
            Some("INSERT INTO t VALUES (?)"),
        );
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (?)"));
        match err {
            Error::Jdbc { kind, message, .. } => {
                assert_eq!(kind, JdbcErrorKind::ConstraintViolation);
                assert_eq!(message, "could not insert");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
