//! Row-count contracts checked after every DML operation.

use crate::core::{Error, JdbcErrorKind, Result, Value};
use crate::driver::{RowCount, Statement};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Outcome an operation must produce, and whether it may join a batch.
pub trait Expectation: Send + Sync + Debug {
    /// Check the row count reported for the operation. `batch_position` is
    /// set when the count came from an executed batch.
    fn verify_outcome(
        &self,
        row_count: RowCount,
        statement: &dyn Statement,
        batch_position: Option<usize>,
    ) -> Result<()>;

    /// Prepare the statement before parameters are bound. Returns how far
    /// the caller must shift its parameter positions.
    fn prepare(&self, statement: &dyn Statement) -> Result<usize>;

    fn can_be_batched(&self) -> bool;
}

/// Accepts any outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneExpectation;

impl Expectation for NoneExpectation {
    fn verify_outcome(&self, _: RowCount, _: &dyn Statement, _: Option<usize>) -> Result<()> {
        Ok(())
    }

    fn prepare(&self, _: &dyn Statement) -> Result<usize> {
        Ok(0)
    }

    fn can_be_batched(&self) -> bool {
        true
    }
}

/// Requires the statement to report exactly `expected` affected rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicExpectation {
    expected: u64,
}

impl BasicExpectation {
    pub fn new(expected: u64) -> Self {
        Self { expected }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    fn check(&self, row_count: RowCount, batch_position: Option<usize>) -> Result<()> {
        match batch_position {
            Some(position) => self.check_batched(row_count, position),
            None => self.check_non_batched(row_count),
        }
    }

    fn check_batched(&self, row_count: RowCount, position: usize) -> Result<()> {
        let actual = match row_count {
            RowCount::SuccessNoInfo => {
                debug!("success of batch update unknown: {}", position);
                return Ok(());
            }
            RowCount::ExecuteFailed => return Err(Error::BatchFailed(position)),
            RowCount::Affected(actual) => actual,
        };
        if actual == self.expected {
            return Ok(());
        }
        let message = format!(
            "Batch update returned unexpected row count from update [{}]; actual row count: {}; expected: {}",
            position, actual, self.expected
        );
        if actual < self.expected {
            Err(Error::StaleState(message))
        } else {
            Err(Error::TooManyRowsAffected {
                message,
                expected: self.expected,
                actual,
                batch_position: Some(position),
            })
        }
    }

    fn check_non_batched(&self, row_count: RowCount) -> Result<()> {
        let actual = match row_count {
            RowCount::SuccessNoInfo => {
                debug!("success of update unknown");
                return Ok(());
            }
            RowCount::ExecuteFailed => {
                return Err(Error::StaleState(format!(
                    "Update failed; expected row count: {}",
                    self.expected
                )));
            }
            RowCount::Affected(actual) => actual,
        };
        if actual == self.expected {
            return Ok(());
        }
        let message = format!(
            "Unexpected row count: {}; expected: {}",
            actual, self.expected
        );
        if actual < self.expected {
            Err(Error::StaleState(message))
        } else {
            Err(Error::TooManyRowsAffected {
                message,
                expected: self.expected,
                actual,
                batch_position: None,
            })
        }
    }
}

impl Expectation for BasicExpectation {
    fn verify_outcome(
        &self,
        row_count: RowCount,
        _statement: &dyn Statement,
        batch_position: Option<usize>,
    ) -> Result<()> {
        self.check(row_count, batch_position)
    }

    fn prepare(&self, _: &dyn Statement) -> Result<usize> {
        Ok(0)
    }

    fn can_be_batched(&self) -> bool {
        true
    }
}

/// Reads the affected row count from an OUT parameter of a callable
/// statement instead of trusting the driver's update count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamExpectation {
    basic: BasicExpectation,
    position: usize,
}

impl ParamExpectation {
    pub const PARAMETER_POSITION: usize = 1;

    pub fn new(expected: u64) -> Self {
        Self {
            basic: BasicExpectation::new(expected),
            position: Self::PARAMETER_POSITION,
        }
    }

    fn row_count_from(&self, statement: &dyn Statement) -> Result<RowCount> {
        let value = statement.out_parameter(self.position).map_err(|e| Error::Jdbc {
            kind: JdbcErrorKind::Generic,
            message: "could not extract row counts from CallableStatement".into(),
            sql: None,
            source: e,
        })?;
        Ok(match value {
            Value::Null => RowCount::Affected(0),
            other => match other.as_i64() {
                Some(-2) => RowCount::SuccessNoInfo,
                Some(-3) => RowCount::ExecuteFailed,
                Some(n) => RowCount::Affected(n.max(0) as u64),
                None => RowCount::Affected(0),
            },
        })
    }
}

impl Expectation for ParamExpectation {
    fn verify_outcome(
        &self,
        _reported: RowCount,
        statement: &dyn Statement,
        batch_position: Option<usize>,
    ) -> Result<()> {
        let row_count = self.row_count_from(statement)?;
        self.basic.check(row_count, batch_position)
    }

    fn prepare(&self, statement: &dyn Statement) -> Result<usize> {
        statement
            .register_out_parameter(self.position)
            .map_err(|e| Error::Jdbc {
                kind: JdbcErrorKind::Generic,
                message: "could not register row count OUT parameter".into(),
                sql: None,
                source: e,
            })?;
        Ok(1)
    }

    fn can_be_batched(&self) -> bool {
        false
    }
}

/// How the outcome of a custom SQL operation is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCheckStyle {
    None,
    #[default]
    Count,
    Param,
}

impl ResultCheckStyle {
    pub fn expectation(self) -> Arc<dyn Expectation> {
        appropriate_expectation(self)
    }
}

/// The expectation a check style calls for, expecting a single row.
pub fn appropriate_expectation(style: ResultCheckStyle) -> Arc<dyn Expectation> {
    match style {
        ResultCheckStyle::None => Arc::new(NoneExpectation),
        ResultCheckStyle::Count => Arc::new(BasicExpectation::new(1)),
        ResultCheckStyle::Param => Arc::new(ParamExpectation::new(1)),
    }
}
