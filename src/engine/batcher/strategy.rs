use crate::core::Error;
use crate::driver::{RowCount, SqlError, Statement};
use crate::engine::expectation::Expectation;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Why a batch step failed. Driver failures still need translating by the
/// batcher; outcome failures are already final.
#[derive(Debug)]
pub enum BatchFailure {
    Driver {
        error: SqlError,
        action: &'static str,
    },
    Outcome(Error),
}

impl From<Error> for BatchFailure {
    fn from(err: Error) -> Self {
        Self::Outcome(err)
    }
}

pub type BatchResult<T> = std::result::Result<T, BatchFailure>;

/// Decides what happens to DML added to the current batch statement.
pub trait BatchStrategy: Send {
    /// Queue (or run) the operation whose parameters are currently bound.
    fn add_to_batch(
        &mut self,
        statement: &dyn Statement,
        expectation: Arc<dyn Expectation>,
    ) -> BatchResult<()>;

    /// Run whatever is queued and verify each outcome. The queue is empty
    /// afterwards whether or not this succeeds.
    fn execute_batch(&mut self, statement: &dyn Statement) -> BatchResult<()>;

    /// Operations queued but not yet sent to the driver.
    fn pending(&self) -> usize;

    /// Forget queued operations without running them.
    fn discard(&mut self);
}

/// Sends DML as driver batches of at most `size` operations.
pub struct BatchingStrategy {
    size: usize,
    expectations: Vec<Arc<dyn Expectation>>,
}

impl BatchingStrategy {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            expectations: Vec::with_capacity(size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check_row_counts(&self, row_counts: &[RowCount], statement: &dyn Statement) -> BatchResult<()> {
        if row_counts.len() != self.expectations.len() {
            warn!(
                expected = self.expectations.len(),
                actual = row_counts.len(),
                "JDBC driver did not return the expected number of row counts"
            );
        }
        for (position, (row_count, expectation)) in
            row_counts.iter().zip(&self.expectations).enumerate()
        {
            expectation.verify_outcome(*row_count, statement, Some(position))?;
        }
        Ok(())
    }
}

impl fmt::Debug for BatchingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchingStrategy")
            .field("size", &self.size)
            .field("pending", &self.expectations.len())
            .finish()
    }
}

impl BatchStrategy for BatchingStrategy {
    fn add_to_batch(
        &mut self,
        statement: &dyn Statement,
        expectation: Arc<dyn Expectation>,
    ) -> BatchResult<()> {
        if !expectation.can_be_batched() {
            return Err(BatchFailure::Outcome(Error::General(
                "attempting to batch an operation which cannot be batched".into(),
            )));
        }
        statement.add_batch().map_err(|error| BatchFailure::Driver {
            error,
            action: "could not add to JDBC batch",
        })?;
        self.expectations.push(expectation);
        if self.expectations.len() >= self.size {
            self.execute_batch(statement)?;
        }
        Ok(())
    }

    fn execute_batch(&mut self, statement: &dyn Statement) -> BatchResult<()> {
        if self.expectations.is_empty() {
            debug!("no batched statements to execute");
            return Ok(());
        }
        debug!(size = self.expectations.len(), "executing batch");
        let outcome = statement
            .execute_batch()
            .map_err(|error| BatchFailure::Driver {
                error,
                action: "could not execute JDBC batch update",
            })
            .and_then(|row_counts| self.check_row_counts(&row_counts, statement));
        self.expectations.clear();
        if let Err(failure) = &outcome {
            error!("exception executing batch: {:?}", failure);
        }
        outcome
    }

    fn pending(&self) -> usize {
        self.expectations.len()
    }

    fn discard(&mut self) {
        self.expectations.clear();
    }
}

/// Runs and verifies each operation the moment it is added, for drivers or
/// configurations without usable batch support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonBatchingStrategy;

impl BatchStrategy for NonBatchingStrategy {
    fn add_to_batch(
        &mut self,
        statement: &dyn Statement,
        expectation: Arc<dyn Expectation>,
    ) -> BatchResult<()> {
        let rows = statement
            .execute_update()
            .map_err(|error| BatchFailure::Driver {
                error,
                action: "could not execute update",
            })?;
        expectation.verify_outcome(RowCount::Affected(rows), statement, None)?;
        Ok(())
    }

    fn execute_batch(&mut self, _statement: &dyn Statement) -> BatchResult<()> {
        Ok(())
    }

    fn pending(&self) -> usize {
        0
    }

    fn discard(&mut self) {}
}

/// Strategy matching the configured batch size; `0` disables batching.
pub fn strategy_for(batch_size: usize) -> Box<dyn BatchStrategy> {
    if batch_size > 0 {
        Box::new(BatchingStrategy::new(batch_size))
    } else {
        Box::new(NonBatchingStrategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDatabase;
    use crate::driver::{ConnectionProvider, PrepareOptions};
    use crate::engine::expectation::{BasicExpectation, ParamExpectation};

    fn insert(db: &MemoryDatabase) -> Arc<dyn Statement> {
        db.get_connection()
            .unwrap()
            .prepare("INSERT INTO t VALUES (?)", &PrepareOptions::default())
            .unwrap()
    }

    #[test]
    fn test_auto_flush_at_threshold() {
        let db = MemoryDatabase::new();
        let stmt = insert(&db);
        let mut strategy = BatchingStrategy::new(2);
        for _ in 0..5 {
            strategy
                .add_to_batch(stmt.as_ref(), Arc::new(BasicExpectation::new(1)))
                .unwrap();
        }
        assert_eq!(db.executed_batches(), vec![2, 2]);
        assert_eq!(strategy.pending(), 1);
        strategy.execute_batch(stmt.as_ref()).unwrap();
        assert_eq!(db.executed_batches(), vec![2, 2, 1]);
        assert_eq!(strategy.pending(), 0);
    }

    #[test]
    fn test_rejects_unbatchable_expectation() {
        let db = MemoryDatabase::new();
        let stmt = insert(&db);
        let mut strategy = BatchingStrategy::new(10);
        let err = strategy
            .add_to_batch(stmt.as_ref(), Arc::new(ParamExpectation::new(1)))
            .unwrap_err();
        assert!(matches!(err, BatchFailure::Outcome(Error::General(_))));
        assert_eq!(strategy.pending(), 0);
    }

    #[test]
    fn test_mismatch_resets_queue() {
        let db = MemoryDatabase::new();
        db.script_batch_counts(vec![RowCount::Affected(1), RowCount::Affected(0)]);
        let stmt = insert(&db);
        let mut strategy = BatchingStrategy::new(10);
        strategy
            .add_to_batch(stmt.as_ref(), Arc::new(BasicExpectation::new(1)))
            .unwrap();
        strategy
            .add_to_batch(stmt.as_ref(), Arc::new(BasicExpectation::new(1)))
            .unwrap();

        let err = strategy.execute_batch(stmt.as_ref()).unwrap_err();
        assert!(matches!(err, BatchFailure::Outcome(Error::StaleState(_))));
        assert_eq!(strategy.pending(), 0);
    }

    #[test]
    fn test_short_row_count_array_verifies_reported_positions() {
        let db = MemoryDatabase::new();
        db.script_batch_counts(vec![RowCount::Affected(1)]);
        let stmt = insert(&db);
        let mut strategy = BatchingStrategy::new(10);
        for _ in 0..3 {
            strategy
                .add_to_batch(stmt.as_ref(), Arc::new(BasicExpectation::new(1)))
                .unwrap();
        }
        assert!(strategy.execute_batch(stmt.as_ref()).is_ok());
    }

    #[test]
    fn test_non_batching_executes_immediately() {
        let db = MemoryDatabase::new();
        let stmt = insert(&db);
        let mut strategy = NonBatchingStrategy;
        strategy
            .add_to_batch(stmt.as_ref(), Arc::new(BasicExpectation::new(1)))
            .unwrap();
        assert!(db.executed_batches().is_empty());

        db.script_update_count(2);
        let err = strategy
            .add_to_batch(stmt.as_ref(), Arc::new(BasicExpectation::new(1)))
            .unwrap_err();
        match err {
            BatchFailure::Outcome(Error::TooManyRowsAffected { batch_position, .. }) => {
                assert_eq!(batch_position, None)
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }
}
