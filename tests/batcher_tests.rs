mod common;

use common::RecordingSource;
use session_jdbc::driver::memory::{DriverEvent, Fault, MemoryDatabase};
use session_jdbc::driver::{GeneratedKeys, RowCount, SqlError, Statement};
use session_jdbc::engine::{
    BasicExpectation, Batcher, ConcurrentStatistics, Expectation, Interceptor, ResourceCounters,
};
use session_jdbc::{Error, JdbcServices, Settings, Value};
use std::sync::{Arc, Mutex};
use tracing::Level;

const INSERT: &str = "INSERT INTO users (id, name) VALUES (?, ?)";
const SELECT: &str = "SELECT id, name FROM users";

fn services(db: &MemoryDatabase, settings: Settings) -> JdbcServices {
    JdbcServices::new(settings, Arc::new(db.clone())).unwrap()
}

fn queue_insert(batcher: &mut Batcher, source: &mut RecordingSource, id: i64) -> session_jdbc::Result<()> {
    let statement = batcher.prepare_batch_statement(source, INSERT)?;
    statement.bind(1, Value::Integer(id)).unwrap();
    statement.bind(2, Value::from("user")).unwrap();
    batcher.add_to_batch(Arc::new(BasicExpectation::new(1)))
}

fn position_of(events: &[DriverEvent], predicate: impl Fn(&DriverEvent) -> bool) -> usize {
    events.iter().position(predicate).expect("event not recorded")
}

/// Expects one row and records every outcome it is asked to verify.
#[derive(Debug, Default)]
struct RecordingExpectation {
    outcomes: Mutex<Vec<(RowCount, Option<usize>)>>,
}

impl RecordingExpectation {
    fn outcomes(&self) -> Vec<(RowCount, Option<usize>)> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl Expectation for RecordingExpectation {
    fn verify_outcome(
        &self,
        row_count: RowCount,
        statement: &dyn Statement,
        batch_position: Option<usize>,
    ) -> session_jdbc::Result<()> {
        self.outcomes.lock().unwrap().push((row_count, batch_position));
        BasicExpectation::new(1).verify_outcome(row_count, statement, batch_position)
    }

    fn prepare(&self, statement: &dyn Statement) -> session_jdbc::Result<usize> {
        BasicExpectation::new(1).prepare(statement)
    }

    fn can_be_batched(&self) -> bool {
        true
    }
}

fn queue_recorded(
    batcher: &mut Batcher,
    source: &mut RecordingSource,
    id: i64,
    expectation: &Arc<RecordingExpectation>,
) -> session_jdbc::Result<()> {
    let statement = batcher.prepare_batch_statement(source, INSERT)?;
    statement.bind(1, Value::Integer(id)).unwrap();
    statement.bind(2, Value::from("user")).unwrap();
    let expectation: Arc<dyn Expectation> = expectation.clone();
    batcher.add_to_batch(expectation)
}

#[test]
fn test_seven_inserts_with_batch_size_three() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(3)));
    let mut source = RecordingSource::new(&db);

    for id in 1..=7 {
        queue_insert(&mut batcher, &mut source, id).unwrap();
        assert!(batcher.pending_batch_size() < 3);
    }
    assert_eq!(db.executed_batches(), vec![3, 3]);
    assert_eq!(batcher.pending_batch_size(), 1);

    batcher.execute_batch(&mut source).unwrap();
    assert_eq!(db.executed_batches(), vec![3, 3, 1]);
    assert_eq!(db.prepared_count(), 1);
    assert_eq!(batcher.batch_sql(), None);
}

#[test]
fn test_every_batched_operation_is_verified_once() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(3)));
    let mut source = RecordingSource::new(&db);
    let expectations: Vec<_> = (0..7).map(|_| Arc::new(RecordingExpectation::default())).collect();

    for (id, expectation) in (1..=7).zip(&expectations) {
        queue_recorded(&mut batcher, &mut source, id, expectation).unwrap();
    }
    batcher.execute_batch(&mut source).unwrap();
    assert_eq!(db.executed_batches(), vec![3, 3, 1]);

    let positions: Vec<_> = expectations
        .iter()
        .map(|expectation| {
            let outcomes = expectation.outcomes();
            assert_eq!(outcomes.len(), 1);
            assert_eq!(outcomes[0].0, RowCount::Affected(1));
            outcomes[0].1
        })
        .collect();
    assert_eq!(
        positions,
        vec![Some(0), Some(1), Some(2), Some(0), Some(1), Some(2), Some(0)]
    );
}

#[test]
fn test_verification_stops_at_first_mismatch() {
    let db = MemoryDatabase::new();
    db.script_batch_counts(vec![
        RowCount::Affected(1),
        RowCount::Affected(2),
        RowCount::Affected(1),
    ]);
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let mut source = RecordingSource::new(&db);
    let expectations: Vec<_> = (0..3).map(|_| Arc::new(RecordingExpectation::default())).collect();
    for (id, expectation) in (1..=3).zip(&expectations) {
        queue_recorded(&mut batcher, &mut source, id, expectation).unwrap();
    }

    let err = batcher.execute_batch(&mut source).unwrap_err();
    assert!(matches!(
        err,
        Error::TooManyRowsAffected { expected: 1, actual: 2, batch_position: Some(1), .. }
    ));
    assert_eq!(expectations[0].outcomes(), vec![(RowCount::Affected(1), Some(0))]);
    assert_eq!(expectations[1].outcomes(), vec![(RowCount::Affected(2), Some(1))]);
    assert!(expectations[2].outcomes().is_empty());
}

#[test]
fn test_identical_sql_reuses_batch_statement() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let mut source = RecordingSource::new(&db);

    let first = batcher.prepare_batch_statement(&mut source, INSERT).unwrap();
    let second = batcher.prepare_batch_statement(&mut source, INSERT).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(db.prepared_count(), 1);
}

#[test]
fn test_different_sql_executes_previous_batch_first() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let mut source = RecordingSource::new(&db);

    queue_insert(&mut batcher, &mut source, 1).unwrap();
    queue_insert(&mut batcher, &mut source, 2).unwrap();

    let update = "UPDATE users SET name = ? WHERE id = ?";
    batcher.prepare_batch_statement(&mut source, update).unwrap();
    assert_eq!(db.executed_batches(), vec![2]);

    let events = db.events();
    let executed = position_of(&events, |e| {
        matches!(e, DriverEvent::BatchExecuted { sql, .. } if sql == INSERT)
    });
    let closed = position_of(&events, |e| {
        matches!(e, DriverEvent::StatementClosed { sql, .. } if sql == INSERT)
    });
    let prepared = position_of(&events, |e| {
        matches!(e, DriverEvent::Prepared { sql, .. } if sql == update)
    });
    assert!(executed < closed && closed < prepared);
    assert_eq!(batcher.batch_sql(), Some(update));
}

#[test]
fn test_non_batch_prepare_flushes_pending_batch() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let mut source = RecordingSource::new(&db);

    queue_insert(&mut batcher, &mut source, 1).unwrap();
    let delete = batcher
        .prepare_statement(&mut source, "DELETE FROM users", GeneratedKeys::None)
        .unwrap();
    assert_eq!(db.executed_batches(), vec![1]);

    delete.execute_update().unwrap();
    batcher.close_statement(&mut source, &delete).unwrap();
    assert_eq!(batcher.registered_statements(), 0);
    assert_eq!(db.open_statements(), 0);
}

#[test]
fn test_row_count_mismatch_identifies_position() {
    let db = MemoryDatabase::new();
    db.script_batch_counts(vec![
        RowCount::Affected(1),
        RowCount::Affected(3),
        RowCount::Affected(1),
    ]);
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let mut source = RecordingSource::new(&db);
    for id in 1..=3 {
        queue_insert(&mut batcher, &mut source, id).unwrap();
    }

    let err = batcher.execute_batch(&mut source).unwrap_err();
    assert_eq!(err.batch_position(), Some(1));
    assert!(err.is_row_count_mismatch());
    assert_eq!(batcher.pending_batch_size(), 0);
    assert_eq!(db.open_statements(), 0);

    // the next batch starts from an empty queue
    queue_insert(&mut batcher, &mut source, 4).unwrap();
    batcher.execute_batch(&mut source).unwrap();
    assert_eq!(db.executed_batches(), vec![3, 1]);
}

#[test]
fn test_stale_state_when_fewer_rows_affected() {
    let db = MemoryDatabase::new();
    db.script_batch_counts(vec![RowCount::Affected(0)]);
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let mut source = RecordingSource::new(&db);
    queue_insert(&mut batcher, &mut source, 1).unwrap();

    let err = batcher.execute_batch(&mut source).unwrap_err();
    assert!(matches!(err, Error::StaleState(_)));
}

#[test]
fn test_driver_batch_failure_is_converted() {
    let db = MemoryDatabase::new();
    db.fail(
        Fault::ExecuteBatch,
        SqlError::with_state("duplicate key", "23505"),
    );
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let mut source = RecordingSource::new(&db);
    queue_insert(&mut batcher, &mut source, 1).unwrap();

    let err = batcher.execute_batch(&mut source).unwrap_err();
    assert_eq!(err.sql(), Some(INSERT));
    assert!(matches!(
        err,
        Error::Jdbc {
            kind: session_jdbc::JdbcErrorKind::ConstraintViolation,
            ..
        }
    ));
    assert_eq!(batcher.pending_batch_size(), 0);
}

#[test]
fn test_non_batching_executes_each_operation() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(0)));
    let mut source = RecordingSource::new(&db);

    for id in 1..=3 {
        queue_insert(&mut batcher, &mut source, id).unwrap();
    }
    batcher.execute_batch(&mut source).unwrap();

    let updates = db
        .events()
        .iter()
        .filter(|e| matches!(e, DriverEvent::ExecutedUpdate { .. }))
        .count();
    assert_eq!(updates, 3);
    assert!(db.executed_batches().is_empty());
}

#[test]
fn test_abort_batch_discards_pending_operations() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let mut source = RecordingSource::new(&db);
    queue_insert(&mut batcher, &mut source, 1).unwrap();

    db.fail(Fault::CloseStatement, SqlError::new("close failed"));
    batcher.abort_batch(&mut source);

    assert_eq!(batcher.pending_batch_size(), 0);
    assert_eq!(batcher.batch_sql(), None);
    assert!(db.executed_batches().is_empty());
}

#[test]
fn test_add_to_batch_without_batch_statement() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let err = batcher
        .add_to_batch(Arc::new(BasicExpectation::new(1)))
        .unwrap_err();
    assert!(matches!(err, Error::Assertion(_)));
}

#[test]
fn test_close_query_statement_closes_result_set_first() {
    let db = MemoryDatabase::new();
    db.register_query(SELECT, &["id", "name"], vec![vec![Value::Integer(1), Value::from("alice")]]);
    let mut batcher = Batcher::new(&services(&db, Settings::new()));
    let mut source = RecordingSource::new(&db);

    let query = batcher
        .prepare_query_statement(&mut source, SELECT, false, None)
        .unwrap();
    let rows = batcher.get_result_set(&query).unwrap();
    assert!(rows.next().unwrap());
    assert_eq!(batcher.registered_statements(), 1);
    assert_eq!(batcher.registered_result_sets(), 1);
    assert!(batcher.has_open_resources());

    batcher
        .close_query_statement(&mut source, &query, Some(&rows))
        .unwrap();
    assert_eq!(batcher.registered_statements(), 0);
    assert_eq!(batcher.registered_result_sets(), 0);
    assert_eq!(db.open_result_sets(), 0);
    assert_eq!(db.open_statements(), 0);

    let events = db.events();
    let result_set_closed = position_of(&events, |e| matches!(e, DriverEvent::ResultSetClosed { .. }));
    let statement_closed = position_of(&events, |e| matches!(e, DriverEvent::StatementClosed { .. }));
    assert!(result_set_closed < statement_closed);
    assert_eq!(source.after_statement_calls, vec![false]);
}

#[test]
fn test_close_query_statement_resets_max_rows() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new()));
    let mut source = RecordingSource::new(&db);
    let query = batcher
        .prepare_query_statement(&mut source, SELECT, false, None)
        .unwrap();
    query.set_max_rows(10).unwrap();

    db.fail(Fault::ResetMaxRows, SqlError::new("pool defect"));
    batcher.close_query_statement(&mut source, &query, None).unwrap();
    assert_eq!(db.open_statements(), 0);
}

#[test]
fn test_close_statements_empties_registries_despite_failures() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let mut source = RecordingSource::new(&db);

    for _ in 0..2 {
        let query = batcher
            .prepare_query_statement(&mut source, SELECT, true, None)
            .unwrap();
        batcher.get_result_set(&query).unwrap();
    }
    queue_insert(&mut batcher, &mut source, 1).unwrap();
    assert_eq!(batcher.registered_statements(), 2);
    assert_eq!(batcher.registered_result_sets(), 2);

    db.fail(Fault::CloseStatement, SqlError::new("close failed"));
    db.fail(Fault::CloseResultSet, SqlError::new("close failed"));
    let failures = batcher.close_statements();

    assert_eq!(failures.len(), 5);
    assert_eq!(batcher.registered_statements(), 0);
    assert_eq!(batcher.registered_result_sets(), 0);
    assert!(!batcher.has_open_resources());
    assert_eq!(batcher.pending_batch_size(), 0);
    assert!(db.executed_batches().is_empty());
    assert!(source.after_statement_calls.is_empty());

    // nothing left to cancel
    batcher.cancel_last_query().unwrap();
    assert!(!db.events().iter().any(|e| matches!(e, DriverEvent::Cancelled { .. })));
}

#[test]
fn test_cancel_last_scrollable_query() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new()));
    let mut source = RecordingSource::new(&db);

    let scrollable = batcher
        .prepare_query_statement(&mut source, SELECT, true, None)
        .unwrap();
    batcher
        .prepare_query_statement(&mut source, "SELECT 1", false, None)
        .unwrap();
    batcher.cancel_last_query().unwrap();

    let cancelled: Vec<_> = db
        .events()
        .into_iter()
        .filter_map(|e| match e {
            DriverEvent::Cancelled { statement } => Some(statement),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled.len(), 1);
    assert!(db.events().iter().any(|e| matches!(
        e,
        DriverEvent::Prepared { statement, scrollable: true, .. } if *statement == cancelled[0]
    )));

    batcher.close_query_statement(&mut source, &scrollable, None).unwrap();
    db.clear_events();
    batcher.cancel_last_query().unwrap();
    assert!(db.events().is_empty());
}

#[test]
fn test_wrapped_result_set_caches_column_lookups() {
    let db = MemoryDatabase::new();
    db.register_query(SELECT, &["id", "name"], vec![vec![Value::Integer(1), Value::from("alice")]]);
    let mut batcher = Batcher::new(&services(&db, Settings::new().wrap_result_sets(true)));
    let mut source = RecordingSource::new(&db);

    let query = batcher
        .prepare_query_statement(&mut source, SELECT, false, None)
        .unwrap();
    let rows = batcher.get_result_set(&query).unwrap();
    for _ in 0..3 {
        assert_eq!(rows.find_column("name").unwrap(), 2);
    }
    assert_eq!(rows.find_column("id").unwrap(), 1);

    let lookups = db
        .events()
        .iter()
        .filter(|e| matches!(e, DriverEvent::FindColumn { .. }))
        .count();
    assert_eq!(lookups, 2);
}

#[test]
fn test_expired_deadline_never_reaches_driver() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().batch_size(10)));
    let mut source = RecordingSource::new(&db);

    batcher.set_transaction_timeout(0);
    let err = batcher
        .prepare_statement(&mut source, "DELETE FROM users", GeneratedKeys::None)
        .unwrap_err();
    assert!(matches!(err, Error::TransactionTimeout));
    assert!(matches!(
        batcher.prepare_query_statement(&mut source, SELECT, false, None),
        Err(Error::TransactionTimeout)
    ));
    assert!(matches!(
        batcher.prepare_batch_statement(&mut source, INSERT),
        Err(Error::TransactionTimeout)
    ));
    assert_eq!(db.prepared_count(), 0);

    batcher.unset_transaction_timeout();
    batcher
        .prepare_statement(&mut source, "DELETE FROM users", GeneratedKeys::None)
        .unwrap();
    assert_eq!(db.prepared_count(), 1);
}

#[test]
fn test_remaining_timeout_and_fetch_size_applied() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().fetch_size(50)));
    let mut source = RecordingSource::new(&db);

    batcher.set_transaction_timeout(60);
    batcher
        .prepare_query_statement(&mut source, SELECT, false, None)
        .unwrap();

    let events = db.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, DriverEvent::FetchSize { rows: 50, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        DriverEvent::QueryTimeout { seconds, .. } if *seconds > 0 && *seconds <= 60
    )));
}

struct Blanking;

impl Interceptor for Blanking {
    fn on_prepare_statement(&self, _sql: &str) -> String {
        String::new()
    }
}

struct Commenting;

impl Interceptor for Commenting {
    fn on_prepare_statement(&self, sql: &str) -> String {
        format!("/* app */ {}", sql)
    }
}

#[test]
fn test_interceptor_returning_empty_sql_fails() {
    let db = MemoryDatabase::new();
    let services = services(&db, Settings::new()).with_interceptor(Arc::new(Blanking));
    let mut batcher = Batcher::new(&services);
    let mut source = RecordingSource::new(&db);

    let err = batcher
        .prepare_statement(&mut source, "DELETE FROM users", GeneratedKeys::None)
        .unwrap_err();
    assert!(matches!(err, Error::Assertion(_)));
    assert_eq!(db.prepared_count(), 0);
}

#[test]
fn test_interceptor_rewrite_reaches_driver() {
    let db = MemoryDatabase::new();
    let services = services(&db, Settings::new().batch_size(5)).with_interceptor(Arc::new(Commenting));
    let mut batcher = Batcher::new(&services);
    let mut source = RecordingSource::new(&db);

    let statement = batcher.prepare_batch_statement(&mut source, INSERT).unwrap();
    assert_eq!(statement.sql(), format!("/* app */ {}", INSERT));
    batcher.prepare_batch_statement(&mut source, INSERT).unwrap();
    assert_eq!(db.prepared_count(), 1);
}

#[test]
fn test_unsupported_features_are_rejected() {
    let db = MemoryDatabase::new();
    let mut batcher = Batcher::new(&services(&db, Settings::new().scrollable_result_sets(false)));
    let mut source = RecordingSource::new(&db);

    assert!(matches!(
        batcher.prepare_query_statement(&mut source, SELECT, true, None),
        Err(Error::Assertion(_))
    ));
    assert!(matches!(
        batcher.prepare_statement(&mut source, INSERT, GeneratedKeys::Auto),
        Err(Error::Assertion(_))
    ));
    assert_eq!(db.prepared_count(), 0);
}

#[test]
fn test_prepare_failure_is_converted_with_sql() {
    let db = MemoryDatabase::new();
    db.fail(
        Fault::Prepare("bogus".into()),
        SqlError::with_state("syntax error", "42601"),
    );
    let mut batcher = Batcher::new(&services(&db, Settings::new()));
    let mut source = RecordingSource::new(&db);

    let err = batcher
        .prepare_statement(&mut source, "SELECT bogus", GeneratedKeys::None)
        .unwrap_err();
    assert_eq!(err.sql(), Some("SELECT bogus"));
    assert!(matches!(
        err,
        Error::Jdbc {
            kind: session_jdbc::JdbcErrorKind::SqlGrammar,
            ..
        }
    ));
}

#[test]
fn test_statistics_count_prepared_and_closed_statements() {
    let db = MemoryDatabase::new();
    let statistics = Arc::new(ConcurrentStatistics::new());
    let services = services(&db, Settings::new().statistics(true)).with_statistics(statistics.clone());
    let mut batcher = Batcher::new(&services);
    let mut source = RecordingSource::new(&db);

    let query = batcher
        .prepare_query_statement(&mut source, SELECT, false, None)
        .unwrap();
    batcher.close_query_statement(&mut source, &query, None).unwrap();

    let snapshot = statistics.snapshot();
    assert_eq!(snapshot.prepared_statements, 1);
    assert_eq!(snapshot.closed_statements, 1);
}

#[test]
fn test_open_resource_counters_under_debug_logging() {
    let db = MemoryDatabase::new();
    let counters = Arc::new(ResourceCounters::new());
    let services = services(&db, Settings::new()).with_resource_counters(counters.clone());
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let mut batcher = Batcher::new(&services);
        let mut source = RecordingSource::new(&db);

        let query = batcher
            .prepare_query_statement(&mut source, SELECT, false, None)
            .unwrap();
        let rows = batcher.get_result_set(&query).unwrap();
        assert_eq!(counters.stats().open_statements, 1);
        assert_eq!(counters.stats().open_result_sets, 1);
        assert_eq!(batcher.open_resource_stats().open_statements, 1);

        batcher
            .close_query_statement(&mut source, &query, Some(&rows))
            .unwrap();
        assert_eq!(counters.stats().open_statements, 0);
        assert_eq!(counters.stats().open_result_sets, 0);
    });
}

#[test]
fn test_open_resource_counters_idle_without_debug_logging() {
    let db = MemoryDatabase::new();
    let counters = Arc::new(ResourceCounters::new());
    let services = services(&db, Settings::new()).with_resource_counters(counters.clone());
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::WARN)
        .with_test_writer()
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let mut batcher = Batcher::new(&services);
        let mut source = RecordingSource::new(&db);
        batcher
            .prepare_query_statement(&mut source, SELECT, false, None)
            .unwrap();
        assert_eq!(counters.stats().open_statements, 0);
    });
}
