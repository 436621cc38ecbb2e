use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Sink notified about connection, statement and transaction events.
///
/// Recording never fails: implementations swallow their own problems.
pub trait StatisticsCollector: Send + Sync {
    fn connect(&self);

    fn prepare_statement(&self);

    fn close_statement(&self);

    fn end_transaction(&self, success: bool);
}

/// Lock-free counters usable as the session factory's statistics sink.
#[derive(Debug, Default)]
pub struct ConcurrentStatistics {
    connects: AtomicU64,
    prepared_statements: AtomicU64,
    closed_statements: AtomicU64,
    transactions: AtomicU64,
    successful_transactions: AtomicU64,
}

impl ConcurrentStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            connects: self.connects.load(Ordering::SeqCst),
            prepared_statements: self.prepared_statements.load(Ordering::SeqCst),
            closed_statements: self.closed_statements.load(Ordering::SeqCst),
            transactions: self.transactions.load(Ordering::SeqCst),
            successful_transactions: self.successful_transactions.load(Ordering::SeqCst),
        }
    }

    pub fn clear(&self) {
        self.connects.store(0, Ordering::SeqCst);
        self.prepared_statements.store(0, Ordering::SeqCst);
        self.closed_statements.store(0, Ordering::SeqCst);
        self.transactions.store(0, Ordering::SeqCst);
        self.successful_transactions.store(0, Ordering::SeqCst);
    }
}

impl StatisticsCollector for ConcurrentStatistics {
    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn prepare_statement(&self) {
        self.prepared_statements.fetch_add(1, Ordering::SeqCst);
    }

    fn close_statement(&self) {
        self.closed_statements.fetch_add(1, Ordering::SeqCst);
    }

    fn end_transaction(&self, success: bool) {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        if success {
            self.successful_transactions.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Point-in-time copy of [`ConcurrentStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatisticsSnapshot {
    pub connects: u64,
    pub prepared_statements: u64,
    pub closed_statements: u64,
    pub transactions: u64,
    pub successful_transactions: u64,
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Statistics: {} connects, {}/{} statements prepared/closed, {}/{} transactions successful",
            self.connects,
            self.prepared_statements,
            self.closed_statements,
            self.successful_transactions,
            self.transactions
        )
    }
}

/// Open statement and result set counts shared by every batcher built from
/// the same services. Only maintained while debug logging is enabled.
#[derive(Debug, Default)]
pub struct ResourceCounters {
    open_statements: AtomicUsize,
    open_result_sets: AtomicUsize,
}

impl ResourceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statement_opened(&self) {
        self.open_statements.fetch_add(1, Ordering::SeqCst);
    }

    pub fn statement_closed(&self) {
        let _ = self
            .open_statements
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn result_set_opened(&self) {
        self.open_result_sets.fetch_add(1, Ordering::SeqCst);
    }

    pub fn result_set_closed(&self) {
        let _ = self
            .open_result_sets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            open_statements: self.open_statements.load(Ordering::SeqCst),
            open_result_sets: self.open_result_sets.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceStats {
    pub open_statements: usize,
    pub open_result_sets: usize,
}

impl fmt::Display for ResourceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} open statements, {} open result sets",
            self.open_statements, self.open_result_sets
        )
    }
}
