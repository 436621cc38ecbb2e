pub mod batcher;
pub mod column_cache;
pub mod expectation;
pub mod interceptor;
pub mod sql_logger;
pub mod statistics;

pub use batcher::{Batcher, ConnectionSource, TrackedResultSet, TrackedStatement};
pub use expectation::{
    BasicExpectation, Expectation, NoneExpectation, ParamExpectation, ResultCheckStyle,
};
pub use interceptor::{EmptyInterceptor, Interceptor};
pub use statistics::{
    ConcurrentStatistics, ResourceCounters, ResourceStats, StatisticsCollector, StatisticsSnapshot,
};
