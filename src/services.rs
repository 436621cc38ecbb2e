use crate::config::{ConnectionReleaseMode, Settings};
use crate::core::Result;
use crate::dialect::{Dialect, GenericDialect};
use crate::driver::ConnectionProvider;
use crate::engine::interceptor::{EmptyInterceptor, Interceptor};
use crate::engine::statistics::{ResourceCounters, StatisticsCollector};
use crate::transaction::{JdbcTransactionFactory, TransactionFactory};
use std::fmt;
use std::sync::Arc;

/// Collaborators shared by every session created from one factory.
#[derive(Clone)]
pub struct JdbcServices {
    settings: Arc<Settings>,
    provider: Arc<dyn ConnectionProvider>,
    dialect: Arc<dyn Dialect>,
    transaction_factory: Arc<dyn TransactionFactory>,
    interceptor: Arc<dyn Interceptor>,
    statistics: Option<Arc<dyn StatisticsCollector>>,
    resource_counters: Arc<ResourceCounters>,
}

impl JdbcServices {
    pub fn new(settings: Settings, provider: Arc<dyn ConnectionProvider>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings: Arc::new(settings),
            provider,
            dialect: Arc::new(GenericDialect),
            transaction_factory: Arc::new(JdbcTransactionFactory),
            interceptor: Arc::new(EmptyInterceptor),
            statistics: None,
            resource_counters: Arc::new(ResourceCounters::new()),
        })
    }

    pub fn with_dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_transaction_factory(mut self, factory: Arc<dyn TransactionFactory>) -> Self {
        self.transaction_factory = factory;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// Sink for statistics. Only notified when `statistics_enabled` is set.
    pub fn with_statistics(mut self, statistics: Arc<dyn StatisticsCollector>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn with_resource_counters(mut self, counters: Arc<ResourceCounters>) -> Self {
        self.resource_counters = counters;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn transaction_factory(&self) -> &Arc<dyn TransactionFactory> {
        &self.transaction_factory
    }

    pub fn interceptor(&self) -> &Arc<dyn Interceptor> {
        &self.interceptor
    }

    /// The statistics sink, if statistics are enabled.
    pub fn statistics(&self) -> Option<&Arc<dyn StatisticsCollector>> {
        if self.settings.statistics_enabled {
            self.statistics.as_ref()
        } else {
            None
        }
    }

    pub fn resource_counters(&self) -> &Arc<ResourceCounters> {
        &self.resource_counters
    }

    /// Release mode sessions use unless they supply their own connection.
    pub fn release_mode(&self) -> ConnectionReleaseMode {
        self.settings.release_mode.resolve(
            self.transaction_factory.default_release_mode(),
            self.provider.supports_aggressive_release(),
        )
    }
}

impl fmt::Debug for JdbcServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JdbcServices")
            .field("settings", &self.settings)
            .field("dialect", &self.dialect.name())
            .field("statistics", &self.statistics.is_some())
            .finish()
    }
}
