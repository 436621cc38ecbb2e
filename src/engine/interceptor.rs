/// Hook given the last chance to rewrite SQL before it reaches the driver.
pub trait Interceptor: Send + Sync {
    /// Returns the SQL to prepare. An empty string aborts the preparation.
    fn on_prepare_statement(&self, sql: &str) -> String {
        sql.to_string()
    }
}

/// Leaves every statement untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyInterceptor;

impl Interceptor for EmptyInterceptor {}
