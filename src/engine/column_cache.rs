use crate::core::Value;
use crate::driver::{ResultSet, SqlError, SqlResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Remembers column positions so each distinct name is resolved against
/// the driver only once.
#[derive(Debug, Default)]
pub struct ColumnNameCache {
    positions: Mutex<HashMap<String, usize>>,
}

impl ColumnNameCache {
    pub fn new(column_count: usize) -> Self {
        Self {
            positions: Mutex::new(HashMap::with_capacity(column_count)),
        }
    }

    pub fn index_for_column_name(&self, name: &str, result_set: &dyn ResultSet) -> SqlResult<usize> {
        let mut positions = self
            .positions
            .lock()
            .map_err(|_| SqlError::with_state("column cache poisoned", "HY000"))?;
        if let Some(index) = positions.get(name) {
            return Ok(*index);
        }
        let index = result_set.find_column(name)?;
        positions.insert(name.to_string(), index);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.positions.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result set whose by-name lookups go through a [`ColumnNameCache`].
pub struct CachingResultSet {
    inner: Arc<dyn ResultSet>,
    cache: Arc<ColumnNameCache>,
}

impl CachingResultSet {
    pub fn new(inner: Arc<dyn ResultSet>, cache: Arc<ColumnNameCache>) -> Self {
        Self { inner, cache }
    }

    pub fn target(&self) -> &Arc<dyn ResultSet> {
        &self.inner
    }
}

impl ResultSet for CachingResultSet {
    fn next(&self) -> SqlResult<bool> {
        self.inner.next()
    }

    fn get(&self, column: usize) -> SqlResult<Value> {
        self.inner.get(column)
    }

    fn find_column(&self, name: &str) -> SqlResult<usize> {
        self.cache.index_for_column_name(name, self.inner.as_ref())
    }

    fn column_count(&self) -> SqlResult<usize> {
        self.inner.column_count()
    }

    fn close(&self) -> SqlResult<()> {
        self.inner.close()
    }
}
