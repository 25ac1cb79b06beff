//! Logging proxy around another map.

use tracing::info;

use crate::{MapError, SharedMap, map::Map};

/// Forwards every call to the wrapped map and logs the outcome.
#[derive(Debug)]
pub struct DebugMap {
    spec: String,
    inner: SharedMap,
}

impl DebugMap {
    #[must_use]
    pub fn new(inner: SharedMap) -> Self {
        Self {
            spec: format!("debug:{}", inner.name()),
            inner,
        }
    }
}

impl Map for DebugMap {
    fn name(&self) -> &str {
        &self.spec
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, MapError> {
        let result = self.inner.lookup(key);
        match &result {
            Ok(Some(value)) => info!(map = self.inner.name(), key, value, "lookup hit"),
            Ok(None) => info!(map = self.inner.name(), key, "lookup miss"),
            Err(e) => info!(map = self.inner.name(), key, error = %e, "lookup error"),
        }
        result
    }

    fn update(&self, key: &str, value: &str) -> Result<(), MapError> {
        info!(map = self.inner.name(), key, value, "update");
        self.inner.update(key, value)
    }

    fn entries(&self) -> Result<Vec<(String, String)>, MapError> {
        self.inner.entries()
    }
}
