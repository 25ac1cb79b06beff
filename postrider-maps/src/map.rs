use std::sync::Arc;

use crate::MapError;

/// A shared, thread-safe map handle.
pub type SharedMap = Arc<dyn Map>;

/// Uniform lookup interface over a table backend.
///
/// *Not found* is `Ok(None)`; a soft error is `Err` with
/// [`MapError::is_transient`] true. Backends that cannot be written to or
/// enumerated keep the default `update`/`entries` implementations.
pub trait Map: Send + Sync + std::fmt::Debug {
    /// The `type:name` specification this map was opened with.
    fn name(&self) -> &str;

    fn lookup(&self, key: &str) -> Result<Option<String>, MapError>;

    fn update(&self, _key: &str, _value: &str) -> Result<(), MapError> {
        Err(MapError::Unsupported(self.name().to_string()))
    }

    /// All entries, for backends that can enumerate themselves.
    fn entries(&self) -> Result<Vec<(String, String)>, MapError> {
        Err(MapError::Unsupported(self.name().to_string()))
    }
}

/// Wrapper that folds keys to lowercase before the underlying lookup.
#[derive(Debug)]
pub struct FoldMap {
    inner: SharedMap,
}

impl FoldMap {
    #[must_use]
    pub fn new(inner: SharedMap) -> Self {
        Self { inner }
    }
}

impl Map for FoldMap {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, MapError> {
        self.inner.lookup(&key.to_ascii_lowercase())
    }

    fn update(&self, key: &str, value: &str) -> Result<(), MapError> {
        self.inner.update(&key.to_ascii_lowercase(), value)
    }

    fn entries(&self) -> Result<Vec<(String, String)>, MapError> {
        self.inner.entries()
    }
}
