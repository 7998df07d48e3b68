//! Backend selection.
//!
//! Configuration names a backend by selector string; the registry turns
//! it into one fresh instance per partition. Embedders register their
//! own factories next to the built-in `list`.

use std::collections::BTreeMap;
use std::fmt;

use futures::future::{self, BoxFuture, FutureExt};
use tracing::debug;

use flatdb_core::{Backend, BackendError, BackendResult, PartitionId};

use crate::error::ConfigError;

type Factory = Box<dyn Fn(PartitionId) -> Box<dyn Backend> + Send + Sync>;

pub struct BackendRegistry {
    factories: BTreeMap<String, Factory>,
}

impl Default for BackendRegistry {
    /// Registry with the built-in backends.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("list", |_| Box::new(ListBackend::new()));
        registry
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register (or replace) the factory for `selector`.
    pub fn register<F>(&mut self, selector: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(PartitionId) -> Box<dyn Backend> + Send + Sync + 'static,
    {
        self.factories.insert(selector.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, selector: &str) -> bool {
        self.factories.contains_key(selector.trim())
    }

    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// One backend instance per partition.
    pub fn create(
        &self,
        selector: &str,
        partitions: &[PartitionId],
    ) -> Result<Vec<(PartitionId, Box<dyn Backend>)>, ConfigError> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Err(ConfigError::MissingBackend);
        }
        let factory = self
            .factories
            .get(selector)
            .ok_or_else(|| ConfigError::UnknownBackend(selector.to_string()))?;
        debug!(backend = selector, partitions = partitions.len(), "creating backends");
        Ok(partitions.iter().map(|&p| (p, factory(p))).collect())
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// In-memory append-only list.
///
/// `write` appends the request body as one element. `read` takes a
/// big-endian `int32` index and returns that element.
#[derive(Debug, Default)]
pub struct ListBackend {
    items: Vec<Vec<u8>>,
    open: bool,
}

impl ListBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn get(&self, body: &[u8]) -> BackendResult<Vec<u8>> {
        let raw: [u8; 4] = body
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| BackendError::InvalidRequest(format!("expected a 4-byte index, got {} bytes", body.len())))?;
        let index = i32::from_be_bytes(raw);
        usize::try_from(index)
            .ok()
            .and_then(|i| self.items.get(i))
            .cloned()
            .ok_or_else(|| {
                BackendError::InvalidRequest(format!("index {} out of range (len {})", index, self.items.len()))
            })
    }
}

impl Backend for ListBackend {
    fn open<'a>(&'a mut self, _db_name: &'a str, _partition: PartitionId) -> BoxFuture<'a, BackendResult<()>> {
        self.open = true;
        future::ready(Ok(())).boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, BackendResult<()>> {
        self.open = false;
        future::ready(Ok(())).boxed()
    }

    fn read(&mut self, body: Vec<u8>) -> BoxFuture<'_, BackendResult<Vec<u8>>> {
        future::ready(self.get(&body)).boxed()
    }

    fn write(&mut self, body: Vec<u8>) -> BoxFuture<'_, BackendResult<()>> {
        self.items.push(body);
        future::ready(Ok(())).boxed()
    }
}
