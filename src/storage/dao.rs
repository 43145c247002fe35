// src/storage/dao.rs - Persistence boundary between caches and storage
use super::StorageBackend;
use crate::cache::{CacheStore, Cacheable, Id};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::trace;

/// Writes the current cache state of a batch of ids to durable storage.
///
/// Implementations load the values themselves, so a retried batch always
/// persists the latest state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CachePersistenceDao: Send + Sync {
    async fn persist_batch(&self, ids: &[Id]) -> Result<()>;
}

/// JSON snapshots of one cache in a [`StorageBackend`].
///
/// Ids missing from the cache are deleted from storage.
pub struct StoreDao<T: Cacheable> {
    store: Arc<CacheStore<T>>,
    backend: Arc<dyn StorageBackend>,
}

impl<T> StoreDao<T>
where
    T: Cacheable + Serialize,
{
    pub fn new(store: Arc<CacheStore<T>>, backend: Arc<dyn StorageBackend>) -> Self {
        Self { store, backend }
    }

    fn key(&self, id: Id) -> String {
        format!("{}/{}.json", self.store.name(), id)
    }
}

#[async_trait]
impl<T> CachePersistenceDao for StoreDao<T>
where
    T: Cacheable + Serialize,
{
    async fn persist_batch(&self, ids: &[Id]) -> Result<()> {
        for &id in ids {
            let key = self.key(id);
            match self.store.try_get(id) {
                Some(value) => {
                    let data = serde_json::to_vec(&value)?;
                    self.backend.write(&data, &key).await?;
                }
                None => {
                    if self.backend.exists(&key).await? {
                        self.backend.delete(&key).await?;
                    }
                }
            }
        }
        trace!("Persisted {} {} entries", ids.len(), self.store.name());
        Ok(())
    }
}
