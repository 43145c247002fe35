// src/storage/manager.rs - Write-behind persistence of dirty cache entries
use super::CachePersistenceDao;
use crate::cache::{CacheEvent, CacheStore, Cacheable, EventSet, Id};
use crate::error::{Result, VigilError};
use crate::executor::{RepeatingTask, TimerSlot};
use crate::listener::{BatchHandler, BatchSettings};
use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Consecutive failing cycles after which failures are logged as errors
const ESCALATE_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct PersistenceSettings {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub workers: usize,
    pub interval: Duration,
    pub retry_interval: Duration,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            batch_timeout: Duration::from_millis(8000),
            workers: 1,
            interval: Duration::from_millis(1000),
            retry_interval: Duration::from_millis(1000),
        }
    }
}

/// Keeps durable storage eventually consistent with one cache.
///
/// Keys are marked dirty as their entities change and persisted in batches.
/// A batch that fails, panics or times out puts its keys back into the dirty
/// set; nothing is discarded, only deferred. [`BatchPersistenceManager::stop`]
/// returns only once the dirty set is empty.
pub struct BatchPersistenceManager<T: Cacheable> {
    store: Arc<CacheStore<T>>,
    dao: Arc<dyn CachePersistenceDao>,
    settings: PersistenceSettings,
    dirty: DashSet<Id>,
    workers: Arc<Semaphore>,
    failed_cycles: AtomicU32,
    persisted: AtomicU64,
    timer: TimerSlot,
}

impl<T: Cacheable> BatchPersistenceManager<T> {
    pub fn new(
        store: Arc<CacheStore<T>>,
        dao: Arc<dyn CachePersistenceDao>,
        settings: PersistenceSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            dao,
            workers: Arc::new(Semaphore::new(settings.workers.max(1))),
            settings,
            dirty: DashSet::new(),
            failed_cycles: AtomicU32::new(0),
            persisted: AtomicU64::new(0),
            timer: TimerSlot::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.store.name()
    }

    /// Mark one key dirty
    pub fn add_element_to_persist(&self, id: Id) {
        self.dirty.insert(id);
    }

    pub fn add_elements_to_persist<I>(&self, ids: I)
    where
        I: IntoIterator<Item = Id>,
    {
        for id in ids {
            self.dirty.insert(id);
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_dirty(&self, id: Id) -> bool {
        self.dirty.contains(&id)
    }

    /// Ids written to storage since creation
    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    /// Persist `keys` now.
    ///
    /// Keys are split into batches of `batch_size`, each run on the worker
    /// pool under `batch_timeout`. Keys of failed batches are marked dirty
    /// again and an error is returned.
    pub async fn persist_list<I>(&self, keys: I) -> Result<usize>
    where
        I: IntoIterator<Item = Id>,
    {
        let keys: Vec<Id> = keys.into_iter().collect::<HashSet<_>>().into_iter().collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let batches: Vec<Vec<Id>> = keys
            .chunks(self.settings.batch_size.max(1))
            .map(<[Id]>::to_vec)
            .collect();
        let batch_count = batches.len();
        debug!("{}: persisting {} keys in {} batches", self.name(), keys.len(), batch_count);

        let handles: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let dao = Arc::clone(&self.dao);
                let workers = Arc::clone(&self.workers);
                let timeout = self.settings.batch_timeout;
                let ids = batch.clone();
                let handle = tokio::spawn(async move {
                    let _permit = workers
                        .acquire_owned()
                        .await
                        .map_err(|e| VigilError::Persistence(e.to_string()))?;
                    match tokio::time::timeout(timeout, dao.persist_batch(&ids)).await {
                        Ok(result) => result,
                        Err(_) => Err(VigilError::Persistence(format!(
                            "batch of {} keys timed out after {:?}",
                            ids.len(),
                            timeout
                        ))),
                    }
                });
                (batch, handle)
            })
            .collect();

        let mut persisted = 0;
        let mut failed = 0;
        for (batch, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(VigilError::Persistence(format!("batch task failed: {}", e))),
            };
            match outcome {
                Ok(()) => persisted += batch.len(),
                Err(e) => {
                    failed += 1;
                    warn!("{}: batch of {} keys not persisted, requeued: {}", self.name(), batch.len(), e);
                    self.add_elements_to_persist(batch);
                }
            }
        }

        self.persisted.fetch_add(persisted as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            counter!("vigil_persistence_batches_failed_total").increment(failed as u64);
            gauge!("vigil_dirty_keys", "cache" => self.name()).set(self.dirty.len() as f64);
        }

        if failed > 0 {
            return Err(VigilError::Persistence(format!(
                "{}: {} of {} batches failed",
                self.name(),
                failed,
                batch_count
            )));
        }
        Ok(persisted)
    }

    /// Persist and clear the current dirty set.
    ///
    /// Keys marked dirty while this runs stay dirty for the next cycle.
    pub async fn persist_dirty(&self) -> Result<usize> {
        let snapshot: Vec<Id> = self.dirty.iter().map(|id| *id).collect();
        if snapshot.is_empty() {
            return Ok(0);
        }
        for id in &snapshot {
            self.dirty.remove(id);
        }

        match self.persist_list(snapshot).await {
            Ok(count) => {
                self.failed_cycles.store(0, Ordering::Relaxed);
                Ok(count)
            }
            Err(e) => {
                let cycles = self.failed_cycles.fetch_add(1, Ordering::Relaxed) + 1;
                if cycles >= ESCALATE_AFTER {
                    error!("{}: persistence failing for {} consecutive cycles: {}", self.name(), cycles, e);
                }
                Err(e)
            }
        }
    }

    /// Persist every key of the cache
    pub async fn persist_all(&self) -> Result<usize> {
        let keys = self.store.keys();
        info!("{}: persisting all {} entries", self.name(), keys.len());
        self.persist_list(keys).await
    }

    /// Mark keys dirty as the cache changes and persist them periodically
    pub fn attach(self: &Arc<Self>, batch: BatchSettings) -> Result<()> {
        let weak = Arc::downgrade(self);
        let handler: BatchHandler<T> = Arc::new(move |values: Vec<T>| {
            if let Some(manager) = weak.upgrade() {
                manager.add_elements_to_persist(values.iter().map(Cacheable::id));
            }
        });
        self.store.register_batched(
            format!("{}-persistence", self.name()),
            handler,
            EventSet::of(&[CacheEvent::Inserted, CacheEvent::Updated, CacheEvent::Removed]),
            batch,
        )?;
        let weak = Arc::downgrade(self);
        self.store.on_quiet_write(move |id| {
            if let Some(manager) = weak.upgrade() {
                manager.add_element_to_persist(id);
            }
        });
        self.start()
    }

    /// Start the periodic persistence task; a no-op while it runs
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let interval = self.settings.interval;
        let name = format!("{}-persistence", self.name());
        self.timer.start_with(move || {
            RepeatingTask::spawn(name, interval, interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        // failures are requeued and logged by persist_list
                        let _ = manager.persist_dirty().await;
                    }
                }
            })
        })?;
        Ok(())
    }

    /// Stop the periodic task and drain the dirty set.
    ///
    /// Retries every `retry_interval` until every dirty key is persisted.
    pub async fn stop(&self) {
        self.timer.stop().await;
        info!("{}: draining {} dirty keys", self.name(), self.dirty_count());

        while !self.dirty.is_empty() {
            if let Err(e) = self.persist_dirty().await {
                warn!("{}: drain incomplete, retrying in {:?}: {}", self.name(), self.settings.retry_interval, e);
                tokio::time::sleep(self.settings.retry_interval).await;
            }
        }
        info!("{}: persistence drained", self.name());
    }
}
