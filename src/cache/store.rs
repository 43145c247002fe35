// src/cache/store.rs - Typed key/value store with event dispatch
use super::{CacheEvent, CacheFlow, Cacheable, DefaultFlow, EventSet, Id};
use crate::error::{Result, VigilError};
use crate::listener::{BatchHandler, BatchListener, BatchSettings, CacheListener, ListenerManager};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::trace;

/// Events computed under the store's locks and fired once they are released
struct Notification<T> {
    events: EventSet,
    value: T,
}

/// Callback told about the id of every quiet write
pub type QuietObserver = Arc<dyn Fn(Id) + Send + Sync>;

/// Concurrent cache of one entity type.
///
/// Reads return clones; the stored value is only reachable through the
/// mutation API. Every notifying write runs the store's [`CacheFlow`] on the
/// previous and new value and hands the resulting events to the
/// [`ListenerManager`] after all locks are released, so listeners may write
/// back into the store.
///
/// Writes on one key are serialized with a per-key lock. Writes on different
/// keys proceed in parallel. [`CacheStore::execute_transaction`] excludes
/// every other writer for its whole duration.
///
/// Quiet writes fire no event, but their ids still reach the observers
/// registered with [`CacheStore::on_quiet_write`] so that persistence sees
/// every change.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use vigil::cache::{CacheStore, DefaultFlow};
/// use vigil::executor::InlineExecutor;
/// use vigil::listener::ListenerManager;
/// use vigil::tag::Tag;
///
/// let listeners = Arc::new(ListenerManager::new("tags", Arc::new(InlineExecutor::default())));
/// let store = CacheStore::new("tags", Box::new(DefaultFlow), listeners);
///
/// store.put(1, Tag::new(1, "pressure")).unwrap();
/// let mut copy = store.get(1).unwrap();
/// copy.name = "changed".to_string();
/// assert_eq!(store.get(1).unwrap().name, "pressure");
/// ```
pub struct CacheStore<T: Cacheable> {
    name: &'static str,
    entries: DashMap<Id, T>,
    flow: Box<dyn CacheFlow<T>>,
    listeners: Arc<ListenerManager<T>>,
    tx_lock: RwLock<()>,
    key_locks: DashMap<Id, Arc<Mutex<()>>>,
    quiet_observers: RwLock<Vec<QuietObserver>>,
}

impl<T: Cacheable> CacheStore<T> {
    pub fn new(
        name: &'static str,
        flow: Box<dyn CacheFlow<T>>,
        listeners: Arc<ListenerManager<T>>,
    ) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            flow,
            listeners,
            tx_lock: RwLock::new(()),
            key_locks: DashMap::new(),
            quiet_observers: RwLock::new(Vec::new()),
        }
    }

    /// Store using [`DefaultFlow`]
    pub fn with_default_flow(name: &'static str, listeners: Arc<ListenerManager<T>>) -> Self {
        Self::new(name, Box::new(DefaultFlow), listeners)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn listeners(&self) -> &Arc<ListenerManager<T>> {
        &self.listeners
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Clone of the value stored under `id`
    pub fn get(&self, id: Id) -> Result<T> {
        self.try_get(id).ok_or_else(|| VigilError::not_found(self.name, id))
    }

    pub fn try_get(&self, id: Id) -> Option<T> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: Id) -> bool {
        self.entries.contains_key(&id)
    }

    /// Clones of every value matching `predicate`
    pub fn query<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        self.entries
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<Id> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store `value` under `id` and fire the events the flow computes.
    ///
    /// Fails with [`VigilError::InvalidInput`] when `value.id() != id`.
    pub fn put(&self, id: Id, value: T) -> Result<()> {
        self.execute_on_key(id, |tx| tx.put(id, value))
    }

    /// Store `value` without firing any event.
    ///
    /// Quiet observers are still told about `id`.
    pub fn put_quiet(&self, id: Id, value: T) -> Result<()> {
        self.execute_on_key(id, |tx| tx.put_quiet(id, value))
    }

    /// Remove and return the value under `id`, firing REMOVED
    pub fn remove(&self, id: Id) -> Result<T> {
        let removed = self.execute_on_key(id, |tx| tx.remove(id))?;
        self.key_locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        Ok(removed)
    }

    /// Atomic read-modify-write of the value under `id`
    pub fn compute<R, F>(&self, id: Id, mutator: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        self.execute_on_key(id, |tx| {
            let mut value = tx.get(id)?;
            let result = mutator(&mut value);
            tx.put(id, value)?;
            Ok(result)
        })
    }

    /// Run `block` while holding the lock of `id`.
    ///
    /// Other keys stay writable. All access inside the block must go through
    /// the [`Transaction`] handle; calling the store's own write methods on
    /// the same id from inside the block deadlocks.
    pub fn execute_on_key<R, F>(&self, id: Id, block: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_, T>) -> Result<R>,
    {
        let key_lock = Arc::clone(&self.key_locks.entry(id).or_default());
        let (result, pending) = {
            let _shared = self.tx_lock.read();
            let _key = key_lock.lock();
            let mut tx = Transaction::new(self);
            let result = block(&mut tx);
            (result, tx.into_parts())
        };
        self.dispatch(pending);
        result
    }

    /// Run `block` with every other writer of this store excluded
    pub fn execute_transaction<R, F>(&self, block: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_, T>) -> Result<R>,
    {
        let (result, pending) = {
            let _exclusive = self.tx_lock.write();
            let mut tx = Transaction::new(self);
            let result = block(&mut tx);
            (result, tx.into_parts())
        };
        self.dispatch(pending);
        result
    }

    // ========================================================================
    // LISTENERS
    // ========================================================================

    pub fn register_listener<L>(&self, listener: L, events: EventSet)
    where
        L: CacheListener<T> + 'static,
    {
        self.listeners.register(listener, events);
    }

    /// Observe ids written with [`CacheStore::put_quiet`]
    pub fn on_quiet_write<F>(&self, observer: F)
    where
        F: Fn(Id) + Send + Sync + 'static,
    {
        self.quiet_observers.write().push(Arc::new(observer));
    }

    pub fn register_batched(
        &self,
        name: impl Into<String>,
        handler: BatchHandler<T>,
        events: EventSet,
        settings: BatchSettings,
    ) -> Result<Arc<BatchListener<T>>> {
        self.listeners.register_batched(name, handler, events, settings)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn write(&self, id: Id, mut value: T, notify: bool) -> Result<Option<Notification<T>>> {
        if value.id() != id {
            return Err(VigilError::InvalidInput(format!(
                "{} cache: value with id {} stored under key {}",
                self.name,
                value.id(),
                id
            )));
        }
        value.set_cache_timestamp(Utc::now());

        let snapshot = notify.then(|| value.clone());
        let events = match self.entries.entry(id) {
            Entry::Occupied(mut entry) => {
                let events = snapshot.as_ref().map(|newer| self.flow.events(Some(entry.get()), newer));
                entry.insert(value);
                events
            }
            Entry::Vacant(entry) => {
                let events = snapshot.as_ref().map(|newer| self.flow.events(None, newer));
                entry.insert(value);
                events
            }
        };

        trace!("{} cache: stored {} ({:?})", self.name, id, events);
        Ok(events
            .zip(snapshot)
            .filter(|(events, _)| !events.is_empty())
            .map(|(events, value)| Notification { events, value }))
    }

    fn take(&self, id: Id) -> Result<(T, Notification<T>)> {
        let (_, removed) = self
            .entries
            .remove(&id)
            .ok_or_else(|| VigilError::not_found(self.name, id))?;
        let notification = Notification {
            events: EventSet::of(&[CacheEvent::Removed]),
            value: removed.clone(),
        };
        Ok((removed, notification))
    }

    fn dispatch(&self, (notifications, quiet): (Vec<Notification<T>>, Vec<Id>)) {
        for notification in notifications {
            self.listeners.notify(notification.events, &notification.value);
        }
        if quiet.is_empty() {
            return;
        }
        let observers = self.quiet_observers.read().clone();
        for id in quiet {
            for observer in &observers {
                observer(id);
            }
        }
    }
}

/// Handle passed to transaction blocks.
///
/// Writes take effect immediately; their notifications are fired once the
/// block has returned and the store's locks are released.
pub struct Transaction<'a, T: Cacheable> {
    store: &'a CacheStore<T>,
    pending: Vec<Notification<T>>,
    quiet: Vec<Id>,
}

impl<'a, T: Cacheable> Transaction<'a, T> {
    fn new(store: &'a CacheStore<T>) -> Self {
        Self {
            store,
            pending: Vec::new(),
            quiet: Vec::new(),
        }
    }

    fn into_parts(self) -> (Vec<Notification<T>>, Vec<Id>) {
        (self.pending, self.quiet)
    }

    pub fn get(&self, id: Id) -> Result<T> {
        self.store.get(id)
    }

    pub fn try_get(&self, id: Id) -> Option<T> {
        self.store.try_get(id)
    }

    pub fn contains(&self, id: Id) -> bool {
        self.store.contains(id)
    }

    pub fn put(&mut self, id: Id, value: T) -> Result<()> {
        if let Some(notification) = self.store.write(id, value, true)? {
            self.pending.push(notification);
        }
        Ok(())
    }

    pub fn put_quiet(&mut self, id: Id, value: T) -> Result<()> {
        self.store.write(id, value, false)?;
        self.quiet.push(id);
        Ok(())
    }

    pub fn remove(&mut self, id: Id) -> Result<T> {
        let (removed, notification) = self.store.take(id)?;
        self.pending.push(notification);
        Ok(removed)
    }
}
