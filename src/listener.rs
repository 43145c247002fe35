// src/listener.rs - Event fan-out to immediate and batched listeners
//!
//! A [`ListenerManager`] owns one fixed table of listeners per
//! [`CacheEvent`] kind. Immediate listeners get one executor task per
//! notification; batched listeners accumulate a deduplicated pending set
//! that is flushed on a timer or once it grows past a threshold.
//!
//! Delivery is best-effort. A notification refused by a saturated executor is
//! counted, logged and dropped; it never surfaces to the writer that caused it.

use crate::cache::{CacheEvent, Cacheable, EventSet, Id};
use crate::error::Result;
use crate::executor::{Executor, RepeatingTask, TimerSlot};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

/// Receives one cloned value per matching event
pub trait CacheListener<T>: Send + Sync {
    fn on_event(&self, event: CacheEvent, value: T);
}

impl<T, F> CacheListener<T> for F
where
    F: Fn(CacheEvent, T) + Send + Sync,
{
    fn on_event(&self, event: CacheEvent, value: T) {
        self(event, value)
    }
}

/// Handler invoked with every flushed batch
pub type BatchHandler<T> = Arc<dyn Fn(Vec<T>) + Send + Sync>;

/// Flush policy of a batched listener
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub interval: Duration,
    pub threshold: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            threshold: 10_000,
        }
    }
}

// ============================================================================
// BATCH LISTENER
// ============================================================================

/// Deduplicating accumulator in front of a [`BatchHandler`].
///
/// Pending values are keyed by entity id, so the handler sees at most one
/// value per entity per flush: the most recent one.
pub struct BatchListener<T: Cacheable> {
    name: String,
    pending: Mutex<HashMap<Id, T>>,
    handler: BatchHandler<T>,
    settings: BatchSettings,
    executor: Arc<dyn Executor>,
    flush_scheduled: AtomicBool,
    timer: TimerSlot,
    flushed: AtomicU64,
}

impl<T: Cacheable> BatchListener<T> {
    pub fn new(
        name: impl Into<String>,
        handler: BatchHandler<T>,
        settings: BatchSettings,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            pending: Mutex::new(HashMap::new()),
            handler,
            settings,
            executor,
            flush_scheduled: AtomicBool::new(false),
            timer: TimerSlot::new(),
            flushed: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a value; schedules an early flush once the threshold is passed
    pub fn add(self: &Arc<Self>, value: T) {
        let size = {
            let mut pending = self.pending.lock();
            pending.insert(value.id(), value);
            pending.len()
        };

        if size > self.settings.threshold && !self.flush_scheduled.swap(true, Ordering::AcqRel) {
            debug!("{}: {} pending items, flushing early", self.name, size);
            let me = Arc::clone(self);
            let submitted = self.executor.submit(Box::new(move || {
                me.flush_scheduled.store(false, Ordering::Release);
                me.flush();
            }));
            if let Err(e) = submitted {
                self.flush_scheduled.store(false, Ordering::Release);
                warn!("{}: early flush not scheduled: {}", self.name, e);
            }
        }
    }

    /// Hand every pending value to the handler.
    ///
    /// Only the values taken here are handed over; values added while the
    /// handler runs stay pending for the next flush.
    pub fn flush(&self) -> usize {
        let batch: Vec<T> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return 0;
            }
            std::mem::take(&mut *pending).into_values().collect()
        };

        let count = batch.len();
        trace!("{}: flushing {} items", self.name, count);
        (self.handler)(batch);
        self.flushed.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Total number of items handed to the handler
    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    /// Start the periodic flush; calling it again while running is a no-op
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.settings.interval;
        let name = format!("{}-flush", self.name);
        self.timer.start_with(move || {
            RepeatingTask::spawn(name, interval, interval, move || {
                if let Some(listener) = weak.upgrade() {
                    listener.flush();
                }
                std::future::ready(())
            })
        })?;
        Ok(())
    }

    pub async fn stop(&self) {
        self.timer.stop().await;
    }
}

// ============================================================================
// LISTENER MANAGER
// ============================================================================

type Table<L> = [RwLock<Vec<L>>; CacheEvent::COUNT];

fn empty_table<L>() -> Table<L> {
    std::array::from_fn(|_| RwLock::new(Vec::new()))
}

/// Per-store registry of listeners, indexed by event kind
pub struct ListenerManager<T: Cacheable> {
    name: String,
    executor: Arc<dyn Executor>,
    immediate: Table<Arc<dyn CacheListener<T>>>,
    batched: Table<Arc<BatchListener<T>>>,
    batch_listeners: Mutex<Vec<Arc<BatchListener<T>>>>,
    accepting: AtomicBool,
    dispatched: AtomicU64,
    rejected: AtomicU64,
}

impl<T: Cacheable> ListenerManager<T> {
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: name.into(),
            executor,
            immediate: empty_table(),
            batched: empty_table(),
            batch_listeners: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            dispatched: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Register an immediate listener for every event in `events`
    pub fn register<L>(&self, listener: L, events: EventSet)
    where
        L: CacheListener<T> + 'static,
    {
        let listener: Arc<dyn CacheListener<T>> = Arc::new(listener);
        for event in events.iter() {
            self.immediate[event.index()].write().push(Arc::clone(&listener));
        }
        debug!("{}: immediate listener registered for {:?}", self.name, events);
    }

    /// Register a batched listener and start its flush timer
    pub fn register_batched(
        &self,
        name: impl Into<String>,
        handler: BatchHandler<T>,
        events: EventSet,
        settings: BatchSettings,
    ) -> Result<Arc<BatchListener<T>>> {
        let listener = BatchListener::new(name, handler, settings, Arc::clone(&self.executor));
        listener.start()?;
        for event in events.iter() {
            self.batched[event.index()].write().push(Arc::clone(&listener));
        }
        self.batch_listeners.lock().push(Arc::clone(&listener));
        debug!("{}: batched listener {} registered for {:?}", self.name, listener.name(), events);
        Ok(listener)
    }

    /// Dispatch `value` to every listener of every event in `events`.
    ///
    /// Each listener receives its own clone. Listener tables are snapshotted
    /// before dispatch so a listener may write back into the store.
    pub fn notify(&self, events: EventSet, value: &T) {
        if !self.accepting.load(Ordering::Acquire) {
            trace!("{}: shut down, dropping {:?} for {}", self.name, events, value.id());
            return;
        }

        for event in events.iter() {
            let immediate: Vec<_> = self.immediate[event.index()].read().clone();
            for listener in immediate {
                let copy = value.clone();
                let task = Box::new(move || listener.on_event(event, copy));
                match self.executor.submit(task) {
                    Ok(()) => {
                        self.dispatched.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        #[cfg(feature = "metrics")]
                        counter!("vigil_notifications_rejected_total").increment(1);
                        warn!("{}: {} notification for {} dropped: {}", self.name, event, value.id(), e);
                    }
                }
            }

            let batched: Vec<_> = self.batched[event.index()].read().clone();
            for listener in batched {
                listener.add(value.clone());
            }
        }
    }

    /// Notifications submitted to the executor
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Notifications dropped because the executor refused them
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Stop dispatching, flush batched listeners one last time and drain the
    /// executor within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down listener manager {}", self.name);

        let listeners: Vec<_> = self.batch_listeners.lock().clone();
        for listener in &listeners {
            listener.stop().await;
            let flushed = listener.flush();
            if flushed > 0 {
                debug!("{}: final flush of {} handed over {} items", self.name, listener.name(), flushed);
            }
        }

        self.executor.shutdown(timeout).await;

        let dropped: usize = listeners.iter().map(|l| l.pending()).sum();
        if dropped > 0 {
            warn!("{}: {} pending batched items dropped at shutdown", self.name, dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VigilError;
    use crate::executor::{InlineExecutor, Task};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: Id,
        payload: u32,
        stamp: DateTime<Utc>,
    }

    impl Item {
        fn new(id: Id, payload: u32) -> Self {
            Self {
                id,
                payload,
                stamp: Utc::now(),
            }
        }
    }

    impl Cacheable for Item {
        fn id(&self) -> Id {
            self.id
        }
        fn cache_timestamp(&self) -> DateTime<Utc> {
            self.stamp
        }
        fn set_cache_timestamp(&mut self, timestamp: DateTime<Utc>) {
            self.stamp = timestamp;
        }
    }

    struct Refusing;

    #[async_trait]
    impl Executor for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }
        fn submit(&self, _task: Task) -> Result<()> {
            Err(VigilError::Rejected("full".into()))
        }
        async fn shutdown(&self, _timeout: Duration) {}
    }

    fn collecting() -> (BatchHandler<Item>, Arc<Mutex<Vec<Vec<Item>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: BatchHandler<Item> = Arc::new(move |batch| sink.lock().push(batch));
        (handler, seen)
    }

    #[test]
    fn test_immediate_listener_receives_each_event() {
        let manager = ListenerManager::new("items", Arc::new(InlineExecutor::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.register(
            move |event: CacheEvent, item: Item| sink.lock().push((event, item.id)),
            EventSet::of(&[CacheEvent::Inserted, CacheEvent::Updated]),
        );

        manager.notify(EventSet::of(&[CacheEvent::Inserted]), &Item::new(1, 0));
        manager.notify(EventSet::of(&[CacheEvent::Removed]), &Item::new(1, 0));
        manager.notify(EventSet::of(&[CacheEvent::Updated]), &Item::new(2, 0));

        assert_eq!(
            *seen.lock(),
            vec![(CacheEvent::Inserted, 1), (CacheEvent::Updated, 2)]
        );
        assert_eq!(manager.dispatched(), 2);
    }

    #[test]
    fn test_rejected_notifications_are_counted_and_dropped() {
        let manager: ListenerManager<Item> = ListenerManager::new("items", Arc::new(Refusing));
        manager.register(|_: CacheEvent, _: Item| {}, EventSet::of(&[CacheEvent::Updated]));

        manager.notify(EventSet::of(&[CacheEvent::Updated]), &Item::new(1, 0));
        manager.notify(EventSet::of(&[CacheEvent::Updated]), &Item::new(1, 1));

        assert_eq!(manager.rejected(), 2);
        assert_eq!(manager.dispatched(), 0);
    }

    #[test]
    fn test_batch_dedup_keeps_latest_value() {
        let (handler, seen) = collecting();
        let listener = BatchListener::new(
            "dedup",
            handler,
            BatchSettings::default(),
            Arc::new(InlineExecutor::default()),
        );

        for payload in 0..100 {
            listener.add(Item::new(7, payload));
        }
        assert_eq!(listener.pending(), 1);
        assert_eq!(listener.flush(), 1);

        let batches = seen.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].payload, 99);
    }

    #[test]
    fn test_batch_threshold_triggers_flush() {
        let (handler, seen) = collecting();
        let settings = BatchSettings {
            interval: Duration::from_secs(3600),
            threshold: 3,
        };
        let listener = BatchListener::new("threshold", handler, settings, Arc::new(InlineExecutor::default()));

        for id in 0..3 {
            listener.add(Item::new(id, 0));
        }
        assert!(seen.lock().is_empty());

        listener.add(Item::new(3, 0));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].len(), 4);
        assert_eq!(listener.pending(), 0);
    }

    #[test]
    fn test_items_added_during_flush_are_kept() {
        let holder: Arc<Mutex<Option<Arc<BatchListener<Item>>>>> = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (h, s) = (holder.clone(), seen.clone());
        let handler: BatchHandler<Item> = Arc::new(move |batch: Vec<Item>| {
            s.lock().push(batch.len());
            let listener = h.lock().clone();
            if let Some(listener) = listener {
                listener.add(Item::new(99, 0));
            }
        });
        let listener = BatchListener::new(
            "reentrant",
            handler,
            BatchSettings::default(),
            Arc::new(InlineExecutor::default()),
        );
        *holder.lock() = Some(listener.clone());

        listener.add(Item::new(1, 0));
        assert_eq!(listener.flush(), 1);
        assert_eq!(listener.pending(), 1);
        *holder.lock() = None;
        assert_eq!(listener.flush(), 1);
        assert_eq!(*seen.lock(), vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_listener_flushes_periodically() {
        let manager = ListenerManager::new("items", Arc::new(InlineExecutor::default()));
        let (handler, seen) = collecting();
        let listener = manager
            .register_batched(
                "periodic",
                handler,
                EventSet::of(&[CacheEvent::Updated]),
                BatchSettings {
                    interval: Duration::from_millis(100),
                    threshold: 10_000,
                },
            )
            .unwrap();

        manager.notify(EventSet::of(&[CacheEvent::Updated]), &Item::new(1, 0));
        assert_eq!(listener.pending(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(listener.pending(), 0);

        manager.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_stops_dispatch() {
        let manager = ListenerManager::new("items", Arc::new(InlineExecutor::default()));
        let (handler, seen) = collecting();
        manager
            .register_batched(
                "drain",
                handler,
                EventSet::of(&[CacheEvent::Inserted]),
                BatchSettings {
                    interval: Duration::from_secs(3600),
                    threshold: 10_000,
                },
            )
            .unwrap();

        manager.notify(EventSet::of(&[CacheEvent::Inserted]), &Item::new(1, 0));
        manager.shutdown(Duration::from_millis(100)).await;
        assert_eq!(seen.lock().len(), 1);

        manager.notify(EventSet::of(&[CacheEvent::Inserted]), &Item::new(2, 0));
        assert_eq!(seen.lock().len(), 1);
    }
}
