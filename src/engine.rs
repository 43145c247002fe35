// src/engine.rs - Wires caches, listeners, persistence and timers together
use crate::{
    alarms::{Alarm, AlarmService, OscillationChecker, OscillationUpdater},
    cache::{AlarmFlow, CacheEvent, CacheStore, Cacheable, EventSet, Id, SupervisionFlow},
    config::{Config, EntitiesConfig},
    error::*,
    executor::{Executor, WorkerPool},
    listener::ListenerManager,
    storage::{BatchPersistenceManager, LocalStorage, MemoryStorage, PersistenceSettings, StorageBackend, StoreDao},
    supervision::{AliveChecker, AliveTimer, AliveTimerService, SupervisedEntity, SupervisionManager, SupervisionSnapshot},
    tag::{Tag, TagQuality, TagService},
    value::Value,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const TAG_CACHE: &str = "tags";
pub const ALARM_CACHE: &str = "alarms";
pub const SUPERVISION_CACHE: &str = "supervised";
pub const ALIVE_CACHE: &str = "alive_timers";

#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub uptime_secs: u64,
    pub tag_count: usize,
    pub alarm_count: usize,
    pub active_alarms: usize,
    pub oscillating_alarms: usize,
    pub supervised_count: usize,
    pub running_supervised: usize,
    /// Notifications handed to listener executors, all caches
    pub dispatched: u64,
    /// Notifications dropped by saturated executors, all caches
    pub rejected: u64,
    /// Keys waiting for persistence, all caches
    pub dirty: usize,
    pub persisted: u64,
}

struct Persistence {
    tags: Arc<BatchPersistenceManager<Tag>>,
    alarms: Arc<BatchPersistenceManager<Alarm>>,
    supervised: Arc<BatchPersistenceManager<SupervisedEntity>>,
    alive: Arc<BatchPersistenceManager<AliveTimer>>,
}

impl Persistence {
    fn dirty(&self) -> usize {
        self.tags.dirty_count()
            + self.alarms.dirty_count()
            + self.supervised.dirty_count()
            + self.alive.dirty_count()
    }

    fn persisted(&self) -> u64 {
        self.tags.persisted() + self.alarms.persisted() + self.supervised.persisted() + self.alive.persisted()
    }
}

/// The assembled state core.
///
/// Construction builds every store and service; [`Engine::start`] attaches
/// persistence and schedules the periodic checkers; [`Engine::shutdown`]
/// stops them and drains everything still in flight.
pub struct Engine {
    config: Config,
    tags: Arc<TagService>,
    supervision: Arc<SupervisionManager>,
    alarms: Arc<AlarmService>,
    alive_checker: Arc<AliveChecker>,
    oscillation_checker: Arc<OscillationChecker>,
    persistence: Persistence,
    started: AtomicBool,
    running: AtomicBool,
    start_time: Instant,
}

impl Engine {
    /// Build an engine whose listeners run on bounded worker pools.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let workers = config.listener.workers;
        let queue_capacity = config.listener.queue_capacity;
        Self::with_executors(config, move |cache| {
            let pool = WorkerPool::new(format!("{}-listeners", cache), workers, queue_capacity)?;
            Ok(Arc::new(pool) as Arc<dyn Executor>)
        })
    }

    /// Build an engine with one executor per cache supplied by `make_executor`
    pub fn with_executors<F>(config: Config, mut make_executor: F) -> Result<Self>
    where
        F: FnMut(&'static str) -> Result<Arc<dyn Executor>>,
    {
        config.validate()?;

        let backend: Arc<dyn StorageBackend> = match &config.persistence.storage_path {
            Some(path) => {
                info!("Persisting caches to {}", path.display());
                Arc::new(LocalStorage::new(path)?)
            }
            None => {
                warn!("No storage path configured, persistence is kept in memory");
                Arc::new(MemoryStorage::new())
            }
        };

        let tag_store = Arc::new(CacheStore::with_default_flow(
            TAG_CACHE,
            listeners(TAG_CACHE, make_executor(TAG_CACHE)?),
        ));
        let alarm_store = Arc::new(CacheStore::new(
            ALARM_CACHE,
            Box::new(AlarmFlow),
            listeners(ALARM_CACHE, make_executor(ALARM_CACHE)?),
        ));
        let supervised_store = Arc::new(CacheStore::new(
            SUPERVISION_CACHE,
            Box::new(SupervisionFlow),
            listeners(SUPERVISION_CACHE, make_executor(SUPERVISION_CACHE)?),
        ));
        let alive_store = Arc::new(CacheStore::with_default_flow(
            ALIVE_CACHE,
            listeners(ALIVE_CACHE, make_executor(ALIVE_CACHE)?),
        ));

        let tags = Arc::new(TagService::new(tag_store.clone()));
        let alive = Arc::new(AliveTimerService::new(alive_store.clone()));
        let supervision = Arc::new(SupervisionManager::new(
            supervised_store.clone(),
            alive,
            config.supervision.alive_delay_factor,
        ));
        let alarms = Arc::new(AlarmService::new(
            alarm_store.clone(),
            tag_store.clone(),
            OscillationUpdater::new(config.oscillation.settings()),
        ));

        // Every accepted tag update re-evaluates the alarms watching it
        let weak = Arc::downgrade(&alarms);
        tag_store.register_listener(
            move |_event: CacheEvent, tag: Tag| {
                if let Some(alarms) = weak.upgrade() {
                    alarms.on_tag_update(&tag);
                }
            },
            EventSet::of(&[CacheEvent::Updated]),
        );

        let alive_checker = AliveChecker::new(
            &supervision,
            Duration::from_millis(config.supervision.alive_check_interval_ms),
        );
        let oscillation_checker = OscillationChecker::new(
            &alarms,
            Duration::from_secs(config.oscillation.initial_delay_secs),
            Duration::from_secs(config.oscillation.check_interval_secs),
        );

        let settings = config.persistence.settings();
        let persistence = Persistence {
            tags: persistence_for(&tag_store, &backend, settings),
            alarms: persistence_for(&alarm_store, &backend, settings),
            supervised: persistence_for(&supervised_store, &backend, settings),
            alive: persistence_for(&alive_store, &backend, settings),
        };

        Ok(Self {
            config,
            tags,
            supervision,
            alarms,
            alive_checker,
            oscillation_checker,
            persistence,
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            start_time: Instant::now(),
        })
    }

    /// Create the configured entities.
    ///
    /// Tags are linked to the alarms watching them, alive timers are created
    /// for supervised entities with an alive tag, and alarms whose tag already
    /// carries a value are evaluated once.
    pub fn seed(&self, entities: &EntitiesConfig) -> Result<()> {
        for tag_config in &entities.tags {
            let mut tag = Tag::new(tag_config.id, tag_config.name.clone());
            tag.mode = tag_config.mode;
            tag.simulated = tag_config.simulated;
            if let Some(value) = &tag_config.value {
                tag.value = Some(value.clone());
                tag.quality = TagQuality::valid();
                tag.source_timestamp = Some(Utc::now());
            }
            tag.alarm_ids = entities
                .alarms
                .iter()
                .filter(|alarm| alarm.data_tag_id == tag.id)
                .map(|alarm| alarm.id)
                .collect();
            self.tags.store().put(tag.id, tag)?;
        }

        for supervised in &entities.supervised {
            let mut entity = SupervisedEntity::new(supervised.id, supervised.kind, supervised.name.clone());
            if let Some(alive_id) = supervised.alive_tag_id {
                entity = entity.with_alive_tag(alive_id);
                let timer = AliveTimer::new(alive_id, supervised.id, supervised.kind, supervised.alive_interval_ms);
                self.supervision.alive_timers().store().put(alive_id, timer)?;
            }
            self.supervision.store().put(entity.id, entity)?;
        }

        for alarm_config in &entities.alarms {
            let alarm = alarm_config.build();
            if let Err(e) = alarm.validate() {
                error!("Skipping alarm {}: {}", alarm.id, e);
                continue;
            }
            if !self.tags.store().contains(alarm.data_tag_id) {
                error!("Skipping alarm {}: tag {} does not exist", alarm.id, alarm.data_tag_id);
                continue;
            }
            self.alarms.store().put(alarm.id, alarm)?;
        }

        for alarm_id in self.alarms.store().keys() {
            let alarm = self.alarms.store().get(alarm_id)?;
            let has_value = self
                .tags
                .store()
                .try_get(alarm.data_tag_id)
                .is_some_and(|tag| tag.value.is_some());
            if has_value {
                self.alarms.evaluate_alarm(alarm_id)?;
            }
        }

        info!(
            "Seeded {} tags, {} supervised entities, {} alarms",
            self.tags.store().len(),
            self.supervision.store().len(),
            self.alarms.store().len()
        );
        Ok(())
    }

    /// Attach persistence to every cache and schedule the periodic checkers
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(VigilError::Runtime("engine already started".into()));
        }

        let batch = self.config.listener.batch_settings();
        self.persistence.tags.attach(batch)?;
        self.persistence.alarms.attach(batch)?;
        self.persistence.supervised.attach(batch)?;
        self.persistence.alive.attach(batch)?;

        self.alive_checker.start()?;
        self.oscillation_checker.start()?;

        self.running.store(true, Ordering::Release);
        info!("Engine started");
        Ok(())
    }

    /// Stop timers, drain listeners and flush every dirty key to storage
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            debug!("Engine not running, nothing to shut down");
            return;
        }
        info!("Shutting down engine");

        self.alive_checker.stop().await;
        self.oscillation_checker.stop().await;

        // Tag listeners write alarms, so tags drain first
        let timeout = self.config.listener.shutdown_timeout();
        self.tags.store().listeners().shutdown(timeout).await;
        self.alarms.store().listeners().shutdown(timeout).await;
        self.supervision.store().listeners().shutdown(timeout).await;
        self.supervision.alive_timers().store().listeners().shutdown(timeout).await;

        self.persistence.tags.stop().await;
        self.persistence.alarms.stop().await;
        self.persistence.supervised.stop().await;
        self.persistence.alive.stop().await;

        let stats = self.stats();
        info!(
            "Engine stopped after {}s: {} notifications dispatched, {} rejected, {} entries persisted",
            stats.uptime_secs, stats.dispatched, stats.rejected, stats.persisted
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EngineStats {
        let alarm_store = self.alarms.store();
        let supervised = self.supervision.store();
        let alive = self.supervision.alive_timers().store();
        EngineStats {
            running: self.is_running(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            tag_count: self.tags.store().len(),
            alarm_count: alarm_store.len(),
            active_alarms: self.alarms.active_alarms().len(),
            oscillating_alarms: self.alarms.oscillating_alarms().len(),
            supervised_count: supervised.len(),
            running_supervised: supervised.query(SupervisedEntity::is_running).len(),
            dispatched: self.tags.store().listeners().dispatched()
                + alarm_store.listeners().dispatched()
                + supervised.listeners().dispatched()
                + alive.listeners().dispatched(),
            rejected: self.tags.store().listeners().rejected()
                + alarm_store.listeners().rejected()
                + supervised.listeners().rejected()
                + alive.listeners().rejected(),
            dirty: self.persistence.dirty(),
            persisted: self.persistence.persisted(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tags(&self) -> &Arc<TagService> {
        &self.tags
    }

    pub fn alarms(&self) -> &Arc<AlarmService> {
        &self.alarms
    }

    pub fn supervision(&self) -> &Arc<SupervisionManager> {
        &self.supervision
    }

    pub fn alive_checker(&self) -> &Arc<AliveChecker> {
        &self.alive_checker
    }

    pub fn oscillation_checker(&self) -> &Arc<OscillationChecker> {
        &self.oscillation_checker
    }

    // ========================================================================
    // ADMINISTRATION
    // ========================================================================

    pub fn start_supervision(&self, id: Id) -> Result<()> {
        self.supervision.start(id, Utc::now())
    }

    pub fn stop_supervision(&self, id: Id) -> Result<()> {
        self.supervision.stop(id, Utc::now())
    }

    pub fn resume(&self, id: Id, message: &str) -> Result<bool> {
        self.supervision.resume(id, Utc::now(), message)
    }

    pub fn suspend(&self, id: Id, message: &str) -> Result<bool> {
        self.supervision.suspend(id, Utc::now(), message)
    }

    pub fn refresh(&self, id: Id) -> Result<()> {
        self.supervision.refresh(id)
    }

    pub fn supervision_status(&self, id: Id) -> Result<SupervisionSnapshot> {
        self.supervision.supervision_status(id)
    }

    pub fn on_alive_tag(&self, alive_id: Id, timestamp: DateTime<Utc>) -> Result<bool> {
        self.supervision.on_alive_tag(alive_id, timestamp)
    }

    pub fn evaluate_alarm(&self, id: Id) -> Result<Alarm> {
        self.alarms.evaluate_alarm(id)
    }

    /// Write a valid value to a tag; `false` when the update is outdated
    pub fn update_tag(&self, id: Id, value: impl Into<Value>, timestamp: DateTime<Utc>) -> Result<bool> {
        self.tags.update_value(id, value.into(), timestamp)
    }
}

fn listeners<T: Cacheable>(cache: &'static str, executor: Arc<dyn Executor>) -> Arc<ListenerManager<T>> {
    Arc::new(ListenerManager::new(cache, executor))
}

fn persistence_for<T>(
    store: &Arc<CacheStore<T>>,
    backend: &Arc<dyn StorageBackend>,
    settings: PersistenceSettings,
) -> Arc<BatchPersistenceManager<T>>
where
    T: Cacheable + Serialize,
{
    let dao = Arc::new(StoreDao::new(Arc::clone(store), Arc::clone(backend)));
    BatchPersistenceManager::new(Arc::clone(store), dao, settings)
}
