// src/supervision/mod.rs - Lifecycle of processes and equipment
//!
//! Every monitored process, equipment and sub-equipment is a
//! [`SupervisedEntity`] in its own cache. [`SupervisionManager`] is the only
//! component that changes their status; each operation runs as one
//! transaction on the entity's key.
//!
//! ```text
//!            start / resume                suspend
//!  STOPPED ─────────────────▶ RUNNING ─────────────────▶ DOWN
//!     ▲                          │  ▲                      │
//!     └──────── stop ────────────┘  └─────── resume ───────┘
//! ```

use crate::cache::{CacheStore, Cacheable, Id};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

pub mod alive;

pub use alive::{AliveChecker, AliveTimer, AliveTimerService};

/// Kind of supervised entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionEntity {
    Process,
    Equipment,
    SubEquipment,
}

impl fmt::Display for SupervisionEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SupervisionEntity::Process => "PROCESS",
            SupervisionEntity::Equipment => "EQUIPMENT",
            SupervisionEntity::SubEquipment => "SUBEQUIPMENT",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisionStatus {
    Down,
    Uncertain,
    Stopped,
    Running,
}

impl fmt::Display for SupervisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SupervisionStatus::Down => "DOWN",
            SupervisionStatus::Uncertain => "UNCERTAIN",
            SupervisionStatus::Stopped => "STOPPED",
            SupervisionStatus::Running => "RUNNING",
        };
        f.write_str(text)
    }
}

/// Monitored process, equipment or sub-equipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedEntity {
    pub id: Id,
    pub kind: SupervisionEntity,
    pub name: String,
    pub status: SupervisionStatus,
    pub status_time: Option<DateTime<Utc>>,
    pub status_description: Option<String>,
    pub alive_tag_id: Option<Id>,
    pub cache_timestamp: DateTime<Utc>,
}

impl SupervisedEntity {
    /// New entity in STOPPED state
    pub fn new(id: Id, kind: SupervisionEntity, name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            status: SupervisionStatus::Stopped,
            status_time: None,
            status_description: None,
            alive_tag_id: None,
            cache_timestamp: Utc::now(),
        }
    }

    pub fn with_alive_tag(mut self, alive_tag_id: Id) -> Self {
        self.alive_tag_id = Some(alive_tag_id);
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == SupervisionStatus::Running
    }

    fn transition(&mut self, status: SupervisionStatus, timestamp: DateTime<Utc>, message: Option<String>) {
        self.status = status;
        self.status_time = Some(timestamp);
        self.status_description = message;
    }
}

impl Cacheable for SupervisedEntity {
    fn id(&self) -> Id {
        self.id
    }

    fn cache_timestamp(&self) -> DateTime<Utc> {
        self.cache_timestamp
    }

    fn set_cache_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.cache_timestamp = timestamp;
    }
}

/// Read-only view of an entity's supervision state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisionSnapshot {
    pub id: Id,
    pub kind: SupervisionEntity,
    pub name: String,
    pub status: SupervisionStatus,
    pub time: DateTime<Utc>,
    pub message: String,
}

/// Applies supervision transitions to the entity cache.
///
/// Every mutating call runs inside [`CacheStore::execute_on_key`], so
/// concurrent callers on one id observe each other's results in full.
pub struct SupervisionManager {
    store: Arc<CacheStore<SupervisedEntity>>,
    alive: Arc<AliveTimerService>,
    alive_delay_factor: u32,
}

impl SupervisionManager {
    pub fn new(
        store: Arc<CacheStore<SupervisedEntity>>,
        alive: Arc<AliveTimerService>,
        alive_delay_factor: u32,
    ) -> Self {
        Self {
            store,
            alive,
            alive_delay_factor: alive_delay_factor.max(1),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore<SupervisedEntity>> {
        &self.store
    }

    pub fn alive_timers(&self) -> &Arc<AliveTimerService> {
        &self.alive
    }

    /// Mark the entity RUNNING and start tracking its alive tag
    pub fn start(&self, id: Id, timestamp: DateTime<Utc>) -> Result<()> {
        self.store.execute_on_key(id, |tx| {
            let mut entity = tx.get(id)?;
            entity.transition(SupervisionStatus::Running, timestamp, None);
            let alive_tag_id = entity.alive_tag_id;
            tx.put(id, entity.clone())?;

            if let Some(alive_id) = alive_tag_id {
                self.start_alive_timer(&entity, alive_id);
            }
            info!("{} {} ({}) started", entity.kind, entity.name, id);
            Ok(())
        })
    }

    /// Stop alive tracking, then mark the entity STOPPED
    pub fn stop(&self, id: Id, timestamp: DateTime<Utc>) -> Result<()> {
        self.store.execute_on_key(id, |tx| {
            let mut entity = tx.get(id)?;
            if let Some(alive_id) = entity.alive_tag_id {
                if let Err(e) = self.alive.stop(alive_id) {
                    error!("Unable to stop alive timer {} of {} {}: {}", alive_id, entity.kind, entity.name, e);
                }
            }
            entity.transition(SupervisionStatus::Stopped, timestamp, None);
            info!("{} {} ({}) stopped", entity.kind, entity.name, id);
            tx.put(id, entity)
        })
    }

    /// Bring the entity back to RUNNING; returns `false` if it already was
    pub fn resume(&self, id: Id, timestamp: DateTime<Utc>, message: &str) -> Result<bool> {
        self.store.execute_on_key(id, |tx| {
            let mut entity = tx.get(id)?;
            if entity.is_running() {
                trace!("{} {} already running", entity.kind, entity.name);
                return Ok(false);
            }
            entity.transition(SupervisionStatus::Running, timestamp, Some(message.to_string()));
            info!("{} {} ({}) resumed: {}", entity.kind, entity.name, id, message);
            tx.put(id, entity)?;
            Ok(true)
        })
    }

    /// Mark a RUNNING or UNCERTAIN entity DOWN; returns `false` otherwise
    pub fn suspend(&self, id: Id, timestamp: DateTime<Utc>, message: &str) -> Result<bool> {
        self.store.execute_on_key(id, |tx| {
            let mut entity = tx.get(id)?;
            if !matches!(entity.status, SupervisionStatus::Running | SupervisionStatus::Uncertain) {
                debug!("{} {} is {}, suspend ignored", entity.kind, entity.name, entity.status);
                return Ok(false);
            }
            entity.transition(SupervisionStatus::Down, timestamp, Some(message.to_string()));
            info!("{} {} ({}) suspended: {}", entity.kind, entity.name, id, message);
            tx.put(id, entity)?;
            Ok(true)
        })
    }

    /// Re-stamp the status time without changing the status
    pub fn refresh(&self, id: Id) -> Result<()> {
        self.store.execute_on_key(id, |tx| {
            let mut entity = tx.get(id)?;
            entity.status_time = Some(Utc::now());
            tx.put(id, entity)
        })
    }

    pub fn supervision_status(&self, id: Id) -> Result<SupervisionSnapshot> {
        let entity = self.store.get(id)?;
        let message = entity
            .status_description
            .clone()
            .unwrap_or_else(|| format!("{} {} is {}", entity.kind, entity.name, entity.status));
        Ok(SupervisionSnapshot {
            id: entity.id,
            kind: entity.kind,
            name: entity.name,
            status: entity.status,
            time: entity.status_time.unwrap_or_else(Utc::now),
            message,
        })
    }

    /// Handle the arrival of an alive tag.
    ///
    /// Arrivals older than `alive_delay_factor` intervals are rejected and
    /// `false` is returned. Otherwise the timer is updated and the supervised
    /// entity resumed and refreshed.
    pub fn on_alive_tag(&self, alive_id: Id, timestamp: DateTime<Utc>) -> Result<bool> {
        let timer = self.alive.get(alive_id)?;
        // no cap once the delay bound overflows
        let max_delay = i32::try_from(self.alive_delay_factor)
            .ok()
            .and_then(|factor| timer.interval().checked_mul(factor));
        if max_delay.is_some_and(|max_delay| Utc::now() - timestamp > max_delay) {
            debug!(
                "Rejecting alive #{} of {} {} as delayed arrival",
                alive_id, timer.kind, timer.supervised_id
            );
            return Ok(false);
        }

        self.alive.update(alive_id, timestamp)?;
        self.resume(timer.supervised_id, timestamp, "Alive tag received.")?;
        self.refresh(timer.supervised_id)?;
        Ok(true)
    }

    fn start_alive_timer(&self, entity: &SupervisedEntity, alive_id: Id) {
        if !self.alive.is_registered(alive_id) {
            error!(
                "Alive tag {} of {} {} is not registered, alive tracking skipped",
                alive_id, entity.kind, entity.name
            );
            return;
        }
        if let Err(e) = self.alive.start(alive_id) {
            error!("Unable to start alive timer {} of {} {}: {}", alive_id, entity.kind, entity.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEvent, EventSet, SupervisionFlow};
    use crate::executor::InlineExecutor;
    use crate::listener::ListenerManager;
    use chrono::Duration;
    use parking_lot::Mutex;

    fn manager() -> SupervisionManager {
        let executor = Arc::new(InlineExecutor::default());
        let entities = Arc::new(CacheStore::new(
            "equipment",
            Box::new(SupervisionFlow),
            Arc::new(ListenerManager::new("equipment", executor.clone())),
        ));
        let timers = Arc::new(CacheStore::with_default_flow(
            "alive",
            Arc::new(ListenerManager::new("alive", executor)),
        ));
        entities
            .put(1, SupervisedEntity::new(1, SupervisionEntity::Equipment, "E1").with_alive_tag(100))
            .unwrap();
        timers
            .put(100, AliveTimer::new(100, 1, SupervisionEntity::Equipment, 1000))
            .unwrap();
        SupervisionManager::new(entities, Arc::new(AliveTimerService::new(timers)), 2)
    }

    #[test]
    fn test_lifecycle_scenario() {
        let manager = manager();
        let t1 = Utc::now();

        manager.start(1, t1).unwrap();
        let started = manager.store().get(1).unwrap();
        assert_eq!(started.status, SupervisionStatus::Running);
        assert!(manager.alive_timers().get(100).unwrap().active);

        assert!(!manager.resume(1, t1 + Duration::seconds(1), "ok").unwrap());
        let resumed = manager.store().get(1).unwrap();
        assert_eq!(resumed.status, SupervisionStatus::Running);
        assert_eq!(resumed.status_time, started.status_time);

        assert!(manager.suspend(1, t1 + Duration::seconds(2), "lost").unwrap());
        assert_eq!(manager.store().get(1).unwrap().status, SupervisionStatus::Down);
        assert!(!manager.suspend(1, t1 + Duration::seconds(3), "lost").unwrap());

        manager.stop(1, t1 + Duration::seconds(4)).unwrap();
        assert_eq!(manager.store().get(1).unwrap().status, SupervisionStatus::Stopped);
        assert!(!manager.alive_timers().get(100).unwrap().active);
    }

    #[test]
    fn test_start_with_unregistered_alive_tag_still_runs() {
        let manager = manager();
        manager
            .store()
            .compute(1, |entity| entity.alive_tag_id = Some(999))
            .unwrap();
        manager.start(1, Utc::now()).unwrap();
        assert!(manager.store().get(1).unwrap().is_running());
    }

    #[test]
    fn test_suspend_uncertain_entity() {
        let manager = manager();
        manager
            .store()
            .compute(1, |entity| entity.status = SupervisionStatus::Uncertain)
            .unwrap();
        assert!(manager.suspend(1, Utc::now(), "no data").unwrap());
    }

    #[test]
    fn test_status_snapshot_defaults() {
        let manager = manager();
        let snapshot = manager.supervision_status(1).unwrap();
        assert_eq!(snapshot.message, "EQUIPMENT E1 is STOPPED");
        assert_eq!(snapshot.status, SupervisionStatus::Stopped);

        manager.suspend(1, Utc::now(), "ignored").unwrap();
        manager.start(1, Utc::now()).unwrap();
        manager.suspend(1, Utc::now(), "connection lost").unwrap();
        assert_eq!(manager.supervision_status(1).unwrap().message, "connection lost");
    }

    #[test]
    fn test_refresh_fires_update_without_change() {
        let manager = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.store().register_listener(
            move |event: CacheEvent, _: SupervisedEntity| sink.lock().push(event),
            EventSet::of(&[CacheEvent::SupervisionChange, CacheEvent::SupervisionUpdate]),
        );

        manager.refresh(1).unwrap();
        assert_eq!(*seen.lock(), vec![CacheEvent::SupervisionUpdate]);
        assert!(manager.store().get(1).unwrap().status_time.is_some());
    }

    #[test]
    fn test_alive_tag_resumes_entity() {
        let manager = manager();
        manager.start(1, Utc::now()).unwrap();
        manager.suspend(1, Utc::now(), "lost").unwrap();

        assert!(manager.on_alive_tag(100, Utc::now()).unwrap());
        let entity = manager.store().get(1).unwrap();
        assert!(entity.is_running());
        assert_eq!(entity.status_description.as_deref(), Some("Alive tag received."));
    }

    #[test]
    fn test_delayed_alive_tag_is_rejected() {
        let manager = manager();
        let late = Utc::now() - Duration::seconds(10);
        assert!(!manager.on_alive_tag(100, late).unwrap());
        assert!(!manager.store().get(1).unwrap().is_running());
    }

    #[test]
    fn test_alive_tag_with_huge_interval_is_accepted() {
        let plain = manager();
        let manager = SupervisionManager::new(
            Arc::clone(plain.store()),
            Arc::clone(plain.alive_timers()),
            u32::MAX,
        );
        manager
            .alive_timers()
            .store()
            .compute(100, |timer| timer.interval_ms = u64::MAX)
            .unwrap();

        assert!(manager.on_alive_tag(100, Utc::now() - Duration::days(30)).unwrap());
        assert!(manager.store().get(1).unwrap().is_running());
    }

    #[test]
    fn test_concurrent_transitions_stay_consistent() {
        let manager = Arc::new(manager());
        let base = Utc::now();
        let at = move |i: i64| base + Duration::milliseconds(i);

        let handles: Vec<_> = (0..6i64)
            .map(|t| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for round in 0..50i64 {
                        let i = t * 1000 + round;
                        match t % 3 {
                            0 => {
                                manager.suspend(1, at(i), &format!("suspend {}", i)).unwrap();
                            }
                            1 => {
                                manager.resume(1, at(i), &format!("resume {}", i)).unwrap();
                            }
                            _ => manager.start(1, at(i)).unwrap(),
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entity = manager.store().get(1).unwrap();
        let time = entity.status_time.unwrap();
        match entity.status_description.as_deref() {
            Some(text) => {
                let (kind, i) = text.split_once(' ').unwrap();
                let i: i64 = i.parse().unwrap();
                assert_eq!(time, at(i));
                match kind {
                    "suspend" => {
                        assert_eq!(i / 1000 % 3, 0);
                        assert_eq!(entity.status, SupervisionStatus::Down);
                    }
                    "resume" => {
                        assert_eq!(i / 1000 % 3, 1);
                        assert_eq!(entity.status, SupervisionStatus::Running);
                    }
                    other => panic!("unexpected description {}", other),
                }
            }
            None => {
                let i = (time - base).num_milliseconds();
                assert_eq!(i / 1000 % 3, 2);
                assert_eq!(entity.status, SupervisionStatus::Running);
            }
        }
    }

    #[test]
    fn test_alive_checker_suspends_expired() {
        let manager = Arc::new(manager());
        manager.start(1, Utc::now()).unwrap();
        let checker = AliveChecker::new(&manager, std::time::Duration::from_secs(1));

        assert_eq!(checker.check(Utc::now()), 0);
        assert_eq!(checker.check(Utc::now() + Duration::seconds(5)), 1);
        assert_eq!(manager.store().get(1).unwrap().status, SupervisionStatus::Down);
        assert!(!manager.alive_timers().get(100).unwrap().active);
    }

    #[test]
    fn test_unknown_entity_is_not_found() {
        let manager = manager();
        assert!(manager.start(7, Utc::now()).unwrap_err().is_not_found());
        assert!(manager.supervision_status(7).unwrap_err().is_not_found());
    }
}
