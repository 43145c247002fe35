// src/supervision/alive.rs - Alive timers proving supervised entities are live
use super::{SupervisionEntity, SupervisionManager};
use crate::cache::{CacheStore, Cacheable, Id};
use crate::error::Result;
use crate::executor::{RepeatingTask, TimerSlot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tracks the arrivals of one alive tag.
///
/// The timer id is the id of the alive tag it watches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliveTimer {
    pub id: Id,
    pub supervised_id: Id,
    pub kind: SupervisionEntity,
    pub interval_ms: u64,
    pub active: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub cache_timestamp: DateTime<Utc>,
}

impl AliveTimer {
    pub fn new(id: Id, supervised_id: Id, kind: SupervisionEntity, interval_ms: u64) -> Self {
        Self {
            id,
            supervised_id,
            kind,
            interval_ms,
            active: false,
            last_update: None,
            cache_timestamp: Utc::now(),
        }
    }

    /// Configured interval, saturating at the largest representable duration
    pub fn interval(&self) -> chrono::Duration {
        i64::try_from(self.interval_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// An active timer expires once no alive arrived within the interval
    /// plus a third of it.
    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        let Some(last) = self.last_update else {
            return false;
        };
        let interval = self.interval();
        match interval.checked_add(&(interval / 3)) {
            Some(grace) => now - last > grace,
            None => false,
        }
    }
}

impl Cacheable for AliveTimer {
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

/// Lifecycle operations on the alive timer cache
pub struct AliveTimerService {
    store: Arc<CacheStore<AliveTimer>>,
}

impl AliveTimerService {
    pub fn new(store: Arc<CacheStore<AliveTimer>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<CacheStore<AliveTimer>> {
        &self.store
    }

    pub fn is_registered(&self, id: Id) -> bool {
        self.store.contains(id)
    }

    pub fn get(&self, id: Id) -> Result<AliveTimer> {
        self.store.get(id)
    }

    /// Activate the timer, counting from now
    pub fn start(&self, id: Id) -> Result<()> {
        self.store.compute(id, |timer| {
            timer.active = true;
            timer.last_update = Some(Utc::now());
        })?;
        debug!("Alive timer {} started", id);
        Ok(())
    }

    pub fn stop(&self, id: Id) -> Result<()> {
        self.store.compute(id, |timer| timer.active = false)?;
        debug!("Alive timer {} stopped", id);
        Ok(())
    }

    /// Record an alive arrival, activating the timer if needed
    pub fn update(&self, id: Id, timestamp: DateTime<Utc>) -> Result<()> {
        self.store.compute(id, |timer| {
            timer.active = true;
            timer.last_update = Some(timestamp);
        })
    }

    /// Active timers that expired at `now`
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<AliveTimer> {
        self.store.query(|timer| timer.has_expired(now))
    }
}

/// Periodic scan suspending entities whose alive timer expired
pub struct AliveChecker {
    manager: Weak<SupervisionManager>,
    interval: Duration,
    timer: TimerSlot,
}

impl AliveChecker {
    pub fn new(manager: &Arc<SupervisionManager>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            manager: Arc::downgrade(manager),
            interval,
            timer: TimerSlot::new(),
        })
    }

    /// Stop and suspend every expired timer; returns how many expired
    pub fn check(&self, now: DateTime<Utc>) -> usize {
        let Some(manager) = self.manager.upgrade() else {
            return 0;
        };

        let expired = manager.alive_timers().expired(now);
        for timer in &expired {
            warn!(
                "Alive timer {} of {} {} expired",
                timer.id, timer.kind, timer.supervised_id
            );
            if let Err(e) = manager.alive_timers().stop(timer.id) {
                error!("Failed to stop alive timer {}: {}", timer.id, e);
            }
            if let Err(e) = manager.suspend(timer.supervised_id, now, "Alive timer expired") {
                error!("Failed to suspend {} {}: {}", timer.kind, timer.supervised_id, e);
            }
        }
        expired.len()
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let interval = self.interval;
        let started = self.timer.start_with(move || {
            RepeatingTask::spawn("alive-checker", interval, interval, move || {
                if let Some(checker) = weak.upgrade() {
                    checker.check(Utc::now());
                }
                std::future::ready(())
            })
        })?;
        if started {
            info!("Alive checker started (every {:?})", interval);
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.timer.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }
}
