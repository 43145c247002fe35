// src/cache/flow.rs - Event policies applied after every cache write
use super::{CacheEvent, EventSet};
use crate::alarms::Alarm;
use crate::supervision::SupervisedEntity;

/// Decides which events a write fires.
///
/// Implementations must be pure: the result depends only on the previous
/// value (`None` for a first insertion) and the new value.
pub trait CacheFlow<T>: Send + Sync {
    fn events(&self, older: Option<&T>, newer: &T) -> EventSet;
}

/// INSERTED on first insertion, UPDATED afterwards
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFlow;

impl DefaultFlow {
    fn base<T>(older: Option<&T>) -> EventSet {
        match older {
            None => EventSet::of(&[CacheEvent::Inserted]),
            Some(_) => EventSet::of(&[CacheEvent::Updated]),
        }
    }
}

impl<T> CacheFlow<T> for DefaultFlow {
    fn events(&self, older: Option<&T>, _newer: &T) -> EventSet {
        DefaultFlow::base(older)
    }
}

/// Default events plus SUPERVISION_UPDATE on every write, and
/// SUPERVISION_CHANGE only on a running/not-running transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisionFlow;

impl CacheFlow<SupervisedEntity> for SupervisionFlow {
    fn events(&self, older: Option<&SupervisedEntity>, newer: &SupervisedEntity) -> EventSet {
        let mut events = DefaultFlow::base(older);
        events.insert(CacheEvent::SupervisionUpdate);

        let changed = match older {
            None => true,
            Some(old) => old.is_running() != newer.is_running(),
        };
        if changed {
            events.insert(CacheEvent::SupervisionChange);
        }
        events
    }
}

/// Default events plus ALARM_CHANGE when the alarm is new or its `active`
/// or `oscillating` flag flipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlarmFlow;

impl CacheFlow<Alarm> for AlarmFlow {
    fn events(&self, older: Option<&Alarm>, newer: &Alarm) -> EventSet {
        let mut events = DefaultFlow::base(older);
        let changed = match older {
            None => true,
            Some(old) => old.active != newer.active || old.oscillating != newer.oscillating,
        };
        if changed {
            events.insert(CacheEvent::AlarmChange);
        }
        events
    }
}
