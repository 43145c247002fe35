// src/alarms/mod.rs - Alarm evaluation with oscillation suppression
//!
//! An [`Alarm`] watches one tag. Every accepted tag update is evaluated
//! against the alarm's [`AlarmCondition`]:
//!
//! - updates not strictly newer than the alarm's source timestamp are stale
//!   and ignored
//! - an invalid tag never changes `active`
//! - an unchanged result is filtered, keeping the original trigger time
//! - a genuine flip advances both timestamps and feeds the oscillation window
//!
//! While an alarm oscillates its further flips are stored without
//! notification. The [`OscillationChecker`] lifts suppression once the alarm
//! has been quiet long enough.

use crate::cache::{CacheStore, Cacheable, Id};
use crate::error::{Result, VigilError};
use crate::tag::{Tag, TagMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub mod condition;
pub mod oscillation;

pub use condition::AlarmCondition;
pub use oscillation::{OscillationChecker, OscillationSettings, OscillationUpdater};

/// Longest accepted fault family or member name
pub const MAX_FAULT_NAME_LEN: usize = 64;

pub const INFO_TEST: &str = "[T]";
pub const INFO_MAINTENANCE: &str = "[M]";
pub const INFO_OSCILLATION: &str = "[OSC]";
pub const INFO_SIMULATED: &str = "[SIM]";
pub const INFO_INVALID: &str = "[?]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: Id,
    pub data_tag_id: Id,
    pub fault_family: String,
    pub fault_member: String,
    pub fault_code: i32,
    pub condition: AlarmCondition,
    pub active: bool,
    pub trigger_timestamp: Option<DateTime<Utc>>,
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Source timestamps of recent state changes, oldest first
    pub fifo_source_timestamps: VecDeque<DateTime<Utc>>,
    pub oscillating: bool,
    /// Number of activations
    pub counter_fault: u64,
    pub info: String,
    pub cache_timestamp: DateTime<Utc>,
}

impl Alarm {
    pub fn new(
        id: Id,
        data_tag_id: Id,
        fault_family: impl Into<String>,
        fault_member: impl Into<String>,
        fault_code: i32,
        condition: AlarmCondition,
    ) -> Self {
        Self {
            id,
            data_tag_id,
            fault_family: fault_family.into(),
            fault_member: fault_member.into(),
            fault_code,
            condition,
            active: false,
            trigger_timestamp: None,
            source_timestamp: None,
            fifo_source_timestamps: VecDeque::new(),
            oscillating: false,
            counter_fault: 0,
            info: String::new(),
            cache_timestamp: Utc::now(),
        }
    }

    /// Check the alarm's configuration
    pub fn validate(&self) -> Result<()> {
        for (field, text) in [("fault family", &self.fault_family), ("fault member", &self.fault_member)] {
            if text.is_empty() || text.len() > MAX_FAULT_NAME_LEN {
                return Err(VigilError::InvalidInput(format!(
                    "alarm {}: {} must be 1 to {} characters long",
                    self.id, field, MAX_FAULT_NAME_LEN
                )));
            }
        }
        if self.fault_code < 0 {
            return Err(VigilError::InvalidInput(format!(
                "alarm {}: fault code must be positive or 0, got {}",
                self.id, self.fault_code
            )));
        }
        self.condition.validate()
    }

    /// `family:member:code` identity triple
    pub fn fault_triple(&self) -> String {
        format!("{}:{}:{}", self.fault_family, self.fault_member, self.fault_code)
    }
}

impl Cacheable for Alarm {
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

/// Status tags describing the watched tag and the alarm
pub fn compose_info(tag: &Tag, oscillating: bool) -> String {
    let mut info = String::new();
    match tag.mode {
        TagMode::Test => info.push_str(INFO_TEST),
        TagMode::Maintenance => info.push_str(INFO_MAINTENANCE),
        TagMode::Operational => {}
    }
    if oscillating {
        info.push_str(INFO_OSCILLATION);
    }
    if tag.simulated {
        info.push_str(INFO_SIMULATED);
    }
    if !tag.is_valid() {
        info.push_str(INFO_INVALID);
    }
    info
}

/// Result of evaluating one tag update against an alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Tag not newer than the last applied update
    Stale,
    /// Nothing to store
    Unchanged,
    /// Same state, different info
    InfoChanged,
    /// `active` flipped
    Changed,
}

/// Pure evaluation of tag updates against alarms
#[derive(Debug, Clone, Copy, Default)]
pub struct AlarmUpdater {
    oscillation: OscillationUpdater,
}

impl AlarmUpdater {
    pub fn new(oscillation: OscillationUpdater) -> Self {
        Self { oscillation }
    }

    pub fn oscillation(&self) -> &OscillationUpdater {
        &self.oscillation
    }

    /// Apply `tag` to `alarm` in place
    pub fn apply(&self, alarm: &mut Alarm, tag: &Tag) -> Evaluation {
        let timestamp = tag.timestamp();
        if let Some(current) = alarm.source_timestamp {
            if timestamp <= current {
                debug!(
                    "Rejecting update of alarm {} from tag {}: {} is not after {}",
                    alarm.id, tag.id, timestamp, current
                );
                return Evaluation::Stale;
            }
        }

        let new_active = Self::evaluate_condition(alarm, tag);
        if new_active == alarm.active {
            let info = compose_info(tag, alarm.oscillating);
            if info == alarm.info {
                trace!("Alarm {} unchanged (active: {})", alarm.id, alarm.active);
                return Evaluation::Unchanged;
            }
            alarm.info = info;
            return Evaluation::InfoChanged;
        }

        self.oscillation.update_oscillation_status(alarm, timestamp);
        Self::flip(alarm, new_active, timestamp);
        alarm.info = compose_info(tag, alarm.oscillating);
        Evaluation::Changed
    }

    /// Clear the oscillation window and evaluate against `tag` regardless of
    /// its timestamp
    pub fn reset(&self, alarm: &mut Alarm, tag: &Tag) -> Evaluation {
        self.oscillation.reset_oscillation_status(alarm);
        let new_active = Self::evaluate_condition(alarm, tag);
        alarm.info = compose_info(tag, false);
        if new_active == alarm.active {
            return Evaluation::InfoChanged;
        }

        let timestamp = tag.timestamp();
        let source = alarm.source_timestamp.map_or(timestamp, |current| current.max(timestamp));
        Self::flip(alarm, new_active, source);
        Evaluation::Changed
    }

    fn evaluate_condition(alarm: &Alarm, tag: &Tag) -> bool {
        match (&tag.value, tag.is_valid()) {
            (Some(value), true) => alarm.condition.evaluate(value),
            _ => alarm.active,
        }
    }

    fn flip(alarm: &mut Alarm, active: bool, timestamp: DateTime<Utc>) {
        alarm.active = active;
        if active {
            alarm.counter_fault += 1;
        }
        alarm.trigger_timestamp = Some(timestamp);
        alarm.source_timestamp = Some(timestamp);
    }
}

/// Alarm cache operations
pub struct AlarmService {
    alarms: Arc<CacheStore<Alarm>>,
    tags: Arc<CacheStore<Tag>>,
    updater: AlarmUpdater,
}

impl AlarmService {
    pub fn new(alarms: Arc<CacheStore<Alarm>>, tags: Arc<CacheStore<Tag>>, oscillation: OscillationUpdater) -> Self {
        Self {
            alarms,
            tags,
            updater: AlarmUpdater::new(oscillation),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore<Alarm>> {
        &self.alarms
    }

    pub fn oscillation(&self) -> &OscillationUpdater {
        self.updater.oscillation()
    }

    /// Evaluate `tag` against alarm `alarm_id` and store the outcome.
    ///
    /// Returns the alarm as it is in the cache afterwards.
    pub fn update(&self, alarm_id: Id, tag: &Tag) -> Result<Alarm> {
        self.alarms.execute_on_key(alarm_id, |tx| {
            let mut alarm = tx.get(alarm_id)?;
            if alarm.data_tag_id != tag.id {
                return Err(VigilError::InvalidInput(format!(
                    "alarm {} watches tag {}, not {}",
                    alarm_id, alarm.data_tag_id, tag.id
                )));
            }

            let was_oscillating = alarm.oscillating;
            match self.updater.apply(&mut alarm, tag) {
                Evaluation::Stale | Evaluation::Unchanged => return Ok(alarm),
                Evaluation::InfoChanged | Evaluation::Changed => {}
            }

            if was_oscillating && alarm.oscillating {
                trace!("Alarm {} oscillating, storing quietly", alarm_id);
                tx.put_quiet(alarm_id, alarm.clone())?;
            } else {
                tx.put(alarm_id, alarm.clone())?;
            }
            Ok(alarm)
        })
    }

    /// Re-evaluate the alarm against the current value of its tag
    pub fn evaluate_alarm(&self, alarm_id: Id) -> Result<Alarm> {
        let alarm = self.alarms.get(alarm_id)?;
        let tag = self.tags.get(alarm.data_tag_id)?;
        self.update(alarm_id, &tag)
    }

    /// Lift oscillation suppression and force a notifying re-evaluation
    pub fn reset_oscillation(&self, alarm_id: Id) -> Result<Alarm> {
        let alarm = self.alarms.get(alarm_id)?;
        let tag = self.tags.get(alarm.data_tag_id)?;
        self.alarms.execute_on_key(alarm_id, |tx| {
            let mut alarm = tx.get(alarm_id)?;
            self.updater.reset(&mut alarm, &tag);
            tx.put(alarm_id, alarm.clone())?;
            Ok(alarm)
        })
    }

    pub fn oscillating_alarms(&self) -> Vec<Alarm> {
        self.alarms.query(|alarm| alarm.oscillating)
    }

    pub fn active_alarms(&self) -> Vec<Alarm> {
        self.alarms.query(|alarm| alarm.active)
    }

    /// Evaluate every alarm attached to an updated tag
    pub fn on_tag_update(&self, tag: &Tag) {
        for alarm_id in &tag.alarm_ids {
            if let Err(e) = self.update(*alarm_id, tag) {
                warn!("Evaluation of alarm {} for tag {} failed: {}", alarm_id, tag.id, e);
            }
        }
    }
}
