// src/alarms/oscillation.rs - Sliding-window oscillation detection
use super::{Alarm, AlarmService};
use crate::error::Result;
use crate::executor::{RepeatingTask, TimerSlot};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

#[cfg(feature = "metrics")]
use metrics::counter;

/// Window parameters of oscillation detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OscillationSettings {
    /// State changes tolerated inside `time_range`
    pub osc_numbers: usize,
    /// Span of the detection window
    pub time_range: Duration,
    /// How long after its last state change an alarm keeps oscillating
    pub time_oscillation_alive: Duration,
}

impl Default for OscillationSettings {
    fn default() -> Self {
        Self {
            osc_numbers: 3,
            time_range: Duration::seconds(50),
            time_oscillation_alive: Duration::seconds(180),
        }
    }
}

/// Maintains the timestamp window of an alarm and its `oscillating` flag.
///
/// The window holds at most `osc_numbers + 1` source timestamps. Once it is
/// full, the alarm oscillates exactly when the oldest and newest entries are
/// at most `time_range` apart.
#[derive(Debug, Clone, Copy, Default)]
pub struct OscillationUpdater {
    settings: OscillationSettings,
}

impl OscillationUpdater {
    pub fn new(settings: OscillationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &OscillationSettings {
        &self.settings
    }

    /// Record a state change at `timestamp`
    pub fn update_oscillation_status(&self, alarm: &mut Alarm, timestamp: DateTime<Utc>) {
        let capacity = self.settings.osc_numbers + 1;
        alarm.fifo_source_timestamps.push_back(timestamp);
        while alarm.fifo_source_timestamps.len() > capacity {
            alarm.fifo_source_timestamps.pop_front();
        }

        if alarm.fifo_source_timestamps.len() <= self.settings.osc_numbers {
            return;
        }

        let (Some(oldest), Some(newest)) = (
            alarm.fifo_source_timestamps.front(),
            alarm.fifo_source_timestamps.back(),
        ) else {
            return;
        };

        let oscillating = *newest - *oldest <= self.settings.time_range;
        if oscillating && !alarm.oscillating {
            debug!("Alarm {} starts oscillating", alarm.id);
            #[cfg(feature = "metrics")]
            counter!("vigil_oscillations_detected_total").increment(1);
        }
        alarm.oscillating = oscillating;
    }

    /// True while the last recorded state change is younger than
    /// `time_oscillation_alive`
    pub fn check_oscill_alive(&self, alarm: &Alarm, now: DateTime<Utc>) -> bool {
        alarm
            .fifo_source_timestamps
            .back()
            .is_some_and(|last| now - *last < self.settings.time_oscillation_alive)
    }

    /// Clear the window and the `oscillating` flag
    pub fn reset_oscillation_status(&self, alarm: &mut Alarm) {
        alarm.fifo_source_timestamps.clear();
        alarm.oscillating = false;
    }
}

/// Periodic scan lifting oscillation suppression once alarms calm down
pub struct OscillationChecker {
    service: Weak<AlarmService>,
    initial_delay: std::time::Duration,
    interval: std::time::Duration,
    timer: TimerSlot,
}

impl OscillationChecker {
    pub fn new(
        service: &Arc<AlarmService>,
        initial_delay: std::time::Duration,
        interval: std::time::Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            service: Arc::downgrade(service),
            initial_delay,
            interval,
            timer: TimerSlot::new(),
        })
    }

    /// Reset every oscillating alarm that is no longer alive; returns the
    /// number of alarms reset
    pub fn check(&self, now: DateTime<Utc>) -> usize {
        let Some(service) = self.service.upgrade() else {
            return 0;
        };

        let updater = service.oscillation();
        let mut reset = 0;
        for alarm in service.oscillating_alarms() {
            if updater.check_oscill_alive(&alarm, now) {
                continue;
            }
            match service.reset_oscillation(alarm.id) {
                Ok(alarm) => {
                    reset += 1;
                    info!("Alarm {} no longer oscillating (active: {})", alarm.id, alarm.active);
                }
                Err(e) => error!("Failed to reset oscillation of alarm {}: {}", alarm.id, e),
            }
        }
        reset
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let (delay, interval) = (self.initial_delay, self.interval);
        let started = self.timer.start_with(move || {
            RepeatingTask::spawn("oscillation-checker", delay, interval, move || {
                if let Some(checker) = weak.upgrade() {
                    checker.check(Utc::now());
                }
                std::future::ready(())
            })
        })?;
        if started {
            info!("Oscillation checker scheduled every {:?} after {:?}", interval, delay);
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
