// src/config.rs - Engine configuration loaded from YAML

use crate::alarms::{Alarm, AlarmCondition, OscillationSettings};
use crate::cache::Id;
use crate::error::{Result, VigilError};
use crate::listener::BatchSettings;
use crate::storage::PersistenceSettings;
use crate::supervision::SupervisionEntity;
use crate::tag::TagMode;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Main configuration
///
/// Every section is optional; missing fields take their defaults.
///
/// # Examples
///
/// ```rust
/// use vigil::Config;
///
/// let config = Config::from_yaml("persistence:\n  batch_size: 100\n").unwrap();
/// assert_eq!(config.persistence.batch_size, 100);
/// assert_eq!(config.persistence.batch_timeout_ms, 8000);
/// assert_eq!(config.oscillation.osc_numbers, 3);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener dispatch and batching
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Write-behind persistence
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Alarm oscillation detection
    #[serde(default)]
    pub oscillation: OscillationConfig,

    /// Alive supervision
    #[serde(default)]
    pub supervision: SupervisionConfig,

    /// Entities created at configuration time
    #[serde(default)]
    pub entities: EntitiesConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            VigilError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and cross references between entities
    pub fn validate(&self) -> Result<()> {
        if self.listener.workers == 0 {
            return Err(VigilError::Config("listener.workers must be at least 1".into()));
        }
        if self.listener.batch_threshold == 0 {
            return Err(VigilError::Config("listener.batch_threshold must be at least 1".into()));
        }
        if self.persistence.batch_size == 0 || self.persistence.workers == 0 {
            return Err(VigilError::Config(
                "persistence.batch_size and persistence.workers must be at least 1".into(),
            ));
        }
        if self.oscillation.osc_numbers == 0 {
            return Err(VigilError::Config("oscillation.osc_numbers must be at least 1".into()));
        }
        if self.supervision.alive_delay_factor == 0 {
            return Err(VigilError::Config("supervision.alive_delay_factor must be at least 1".into()));
        }

        let tag_ids = unique_ids("tag", self.entities.tags.iter().map(|t| t.id))?;
        unique_ids("supervised entity", self.entities.supervised.iter().map(|s| s.id))?;
        unique_ids("alarm", self.entities.alarms.iter().map(|a| a.id))?;
        unique_ids(
            "alive tag",
            self.entities.supervised.iter().filter_map(|s| s.alive_tag_id),
        )?;

        for alarm in &self.entities.alarms {
            if !tag_ids.contains(&alarm.data_tag_id) {
                return Err(VigilError::Config(format!(
                    "alarm {} watches unknown tag {}",
                    alarm.id, alarm.data_tag_id
                )));
            }
            alarm
                .build()
                .validate()
                .map_err(|e| VigilError::Config(e.to_string()))?;
        }
        Ok(())
    }
}

fn unique_ids<I>(kind: &str, ids: I) -> Result<HashSet<Id>>
where
    I: IntoIterator<Item = Id>,
{
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(VigilError::Config(format!("duplicate {} id {}", kind, id)));
        }
    }
    Ok(seen)
}

// ============================================================================
// RUNTIME SECTIONS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Worker threads per listener pool
    #[serde(default = "default_listener_workers")]
    pub workers: usize,

    /// Notifications waiting for a worker before new ones are rejected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,

    /// Pending items that trigger an early batch flush
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            workers: default_listener_workers(),
            queue_capacity: default_queue_capacity(),
            batch_interval_ms: default_batch_interval(),
            batch_threshold: default_batch_threshold(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl ListenerConfig {
    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            interval: Duration::from_millis(self.batch_interval_ms),
            threshold: self.batch_threshold,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persist_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_persist_batch_timeout")]
    pub batch_timeout_ms: u64,

    #[serde(default = "default_persist_workers")]
    pub workers: usize,

    /// Period of the dirty-set persistence cycle
    #[serde(default = "default_persist_interval")]
    pub interval_ms: u64,

    /// Pause between drain attempts at shutdown
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Directory for JSON snapshots; kept in memory when unset
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_persist_batch_size(),
            batch_timeout_ms: default_persist_batch_timeout(),
            workers: default_persist_workers(),
            interval_ms: default_persist_interval(),
            retry_interval_ms: default_retry_interval(),
            storage_path: None,
        }
    }
}

impl PersistenceConfig {
    pub fn settings(&self) -> PersistenceSettings {
        PersistenceSettings {
            batch_size: self.batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            workers: self.workers,
            interval: Duration::from_millis(self.interval_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OscillationConfig {
    /// State changes allowed within `time_range_secs`
    #[serde(default = "default_osc_numbers")]
    pub osc_numbers: usize,

    #[serde(default = "default_time_range")]
    pub time_range_secs: u64,

    /// Quiet time after which an oscillating alarm is reset
    #[serde(default = "default_time_oscillation_alive")]
    pub time_oscillation_alive_secs: u64,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
}

impl Default for OscillationConfig {
    fn default() -> Self {
        Self {
            osc_numbers: default_osc_numbers(),
            time_range_secs: default_time_range(),
            time_oscillation_alive_secs: default_time_oscillation_alive(),
            check_interval_secs: default_check_interval(),
            initial_delay_secs: default_initial_delay(),
        }
    }
}

impl OscillationConfig {
    pub fn settings(&self) -> OscillationSettings {
        OscillationSettings {
            osc_numbers: self.osc_numbers,
            time_range: seconds(self.time_range_secs),
            time_oscillation_alive: seconds(self.time_oscillation_alive_secs),
        }
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Scan period of the alive checker
    #[serde(default = "default_alive_check_interval")]
    pub alive_check_interval_ms: u64,

    /// Alive tags older than this many intervals are rejected
    #[serde(default = "default_alive_delay_factor")]
    pub alive_delay_factor: u32,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            alive_check_interval_ms: default_alive_check_interval(),
            alive_delay_factor: default_alive_delay_factor(),
        }
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitiesConfig {
    #[serde(default)]
    pub tags: Vec<TagConfig>,

    #[serde(default)]
    pub supervised: Vec<SupervisedConfig>,

    #[serde(default)]
    pub alarms: Vec<AlarmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    pub id: Id,
    pub name: String,

    #[serde(default)]
    pub mode: TagMode,

    #[serde(default)]
    pub simulated: bool,

    /// Initial value; the tag stays uninitialised without one
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisedConfig {
    pub id: Id,
    pub kind: SupervisionEntity,
    pub name: String,

    #[serde(default)]
    pub alive_tag_id: Option<Id>,

    #[serde(default = "default_alive_interval")]
    pub alive_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub id: Id,
    pub data_tag_id: Id,
    pub fault_family: String,
    pub fault_member: String,
    pub fault_code: i32,
    pub condition: AlarmCondition,
}

impl AlarmConfig {
    pub fn build(&self) -> Alarm {
        Alarm::new(
            self.id,
            self.data_tag_id,
            self.fault_family.clone(),
            self.fault_member.clone(),
            self.fault_code,
            self.condition.clone(),
        )
    }
}

// ============================================================================
// DEFAULT VALUE FUNCTIONS
// ============================================================================

fn default_listener_workers() -> usize { 4 }
fn default_queue_capacity() -> usize { 10_000 }
fn default_batch_interval() -> u64 { 1000 }
fn default_batch_threshold() -> usize { 10_000 }
fn default_shutdown_timeout() -> u64 { 5000 }
fn default_persist_batch_size() -> usize { 500 }
fn default_persist_batch_timeout() -> u64 { 8000 }
fn default_persist_workers() -> usize { 1 }
fn default_persist_interval() -> u64 { 1000 }
fn default_retry_interval() -> u64 { 1000 }
fn default_osc_numbers() -> usize { 3 }
fn default_time_range() -> u64 { 50 }
fn default_time_oscillation_alive() -> u64 { 180 }
fn default_check_interval() -> u64 { 60 }
fn default_initial_delay() -> u64 { 120 }
fn default_alive_check_interval() -> u64 { 1000 }
fn default_alive_delay_factor() -> u32 { 2 }
fn default_alive_interval() -> u64 { 10_000 }
