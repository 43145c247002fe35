// src/tag.rs - Value-bearing tags and their update path
use crate::cache::{CacheStore, Cacheable, Id};
use crate::error::Result;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Reason a tag value cannot be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    Uninitialised,
    Inaccessible,
    ValueOutOfBounds,
    ValueExpired,
    SubEquipmentDown,
    Unknown,
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            QualityIssue::Uninitialised => "UNINITIALISED",
            QualityIssue::Inaccessible => "INACCESSIBLE",
            QualityIssue::ValueOutOfBounds => "VALUE_OUT_OF_BOUNDS",
            QualityIssue::ValueExpired => "VALUE_EXPIRED",
            QualityIssue::SubEquipmentDown => "SUBEQUIPMENT_DOWN",
            QualityIssue::Unknown => "UNKNOWN_REASON",
        };
        f.write_str(text)
    }
}

/// Validity of a tag value: valid when no issue is recorded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagQuality {
    #[serde(default)]
    issues: BTreeMap<QualityIssue, String>,
}

impl TagQuality {
    pub fn valid() -> Self {
        Self::default()
    }

    pub fn invalid(issue: QualityIssue, description: impl Into<String>) -> Self {
        let mut quality = Self::default();
        quality.add_issue(issue, description);
        quality
    }

    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn add_issue(&mut self, issue: QualityIssue, description: impl Into<String>) {
        self.issues.insert(issue, description.into());
    }

    /// Human readable summary, `"OK"` when valid
    pub fn description(&self) -> String {
        if self.is_valid() {
            return "OK".to_string();
        }
        self.issues
            .iter()
            .map(|(issue, text)| format!("{}: {}", issue, text))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Operating mode of a tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMode {
    #[default]
    Operational,
    Test,
    Maintenance,
}

/// Live measurement point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Id,
    pub name: String,
    pub value: Option<Value>,
    pub quality: TagQuality,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub cache_timestamp: DateTime<Utc>,
    pub mode: TagMode,
    pub simulated: bool,
    /// Alarms watching this tag
    pub alarm_ids: Vec<Id>,
}

impl Tag {
    /// Uninitialised tag without a value
    pub fn new(id: Id, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            value: None,
            quality: TagQuality::invalid(QualityIssue::Uninitialised, "Tag has not been initialised"),
            source_timestamp: None,
            cache_timestamp: Utc::now(),
            mode: TagMode::Operational,
            simulated: false,
            alarm_ids: Vec::new(),
        }
    }

    /// Time of the value: the source timestamp, else the cache timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.source_timestamp.unwrap_or(self.cache_timestamp)
    }

    pub fn is_valid(&self) -> bool {
        self.quality.is_valid()
    }
}

impl Cacheable for Tag {
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

/// Entry point for producers writing tag values
pub struct TagService {
    store: Arc<CacheStore<Tag>>,
}

impl TagService {
    pub fn new(store: Arc<CacheStore<Tag>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<CacheStore<Tag>> {
        &self.store
    }

    /// Apply a new value and quality.
    ///
    /// Returns `false` without touching the tag when `source_timestamp` is
    /// older than the stored one.
    pub fn update(
        &self,
        id: Id,
        value: Value,
        quality: TagQuality,
        source_timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        self.store.execute_on_key(id, |tx| {
            let mut tag = tx.get(id)?;
            if Self::is_outdated(&tag, source_timestamp) {
                return Ok(false);
            }
            tag.value = Some(value);
            tag.quality = quality;
            tag.source_timestamp = Some(source_timestamp);
            tx.put(id, tag)?;
            trace!("Tag {} updated at {}", id, source_timestamp);
            Ok(true)
        })
    }

    /// Apply a valid value
    pub fn update_value(&self, id: Id, value: Value, source_timestamp: DateTime<Utc>) -> Result<bool> {
        self.update(id, value, TagQuality::valid(), source_timestamp)
    }

    fn is_outdated(tag: &Tag, incoming: DateTime<Utc>) -> bool {
        match tag.source_timestamp {
            Some(current) if incoming < current => {
                debug!(
                    "Rejecting update of tag {}: source timestamp {} older than {}",
                    tag.id, incoming, current
                );
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEvent, EventSet};
    use crate::executor::InlineExecutor;
    use crate::listener::ListenerManager;
    use chrono::Duration;
    use parking_lot::Mutex;

    fn service() -> TagService {
        let listeners = Arc::new(ListenerManager::new("tags", Arc::new(InlineExecutor::default())));
        let store = Arc::new(CacheStore::with_default_flow("tags", listeners));
        store.put(1, Tag::new(1, "pressure")).unwrap();
        TagService::new(store)
    }

    #[test]
    fn test_new_tag_is_uninitialised() {
        let tag = Tag::new(1, "pressure");
        assert!(!tag.is_valid());
        assert_eq!(tag.timestamp(), tag.cache_timestamp);
        assert!(tag.quality.description().contains("UNINITIALISED"));
    }

    #[test]
    fn test_update_sets_value_and_quality() {
        let service = service();
        let ts = Utc::now();
        assert!(service.update_value(1, Value::from("DOWN"), ts).unwrap());

        let tag = service.store().get(1).unwrap();
        assert_eq!(tag.value, Some(Value::from("DOWN")));
        assert!(tag.is_valid());
        assert_eq!(tag.timestamp(), ts);
    }

    #[test]
    fn test_older_update_is_rejected() {
        let service = service();
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        service.store().register_listener(
            move |_: CacheEvent, _: Tag| *sink.lock() += 1,
            EventSet::of(&[CacheEvent::Updated]),
        );

        let ts = Utc::now();
        assert!(service.update_value(1, Value::Int(1), ts).unwrap());
        assert!(!service.update_value(1, Value::Int(2), ts - Duration::seconds(1)).unwrap());
        assert!(service.update_value(1, Value::Int(3), ts).unwrap());

        assert_eq!(service.store().get(1).unwrap().value, Some(Value::Int(3)));
        assert_eq!(*seen.lock(), 2);
    }

    #[test]
    fn test_update_with_invalid_quality() {
        let service = service();
        let ts = Utc::now();
        service.update_value(1, Value::Float(2.5), ts).unwrap();
        let quality = TagQuality::invalid(QualityIssue::Inaccessible, "DAQ disconnected");
        assert!(service.update(1, Value::Float(2.5), quality, ts + Duration::seconds(1)).unwrap());

        let tag = service.store().get(1).unwrap();
        assert!(!tag.is_valid());
        assert_eq!(tag.value, Some(Value::Float(2.5)));
        assert_eq!(tag.quality.description(), "INACCESSIBLE: DAQ disconnected");
    }

    #[test]
    fn test_unknown_tag_is_not_found() {
        let service = service();
        let err = service.update_value(42, Value::Bool(true), Utc::now()).unwrap_err();
        assert!(err.is_not_found());
    }
}
