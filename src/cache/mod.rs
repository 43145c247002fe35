//! Event-driven key/value cache
//!
//! Every entity the engine tracks lives in a [`CacheStore`] keyed by a 64-bit
//! [`Id`]. Stores hand out owned copies only, so a value read from the cache
//! can be mutated freely without affecting what other readers see. After each
//! mutation a [`CacheFlow`] decides which [`CacheEvent`]s fire, and the store's
//! listener manager dispatches independent copies of the new value.

use chrono::{DateTime, Utc};
use std::fmt;

pub mod flow;
pub mod store;

pub use flow::{AlarmFlow, CacheFlow, DefaultFlow, SupervisionFlow};
pub use store::{CacheStore, QuietObserver};

/// Unique key of every cached entity
pub type Id = u64;

/// Contract every entity stored in a [`CacheStore`] satisfies.
///
/// `Clone` must produce a structurally independent copy. All implementors in
/// this crate hold owned data only, which makes the derived `Clone` a deep copy.
pub trait Cacheable: Clone + Send + Sync + 'static {
    /// Immutable identity of the entity
    fn id(&self) -> Id;

    /// Time of the last mutation applied through the store
    fn cache_timestamp(&self) -> DateTime<Utc>;

    /// Stamp the time of a mutation; called by the store on every write
    fn set_cache_timestamp(&mut self, timestamp: DateTime<Utc>);

    /// Identity comparison used for deduplication
    fn same_entity(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

/// Closed set of change notifications fired after a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheEvent {
    Inserted,
    Updated,
    Removed,
    SupervisionChange,
    SupervisionUpdate,
    AlarmChange,
}

impl CacheEvent {
    /// Number of event kinds
    pub const COUNT: usize = 6;

    /// Every event kind, in index order
    pub const ALL: [CacheEvent; CacheEvent::COUNT] = [
        CacheEvent::Inserted,
        CacheEvent::Updated,
        CacheEvent::Removed,
        CacheEvent::SupervisionChange,
        CacheEvent::SupervisionUpdate,
        CacheEvent::AlarmChange,
    ];

    /// Dense index used for fixed-size per-event tables
    pub const fn index(self) -> usize {
        match self {
            CacheEvent::Inserted => 0,
            CacheEvent::Updated => 1,
            CacheEvent::Removed => 2,
            CacheEvent::SupervisionChange => 3,
            CacheEvent::SupervisionUpdate => 4,
            CacheEvent::AlarmChange => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheEvent::Inserted => "INSERTED",
            CacheEvent::Updated => "UPDATED",
            CacheEvent::Removed => "REMOVED",
            CacheEvent::SupervisionChange => "SUPERVISION_CHANGE",
            CacheEvent::SupervisionUpdate => "SUPERVISION_UPDATE",
            CacheEvent::AlarmChange => "ALARM_CHANGE",
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Small copyable set of [`CacheEvent`]s
///
/// # Examples
///
/// ```rust
/// use vigil::cache::{CacheEvent, EventSet};
///
/// let events = EventSet::of(&[CacheEvent::Updated, CacheEvent::SupervisionUpdate]);
/// assert!(events.contains(CacheEvent::Updated));
/// assert!(!events.contains(CacheEvent::SupervisionChange));
/// assert_eq!(events.len(), 2);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    pub const fn empty() -> Self {
        EventSet(0)
    }

    pub fn of(events: &[CacheEvent]) -> Self {
        let mut set = EventSet::empty();
        for event in events {
            set.insert(*event);
        }
        set
    }

    pub fn insert(&mut self, event: CacheEvent) {
        self.0 |= 1 << event.index();
    }

    pub fn contains(&self, event: CacheEvent) -> bool {
        self.0 & (1 << event.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = CacheEvent> + '_ {
        CacheEvent::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

impl FromIterator<CacheEvent> for EventSet {
    fn from_iter<I: IntoIterator<Item = CacheEvent>>(iter: I) -> Self {
        let mut set = EventSet::empty();
        for event in iter {
            set.insert(event);
        }
        set
    }
}
