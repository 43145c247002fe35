use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use vigil::alarms::{Alarm, AlarmCondition, OscillationSettings, OscillationUpdater};
use vigil::cache::{CacheEvent, CacheStore, EventSet, Id};
use vigil::executor::InlineExecutor;
use vigil::listener::{BatchHandler, BatchListener, BatchSettings, ListenerManager};
use vigil::tag::Tag;
use vigil::Value;

#[derive(Debug, Clone)]
enum Op {
    Put(Id, i64),
    Remove(Id),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..8u64, any::<i64>()).prop_map(|(id, v)| Op::Put(id, v)),
        1 => (0..8u64).prop_map(Op::Remove),
    ]
}

fn tag_store() -> Arc<CacheStore<Tag>> {
    let listeners = Arc::new(ListenerManager::new("tags", Arc::new(InlineExecutor::default())));
    Arc::new(CacheStore::with_default_flow("tags", listeners))
}

fn tag(id: Id, value: i64) -> Tag {
    let mut tag = Tag::new(id, format!("tag.{}", id));
    tag.value = Some(Value::Int(value));
    tag
}

proptest! {
    #[test]
    fn test_copies_are_isolated(id in 0..1000u64, value in any::<i64>(), other in any::<i64>()) {
        prop_assume!(value != other);
        let store = tag_store();
        store.put(id, tag(id, value)).unwrap();

        let mut copy = store.get(id).unwrap();
        copy.value = Some(Value::Int(other));
        copy.alarm_ids.push(7);

        let stored = store.get(id).unwrap();
        prop_assert_eq!(stored.value, Some(Value::Int(value)));
        prop_assert!(stored.alarm_ids.is_empty());
    }

    #[test]
    fn test_default_flow_events_follow_presence(ops in prop::collection::vec(op(), 1..60)) {
        let store = tag_store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.register_listener(
            move |event: CacheEvent, tag: Tag| sink.lock().push((event, tag.id)),
            EventSet::of(&[CacheEvent::Inserted, CacheEvent::Updated, CacheEvent::Removed]),
        );

        let mut present: HashMap<Id, i64> = HashMap::new();
        let mut expected = Vec::new();
        for op in ops {
            match op {
                Op::Put(id, v) => {
                    store.put(id, tag(id, v)).unwrap();
                    let event = if present.insert(id, v).is_some() {
                        CacheEvent::Updated
                    } else {
                        CacheEvent::Inserted
                    };
                    expected.push((event, id));
                }
                Op::Remove(id) => {
                    let removed = store.remove(id);
                    if present.remove(&id).is_some() {
                        prop_assert!(removed.is_ok());
                        expected.push((CacheEvent::Removed, id));
                    } else {
                        prop_assert!(removed.unwrap_err().is_not_found());
                    }
                }
            }
        }

        prop_assert_eq!(&*seen.lock(), &expected);
        prop_assert_eq!(store.len(), present.len());
        for (id, v) in present {
            prop_assert_eq!(store.get(id).unwrap().value, Some(Value::Int(v)));
        }
    }

    #[test]
    fn test_batch_keeps_latest_value_per_entity(
        writes in prop::collection::vec((0..16u64, any::<i64>()), 1..200)
    ) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let handler: BatchHandler<Tag> = Arc::new(move |batch: Vec<Tag>| sink.lock().push(batch));
        let settings = BatchSettings { threshold: usize::MAX, ..BatchSettings::default() };
        let listener = BatchListener::new("props", handler, settings, Arc::new(InlineExecutor::default()));

        let mut latest = HashMap::new();
        for (id, v) in writes {
            listener.add(tag(id, v));
            latest.insert(id, v);
        }
        prop_assert_eq!(listener.flush(), latest.len());
        prop_assert_eq!(listener.pending(), 0);

        let batches = batches.lock();
        prop_assert_eq!(batches.len(), 1);
        prop_assert_eq!(batches[0].len(), latest.len());
        for tag in &batches[0] {
            prop_assert_eq!(tag.value.clone(), Some(Value::Int(latest[&tag.id])));
        }
    }

    #[test]
    fn test_oscillation_window_bounds(
        gaps in prop::collection::vec(0..30_000i64, 1..40),
        osc_numbers in 1..6usize,
        range_secs in 1..120i64,
    ) {
        let settings = OscillationSettings {
            osc_numbers,
            time_range: ChronoDuration::seconds(range_secs),
            ..OscillationSettings::default()
        };
        let updater = OscillationUpdater::new(settings);
        let mut alarm = Alarm::new(1, 1, "F", "M", 0, AlarmCondition::value(true));

        let mut ts = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        for gap in gaps {
            ts += ChronoDuration::milliseconds(gap);
            let before = alarm.oscillating;
            updater.update_oscillation_status(&mut alarm, ts);

            let window = &alarm.fifo_source_timestamps;
            prop_assert!(window.len() <= osc_numbers + 1);
            prop_assert_eq!(window.back().copied(), Some(ts));
            if window.len() == osc_numbers + 1 {
                let span = *window.back().unwrap() - *window.front().unwrap();
                prop_assert_eq!(alarm.oscillating, span <= settings.time_range);
            } else {
                prop_assert_eq!(alarm.oscillating, before);
            }
        }
    }
}
