use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use vigil::alarms::Alarm;
use vigil::cache::{CacheEvent, EventSet};
use vigil::executor::{Executor, InlineExecutor};
use vigil::supervision::SupervisionStatus;
use vigil::*;

const PLANT: &str = r#"
oscillation:
  osc_numbers: 3
  time_range_secs: 50
  time_oscillation_alive_secs: 180
supervision:
  alive_check_interval_ms: 100
entities:
  tags:
    - id: 1
      name: pump.running
    - id: 2
      name: pump.alive
    - id: 3
      name: tank.level
      value: { type: Float, value: 50.0 }
  supervised:
    - id: 10
      kind: equipment
      name: PUMP
      alive_tag_id: 2
      alive_interval_ms: 1000
  alarms:
    - id: 100
      data_tag_id: 1
      fault_family: PUMP
      fault_member: P01
      fault_code: 1
      condition: { type: value, value: { type: Bool, value: false } }
    - id: 101
      data_tag_id: 3
      fault_family: TANK
      fault_member: T01
      fault_code: 2
      condition: { type: range, min: 10.0, max: 90.0, outside: true }
"#;

fn inline_engine(yaml: &str) -> (Engine, Config) {
    let config = Config::from_yaml(yaml).unwrap();
    let engine = Engine::with_executors(config.clone(), |_| {
        Ok(Arc::new(InlineExecutor::default()) as Arc<dyn Executor>)
    })
    .unwrap();
    engine.seed(&config.entities).unwrap();
    (engine, config)
}

fn record_alarm_changes(engine: &Engine) -> Arc<Mutex<Vec<Alarm>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.alarms().store().register_listener(
        move |_event: CacheEvent, alarm: Alarm| sink.lock().push(alarm),
        EventSet::of(&[CacheEvent::AlarmChange]),
    );
    seen
}

#[tokio::test]
async fn test_tag_updates_raise_and_clear_alarms() {
    let (engine, _) = inline_engine(PLANT);
    engine.start().unwrap();
    let changes = record_alarm_changes(&engine);

    let t0 = Utc::now();
    assert!(engine.update_tag(3, 95.0, t0).unwrap());
    assert!(engine.alarms().store().get(101).unwrap().active);

    // An outdated update neither reaches the tag nor the alarm
    assert!(!engine.update_tag(3, 50.0, t0 - ChronoDuration::seconds(1)).unwrap());
    assert!(engine.alarms().store().get(101).unwrap().active);

    assert!(engine.update_tag(3, 50.0, t0 + ChronoDuration::seconds(1)).unwrap());
    let alarm = engine.alarms().store().get(101).unwrap();
    assert!(!alarm.active);
    assert_eq!(alarm.counter_fault, 1);

    let seen = changes.lock();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].active);
    assert!(!seen[1].active);
    drop(seen);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_oscillating_alarm_is_quiet_until_reset() {
    let (engine, _) = inline_engine(PLANT);
    engine.start().unwrap();
    let changes = record_alarm_changes(&engine);

    let base = Utc::now() - ChronoDuration::minutes(10);
    for (i, running) in [false, true, false, true, false].into_iter().enumerate() {
        let ts = base + ChronoDuration::seconds(i as i64 + 1);
        assert!(engine.update_tag(1, running, ts).unwrap());
    }

    let alarm = engine.alarms().store().get(100).unwrap();
    assert!(alarm.oscillating);
    assert!(alarm.active);
    assert!(alarm.info.contains("[OSC]"));
    // Four flips notified, the fifth was stored quietly
    assert_eq!(changes.lock().len(), 4);
    assert_eq!(engine.stats().oscillating_alarms, 1);

    let reset = engine.oscillation_checker().check(Utc::now());
    assert_eq!(reset, 1);
    let alarm = engine.alarms().store().get(100).unwrap();
    assert!(!alarm.oscillating);
    assert!(alarm.fifo_source_timestamps.is_empty());
    assert!(alarm.active);
    assert_eq!(changes.lock().len(), 5);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_alive_expiry_suspends_and_alive_resumes() {
    let (engine, _) = inline_engine(PLANT);
    engine.start_supervision(10).unwrap();
    assert_eq!(engine.supervision_status(10).unwrap().status, SupervisionStatus::Running);

    // Nothing expires inside the grace period
    assert_eq!(engine.alive_checker().check(Utc::now()), 0);

    let later = Utc::now() + ChronoDuration::seconds(5);
    assert_eq!(engine.alive_checker().check(later), 1);
    let status = engine.supervision_status(10).unwrap();
    assert_eq!(status.status, SupervisionStatus::Down);
    assert_eq!(status.message, "Alive timer expired");
    assert!(!engine.supervision().alive_timers().get(2).unwrap().active);

    assert!(engine.on_alive_tag(2, Utc::now()).unwrap());
    let status = engine.supervision_status(10).unwrap();
    assert_eq!(status.status, SupervisionStatus::Running);
    assert_eq!(status.message, "Alive tag received.");

    // A long delayed alive is ignored
    assert!(!engine.on_alive_tag(2, Utc::now() - ChronoDuration::seconds(30)).unwrap());
}

#[tokio::test]
async fn test_stopping_supervision_stops_alive_timer() {
    let (engine, _) = inline_engine(PLANT);
    engine.start_supervision(10).unwrap();
    engine.stop_supervision(10).unwrap();

    assert_eq!(engine.supervision_status(10).unwrap().status, SupervisionStatus::Stopped);
    let later = Utc::now() + ChronoDuration::seconds(5);
    assert_eq!(engine.alive_checker().check(later), 0);
}

#[tokio::test]
async fn test_shutdown_persists_final_state() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!("{}persistence:\n  storage_path: {}\n", PLANT, dir.path().display());
    let (engine, _) = inline_engine(&yaml);
    engine.start().unwrap();

    engine.update_tag(3, 5.0, Utc::now()).unwrap();
    engine.start_supervision(10).unwrap();
    engine.shutdown().await;

    let stats = engine.stats();
    assert_eq!(stats.dirty, 0);
    assert!(stats.persisted >= 3);

    let data = std::fs::read(dir.path().join("alarms/101.json")).unwrap();
    let alarm: Alarm = serde_json::from_slice(&data).unwrap();
    assert!(alarm.active);

    let data = std::fs::read(dir.path().join("tags/3.json")).unwrap();
    let tag: tag::Tag = serde_json::from_slice(&data).unwrap();
    assert_eq!(tag.value, Some(Value::Float(5.0)));
    assert!(dir.path().join("supervised/10.json").exists());
}

#[tokio::test]
async fn test_quiet_oscillation_updates_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "{}listener:\n  batch_interval_ms: 20\npersistence:\n  interval_ms: 50\n  storage_path: {}\n",
        PLANT,
        dir.path().display()
    );
    let (engine, _) = inline_engine(&yaml);
    engine.start().unwrap();

    let base = Utc::now() - ChronoDuration::minutes(10);
    for (i, running) in [false, true, false, true, false, true].into_iter().enumerate() {
        if i == 4 {
            // let one persistence cycle write the oscillating state
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            assert!(dir.path().join("alarms/100.json").exists());
        }
        let ts = base + ChronoDuration::seconds(i as i64 + 1);
        assert!(engine.update_tag(1, running, ts).unwrap());
    }
    engine.shutdown().await;

    let cached = engine.alarms().store().get(100).unwrap();
    assert!(cached.oscillating);
    let data = std::fs::read(dir.path().join("alarms/100.json")).unwrap();
    let stored: Alarm = serde_json::from_slice(&data).unwrap();
    assert_eq!(stored.counter_fault, cached.counter_fault);
    assert_eq!(stored.active, cached.active);
    assert_eq!(stored.source_timestamp, cached.source_timestamp);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_on_worker_pools() {
    let mut yaml = String::from("entities:\n  tags:\n");
    for id in 1..=20 {
        yaml.push_str(&format!("    - id: {}\n      name: sensor.{}\n", id, id));
    }
    yaml.push_str("  alarms:\n");
    for id in 1..=20 {
        yaml.push_str(&format!(
            "    - id: {}\n      data_tag_id: {}\n      fault_family: SENSOR\n      fault_member: S{}\n      fault_code: 1\n      condition: {{ type: high, threshold: 100.0 }}\n",
            1000 + id,
            id,
            id
        ));
    }

    let config = Config::from_yaml(&yaml).unwrap();
    let engine = Arc::new(Engine::new(config.clone()).unwrap());
    engine.seed(&config.entities).unwrap();
    engine.start().unwrap();

    let base = Utc::now();
    let mut handles = Vec::new();
    for id in 1..=20u64 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            for step in 0..10i64 {
                let value = if step % 2 == 0 { 150.0 } else { 50.0 };
                engine
                    .update_tag(id, value, base + ChronoDuration::milliseconds(step))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    engine.shutdown().await;

    let stats = engine.stats();
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.dirty, 0);
    for id in 1..=20u64 {
        let tag = engine.tags().store().get(id).unwrap();
        assert_eq!(tag.value, Some(Value::Float(50.0)));
        // Last evaluation saw the final value
        assert!(!engine.alarms().store().get(1000 + id).unwrap().active);
    }
}
