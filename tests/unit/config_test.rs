//! Tests for configuration validation

use std::collections::HashMap;
use std::time::Duration;

use bacnet_iocore::config::engine::{
    ENV_DEFERRED_SPIN_MS, ENV_MAX_SPIN_MS, ENV_SETTLE_MS, ENV_THREAD_NAME,
};
use bacnet_iocore::config::{EngineConfig, SchedulerConfig, SieveConfig};

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn test_scheduler_config_defaults() {
    let cfg = SchedulerConfig::default();
    assert_eq!(cfg.max_spin(), Duration::from_secs(5));
    assert_eq!(cfg.deferred_spin(), Duration::from_millis(1));
    assert_eq!(cfg.thread_name, "bacnet-scheduler");
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_scheduler_config_invalid_max_spin() {
    let cfg = SchedulerConfig::default().with_max_spin(Duration::ZERO);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_scheduler_config_deferred_exceeds_max() {
    let cfg = SchedulerConfig::default()
        .with_max_spin(Duration::from_millis(10))
        .with_deferred_spin(Duration::from_millis(20));
    assert!(cfg.validate().is_err());
}

#[test]
fn test_scheduler_config_blank_thread_name() {
    let cfg = SchedulerConfig::default().with_thread_name("  ");
    assert!(cfg.validate().is_err());
}

#[test]
fn test_sieve_config_settle_delay() {
    let cfg = SieveConfig::default().with_settle_delay(Duration::from_millis(250));
    assert_eq!(cfg.settle_ms, 250);
    assert_eq!(cfg.settle_delay(), Duration::from_millis(250));
}

#[test]
fn test_engine_config_from_json() {
    let json = r#"{
        "scheduler": { "max_spin_ms": 1000, "thread_name": "bacnet-io" },
        "sieve": { "settle_ms": 20 }
    }"#;
    let cfg = EngineConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.scheduler.max_spin_ms, 1000);
    assert_eq!(cfg.scheduler.deferred_spin_ms, 1);
    assert_eq!(cfg.scheduler.thread_name, "bacnet-io");
    assert_eq!(cfg.sieve.settle_delay(), Duration::from_millis(20));
}

#[test]
fn test_engine_config_empty_json_uses_defaults() {
    let cfg = EngineConfig::from_json_str("{}").unwrap();
    assert_eq!(cfg, EngineConfig::default());
}

#[test]
fn test_engine_config_rejects_invalid_json() {
    assert!(EngineConfig::from_json_str("{ not json").is_err());
    let err = EngineConfig::from_json_str(r#"{"scheduler":{"max_spin_ms":0}}"#).unwrap_err();
    assert!(err.contains("scheduler invalid"));
}

#[test]
fn test_engine_config_from_lookup() {
    let cfg = EngineConfig::from_lookup(lookup(&[
        (ENV_MAX_SPIN_MS, "200"),
        (ENV_DEFERRED_SPIN_MS, "5"),
        (ENV_THREAD_NAME, "sched"),
        (ENV_SETTLE_MS, " 15 "),
    ]))
    .unwrap();
    assert_eq!(cfg.scheduler.max_spin_ms, 200);
    assert_eq!(cfg.scheduler.deferred_spin_ms, 5);
    assert_eq!(cfg.scheduler.thread_name, "sched");
    assert_eq!(cfg.sieve.settle_ms, 15);
}

#[test]
fn test_engine_config_from_lookup_rejects_garbage() {
    let err = EngineConfig::from_lookup(lookup(&[(ENV_SETTLE_MS, "soon")])).unwrap_err();
    assert!(err.starts_with(ENV_SETTLE_MS));
}
