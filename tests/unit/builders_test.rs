//! Tests for builder modules

use std::sync::Arc;
use std::time::Duration;

use bacnet_iocore::builders::{build_scheduler, build_sieve_client};
use bacnet_iocore::config::{EngineConfig, SchedulerConfig, SieveConfig};
use bacnet_iocore::core::{Address, Iocb, SchedulerError, SendFn, SieveClientController};

fn noop_send() -> SendFn<u8> {
    Arc::new(|_: &Address, _: &u8| -> anyhow::Result<()> { Ok(()) })
}

#[test]
fn test_build_scheduler_uses_config() {
    let cfg = EngineConfig {
        scheduler: SchedulerConfig::default().with_thread_name("bacnet-test"),
        sieve: SieveConfig::default(),
    };
    let scheduler = build_scheduler(&cfg).unwrap();
    assert_eq!(scheduler.config().thread_name, "bacnet-test");
    assert!(!scheduler.is_running());
}

#[test]
fn test_build_scheduler_rejects_invalid_config() {
    let cfg = EngineConfig {
        scheduler: SchedulerConfig::default().with_max_spin(Duration::ZERO),
        sieve: SieveConfig::default(),
    };
    assert!(matches!(
        build_scheduler(&cfg),
        Err(SchedulerError::InvalidConfig(_))
    ));
}

#[test]
fn test_build_sieve_client_applies_settle_delay() {
    let cfg = EngineConfig {
        scheduler: SchedulerConfig::default(),
        sieve: SieveConfig::default().with_settle_delay(Duration::from_millis(30)),
    };
    let scheduler = build_scheduler(&cfg).unwrap();
    let client: SieveClientController<u8, u8> =
        build_sieve_client(&cfg, &scheduler, noop_send()).unwrap();

    let iocb = Iocb::to("dev-1", 1);
    client.request_io(&iocb).unwrap();
    let sieve = client.sieve(&"dev-1".into()).unwrap();
    assert_eq!(sieve.controller().settle_delay(), Duration::from_millis(30));
}
