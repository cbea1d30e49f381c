//! Scheduler and sieve configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`SchedulerConfig::max_spin_ms`].
pub const ENV_MAX_SPIN_MS: &str = "BACNET_SCHED_MAX_SPIN_MS";
/// Environment variable overriding [`SchedulerConfig::deferred_spin_ms`].
pub const ENV_DEFERRED_SPIN_MS: &str = "BACNET_SCHED_DEFERRED_SPIN_MS";
/// Environment variable overriding [`SchedulerConfig::thread_name`].
pub const ENV_THREAD_NAME: &str = "BACNET_SCHED_THREAD_NAME";
/// Environment variable overriding [`SieveConfig::settle_ms`].
pub const ENV_SETTLE_MS: &str = "BACNET_SIEVE_SETTLE_MS";

const fn default_max_spin_ms() -> u64 {
    5_000
}

const fn default_deferred_spin_ms() -> u64 {
    1
}

fn default_thread_name() -> String {
    "bacnet-scheduler".into()
}

/// Dispatch loop tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound of one idle sleep, in milliseconds.
    #[serde(default = "default_max_spin_ms")]
    pub max_spin_ms: u64,
    /// Sleep bound while deferred callbacks are waiting, in milliseconds.
    #[serde(default = "default_deferred_spin_ms")]
    pub deferred_spin_ms: u64,
    /// Name given to the dispatch thread.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_spin_ms: default_max_spin_ms(),
            deferred_spin_ms: default_deferred_spin_ms(),
            thread_name: default_thread_name(),
        }
    }
}

impl SchedulerConfig {
    /// Set the idle sleep bound.
    #[must_use]
    pub const fn with_max_spin(mut self, spin: Duration) -> Self {
        self.max_spin_ms = duration_ms(spin);
        self
    }

    /// Set the sleep bound used while deferred callbacks are pending.
    #[must_use]
    pub const fn with_deferred_spin(mut self, spin: Duration) -> Self {
        self.deferred_spin_ms = duration_ms(spin);
        self
    }

    /// Set the dispatch thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Idle sleep bound as a duration.
    #[must_use]
    pub const fn max_spin(&self) -> Duration {
        Duration::from_millis(self.max_spin_ms)
    }

    /// Deferred sleep bound as a duration.
    #[must_use]
    pub const fn deferred_spin(&self) -> Duration {
        Duration::from_millis(self.deferred_spin_ms)
    }

    /// Validate spin intervals and thread name.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_spin_ms == 0 {
            return Err("max_spin_ms must be greater than 0".into());
        }
        if self.deferred_spin_ms == 0 {
            return Err("deferred_spin_ms must be greater than 0".into());
        }
        if self.deferred_spin_ms > self.max_spin_ms {
            return Err("deferred_spin_ms must not exceed max_spin_ms".into());
        }
        if self.thread_name.trim().is_empty() {
            return Err("thread_name must not be empty".into());
        }
        Ok(())
    }
}

/// Settings shared by sieve queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SieveConfig {
    /// Settle delay after each completion, in milliseconds. Zero disables it.
    #[serde(default)]
    pub settle_ms: u64,
}

impl SieveConfig {
    /// Set the settle delay.
    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_ms = duration_ms(delay);
        self
    }

    /// Settle delay as a duration.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Root engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Sieve queue settings.
    #[serde(default)]
    pub sieve: SieveConfig,
}

impl EngineConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler invalid: {e}"))
    }

    /// Parse engine configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from defaults overridden by environment variables.
    ///
    /// A `.env` file in the working directory is loaded first when present.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from defaults overridden through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup(ENV_MAX_SPIN_MS) {
            cfg.scheduler.max_spin_ms = parse_ms(ENV_MAX_SPIN_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_DEFERRED_SPIN_MS) {
            cfg.scheduler.deferred_spin_ms = parse_ms(ENV_DEFERRED_SPIN_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_THREAD_NAME) {
            cfg.scheduler.thread_name = v;
        }
        if let Some(v) = lookup(ENV_SETTLE_MS) {
            cfg.sieve.settle_ms = parse_ms(ENV_SETTLE_MS, &v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_ms(key: &str, value: &str) -> Result<u64, String> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("{key}: {e}"))
}

const fn duration_ms(d: Duration) -> u64 {
    let ms = d.as_millis();
    if ms > u64::MAX as u128 {
        u64::MAX
    } else {
        ms as u64
    }
}
