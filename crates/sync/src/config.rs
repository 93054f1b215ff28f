//! Runtime configuration.
//!
//! Every knob has a default. [`SyncConfig::from_env`] overlays `VERDANT_*`
//! environment variables on top of those defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, ensure};

use verdant_infra::jobs::{QueueConfig, default_db_path};
use verdant_infra::workflow::EngineConfig;

/// Allowed range for concurrently executing jobs.
pub const MAX_CONCURRENT_RANGE: std::ops::RangeInclusive<usize> = 1..=3;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Jobs executing at once, clamped to `1..=3`
    pub max_concurrent: usize,
    /// Periodic drain (and retention sweep) while online
    pub tick_interval: Duration,
    /// An online signal must hold this long before it triggers a drain
    pub debounce: Duration,
    /// Minimum gap between the starts of two drains
    pub min_poll_interval: Duration,
    /// How long `DONE` jobs are kept before eviction
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            tick_interval: Duration::from_secs(30),
            debounce: Duration::from_secs(2),
            min_poll_interval: Duration::from_secs(1),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.clamp(*MAX_CONCURRENT_RANGE.start(), *MAX_CONCURRENT_RANGE.end());
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Everything needed to assemble a running queue.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub queue: QueueConfig,
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
}

impl SyncConfig {
    /// Defaults, with the database under the per-user data directory.
    pub fn with_defaults() -> Result<Self> {
        let db_path = default_db_path().context("failed to resolve default job database path")?;
        Ok(Self::at(db_path))
    }

    /// Defaults, with the database at `db_path`.
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            queue: QueueConfig::default(),
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    /// Load from the process environment.
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `VERDANT_DB_PATH` | job database file |
    /// | `VERDANT_MAX_CONCURRENT` | jobs executing at once (1-3) |
    /// | `VERDANT_MAX_ATTEMPTS` | attempts per job before it fails terminally |
    /// | `VERDANT_TICK_INTERVAL_SECS` | periodic drain interval |
    /// | `VERDANT_DEBOUNCE_MS` | online debounce window |
    /// | `VERDANT_STEP_TIMEOUT_SECS` | per-step timeout |
    /// | `VERDANT_LEASE_SECS` | claim lease; must exceed the step timeout |
    /// | `VERDANT_RETENTION_HOURS` | how long finished jobs are kept |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup("VERDANT_DB_PATH").filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::at(path),
            None => Self::with_defaults()?,
        };

        if let Some(n) = parse_var::<usize>(&lookup, "VERDANT_MAX_CONCURRENT")? {
            config.scheduler = config.scheduler.with_max_concurrent(n);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "VERDANT_MAX_ATTEMPTS")? {
            config.queue.retry_policy.max_attempts = n.max(1);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "VERDANT_TICK_INTERVAL_SECS")? {
            config.scheduler = config.scheduler.with_tick_interval(Duration::from_secs(secs.max(1)));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "VERDANT_DEBOUNCE_MS")? {
            config.scheduler = config.scheduler.with_debounce(Duration::from_millis(ms));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "VERDANT_STEP_TIMEOUT_SECS")? {
            config.engine = config.engine.with_step_timeout(Duration::from_secs(secs.max(1)));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "VERDANT_LEASE_SECS")? {
            config.queue = config.queue.with_lease_duration(Duration::from_secs(secs));
        }
        if let Some(hours) = parse_var::<u64>(&lookup, "VERDANT_RETENTION_HOURS")? {
            config.scheduler = config.scheduler.with_retention(Duration::from_secs(hours * 60 * 60));
        }

        config.validate()?;
        Ok(config)
    }

    /// A step must time out before its claim's lease can expire, otherwise
    /// a healthy but slow step gets reclaimed and runs twice.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.queue.lease_duration > self.engine.step_timeout,
            "lease duration ({:?}, VERDANT_LEASE_SECS) must exceed the step timeout ({:?}, VERDANT_STEP_TIMEOUT_SECS)",
            self.queue.lease_duration,
            self.engine.step_timeout
        );
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = lookup(name).filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .with_context(|| format!("invalid value for {name}: {raw:?}"))
}
