//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Foreign key enforcement for incoming transactions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FkChecks {
    /// Leave the connection's FK pragma alone.
    #[default]
    Inherit,
    /// Disable FK checks while applying incoming transactions.
    /// Required on engines without deferred constraints.
    Disabled,
}

/// Reconnection backoff schedule.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct BackoffOpts {
    /// First retry delay.
    #[serde(default = "BackoffOpts::initial_ms")]
    pub initial_ms: u64,
    /// Ceiling for the delay.
    #[serde(default = "BackoffOpts::max_ms")]
    pub max_ms: u64,
    /// Multiplier applied after every attempt.
    #[serde(default = "BackoffOpts::factor")]
    pub factor: f64,
    /// Randomize each delay by up to this fraction.
    #[serde(default = "BackoffOpts::jitter")]
    pub jitter: f64,
}

impl BackoffOpts {
    fn initial_ms() -> u64 {
        1_000
    }

    fn max_ms() -> u64 {
        10_000
    }

    fn factor() -> f64 {
        1.7
    }

    fn jitter() -> f64 {
        0.3
    }
}

impl Default for BackoffOpts {
    fn default() -> Self {
        Self {
            initial_ms: Self::initial_ms(),
            max_ms: Self::max_ms(),
            factor: Self::factor(),
            jitter: Self::jitter(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Opts {
    /// How often to drain trigger output into the oplog.
    #[serde(default = "Opts::polling_interval")]
    pub polling_interval: u64,
    /// Coalesce snapshot requests arriving within this window.
    #[serde(default = "Opts::min_snapshot_window")]
    pub min_snapshot_window: u64,
    /// FK enforcement while applying incoming transactions.
    #[serde(default)]
    pub fk_checks: FkChecks,
    /// Synthesize compensation inserts for FK-violating incoming deletes.
    #[serde(default)]
    pub compensations: bool,
    /// Reconnection schedule.
    #[serde(default)]
    pub connection_backoff: BackoffOpts,
}

impl Opts {
    fn polling_interval() -> u64 {
        2_000
    }

    fn min_snapshot_window() -> u64 {
        40
    }

    pub fn polling_interval_duration(&self) -> Duration {
        Duration::from_millis(self.polling_interval)
    }

    pub fn min_snapshot_window_duration(&self) -> Duration {
        Duration::from_millis(self.min_snapshot_window)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| Error::Internal(format!("config: {}", err)))?;
        let opts: Opts =
            toml::from_str(&raw).map_err(|err| Error::Internal(format!("config: {}", err)))?;
        opts.check()?;
        Ok(opts)
    }

    /// Validate settings that serde can't.
    pub fn check(&self) -> Result<(), Error> {
        if self.polling_interval == 0 {
            return Err(Error::Internal("polling_interval must be non-zero".into()));
        }
        if self.connection_backoff.factor < 1.0 {
            return Err(Error::Internal("backoff factor must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.connection_backoff.jitter) {
            return Err(Error::Internal("backoff jitter must be within [0, 1]".into()));
        }
        Ok(())
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            polling_interval: Self::polling_interval(),
            min_snapshot_window: Self::min_snapshot_window(),
            fk_checks: FkChecks::default(),
            compensations: false,
            connection_backoff: BackoffOpts::default(),
        }
    }
}
