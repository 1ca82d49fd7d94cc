use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Capture-session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Process to trace migrations for. `None` traces every process.
    #[serde(default)]
    pub target_pid: Option<u32>,

    /// Thread to bind the PMU counter group to. 0 means the calling thread.
    #[serde(default)]
    pub target_tid: i32,

    /// PMU sampling period. Default: 1ms; floored at 100µs by the sampler.
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,

    /// Total capture duration. Default: 10s.
    #[serde(default = "default_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// Upper bound on one ring-buffer poll. Default: 100ms.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            target_pid: None,
            target_tid: 0,
            sample_interval: default_sample_interval(),
            duration: default_duration(),
            poll_timeout: default_poll_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval.is_zero() {
            bail!("sample_interval must be positive");
        }

        if self.duration.is_zero() {
            bail!("duration must be positive");
        }

        if self.poll_timeout.is_zero() {
            bail!("poll_timeout must be positive");
        }

        if self.target_tid < -1 {
            bail!("target_tid must be -1, 0, or a thread id");
        }

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_interval() -> Duration {
    crate::pmu::sampler::DEFAULT_INTERVAL
}

fn default_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(100)
}
