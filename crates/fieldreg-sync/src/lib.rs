//! Offline outbox: durable queue, per-type dispatch, connectivity-driven draining.

use std::path::PathBuf;
use std::time::Duration;

pub mod dispatch;
pub mod queue;
pub mod service;

pub use dispatch::{route, Route, SyncBackend};
pub use queue::{DrainOutcome, DrainSummary, QueuePolicy, SyncQueue};
pub use service::{connectivity_channel, spawn_http_probe, SyncService};

pub const CRATE_NAME: &str = "fieldreg-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_interval_secs: u64,
    pub probe_interval_secs: u64,
    pub submit_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub max_attempts: Option<u32>,
    pub dead_letter_rejections: bool,
    pub default_profile_path: Option<PathBuf>,
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./fieldreg-data"),
            scheduler_enabled: true,
            sync_interval_secs: 30,
            probe_interval_secs: 10,
            submit_timeout_secs: 15,
            upload_timeout_secs: 90,
            max_attempts: None,
            dead_letter_rejections: false,
            default_profile_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("FIELDREG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            scheduler_enabled: env_flag("FIELDREG_SCHEDULER_ENABLED")
                .unwrap_or(defaults.scheduler_enabled),
            sync_interval_secs: env_number("FIELDREG_SYNC_INTERVAL_SECS")
                .unwrap_or(defaults.sync_interval_secs),
            probe_interval_secs: env_number("FIELDREG_PROBE_INTERVAL_SECS")
                .unwrap_or(defaults.probe_interval_secs),
            submit_timeout_secs: env_number("FIELDREG_SUBMIT_TIMEOUT_SECS")
                .unwrap_or(defaults.submit_timeout_secs),
            upload_timeout_secs: env_number("FIELDREG_UPLOAD_TIMEOUT_SECS")
                .unwrap_or(defaults.upload_timeout_secs),
            max_attempts: env_number::<u32>("FIELDREG_MAX_ATTEMPTS").filter(|n| *n > 0),
            dead_letter_rejections: env_flag("FIELDREG_DEAD_LETTER_REJECTIONS")
                .unwrap_or(defaults.dead_letter_rejections),
            default_profile_path: std::env::var("FIELDREG_DEFAULT_PROFILE")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            submit_timeout: Duration::from_secs(self.submit_timeout_secs),
            upload_timeout: Duration::from_secs(self.upload_timeout_secs),
            max_attempts: self.max_attempts,
            dead_letter_rejections: self.dead_letter_rejections,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_policy_reflects_config() {
        let config = SyncConfig {
            submit_timeout_secs: 5,
            upload_timeout_secs: 60,
            max_attempts: Some(3),
            ..SyncConfig::default()
        };
        let policy = config.queue_policy();
        assert_eq!(policy.submit_timeout, Duration::from_secs(5));
        assert_eq!(policy.upload_timeout, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, Some(3));
        assert!(!policy.dead_letter_rejections);
    }

    #[test]
    fn intervals_never_collapse_to_zero() {
        let config = SyncConfig {
            sync_interval_secs: 0,
            probe_interval_secs: 0,
            ..SyncConfig::default()
        };
        assert_eq!(config.sync_interval(), Duration::from_secs(1));
        assert_eq!(config.probe_interval(), Duration::from_secs(1));
    }
}
