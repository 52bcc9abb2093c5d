//! Application-level configuration loading: clock durations, expiry policies and channel tuning.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use tracing::{info, warn};
use validator::Validate;

use crate::state::item::Feature;

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "LIVE_EXAM_SYNC_CONFIG_PATH";

/// What happens when the local clock reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Lock answers and wait for the authority or explicit navigation.
    Hold,
    /// Submit the pending selection once, then move on where the feature allows it.
    AutoAdvance,
}

/// Settings for live battle sessions.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct BattleConfig {
    /// Question clock used when the authority sends no time.
    #[validate(range(min = 1))]
    pub item_duration_secs: u32,
    /// What happens when the question clock runs out.
    pub expiry_policy: ExpiryPolicy,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            item_duration_secs: 15,
            expiry_policy: ExpiryPolicy::Hold,
        }
    }
}

/// Settings for sectioned mock tests.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct MockTestConfig {
    /// Section clock used when a batch carries no time.
    #[validate(range(min = 1))]
    pub section_duration_secs: u32,
    /// Expected number of items per section.
    #[validate(range(min = 1))]
    pub section_size: u32,
    /// Per-item clock; the section clock is used when absent.
    #[validate(range(min = 1))]
    pub item_duration_secs: Option<u32>,
    /// What happens when the section or item clock runs out.
    pub expiry_policy: ExpiryPolicy,
}

impl Default for MockTestConfig {
    fn default() -> Self {
        Self {
            section_duration_secs: 1800,
            section_size: 40,
            item_duration_secs: None,
            expiry_policy: ExpiryPolicy::AutoAdvance,
        }
    }
}

/// Live channel delivery settings.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ChannelConfig {
    /// How long a late joiner waits for a live event before trusting restored state alone.
    #[serde(rename = "late_join_grace_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub late_join_grace: Duration,
    /// Number of recent raw frames remembered for duplicate suppression.
    #[validate(range(min = 1))]
    pub dedup_window: usize,
    /// Capacity of the per-session delivery buffer.
    #[validate(range(min = 1))]
    pub buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            late_join_grace: Duration::from_millis(3000),
            dedup_window: 32,
            buffer: 64,
        }
    }
}

/// Background polling while a session is open.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct PollConfig {
    /// Participant count polling interval; zero disables polling.
    #[serde(rename = "participant_interval_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub participant_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            participant_interval: Duration::from_secs(10),
        }
    }
}

/// Completion call retry settings.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct FinalizeConfig {
    /// Attempts before giving up on marking the attempt complete.
    #[validate(range(min = 1))]
    pub max_attempts: u32,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Battle settings.
    #[validate(nested)]
    pub battle: BattleConfig,
    /// Mock-test settings.
    #[validate(nested)]
    pub mock_test: MockTestConfig,
    /// Live channel settings.
    #[validate(nested)]
    pub channel: ChannelConfig,
    /// Polling settings.
    #[validate(nested)]
    pub poll: PollConfig,
    /// Finalize retry settings.
    #[validate(nested)]
    pub finalize: FinalizeConfig,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|reason| {
                warn!(
                    path = %path.display(),
                    error = %reason,
                    "failed to load config; falling back to defaults"
                );
                Self::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(contents: &str) -> Result<Self, String> {
        let config = serde_json::from_str::<Self>(contents).map_err(|err| err.to_string())?;
        config.validate().map_err(|err| err.to_string())?;
        info!(
            battle_item_secs = config.battle.item_duration_secs,
            section_secs = config.mock_test.section_duration_secs,
            "loaded configuration"
        );
        Ok(config)
    }

    /// Expiry policy configured for `feature`.
    pub fn expiry_policy(&self, feature: Feature) -> ExpiryPolicy {
        match feature {
            Feature::Battle => self.battle.expiry_policy,
            Feature::MockTest => self.mock_test.expiry_policy,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AppConfig::from_json("{}").expect("defaults");
        assert_eq!(config.battle.item_duration_secs, 15);
        assert_eq!(config.expiry_policy(Feature::Battle), ExpiryPolicy::Hold);
        assert_eq!(config.expiry_policy(Feature::MockTest), ExpiryPolicy::AutoAdvance);
        assert_eq!(config.channel.late_join_grace, Duration::from_millis(3000));
        assert_eq!(config.poll.participant_interval, Duration::from_secs(10));
    }

    #[test]
    fn partial_document_overrides_selected_keys() {
        let config = AppConfig::from_json(
            r#"{"battle": {"expiry_policy": "auto_advance"},
                "mock_test": {"item_duration_secs": 60},
                "channel": {"late_join_grace_ms": 500}}"#,
        )
        .expect("valid config");
        assert_eq!(config.battle.item_duration_secs, 15);
        assert_eq!(config.battle.expiry_policy, ExpiryPolicy::AutoAdvance);
        assert_eq!(config.mock_test.item_duration_secs, Some(60));
        assert_eq!(config.channel.late_join_grace, Duration::from_millis(500));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(AppConfig::from_json(r#"{"mock_test": {"section_size": 0}}"#).is_err());
        assert!(AppConfig::from_json(r#"{"finalize": {"max_attempts": 0}}"#).is_err());
        assert!(AppConfig::from_json("not json").is_err());
    }
}
