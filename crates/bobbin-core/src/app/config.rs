//! EngineConfig - エンジン全体の設定
//!
//! # 設定の流れ
//! 1. `EngineConfig::default()`（CPU 数から算出）
//! 2. JSON ファイル（`from_json_file`、書かれていない項目はデフォルト）
//! 3. CLI フラグで上書き（bobbin-cli 側）
//!
//! type ごとの値（同時実行数・lease 長など）は `ActorSettings` に落として
//! MachineRegistry の Binding に持たせる。

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::queue::ClaimOrder;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `max_tick_time_secs` の上限（30 日）
pub const MAX_TICK_TIME_SECS: u64 = 30 * 24 * 60 * 60;

/// clamp(0.6 × CPUs, 2, 8)
pub fn default_max_concurrent_actors() -> usize {
    (logical_cpus() * 6 / 10).clamp(2, 8)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lease length: how long a claim is honored before the item counts as stalled.
    pub max_tick_time_secs: u64,
    pub claim_from_top_n: usize,
    pub claim_order: ClaimOrder,
    pub atomic_claims: bool,
    /// Per-type cap on running actors.
    pub max_concurrent_actors: usize,
    /// Cap across all types.
    pub global_max_concurrent_actors: usize,
    pub actor_poll_interval_ms: u64,
    pub actor_max_idle_polls: u32,
    pub orchestrator_tick_interval_ms: u64,
    pub orphan_scan_idle_ticks: u32,
    pub exit_on_idle: bool,
    pub exit_idle_ticks: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = logical_cpus();
        let max_concurrent_actors = default_max_concurrent_actors();
        Self {
            max_tick_time_secs: 60,
            claim_from_top_n: cpus * 10,
            claim_order: ClaimOrder::SoonestRetry,
            atomic_claims: true,
            max_concurrent_actors,
            global_max_concurrent_actors: max_concurrent_actors.max(cpus),
            actor_poll_interval_ms: 1_000,
            actor_max_idle_polls: 3,
            orchestrator_tick_interval_ms: 1_000,
            orphan_scan_idle_ticks: 60,
            exit_on_idle: false,
            exit_idle_ticks: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: EngineConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tick_time_secs == 0 {
            return Err(ConfigError::Invalid("max_tick_time_secs must be > 0".into()));
        }
        if self.max_tick_time_secs > MAX_TICK_TIME_SECS || self.max_tick_time().is_none() {
            return Err(ConfigError::Invalid(format!(
                "max_tick_time_secs must be <= {MAX_TICK_TIME_SECS}"
            )));
        }
        if self.claim_from_top_n == 0 {
            return Err(ConfigError::Invalid("claim_from_top_n must be > 0".into()));
        }
        if self.max_concurrent_actors == 0 || self.global_max_concurrent_actors == 0 {
            return Err(ConfigError::Invalid(
                "actor concurrency limits must be > 0".into(),
            ));
        }
        if self.actor_max_idle_polls == 0 {
            return Err(ConfigError::Invalid("actor_max_idle_polls must be > 0".into()));
        }
        if self.orchestrator_tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator_tick_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn actor_poll_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.actor_poll_interval_ms)
    }

    pub fn orchestrator_tick_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.orchestrator_tick_interval_ms)
    }

    /// `max_tick_time_secs` を Duration に。表現できなければ None
    fn max_tick_time(&self) -> Option<Duration> {
        i64::try_from(self.max_tick_time_secs)
            .ok()
            .and_then(Duration::try_seconds)
    }

    /// type ごとのデフォルト設定
    ///
    /// 範囲外の `max_tick_time_secs` は `Duration::MAX` になり、
    /// claim 時に `ClaimError::LeaseOutOfRange` で止まる（`validate` も弾く）。
    pub fn actor_settings(&self) -> ActorSettings {
        ActorSettings {
            max_concurrent_actors: self.max_concurrent_actors,
            max_tick_time: self.max_tick_time().unwrap_or(Duration::MAX),
            claim_from_top_n: self.claim_from_top_n,
            claim_order: self.claim_order,
            atomic: self.atomic_claims,
            launch_extra: BTreeMap::new(),
        }
    }
}

/// ActorSettings は 1 つの WorkItem type の Actor 設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorSettings {
    pub max_concurrent_actors: usize,
    pub max_tick_time: Duration,
    pub claim_from_top_n: usize,
    pub claim_order: ClaimOrder,
    pub atomic: bool,
    /// Actor 起動時に追加で渡す引数
    pub launch_extra: BTreeMap<String, String>,
}

impl ActorSettings {
    pub fn max_concurrent_actors(mut self, n: usize) -> Self {
        self.max_concurrent_actors = n;
        self
    }

    pub fn max_tick_time(mut self, d: Duration) -> Self {
        self.max_tick_time = d;
        self
    }

    pub fn claim_from_top_n(mut self, n: usize) -> Self {
        self.claim_from_top_n = n;
        self
    }

    pub fn claim_order(mut self, order: ClaimOrder) -> Self {
        self.claim_order = order;
        self
    }

    pub fn atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    pub fn launch_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.launch_extra.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn defaults_are_within_documented_bounds() {
        let config = EngineConfig::default();

        assert!((2..=8).contains(&config.max_concurrent_actors));
        assert!(config.global_max_concurrent_actors >= config.max_concurrent_actors);
        assert_eq!(config.claim_from_top_n % 10, 0);
        assert_eq!(config.max_tick_time_secs, 60);
        assert_eq!(config.actor_max_idle_polls, 3);
        assert!(!config.exit_on_idle);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_tick_time_secs": 10, "claim_order": "newest_first" }}"#).unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();

        assert_eq!(config.max_tick_time_secs, 10);
        assert_eq!(config.claim_order, ClaimOrder::NewestFirst);
        assert_eq!(config.actor_max_idle_polls, 3);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "claim_from_top_n": 0 }}"#).unwrap();

        let err = EngineConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[rstest]
    #[case::upper_bound(MAX_TICK_TIME_SECS, true)]
    #[case::past_upper_bound(MAX_TICK_TIME_SECS + 1, false)]
    #[case::overflows_chrono(100_000_000_000_000, false)]
    #[case::overflows_i64(10_000_000_000_000_000, false)]
    #[case::u64_max(u64::MAX, false)]
    fn max_tick_time_is_bounded(#[case] secs: u64, #[case] valid: bool) {
        let config = EngineConfig {
            max_tick_time_secs: secs,
            ..EngineConfig::default()
        };

        assert_eq!(config.validate().is_ok(), valid);
        if !valid {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn oversized_max_tick_time_does_not_panic_in_actor_settings() {
        let config = EngineConfig {
            max_tick_time_secs: 10_000_000_000_000_000,
            ..EngineConfig::default()
        };

        assert_eq!(config.actor_settings().max_tick_time, Duration::MAX);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = EngineConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn actor_settings_inherit_engine_defaults() {
        let config = EngineConfig {
            max_tick_time_secs: 5,
            ..EngineConfig::default()
        };
        let settings = config.actor_settings().max_concurrent_actors(1);

        assert_eq!(settings.max_tick_time, Duration::seconds(5));
        assert_eq!(settings.max_concurrent_actors, 1);
        assert!(settings.atomic);
    }
}
