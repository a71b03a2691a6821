//! Daemon configuration: a TOML file, with every field defaulted so an empty
//! file (or none at all) yields a working setup under the reaper home.

use crate::engine::{EngineOptions, DEFAULT_MAX_RETRIES, DEFAULT_STABLE_CYCLES};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unrecognized timezone {0:?}")]
    Timezone(String),

    #[error("invalid whitelist pattern {pattern:?}: {source}")]
    Whitelist {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    pub poll_interval_secs: u64,
    pub stable_cycles: u32,
    pub max_retries: u32,
    /// IANA timezone the instrument's local timestamps are interpreted in.
    pub timezone: String,
    pub workspace_root: PathBuf,
    pub output_dir: PathBuf,
    /// Persists the reaped/failed sets across restarts when set.
    pub state_file: Option<PathBuf>,
    /// Patient id glob (`*` wildcards) a series must match to be reaped.
    pub whitelist: String,
    /// Patient ids to silently discard, matched case-insensitively.
    pub blacklist: Vec<String>,
    pub anonymize: bool,
}

impl Default for ReaperConfig {
    fn default() -> ReaperConfig {
        let home = reaper_logging::reaper_home();
        ReaperConfig {
            poll_interval_secs: 30,
            stable_cycles: DEFAULT_STABLE_CYCLES,
            max_retries: DEFAULT_MAX_RETRIES,
            timezone: "UTC".to_string(),
            workspace_root: home.join("work"),
            output_dir: home.join("outbox"),
            state_file: None,
            whitelist: "*".to_string(),
            blacklist: vec!["discard".to_string()],
            anonymize: true,
        }
    }
}

impl ReaperConfig {
    pub fn load(path: &Path) -> Result<ReaperConfig, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::Timezone(self.timezone.clone()))
    }

    pub fn whitelist_regex(&self) -> Result<Regex, ConfigError> {
        crate::net_backend::compile_whitelist(&self.whitelist).map_err(|source| {
            ConfigError::Whitelist {
                pattern: self.whitelist.clone(),
                source,
            }
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            stable_cycles: self.stable_cycles,
            max_retries: self.max_retries,
            workspace_root: self.workspace_root.clone(),
            state_file: self.state_file.clone(),
        }
    }
}
