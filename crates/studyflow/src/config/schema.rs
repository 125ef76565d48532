use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerConfig {
    #[serde(default = "default_version")]
    pub version: String,
    pub api_base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub api_token_file: Option<String>,
    #[serde(default)]
    pub api_token_env_var: Option<String>,
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_refetch_timeout")]
    pub refetch_timeout_secs: u64,
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub push_poll_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Whole-request deadline of every backend call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Snapshot database. Falls back to `~/.studyflow/data/studyflow.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_true")]
    pub persist_statuses: bool,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_submit_timeout() -> u64 {
    30
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_refetch_timeout() -> u64 {
    30
}

fn default_stuck_threshold() -> u64 {
    180
}

fn default_poll_interval() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl TrackerConfig {
    /// Config with every default and the given base URL.
    pub fn with_base_url(api_base_url: &str) -> Self {
        Self {
            version: default_version(),
            api_base_url: api_base_url.to_string(),
            api_token: None,
            api_token_file: None,
            api_token_env_var: None,
            submit_timeout_secs: default_submit_timeout(),
            recovery_timeout_secs: default_recovery_timeout(),
            refetch_timeout_secs: default_refetch_timeout(),
            stuck_threshold_secs: default_stuck_threshold(),
            push_poll_interval_secs: default_poll_interval(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            channel_capacity: default_channel_capacity(),
            database_path: None,
            persist_statuses: true,
            log_format: LogFormat::Text,
        }
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn refetch_timeout(&self) -> Duration {
        Duration::from_secs(self.refetch_timeout_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn push_poll_interval(&self) -> Duration {
        Duration::from_secs(self.push_poll_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn has_token_source(&self) -> bool {
        [&self.api_token, &self.api_token_file, &self.api_token_env_var]
            .iter()
            .any(|source| source.as_deref().map_or(false, |s| !s.is_empty()))
    }

    /// Where the status snapshot lives, or `None` when persistence is off.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        if !self.persist_statuses {
            return None;
        }
        match &self.database_path {
            Some(path) => Some(PathBuf::from(crate::secrets::expand_home(path))),
            None => crate::db::Database::default_path(),
        }
    }
}
