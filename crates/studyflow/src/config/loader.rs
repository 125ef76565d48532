use std::path::Path;

use crate::config::schema::TrackerConfig;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TrackerConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<TrackerConfig, ConfigError> {
    let config: TrackerConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &TrackerConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let base_url = config.api_base_url.trim();
    if base_url.is_empty() {
        return Err(ConfigError::Validation {
            message: "apiBaseUrl must not be empty".to_string(),
        });
    }
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation {
            message: format!("apiBaseUrl must be an http(s) URL, got '{}'", base_url),
        });
    }

    let durations = [
        ("submitTimeoutSecs", config.submit_timeout_secs),
        ("recoveryTimeoutSecs", config.recovery_timeout_secs),
        ("refetchTimeoutSecs", config.refetch_timeout_secs),
        ("stuckThresholdSecs", config.stuck_threshold_secs),
        ("pushPollIntervalSecs", config.push_poll_interval_secs),
        ("connectTimeoutSecs", config.connect_timeout_secs),
        ("requestTimeoutSecs", config.request_timeout_secs),
    ];
    for (name, value) in durations {
        if value == 0 {
            return Err(ConfigError::Validation {
                message: format!("{} must be greater than zero", name),
            });
        }
    }

    if config.channel_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "channelCapacity must be greater than zero".to_string(),
        });
    }

    Ok(())
}
