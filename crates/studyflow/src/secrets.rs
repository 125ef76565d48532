//! API token resolution from multiple sources.
//!
//! Sources are tried in priority order:
//!
//! 1. **Direct value** - for local testing (`apiToken: "..."`)
//! 2. **File reference** - Docker secrets pattern (`apiTokenFile: /run/secrets/token`)
//! 3. **Env var reference** - production (`apiTokenEnvVar: STUDYFLOW_API_TOKEN`)

use secrecy::SecretString;
use std::fs;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: direct value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Secret file '{path}' is empty")]
    EmptyFile { path: String },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Resolves a secret from the first non-empty source.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = direct.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = file_path.filter(|p| !p.is_empty()) {
        let expanded = expand_home(path);
        let content = fs::read_to_string(&expanded).map_err(|e| SecretError::FileReadError {
            path: expanded.clone(),
            source: e,
        })?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SecretError::EmptyFile { path: expanded });
        }
        return Ok(SecretString::from(trimmed.to_string()));
    }

    if let Some(name) = env_var.filter(|n| !n.is_empty()) {
        return match std::env::var(name) {
            // Env vars may carry trailing newlines.
            Ok(value) => Ok(SecretString::from(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Like [`resolve_secret`], but `None` when no source is configured.
pub fn resolve_secret_optional(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<Option<SecretString>> {
    match resolve_secret(direct, file_path, env_var) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NoSourceProvided) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Expands a leading `~` to the user's home directory.
///
/// `~user/path` is not supported.
pub fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let home = home.to_string_lossy();
            if path == "~" {
                return home.into_owned();
            }
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_direct_value_takes_priority() {
        std::env::set_var("STUDYFLOW_TEST_TOKEN_1", "env_value");
        let result =
            resolve_secret(Some("direct_value"), None, Some("STUDYFLOW_TEST_TOKEN_1")).unwrap();
        assert_eq!(result.expose_secret(), "direct_value");
        std::env::remove_var("STUDYFLOW_TEST_TOKEN_1");
    }

    #[test]
    #[serial]
    fn test_file_takes_priority_over_env() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "file_value").unwrap();
        std::env::set_var("STUDYFLOW_TEST_TOKEN_2", "env_value");

        let result = resolve_secret(
            None,
            Some(file.path().to_str().unwrap()),
            Some("STUDYFLOW_TEST_TOKEN_2"),
        )
        .unwrap();
        assert_eq!(result.expose_secret(), "file_value");
        std::env::remove_var("STUDYFLOW_TEST_TOKEN_2");
    }

    #[test]
    #[serial]
    fn test_env_var_fallback_is_trimmed() {
        std::env::set_var("STUDYFLOW_TEST_TOKEN_3", "env_value\n");
        let result = resolve_secret(None, None, Some("STUDYFLOW_TEST_TOKEN_3")).unwrap();
        assert_eq!(result.expose_secret(), "env_value");
        std::env::remove_var("STUDYFLOW_TEST_TOKEN_3");
    }

    #[test]
    #[serial]
    fn test_missing_env_var() {
        std::env::remove_var("STUDYFLOW_TEST_TOKEN_MISSING");
        let err = resolve_secret(None, None, Some("STUDYFLOW_TEST_TOKEN_MISSING")).unwrap_err();
        assert!(matches!(err, SecretError::EnvVarNotSet { .. }));
    }

    #[test]
    fn test_empty_sources_are_skipped() {
        let err = resolve_secret(Some(""), Some(""), Some("")).unwrap_err();
        assert!(matches!(err, SecretError::NoSourceProvided));
        assert!(resolve_secret_optional(None, None, None).unwrap().is_none());
    }

    #[test]
    fn test_empty_file_is_an_error() {
        let file = NamedTempFile::new().unwrap();
        let err = resolve_secret(None, Some(file.path().to_str().unwrap()), None).unwrap_err();
        assert!(matches!(err, SecretError::EmptyFile { .. }));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/token"), "/etc/token");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home("~/token"),
                format!("{}/token", home.to_string_lossy())
            );
        }
    }
}
