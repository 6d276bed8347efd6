/*!
 * Configuration
 * Backend configuration files and process-level settings
 */

use crate::core::errors::{SandboxError, SandboxResult};
use crate::sandbox::factory::BackendConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parent directory for every instance temp dir
pub const TEMP_DIR_ENV: &str = "SANDBOXER_TEMP_DIR";

/// Default per-run deadline in seconds
pub const TIMEOUT_SECS_ENV: &str = "SANDBOXER_TIMEOUT_SECS";

/// Load a tagged backend configuration from a JSON file
pub fn load_backend_config(path: &Path) -> SandboxResult<BackendConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        SandboxError::ConfigInvalid(format!("read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| SandboxError::ConfigInvalid(format!("{}: {}", path.display(), e)))
}

/// Process-level settings read from the environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub temp_dir: Option<PathBuf>,
    pub default_timeout: Option<Duration>,
}

impl Settings {
    pub fn from_env() -> SandboxResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> SandboxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let temp_dir = lookup(TEMP_DIR_ENV)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let default_timeout = match lookup(TIMEOUT_SECS_ENV) {
            Some(value) if !value.trim().is_empty() => {
                let secs: u64 = value.trim().parse().map_err(|_| {
                    SandboxError::ConfigInvalid(format!(
                        "{} must be a whole number of seconds, got {:?}",
                        TIMEOUT_SECS_ENV, value
                    ))
                })?;
                Some(Duration::from_secs(secs))
            }
            _ => None,
        };

        Ok(Self {
            temp_dir,
            default_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_settings_values() {
        let settings = Settings::from_lookup(lookup_from(&[
            (TEMP_DIR_ENV, "/var/tmp/sbx"),
            (TIMEOUT_SECS_ENV, "15"),
        ]))
        .unwrap();
        assert_eq!(settings.temp_dir, Some(PathBuf::from("/var/tmp/sbx")));
        assert_eq!(settings.default_timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_bad_timeout_rejected() {
        let err = Settings::from_lookup(lookup_from(&[(TIMEOUT_SECS_ENV, "soon")])).unwrap_err();
        assert!(err.is_config_invalid());
    }

    #[tokio::test]
    async fn test_huge_timeout_is_accepted_without_deadline() {
        let settings =
            Settings::from_lookup(lookup_from(&[(TIMEOUT_SECS_ENV, "18446744073709551615")]))
                .unwrap();
        let timeout = settings.default_timeout.unwrap();
        let ctx = crate::sandbox::ExecContext::background().timeout(timeout);
        assert!(ctx.deadline().is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var(TIMEOUT_SECS_ENV, "3");
        let settings = Settings::from_env();
        std::env::remove_var(TIMEOUT_SECS_ENV);
        assert_eq!(settings.unwrap().default_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_load_backend_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bwrap.json");
        std::fs::write(&path, r#"{"backend":"bubblewrap","host_filesystem":true}"#).unwrap();
        let config = load_backend_config(&path).unwrap();
        assert_eq!(config.kind(), crate::sandbox::BackendKind::Bubblewrap);

        std::fs::write(&path, "{not json").unwrap();
        assert!(load_backend_config(&path).unwrap_err().is_config_invalid());
        assert!(load_backend_config(&dir.path().join("missing.json"))
            .unwrap_err()
            .is_config_invalid());
    }
}
