//! Configuration management for tether

mod daemon;
pub mod serde_utils;

pub use daemon::{
    BackoffConfig, DaemonConfig, IngressConfig, MonitoringConfig, SessionServerConfig, TlsPaths,
    TunnelConfig, SAVED_CA_FILE, SAVED_CERT_FILE, SAVED_KEY_FILE,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Default configuration file path
pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/tether/config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file() {
        let err = load_config::<DaemonConfig>(Path::new("/nonexistent/tether.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "device_name = \"edge-7\"\n[session]\ngrace_period = 10\n").unwrap();

        let loaded: DaemonConfig = load_config(&path).unwrap();
        assert_eq!(loaded.device_name.as_deref(), Some("edge-7"));
        assert_eq!(loaded.session.grace_period, std::time::Duration::from_secs(10));
        assert_eq!(loaded.session.bind_address, "127.0.0.1:0");
    }
}
