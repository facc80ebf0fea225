//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::credentials::TlsBundle;
use crate::error::{ConfigError, TunnelError};

/// File names used for saved tunnel credentials under `<data_dir>/credentials`
pub const SAVED_CA_FILE: &str = "root_ca.crt";
pub const SAVED_CERT_FILE: &str = "device.crt";
pub const SAVED_KEY_FILE: &str = "device.key";

/// Top-level configuration for the device daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Device name; defaults to the host name
    pub device_name: Option<String>,

    /// Base directory for persisted state (credentials)
    pub data_dir: Option<PathBuf>,

    /// Reverse tunnel settings
    pub tunnel: TunnelConfig,

    /// Session server settings
    pub session: SessionServerConfig,

    /// Monitoring agent capability settings
    pub monitoring: MonitoringConfig,

    /// Webhook ingress settings
    pub ingress: IngressConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            data_dir: Some(PathBuf::from("/var/lib/tether")),
            tunnel: TunnelConfig::default(),
            session: SessionServerConfig::default(),
            monitoring: MonitoringConfig::default(),
            ingress: IngressConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Resolved device name, falling back to the host name
    pub fn device_name(&self) -> String {
        self.device_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }

    /// Directory holding saved tunnel credentials, if a data dir is configured
    pub fn credentials_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("credentials"))
    }

    /// Fill in TLS paths from the credentials directory when none were given
    pub fn apply_saved_credentials(&mut self) {
        if self.tunnel.tls.is_complete() {
            return;
        }
        let Some(dir) = self.credentials_dir() else {
            return;
        };
        let cert = dir.join(SAVED_CERT_FILE);
        if cert.is_file() {
            tracing::info!("Using saved tunnel credentials from {:?}", dir);
            self.tunnel.tls = TlsPaths {
                ca_file: Some(dir.join(SAVED_CA_FILE)),
                cert_file: Some(cert),
                key_file: Some(dir.join(SAVED_KEY_FILE)),
            };
        }
    }

    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.grace_period > self.session.lifetime {
            return Err(ConfigError::Invalid(
                "session.grace_period must not exceed session.lifetime".to_string(),
            ));
        }
        if self.tunnel.tls.any_set() && !self.tunnel.tls.is_complete() {
            return Err(ConfigError::Invalid(
                "tunnel TLS requires ca_file, cert_file and key_file together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reverse tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Rendezvous server (`host:port` or `https://host:port`)
    pub server_address: Option<String>,

    /// Static routes added at startup
    pub routes: Vec<String>,

    /// TLS material for the rendezvous connection
    pub tls: TlsPaths,

    /// Reconnect backoff
    pub backoff: BackoffConfig,

    /// Timeout for a single connection attempt
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server_address: None,
            routes: vec![],
            tls: TlsPaths::default(),
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Paths of the three PEM files making up the tunnel credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsPaths {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl TlsPaths {
    /// All three paths are set
    pub fn is_complete(&self) -> bool {
        self.ca_file.is_some() && self.cert_file.is_some() && self.key_file.is_some()
    }

    /// At least one path is set
    pub fn any_set(&self) -> bool {
        self.ca_file.is_some() || self.cert_file.is_some() || self.key_file.is_some()
    }

    /// Load the bundle; `Ok(None)` when no paths are configured
    pub fn load(&self) -> Result<Option<TlsBundle>, TunnelError> {
        match (&self.ca_file, &self.cert_file, &self.key_file) {
            (Some(ca), Some(cert), Some(key)) => TlsBundle::load(ca, cert, key).map(Some),
            (None, None, None) => Ok(None),
            _ => Err(TunnelError::InvalidCredentials(
                "ca, cert and key must be configured together".to_string(),
            )),
        }
    }

    /// Paths inside `dir` using the saved-credential file names
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ca_file: Some(dir.join(SAVED_CA_FILE)),
            cert_file: Some(dir.join(SAVED_CERT_FILE)),
            key_file: Some(dir.join(SAVED_KEY_FILE)),
        }
    }
}

/// Session server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionServerConfig {
    /// Listen address; port 0 picks an ephemeral port
    pub bind_address: String,

    /// Maximum time a server instance stays up
    #[serde(with = "duration_secs")]
    pub lifetime: Duration,

    /// Warning window between the shutdown notice and forced close
    #[serde(with = "duration_secs")]
    pub grace_period: Duration,

    /// Shell spawned for interactive sessions
    pub shell: Option<String>,

    /// Extra environment for spawned shells
    pub env: Vec<(String, String)>,

    /// Idle connections are dropped after this long without traffic
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
}

impl Default for SessionServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            lifetime: Duration::from_secs(12 * 60 * 60),
            grace_period: Duration::from_secs(3),
            shell: Some("/bin/bash".to_string()),
            env: vec![],
            idle_timeout: Duration::from_secs(3600),
        }
    }
}

/// Monitoring agent capability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Agent executable
    pub agent_binary: PathBuf,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            agent_binary: PathBuf::from("beszel-agent"),
        }
    }
}

/// Webhook ingress settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Listen address; ingress disabled when unset
    pub bind_address: Option<String>,
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::fixtures::{CERT_PEM, KEY_PEM};

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.session.lifetime, Duration::from_secs(43200));
        assert_eq!(config.session.grace_period, Duration::from_secs(3));
        assert!(config.validate().is_ok());
        assert!(!config.device_name().is_empty());
    }

    #[test]
    fn test_partial_tls_rejected() {
        let mut config = DaemonConfig::default();
        config.tunnel.tls.ca_file = Some(PathBuf::from("/tmp/ca.crt"));
        assert!(config.validate().is_err());
        assert!(config.tunnel.tls.load().is_err());
    }

    #[test]
    fn test_apply_saved_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let creds = dir.path().join("credentials");
        std::fs::create_dir_all(&creds).unwrap();
        std::fs::write(creds.join(SAVED_CA_FILE), CERT_PEM).unwrap();
        std::fs::write(creds.join(SAVED_CERT_FILE), CERT_PEM).unwrap();
        std::fs::write(creds.join(SAVED_KEY_FILE), KEY_PEM).unwrap();

        let mut config = DaemonConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..DaemonConfig::default()
        };
        config.apply_saved_credentials();

        assert!(config.tunnel.tls.is_complete());
        assert!(config.tunnel.tls.load().unwrap().is_some());
    }

    #[test]
    fn test_explicit_device_name_wins() {
        let config = DaemonConfig {
            device_name: Some("edge-7".to_string()),
            ..DaemonConfig::default()
        };
        assert_eq!(config.device_name(), "edge-7");
    }
}
