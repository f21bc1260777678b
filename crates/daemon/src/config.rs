// proxid - Daemon Config Module
// Handles daemon configuration (listen ports, ssh client, host source)

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::tunnel::TunnelCommand;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DaemonConfig {
    /// Address the HTTP control API binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port of the HTTP control API
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Local SOCKS port the tunnel listens on (`ssh -D`)
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    /// SSH client configuration the host directory is read from
    #[serde(default = "proxid_common::default_ssh_config_path")]
    pub ssh_config_path: PathBuf,

    /// Tunnel client executable
    #[serde(default = "default_ssh_program")]
    pub ssh_program: PathBuf,

    /// Extra arguments passed to the tunnel client before the tunnel options
    /// (e.g. ["-o", "ServerAliveInterval=30"])
    #[serde(default)]
    pub ssh_args: Vec<String>,

    /// User for hosts without a `User` entry; the current OS user when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_user: Option<String>,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    4444
}

fn default_socks_port() -> u16 {
    1080
}

fn default_ssh_program() -> PathBuf {
    PathBuf::from("ssh")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            http_port: default_http_port(),
            socks_port: default_socks_port(),
            ssh_config_path: proxid_common::default_ssh_config_path(),
            ssh_program: default_ssh_program(),
            ssh_args: Vec::new(),
            default_user: None,
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.http_port == 0 {
            anyhow::bail!("http_port must be non-zero");
        }
        if self.socks_port == 0 {
            anyhow::bail!("socks_port must be non-zero");
        }
        if self.http_port == self.socks_port {
            anyhow::bail!(
                "http_port and socks_port must differ (both are {})",
                self.http_port
            );
        }

        if !is_loopback_host(&self.bind_host) {
            warn!(
                "Control API bound to non-loopback address {} - it has no authentication",
                self.bind_host
            );
        }

        Ok(())
    }

    /// Load daemon configuration from `path`, or from the default location
    ///
    /// A missing default file is created with default values; a missing
    /// explicit `path` is an error. The result is not validated, so that
    /// command-line overrides can be applied first.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            let config_path = Self::config_path()?;
            if !config_path.exists() {
                info!("No daemon configuration found, using defaults");
                info!("Configuration will be saved to: {}", config_path.display());
                let config = Self::default();
                config.save(&config_path)?;
                return Ok(config);
            }
            return Self::load_from(&config_path);
        };

        if !path.exists() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }
        Self::load_from(path)
    }

    fn load_from(config_path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(config_path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to file
    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(config_path, contents).context("Failed to write daemon configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("proxid").join("daemon.toml"))
    }

    /// `host:port` the control API listens on
    pub fn bind_address(&self) -> String {
        format_host_port(&self.bind_host, self.http_port)
    }

    /// How the tunnel client is launched for this configuration
    pub fn tunnel_command(&self) -> TunnelCommand {
        TunnelCommand {
            program: self.ssh_program.clone(),
            args: self.ssh_args.clone(),
            socks_port: self.socks_port,
        }
    }
}

/// Format host and port, bracketing bare IPv6 addresses
fn format_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.http_port, 4444);
        assert_eq!(config.socks_port, 1080);
        assert_eq!(config.bind_address(), "127.0.0.1:4444");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_shared_port() {
        let config = DaemonConfig {
            http_port: 1080,
            socks_port: 1080,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = DaemonConfig {
            socks_port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_allows_non_loopback_bind() {
        let config = DaemonConfig {
            bind_host: "0.0.0.0".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_format_host_port() {
        assert_eq!(format_host_port("127.0.0.1", 4444), "127.0.0.1:4444");
        assert_eq!(format_host_port("::1", 4444), "[::1]:4444");
        assert_eq!(format_host_port("localhost", 80), "localhost:80");
    }

    #[test]
    fn test_is_loopback_host() {
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("::1"));
        assert!(is_loopback_host("LocalHost"));
        assert!(!is_loopback_host("0.0.0.0"));
        assert!(!is_loopback_host("example.com"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("proxid").join("daemon.toml");

        let config = DaemonConfig {
            socks_port: 9050,
            default_user: Some("alice".to_string()),
            ..Default::default()
        };
        config.save(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let reloaded = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("proxid").join("daemon.toml");

        let err = DaemonConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("not found"));

        // Nothing is written for a path the user named
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.toml");
        fs::write(
            &path,
            "socks_port = 9050\nssh_args = [\"-o\", \"ServerAliveInterval=30\"]\n",
        )
        .unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.socks_port, 9050);
        assert_eq!(config.http_port, 4444);

        let command = config.tunnel_command();
        assert_eq!(command.socks_port, 9050);
        assert_eq!(command.args, vec!["-o", "ServerAliveInterval=30"]);
    }

    #[test]
    fn test_load_does_not_validate() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.toml");
        fs::write(&path, "http_port = 1080\n").unwrap();

        let mut config = DaemonConfig::load(Some(&path)).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must differ"));

        // An override can still repair the loaded values
        config.http_port = 4444;
        assert!(config.validate().is_ok());
    }
}
