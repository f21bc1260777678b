// Common types for proxid

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named tunnel target taken from the SSH client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostRecord {
    /// Alias from the `Host` line, unique within a directory
    pub name: String,
    /// Remote address (`HostName`, or the alias when unset)
    pub host_name: String,
    /// Remote SSH port
    pub port: u16,
    /// Remote login user
    pub user: String,
    /// Private key passed to the tunnel client, if configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

impl HostRecord {
    /// `user@host_name` as understood by the ssh client
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host_name)
    }
}

/// Outcome reported by the control API
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Ok,
    Error,
}

/// Body returned by `POST /start` and `POST /stop`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: ApiStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            status: ApiStatus::Ok,
            msg: None,
        }
    }

    pub fn error() -> Self {
        Self {
            status: ApiStatus::Error,
            msg: None,
        }
    }

    pub fn error_with(msg: impl Into<String>) -> Self {
        Self {
            status: ApiStatus::Error,
            msg: Some(msg.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ApiStatus::Ok
    }

    pub fn from_success(success: bool) -> Self {
        if success {
            Self::ok()
        } else {
            Self::error()
        }
    }
}

/// Body returned by `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelStatusResponse {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub socks_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}
