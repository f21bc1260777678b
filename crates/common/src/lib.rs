// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 proxid Contributors

// proxid - Common Library
// Host directory, wire types and errors shared by the daemon and the CLI

pub mod error;
pub mod host_directory;
pub mod types;

pub use error::{Error, Result};
pub use host_directory::{current_username, default_ssh_config_path, HostDirectory};
pub use types::{ApiResponse, ApiStatus, HostRecord, TunnelStatusResponse};
