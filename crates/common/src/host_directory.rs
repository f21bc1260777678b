// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 proxid Contributors

// proxid - Host Directory Module
// Loads named tunnel targets from an OpenSSH client configuration file

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::HostRecord;

const DEFAULT_SSH_PORT: u16 = 22;

/// Get the default SSH client configuration path (~/.ssh/config)
pub fn default_ssh_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("config")
}

/// Name of the user running this process
pub fn current_username() -> Result<String> {
    users::get_current_username()
        .and_then(|name| name.into_string().ok())
        .ok_or_else(|| Error::Config("Could not determine current user name".to_string()))
}

/// Options collected for one `Host` block (or for the defaults) before resolution
#[derive(Debug, Default)]
struct HostBlock {
    name: String,
    host_name: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    identity_file: Option<PathBuf>,
}

impl HostBlock {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Record a directive. The first value obtained for a keyword wins, as in ssh.
    fn apply(&mut self, keyword: &str, value: &str, source: &Path, line: usize) -> Result<()> {
        match keyword {
            "hostname" => {
                self.host_name.get_or_insert_with(|| value.to_string());
            }
            "port" => {
                let port = value.parse::<u16>().map_err(|_| Error::SshConfig {
                    path: source.to_path_buf(),
                    line,
                    message: format!("invalid port '{}'", value),
                })?;
                self.port.get_or_insert(port);
            }
            "user" => {
                self.user.get_or_insert_with(|| value.to_string());
            }
            "identityfile" => {
                self.identity_file.get_or_insert_with(|| expand_home(value));
            }
            "include" => {
                debug!("{}:{}: Include is not followed", source.display(), line);
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve(self, defaults: &HostBlock, default_user: &str) -> HostRecord {
        HostRecord {
            host_name: self.host_name.unwrap_or_else(|| self.name.clone()),
            port: self.port.or(defaults.port).unwrap_or(DEFAULT_SSH_PORT),
            user: self
                .user
                .or_else(|| defaults.user.clone())
                .unwrap_or_else(|| default_user.to_string()),
            identity_file: self
                .identity_file
                .or_else(|| defaults.identity_file.clone()),
            name: self.name,
        }
    }
}

/// Which block subsequent directives belong to
enum Section {
    /// Before the first `Host`, or inside `Host *`
    Defaults,
    /// Inside an addressable `Host` block (index into the pending list)
    Host(usize),
    /// Inside a pattern-only `Host` or a `Match` block
    Skipped,
}

/// Named hosts available as tunnel targets, ordered by name
#[derive(Debug, Clone, Default)]
pub struct HostDirectory {
    hosts: BTreeMap<String, HostRecord>,
}

impl HostDirectory {
    /// Load the directory from an ssh config file
    ///
    /// Hosts without a `User` fall back to `default_user`, or to the current
    /// OS user when that is `None`. A missing file yields an empty directory.
    pub fn load(path: &Path, default_user: Option<&str>) -> Result<Self> {
        let default_user = match default_user {
            Some(user) => user.to_string(),
            None => current_username()?,
        };

        if !path.exists() {
            warn!(
                "SSH config {} does not exist, no hosts available",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let directory = Self::parse(&contents, path, &default_user)?;

        info!(
            "Loaded {} host(s) from {}",
            directory.len(),
            path.display()
        );
        Ok(directory)
    }

    /// Parse ssh config text; `source` is only used in error messages
    pub fn parse(contents: &str, source: &Path, default_user: &str) -> Result<Self> {
        let mut defaults = HostBlock::default();
        let mut blocks: Vec<HostBlock> = Vec::new();
        let mut section = Section::Defaults;

        for (index, raw) in contents.lines().enumerate() {
            let line_number = index + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((keyword, value)) = split_directive(line) else {
                warn!(
                    "{}:{}: ignoring directive without a value",
                    source.display(),
                    line_number
                );
                continue;
            };
            let keyword = keyword.to_ascii_lowercase();

            match keyword.as_str() {
                "host" => {
                    let first = value.split_whitespace().next().unwrap_or_default();
                    section = if first == "*" {
                        Section::Defaults
                    } else if is_pattern(first) {
                        debug!("Skipping pattern host block '{}'", value);
                        Section::Skipped
                    } else {
                        blocks.push(HostBlock::named(first));
                        Section::Host(blocks.len() - 1)
                    };
                }
                "match" => {
                    debug!("Skipping Match block at line {}", line_number);
                    section = Section::Skipped;
                }
                _ => match section {
                    Section::Defaults => {
                        defaults.apply(&keyword, value, source, line_number)?
                    }
                    Section::Host(i) => {
                        blocks[i].apply(&keyword, value, source, line_number)?
                    }
                    Section::Skipped => {}
                },
            }
        }

        let mut hosts = BTreeMap::new();
        for block in blocks {
            if hosts.contains_key(&block.name) {
                debug!("Duplicate host '{}', keeping first definition", block.name);
                continue;
            }
            let record = block.resolve(&defaults, default_user);
            hosts.insert(record.name.clone(), record);
        }

        Ok(Self { hosts })
    }

    /// Build a directory from already resolved records
    pub fn from_records(records: impl IntoIterator<Item = HostRecord>) -> Self {
        let mut hosts = BTreeMap::new();
        for record in records {
            hosts.entry(record.name.clone()).or_insert(record);
        }
        Self { hosts }
    }

    /// Look up a host by alias
    pub fn get(&self, name: &str) -> Option<&HostRecord> {
        self.hosts.get(name)
    }

    /// All hosts, sorted by name
    pub fn hosts(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Split `Keyword value` or `Keyword=value`; returns None when the value is empty
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let split_at = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (keyword, rest) = line.split_at(split_at);

    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    let value = unquote(rest);

    if value.is_empty() {
        None
    } else {
        Some((keyword, value))
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn is_pattern(alias: &str) -> bool {
    alias.contains(['*', '?', '!'])
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
