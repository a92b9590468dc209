//! Ingest service configuration loading.
//!
//! TOML is the only file format. A config file is optional: without one the
//! built-in defaults apply. CLI overrides are applied by `main` after loading.
//!
//! # Required fields (when a file is supplied)
//! - `schema_version = 1`
//!
//! # Sites
//! The `[sites]` table maps a device identifier to a site label that is
//! stored alongside each of its heartbeats.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0:9000";
pub const DEFAULT_ALLOWLIST_PATH: &str = "approved_macs.txt";
pub const DEFAULT_SQLITE_PATH: &str = "halo_heartbeats.db";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Fully resolved ingest configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub listen: ListenConfig,
    pub allowlist: AllowlistConfig,
    pub storage: StorageConfig,
    pub connections: ConnectionLimits,
    pub sites: SiteMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenConfig {
    pub bind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllowlistConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub sqlite_path: PathBuf,
    /// Total attempts per append, including the first one.
    pub write_attempts: u32,
}

/// Per-connection and acceptor limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    pub max_line_bytes: usize,
    pub shutdown_grace: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        ConnectionLimits {
            max_connections: 256,
            idle_timeout: Some(Duration::from_secs(300)),
            max_line_bytes: 4096,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Identifier to site label lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteMap {
    sites: HashMap<String, String>,
}

impl SiteMap {
    pub fn new(sites: HashMap<String, String>) -> Self {
        SiteMap { sites }
    }

    pub fn site_for(&self, mac: &str) -> Option<&str> {
        self.sites.get(mac).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            listen: ListenConfig {
                bind: DEFAULT_BIND.to_owned(),
            },
            allowlist: AllowlistConfig {
                path: PathBuf::from(DEFAULT_ALLOWLIST_PATH),
            },
            storage: StorageConfig {
                sqlite_path: PathBuf::from(DEFAULT_SQLITE_PATH),
                write_attempts: 2,
            },
            connections: ConnectionLimits::default(),
            sites: SiteMap::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    schema_version: Option<u32>,
    listen: Option<RawListenConfig>,
    allowlist: Option<RawAllowlistConfig>,
    storage: Option<RawStorageConfig>,
    connections: Option<RawConnectionsConfig>,
    sites: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListenConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAllowlistConfig {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStorageConfig {
    sqlite_path: Option<String>,
    write_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnectionsConfig {
    max_connections: Option<usize>,
    idle_timeout_secs: Option<u64>,
    max_line_bytes: Option<usize>,
    shutdown_grace_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load ingest config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<IngestConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load ingest config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<IngestConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let defaults = IngestConfig::default();

    let listen = match raw.listen {
        Some(l) => ListenConfig {
            bind: l.bind.unwrap_or(defaults.listen.bind),
        },
        None => defaults.listen,
    };
    if listen.bind.trim().is_empty() {
        return Err(ConfigError::InvalidValue(
            "listen.bind must not be empty".to_owned(),
        ));
    }

    let allowlist = match raw.allowlist {
        Some(a) => AllowlistConfig {
            path: a.path.map(PathBuf::from).unwrap_or(defaults.allowlist.path),
        },
        None => defaults.allowlist,
    };

    let storage = match raw.storage {
        Some(s) => StorageConfig {
            sqlite_path: s
                .sqlite_path
                .map(PathBuf::from)
                .unwrap_or(defaults.storage.sqlite_path),
            write_attempts: s.write_attempts.unwrap_or(defaults.storage.write_attempts),
        },
        None => defaults.storage,
    };
    if storage.write_attempts == 0 {
        return Err(ConfigError::InvalidValue(
            "storage.write_attempts must be at least 1".to_owned(),
        ));
    }

    let connections = match raw.connections {
        Some(c) => {
            let base = defaults.connections;
            ConnectionLimits {
                max_connections: c.max_connections.unwrap_or(base.max_connections),
                idle_timeout: match c.idle_timeout_secs {
                    Some(0) => None,
                    Some(secs) => Some(Duration::from_secs(secs)),
                    None => base.idle_timeout,
                },
                max_line_bytes: c.max_line_bytes.unwrap_or(base.max_line_bytes),
                shutdown_grace: c
                    .shutdown_grace_secs
                    .map(Duration::from_secs)
                    .unwrap_or(base.shutdown_grace),
            }
        }
        None => defaults.connections,
    };
    if connections.max_connections == 0 {
        return Err(ConfigError::InvalidValue(
            "connections.max_connections must be at least 1".to_owned(),
        ));
    }
    if connections.max_line_bytes == 0 {
        return Err(ConfigError::InvalidValue(
            "connections.max_line_bytes must be at least 1".to_owned(),
        ));
    }

    let sites = SiteMap::new(raw.sites.unwrap_or_default());

    Ok(IngestConfig {
        listen,
        allowlist,
        storage,
        connections,
        sites,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
