//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`VM_BACKUP__SECTION__KEY`).

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `VM_BACKUP__LOG__LEVEL=debug`
const ENV_PREFIX: &str = "VM_BACKUP";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub defaults: JobSettings,

    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identifier attached to every task started on this node
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Directory under which NFS/SMB remotes are mounted
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Effective settings for a backup job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    /// Number of backups kept per VM and schedule, the new one included.
    /// 0 disables automatic deletion.
    #[serde(default = "default_export_retention")]
    pub export_retention: u32,

    /// Delete old backups before writing the new one
    #[serde(default)]
    pub delete_first: bool,

    /// Mode applied to directories created on the remote
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,
}

/// A configured storage destination.
///
/// Which fields are meaningful depends on `type`: `path` for local remotes,
/// `host` + `path` for NFS, `host` + `share` + credentials for SMB and
/// `bucket` + `prefix` + endpoint settings for object storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub share: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub bucket: Option<String>,

    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub allow_http: bool,

    /// Protocol specific options passed through to the mount command
    #[serde(default)]
    pub options: Option<String>,
}

// Default values
fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "vm-backup-01".to_string())
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/run/vm-backup/mounts")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_export_retention() -> u32 {
    1
}

fn default_dir_mode() -> u32 {
    0o700
}

fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            mount_root: default_mount_root(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            export_retention: default_export_retention(),
            delete_first: false,
            dir_mode: default_dir_mode(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            log: LogConfig::default(),
            defaults: JobSettings::default(),
            remotes: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file, applying `.env` and environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BackupError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a remote by id
    pub fn remote(&self, id: &str) -> Result<&RemoteConfig> {
        self.remotes
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| BackupError::Config(format!("unknown remote '{}'", id)))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for remote in &self.remotes {
            if remote.id.is_empty() {
                return Err(BackupError::Config("remote without id".into()));
            }
            if !seen.insert(remote.id.as_str()) {
                return Err(BackupError::Config(format!("duplicate remote '{}'", remote.id)));
            }
        }
        Ok(())
    }
}
