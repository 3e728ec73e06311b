//! VM backup runs and the on-remote backup layout.
//!
//! Backups of a VM live in `xo-vm-backups/<vm-uuid>/`. Each run produces a
//! data file (`<basename>.xva` for full backups, `<basename>.bdi` for delta
//! backups) and a `<basename>.json` metadata file written last.

pub mod adapter;
pub mod delta;
pub mod full;
pub mod metadata;
pub mod writer;

pub use adapter::{BackupEntry, CleanReport, RemoteAdapter};
pub use delta::DeltaBackupWriter;
pub use full::FullBackupWriter;
pub use metadata::BackupMetadata;
pub use writer::{BackupOutcome, BackupWriter, WriterState};

use crate::config::JobSettings;
use crate::transfer::{ByteStream, SizeContainer};
use crate::utils::errors::{BackupError, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const BACKUP_ROOT: &str = "xo-vm-backups";
pub const METADATA_VERSION: &str = "2.0.0";
pub const METADATA_EXTENSION: &str = "json";
pub const XVA_EXTENSION: &str = "xva";

/// Sortable rendering of a run timestamp
const BASENAME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Full,
    Delta,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMode::Full => f.write_str("full"),
            BackupMode::Delta => f.write_str("delta"),
        }
    }
}

/// Identity of the VM being backed up. Fields other than the uuid are
/// carried verbatim into the metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_label: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VmDescriptor {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name_label: None,
            extra: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name_label = Some(name.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct BackupJob {
    pub id: String,
    pub mode: BackupMode,
    pub settings: JobSettings,
}

/// Everything a writer knows about the run besides the data itself
#[derive(Debug, Clone)]
pub struct VmBackupContext {
    pub job: BackupJob,
    pub schedule_id: String,
    pub vm: VmDescriptor,
    /// Point-in-time descriptor of the exported snapshot
    pub exported_vm: Value,
}

/// Output of the VM export
pub struct ExportedBackup {
    /// Run time, seconds since the epoch
    pub timestamp: i64,
    /// Updated as bytes flow through the writer
    pub size: SizeContainer,
    pub stream: ByteStream,
}

impl ExportedBackup {
    pub fn new(timestamp: i64, stream: ByteStream) -> Self {
        Self {
            timestamp,
            size: SizeContainer::new(),
            stream,
        }
    }
}

/// Basename of the files written by a run, e.g. `20240315T020000Z`
pub fn basename(timestamp: i64) -> Result<String> {
    let time = DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| BackupError::Metadata(format!("timestamp {} out of range", timestamp)))?;
    Ok(time.format(BASENAME_FORMAT).to_string())
}

/// Backup directory of a VM
pub fn vm_backup_dir(vm_uuid: &str) -> Result<String> {
    if vm_uuid.is_empty() || vm_uuid.contains('/') || vm_uuid.starts_with('.') {
        return Err(BackupError::InvalidPath(format!("invalid VM uuid '{}'", vm_uuid)));
    }
    Ok(format!("{}/{}", BACKUP_ROOT, vm_uuid))
}
