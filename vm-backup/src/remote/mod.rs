//! Remote storage handlers.
//!
//! Every storage destination (local directory, NFS export, SMB share, object
//! store bucket) is reached through the [`RemoteHandler`] trait. Paths given
//! to a handler are relative, `/`-separated and never contain `..`.

pub mod local;
pub mod mount;
pub mod object;
pub mod registry;
pub mod session;
pub mod validate;

pub use local::LocalHandler;
pub use mount::{MountError, MountHandler, MountSpec, Mounter, SystemMounter};
pub use object::ObjectStoreHandler;
pub use registry::RemoteRegistry;
pub use session::RemoteSession;
pub use validate::{ArtifactValidator, ImageValidator, XvaValidator};

use crate::transfer::ByteStream;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Storage backend flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    Local,
    Nfs,
    Smb,
    S3,
}

impl fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteKind::Local => "local",
            RemoteKind::Nfs => "nfs",
            RemoteKind::Smb => "smb",
            RemoteKind::S3 => "s3",
        };
        f.write_str(name)
    }
}

/// Result of a streamed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputStats {
    /// Bytes written
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputFileOptions {
    /// Mode for parent directories created by the write
    pub dir_mode: Option<u32>,
}

/// Filter applied to entry names by [`RemoteHandler::list_directory`]
pub type NamePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Lazy sequence of entry names
pub type EntryStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait RemoteHandler: Send + Sync {
    /// Configured remote id
    fn id(&self) -> &str;

    fn kind(&self) -> RemoteKind;

    /// Bring the connection or mount in line with the enabled state.
    /// Safe to call repeatedly.
    async fn sync(&self) -> Result<()>;

    /// Best effort teardown, errors are logged and swallowed
    async fn forget(&self);

    /// Write `stream` to `path` through a temporary file that only becomes
    /// visible under `path` once the stream ended and `validator` accepted it
    async fn output_stream(
        &self,
        path: &str,
        stream: ByteStream,
        validator: Option<&dyn ArtifactValidator>,
    ) -> Result<OutputStats>;

    /// Atomically replace `path` with `content`
    async fn output_file(&self, path: &str, content: &[u8], options: OutputFileOptions) -> Result<()>;

    /// Names of the entries of `path` accepted by `predicate`.
    /// A missing directory yields nothing.
    async fn list_directory(&self, path: &str, predicate: Option<NamePredicate>) -> Result<EntryStream>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn create_read_stream(&self, path: &str) -> Result<ByteStream>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn unlink(&self, path: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Local filesystem location of `path`, for backends that have one
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// Check and canonicalize a relative remote path
pub fn normalize(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(BackupError::InvalidPath(path.to_string())),
            p if p.contains('\0') => return Err(BackupError::InvalidPath(path.to_string())),
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Directory part of `path`, empty for top-level entries
pub fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

/// Hidden sibling used while `path` is being written
pub fn temp_path(path: &str) -> String {
    join(
        parent_dir(path),
        &format!(".{}.{}.tmp", file_name(path), uuid::Uuid::new_v4().simple()),
    )
}

pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}
