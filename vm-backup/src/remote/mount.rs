//! NFS and SMB remotes backed by a local mount point.

use super::local::{create_dir_all, LocalHandler};
use super::{
    ArtifactValidator, EntryStream, NamePredicate, OutputFileOptions, OutputStats, RemoteHandler,
    RemoteKind,
};
use crate::transfer::ByteStream;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

const MOUNTS_FILE: &str = "/proc/self/mounts";

#[derive(Error, Debug)]
pub enum MountError {
    #[error("already mounted")]
    AlreadyMounted,

    #[error("not mounted")]
    NotMounted,

    #[error("{0}")]
    Failed(String),
}

/// Everything needed to mount one remote
#[derive(Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub fstype: String,
    pub source: String,
    pub target: PathBuf,
    pub options: Vec<String>,
    /// Extra environment for the mount helper (credentials)
    pub env: Vec<(String, String)>,
}

// Keeps credentials out of logs
impl fmt::Debug for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountSpec")
            .field("fstype", &self.fstype)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("options", &self.options)
            .finish()
    }
}

impl MountSpec {
    /// `mount -t nfs [-o options] host:/path target`
    pub fn nfs(host: &str, path: &str, target: PathBuf, options: Option<&str>) -> Self {
        Self {
            fstype: "nfs".to_string(),
            source: format!("{}:/{}", host, path.trim_start_matches('/')),
            target,
            options: split_options(options),
            env: Vec::new(),
        }
    }

    /// `mount -t cifs //host/share target -o username=..,domain=..`, password through `PASSWD`
    pub fn smb(
        host: &str,
        share: &str,
        target: PathBuf,
        username: Option<&str>,
        password: Option<&str>,
        domain: Option<&str>,
        options: Option<&str>,
    ) -> Self {
        let mut opts = Vec::new();
        if let Some(user) = username {
            opts.push(format!("username={}", user));
        }
        if let Some(domain) = domain {
            opts.push(format!("domain={}", domain));
        }
        opts.extend(split_options(options));

        Self {
            fstype: "cifs".to_string(),
            source: format!("//{}/{}", host, share.trim_start_matches('/')),
            target,
            options: opts,
            env: password
                .map(|p| vec![("PASSWD".to_string(), p.to_string())])
                .unwrap_or_default(),
        }
    }

    /// Arguments passed to `mount`
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-t".to_string(), self.fstype.clone()];
        if !self.options.is_empty() {
            args.push("-o".to_string());
            args.push(self.options.join(","));
        }
        args.push(self.source.clone());
        args.push(self.target.to_string_lossy().into_owned());
        args
    }
}

fn split_options(options: Option<&str>) -> Vec<String> {
    options
        .map(|o| {
            o.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Mount table access
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn is_mounted(&self, target: &Path) -> Result<bool>;

    async fn mount(&self, spec: &MountSpec) -> std::result::Result<(), MountError>;

    async fn unmount(&self, target: &Path) -> std::result::Result<(), MountError>;
}

/// Mounts through the system `mount` helper
#[derive(Debug, Default, Clone)]
pub struct SystemMounter;

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_mounted(&self, target: &Path) -> Result<bool> {
        let table = tokio::fs::read_to_string(MOUNTS_FILE).await?;
        Ok(mount_table_contains(&table, target))
    }

    async fn mount(&self, spec: &MountSpec) -> std::result::Result<(), MountError> {
        let output = Command::new("mount")
            .args(spec.args())
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .map_err(|e| MountError::Failed(format!("mount {}: {}", spec.source, e)))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("already mounted") {
            return Err(MountError::AlreadyMounted);
        }
        Err(MountError::Failed(format!(
            "mount {} failed with exit code {}: {}",
            spec.source,
            output.status.code().unwrap_or(1),
            stderr.trim()
        )))
    }

    #[cfg(target_os = "linux")]
    async fn unmount(&self, target: &Path) -> std::result::Result<(), MountError> {
        use nix::errno::Errno;
        use nix::mount::{umount2, MntFlags};

        let path = target.to_path_buf();
        let result = tokio::task::spawn_blocking(move || umount2(path.as_path(), MntFlags::empty()))
            .await
            .map_err(|e| MountError::Failed(e.to_string()))?;

        match result {
            Ok(()) => Ok(()),
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => Err(MountError::NotMounted),
            Err(e) => Err(MountError::Failed(format!("umount {}: {}", target.display(), e))),
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn unmount(&self, target: &Path) -> std::result::Result<(), MountError> {
        let output = Command::new("umount")
            .arg(target)
            .output()
            .await
            .map_err(|e| MountError::Failed(format!("umount {}: {}", target.display(), e)))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("not mounted") || stderr.contains("not currently mounted") {
            return Err(MountError::NotMounted);
        }
        Err(MountError::Failed(stderr.trim().to_string()))
    }
}

/// Whether `target` is a mount point in a `/proc/self/mounts` style table
pub fn mount_table_contains(table: &str, target: &Path) -> bool {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| Path::new(&unescape_mount_field(mount_point)) == target)
}

/// Decode the octal escapes (`\040` for space, ...) used in the mount table
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// NFS or SMB remote. File operations run against the mount point once
/// [`RemoteHandler::sync`] mounted it.
pub struct MountHandler {
    id: String,
    kind: RemoteKind,
    enabled: bool,
    spec: MountSpec,
    mounter: Arc<dyn Mounter>,
    local: LocalHandler,
}

impl MountHandler {
    pub fn new(
        id: impl Into<String>,
        kind: RemoteKind,
        enabled: bool,
        spec: MountSpec,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        let id = id.into();
        let local = LocalHandler::new(id.clone(), spec.target.clone());
        Self {
            id,
            kind,
            enabled,
            spec,
            mounter,
            local,
        }
    }

    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.local = self.local.with_dir_mode(mode);
        self
    }

    pub fn mount_point(&self) -> &Path {
        &self.spec.target
    }

    fn unavailable(&self, message: impl Into<String>) -> BackupError {
        BackupError::RemoteUnavailable {
            remote: self.id.clone(),
            message: message.into(),
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(self.unavailable("remote is disabled"))
        }
    }
}

#[async_trait]
impl RemoteHandler for MountHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> RemoteKind {
        self.kind
    }

    async fn sync(&self) -> Result<()> {
        let target = &self.spec.target;
        let mounted = self
            .mounter
            .is_mounted(target)
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        if self.enabled && !mounted {
            create_dir_all(target, 0o700).await?;
            info!(remote = %self.id, source = %self.spec.source, target = %target.display(), "Mounting remote");
            match self.mounter.mount(&self.spec).await {
                Ok(()) => {}
                Err(MountError::AlreadyMounted) => {
                    debug!(remote = %self.id, "Remote already mounted");
                }
                Err(e) => return Err(self.unavailable(e.to_string())),
            }
        } else if !self.enabled && mounted {
            info!(remote = %self.id, target = %target.display(), "Unmounting disabled remote");
            match self.mounter.unmount(target).await {
                Ok(()) | Err(MountError::NotMounted) => {}
                Err(e) => return Err(self.unavailable(e.to_string())),
            }
        }
        Ok(())
    }

    async fn forget(&self) {
        let target = &self.spec.target;
        match self.mounter.unmount(target).await {
            Ok(()) => debug!(remote = %self.id, "Remote unmounted"),
            Err(MountError::NotMounted) => {}
            Err(e) => warn!(remote = %self.id, error = %e, "Failed to unmount remote"),
        }
    }

    async fn output_stream(
        &self,
        path: &str,
        stream: ByteStream,
        validator: Option<&dyn ArtifactValidator>,
    ) -> Result<OutputStats> {
        self.ensure_enabled()?;
        self.local.output_stream(path, stream, validator).await
    }

    async fn output_file(&self, path: &str, content: &[u8], options: OutputFileOptions) -> Result<()> {
        self.ensure_enabled()?;
        self.local.output_file(path, content, options).await
    }

    async fn list_directory(&self, path: &str, predicate: Option<NamePredicate>) -> Result<EntryStream> {
        self.ensure_enabled()?;
        self.local.list_directory(path, predicate).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.ensure_enabled()?;
        self.local.read_file(path).await
    }

    async fn create_read_stream(&self, path: &str) -> Result<ByteStream> {
        self.ensure_enabled()?;
        self.local.create_read_stream(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.ensure_enabled()?;
        self.local.exists(path).await
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        self.ensure_enabled()?;
        self.local.unlink(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.ensure_enabled()?;
        self.local.rename(from, to).await
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        self.local.local_path(path)
    }
}
