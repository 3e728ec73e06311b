//! Remote type registry.

use super::{
    LocalHandler, MountHandler, MountSpec, Mounter, ObjectStoreHandler, RemoteHandler, RemoteKind,
    SystemMounter,
};
use crate::config::{Config, RemoteConfig};
use crate::utils::errors::{BackupError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Settings shared by every handler built from one registry
#[derive(Clone)]
pub struct BuildContext {
    pub mount_root: PathBuf,
    pub dir_mode: u32,
    pub mounter: Arc<dyn Mounter>,
}

impl BuildContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mount_root: config.node.mount_root.clone(),
            dir_mode: config.defaults.dir_mode,
            mounter: Arc::new(SystemMounter),
        }
    }
}

pub type Constructor = Arc<dyn Fn(&RemoteConfig, &BuildContext) -> Result<Arc<dyn RemoteHandler>> + Send + Sync>;

/// Maps a remote `type` tag to the constructor of its handler
#[derive(Clone)]
pub struct RemoteRegistry {
    context: BuildContext,
    constructors: HashMap<String, Constructor>,
}

impl RemoteRegistry {
    /// Registry with the built-in local, nfs, smb and s3 backends
    pub fn new(context: BuildContext) -> Self {
        let mut registry = Self {
            context,
            constructors: HashMap::new(),
        };
        registry.register("local", Arc::new(build_local));
        registry.register("file", Arc::new(build_local));
        registry.register("nfs", Arc::new(build_nfs));
        registry.register("smb", Arc::new(build_smb));
        registry.register("s3", Arc::new(build_s3));
        registry
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(BuildContext::from_config(config))
    }

    pub fn register(&mut self, tag: impl Into<String>, constructor: Constructor) {
        self.constructors.insert(tag.into(), constructor);
    }

    pub fn build(&self, remote: &RemoteConfig) -> Result<Arc<dyn RemoteHandler>> {
        let constructor = self
            .constructors
            .get(remote.kind.as_str())
            .ok_or_else(|| BackupError::UnsupportedRemote(remote.kind.clone()))?;
        constructor(remote, &self.context)
    }
}

fn required<'a>(remote: &'a RemoteConfig, field: &str, value: &'a Option<String>) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BackupError::Config(format!("remote '{}' is missing '{}'", remote.id, field)))
}

fn build_local(remote: &RemoteConfig, ctx: &BuildContext) -> Result<Arc<dyn RemoteHandler>> {
    let path = required(remote, "path", &remote.path)?;
    Ok(Arc::new(
        LocalHandler::new(remote.id.clone(), path).with_dir_mode(ctx.dir_mode),
    ))
}

fn build_nfs(remote: &RemoteConfig, ctx: &BuildContext) -> Result<Arc<dyn RemoteHandler>> {
    let spec = MountSpec::nfs(
        required(remote, "host", &remote.host)?,
        required(remote, "path", &remote.path)?,
        ctx.mount_root.join(&remote.id),
        remote.options.as_deref(),
    );
    Ok(Arc::new(
        MountHandler::new(remote.id.clone(), RemoteKind::Nfs, remote.enabled, spec, Arc::clone(&ctx.mounter))
            .with_dir_mode(ctx.dir_mode),
    ))
}

fn build_smb(remote: &RemoteConfig, ctx: &BuildContext) -> Result<Arc<dyn RemoteHandler>> {
    let spec = MountSpec::smb(
        required(remote, "host", &remote.host)?,
        required(remote, "share", &remote.share)?,
        ctx.mount_root.join(&remote.id),
        remote.username.as_deref(),
        remote.password.as_deref(),
        remote.domain.as_deref(),
        remote.options.as_deref(),
    );
    Ok(Arc::new(
        MountHandler::new(remote.id.clone(), RemoteKind::Smb, remote.enabled, spec, Arc::clone(&ctx.mounter))
            .with_dir_mode(ctx.dir_mode),
    ))
}

fn build_s3(remote: &RemoteConfig, _ctx: &BuildContext) -> Result<Arc<dyn RemoteHandler>> {
    Ok(Arc::new(ObjectStoreHandler::s3(remote)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mount::tests::FakeMounter;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> RemoteRegistry {
        RemoteRegistry::new(BuildContext {
            mount_root: dir.path().join("mounts"),
            dir_mode: 0o700,
            mounter: Arc::new(FakeMounter::default()),
        })
    }

    fn remote(id: &str, kind: &str) -> RemoteConfig {
        RemoteConfig {
            id: id.to_string(),
            kind: kind.to_string(),
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_builds_by_type_tag() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let local = registry
            .build(&RemoteConfig {
                path: Some(dir.path().join("backups").to_string_lossy().into_owned()),
                ..remote("disk", "file")
            })
            .unwrap();
        assert_eq!(local.kind(), RemoteKind::Local);
        assert_eq!(local.id(), "disk");

        let nfs = registry
            .build(&RemoteConfig {
                host: Some("nas.lan".into()),
                path: Some("/export".into()),
                ..remote("nas", "nfs")
            })
            .unwrap();
        assert_eq!(nfs.kind(), RemoteKind::Nfs);
        assert_eq!(nfs.local_path("a.json").unwrap(), dir.path().join("mounts/nas/a.json"));

        let s3 = registry
            .build(&RemoteConfig {
                bucket: Some("vm-backups".into()),
                region: Some("us-east-1".into()),
                ..remote("bucket", "s3")
            })
            .unwrap();
        assert_eq!(s3.kind(), RemoteKind::S3);
        assert!(s3.local_path("a.json").is_none());
    }

    #[test]
    fn test_unknown_type_and_missing_fields() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        assert!(matches!(
            registry.build(&remote("x", "ftp")),
            Err(BackupError::UnsupportedRemote(kind)) if kind == "ftp"
        ));
        assert!(matches!(registry.build(&remote("smb", "smb")), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_register_custom_backend() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry(&dir);
        let root = dir.path().join("custom");
        registry.register(
            "scratch",
            Arc::new(move |remote: &RemoteConfig, _: &BuildContext| {
                Ok::<_, BackupError>(Arc::new(LocalHandler::new(remote.id.clone(), root.clone())) as Arc<dyn RemoteHandler>)
            }),
        );
        assert_eq!(registry.build(&remote("tmp", "scratch")).unwrap().id(), "tmp");
    }
}
