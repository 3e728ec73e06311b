//! Local directory remote.

use super::{
    normalize, temp_path, ArtifactValidator, EntryStream, NamePredicate, OutputFileOptions,
    OutputStats, RemoteHandler, RemoteKind,
};
use crate::transfer::{stream_from_reader, ByteStream};
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const DEFAULT_DIR_MODE: u32 = 0o700;

/// Remote rooted at a directory of the local filesystem.
///
/// Also backs mounted remotes, with the mount point as root.
#[derive(Debug, Clone)]
pub struct LocalHandler {
    id: String,
    root: PathBuf,
    dir_mode: u32,
}

impl LocalHandler {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            dir_mode: DEFAULT_DIR_MODE,
        }
    }

    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let path = normalize(path)?;
        Ok(if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        })
    }

    async fn ensure_parent(&self, target: &Path, mode: u32) -> Result<()> {
        if let Some(parent) = target.parent() {
            create_dir_all(parent, mode).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteHandler for LocalHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> RemoteKind {
        RemoteKind::Local
    }

    async fn sync(&self) -> Result<()> {
        create_dir_all(&self.root, self.dir_mode).await
    }

    async fn forget(&self) {}

    async fn output_stream(
        &self,
        path: &str,
        stream: ByteStream,
        validator: Option<&dyn ArtifactValidator>,
    ) -> Result<OutputStats> {
        let path = normalize(path)?;
        let target = self.full_path(&path)?;
        self.ensure_parent(&target, self.dir_mode).await?;

        let temp = temp_path(&path);
        let temp_full = self.full_path(&temp)?;

        let size = match write_stream(&temp_full, stream).await {
            Ok(size) => size,
            Err(e) => {
                discard(&temp_full).await;
                return Err(e);
            }
        };

        if let Some(validator) = validator {
            if let Err(e) = validator.validate(self, &temp).await {
                discard(&temp_full).await;
                return Err(e);
            }
        }

        if let Err(e) = fs::rename(&temp_full, &target).await {
            discard(&temp_full).await;
            return Err(e.into());
        }

        debug!(remote = %self.id, path = %path, size, "Stream written");
        Ok(OutputStats { size })
    }

    async fn output_file(&self, path: &str, content: &[u8], options: OutputFileOptions) -> Result<()> {
        let path = normalize(path)?;
        let target = self.full_path(&path)?;
        self.ensure_parent(&target, options.dir_mode.unwrap_or(self.dir_mode))
            .await?;

        let temp_full = self.full_path(&temp_path(&path))?;
        let written = async {
            let mut file = fs::File::create(&temp_full).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
            fs::rename(&temp_full, &target).await
        }
        .await;

        if let Err(e) = written {
            discard(&temp_full).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn list_directory(&self, path: &str, predicate: Option<NamePredicate>) -> Result<EntryStream> {
        let dir = self.full_path(path)?;
        let entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(futures_util::stream::empty().boxed());
            }
            Err(e) => return Err(e.into()),
        };

        let stream = futures_util::stream::try_unfold(
            (entries, predicate),
            |(mut entries, predicate)| async move {
                let next = next_matching(&mut entries, predicate.as_ref()).await;
                next.map(|name| name.map(|name| (name, (entries, predicate))))
            },
        );
        Ok(stream.boxed())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.full_path(path)?).await?)
    }

    async fn create_read_stream(&self, path: &str) -> Result<ByteStream> {
        let file = fs::File::open(self.full_path(path)?).await?;
        Ok(stream_from_reader(file))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)?).await?)
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path)?).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = self.full_path(from)?;
        let to = self.full_path(to)?;
        self.ensure_parent(&to, self.dir_mode).await?;
        fs::rename(from, to).await?;
        Ok(())
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        self.full_path(path).ok()
    }
}

async fn next_matching(
    entries: &mut fs::ReadDir,
    predicate: Option<&NamePredicate>,
) -> Result<Option<String>> {
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if predicate.map_or(true, |p| p(name.as_str())) {
            return Ok(Some(name));
        }
    }
    Ok(None)
}

async fn write_stream(path: &Path, mut stream: ByteStream) -> Result<u64> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let mut size = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

pub(crate) async fn create_dir_all(path: &Path, mode: u32) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path).await?;
    Ok(())
}
