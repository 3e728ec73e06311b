//! Object storage remote (S3 and compatible).

use super::{
    normalize, temp_path, ArtifactValidator, EntryStream, NamePredicate, OutputFileOptions,
    OutputStats, RemoteHandler, RemoteKind,
};
use crate::config::RemoteConfig;
use crate::transfer::ByteStream;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use futures_util::{stream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Parts uploaded in parallel by a streaming write
const UPLOAD_CONCURRENCY: usize = 4;

/// Names buffered ahead of a directory listing consumer
const LIST_BUFFER: usize = 64;

pub struct ObjectStoreHandler {
    id: String,
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreHandler {
    pub fn new(id: impl Into<String>, store: Arc<dyn ObjectStore>, prefix: Option<&str>) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            store,
            prefix: normalize(prefix.unwrap_or(""))?,
        })
    }

    /// Build an S3 client from a remote definition. Credentials not given in
    /// the configuration are taken from the usual `AWS_*` environment.
    pub fn s3(config: &RemoteConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .as_deref()
            .ok_or_else(|| BackupError::Config(format!("remote '{}' has no bucket", config.id)))?;

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_allow_http(config.allow_http);
        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key) = &config.username {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &config.password {
            builder = builder.with_secret_access_key(secret);
        }

        Self::new(config.id.clone(), Arc::new(builder.build()?), config.prefix.as_deref())
    }

    fn key(&self, path: &str) -> Result<ObjectPath> {
        let path = normalize(path)?;
        let full = match (self.prefix.is_empty(), path.is_empty()) {
            (true, _) => path,
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, path),
        };
        ObjectPath::parse(&full).map_err(|e| BackupError::InvalidPath(e.to_string()))
    }

    async fn discard(&self, key: &ObjectPath) {
        if let Err(e) = self.store.delete(key).await {
            warn!(remote = %self.id, key = %key, error = %e, "Failed to remove temporary object");
        }
    }

    async fn upload(&self, key: &ObjectPath, mut stream: ByteStream) -> Result<u64> {
        let upload = self.store.put_multipart(key).await?;
        let mut writer = WriteMultipart::new(upload);
        let mut size = 0u64;

        let written: Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                size += chunk.len() as u64;
                writer.wait_for_capacity(UPLOAD_CONCURRENCY).await?;
                writer.put(chunk);
            }
            Ok(())
        }
        .await;

        if let Err(e) = written {
            if let Err(abort) = writer.abort().await {
                warn!(remote = %self.id, key = %key, error = %abort, "Failed to abort upload");
            }
            return Err(e);
        }
        writer.finish().await?;
        Ok(size)
    }
}

#[async_trait]
impl RemoteHandler for ObjectStoreHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> RemoteKind {
        RemoteKind::S3
    }

    async fn sync(&self) -> Result<()> {
        // Stateless client, nothing to bring up
        Ok(())
    }

    async fn forget(&self) {}

    async fn output_stream(
        &self,
        path: &str,
        stream: ByteStream,
        validator: Option<&dyn ArtifactValidator>,
    ) -> Result<OutputStats> {
        let path = normalize(path)?;
        let target = self.key(&path)?;
        let temp = temp_path(&path);
        let temp_key = self.key(&temp)?;

        let size = match self.upload(&temp_key, stream).await {
            Ok(size) => size,
            Err(e) => {
                self.discard(&temp_key).await;
                return Err(e);
            }
        };

        if let Some(validator) = validator {
            if let Err(e) = validator.validate(self, &temp).await {
                self.discard(&temp_key).await;
                return Err(e);
            }
        }

        if let Err(e) = self.store.rename(&temp_key, &target).await {
            self.discard(&temp_key).await;
            return Err(e.into());
        }

        debug!(remote = %self.id, key = %target, size, "Object written");
        Ok(OutputStats { size })
    }

    async fn output_file(&self, path: &str, content: &[u8], _options: OutputFileOptions) -> Result<()> {
        // Single PUTs are atomic, there are no directories to create
        self.store
            .put(&self.key(path)?, PutPayload::from(content.to_vec()))
            .await?;
        Ok(())
    }

    /// Keys are listed page by page as the stream is consumed; the names
    /// of nested keys are folded into their first path segment.
    async fn list_directory(&self, path: &str, predicate: Option<NamePredicate>) -> Result<EntryStream> {
        let dir = self.key(path)?;
        let store = Arc::clone(&self.store);
        let (tx, rx) = mpsc::channel::<Result<String>>(LIST_BUFFER);

        tokio::spawn(async move {
            let prefix = (!dir.as_ref().is_empty()).then_some(&dir);
            let mut objects = store.list(prefix);
            let mut seen = HashSet::new();
            while let Some(item) = objects.next().await {
                let name = match item {
                    Ok(meta) => match child_name(&dir, &meta.location) {
                        Some(name) if seen.insert(name.clone()) => name,
                        _ => continue,
                    },
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                if predicate.as_ref().map_or(true, |p| p(&name)) && tx.send(Ok(name)).await.is_err() {
                    // consumer went away
                    return;
                }
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let result = self.store.get(&self.key(path)?).await?;
        Ok(result.bytes().await?.to_vec())
    }

    async fn create_read_stream(&self, path: &str) -> Result<ByteStream> {
        let result = self.store.get(&self.key(path)?).await?;
        Ok(result.into_stream().map_err(std::io::Error::other).boxed())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.store.head(&self.key(path)?).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let key = self.key(path)?;
        // Deleting a missing key succeeds on S3, report it like a filesystem would
        self.store.head(&key).await?;
        self.store.delete(&key).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.store.rename(&self.key(from)?, &self.key(to)?).await?;
        Ok(())
    }
}

/// First segment of `location` below `dir`
fn child_name(dir: &ObjectPath, location: &ObjectPath) -> Option<String> {
    location.prefix_match(dir)?.next().map(|part| part.as_ref().to_string())
}
