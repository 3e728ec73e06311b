//! Delta backups: block images chained to the previous backup of the schedule.
//!
//! A run writes an image whose parent is the image of the newest existing
//! delta backup, or a base image when there is none. Pruning merges removed
//! links into the oldest surviving backup so every chain stays restorable.

use super::adapter::{BackupEntry, RemoteAdapter};
use super::metadata::BackupMetadata;
use super::writer::{BackupOutcome, BackupWriter, RunSpec, WriterCore, WriterState};
use super::{BackupMode, ExportedBackup, VmBackupContext};
use crate::image::IMAGE_EXTENSION;
use crate::remote::ImageValidator;
use crate::task::Task;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub struct DeltaBackupWriter {
    core: WriterCore,
}

impl DeltaBackupWriter {
    pub fn new(adapter: RemoteAdapter, context: VmBackupContext) -> Self {
        Self {
            core: WriterCore::new(adapter, context),
        }
    }

    /// Backup the next image has to be diffed against, `None` when a base
    /// image is expected
    pub async fn chain_parent(&self) -> Result<Option<BackupEntry>> {
        Ok(self.core.prepare(BackupMode::Delta).await?.pop())
    }
}

fn image_uuid(entry: &BackupEntry) -> Result<Uuid> {
    entry
        .metadata
        .image_uuid
        .ok_or_else(|| BackupError::Metadata(format!("{} has no image uuid", entry.metadata_path)))
}

#[async_trait]
impl BackupWriter for DeltaBackupWriter {
    fn mode(&self) -> BackupMode {
        BackupMode::Delta
    }

    fn state(&self) -> WriterState {
        self.core.state()
    }

    async fn run(&self, task: &Task, export: ExportedBackup) -> Result<BackupOutcome> {
        let context = self.core.context().clone();
        self.core
            .run(task, export, BackupMode::Delta, move |entries| {
                let (expected_parent, parent_ref, deferred) = match entries.last() {
                    Some(parent) => (
                        Some(image_uuid(parent)?),
                        parent.metadata.image.clone(),
                        Some(parent.metadata_path.clone()),
                    ),
                    None => (None, None, None),
                };

                let validator = Arc::new(ImageValidator::new().expect_parent(expected_parent));
                let header = Arc::clone(&validator);
                Ok(RunSpec {
                    extension: IMAGE_EXTENSION,
                    validator,
                    deferred,
                    metadata: Box::new(move |timestamp, basename, size| {
                        let header = header
                            .header()
                            .ok_or_else(|| BackupError::InvalidImage("image was not validated".into()))?;
                        Ok(BackupMetadata::delta(&context, timestamp, basename, size, header.uuid, parent_ref))
                    }),
                })
            })
            .await
    }
}
