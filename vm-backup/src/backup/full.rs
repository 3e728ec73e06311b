//! Full backups: one self-contained XVA archive per run.

use super::adapter::RemoteAdapter;
use super::metadata::BackupMetadata;
use super::writer::{BackupOutcome, BackupWriter, RunSpec, WriterCore, WriterState};
use super::{BackupMode, ExportedBackup, VmBackupContext, XVA_EXTENSION};
use crate::remote::XvaValidator;
use crate::task::Task;
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct FullBackupWriter {
    core: WriterCore,
}

impl FullBackupWriter {
    pub fn new(adapter: RemoteAdapter, context: VmBackupContext) -> Self {
        Self {
            core: WriterCore::new(adapter, context),
        }
    }
}

#[async_trait]
impl BackupWriter for FullBackupWriter {
    fn mode(&self) -> BackupMode {
        BackupMode::Full
    }

    fn state(&self) -> WriterState {
        self.core.state()
    }

    async fn run(&self, task: &Task, export: ExportedBackup) -> Result<BackupOutcome> {
        let context = self.core.context().clone();
        self.core
            .run(task, export, BackupMode::Full, move |_| {
                Ok(RunSpec {
                    extension: XVA_EXTENSION,
                    validator: Arc::new(XvaValidator),
                    deferred: None,
                    metadata: Box::new(move |timestamp, basename, size| {
                        Ok(BackupMetadata::full(&context, timestamp, basename, size))
                    }),
                })
            })
            .await
    }
}
