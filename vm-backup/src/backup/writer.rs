//! Shared state machine of a backup run.
//!
//! `Init → Export → Validate → WriteMetadata → Prune → Done`, any step may
//! end in `Failed`. The variants only differ in the artifact they write and
//! the metadata they commit.

use super::adapter::{BackupEntry, RemoteAdapter};
use super::metadata::BackupMetadata;
use super::{basename, vm_backup_dir, BackupMode, ExportedBackup, VmBackupContext};
use crate::remote::{join, ArtifactValidator, RemoteHandler};
use crate::retention::select_stale;
use crate::task::{Task, TaskDescriptor};
use crate::transfer::progress::TransferStats;
use crate::transfer::progress_stream::{ProgressCallback, ProgressStream};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WriterState {
    Init,
    Export,
    Validate,
    WriteMetadata,
    Prune,
    Done,
    Failed,
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    pub basename: String,
    pub size: u64,
    pub metadata_path: String,
    /// Old backups removed by this run
    pub deleted: usize,
    /// Pruning failures, the new backup is valid regardless
    pub prune_errors: Vec<String>,
}

/// One backup run of one VM against one remote
#[async_trait]
pub trait BackupWriter: Send + Sync {
    fn mode(&self) -> BackupMode;

    fn state(&self) -> WriterState;

    async fn run(&self, task: &Task, export: ExportedBackup) -> Result<BackupOutcome>;
}

/// Builds the metadata committed for `(timestamp, basename, size)`
pub(crate) type MetadataFn = Box<dyn FnOnce(i64, &str, u64) -> Result<BackupMetadata> + Send>;

/// What a variant contributes to a run, planned from the existing backups
pub(crate) struct RunSpec {
    pub extension: &'static str,
    pub validator: Arc<dyn ArtifactValidator>,
    /// Metadata path of an entry that must survive until the new one is committed
    pub deferred: Option<String>,
    pub metadata: MetadataFn,
}

/// Directory layout, retention, pruning and state tracking shared by the writers
pub struct WriterCore {
    adapter: RemoteAdapter,
    context: VmBackupContext,
    state: Mutex<WriterState>,
}

impl WriterCore {
    pub fn new(adapter: RemoteAdapter, context: VmBackupContext) -> Self {
        Self {
            adapter,
            context,
            state: Mutex::new(WriterState::Init),
        }
    }

    pub fn adapter(&self) -> &RemoteAdapter {
        &self.adapter
    }

    pub fn context(&self) -> &VmBackupContext {
        &self.context
    }

    pub fn state(&self) -> WriterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WriterState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn backup_dir(&self) -> Result<String> {
        vm_backup_dir(&self.context.vm.uuid)
    }

    /// Committed backups of this VM and schedule in `mode`, oldest first
    pub async fn matching_entries(&self, mode: BackupMode) -> Result<Vec<BackupEntry>> {
        let schedule = self.context.schedule_id.as_str();
        self.adapter
            .list_vm_backups(&self.context.vm.uuid, |m| m.mode == mode && m.schedule_id == schedule)
            .await
    }

    /// Mount the remote when needed, then list what is already there
    pub async fn prepare(&self, mode: BackupMode) -> Result<Vec<BackupEntry>> {
        self.adapter.handler().sync().await?;
        self.matching_entries(mode).await
    }

    /// Run the state machine; `plan` sees the committed backups of the
    /// schedule, oldest first, once the remote is reachable
    pub(crate) async fn run<P>(&self, task: &Task, export: ExportedBackup, mode: BackupMode, plan: P) -> Result<BackupOutcome>
    where
        P: FnOnce(&[BackupEntry]) -> Result<RunSpec> + Send,
    {
        let result = self.run_steps(task, export, mode, plan).await;
        match &result {
            Ok(outcome) => {
                self.set_state(WriterState::Done);
                task.set_result(json!({ "size": outcome.size, "basename": outcome.basename }));
            }
            Err(e) => {
                error!(
                    remote = %self.adapter.handler().id(),
                    vm = %self.context.vm.uuid,
                    state = ?self.state(),
                    error = %e,
                    "Backup run failed"
                );
                self.set_state(WriterState::Failed);
            }
        }
        result
    }

    async fn run_steps<P>(&self, task: &Task, export: ExportedBackup, mode: BackupMode, plan: P) -> Result<BackupOutcome>
    where
        P: FnOnce(&[BackupEntry]) -> Result<RunSpec> + Send,
    {
        self.set_state(WriterState::Init);
        let entries = self.prepare(mode).await?;
        let spec = plan(&entries)?;

        let settings = self.context.job.settings;
        let basename = basename(export.timestamp)?;
        let dir = self.backup_dir()?;

        let stale = select_stale(&entries, settings.export_retention);
        let (before, after): (Vec<BackupEntry>, Vec<BackupEntry>) = if settings.delete_first {
            stale
                .iter()
                .cloned()
                .partition(|e| spec.deferred.as_deref() != Some(e.metadata_path.as_str()))
        } else {
            (Vec::new(), stale.to_vec())
        };

        let mut deleted = 0;
        let mut prune_errors = Vec::new();
        if !before.is_empty() {
            self.set_state(WriterState::Prune);
            let (count, errors) = self.prune(task, mode, &before).await;
            deleted += count;
            prune_errors.extend(errors);
        }

        self.set_state(WriterState::Export);
        let path = join(&dir, &format!("{}.{}", basename, spec.extension));
        let size = self.transfer(task, &path, export.stream, export.size, spec.validator.as_ref()).await?;

        self.set_state(WriterState::WriteMetadata);
        let record = (spec.metadata)(export.timestamp, &basename, size)?;
        let metadata_path = self
            .adapter
            .write_vm_backup_metadata(&dir, &basename, &record)
            .await?;
        info!(
            remote = %self.adapter.handler().id(),
            vm = %self.context.vm.uuid,
            backup = %basename,
            size = size,
            "Backup committed"
        );

        if !after.is_empty() {
            self.set_state(WriterState::Prune);
            let (count, errors) = self.prune(task, mode, &after).await;
            deleted += count;
            prune_errors.extend(errors);
        }

        Ok(BackupOutcome {
            basename,
            size,
            metadata_path,
            deleted,
            prune_errors,
        })
    }

    async fn transfer(
        &self,
        task: &Task,
        path: &str,
        stream: crate::transfer::ByteStream,
        size: crate::transfer::SizeContainer,
        validator: &dyn ArtifactValidator,
    ) -> Result<u64> {
        let descriptor = TaskDescriptor::new("transfer").with_data(json!({ "path": path }));
        task.run_child(descriptor, |transfer| async move {
            let started = Instant::now();
            let reporter = transfer.clone();
            let callback: ProgressCallback = Arc::new(move |bytes| {
                reporter.info("progress", json!({ "bytes": bytes }));
            });
            let stream = Box::pin(ProgressStream::new(stream, size).with_callback(callback));

            let validator = StateValidator {
                core: self,
                inner: validator,
            };
            let stats = self
                .adapter
                .output_stream(path, stream, Some(&validator))
                .await?;

            let speed = TransferStats::since(started, stats.size);
            info!(path = %path, stats = %speed, "Export written");
            transfer.set_result(json!({ "size": stats.size }));
            Ok::<_, BackupError>(stats.size)
        })
        .await
    }

    /// Delete `entries`; failures are reported as warnings on `task` and
    /// returned, they never fail the run
    async fn prune(&self, task: &Task, mode: BackupMode, entries: &[BackupEntry]) -> (usize, Vec<String>) {
        let descriptor = TaskDescriptor::new("clean")
            .optional()
            .with_data(json!({ "mode": mode, "count": entries.len() }));
        let vm = self.context.vm.uuid.as_str();

        let result = task
            .run_child(descriptor, |clean| async move {
                match mode {
                    BackupMode::Full => self.adapter.delete_full_vm_backups(entries).await,
                    BackupMode::Delta => self.adapter.delete_delta_vm_backups(vm, entries, &clean).await,
                }
            })
            .await;

        match result {
            Ok(count) => (count, Vec::new()),
            Err(BackupError::PartialDeletion { attempted, failed, errors }) => {
                warn!(vm = %vm, failed = failed.len(), attempted = attempted, "Old backups partially deleted");
                task.warn(
                    "old backups partially deleted",
                    json!({ "failed": failed, "errors": errors }),
                );
                (attempted.saturating_sub(failed.len()), errors)
            }
            Err(e) => {
                warn!(vm = %vm, error = %e, "Old backups not deleted");
                task.warn("old backups not deleted", json!({ "error": e.to_string() }));
                (0, vec![e.to_string()])
            }
        }
    }
}

/// Marks the run as validating before delegating to the artifact check
struct StateValidator<'a> {
    core: &'a WriterCore,
    inner: &'a dyn ArtifactValidator,
}

#[async_trait]
impl<'a> ArtifactValidator for StateValidator<'a> {
    async fn validate(&self, handler: &dyn RemoteHandler, temp_path: &str) -> Result<()> {
        self.core.set_state(WriterState::Validate);
        self.inner.validate(handler, temp_path).await
    }
}
