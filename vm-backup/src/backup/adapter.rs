//! Backup-domain operations on top of a remote handler.

use super::metadata::{file_in_dir, BackupMetadata};
use super::{vm_backup_dir, BackupMode, METADATA_EXTENSION};
use crate::chain::ChainMerger;
use crate::image::IMAGE_EXTENSION;
use crate::remote::{
    file_name, is_temp_name, join, parent_dir, ArtifactValidator, NamePredicate, OutputFileOptions,
    OutputStats, RemoteHandler,
};
use crate::task::Task;
use crate::transfer::ByteStream;
use crate::utils::errors::{BackupError, Result};
use futures_util::TryStreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A committed backup: a parsed metadata file whose data file exists
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub metadata_path: String,
    pub basename: String,
    pub metadata: BackupMetadata,
}

impl BackupEntry {
    pub fn dir(&self) -> &str {
        parent_dir(&self.metadata_path)
    }

    pub fn data_path(&self) -> Result<String> {
        let reference = self
            .metadata
            .data_file()
            .ok_or_else(|| BackupError::Metadata(format!("{} has no data file", self.metadata_path)))?;
        Ok(join(self.dir(), file_in_dir(reference)?))
    }

    /// Image file name, delta entries only
    fn image_name(&self) -> Option<&str> {
        self.metadata
            .image
            .as_deref()
            .and_then(|i| file_in_dir(i).ok())
    }

    fn parent_name(&self) -> Option<&str> {
        self.metadata
            .parent
            .as_deref()
            .and_then(|p| file_in_dir(p).ok())
    }
}

/// Findings of a consistency check on a VM backup directory
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanReport {
    /// Data files no metadata refers to
    pub orphan_data: Vec<String>,
    /// Metadata that cannot be parsed or whose data file is missing
    pub broken_metadata: Vec<String>,
    /// Leftovers of interrupted writes
    pub temp_files: Vec<String>,
    pub removed: Vec<String>,
    pub errors: Vec<String>,
}

impl CleanReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_data.is_empty() && self.broken_metadata.is_empty() && self.temp_files.is_empty()
    }
}

/// Collects per-item failures of a batch operation
#[derive(Default)]
struct BatchErrors {
    failed: Vec<String>,
    errors: Vec<String>,
}

impl BatchErrors {
    fn record(&mut self, item: &str, error: impl std::fmt::Display) {
        warn!(item = %item, error = %error, "Deletion failed");
        self.failed.push(item.to_string());
        self.errors.push(format!("{}: {}", item, error));
    }

    fn into_result(self, attempted: usize, done: usize) -> Result<usize> {
        if self.failed.is_empty() {
            Ok(done)
        } else {
            Err(BackupError::PartialDeletion {
                attempted,
                failed: self.failed,
                errors: self.errors,
            })
        }
    }
}

#[derive(Clone)]
pub struct RemoteAdapter {
    handler: Arc<dyn RemoteHandler>,
    dir_mode: Option<u32>,
    merger: ChainMerger,
}

impl RemoteAdapter {
    pub fn new(handler: Arc<dyn RemoteHandler>) -> Self {
        Self {
            handler,
            dir_mode: None,
            merger: ChainMerger::new(),
        }
    }

    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = Some(mode);
        self
    }

    pub fn handler(&self) -> &Arc<dyn RemoteHandler> {
        &self.handler
    }

    pub async fn output_stream(
        &self,
        path: &str,
        stream: ByteStream,
        validator: Option<&dyn ArtifactValidator>,
    ) -> Result<OutputStats> {
        self.handler.output_stream(path, stream, validator).await
    }

    pub async fn output_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let options = OutputFileOptions {
            dir_mode: self.dir_mode,
        };
        self.handler.output_file(path, content, options).await
    }

    pub async fn read_vm_backup_metadata(&self, path: &str) -> Result<BackupMetadata> {
        BackupMetadata::parse(&self.handler.read_file(path).await?)
    }

    /// Persist a metadata record, the commit point of a backup
    pub async fn write_vm_backup_metadata(&self, dir: &str, basename: &str, metadata: &BackupMetadata) -> Result<String> {
        let path = join(dir, &format!("{}.{}", basename, METADATA_EXTENSION));
        self.output_file(&path, &metadata.to_json()?).await?;
        Ok(path)
    }

    /// Committed backups of a VM accepted by `filter`, oldest first.
    ///
    /// Unreadable metadata and metadata whose data file is gone are skipped.
    pub async fn list_vm_backups<F>(&self, vm_uuid: &str, filter: F) -> Result<Vec<BackupEntry>>
    where
        F: Fn(&BackupMetadata) -> bool,
    {
        let dir = vm_backup_dir(vm_uuid)?;
        let is_metadata: NamePredicate = Arc::new(|name: &str| {
            !is_temp_name(name) && name.ends_with(&format!(".{}", METADATA_EXTENSION))
        });

        let mut names = self.handler.list_directory(&dir, Some(is_metadata)).await?;
        let mut entries = Vec::new();
        while let Some(name) = names.try_next().await? {
            let path = join(&dir, &name);
            match self.load_entry(&path).await {
                Ok(entry) if filter(&entry.metadata) => entries.push(entry),
                Ok(_) => {}
                Err(e) => warn!(remote = %self.handler.id(), path = %path, error = %e, "Skipping backup"),
            }
        }

        // Stable, equal timestamps keep listing order
        entries.sort_by_key(|e| e.metadata.timestamp);
        Ok(entries)
    }

    async fn load_entry(&self, metadata_path: &str) -> Result<BackupEntry> {
        let metadata = self.read_vm_backup_metadata(metadata_path).await?;
        let name = file_name(metadata_path);
        let basename = name
            .strip_suffix(&format!(".{}", METADATA_EXTENSION))
            .unwrap_or(name)
            .to_string();
        let entry = BackupEntry {
            metadata_path: metadata_path.to_string(),
            basename,
            metadata,
        };

        let data_path = entry.data_path()?;
        if !self.handler.exists(&data_path).await? {
            return Err(BackupError::Metadata(format!("data file {} is missing", data_path)));
        }
        Ok(entry)
    }

    /// Unlink, treating an already missing file as deleted
    async fn remove(&self, path: &str) -> Result<()> {
        match self.handler.unlink(path).await {
            Err(e) if e.is_not_found() => {
                debug!(path = %path, "Already deleted");
                Ok(())
            }
            other => other,
        }
    }

    /// Delete full backups, data file first. Every entry is attempted; failures
    /// are reported together afterwards.
    pub async fn delete_full_vm_backups(&self, entries: &[BackupEntry]) -> Result<usize> {
        let mut errors = BatchErrors::default();
        let mut deleted = 0;

        for entry in entries {
            let result = async {
                self.remove(&entry.data_path()?).await?;
                self.remove(&entry.metadata_path).await
            }
            .await;

            match result {
                Ok(()) => {
                    info!(remote = %self.handler.id(), backup = %entry.basename, "Backup deleted");
                    deleted += 1;
                }
                Err(e) => errors.record(&entry.basename, e),
            }
        }

        errors.into_result(entries.len(), deleted)
    }

    /// Delete delta backups of a VM without breaking the chains of the
    /// backups that remain.
    ///
    /// Unlike full backups, metadata goes first: the image of a removed
    /// entry may still be merged into a survivor, so it has to outlive the
    /// listing of its entry. No half-processed entry is ever listed.
    /// Images a surviving backup still builds on are merged into that
    /// backup's image; the others are removed.
    pub async fn delete_delta_vm_backups(&self, vm_uuid: &str, entries: &[BackupEntry], task: &Task) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let all = self
            .list_vm_backups(vm_uuid, |m| m.mode == BackupMode::Delta)
            .await?;
        let mut errors = BatchErrors::default();

        let mut removed: Vec<&BackupEntry> = Vec::new();
        for entry in entries {
            match self.remove(&entry.metadata_path).await {
                Ok(()) => removed.push(entry),
                Err(e) => errors.record(&entry.basename, e),
            }
        }
        let removed_paths: HashSet<&str> = removed.iter().map(|e| e.metadata_path.as_str()).collect();
        let removed_by_image: HashMap<&str, &BackupEntry> = removed
            .iter()
            .filter_map(|&e| e.image_name().map(|name| (name, e)))
            .collect();

        // Images that must not be unlinked below
        let mut kept: HashSet<&str> = HashSet::new();

        let survivors = all
            .iter()
            .filter(|e| !removed_paths.contains(e.metadata_path.as_str()));
        for survivor in survivors {
            let mut chain: Vec<&BackupEntry> = Vec::new();
            let mut cursor = survivor.parent_name();
            while let Some(name) = cursor {
                match removed_by_image.get(name) {
                    Some(&link) if !kept.contains(name) => {
                        chain.push(link);
                        cursor = link.parent_name();
                    }
                    Some(_) => {
                        errors.record(&survivor.basename, format!("image {} is shared with another backup", name));
                        break;
                    }
                    None => break,
                }
            }
            if chain.is_empty() {
                continue;
            }
            chain.reverse();
            kept.extend(chain.iter().filter_map(|&e| e.image_name()));

            if let Err(e) = self.consolidate(task, &chain, survivor).await {
                errors.record(&survivor.basename, e);
            }
        }

        let mut deleted = 0;
        for entry in &removed {
            let image = entry.image_name();
            if image.is_some_and(|name| kept.contains(name)) {
                deleted += 1;
                continue;
            }
            match entry.data_path() {
                Ok(path) => match self.remove(&path).await {
                    Ok(()) => deleted += 1,
                    Err(e) => errors.record(&entry.basename, e),
                },
                Err(e) => errors.record(&entry.basename, e),
            }
        }

        errors.into_result(entries.len(), deleted)
    }

    /// Merge `chain` (oldest first) and `survivor` into a single image stored
    /// under the survivor's name, then drop the parent link from its metadata.
    async fn consolidate(&self, task: &Task, chain: &[&BackupEntry], survivor: &BackupEntry) -> Result<()> {
        let handler = self.handler.as_ref();
        let target = chain[0].data_path()?;

        let mut size = None;
        for link in chain[1..].iter().copied().chain(std::iter::once(survivor)) {
            let summary = self
                .merger
                .merge_images(task, handler, &target, handler, &link.data_path()?)
                .await?;
            size = Some(summary.size);
        }

        let survivor_path = survivor.data_path()?;
        handler.rename(&target, &survivor_path).await?;

        let mut metadata = survivor.metadata.clone();
        metadata.parent = chain[0].metadata.parent.clone();
        if let Some(size) = size {
            metadata.size = size;
        }
        self.output_file(&survivor.metadata_path, &metadata.to_json()?).await?;

        info!(
            remote = %self.handler.id(),
            backup = %survivor.basename,
            merged = chain.len(),
            "Delta chain consolidated"
        );
        Ok(())
    }

    /// Report, and with `remove` delete, the leftovers of interrupted runs in
    /// a VM backup directory
    pub async fn clean_vm(&self, vm_uuid: &str, remove: bool) -> Result<CleanReport> {
        let dir = vm_backup_dir(vm_uuid)?;
        let names: Vec<String> = self
            .handler
            .list_directory(&dir, None)
            .await?
            .try_collect()
            .await?;
        let present: HashSet<&str> = names.iter().map(String::as_str).collect();

        let mut report = CleanReport::default();
        let mut referenced: HashSet<String> = HashSet::new();

        for name in names.iter().filter(|n| !is_temp_name(n)) {
            if !name.ends_with(&format!(".{}", METADATA_EXTENSION)) {
                continue;
            }
            let path = join(&dir, name);
            let data = match self.read_vm_backup_metadata(&path).await {
                Ok(metadata) => metadata
                    .data_file()
                    .and_then(|f| file_in_dir(f).ok())
                    .filter(|f| present.contains(f))
                    .map(|f| (f.to_string(), metadata.parent.clone())),
                Err(e) => {
                    debug!(path = %path, error = %e, "Unreadable metadata");
                    None
                }
            };
            match data {
                Some((data_file, parent)) => {
                    referenced.insert(data_file);
                    if let Some(parent) = parent.as_deref().and_then(|p| file_in_dir(p).ok()) {
                        referenced.insert(parent.to_string());
                    }
                }
                None => report.broken_metadata.push(path),
            }
        }

        let data_suffixes = [format!(".{}", super::XVA_EXTENSION), format!(".{}", IMAGE_EXTENSION)];
        for name in &names {
            if is_temp_name(name) {
                report.temp_files.push(join(&dir, name));
            } else if data_suffixes.iter().any(|s| name.ends_with(s.as_str())) && !referenced.contains(name) {
                report.orphan_data.push(join(&dir, name));
            }
        }
        report.orphan_data.sort();
        report.broken_metadata.sort();
        report.temp_files.sort();

        if remove {
            let targets: Vec<String> = report
                .broken_metadata
                .iter()
                .chain(&report.orphan_data)
                .chain(&report.temp_files)
                .cloned()
                .collect();
            for path in targets {
                match self.remove(&path).await {
                    Ok(()) => report.removed.push(path),
                    Err(e) => report.errors.push(format!("{}: {}", path, e)),
                }
            }
        }

        if !report.is_clean() {
            warn!(
                remote = %self.handler.id(),
                vm = %vm_uuid,
                orphans = report.orphan_data.len(),
                broken = report.broken_metadata.len(),
                temp = report.temp_files.len(),
                removed = report.removed.len(),
                "VM backup directory inconsistent"
            );
        }
        Ok(report)
    }
}
