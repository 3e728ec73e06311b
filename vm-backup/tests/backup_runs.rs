//! End-to-end backup runs against local, object storage and mounted remotes.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use object_store::memory::InMemory;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;
use vm_backup::backup::{
    BackupJob, BackupMode, BackupWriter, DeltaBackupWriter, ExportedBackup, FullBackupWriter, RemoteAdapter,
    VmBackupContext, VmDescriptor,
};
use vm_backup::chain::{sr_unhealthy_chains, VdiInventory, VdiRecord};
use vm_backup::config::JobSettings;
use vm_backup::image::BlockImage;
use vm_backup::remote::{
    ArtifactValidator, EntryStream, LocalHandler, MountError, MountHandler, MountSpec, Mounter, NamePredicate,
    ObjectStoreHandler, OutputFileOptions, OutputStats, RemoteHandler, RemoteKind, RemoteSession,
};
use vm_backup::task::{Task, TaskDescriptor, TaskLog, TaskStatus};
use vm_backup::transfer::{stream_from_chunks, ByteStream};
use vm_backup::{BackupError, Result};

const VM: &str = "0b6a1d2c-vm";

fn tar_archive(content: &[u8]) -> Vec<u8> {
    let mut header = [0u8; 512];
    header[..7].copy_from_slice(b"ova.xml");
    header[100..108].copy_from_slice(b"0000644\0");
    header[124..136].copy_from_slice(format!("{:011o}\0", content.len()).as_bytes());
    header[156] = b'0';
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");
    header[148..156].fill(b' ');
    let sum: u64 = header.iter().map(|&b| b as u64).sum();
    header[148..156].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());

    let mut out = header.to_vec();
    out.extend_from_slice(content);
    out.resize(out.len().div_ceil(512) * 512 + 1024, 0);
    out
}

fn context(vm: &str, schedule: &str, mode: BackupMode, retention: u32) -> VmBackupContext {
    VmBackupContext {
        job: BackupJob {
            id: "job-1".into(),
            mode,
            settings: JobSettings {
                export_retention: retention,
                ..JobSettings::default()
            },
        },
        schedule_id: schedule.into(),
        vm: VmDescriptor::new(vm).with_name("web-01"),
        exported_vm: json!({ "uuid": format!("{}-snapshot", vm) }),
    }
}

fn xva_export(timestamp: i64) -> ExportedBackup {
    let archive = tar_archive(format!("<vm ts=\"{}\"/>", timestamp).as_bytes());
    let chunks = archive.chunks(200).map(<[u8]>::to_vec).collect();
    ExportedBackup::new(timestamp, stream_from_chunks(chunks))
}

async fn run_writer(writer: &dyn BackupWriter, export: ExportedBackup) -> Result<vm_backup::backup::BackupOutcome> {
    let log = TaskLog::new();
    Task::run(&log, TaskDescriptor::new("backup run"), |task| async move {
        writer.run(&task, export).await
    })
    .await
}

async fn timestamps(adapter: &RemoteAdapter, vm: &str) -> Vec<i64> {
    adapter
        .list_vm_backups(vm, |_| true)
        .await
        .unwrap()
        .iter()
        .map(|e| e.metadata.timestamp)
        .collect()
}

/// Delegating handler that records mutations and can refuse some of them
struct RecordingHandler {
    inner: Arc<dyn RemoteHandler>,
    ops: Mutex<Vec<String>>,
    refuse_unlink: Option<String>,
    refuse_output_file: bool,
}

impl RecordingHandler {
    fn new(inner: Arc<dyn RemoteHandler>) -> Self {
        Self {
            inner,
            ops: Mutex::new(Vec::new()),
            refuse_unlink: None,
            refuse_output_file: false,
        }
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteHandler for RecordingHandler {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> RemoteKind {
        self.inner.kind()
    }

    async fn sync(&self) -> Result<()> {
        self.inner.sync().await
    }

    async fn forget(&self) {
        self.inner.forget().await
    }

    async fn output_stream(
        &self,
        path: &str,
        stream: ByteStream,
        validator: Option<&dyn ArtifactValidator>,
    ) -> Result<OutputStats> {
        let stats = self.inner.output_stream(path, stream, validator).await?;
        self.record(format!("stream {}", path));
        Ok(stats)
    }

    async fn output_file(&self, path: &str, content: &[u8], options: OutputFileOptions) -> Result<()> {
        if self.refuse_output_file {
            return Err(BackupError::Io(std::io::Error::new(std::io::ErrorKind::Other, "no space left")));
        }
        self.inner.output_file(path, content, options).await?;
        self.record(format!("file {}", path));
        Ok(())
    }

    async fn list_directory(&self, path: &str, predicate: Option<NamePredicate>) -> Result<EntryStream> {
        self.inner.list_directory(path, predicate).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.read_file(path).await
    }

    async fn create_read_stream(&self, path: &str) -> Result<ByteStream> {
        self.inner.create_read_stream(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        if self.refuse_unlink.as_deref().is_some_and(|p| path.contains(p)) {
            return Err(BackupError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)));
        }
        self.inner.unlink(path).await?;
        self.record(format!("unlink {}", path));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to).await
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        self.inner.local_path(path)
    }
}

#[tokio::test]
async fn retention_prunes_only_after_commit() {
    let dir = TempDir::new().unwrap();
    let local: Arc<dyn RemoteHandler> = Arc::new(LocalHandler::new("local", dir.path()));
    let seed = FullBackupWriter::new(RemoteAdapter::new(Arc::clone(&local)), context(VM, "S", BackupMode::Full, 0));
    for t in 1..=5 {
        run_writer(&seed, xva_export(t * 3600)).await.unwrap();
    }
    // Another schedule is never touched by S's retention
    let other = FullBackupWriter::new(RemoteAdapter::new(Arc::clone(&local)), context(VM, "T", BackupMode::Full, 1));
    run_writer(&other, xva_export(100)).await.unwrap();

    let recording = Arc::new(RecordingHandler::new(Arc::clone(&local)));
    let adapter = RemoteAdapter::new(recording.clone());
    let writer = FullBackupWriter::new(adapter.clone(), context(VM, "S", BackupMode::Full, 3));
    let outcome = run_writer(&writer, xva_export(6 * 3600)).await.unwrap();
    assert_eq!(outcome.deleted, 3);

    let remaining = adapter
        .list_vm_backups(VM, |m| m.schedule_id == "S")
        .await
        .unwrap();
    let stamps: Vec<i64> = remaining.iter().map(|e| e.metadata.timestamp).collect();
    assert_eq!(stamps, vec![4 * 3600, 5 * 3600, 6 * 3600]);
    assert_eq!(timestamps(&adapter, VM).await.len(), 4);

    let ops = recording.ops();
    let commit = ops
        .iter()
        .position(|op| op == &format!("file {}", outcome.metadata_path))
        .unwrap();
    let first_unlink = ops.iter().position(|op| op.starts_with("unlink")).unwrap();
    assert!(commit < first_unlink, "{:?}", ops);
    assert_eq!(ops.iter().filter(|op| op.starts_with("unlink")).count(), 6);
}

#[tokio::test]
async fn failed_export_keeps_previous_backups() {
    let dir = TempDir::new().unwrap();
    let adapter = RemoteAdapter::new(Arc::new(LocalHandler::new("local", dir.path())));
    let writer = FullBackupWriter::new(adapter.clone(), context(VM, "S", BackupMode::Full, 1));
    run_writer(&writer, xva_export(10)).await.unwrap();

    let chunks: Vec<std::io::Result<Bytes>> = vec![
        Ok(Bytes::from(tar_archive(b"partial"))),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "export connection lost")),
    ];
    let export = ExportedBackup::new(20, Box::pin(stream::iter(chunks)));
    let err = run_writer(&writer, export).await.unwrap_err();
    assert!(err.to_string().contains("export connection lost"), "{}", err);

    assert_eq!(timestamps(&adapter, VM).await, vec![10]);
    let report = adapter.clean_vm(VM, false).await.unwrap();
    assert!(report.is_clean(), "{:?}", report);
}

#[tokio::test]
async fn prune_failure_does_not_revert_new_backup() {
    let dir = TempDir::new().unwrap();
    let local: Arc<dyn RemoteHandler> = Arc::new(LocalHandler::new("local", dir.path()));
    let seed = FullBackupWriter::new(RemoteAdapter::new(Arc::clone(&local)), context(VM, "S", BackupMode::Full, 0));
    run_writer(&seed, xva_export(10)).await.unwrap();
    run_writer(&seed, xva_export(20)).await.unwrap();

    let mut recording = RecordingHandler::new(Arc::clone(&local));
    recording.refuse_unlink = Some("19700101T000010Z.xva".into());
    let adapter = RemoteAdapter::new(Arc::new(recording));
    let writer = FullBackupWriter::new(adapter.clone(), context(VM, "S", BackupMode::Full, 1));

    let log = TaskLog::new();
    let (outcome, status) = Task::run(&log, TaskDescriptor::new("backup run"), |task| async move {
        let outcome = writer.run(&task, xva_export(30)).await?;
        let clean = task.snapshot().find("clean").map(|c| c.status);
        Ok::<_, BackupError>((outcome, clean))
    })
    .await
    .unwrap();

    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.prune_errors.len(), 1);
    assert_eq!(status, Some(TaskStatus::Failure));
    // The entry whose data could not be removed is still complete
    assert_eq!(timestamps(&adapter, VM).await, vec![10, 30]);
}

#[tokio::test]
async fn failed_metadata_write_leaves_detectable_orphan() {
    let dir = TempDir::new().unwrap();
    let local: Arc<dyn RemoteHandler> = Arc::new(LocalHandler::new("local", dir.path()));
    let seed = FullBackupWriter::new(RemoteAdapter::new(Arc::clone(&local)), context(VM, "S", BackupMode::Full, 0));
    run_writer(&seed, xva_export(10)).await.unwrap();

    let mut recording = RecordingHandler::new(Arc::clone(&local));
    recording.refuse_output_file = true;
    let recording = Arc::new(recording);
    let writer = FullBackupWriter::new(RemoteAdapter::new(recording.clone()), context(VM, "S", BackupMode::Full, 1));

    let err = run_writer(&writer, xva_export(20)).await.unwrap_err();
    assert!(err.to_string().contains("no space left"), "{}", err);
    assert_eq!(writer.state(), vm_backup::backup::WriterState::Failed);
    // The data was published, nothing was pruned
    assert!(recording.ops().iter().any(|op| op.starts_with("stream ")));
    assert!(!recording.ops().iter().any(|op| op.starts_with("unlink")));

    let adapter = RemoteAdapter::new(Arc::clone(&local));
    assert_eq!(timestamps(&adapter, VM).await, vec![10]);

    let report = adapter.clean_vm(VM, false).await.unwrap();
    assert_eq!(report.orphan_data, vec![format!("xo-vm-backups/{}/19700101T000020Z.xva", VM)]);
    assert!(report.broken_metadata.is_empty() && report.temp_files.is_empty());

    let report = adapter.clean_vm(VM, true).await.unwrap();
    assert_eq!(report.removed.len(), 1);
    assert!(adapter.clean_vm(VM, false).await.unwrap().is_clean());
    assert_eq!(timestamps(&adapter, VM).await, vec![10]);
}

#[tokio::test]
async fn concurrent_runs_on_two_remotes() {
    let dir = TempDir::new().unwrap();
    let local: Arc<dyn RemoteHandler> = Arc::new(LocalHandler::new("nas", dir.path()));
    let s3: Arc<dyn RemoteHandler> =
        Arc::new(ObjectStoreHandler::new("s3", Arc::new(InMemory::new()), Some("backups")).unwrap());

    let log = TaskLog::new();
    let mut events = log.subscribe();
    let run = Task::wrap_fn(
        log,
        |(handler, vm): &(Arc<dyn RemoteHandler>, String)| {
            TaskDescriptor::new("backup run").with_data(json!({ "remoteId": handler.id(), "vmUuid": vm }))
        },
        |task: Task, (handler, vm): (Arc<dyn RemoteHandler>, String)| async move {
            let writer = FullBackupWriter::new(RemoteAdapter::new(handler), context(&vm, "S", BackupMode::Full, 2));
            let mut outcomes = Vec::new();
            for t in [100, 200, 300] {
                outcomes.push(writer.run(&task, xva_export(t)).await?);
            }
            Ok::<_, BackupError>(outcomes)
        },
    );

    let (a, b) = tokio::join!(
        run((Arc::clone(&local), "vm-a".to_string())),
        run((Arc::clone(&s3), "vm-b".to_string())),
    );
    assert_eq!(a.unwrap().last().unwrap().deleted, 1);
    assert_eq!(b.unwrap().last().unwrap().deleted, 1);

    let local_adapter = RemoteAdapter::new(local);
    let s3_adapter = RemoteAdapter::new(s3);
    assert_eq!(timestamps(&local_adapter, "vm-a").await, vec![200, 300]);
    assert_eq!(timestamps(&s3_adapter, "vm-b").await, vec![200, 300]);
    assert!(timestamps(&local_adapter, "vm-b").await.is_empty());
    assert!(timestamps(&s3_adapter, "vm-a").await.is_empty());

    // Each invocation is its own root task tagged with its remote
    let mut roots = HashSet::new();
    while let Ok(event) = events.try_recv() {
        let event = serde_json::to_value(&event).unwrap();
        if event["event"] == "start" && event["parentId"].is_null() {
            roots.insert(event["data"]["remoteId"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(roots, HashSet::from(["nas".to_string(), "s3".to_string()]));
}

#[tokio::test]
async fn rejected_artifact_is_never_visible() {
    let store = Arc::new(InMemory::new());
    let s3: Arc<dyn RemoteHandler> = Arc::new(ObjectStoreHandler::new("s3", store, None).unwrap());
    let adapter = RemoteAdapter::new(Arc::clone(&s3));
    let writer = FullBackupWriter::new(adapter.clone(), context(VM, "S", BackupMode::Full, 1));

    let garbage = ExportedBackup::new(10, stream_from_chunks(vec![vec![0xAB; 4096]]));
    let err = run_writer(&writer, garbage).await.unwrap_err();
    assert!(matches!(err, BackupError::Validation { .. }), "{}", err);

    let names: Vec<String> = futures_util::TryStreamExt::try_collect(
        s3.list_directory(&format!("xo-vm-backups/{}", VM), None).await.unwrap(),
    )
    .await
    .unwrap();
    assert!(names.is_empty(), "{:?}", names);
}

#[tokio::test]
async fn listing_round_trips_metadata() {
    let dir = TempDir::new().unwrap();
    let adapter = RemoteAdapter::new(Arc::new(LocalHandler::new("local", dir.path())));
    let writer = FullBackupWriter::new(adapter.clone(), context(VM, "S", BackupMode::Full, 0));
    let outcome = run_writer(&writer, xva_export(1_710_468_000)).await.unwrap();

    let entries = adapter.list_vm_backups(VM, |_| true).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.basename, "20240315T020000Z");
    assert_eq!(entry.metadata_path, outcome.metadata_path);
    assert_eq!(entry.metadata.xva.as_deref(), Some("./20240315T020000Z.xva"));
    assert_eq!(entry.metadata.size, outcome.size);
    assert_eq!(entry.metadata.vm.name_label.as_deref(), Some("web-01"));

    let read = adapter.read_vm_backup_metadata(&entry.metadata_path).await.unwrap();
    assert_eq!(read, entry.metadata);

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join(&entry.metadata_path)).unwrap()).unwrap();
    assert_eq!(raw["jobId"], "job-1");
    assert_eq!(raw["scheduleId"], "S");
    assert_eq!(raw["mode"], "full");
    assert_eq!(raw["version"], "2.0.0");
    assert_eq!(raw["vmSnapshot"]["uuid"], format!("{}-snapshot", VM));
}

#[tokio::test]
async fn delta_chain_on_object_storage_survives_pruning() {
    let s3: Arc<dyn RemoteHandler> =
        Arc::new(ObjectStoreHandler::new("s3", Arc::new(InMemory::new()), None).unwrap());
    let adapter = RemoteAdapter::new(Arc::clone(&s3));
    let writer = DeltaBackupWriter::new(adapter.clone(), context(VM, "S", BackupMode::Delta, 3));

    let block = 512u32;
    let mut disks = vec![vec![0u8; 8 * block as usize]];
    for generation in 1..=6u8 {
        let mut next = disks.last().unwrap().clone();
        let offset = (generation as usize % 8) * block as usize;
        next[offset..offset + 32].fill(generation);
        disks.push(next);

        let image = match writer.chain_parent().await.unwrap() {
            Some(parent) => BlockImage::diff(
                &disks[generation as usize - 1],
                &disks[generation as usize],
                block,
                Uuid::new_v4(),
                parent.metadata.image_uuid.unwrap(),
            ),
            None => BlockImage::base(&disks[generation as usize], block, Uuid::new_v4()),
        };
        let export = ExportedBackup::new(generation as i64 * 60, stream_from_chunks(vec![image.to_bytes()]));
        let outcome = run_writer(&writer, export).await.unwrap();
        assert!(outcome.prune_errors.is_empty(), "{:?}", outcome.prune_errors);
    }

    let entries = adapter.list_vm_backups(VM, |_| true).await.unwrap();
    let stamps: Vec<i64> = entries.iter().map(|e| e.metadata.timestamp).collect();
    assert_eq!(stamps, vec![240, 300, 360]);
    assert_eq!(entries[0].metadata.parent, None);
    assert_eq!(entries[1].metadata.parent, entries[0].metadata.image);

    let mut chain = Vec::new();
    for entry in &entries {
        chain.push(BlockImage::from_bytes(&s3.read_file(&entry.data_path().unwrap()).await.unwrap()).unwrap());
    }
    assert_eq!(BlockImage::materialize(&chain).unwrap(), disks[6]);
    assert!(adapter.clean_vm(VM, false).await.unwrap().is_clean());
}

#[tokio::test]
async fn unhealthy_chain_report() {
    let vdi = |uuid: &str, parent: Option<&str>| VdiRecord {
        uuid: uuid.into(),
        sr_uuid: "sr-1".into(),
        managed: true,
        is_a_snapshot: false,
        sm_config: parent
            .map(|p| HashMap::from([("vhd-parent".to_string(), p.to_string())]))
            .unwrap_or_default(),
    };
    let inventory = VdiInventory::new([vdi("A", None), vdi("B", Some("A")), vdi("C", Some("B"))]);

    let report = sr_unhealthy_chains(&inventory, "sr-1").await.unwrap();
    assert_eq!(report.get("C"), Some(&2));
    assert_eq!(report.get("B"), Some(&2));
    assert_eq!(report.get("A"), Some(&1));
}

/// Mount table kept in memory
#[derive(Default)]
struct TableMounter {
    mounted: Mutex<HashSet<PathBuf>>,
    mounts: AtomicUsize,
    /// Report nothing mounted while the system says otherwise
    stale: bool,
}

#[async_trait]
impl Mounter for TableMounter {
    async fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(!self.stale && self.mounted.lock().unwrap().contains(target))
    }

    async fn mount(&self, spec: &MountSpec) -> std::result::Result<(), MountError> {
        if !self.mounted.lock().unwrap().insert(spec.target.clone()) {
            return Err(MountError::AlreadyMounted);
        }
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> std::result::Result<(), MountError> {
        if self.mounted.lock().unwrap().remove(target) {
            Ok(())
        } else {
            Err(MountError::NotMounted)
        }
    }
}

#[tokio::test]
async fn mounted_remote_lifecycle_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mounter = Arc::new(TableMounter::default());
    let spec = MountSpec::nfs("nas.lan", "/exports/backups", dir.path().join("nfs"), Some("vers=4"));
    let nfs: Arc<dyn RemoteHandler> = Arc::new(MountHandler::new("nfs", RemoteKind::Nfs, true, spec, mounter.clone()));

    nfs.sync().await.unwrap();
    nfs.sync().await.unwrap();
    assert_eq!(mounter.mounts.load(Ordering::SeqCst), 1);

    let outcome = RemoteSession::scoped(Arc::clone(&nfs), |handler| async move {
        let writer = FullBackupWriter::new(RemoteAdapter::new(handler), context(VM, "S", BackupMode::Full, 1));
        run_writer(&writer, xva_export(10)).await
    })
    .await
    .unwrap();
    assert!(dir.path().join("nfs").join(&outcome.metadata_path).exists());

    // Released: unmounted, and a second teardown is harmless
    assert!(mounter.mounted.lock().unwrap().is_empty());
    nfs.forget().await;

    let stale = Arc::new(TableMounter {
        stale: true,
        ..TableMounter::default()
    });
    stale.mounted.lock().unwrap().insert(dir.path().join("smb"));
    let spec = MountSpec::smb(
        "fs.lan",
        "backups",
        dir.path().join("smb"),
        Some("svc"),
        Some("secret"),
        None,
        None,
    );
    let smb = MountHandler::new("smb", RemoteKind::Smb, true, spec, stale.clone());
    smb.sync().await.unwrap();
    assert_eq!(stale.mounts.load(Ordering::SeqCst), 0);
}

/// Export directory that only shows up at the mount point while mounted
struct ExportMounter {
    export: PathBuf,
}

#[async_trait]
impl Mounter for ExportMounter {
    async fn is_mounted(&self, _target: &Path) -> Result<bool> {
        Ok(!self.export.exists())
    }

    async fn mount(&self, spec: &MountSpec) -> std::result::Result<(), MountError> {
        std::fs::remove_dir(&spec.target).map_err(|e| MountError::Failed(e.to_string()))?;
        std::fs::rename(&self.export, &spec.target).map_err(|e| MountError::Failed(e.to_string()))
    }

    async fn unmount(&self, target: &Path) -> std::result::Result<(), MountError> {
        if self.export.exists() {
            return Err(MountError::NotMounted);
        }
        std::fs::rename(target, &self.export).map_err(|e| MountError::Failed(e.to_string()))?;
        std::fs::create_dir(target).map_err(|e| MountError::Failed(e.to_string()))
    }
}

fn nfs_remote(dir: &TempDir) -> Arc<dyn RemoteHandler> {
    let spec = MountSpec::nfs("nas.lan", "/exports/backups", dir.path().join("mnt"), None);
    let mounter = Arc::new(ExportMounter {
        export: dir.path().join("export"),
    });
    Arc::new(MountHandler::new("nfs", RemoteKind::Nfs, true, spec, mounter))
}

#[tokio::test]
async fn full_run_sees_backups_of_an_unmounted_remote() {
    let dir = TempDir::new().unwrap();
    let export: Arc<dyn RemoteHandler> = Arc::new(LocalHandler::new("export", dir.path().join("export")));
    let seed = FullBackupWriter::new(RemoteAdapter::new(Arc::clone(&export)), context(VM, "S", BackupMode::Full, 0));
    for t in [10, 20, 30] {
        run_writer(&seed, xva_export(t)).await.unwrap();
    }

    let nfs = nfs_remote(&dir);
    let adapter = RemoteAdapter::new(Arc::clone(&nfs));
    let writer = FullBackupWriter::new(adapter.clone(), context(VM, "S", BackupMode::Full, 2));
    let outcome = run_writer(&writer, xva_export(40)).await.unwrap();

    assert_eq!(outcome.deleted, 2);
    assert_eq!(timestamps(&adapter, VM).await, vec![30, 40]);

    nfs.forget().await;
    assert_eq!(timestamps(&RemoteAdapter::new(export), VM).await, vec![30, 40]);
}

#[tokio::test]
async fn delta_run_chains_to_the_mounted_parent() {
    let dir = TempDir::new().unwrap();
    let block = 512u32;
    let before = vec![0u8; 4 * block as usize];
    let mut after = before.clone();
    after[block as usize..block as usize + 8].fill(9);

    let export: Arc<dyn RemoteHandler> = Arc::new(LocalHandler::new("export", dir.path().join("export")));
    let seed = DeltaBackupWriter::new(RemoteAdapter::new(export), context(VM, "S", BackupMode::Delta, 0));
    let base = BlockImage::base(&before, block, Uuid::new_v4());
    run_writer(&seed, ExportedBackup::new(10, stream_from_chunks(vec![base.to_bytes()])))
        .await
        .unwrap();

    let nfs = nfs_remote(&dir);
    let adapter = RemoteAdapter::new(Arc::clone(&nfs));
    let writer = DeltaBackupWriter::new(adapter.clone(), context(VM, "S", BackupMode::Delta, 0));
    let parent = writer.chain_parent().await.unwrap().unwrap();
    assert_eq!(parent.metadata.image_uuid, Some(base.uuid()));

    let diff = BlockImage::diff(&before, &after, block, Uuid::new_v4(), base.uuid());
    run_writer(&writer, ExportedBackup::new(20, stream_from_chunks(vec![diff.to_bytes()])))
        .await
        .unwrap();

    let entries = adapter.list_vm_backups(VM, |_| true).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].metadata.parent, entries[0].metadata.image);
    nfs.forget().await;
}
