//! vm-backup - command line entry point
//!
//! Runs backups of exported VMs against configured remotes and exposes the
//! maintenance operations (listing, chain merge, consistency check, chain
//! health) for scripts. Results are printed as JSON on stdout.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use vm_backup::backup::{
    BackupJob, BackupMode, BackupWriter, DeltaBackupWriter, ExportedBackup, FullBackupWriter, RemoteAdapter,
    VmBackupContext, VmDescriptor,
};
use vm_backup::chain::{sr_unhealthy_chains, srs_unhealthy_chains, ChainMerger, VdiInventory};
use vm_backup::remote::{RemoteHandler, RemoteRegistry, RemoteSession};
use vm_backup::task::{Task, TaskDescriptor, TaskLog};
use vm_backup::transfer::stream_from_reader;
use vm_backup::{utils, BackupError, Config};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write an exported VM to one or more remotes
    Backup(BackupArgs),

    /// List the committed backups of a VM
    List {
        #[arg(long)]
        remote: String,

        #[arg(long)]
        vm: String,

        #[arg(long, value_enum)]
        mode: Option<Mode>,
    },

    /// Merge a delta image into its parent
    Merge {
        #[arg(long)]
        remote: String,

        /// Remote holding the child image, defaults to --remote
        #[arg(long)]
        child_remote: Option<String>,

        #[arg(long)]
        parent: String,

        #[arg(long)]
        child: String,
    },

    /// Check a VM backup directory for leftovers of interrupted runs
    Clean {
        #[arg(long)]
        remote: String,

        #[arg(long)]
        vm: String,

        /// Delete what the check finds
        #[arg(long)]
        remove: bool,
    },

    /// Report VDI chains that need consolidation
    Chains {
        /// JSON dump of the VDI records
        #[arg(long, value_name = "FILE")]
        inventory: PathBuf,

        /// Restrict the report to one SR
        #[arg(long)]
        sr: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct BackupArgs {
    /// Target remote, repeat to write to several remotes concurrently
    #[arg(long = "remote", required = true)]
    remotes: Vec<String>,

    #[arg(long)]
    vm: String,

    #[arg(long)]
    vm_name: Option<String>,

    #[arg(long)]
    job: String,

    #[arg(long)]
    schedule: String,

    #[arg(long, value_enum, default_value_t = Mode::Full)]
    mode: Mode,

    /// Exported data: an XVA archive (full) or a block image (delta)
    #[arg(long, value_name = "FILE")]
    input: PathBuf,

    /// JSON descriptor of the exported snapshot
    #[arg(long, value_name = "FILE")]
    snapshot: Option<PathBuf>,

    /// Run time in seconds since the epoch, defaults to now
    #[arg(long)]
    timestamp: Option<i64>,

    /// Overrides defaults.export_retention
    #[arg(long)]
    retention: Option<u32>,

    /// Delete old backups before writing the new one
    #[arg(long)]
    delete_first: bool,

    /// Print task events as JSON lines on stderr
    #[arg(long)]
    events: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Full,
    Delta,
}

impl From<Mode> for BackupMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Full => BackupMode::Full,
            Mode::Delta => BackupMode::Delta,
        }
    }
}

/// One remote of a backup command
struct RunTarget {
    handler: Arc<dyn RemoteHandler>,
    dir_mode: u32,
    context: VmBackupContext,
    input: PathBuf,
    timestamp: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport {
    remote: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<vm_backup::backup::BackupOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, &config.log.format)?;

    tracing::debug!(
        "vm-backup v{} (node: {})",
        env!("CARGO_PKG_VERSION"),
        config.node.id
    );

    let registry = RemoteRegistry::from_config(&config);

    match args.command {
        Command::Backup(backup_args) => backup(&config, &registry, backup_args).await,
        Command::List { remote, vm, mode } => {
            let handler = registry.build(config.remote(&remote)?)?;
            let entries = RemoteSession::scoped(handler, |handler| async move {
                RemoteAdapter::new(handler)
                    .list_vm_backups(&vm, |m| mode.map_or(true, |mode| m.mode == BackupMode::from(mode)))
                    .await
            })
            .await?;
            print_json(&entries)
        }
        Command::Merge {
            remote,
            child_remote,
            parent,
            child,
        } => {
            let parent_handler = registry.build(config.remote(&remote)?)?;
            let child_handler = match &child_remote {
                Some(id) if *id != remote => registry.build(config.remote(id)?)?,
                _ => Arc::clone(&parent_handler),
            };
            let log = TaskLog::new();
            let summary = Task::run(&log, TaskDescriptor::new("merge chain"), |task| async move {
                ChainMerger::new()
                    .merge_chain(&task, parent_handler, &parent, child_handler, &child)
                    .await
            })
            .await?;
            print_json(&summary)
        }
        Command::Clean { remote, vm, remove } => {
            let handler = registry.build(config.remote(&remote)?)?;
            let dir_mode = config.defaults.dir_mode;
            let report = RemoteSession::scoped(handler, |handler| async move {
                RemoteAdapter::new(handler)
                    .with_dir_mode(dir_mode)
                    .clean_vm(&vm, remove)
                    .await
            })
            .await?;
            print_json(&report)
        }
        Command::Chains { inventory, sr } => {
            let inventory = VdiInventory::load(&inventory).await?;
            let report = match sr {
                Some(sr) => {
                    let chains = serde_json::to_value(sr_unhealthy_chains(&inventory, &sr).await?)?;
                    Value::Object(serde_json::Map::from_iter([(sr, chains)]))
                }
                None => serde_json::to_value(srs_unhealthy_chains(&inventory).await?)?,
            };
            print_json(&report)
        }
    }
}

async fn backup(config: &Config, registry: &RemoteRegistry, args: BackupArgs) -> Result<()> {
    let mut settings = config.defaults;
    if let Some(retention) = args.retention {
        settings.export_retention = retention;
    }
    settings.delete_first |= args.delete_first;

    let mut vm = VmDescriptor::new(args.vm.clone());
    if let Some(name) = args.vm_name {
        vm = vm.with_name(name);
    }
    let exported_vm: Value = match &args.snapshot {
        Some(path) => serde_json::from_str(&tokio::fs::read_to_string(path).await?)?,
        None => json!({ "uuid": args.vm }),
    };
    let context = VmBackupContext {
        job: BackupJob {
            id: args.job,
            mode: args.mode.into(),
            settings,
        },
        schedule_id: args.schedule,
        vm,
        exported_vm,
    };
    let timestamp = args.timestamp.unwrap_or_else(|| Utc::now().timestamp());

    let mut targets = Vec::new();
    for id in &args.remotes {
        targets.push(RunTarget {
            handler: registry.build(config.remote(id)?)?,
            dir_mode: settings.dir_mode,
            context: context.clone(),
            input: args.input.clone(),
            timestamp,
        });
    }

    let log = TaskLog::new();
    let printer = args.events.then(|| {
        let mut events = log.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => eprintln!("{}", line),
                        Err(e) => tracing::warn!("Cannot serialize task event: {}", e),
                    },
                    Err(RecvError::Lagged(skipped)) => tracing::warn!("{} task events dropped", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let run = Task::wrap_fn(
        log,
        |target: &RunTarget| {
            TaskDescriptor::new("backup run").with_data(json!({
                "jobId": target.context.job.id,
                "scheduleId": target.context.schedule_id,
                "vmUuid": target.context.vm.uuid,
                "remoteId": target.handler.id(),
                "mode": target.context.job.mode,
            }))
        },
        |task: Task, target: RunTarget| async move {
            let file = tokio::fs::File::open(&target.input).await?;
            let export = ExportedBackup::new(target.timestamp, stream_from_reader(file));
            let adapter = RemoteAdapter::new(Arc::clone(&target.handler)).with_dir_mode(target.dir_mode);
            let writer: Box<dyn BackupWriter> = match target.context.job.mode {
                BackupMode::Full => Box::new(FullBackupWriter::new(adapter, target.context)),
                BackupMode::Delta => Box::new(DeltaBackupWriter::new(adapter, target.context)),
            };
            RemoteSession::scoped(target.handler, |_| async move { writer.run(&task, export).await }).await
        },
    );

    let remote_ids = args.remotes.clone();
    let results = futures_util::future::join_all(targets.into_iter().map(&run)).await;
    drop(run);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let reports: Vec<RunReport> = remote_ids
        .into_iter()
        .zip(results)
        .map(|(remote, result): (String, std::result::Result<_, BackupError>)| match result {
            Ok(outcome) => RunReport {
                remote,
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => RunReport {
                remote,
                outcome: None,
                error: Some(e.to_string()),
            },
        })
        .collect();
    print_json(&reports)?;

    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        bail!("{} of {} backup runs failed", failed, reports.len());
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
