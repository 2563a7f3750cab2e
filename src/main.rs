use std::{fs, path::PathBuf, sync::Arc};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;

use gatekeep::{
    core::{
        admission::{AdmissionEngine, ScanOutcome, ScanSession},
        backup::BackupWriter,
        db::ParticipantDb,
        event::AdmissionMode,
        registration::Registrar,
        scanner::{run_scanner_actor, ScannerActor},
        settings::Settings,
        sheet::{export_sheet_file, import_sheet_file},
        sync::SyncEngine,
        transfer::{export_chunks, ChunkAssembler},
    },
    integrations::{init_integrations, remote_from_settings},
    web::run_http_server,
    Directory,
};

#[derive(Parser, Debug)]
#[command(name = "gatekeep")]
#[command(version = "0.1")]
#[command(about = "Offline-first check-in for festival events.", long_about = None)]
struct Args {
    /// Device settings file. Defaults are used when it is missing.
    #[arg(short, long, default_value = "gatekeep.json")]
    settings: PathBuf,

    #[command(subcommand)]
    command: RunType,
}

#[derive(Subcommand, Debug)]
enum RunType {
    /// Run the scanner, the connectivity monitor and the HTTP API.
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Push pending records and pull remote registrations once.
    Sync,

    /// Scan a single token at an event and print the outcome.
    /// Decisions that need an operator are confirmed with `--confirm`.
    Scan {
        #[arg(short, long)]
        event: String,

        #[arg(long)]
        confirm: bool,

        token: String,
    },

    /// Print the transfer chunks for an event, one per line.
    Export { event: String },

    /// Import transfer chunks for an event, one per line.
    Import { event: String, file: PathBuf },

    /// Import participants from a CSV sheet with Name and Events columns.
    ImportSheet { file: PathBuf },

    /// Write admitted participants to a CSV sheet.
    ExportSheet { file: PathBuf },

    /// Append admitted participants to the backup CSV.
    Backup,

    /// Search participants by name, email, phone or id.
    Search { term: String },

    /// Print registered and admitted counts for an event.
    Stats { event: String },

    /// Delete every local participant record.
    Reset {
        /// Required, the local store is not recoverable afterwards.
        #[arg(long)]
        yes: bool,
    },
}

fn load_settings(path: &PathBuf) -> anyhow::Result<Settings> {
    if !path.exists() {
        log::info!("No settings at {:?}, using defaults", path);
        return Ok(Settings::default());
    }
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn admission_engine(
    settings: &Settings,
    db: Arc<ParticipantDb>,
    backup: Arc<BackupWriter>,
) -> anyhow::Result<AdmissionEngine> {
    Ok(AdmissionEngine::new(
        db,
        remote_from_settings(settings)?,
        Some(backup),
        settings.paid_entry_policy(),
        settings.remote_timeout(),
    ))
}

async fn serve(
    settings: Arc<Settings>,
    db: Arc<ParticipantDb>,
    backup: Arc<BackupWriter>,
    port: u16,
) -> anyhow::Result<()> {
    let mut tasks = JoinSet::new();

    let remote = remote_from_settings(&settings)?;
    let sync_engine = Arc::new(SyncEngine::new(
        db.clone(),
        remote,
        settings.push_batch_size(),
        settings.pull_enabled(),
    ));

    let engine = Arc::new(admission_engine(&settings, db.clone(), backup.clone())?);
    let registrar = Arc::new(Registrar::new(db.clone(), Some(backup.clone())));
    let (scanner_actor, rx) = ScannerActor::new();
    tasks.spawn(run_scanner_actor(engine, registrar, settings.catalog(), rx));

    let monitor = init_integrations(&mut tasks, settings.clone(), sync_engine.clone())?;

    let directory = Directory {
        scanner_actor,
        sync_engine,
        monitor,
        assembler: Arc::new(ChunkAssembler::new(db.clone())),
        backup,
        settings,
    };

    tasks.spawn(run_http_server(db, directory, port));

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => log::info!("Task finished"),
            Ok(Err(e)) => log::error!("Task failed: {:#}", e),
            Err(e) => log::error!("Task panicked: {}", e),
        }
    }

    Ok(())
}

async fn scan_once(
    settings: &Settings,
    db: Arc<ParticipantDb>,
    backup: Arc<BackupWriter>,
    event: &str,
    token: &str,
    confirm: bool,
) -> anyhow::Result<()> {
    let engine = admission_engine(settings, db, backup)?;
    let mut session = ScanSession::new(settings.catalog().context(event), AdmissionMode::Individual);

    let outcome = engine.scan(&mut session, token).await?;
    print_json(&outcome)?;

    let needs_decision = matches!(
        outcome,
        ScanOutcome::ConfirmReentry { .. } | ScanOutcome::PaymentPending { .. }
    );
    if needs_decision && confirm {
        print_json(&engine.confirm(&mut session).await?)?;
    }

    // The process exits next, so the background backup would be lost.
    if !session.members().is_empty() {
        engine.flush_backup().await?;
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings = Arc::new(load_settings(&args.settings)?);
    let db = Arc::new(ParticipantDb::open(&settings.database()).await?);
    let backup = Arc::new(BackupWriter::new(settings.backup_file()));

    match args.command {
        RunType::Serve { port } => {
            let port = port.or(settings.web_port).unwrap_or(28010);
            serve(settings, db, backup, port).await?;
        }
        RunType::Sync => {
            let remote = remote_from_settings(&settings)?;
            let sync = SyncEngine::new(
                db.clone(),
                remote,
                settings.push_batch_size(),
                settings.pull_enabled(),
            );
            print_json(&sync.sync_now().await?)?;
        }
        RunType::Scan {
            event,
            confirm,
            token,
        } => scan_once(&settings, db, backup, &event, &token, confirm).await?,
        RunType::Export { event } => {
            for chunk in export_chunks(&db, &event, settings.transfer_max_payload()).await? {
                println!("{}", chunk.encode()?);
            }
        }
        RunType::Import { event, file } => {
            let assembler = ChunkAssembler::new(db.clone());
            for line in fs::read_to_string(&file)?.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match assembler.accept_raw(line, &event).await {
                    Ok(progress) => print_json(&progress)?,
                    Err(e) => log::warn!("Skipping chunk: {}", e),
                }
            }
        }
        RunType::ImportSheet { file } => print_json(&import_sheet_file(&db, &file).await?)?,
        RunType::ExportSheet { file } => {
            export_sheet_file(&db, &file).await?;
            log::info!("Wrote {:?}", file);
        }
        RunType::Backup => {
            let appended = backup.append_admitted(&db).await?;
            log::info!("Appended {} rows to {:?}", appended, backup.path());
        }
        RunType::Search { term } => print_json(&db.search(&term).await?)?,
        RunType::Stats { event } => print_json(&db.event_counts(&event).await?)?,
        RunType::Reset { yes } => {
            if !yes {
                return Err(anyhow!("Refusing to delete local records without --yes"));
            }
            log::warn!("Deleted {} local records", db.clear_all().await?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    run(Args::parse()).await
}
