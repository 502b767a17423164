//! Command-line front end for the note sync engine.
//!
//! # Responsibility
//! - Compose the SQLite cache, the remote and the engine from config.
//! - Refresh from the remote before a save, so the new version builds on
//!   the latest copy.
//! - Print notes as JSON lines so output can be piped into other tools.

use clap::{Parser, Subcommand};
use log::warn;
use notesync_core::db::{open_db, open_db_in_memory};
use notesync_core::{
    init_logging_from_config, HttpRemoteStore, MemoryRemoteStore, Note, RemoteStore,
    SqliteNoteStore, SyncConfig, SyncDiagnostic, SyncEngine,
};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Debug, Parser)]
#[command(name = "notesync", version, about = "Keep local notes in sync with a shared server")]
struct Cli {
    /// TOML config file.
    #[arg(long, env = "NOTESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite cache file; in-memory when omitted.
    #[arg(long, env = "NOTESYNC_DB")]
    db: Option<PathBuf>,

    /// Base URL of the notes server.
    #[arg(long, env = "NOTESYNC_SERVER")]
    server: Option<String>,

    /// Sync against an in-process server instead; nothing leaves this process.
    #[arg(long, conflicts_with = "server")]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pull the remote copy once, then print the local note.
    Get { title: String },
    /// Refresh from the server, save locally, then push.
    Save { title: String, content: String },
    /// Print every cached note.
    List,
    /// Delete the cached copy; the server copy is kept.
    Delete { title: String },
    /// Follow a note, printing each new version.
    Watch {
        title: String,
        /// Stop after this many emissions.
        #[arg(long)]
        ticks: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("notesync: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = resolve_config(&cli)?;
    init_logging_from_config(&config)?;

    let conn = match config.db_path.as_ref() {
        Some(path) => open_db(path)?,
        None => open_db_in_memory()?,
    };
    let local = Arc::new(SqliteNoteStore::new(conn));
    let remote: Arc<dyn RemoteStore> = if cli.offline {
        Arc::new(MemoryRemoteStore::new())
    } else {
        Arc::new(HttpRemoteStore::new(
            &config.remote_base_url,
            config.request_timeout(),
        )?)
    };
    let engine = SyncEngine::new(local, remote, config);

    match cli.command {
        Command::Get { title } => {
            refresh(&engine, &title).await;
            print_note(engine.get_local(&title)?.as_ref())
        }
        Command::Save { title, content } => {
            let mut diagnostics = engine.diagnostics();
            let stored = save_note(&engine, title, content).await?;
            print_note(Some(&stored))?;
            let wait = engine.config().request_timeout() + Duration::from_millis(500);
            await_push(&mut diagnostics, &stored, wait).await
        }
        Command::List => {
            for note in engine.list()? {
                print_note(Some(&note))?;
            }
            Ok(())
        }
        Command::Delete { title } => {
            let deleted = match engine.get_local(&title)? {
                Some(note) => engine.delete(&note)?,
                None => false,
            };
            println!("{}", serde_json::json!({ "title": title, "deleted": deleted }));
            Ok(())
        }
        Command::Watch { title, ticks } => {
            let mut synced = engine.get_synced(&title)?;
            let mut seen = 0;
            while ticks != Some(seen) {
                match synced.next().await {
                    Some(note) => print_note(note.as_ref())?,
                    None => break,
                }
                seen += 1;
            }
            Ok(())
        }
    }
}

/// Pulls the remote copy once; on failure the cached copy stands.
async fn refresh(engine: &SyncEngine, title: &str) {
    if let Err(err) = engine.poll_once(title).await {
        warn!("event=cli_refresh module=cli status=error error={err}");
        eprintln!("notesync: remote unavailable, using cached copy: {err}");
    }
}

async fn save_note(engine: &SyncEngine, title: String, content: String) -> CliResult<Note> {
    refresh(engine, &title).await;
    Ok(engine.save_synced(&Note::new(title, content))?)
}

/// File values first, then flags.
fn resolve_config(cli: &Cli) -> CliResult<SyncConfig> {
    let mut config = match cli.config.as_ref() {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(db) = cli.db.clone() {
        config.db_path = Some(db);
    }
    if let Some(server) = cli.server.clone() {
        config.remote_base_url = server;
    }
    config.validate()?;
    Ok(config)
}

async fn await_push(
    diagnostics: &mut broadcast::Receiver<SyncDiagnostic>,
    stored: &Note,
    wait: Duration,
) -> CliResult<()> {
    let outcome = tokio::time::timeout(wait, async {
        loop {
            match diagnostics.recv().await {
                Ok(SyncDiagnostic::RemoteStored { title, version })
                    if title == stored.title && version == stored.version =>
                {
                    return Ok(());
                }
                Ok(SyncDiagnostic::PushSuperseded { title, version })
                    if title == stored.title && version == stored.version =>
                {
                    return Ok(());
                }
                Ok(SyncDiagnostic::RemoteStoreFailed {
                    title,
                    version,
                    error,
                }) if title == stored.title && version == stored.version => {
                    return Err(error);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            eprintln!("notesync: saved locally, push failed: {err}");
            Ok(())
        }
        Err(_) => {
            eprintln!("notesync: saved locally, push still pending");
            Ok(())
        }
    }
}

fn print_note(note: Option<&Note>) -> CliResult<()> {
    println!("{}", serde_json::to_string(&note)?);
    Ok(())
}
