//! Live Notes CLI
//!
//! Runs a hub or satellite sync worker around livenotes-core.
//!
//! ## Usage
//!
//! ```bash
//! # Hub: talk to the server, serve satellites over TCP, read notes from stdin
//! livenotes hub --server-host 192.168.10.161 --listen 0.0.0.0:7878
//! echo "Groceries | oat milk | Home" | livenotes hub --no-server
//!
//! # Satellite: dial the hub's fallback listener
//! livenotes satellite --peer 192.168.10.20:7878
//!
//! # Hub and satellite in one process over the simulated radio
//! livenotes demo --notes 2
//!
//! # Offline note entry and cache inspection
//! livenotes note add "Title" "Content" --project Work
//! livenotes cache show
//! livenotes config show
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use livenotes_core::radio::sim::SimAir;
use livenotes_core::transport::ReconnectPolicy;
use livenotes_core::{
    EngineConfig, Note, PayloadMode, Radios, Role, SnapshotCache, SyncEngine, SyncError,
};
use tokio::io::AsyncBufReadExt;

/// Config file looked up inside the data directory
const CONFIG_FILE_NAME: &str = "livenotes.toml";

/// Live Notes - note sync between server, hub and satellite
#[derive(Parser)]
#[command(name = "livenotes")]
#[command(version = "0.1.0")]
#[command(about = "Live Notes - note sync between server, hub and satellite")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.livenotes)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data-dir>/livenotes.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the hub; notes are read from stdin as "title | content [| project]"
    Hub {
        /// Server host
        #[arg(long)]
        server_host: Option<String>,

        /// Server port
        #[arg(long)]
        server_port: Option<u16>,

        /// Do not connect to the server
        #[arg(long)]
        no_server: bool,

        /// Reconnect to the server with exponential backoff instead of waiting
        #[arg(long)]
        auto_reconnect: bool,

        /// Accept satellites over TCP on this address
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Run as a satellite; notes are read from stdin and forwarded to the hub
    Satellite {
        /// Hub fallback address, may be repeated
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
    },

    /// Run a hub and a satellite in one process over the simulated radio
    Demo {
        /// Notes to create on the hub
        #[arg(long, default_value_t = 2)]
        notes: usize,

        /// Split oversize pushes into chunks instead of truncating them
        #[arg(long)]
        chunked: bool,
    },

    /// Edit notes in the local cache without connecting
    Note {
        #[command(subcommand)]
        action: NoteAction,
    },

    /// Snapshot cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum NoteAction {
    /// Add a note
    Add {
        title: String,
        content: String,
        #[arg(short, long)]
        project: Option<String>,
    },
    /// List notes
    List,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print the cached snapshot
    Show,
    /// Delete the cached snapshot
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.livenotes)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".livenotes")
}

fn load_config(data_dir: &Path, path: Option<&Path>) -> Result<EngineConfig> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE_NAME));
    let mut config = EngineConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.data_dir = data_dir.to_path_buf();
    Ok(config)
}

/// Parse a stdin line of the form "title | content [| project]"
fn parse_note_line(line: &str) -> Option<Note> {
    let mut parts = line.splitn(3, '|').map(str::trim);
    let title = parts.next()?;
    let content = parts.next()?;
    let mut note = Note::new(title, content);
    if let Some(project) = parts.next().filter(|p| !p.is_empty()) {
        note = note.with_project(project);
    }
    Some(note)
}

/// Feed stdin notes into the engine and print status changes until Ctrl-C
async fn run_worker(engine: SyncEngine) -> Result<()> {
    let mut status = engine.subscribe_status();
    println!("status: {}", engine.status());

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match parse_note_line(&line) {
                    Some(note) => match engine.add_note(note).await {
                        Ok(stored) => println!("added: {}", stored.title),
                        Err(e) => eprintln!("Error: {}", e),
                    },
                    None => eprintln!("Expected \"title | content [| project]\""),
                },
                None => stdin_open = false,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let report = status.borrow_and_update().clone();
                println!("status: {}", report);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn run_demo(data_dir: &Path, notes: usize, chunked: bool) -> Result<()> {
    let air = SimAir::new();
    let peripheral = Arc::new(air.peripheral("AA:BB:CC:00:00:01", Some("LiveNotesHub")));
    let central = Arc::new(air.central("AA:BB:CC:00:00:02"));

    // Each run starts from empty caches.
    for dir in ["demo-hub", "demo-satellite"] {
        match std::fs::remove_dir_all(data_dir.join(dir)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut hub_config = EngineConfig::default();
    hub_config.data_dir = data_dir.join("demo-hub");
    hub_config.server.enabled = false;
    if chunked {
        hub_config.radio.payload_mode = PayloadMode::Chunked;
    }

    let mut satellite_config = EngineConfig::default();
    satellite_config.role = Role::Satellite;
    satellite_config.data_dir = data_dir.join("demo-satellite");

    let hub = SyncEngine::start(hub_config, Radios::hub(peripheral)).await?;
    let satellite = SyncEngine::start(satellite_config, Radios::satellite(central)).await?;

    let mut satellite_status = satellite.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(10),
        satellite_status.wait_for(|s| s.flags.peer_ready),
    )
    .await
    .context("Satellite never connected")??;
    println!("satellite: {}", satellite.status());

    for i in 1..=notes {
        hub.add_note(Note::new(format!("Note {}", i), "from the hub")).await?;
    }
    satellite
        .add_note(Note::new("Reply", "from the satellite"))
        .await?;

    let expected = notes + 1;
    let mut satellite_data = satellite.subscribe_dataset();
    let arrived = tokio::time::timeout(
        Duration::from_secs(10),
        satellite_data.wait_for(|env| env.notes.as_ref().map_or(0, Vec::len) == expected),
    )
    .await
    .map(|waited| waited.is_ok())
    .unwrap_or(false);

    let result = if arrived && hub.snapshot() == satellite.snapshot() {
        println!("converged: {} notes on both devices", expected);
        Ok(())
    } else {
        Err(anyhow!(
            "did not converge: hub has {} notes, satellite has {}",
            hub.snapshot().notes.map_or(0, |n| n.len()),
            satellite.snapshot().notes.map_or(0, |n| n.len()),
        ))
    };

    satellite.shutdown().await;
    hub.shutdown().await;
    result
}

fn print_notes(cache: &SnapshotCache) {
    let notes = cache.load().and_then(|env| env.notes).unwrap_or_default();
    if notes.is_empty() {
        println!("No notes.");
        return;
    }
    for note in notes {
        println!(
            "[{}] {}: {}",
            note.project_name.as_deref().unwrap_or("General"),
            note.title,
            note.content
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let mut config = load_config(&data_dir, cli.config.as_deref())?;

    match cli.command {
        Commands::Hub {
            server_host,
            server_port,
            no_server,
            auto_reconnect,
            listen,
        } => {
            config.role = Role::Hub;
            if let Some(host) = server_host {
                config.server.host = host;
            }
            if let Some(port) = server_port {
                config.server.port = port;
            }
            if no_server {
                config.server.enabled = false;
            }
            if auto_reconnect {
                config.server.reconnect = ReconnectPolicy::Backoff {
                    initial_ms: 1_000,
                    max_ms: 30_000,
                };
            }
            if listen.is_some() {
                config.fallback.listen = listen;
            }

            let engine = SyncEngine::start(config, Radios::none()).await?;
            if let Some(addr) = engine.fallback_addr() {
                println!("listening: {}", addr);
            }
            run_worker(engine).await?;
        }

        Commands::Satellite { peers } => {
            config.role = Role::Satellite;
            if !peers.is_empty() {
                config.fallback.paired_peers = peers;
            }
            if config.fallback.paired_peers.is_empty() {
                bail!("No hub to connect to; pass --peer or set fallback.paired_peers");
            }
            let engine = SyncEngine::start(config, Radios::none()).await?;
            run_worker(engine).await?;
        }

        Commands::Demo { notes, chunked } => {
            run_demo(&data_dir, notes, chunked).await?;
        }

        Commands::Note { action } => match action {
            NoteAction::Add {
                title,
                content,
                project,
            } => {
                config.role = Role::Hub;
                config.server.enabled = false;
                config.fallback.listen = None;
                let engine = SyncEngine::start(config, Radios::none()).await?;

                let mut note = Note::new(title, content);
                if let Some(project) = project {
                    note = note.with_project(project);
                }
                let added = engine.add_note(note).await;
                engine.shutdown().await;

                match added {
                    Ok(stored) => {
                        println!("Added note: {}", stored.title);
                        println!("  Project: {}", stored.project_name.unwrap_or_default());
                    }
                    Err(SyncError::InvalidNote(reason)) => bail!("Invalid note: {}", reason),
                    Err(e) => return Err(e.into()),
                }
            }
            NoteAction::List => print_notes(&SnapshotCache::in_dir(&data_dir)),
        },

        Commands::Cache { action } => {
            let cache = SnapshotCache::in_dir(&data_dir);
            match action {
                CacheAction::Show => match cache.load() {
                    Some(envelope) => println!("{}", serde_json::to_string_pretty(&envelope)?),
                    None => println!("No cached snapshot."),
                },
                CacheAction::Clear => match std::fs::remove_file(cache.path()) {
                    Ok(()) => println!("Cache cleared."),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        println!("No cached snapshot.")
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", config.to_toml()?),
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_note_line() {
        let note = parse_note_line("Groceries | oat milk | Home").unwrap();
        assert_eq!(note.title, "Groceries");
        assert_eq!(note.content, "oat milk");
        assert_eq!(note.project_name.as_deref(), Some("Home"));

        let note = parse_note_line("a|b").unwrap();
        assert!(note.project_name.is_none());

        assert!(parse_note_line("no separator").is_none());
    }

    #[test]
    fn test_project_keeps_extra_separators() {
        let note = parse_note_line("t | c | p | extra").unwrap();
        assert_eq!(note.project_name.as_deref(), Some("p | extra"));
    }
}
