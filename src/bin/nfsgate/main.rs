use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use nfsgate::fhdb::{FileHandle, HandleStore};
use nfsgate::kernel::access::normalize;
use nfsgate::kernel::handlers::PortmapService;
use nfsgate::kernel::protocol::context::ServerConfig;
use nfsgate::logging::init_tracing;
use nfsgate::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "nfsgate", version, about = "Administers an nfsgate handle store")]
struct Cli {
    /// Settings file; NFSGATE_SECTION__KEY variables override it.
    #[arg(short, long, default_value = "config/settings.toml")]
    config: PathBuf,

    /// Handle store directory, overriding `database.location`.
    #[arg(long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validates the settings, opens the handle store and repairs it.
    Check,
    /// Lists every path-to-handle mapping.
    Dump {
        #[arg(long)]
        json: bool,
    },
    /// Prints the path a handle currently names.
    Resolve { handle: String },
    /// Prints the handle of an exported path, minting one if needed.
    Lookup { path: PathBuf },
    /// Drops mapping halves left behind by an interrupted rename.
    Repair,
}

async fn run(command: Command, settings: &Settings, fhdb: &HandleStore) -> Result<()> {
    match command {
        Command::Check => {
            let config = ServerConfig::from_settings(settings);
            if config.exports.is_empty() {
                warn!("no exports configured; every path is mountable");
            }
            for root in config.exports.roots() {
                let meta = tokio::fs::metadata(root)
                    .await
                    .with_context(|| format!("export {}", root.display()))?;
                if !meta.is_dir() {
                    bail!("export {} is not a directory", root.display());
                }
                println!("export  {}", root.display());
            }
            for (name, mapping) in PortmapService::from_settings(&settings.portmap).entries() {
                println!("program {} {} v{} -> {}", name, mapping.prog, mapping.vers, mapping.port);
            }
            let report = fhdb.repair().await?;
            if !report.is_clean() {
                warn!("repair removed {:?}", report);
            }
            let entries = fhdb.entries().await?;
            println!("store   {} handles", entries.len());
        }
        Command::Dump { json } => {
            let entries = fhdb.entries().await?;
            if json {
                let rows: Vec<_> = entries
                    .iter()
                    .map(|(path, handle)| {
                        serde_json::json!({
                            "path": path.to_string_lossy(),
                            "handle": handle.to_string(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for (path, handle) in entries {
                    println!("{}  {}", handle, path.display());
                }
            }
        }
        Command::Resolve { handle } => {
            let handle: FileHandle = handle.parse()?;
            println!("{}", fhdb.resolve(&handle).await?.display());
        }
        Command::Lookup { path } => {
            let config = ServerConfig::from_settings(settings);
            let path = if path.is_absolute() {
                normalize(&path)
            } else {
                normalize(&std::env::current_dir()?.join(path))
            };
            if !config.exports.permits(&path) {
                bail!("{} is outside every export", path.display());
            }
            tokio::fs::symlink_metadata(&path)
                .await
                .with_context(|| format!("stat {}", path.display()))?;
            println!("{}", fhdb.lookup_or_create(&path).await?);
        }
        Command::Repair => {
            let report = fhdb.repair().await?;
            if report.is_clean() {
                println!("store is consistent");
            } else {
                println!(
                    "removed {} forward and {} reverse orphans",
                    report.orphaned_forward, report.orphaned_reverse
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&settings.logging);
    info!("nfsgate {}", env!("CARGO_PKG_VERSION"));

    let location = cli.database.unwrap_or_else(|| settings.database.location.clone());
    let fhdb: Arc<HandleStore> = HandleStore::open(&location);
    fhdb.wait_ready()
        .await
        .with_context(|| format!("opening handle store at {}", location.display()))?;

    let outcome = tokio::select! {
        outcome = run(cli.command, &settings, &fhdb) => outcome,
        _ = signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };

    if let Err(e) = fhdb.close().await {
        warn!("closing handle store: {}", e);
    }
    outcome
}
