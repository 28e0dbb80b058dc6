use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use scan_sorter::directory::ConfiguredDirectory;
use scan_sorter::event::DaemonEvent;
use scan_sorter::relocate::Relocator;
use scan_sorter::sorter::SortingOrchestrator;
use scan_sorter::supervisor::Supervisor;
use scan_sorter::{config, logging, paths};

/// Moves scanned documents from per-user drop folders into each user's home
/// directory.
#[derive(Parser, Debug)]
#[command(name = "scan-sorter", version)]
struct Args {
    /// Config file. Defaults to scan-sorter.toml next to the executable.
    #[arg(short, long, env = "SCAN_SORTER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = args.config.unwrap_or_else(paths::default_config_path);
    let config = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e:#}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.prepare_paths() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }

    // ── Logging ───────────────────────────────────────────────────────────────
    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    info!("scan-sorter v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", config_path.display());

    // ── Sorter ────────────────────────────────────────────────────────────────
    let relocator = Relocator::new(
        config.relocation.users_subdir.clone(),
        config.quarantine_path(),
        Arc::new(ConfiguredDirectory::from_config(&config.directory)),
    );
    let (event_tx, event_rx) = mpsc::unbounded_channel::<DaemonEvent>();
    let sorter = SortingOrchestrator::new(
        config.watch.clone(),
        relocator,
        config.relocation.stability_policy(),
        event_tx.clone(),
    );

    let mut supervisor = Supervisor::new(sorter, paths::status_file_path(&config_path));
    if let Err(e) = supervisor.start() {
        error!("Failed to start scan sorter: {e:#}");
        std::process::exit(1);
    }

    // Graceful shutdown on Ctrl+C.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = event_tx.send(DaemonEvent::Shutdown);
        }
    });

    // ── Event loop ────────────────────────────────────────────────────────────
    let status = supervisor.run(event_rx).await;
    info!("scan-sorter stopped after {} restart(s)", status.restarts);
}
