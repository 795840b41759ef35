//! malachi - git repository indexing daemon
//!
//! Runs in the foreground until a `shutdown` command arrives on the
//! command pipe or the process receives SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use malachi::{
    spawn_signal_bridge, Daemon, Dispatcher, GitInspector, IndexStore, Indexer, ShutdownFlag,
    StatusPublisher,
};
use malachi_core::{Config, Paths};

/// malachi - git repository indexing daemon
#[derive(Parser)]
#[command(name = "malachi")]
#[command(about = "Git repository indexing daemon")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Print component versions and exit
    #[arg(short = 'v', long)]
    version: bool,

    /// Print resolved directories and exit
    #[arg(short = 'c', long)]
    config: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if cli.version {
        print_version();
        return Ok(());
    }

    let paths = Paths::new();

    if cli.config {
        print_config(&paths);
        return Ok(());
    }

    debug!("Debug logging enabled");
    let code = run_daemon(paths)?;
    std::process::exit(code);
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_version() {
    println!("malachi={}", env!("CARGO_PKG_VERSION"));
    println!("sqlite={}", rusqlite::version());
    match GitInspector::discover(None).version() {
        Some(version) => println!("git={}", version),
        None => println!("git=unavailable"),
    }
}

fn print_config(paths: &Paths) {
    println!("platform={}", std::env::consts::OS);
    println!("configdir={}", paths.config.display());
    println!("datadir={}", paths.data.display());
    println!("cachedir={}", paths.cache.display());
    println!("runtimedir={}", paths.runtime.display());
}

fn run_daemon(paths: Paths) -> Result<i32> {
    let config = Config::load(&paths.config_file())?;

    let inspector = GitInspector::discover(config.git.as_deref());
    info!("Using git at {}", inspector.git().display());

    let store = IndexStore::open(&paths.index_db())?;
    info!("Index database: {}", store.path().display());

    let dispatcher = Dispatcher::new(
        Indexer::new(store, inspector),
        StatusPublisher::new(paths.status_root()),
    );
    let daemon = Daemon::new(paths, &config, dispatcher);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    let shutdown = ShutdownFlag::new();
    Ok(rt.block_on(async move {
        if let Err(e) = spawn_signal_bridge(shutdown.clone()) {
            warn!("Failed to install signal handlers: {}", e);
        }
        daemon.run(shutdown).await
    }))
}
