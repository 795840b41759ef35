//! malachi-crawl - tell the malachi daemon a repository may have changed
//!
//! Meant for commit hooks: resolves the enclosing repository's top level
//! and writes a single `add` command to the daemon's pipe. Never waits on
//! a daemon that is not running.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command as Process;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use malachi_core::{Command, Paths};

/// malachi-crawl - notify the malachi daemon of a repository change
#[derive(Parser)]
#[command(name = "malachi-crawl")]
#[command(version)]
#[command(about = "Notify the malachi daemon that a repository may have changed")]
struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<()> {
    let start = match std::env::var_os("GIT_WORK_TREE") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let repo = toplevel(&start)?;
    debug!("Repository top level: {}", repo.display());

    let pipe_path = Paths::new().command_pipe();
    let mut pipe = open_pipe(&pipe_path)?;

    let line = Command::Add { path: repo.clone() }
        .encode()
        .context("Failed to encode command")?;
    pipe.write_all(&line)
        .with_context(|| format!("Failed to write to {}", pipe_path.display()))?;

    info!("Sent add for {}", repo.display());
    Ok(())
}

/// `git rev-parse --show-toplevel` run from `dir`
fn toplevel(dir: &Path) -> Result<PathBuf> {
    let output = Process::new("git")
        .arg("-C")
        .arg(dir)
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .context("Failed to run git")?;

    if !output.status.success() {
        bail!(
            "Not inside a git repository: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let path = String::from_utf8(output.stdout).context("git printed a non UTF-8 path")?;
    Ok(PathBuf::from(path.trim_end_matches('\n')))
}

/// Open the daemon's pipe for writing without blocking on a missing reader
fn open_pipe(path: &Path) -> Result<File> {
    let meta = std::fs::metadata(path).with_context(|| {
        format!(
            "Command pipe {} not found, is the daemon running?",
            path.display()
        )
    })?;
    if !meta.file_type().is_fifo() {
        bail!("{} is not a named pipe", path.display());
    }

    let file = match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
            bail!("Daemon not running: no reader on {}", path.display())
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open {}", path.display()));
        }
    };

    set_blocking(&file).with_context(|| format!("Failed to configure {}", path.display()))?;
    Ok(file)
}

/// A full pipe should make the write wait, not fail
fn set_blocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
