//! Shutdown signalling
//!
//! SIGINT and SIGTERM only raise a flag. The event loop checks it at the
//! top of every iteration, so a command being processed always finishes
//! first.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    /// Signal number that raised the flag, 0 if none
    signal: AtomicI32,
    wake: Notify,
}

/// Cloneable handle to the process-wide shutdown flag
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<Inner>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag without a signal
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    pub fn request_by_signal(&self, signo: i32) {
        self.inner.signal.store(signo, Ordering::SeqCst);
        self.request();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// The signal that caused the shutdown, if any
    pub fn signal(&self) -> Option<i32> {
        match self.inner.signal.load(Ordering::SeqCst) {
            0 => None,
            signo => Some(signo),
        }
    }

    /// Resolves once the flag is raised
    pub async fn wait(&self) {
        while !self.is_requested() {
            self.inner.wake.notified().await;
        }
    }
}

/// Forward SIGINT and SIGTERM into `flag`. Must be called from within a
/// tokio runtime.
pub fn spawn_signal_bridge(flag: ShutdownFlag) -> io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let signo = tokio::select! {
            _ = sigint.recv() => libc::SIGINT,
            _ = sigterm.recv() => libc::SIGTERM,
        };
        info!("Received signal {}", signal_name(signo));
        flag.request_by_signal(signo);
    }))
}

pub fn signal_name(signo: i32) -> &'static str {
    match signo {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        _ => "unknown",
    }
}
