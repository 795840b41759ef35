//! Command dispatch

use malachi_core::protocol::Command;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::indexer::Indexer;
use crate::inspector::Inspector;
use crate::status::StatusPublisher;

/// Whether the event loop should keep going after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

pub trait CommandHandler {
    fn handle(&mut self, command: Command) -> Flow;
}

/// Routes decoded commands to the indexing engine
pub struct Dispatcher<I> {
    indexer: Indexer<I>,
    status: StatusPublisher,
}

impl<I: Inspector> Dispatcher<I> {
    pub fn new(indexer: Indexer<I>, status: StatusPublisher) -> Self {
        Self { indexer, status }
    }

    pub fn indexer(&self) -> &Indexer<I> {
        &self.indexer
    }

    pub fn status(&self) -> &StatusPublisher {
        &self.status
    }

    fn add(&mut self, repo: &Path) {
        info!("Add repository: {}", repo.display());

        let outcome = match self.indexer.reconcile(repo) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Indexing {} failed: {:#}", repo.display(), e);
                return;
            }
        };
        info!("{}: {}", repo.display(), outcome);

        match self.status.publish(repo, outcome.commit()) {
            Ok(path) => debug!("Status written to {}", path.display()),
            Err(e) => warn!("Failed to publish status for {}: {}", repo.display(), e),
        }
    }
}

impl<I: Inspector> CommandHandler for Dispatcher<I> {
    fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Add { path } => {
                self.add(&path);
                Flow::Continue
            }
            Command::Remove { path } => {
                info!("Remove repository: {} (not implemented)", path.display());
                Flow::Continue
            }
            Command::Query {
                query_id,
                terms,
                repo_filter,
            } => {
                info!(
                    "Query {}: {:?} (filter: {})",
                    query_id,
                    terms,
                    repo_filter.as_deref().unwrap_or("none")
                );
                Flow::Continue
            }
            Command::Shutdown => {
                info!("Shutdown requested");
                Flow::Shutdown
            }
        }
    }
}
