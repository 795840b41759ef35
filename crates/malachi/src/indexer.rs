//! Incremental indexing
//!
//! Brings the index for one repository up to date with its head:
//!
//! | stored commit | head | action                          |
//! |---------------|------|---------------------------------|
//! | none          | H    | full index of the tree at H     |
//! | S             | S    | nothing                         |
//! | S             | H    | apply diff(S, H) to the leaves  |
//!
//! The stored commit only moves once every leaf mutation has landed. A
//! failure part way leaves it at S, and since every mutation is keyed by
//! path, the next `add` simply replays the same diff.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::inspector::{ChangeStatus, Inspector};
use crate::store::IndexStore;

/// What a reconciliation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// First index of the repository
    Full { commit: String, leaves: usize },
    /// Differential update between two commits
    Differential {
        from: String,
        to: String,
        added: usize,
        modified: usize,
        removed: usize,
    },
    /// Index already at head
    Current { commit: String },
}

impl Reconciliation {
    /// Commit the index now reflects
    pub fn commit(&self) -> &str {
        match self {
            Reconciliation::Full { commit, .. } => commit,
            Reconciliation::Differential { to, .. } => to,
            Reconciliation::Current { commit } => commit,
        }
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reconciliation::Full { commit, leaves } => {
                write!(f, "indexed {} files at {}", leaves, commit)
            }
            Reconciliation::Differential {
                from,
                to,
                added,
                modified,
                removed,
            } => write!(
                f,
                "updated {} -> {} (+{} ~{} -{})",
                from, to, added, modified, removed
            ),
            Reconciliation::Current { commit } => write!(f, "already up to date at {}", commit),
        }
    }
}

pub struct Indexer<I> {
    store: IndexStore,
    inspector: I,
}

impl<I: Inspector> Indexer<I> {
    pub fn new(store: IndexStore, inspector: I) -> Self {
        Self { store, inspector }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn inspector(&self) -> &I {
        &self.inspector
    }

    /// Reconcile the index for `repo` with its current head
    pub fn reconcile(&mut self, repo: &Path) -> Result<Reconciliation> {
        let head = self
            .inspector
            .head(repo)
            .with_context(|| format!("Failed to get HEAD for {}", repo.display()))?;

        // Always read fresh: nothing about a root is cached between commands
        match self.store.root_commit(repo)? {
            None => {
                info!("Initial indexing of {} at {}", repo.display(), head);
                self.index_full(repo, &head)
            }
            Some(stored) if stored == head => {
                info!("Repository {} already up to date at {}", repo.display(), head);
                Ok(Reconciliation::Current { commit: head })
            }
            Some(stored) => {
                info!("Updating {} from {} to {}", repo.display(), stored, head);
                self.index_diff(repo, &stored, &head)
            }
        }
    }

    fn index_full(&mut self, repo: &Path, head: &str) -> Result<Reconciliation> {
        let entries = self
            .inspector
            .tree(repo, head)
            .with_context(|| format!("Failed to list tree of {} at {}", repo.display(), head))?;

        let root_id = self.store.ensure_root(repo)?;
        let leaves = self.store.replace_leaves(root_id, &entries)?;
        self.store.set_root_commit(repo, head)?;

        Ok(Reconciliation::Full {
            commit: head.to_string(),
            leaves,
        })
    }

    fn index_diff(&mut self, repo: &Path, from: &str, to: &str) -> Result<Reconciliation> {
        let changes = self
            .inspector
            .diff(repo, from, to)
            .with_context(|| {
                format!("Failed to diff {} from {} to {}", repo.display(), from, to)
            })?;

        let Some(root_id) = self.store.root_id(repo)? else {
            bail!("Failed to get repo ID for {}", repo.display());
        };

        let wanted: Vec<String> = changes
            .iter()
            .filter(|c| c.status != ChangeStatus::Removed)
            .map(|c| c.hash.clone())
            .collect();
        let sizes: HashMap<String, u64> = if wanted.is_empty() {
            HashMap::new()
        } else {
            self.inspector
                .sizes(repo, &wanted)
                .with_context(|| format!("Failed to read blob sizes in {}", repo.display()))?
        };
        let size_of = |hash: &str| {
            sizes.get(hash).copied().unwrap_or_else(|| {
                debug!("No size for blob {}, recording 0", hash);
                0
            })
        };

        let (mut added, mut modified, mut removed) = (0, 0, 0);
        for change in &changes {
            match change.status {
                ChangeStatus::Added => {
                    self.store
                        .upsert_leaf(root_id, &change.path, &change.hash, size_of(&change.hash))?;
                    added += 1;
                }
                ChangeStatus::Modified => {
                    let size = size_of(&change.hash);
                    if !self.store.update_leaf(root_id, &change.path, &change.hash, size)? {
                        warn!("Modified leaf {} was not indexed, inserting", change.path);
                        self.store.upsert_leaf(root_id, &change.path, &change.hash, size)?;
                    }
                    modified += 1;
                }
                ChangeStatus::Removed => {
                    if !self.store.remove_leaf(root_id, &change.path)? {
                        debug!("Removed leaf {} was not indexed", change.path);
                    }
                    removed += 1;
                }
            }
        }

        self.store.set_root_commit(repo, to)?;

        Ok(Reconciliation::Differential {
            from: from.to_string(),
            to: to.to_string(),
            added,
            modified,
            removed,
        })
    }
}
