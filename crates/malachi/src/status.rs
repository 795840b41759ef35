//! Status side channel
//!
//! For each repository, a one-line file under `<runtime>/roots/` mirroring
//! the repository's absolute path holds the last commit the daemon
//! committed to the index. Consumers that cannot open the database compare
//! it against the repository's head.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StatusPublisher {
    root: PathBuf,
}

impl StatusPublisher {
    /// `root` is the `roots` directory itself, e.g. `Paths::status_root()`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where the status of `repo` lives: the repository path with its
    /// leading `/` stripped, joined under the status root
    pub fn status_path(&self, repo: &Path) -> PathBuf {
        let relative: PathBuf = repo
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.root.join(relative)
    }

    /// Write `commit` as the sole line of the repository's status file
    pub fn publish(&self, repo: &Path, commit: &str) -> io::Result<PathBuf> {
        let path = self.status_path(repo);
        if let Some(parent) = path.parent() {
            DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
        }
        fs::write(&path, format!("{}\n", commit))?;
        Ok(path)
    }

    /// Read back the published commit, if any
    pub fn read(&self, repo: &Path) -> io::Result<Option<String>> {
        match fs::read_to_string(self.status_path(repo)) {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
