//! Repository inspection
//!
//! Everything the daemon knows about a repository's content comes from
//! here. The git implementation shells out to the `git` executable; the
//! path to it is fixed when the inspector is built.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use thiserror::Error;
use tracing::{debug, warn};

/// Mode git uses for submodule (gitlink) entries
const GITLINK_MODE: &str = "160000";

#[derive(Error, Debug)]
pub enum InspectorError {
    #[error("git executable not found: {0}")]
    ToolMissing(PathBuf),

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("unexpected git output: {0}")]
    Parse(String),
}

/// One file in a full tree listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeStatus {
    Added,
    Modified,
    Removed,
}

/// One entry of a tree diff. For removals `hash` is the old blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub status: ChangeStatus,
    pub path: String,
    pub hash: String,
}

/// Synchronous, fallible queries against a repository
pub trait Inspector {
    /// Current head commit
    fn head(&self, repo: &Path) -> Result<String, InspectorError>;

    /// Every file at `commit`
    fn tree(&self, repo: &Path, commit: &str) -> Result<Vec<TreeEntry>, InspectorError>;

    /// Files that differ between two commits
    fn diff(&self, repo: &Path, from: &str, to: &str) -> Result<Vec<Change>, InspectorError>;

    /// Sizes of the given blobs, in one round trip. Unknown blobs are left
    /// out of the map.
    fn sizes(
        &self,
        repo: &Path,
        hashes: &[String],
    ) -> Result<HashMap<String, u64>, InspectorError>;
}

/// Inspector backed by the git command line
#[derive(Debug, Clone)]
pub struct GitInspector {
    git: PathBuf,
}

impl GitInspector {
    pub fn new(git: impl Into<PathBuf>) -> Self {
        Self { git: git.into() }
    }

    /// Use `configured` when given, otherwise look git up on PATH.
    ///
    /// A git that cannot be found is not fatal here: every command will fail
    /// with [`InspectorError::ToolMissing`] until it is installed.
    pub fn discover(configured: Option<&Path>) -> Self {
        if let Some(git) = configured {
            return Self::new(git);
        }
        match which::which("git") {
            Ok(git) => Self::new(git),
            Err(e) => {
                warn!("git command not found on PATH: {}", e);
                Self::new("git")
            }
        }
    }

    pub fn git(&self) -> &Path {
        &self.git
    }

    /// `git --version`, if git runs at all
    pub fn version(&self) -> Option<String> {
        let output = Command::new(&self.git).arg("--version").output().ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Some(text.trim().trim_start_matches("git version ").to_string())
    }

    fn command(&self, repo: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.git);
        cmd.arg("-C").arg(repo).args(args);
        // Read-only queries should never contend for the index lock
        cmd.env("GIT_OPTIONAL_LOCKS", "0");
        cmd
    }

    fn describe(args: &[&str]) -> String {
        format!("git {}", args.first().copied().unwrap_or_default())
    }

    fn spawn_error(&self, args: &[&str], source: std::io::Error) -> InspectorError {
        if source.kind() == std::io::ErrorKind::NotFound {
            InspectorError::ToolMissing(self.git.clone())
        } else {
            InspectorError::Spawn {
                command: Self::describe(args),
                source,
            }
        }
    }

    fn check(args: &[&str], output: Output) -> Result<Vec<u8>, InspectorError> {
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(InspectorError::Failed {
                command: Self::describe(args),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn run(&self, repo: &Path, args: &[&str]) -> Result<Vec<u8>, InspectorError> {
        debug!("{} in {}", Self::describe(args), repo.display());
        let output = self
            .command(repo, args)
            .output()
            .map_err(|e| self.spawn_error(args, e))?;
        Self::check(args, output)
    }

    fn run_with_input(
        &self,
        repo: &Path,
        args: &[&str],
        input: &[u8],
    ) -> Result<Vec<u8>, InspectorError> {
        debug!("{} in {} ({} bytes of input)", Self::describe(args), repo.display(), input.len());
        let mut child = self
            .command(repo, args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(args, e))?;

        // Feed stdin from a second thread so a full stdout pipe cannot
        // deadlock us against git.
        let stdin = child.stdin.take();
        let output = std::thread::scope(|scope| {
            let writer = scope.spawn(move || -> std::io::Result<()> {
                if let Some(mut stdin) = stdin {
                    stdin.write_all(input)?;
                }
                Ok(())
            });
            let output = child.wait_with_output();
            let written = writer.join().unwrap_or_else(|_| {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "stdin writer panicked"))
            });
            output.and_then(|o| written.map(|_| o))
        })
        .map_err(|e| InspectorError::Spawn {
            command: Self::describe(args),
            source: e,
        })?;

        Self::check(args, output)
    }
}

impl Inspector for GitInspector {
    fn head(&self, repo: &Path) -> Result<String, InspectorError> {
        let stdout = self.run(repo, &["rev-parse", "--verify", "HEAD"])?;
        let head = String::from_utf8_lossy(&stdout).trim().to_string();
        if head.is_empty() {
            return Err(InspectorError::Parse("empty rev-parse output".to_string()));
        }
        Ok(head)
    }

    fn tree(&self, repo: &Path, commit: &str) -> Result<Vec<TreeEntry>, InspectorError> {
        let stdout = self.run(repo, &["ls-tree", "-r", "-l", "-z", commit])?;
        parse_ls_tree(&stdout)
    }

    fn diff(&self, repo: &Path, from: &str, to: &str) -> Result<Vec<Change>, InspectorError> {
        let stdout = self.run(
            repo,
            &["diff-tree", "-r", "-z", "--raw", "--no-renames", from, to],
        )?;
        parse_diff_tree(&stdout)
    }

    fn sizes(
        &self,
        repo: &Path,
        hashes: &[String],
    ) -> Result<HashMap<String, u64>, InspectorError> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let mut input = hashes.join("\n");
        input.push('\n');
        let stdout = self.run_with_input(repo, &["cat-file", "--batch-check"], input.as_bytes())?;
        Ok(parse_batch_check(&String::from_utf8_lossy(&stdout)))
    }
}

/// Parse `git ls-tree -r -l -z`: `<mode> <type> <object> <size>\t<path>\0`
pub fn parse_ls_tree(output: &[u8]) -> Result<Vec<TreeEntry>, InspectorError> {
    let mut entries = Vec::new();

    for record in output.split(|&b| b == 0).filter(|r| !r.is_empty()) {
        let record = String::from_utf8_lossy(record);
        let (info, path) = record.split_once('\t').ok_or_else(|| {
            InspectorError::Parse(format!("ls-tree record without path: {}", record))
        })?;

        let fields: Vec<&str> = info.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(InspectorError::Parse(format!("ls-tree record: {}", record)));
        }
        // Submodules show up as commits with no size
        if fields[1] != "blob" {
            continue;
        }
        let size = fields[3]
            .parse::<u64>()
            .map_err(|_| InspectorError::Parse(format!("ls-tree size: {}", fields[3])))?;

        entries.push(TreeEntry {
            path: path.to_string(),
            hash: fields[2].to_string(),
            size,
        });
    }

    Ok(entries)
}

/// Parse `git diff-tree -r -z --raw`.
///
/// Each entry is `:<old mode> <new mode> <old sha> <new sha> <status>\0<path>\0`.
pub fn parse_diff_tree(output: &[u8]) -> Result<Vec<Change>, InspectorError> {
    let mut changes = Vec::new();
    let mut fields = output.split(|&b| b == 0).filter(|f| !f.is_empty());

    while let Some(info) = fields.next() {
        let info = String::from_utf8_lossy(info);
        let path = fields
            .next()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .ok_or_else(|| {
                InspectorError::Parse(format!("diff-tree entry without path: {}", info))
            })?;

        let parts: Vec<&str> = info.trim_start_matches(':').split_whitespace().collect();
        if parts.len() != 5 {
            return Err(InspectorError::Parse(format!("diff-tree entry: {}", info)));
        }
        let (old_mode, new_mode, old_hash, new_hash) = (parts[0], parts[1], parts[2], parts[3]);

        // Gitlinks are never leaves, so a change into or out of one is a
        // removal or an addition from the index's point of view
        let was_leaf = old_mode != GITLINK_MODE;
        let is_leaf = new_mode != GITLINK_MODE;

        let change = match (parts[4].chars().next(), was_leaf, is_leaf) {
            (Some('A'), _, true) => Some((ChangeStatus::Added, new_hash)),
            (Some('D'), true, _) => Some((ChangeStatus::Removed, old_hash)),
            (Some('M') | Some('T'), true, true) => Some((ChangeStatus::Modified, new_hash)),
            (Some('M') | Some('T'), true, false) => Some((ChangeStatus::Removed, old_hash)),
            (Some('M') | Some('T'), false, true) => Some((ChangeStatus::Added, new_hash)),
            (Some('A' | 'D' | 'M' | 'T'), _, _) => None,
            _ => {
                warn!("Skipping diff entry with status {} for {}", parts[4], path);
                None
            }
        };

        if let Some((status, hash)) = change {
            changes.push(Change {
                status,
                path,
                hash: hash.to_string(),
            });
        }
    }

    Ok(changes)
}

/// Parse `git cat-file --batch-check`: `<object> <type> <size>` per line,
/// or `<object> missing`.
pub fn parse_batch_check(output: &str) -> HashMap<String, u64> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                [hash, _kind, size] => size.parse().ok().map(|s| (hash.to_string(), s)),
                _ => None,
            }
        })
        .collect()
}
