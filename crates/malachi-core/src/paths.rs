//! Standard paths used by malachi
//!
//! The daemon and the crawler must agree on the runtime directory, since
//! that is where the command pipe lives.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "malachi";

/// Standard malachi paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Config directory (~/.config/malachi)
    pub config: PathBuf,
    /// Data directory (~/.local/share/malachi)
    pub data: PathBuf,
    /// Cache directory (~/.cache/malachi), holds the index database
    pub cache: PathBuf,
    /// Runtime directory ($XDG_RUNTIME_DIR/malachi or /tmp/malachi-<uid>)
    pub runtime: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join(APP_NAME);

        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join(APP_NAME);

        let cache = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("~/.cache"))
            .join(APP_NAME);

        Self {
            config,
            data,
            cache,
            runtime: runtime_dir(),
        }
    }

    /// Lay every directory out under a single root (tests, sandboxes)
    pub fn under(root: &Path) -> Self {
        Self {
            config: root.join("config"),
            data: root.join("data"),
            cache: root.join("cache"),
            runtime: root.join(APP_NAME),
        }
    }

    /// Named pipe the daemon reads commands from
    pub fn command_pipe(&self) -> PathBuf {
        self.runtime.join("command")
    }

    /// Base of the per-repository status tree
    pub fn status_root(&self) -> PathBuf {
        self.runtime.join("roots")
    }

    /// SQLite index database
    pub fn index_db(&self) -> PathBuf {
        self.cache.join("index.db")
    }

    /// Optional settings file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.json")
    }
}

/// Per-user runtime directory.
///
/// Prefers `$XDG_RUNTIME_DIR` (or `/run/user/<uid>`) when it exists and is
/// writable, falling back to a uid-suffixed directory under the system
/// temp dir.
fn runtime_dir() -> PathBuf {
    // SAFETY: getuid has no preconditions and cannot fail
    let uid = unsafe { libc::getuid() };

    let base = dirs::runtime_dir().unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", uid)));
    if is_writable_dir(&base) {
        return base.join(APP_NAME);
    }

    std::env::temp_dir().join(format!("{}-{}", APP_NAME, uid))
}

/// Directory the current user may create entries in, per `access(2)`
fn is_writable_dir(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}
