//! Command pipe
//!
//! A named FIFO that any local process may write commands into. The daemon
//! is its only reader and removes it on exit.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::net::unix::pipe::{OpenOptions, Receiver};
use tracing::{debug, warn};

/// Writable by everyone, readable only by the owner
pub const PIPE_MODE: u32 = 0o622;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("{0} exists and is not a FIFO")]
    NotAFifo(PathBuf),

    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipeError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        PipeError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Owns the FIFO on disk; dropping it unlinks the path
#[derive(Debug)]
pub struct CommandPipe {
    path: PathBuf,
}

impl CommandPipe {
    /// Create the FIFO at `path`, replacing one left behind by an earlier
    /// run. Any other kind of file at `path` is left alone and reported.
    pub fn create(path: &Path) -> Result<Self, PipeError> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_fifo() => {
                warn!("Removing stale command pipe {}", path.display());
                fs::remove_file(path).map_err(|e| PipeError::io("remove", path, e))?;
            }
            Ok(_) => return Err(PipeError::NotAFifo(path.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipeError::io("stat", path, e)),
        }

        mkfifo(path, PIPE_MODE).map_err(|e| PipeError::io("mkfifo", path, e))?;

        let pipe = Self {
            path: path.to_path_buf(),
        };
        // mkfifo honours the umask
        fs::set_permissions(path, fs::Permissions::from_mode(PIPE_MODE))
            .map_err(|e| PipeError::io("chmod", path, e))?;

        debug!("Created command pipe {}", path.display());
        Ok(pipe)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh non-blocking read end. Must be called from within a
    /// tokio runtime.
    pub fn open_receiver(&self) -> io::Result<Receiver> {
        OpenOptions::new().open_receiver(&self.path)
    }
}

impl Drop for CommandPipe {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed command pipe {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

fn mkfifo(path: &Path, mode: u32) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_sets_mode_and_drop_unlinks() -> io::Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("command");

        let pipe = CommandPipe::create(&path).unwrap();
        let meta = fs::symlink_metadata(pipe.path())?;
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.permissions().mode() & 0o777, PIPE_MODE);

        drop(pipe);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_stale_fifo_is_replaced() -> io::Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("command");
        mkfifo(&path, 0o600)?;

        let pipe = CommandPipe::create(&path).unwrap();
        let meta = fs::symlink_metadata(pipe.path())?;
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.permissions().mode() & 0o777, PIPE_MODE);
        Ok(())
    }

    #[test]
    fn test_regular_file_is_refused() -> io::Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("command");
        fs::write(&path, "not a pipe")?;

        let err = CommandPipe::create(&path).unwrap_err();
        assert!(matches!(err, PipeError::NotAFifo(_)));
        assert_eq!(fs::read_to_string(&path)?, "not a pipe");
        Ok(())
    }

    #[test]
    fn test_missing_directory_is_an_io_error() {
        let err = CommandPipe::create(Path::new("/nonexistent/malachi/command")).unwrap_err();
        assert!(matches!(err, PipeError::Io { action: "mkfifo", .. }));
    }

    #[tokio::test]
    async fn test_receiver_opens_without_writer() -> io::Result<()> {
        let tmp = TempDir::new()?;
        let pipe = CommandPipe::create(&tmp.path().join("command")).unwrap();
        pipe.open_receiver()?;
        Ok(())
    }
}
