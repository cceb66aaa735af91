//! PID-file lifecycle: refuse a second daemon on the same file, clean up a
//! stale file left by a crash, and remove our own on clean shutdown.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("another daemon is already running with pid {0}")]
    AlreadyRunning(i32),
    #[error("io error accessing pid file: {0}")]
    Io(#[from] std::io::Error),
    #[error("pid file contents are not a valid process id: {0}")]
    Malformed(String),
}

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Checks for a live process holding `path`, removing it if stale, then
    /// writes the current process id. Fails if another process is alive.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();

        if let Some(existing_pid) = read_pid(&path)? {
            if process_alive(existing_pid) {
                return Err(PidFileError::AlreadyRunning(existing_pid));
            }
            tracing::warn!(pid = existing_pid, "removing stale pid file");
            std::fs::remove_file(&path)?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }

    pub fn release(&self) {
        std::fs::remove_file(&self.path).ok();
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(path: &Path) -> Result<Option<i32>, PidFileError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<i32>()
                .map(Some)
                .map_err(|_| PidFileError::Malformed(trimmed.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// `kill(pid, 0)` sends no signal; it only checks whether the pid exists
/// and is owned by us (or we have permission to signal it).
fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_current_pid_and_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messaged.pid");
        {
            let _pid_file = PidFile::acquire(&path).unwrap();
            let contents = std::fs::read_to_string(&path).unwrap();
            assert_eq!(contents.trim(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn acquire_cleans_up_stale_pid_from_dead_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messaged.pid");
        // pid 2^30-ish is astronomically unlikely to be a live process.
        std::fs::write(&path, "999999").unwrap();
        let pid_file = PidFile::acquire(&path);
        assert!(pid_file.is_ok());
    }

    #[test]
    fn acquire_rejects_when_pid_is_self() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messaged.pid");
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        let result = PidFile::acquire(&path);
        assert!(matches!(result, Err(PidFileError::AlreadyRunning(_))));
    }
}
