//! One build per output directory.
//!
//! Two pipelines sharing an output directory would overwrite each other's
//! working tree and stamps. [`BuildLock`] holds an exclusive `flock` on
//! `<output>/.lock` for as long as it lives; the file records who holds it.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
    pub version: u32,
    pub pid: u32,
    pub started_at_unix: u64,
    pub command: String,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "Output directory is locked by another build: {command} (PID {pid}, started at Unix time {started_at_unix})\n\
         If no other boardfs process is running, remove the lock file:\n  {lock_path}"
    )]
    Contention {
        command: String,
        pid: u32,
        started_at_unix: u64,
        lock_path: PathBuf,
    },

    #[error(
        "Output directory is locked (could not read lock metadata)\n\
         If no other boardfs process is running, remove the lock file:\n  {lock_path}"
    )]
    ContentionUnknown { lock_path: PathBuf },

    #[error("Failed to create output directory: {0}")]
    CreateDir(#[source] io::Error),

    #[error("Failed to open lock file: {0}")]
    OpenFile(#[source] io::Error),

    #[error("Failed to write lock metadata: {0}")]
    WriteMetadata(#[source] io::Error),

    #[error("Failed to acquire lock: {0}")]
    LockFailed(#[source] io::Error),
}

/// Released when dropped.
pub struct BuildLock {
    /// The flock lives as long as this handle.
    _file: File,
}

impl BuildLock {
    pub fn acquire(lock_path: &Path, command: &str) -> Result<Self, LockError> {
        if let Some(dir) = lock_path.parent() {
            std::fs::create_dir_all(dir).map_err(LockError::CreateDir)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(LockError::OpenFile)?;

        if let Err(err) = try_lock(&file) {
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(contention_error(lock_path));
            }
            return Err(LockError::LockFailed(err));
        }

        write_metadata(&file, command)?;
        tracing::debug!("Acquired {}", lock_path.display());

        Ok(Self { _file: file })
    }
}

fn write_metadata(file: &File, command: &str) -> Result<(), LockError> {
    let metadata = LockMetadata {
        version: 1,
        pid: std::process::id(),
        started_at_unix: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        command: command.to_string(),
    };

    file.set_len(0).map_err(LockError::WriteMetadata)?;
    let mut writer = io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &metadata)
        .map_err(|e| LockError::WriteMetadata(io::Error::other(e)))?;
    writer.flush().map_err(LockError::WriteMetadata)?;
    Ok(())
}

fn contention_error(lock_path: &Path) -> LockError {
    let metadata = std::fs::read_to_string(lock_path)
        .ok()
        .and_then(|contents| serde_json::from_str::<LockMetadata>(&contents).ok());

    match metadata {
        Some(metadata) => LockError::Contention {
            command: metadata.command,
            pid: metadata.pid,
            started_at_unix: metadata.started_at_unix,
            lock_path: lock_path.to_path_buf(),
        },
        None => LockError::ContentionUnknown {
            lock_path: lock_path.to_path_buf(),
        },
    }
}

fn try_lock(file: &File) -> io::Result<()> {
    use rustix::fs::{flock, FlockOperation};
    use std::os::unix::io::AsFd;

    flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
        .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}
