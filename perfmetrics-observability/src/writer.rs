//! Append-only record sinks.
//!
//! Every record costs one open, one write, one close. The file is opened
//! with `O_APPEND | O_CREAT` and never truncated, so concurrent writers in
//! other threads or processes land whole lines at the end of the file
//! without any in-process lock. [`LockedAppendFileSink`] adds a mutex
//! around the same sequence for platforms that lack atomic append.

use crate::handler::Stage;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::error;

/// Destination for formatted lines.
pub trait RecordSink: Send + Sync {
    /// Append one complete line.
    fn append(&self, line: &[u8]) -> Result<(), SinkError>;

    /// File the lines end up in.
    fn target(&self) -> &Path;

    /// Flush anything held in memory. No-op for direct writers.
    fn shutdown(&self) {}
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("open \"{}\" failed: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write to \"{}\" failed: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("close \"{}\" failed: {source}", .path.display())]
    Close {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("writer queue full, record dropped")]
    QueueFull,

    #[error("writer queue closed")]
    QueueClosed,
}

impl SinkError {
    /// Step of the append sequence that failed.
    pub fn stage(&self) -> Stage {
        match self {
            SinkError::Open { .. } => Stage::Open,
            SinkError::Write { .. } | SinkError::QueueFull | SinkError::QueueClosed => {
                Stage::Write
            }
            SinkError::Close { .. } => Stage::Close,
        }
    }
}

// ── Direct append ────────────────────────────────────────────────────────────

/// Lock-free writer relying on the kernel's append atomicity.
#[derive(Debug, Clone)]
pub struct AppendFileSink {
    path: PathBuf,
}

impl AppendFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSink for AppendFileSink {
    fn append(&self, line: &[u8]) -> Result<(), SinkError> {
        append_once(&self.path, line)
    }

    fn target(&self) -> &Path {
        &self.path
    }
}

// ── Locked append ────────────────────────────────────────────────────────────

/// Serializes the open/write/close sequence within this process.
#[derive(Debug)]
pub struct LockedAppendFileSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LockedAppendFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl RecordSink for LockedAppendFileSink {
    fn append(&self, line: &[u8]) -> Result<(), SinkError> {
        // The guarded state is `()`, so a poisoned lock is still usable.
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        append_once(&self.path, line)
    }

    fn target(&self) -> &Path {
        &self.path
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Open in append-create mode, write the whole line, close.
pub(crate) fn append_once(path: &Path, line: &[u8]) -> Result<(), SinkError> {
    let mut file = open_append(path).map_err(|source| SinkError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let written = file.write_all(line);
    let closed = close(file);

    if let Err(source) = written {
        if let Err(e) = closed {
            error!(error = %e, path = %path.display(), "close after failed write also failed");
        }
        return Err(SinkError::Write {
            path: path.to_path_buf(),
            source,
        });
    }

    closed.map_err(|source| SinkError::Close {
        path: path.to_path_buf(),
        source,
    })
}

fn open_append(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o644);
    }
    opts.open(path)
}

/// Close explicitly so the error is observable; `Drop` would swallow it.
#[cfg(unix)]
fn close(file: File) -> io::Result<()> {
    use std::os::fd::IntoRawFd;

    let fd = file.into_raw_fd();
    // SAFETY: `fd` was just released by `File` and is closed exactly once.
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn close(file: File) -> io::Result<()> {
    file.sync_all()
}
