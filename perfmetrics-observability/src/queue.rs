//! Queued sink: decouples the serving path from storage latency.
//!
//! Lines are handed to a bounded channel with `try_send`, so the caller never
//! blocks; a dedicated writer thread drains the channel into an inner
//! [`RecordSink`]. When the channel is full the record is dropped and
//! reported. [`RecordSink::shutdown`] closes the channel, lets the writer
//! drain what is already queued, and joins it.

use crate::writer::{RecordSink, SinkError};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use tracing::{debug, error};

pub struct QueuedSink {
    sender: RwLock<Option<Sender<Vec<u8>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    target: PathBuf,
}

impl QueuedSink {
    /// Start the writer thread in front of `inner`.
    pub fn spawn(inner: Arc<dyn RecordSink>, capacity: usize) -> io::Result<Self> {
        let (tx, rx) = bounded(capacity.max(1));
        let target = inner.target().to_path_buf();

        let worker = std::thread::Builder::new()
            .name("perfmetrics-writer".to_string())
            .spawn(move || drain_loop(inner, rx))?;

        Ok(Self {
            sender: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            target,
        })
    }

    /// Lines waiting for the writer thread.
    pub fn pending(&self) -> usize {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Sender::len)
    }
}

impl RecordSink for QueuedSink {
    fn append(&self, line: &[u8]) -> Result<(), SinkError> {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(SinkError::QueueClosed);
        };
        match tx.try_send(line.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(SinkError::QueueClosed),
        }
    }

    fn target(&self) -> &Path {
        &self.target
    }

    fn shutdown(&self) {
        // Dropping the only sender ends the writer loop once it is drained.
        drop(self.sender.write().unwrap_or_else(PoisonError::into_inner).take());

        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(path = %self.target.display(), "performance metrics writer thread panicked");
            }
        }
    }
}

impl Drop for QueuedSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain_loop(inner: Arc<dyn RecordSink>, rx: Receiver<Vec<u8>>) {
    let mut written: u64 = 0;
    for line in rx {
        match inner.append(&line) {
            Ok(()) => written += 1,
            Err(e) => {
                error!(error = %e, path = %inner.target().display(), "Failed to write performance metrics to file");
            }
        }
    }
    debug!(written, path = %inner.target().display(), "performance metrics writer drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Condvar;

    /// Sink that blocks every append until released.
    struct GateSink {
        open: Mutex<bool>,
        cv: Condvar,
        lines: Mutex<Vec<Vec<u8>>>,
    }

    impl GateSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(false),
                cv: Condvar::new(),
                lines: Mutex::new(Vec::new()),
            })
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    impl RecordSink for GateSink {
        fn append(&self, line: &[u8]) -> Result<(), SinkError> {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
            self.lines.lock().unwrap().push(line.to_vec());
            Ok(())
        }

        fn target(&self) -> &Path {
            Path::new("gate")
        }
    }

    #[test]
    fn shutdown_drains_queued_lines_in_order() {
        let gate = GateSink::new();
        let sink = QueuedSink::spawn(gate.clone(), 16).unwrap();
        for i in 0..10u8 {
            sink.append(&[b'0' + i, b'\n']).unwrap();
        }
        gate.release();
        sink.shutdown();

        let lines = gate.lines.lock().unwrap();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], b"0\n");
        assert_eq!(lines[9], b"9\n");
    }

    #[test]
    fn full_queue_reports_without_blocking() {
        let gate = GateSink::new();
        let sink = QueuedSink::spawn(gate.clone(), 1).unwrap();

        // The writer can hold one line in hand plus one in the channel;
        // everything past that must be rejected immediately.
        let mut full = 0;
        for _ in 0..10 {
            if matches!(sink.append(b"x\n"), Err(SinkError::QueueFull)) {
                full += 1;
            }
        }
        assert!(full >= 8, "expected overflow, got {full} rejections");

        gate.release();
        sink.shutdown();
    }

    #[test]
    fn append_after_shutdown_is_rejected() {
        let gate = GateSink::new();
        gate.release();
        let sink = QueuedSink::spawn(gate, 4).unwrap();
        sink.shutdown();
        assert!(matches!(sink.append(b"late\n"), Err(SinkError::QueueClosed)));
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn shutdown_twice_is_harmless() {
        let gate = GateSink::new();
        gate.release();
        let sink = QueuedSink::spawn(gate, 4).unwrap();
        sink.shutdown();
        sink.shutdown();
        assert_eq!(sink.target(), Path::new("gate"));
    }
}
