//! Log-phase entry point.
//!
//! The host calls [`PerformanceMetrics::log_phase`] once per request after
//! the response is finalized. Disabled scopes are a true no-op: no record,
//! no write, no diagnostic event. For enabled scopes each record walks
//! `Extracted → Formatted → Opened → Written → Closed`; any failed step ends
//! it as [`LogOutcome::Skipped`] with a diagnostic, and nothing is ever
//! returned to the serving path as an error.

use crate::extractor::{ExtractError, MetricsExtractor};
use crate::writer::{AppendFileSink, LockedAppendFileSink, RecordSink, SinkError};
use perfmetrics_core::config::{MetricsConfig, ResolvedScope, ScopeTable, SinkKind};
use perfmetrics_core::context::LogContext;
use perfmetrics_core::error::PerfError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Step at which a record was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Format,
    Open,
    Write,
    Close,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Format => "format",
            Stage::Open => "open",
            Stage::Write => "write",
            Stage::Close => "close",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal state of one log-phase pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    /// Logging is off for the scope.
    Disabled,
    /// The line was written and the file closed.
    Written,
    Skipped(Stage),
}

pub struct PerformanceMetrics {
    scopes: ScopeTable,
    extractor: MetricsExtractor,
    /// One sink per distinct output file, shared by every scope using it.
    sinks: HashMap<PathBuf, Arc<dyn RecordSink>>,
}

impl PerformanceMetrics {
    /// Resolve scopes and open one sink per output file.
    pub fn from_config(config: &MetricsConfig) -> Result<Self, PerfError> {
        let scopes = config.resolve()?;
        let kind = config.sink;
        let capacity = config.queue_capacity;
        Self::with_sinks(
            scopes,
            MetricsExtractor::new(config.ipv6_style),
            |path| build_sink(kind, path, capacity),
        )
    }

    /// Build with caller-supplied sinks, one factory call per output file.
    pub fn with_sinks<F>(
        scopes: ScopeTable,
        extractor: MetricsExtractor,
        mut factory: F,
    ) -> Result<Self, PerfError>
    where
        F: FnMut(&Path) -> Result<Arc<dyn RecordSink>, PerfError>,
    {
        let mut sinks = HashMap::new();
        for path in scopes.output_files() {
            let sink = factory(path)?;
            info!(path = %path.display(), "Performance metrics sink ready");
            sinks.insert(path.to_path_buf(), sink);
        }
        Ok(Self {
            scopes,
            extractor,
            sinks,
        })
    }

    /// Everything disabled; every call is a no-op.
    pub fn disabled() -> Result<Self, PerfError> {
        Self::from_config(&MetricsConfig::default())
    }

    #[inline]
    pub fn is_enabled(&self, scope: &str) -> bool {
        self.scopes.get(scope).enabled
    }

    pub fn scopes(&self) -> &ScopeTable {
        &self.scopes
    }

    /// Capture and append the metrics for one finalized request.
    pub fn log_phase<C: LogContext + ?Sized>(&self, scope: &str, ctx: &C) -> LogOutcome {
        let resolved = self.scopes.get(scope);
        if !resolved.enabled {
            return LogOutcome::Disabled;
        }

        debug!(scope = %resolved.name, "before performance metrics capture");
        let outcome = self.capture(resolved, ctx);
        debug!(scope = %resolved.name, ?outcome, "after performance metrics capture");
        outcome
    }

    /// Drain queued sinks. Direct sinks hold nothing in memory.
    pub fn shutdown(&self) {
        for sink in self.sinks.values() {
            sink.shutdown();
        }
    }

    fn capture<C: LogContext + ?Sized>(&self, scope: &ResolvedScope, ctx: &C) -> LogOutcome {
        let record = match self.extractor.extract(scope.peer_mode, ctx) {
            Ok(record) => record,
            Err(ExtractError::NotFinalized) => {
                warn!(scope = %scope.name, "log phase reached before response status was set");
                return LogOutcome::Skipped(Stage::Extract);
            }
            Err(e) => {
                debug!(scope = %scope.name, error = %e, "performance metrics record skipped");
                return LogOutcome::Skipped(Stage::Extract);
            }
        };

        let line = match record.format_line() {
            Ok(line) => line,
            Err(e) => {
                debug!(scope = %scope.name, error = %e, "performance metrics record skipped");
                return LogOutcome::Skipped(Stage::Format);
            }
        };

        let Some(sink) = self.sinks.get(&scope.output_file) else {
            error!(
                scope = %scope.name,
                path = %scope.output_file.display(),
                "no sink registered for output file"
            );
            return LogOutcome::Skipped(Stage::Open);
        };

        match sink.append(&line) {
            Ok(()) => {
                debug!(scope = %scope.name, "performance metrics written");
                LogOutcome::Written
            }
            Err(e @ SinkError::QueueFull) => {
                warn!(scope = %scope.name, error = %e, "performance metrics dropped");
                LogOutcome::Skipped(e.stage())
            }
            Err(e) => {
                error!(
                    scope = %scope.name,
                    stage = %e.stage(),
                    error = %e,
                    "Failed to write performance metrics to file"
                );
                LogOutcome::Skipped(e.stage())
            }
        }
    }
}

impl Drop for PerformanceMetrics {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_sink(kind: SinkKind, path: &Path, capacity: usize) -> Result<Arc<dyn RecordSink>, PerfError> {
    let sink: Arc<dyn RecordSink> = match kind {
        SinkKind::Append => Arc::new(AppendFileSink::new(path)),
        SinkKind::Locked => Arc::new(LockedAppendFileSink::new(path)),
        #[cfg(feature = "queue")]
        SinkKind::Queued => Arc::new(crate::queue::QueuedSink::spawn(
            Arc::new(AppendFileSink::new(path)),
            capacity,
        )?),
        #[cfg(not(feature = "queue"))]
        SinkKind::Queued => {
            let _ = capacity;
            return Err(PerfError::ConfigError(
                "sink \"queued\" requires the `queue` feature".into(),
            ));
        }
    };
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfmetrics_core::config::{PeerMode, ScopeConfig};
    use perfmetrics_core::context::{FrozenClock, RequestSnapshot};
    use std::sync::Mutex;

    /// In-memory sink that can be told to fail.
    #[derive(Default)]
    struct MemorySink {
        lines: Mutex<Vec<String>>,
        fail_open: bool,
        fail_close: bool,
    }

    impl RecordSink for MemorySink {
        fn append(&self, line: &[u8]) -> Result<(), SinkError> {
            if self.fail_open {
                return Err(SinkError::Open {
                    path: PathBuf::from("/mem"),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            self.lines
                .lock()
                .unwrap()
                .push(String::from_utf8(line.to_vec()).unwrap());
            if self.fail_close {
                return Err(SinkError::Close {
                    path: PathBuf::from("/mem"),
                    source: std::io::Error::other("EIO"),
                });
            }
            Ok(())
        }

        fn target(&self) -> &Path {
            Path::new("/mem")
        }
    }

    fn config(scopes: Vec<ScopeConfig>) -> MetricsConfig {
        MetricsConfig {
            enabled: Some(false),
            output_file: Some("/mem/perf.log".into()),
            scopes,
            ..Default::default()
        }
    }

    fn scope(name: &str, enabled: bool, mode: PeerMode) -> ScopeConfig {
        ScopeConfig {
            name: name.into(),
            enabled: Some(enabled),
            output_file: None,
            peer_mode: Some(mode),
        }
    }

    fn metrics_with(sink: Arc<MemorySink>, cfg: &MetricsConfig) -> PerformanceMetrics {
        PerformanceMetrics::with_sinks(cfg.resolve().unwrap(), MetricsExtractor::default(), |_| {
            Ok(sink.clone() as Arc<dyn RecordSink>)
        })
        .unwrap()
    }

    fn ctx(status: u16) -> RequestSnapshot {
        RequestSnapshot::new(1000)
            .with_clock(Arc::new(FrozenClock(1250)))
            .with_status(status)
    }

    #[test]
    fn stage_display() {
        assert_eq!(Stage::Open.to_string(), "open");
        assert_eq!(Stage::Close.as_str(), "close");
    }

    #[test]
    fn disabled_scope_writes_nothing() {
        let sink = Arc::new(MemorySink::default());
        let pm = metrics_with(sink.clone(), &config(vec![scope("off", false, PeerMode::Upstream)]));
        assert!(!pm.is_enabled("off"));
        assert_eq!(pm.log_phase("off", &ctx(200)), LogOutcome::Disabled);
        assert!(sink.lines.lock().unwrap().is_empty());
    }

    #[test]
    fn enabled_upstream_scope_writes_variant_a() {
        let sink = Arc::new(MemorySink::default());
        let pm = metrics_with(sink.clone(), &config(vec![scope("api", true, PeerMode::Upstream)]));
        let out = pm.log_phase("api", &ctx(404).with_upstream_peer("10.0.0.2:8080"));
        assert_eq!(out, LogOutcome::Written);
        assert_eq!(*sink.lines.lock().unwrap(), vec!["1000,250,250,404,10.0.0.2:8080\n"]);
    }

    #[test]
    fn enabled_local_scope_writes_variant_b() {
        let sink = Arc::new(MemorySink::default());
        let pm = metrics_with(sink.clone(), &config(vec![scope("edge", true, PeerMode::LocalAddr)]));
        let req = ctx(200).with_local_addr("198.51.100.7:8080".parse().unwrap());
        assert_eq!(pm.log_phase("edge", &req), LogOutcome::Written);
        assert_eq!(*sink.lines.lock().unwrap(), vec!["198.51.100.7:8080,250,250,200\n"]);
    }

    #[test]
    fn unfinalized_request_is_skipped_at_extract() {
        let sink = Arc::new(MemorySink::default());
        let pm = metrics_with(sink.clone(), &config(vec![scope("api", true, PeerMode::Upstream)]));
        let req = RequestSnapshot::new(1000);
        assert_eq!(pm.log_phase("api", &req), LogOutcome::Skipped(Stage::Extract));
        assert!(sink.lines.lock().unwrap().is_empty());
    }

    #[test]
    fn sink_failure_is_contained() {
        let sink = Arc::new(MemorySink {
            fail_open: true,
            ..Default::default()
        });
        let pm = metrics_with(sink, &config(vec![scope("api", true, PeerMode::Upstream)]));
        assert_eq!(pm.log_phase("api", &ctx(200)), LogOutcome::Skipped(Stage::Open));
    }

    #[test]
    fn close_failure_is_contained() {
        let sink = Arc::new(MemorySink {
            fail_close: true,
            ..Default::default()
        });
        let pm = metrics_with(sink.clone(), &config(vec![scope("api", true, PeerMode::Upstream)]));
        assert_eq!(pm.log_phase("api", &ctx(200)), LogOutcome::Skipped(Stage::Close));
        // The bytes reached the file before close failed.
        assert_eq!(sink.lines.lock().unwrap().len(), 1);
    }

    #[test]
    fn disabled_constructor_has_no_sinks() {
        let pm = PerformanceMetrics::disabled().unwrap();
        assert!(pm.sinks.is_empty());
        assert_eq!(pm.log_phase("anything", &ctx(200)), LogOutcome::Disabled);
    }

    #[test]
    fn sinks_are_shared_per_output_file() {
        let cfg = MetricsConfig {
            output_file: Some("/mem/a.log".into()),
            scopes: vec![
                ScopeConfig {
                    name: "b".into(),
                    enabled: None,
                    output_file: Some("/mem/b.log".into()),
                    peer_mode: None,
                },
                scope("a2", true, PeerMode::Upstream),
            ],
            ..Default::default()
        };
        let mut calls = Vec::new();
        let pm = PerformanceMetrics::with_sinks(cfg.resolve().unwrap(), MetricsExtractor::default(), |p| {
            calls.push(p.to_path_buf());
            Ok(Arc::new(MemorySink::default()) as Arc<dyn RecordSink>)
        })
        .unwrap();
        assert_eq!(calls, vec![PathBuf::from("/mem/a.log"), PathBuf::from("/mem/b.log")]);
        assert_eq!(pm.sinks.len(), 2);
    }
}
