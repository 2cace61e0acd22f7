use crate::error::PerfError;
use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfConfig {
    #[serde(default)]
    pub performance_metrics: MetricsConfig,
}

/// Performance-metrics settings.
///
/// The top-level `enabled` / `output_file` / `peer_mode` values act as the
/// root scope; every entry in `scopes` inherits whatever it leaves unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Setting a path without `enabled` turns logging on for that scope.
    #[serde(default)]
    pub output_file: Option<String>,
    /// Base directory for relative `output_file` values.
    #[serde(default = "default_prefix")]
    pub prefix: PathBuf,
    #[serde(default)]
    pub peer_mode: PeerMode,
    #[serde(default)]
    pub ipv6_style: Ipv6Style,
    #[serde(default)]
    pub sink: SinkKind,
    /// Only used by the queued sink.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub scopes: Vec<ScopeConfig>,
}

/// Per-routing-context overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub name: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub peer_mode: Option<PeerMode>,
}

/// Which address identifies the peer that served a request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeerMode {
    /// The proxied upstream's resolved address, `-` when not proxied.
    #[default]
    Upstream,
    /// The local listening socket as `host:port`.
    LocalAddr,
}

/// How IPv6 local addresses are rendered before the port.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Ipv6Style {
    /// `[::1]:443`
    #[default]
    Bracketed,
    /// `::1:443`, the legacy output, ambiguous with the address's own colons.
    Bare,
}

/// Append strategy for the output file.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// One O_APPEND open/write/close per record, no locking.
    #[default]
    Append,
    /// Same sequence serialized behind a per-process mutex.
    Locked,
    /// Bounded in-process queue drained by a dedicated writer thread.
    Queued,
}

/// A scope after inheritance and path resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedScope {
    pub name: String,
    pub enabled: bool,
    pub output_file: PathBuf,
    pub peer_mode: PeerMode,
}

/// Immutable lookup table built once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeTable {
    root: ResolvedScope,
    scopes: HashMap<String, ResolvedScope>,
}

pub const ROOT_SCOPE: &str = "root";

// ── Defaults ──────────────────────────────────────────────────

fn default_prefix() -> PathBuf { PathBuf::from(".") }
fn default_queue_capacity() -> usize { 10_000 }

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            output_file: None,
            prefix: default_prefix(),
            peer_mode: PeerMode::default(),
            ipv6_style: Ipv6Style::default(),
            sink: SinkKind::default(),
            queue_capacity: default_queue_capacity(),
            scopes: Vec::new(),
        }
    }
}

// ── Impls ─────────────────────────────────────────────────────

impl PerfConfig {
    /// Load configuration from YAML file + env overrides.
    ///
    /// Env keys nest on `__`, e.g.
    /// `PERFMETRICS_PERFORMANCE_METRICS__OUTPUT_FILE=/var/log/perf.log`.
    pub fn load(path: &Path) -> Result<Self, PerfError> {
        let config: PerfConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("PERFMETRICS_").split("__"))
            .extract()
            .map_err(Box::new)?;
        Ok(config)
    }
}

impl MetricsConfig {
    /// Merge every scope with the root and resolve output paths.
    pub fn resolve(&self) -> Result<ScopeTable, PerfError> {
        let prefix = absolute_prefix(&self.prefix)?;

        let root_path = self.output_file.as_deref().unwrap_or("");
        let root = ResolvedScope {
            name: ROOT_SCOPE.to_string(),
            enabled: self.enabled.unwrap_or(self.output_file.is_some()),
            output_file: full_name(&prefix, root_path),
            peer_mode: self.peer_mode,
        };
        validate(&root)?;

        let mut scopes = HashMap::with_capacity(self.scopes.len());
        for scope in &self.scopes {
            if scope.name.trim().is_empty() {
                return Err(PerfError::ConfigError("scope name must not be empty".into()));
            }

            let enabled = scope
                .enabled
                .or(scope.output_file.as_ref().map(|_| true))
                .unwrap_or(root.enabled);
            let output_file = match scope.output_file.as_deref() {
                Some(raw) => full_name(&prefix, raw),
                None => root.output_file.clone(),
            };

            let resolved = ResolvedScope {
                name: scope.name.clone(),
                enabled,
                output_file,
                peer_mode: scope.peer_mode.unwrap_or(root.peer_mode),
            };
            validate(&resolved)?;

            if resolved.enabled {
                debug!(
                    scope = %resolved.name,
                    path = %resolved.output_file.display(),
                    "Output file path"
                );
            }

            if scopes.insert(scope.name.clone(), resolved).is_some() {
                return Err(PerfError::DuplicateScope(scope.name.clone()));
            }
        }

        Ok(ScopeTable { root, scopes })
    }
}

impl ScopeTable {
    /// Look up a scope; unknown names fall back to the root scope.
    #[inline]
    pub fn get(&self, name: &str) -> &ResolvedScope {
        self.scopes.get(name).unwrap_or(&self.root)
    }

    pub fn root(&self) -> &ResolvedScope {
        &self.root
    }

    /// Root first, then named scopes sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedScope> {
        let mut named: Vec<&ResolvedScope> = self.scopes.values().collect();
        named.sort_by(|a, b| a.name.cmp(&b.name));
        std::iter::once(&self.root).chain(named)
    }

    /// Distinct output files of enabled scopes.
    pub fn output_files(&self) -> Vec<&Path> {
        let mut files: Vec<&Path> = self
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.output_file.as_path())
            .collect();
        files.sort();
        files.dedup();
        files
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

// ── Helpers ──────────────────────────────────────────────────

fn absolute_prefix(prefix: &Path) -> Result<PathBuf, PerfError> {
    if prefix.is_absolute() {
        Ok(prefix.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(prefix))
    }
}

/// Relative paths hang off `prefix`; absolute ones are kept as-is.
fn full_name(prefix: &Path, raw: &str) -> PathBuf {
    if raw.is_empty() {
        return PathBuf::new();
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        prefix.join(path)
    }
}

fn validate(scope: &ResolvedScope) -> Result<(), PerfError> {
    if scope.enabled && scope.output_file.as_os_str().is_empty() {
        return Err(PerfError::MissingOutputFile(scope.name.clone()));
    }
    Ok(())
}
