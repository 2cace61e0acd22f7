// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  perfmetrics — per-request performance telemetry
//
//  check:  load + resolve config, print the scope table
//  emit:   one synthetic log-phase pass (output path smoke test)
//  read:   parse an output file back into JSON records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use perfmetrics_core::config::{PeerMode, PerfConfig, ResolvedScope, ROOT_SCOPE};
use perfmetrics_core::context::RequestSnapshot;
use perfmetrics_observability::record::MetricRecord;
use perfmetrics_observability::{LogOutcome, PerformanceMetrics};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "perfmetrics", version, about = "Per-request performance telemetry tool")]
struct Cli {
    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the config and print the resolved scopes as JSON.
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/perfmetrics/perfmetrics.yaml")]
        config: PathBuf,
    },

    /// Run one log-phase pass with a synthetic request.
    Emit {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/perfmetrics/perfmetrics.yaml")]
        config: PathBuf,

        #[arg(long, default_value = ROOT_SCOPE)]
        scope: String,

        #[arg(long, default_value_t = 200)]
        status: u16,

        /// Request start in Unix milliseconds (default: now)
        #[arg(long)]
        start_ms: Option<i64>,

        /// Upstream peer address
        #[arg(long)]
        upstream: Option<String>,

        /// Local listening socket, e.g. 127.0.0.1:9080 or [::1]:443
        #[arg(long)]
        local_addr: Option<SocketAddr>,
    },

    /// Parse an output file and print one JSON object per record.
    Read {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long, value_enum, default_value_t = LineMode::Upstream)]
        mode: LineMode,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LineMode {
    Upstream,
    #[value(name = "local_addr")]
    LocalAddr,
}

impl From<LineMode> for PeerMode {
    fn from(mode: LineMode) -> Self {
        match mode {
            LineMode::Upstream => PeerMode::Upstream,
            LineMode::LocalAddr => PeerMode::LocalAddr,
        }
    }
}

/// Counts from one pass over an output file.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReadStats {
    records: usize,
    malformed: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ── (stderr, so stdout stays machine-readable)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Check { config } => check(&config),
        Command::Emit {
            config,
            scope,
            status,
            start_ms,
            upstream,
            local_addr,
        } => {
            let mut snapshot = match start_ms {
                Some(ms) => RequestSnapshot::new(ms),
                None => RequestSnapshot::started_now(),
            }
            .with_status(status);
            snapshot.upstream_peer = upstream;
            snapshot.local_addr = local_addr;
            emit(&config, &scope, &snapshot)
        }
        Command::Read { file, mode } => {
            let stdout = io::stdout();
            let stats = read_records(&file, mode.into(), &mut stdout.lock())?;
            if stats.malformed > 0 {
                warn!(malformed = stats.malformed, path = %file.display(), "Skipped malformed lines");
            }
            info!(records = stats.records, "Done");
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<PerfConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config file");
        PerfConfig::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        info!("No config file found, using defaults");
        Ok(PerfConfig::default())
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let table = config.performance_metrics.resolve()?;
    let scopes: Vec<&ResolvedScope> = table.iter().collect();
    println!("{}", serde_json::to_string_pretty(&scopes)?);
    info!(
        scopes = table.len(),
        files = table.output_files().len(),
        sink = ?config.performance_metrics.sink,
        "Config OK"
    );
    Ok(())
}

fn emit(path: &Path, scope: &str, snapshot: &RequestSnapshot) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let metrics = PerformanceMetrics::from_config(&config.performance_metrics)?;

    let outcome = metrics.log_phase(scope, snapshot);
    metrics.shutdown();

    match outcome {
        LogOutcome::Written => {
            let target = &metrics.scopes().get(scope).output_file;
            info!(scope, path = %target.display(), "Record written");
            Ok(())
        }
        LogOutcome::Disabled => {
            info!(scope, "Performance metrics disabled for scope");
            Ok(())
        }
        LogOutcome::Skipped(stage) => bail!("record skipped at {stage} stage"),
    }
}

fn read_records<W: Write>(path: &Path, mode: PeerMode, out: &mut W) -> anyhow::Result<ReadStats> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut stats = ReadStats::default();

    // Raw lines: a torn write can cut a multi-byte peer in half.
    for (idx, raw) in BufReader::new(file).split(b'\n').enumerate() {
        let raw = raw?;
        if raw.is_empty() {
            continue;
        }
        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line,
            Err(e) => {
                warn!(line = idx + 1, error = %e, "Malformed record");
                stats.malformed += 1;
                continue;
            }
        };
        match MetricRecord::parse_line(line, mode) {
            Ok(record) => {
                serde_json::to_writer(&mut *out, &record)?;
                out.write_all(b"\n")?;
                stats.records += 1;
            }
            Err(e) => {
                warn!(line = idx + 1, error = %e, "Malformed record");
                stats.malformed += 1;
            }
        }
    }

    Ok(stats)
}
