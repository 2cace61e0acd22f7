//! Environment overrides for `PerfConfig::load`.
//!
//! Kept in their own test binary: the variables are process-wide and would
//! leak into the YAML-only load tests running in parallel.

use figment::Jail;
use perfmetrics_core::config::*;
use std::path::{Path, PathBuf};

#[test]
fn test_env_overrides_output_file() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "perf.yaml",
            "performance_metrics:\n  output_file: \"/var/log/perf/yaml.log\"\n",
        )?;
        jail.set_env("PERFMETRICS_PERFORMANCE_METRICS__OUTPUT_FILE", "/var/log/perf/env.log");

        let cfg = PerfConfig::load(Path::new("perf.yaml")).unwrap().performance_metrics;
        assert_eq!(cfg.output_file.as_deref(), Some("/var/log/perf/env.log"));

        let table = cfg.resolve().unwrap();
        assert!(table.root().enabled);
        assert_eq!(table.root().output_file, PathBuf::from("/var/log/perf/env.log"));
        Ok(())
    });
}

#[test]
fn test_env_sets_enums_without_yaml_entry() {
    Jail::expect_with(|jail| {
        jail.create_file("perf.yaml", "{}\n")?;
        jail.set_env("PERFMETRICS_PERFORMANCE_METRICS__PEER_MODE", "local_addr");
        jail.set_env("PERFMETRICS_PERFORMANCE_METRICS__SINK", "locked");

        let cfg = PerfConfig::load(Path::new("perf.yaml")).unwrap().performance_metrics;
        assert_eq!(cfg.peer_mode, PeerMode::LocalAddr);
        assert_eq!(cfg.sink, SinkKind::Locked);
        assert_eq!(cfg.output_file, None);
        Ok(())
    });
}
