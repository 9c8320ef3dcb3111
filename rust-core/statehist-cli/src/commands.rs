// SPDX-License-Identifier: PMPL-1.0-or-later
//!
//! Inspection commands over one sealed history file.
//!
//! Every command returns its rendered output as a string so `main` only
//! decides where it goes.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use serde::Serialize;
use statehist_core::{Quark, StateInterval, Timestamp};
use statehist_system::StateSystem;
use statehist_tree::{
    BackendStats, CacheStats, HistoryBackend, HistoryTreeBackend, HtConfig, MetricsBackend, TreeInfo,
};
use tracing::{debug, info};

use crate::formatter::{format_quarks, format_rows, IntervalRow, OutputFormat};

/// `info` output: the tree summary plus attribute and cache counters.
#[derive(Debug, Serialize)]
struct InfoReport {
    #[serde(flatten)]
    tree: TreeInfo,
    attributes: usize,
    cache: CacheStats,
}

/// `probe` output.
#[derive(Debug, Serialize)]
struct ProbeReport {
    samples: usize,
    elapsed_ms: f64,
    backend: BackendStats,
    cache: CacheStats,
}

/// A sealed history file opened for inspection.
pub struct Inspector {
    backend: Arc<MetricsBackend<HistoryTreeBackend>>,
    system: StateSystem,
}

impl Inspector {
    /// Open `path`. `provider` may be `ANY_PROVIDER_VERSION` to accept any
    /// stored provider version.
    pub fn open(path: &Path, provider: u32) -> anyhow::Result<Self> {
        let config = HtConfig::new(path, provider, 0).apply_env();
        let tree = HistoryTreeBackend::open_existing(&config)
            .with_context(|| format!("cannot open history file {}", path.display()))?;
        let backend = Arc::new(MetricsBackend::new(tree));
        let system = StateSystem::open_existing(Arc::clone(&backend) as Arc<dyn HistoryBackend>)
            .context("cannot restore attribute tree")?;
        Ok(Self { backend, system })
    }

    fn resolve(&self, path: &str) -> anyhow::Result<Quark> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        Ok(self.system.get_quark_absolute(&segments)?)
    }

    fn row(&self, interval: StateInterval) -> anyhow::Result<IntervalRow> {
        Ok(IntervalRow {
            path: self.system.get_full_attribute_path(interval.quark)?,
            interval,
        })
    }

    /// Header summary.
    pub fn info(&self, format: OutputFormat) -> anyhow::Result<String> {
        let tree = self.backend.inner().tree();
        let report = InfoReport {
            tree: tree.info()?,
            attributes: self.system.get_nb_attributes()?,
            cache: tree.cache_stats()?,
        };
        Ok(match format {
            OutputFormat::Json => serde_json::to_string_pretty(&report)?,
            OutputFormat::Text => {
                let t = &report.tree;
                format!(
                    "path:             {}\n\
                     provider version: {}\n\
                     block size:       {}\n\
                     max children:     {}\n\
                     nodes:            {}\n\
                     depth:            {}\n\
                     root:             #{}\n\
                     time range:       [{}, {}]\n\
                     file size:        {}\n\
                     attributes:       {}\n",
                    t.path,
                    t.provider_version,
                    t.block_size,
                    t.max_children,
                    t.node_count,
                    t.depth,
                    t.root_seq,
                    t.start,
                    t.end,
                    t.file_size,
                    report.attributes,
                )
            }
        })
    }

    /// Pre-order node dump.
    pub fn tree(&self, print_intervals: bool) -> anyhow::Result<String> {
        let mut out = Vec::new();
        self.backend.inner().tree().dump(&mut out, print_intervals)?;
        Ok(String::from_utf8(out)?)
    }

    /// Attributes matching a `/`-separated pattern (`*` and `..` allowed),
    /// or all of them.
    pub fn attributes(&self, pattern: Option<&str>, format: OutputFormat) -> anyhow::Result<String> {
        let quarks = match pattern {
            Some(p) => {
                let segments: Vec<&str> = p.split('/').filter(|s| !s.is_empty()).collect();
                self.system.get_quarks(&segments)?
            }
            None => (0..self.system.get_nb_attributes()? as Quark).collect(),
        };
        let rows = quarks
            .into_iter()
            .map(|q| Ok((q, self.system.get_full_attribute_path(q)?)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        format_quarks(&rows, format)
    }

    /// State of one attribute, or of all of them, at `time`.
    pub fn query(&self, time: Timestamp, path: Option<&str>, format: OutputFormat) -> anyhow::Result<String> {
        let intervals = match path {
            Some(p) => vec![self.system.query_single_state(time, self.resolve(p)?)?],
            None => self.system.query_full_state(time)?,
        };
        let rows = intervals
            .into_iter()
            .map(|iv| self.row(iv))
            .collect::<anyhow::Result<Vec<_>>>()?;
        format_rows(&rows, format)
    }

    /// Every interval of one attribute across `[from, to]`.
    pub fn range(&self, path: &str, from: Timestamp, to: Timestamp, format: OutputFormat) -> anyhow::Result<String> {
        let quark = self.resolve(path)?;
        let mut rows = Vec::new();
        for iv in self.system.query_range(quark, from, to)? {
            rows.push(self.row(iv?)?);
        }
        format_rows(&rows, format)
    }

    /// Run `samples` full-state queries spread evenly over the history and
    /// report backend and cache counters.
    pub fn probe(&self, samples: usize, format: OutputFormat) -> anyhow::Result<String> {
        if samples == 0 {
            bail!("probe needs at least one sample");
        }
        let start = self.system.get_start_time();
        let end = self.system.get_current_end_time()?;
        let span = i128::from(end - start);
        let steps = samples.saturating_sub(1).max(1) as i128;
        self.backend.reset_stats()?;

        let begun = Instant::now();
        for i in 0..samples {
            let t = start + (span * i as i128 / steps) as i64;
            debug!(t, "Probe query");
            self.system.query_full_state(t)?;
        }
        let report = ProbeReport {
            samples,
            elapsed_ms: begun.elapsed().as_secs_f64() * 1000.0,
            backend: self.backend.stats()?,
            cache: self.backend.inner().tree().cache_stats()?,
        };
        info!(samples, elapsed_ms = report.elapsed_ms, "Probe finished");
        Ok(match format {
            OutputFormat::Json => serde_json::to_string_pretty(&report)?,
            OutputFormat::Text => format!(
                "samples:        {}\n\
                 elapsed:        {:.3} ms\n\
                 full queries:   {}\n\
                 intervals read: {}\n\
                 cache hit rate: {:.1}%\n",
                report.samples,
                report.elapsed_ms,
                report.backend.full_query_count,
                report.backend.intervals_returned,
                report.cache.hit_rate() * 100.0,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statehist_core::StateValue;
    use statehist_tree::ANY_PROVIDER_VERSION;
    use tempfile::TempDir;

    fn sample_file(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("trace.ht");
        let config = HtConfig::new(&path, 7, 0).with_block_size(1024).with_max_children(4);
        let ss = StateSystem::new(Arc::new(HistoryTreeBackend::create(config).unwrap()));
        let status = ss.get_quark_absolute_and_add(&["CPUs", "0", "Status"]).unwrap();
        ss.get_quark_absolute_and_add(&["CPUs", "1", "Status"]).unwrap();
        ss.modify_attribute(100, StateValue::from("running"), status).unwrap();
        ss.modify_attribute(250, StateValue::from("idle"), status).unwrap();
        ss.close_history(300).unwrap();
        path
    }

    #[test]
    fn test_info_and_attributes() {
        let dir = TempDir::new().unwrap();
        let inspector = Inspector::open(&sample_file(&dir), ANY_PROVIDER_VERSION).unwrap();

        let info: serde_json::Value =
            serde_json::from_str(&inspector.info(OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(info["provider_version"], 7);
        assert_eq!(info["attributes"], 5);
        assert_eq!(info["end"], 300);
        assert!(inspector.info(OutputFormat::Text).unwrap().contains("[0, 300]"));

        let text = inspector.attributes(Some("CPUs/*/Status"), OutputFormat::Text).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("CPUs/1/Status"));
        assert_eq!(inspector.attributes(None, OutputFormat::Text).unwrap().lines().count(), 5);
    }

    #[test]
    fn test_query_and_range() {
        let dir = TempDir::new().unwrap();
        let inspector = Inspector::open(&sample_file(&dir), 7).unwrap();

        let single = inspector.query(120, Some("CPUs/0/Status"), OutputFormat::Text).unwrap();
        assert!(single.contains("[100, 249]"));
        assert!(single.contains("running"));
        let full = inspector.query(120, None, OutputFormat::Text).unwrap();
        assert_eq!(full.lines().count(), 5);

        let range: serde_json::Value = serde_json::from_str(
            &inspector.range("CPUs/0/Status", 0, 300, OutputFormat::Json).unwrap(),
        )
        .unwrap();
        assert_eq!(range.as_array().unwrap().len(), 3);
        assert_eq!(range[2]["start"], 250);

        assert!(inspector.query(120, Some("CPUs/9"), OutputFormat::Text).is_err());
        assert!(inspector.query(301, None, OutputFormat::Text).is_err());
    }

    #[test]
    fn test_tree_and_probe() {
        let dir = TempDir::new().unwrap();
        let inspector = Inspector::open(&sample_file(&dir), 7).unwrap();
        let dump = inspector.tree(true).unwrap();
        assert!(dump.starts_with("Leaf #0") || dump.starts_with("Core #"));
        assert!(dump.contains("running"));

        let probe: serde_json::Value =
            serde_json::from_str(&inspector.probe(10, OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(probe["backend"]["full_query_count"], 10);
        assert!(inspector.probe(0, OutputFormat::Text).is_err());
    }

    #[test]
    fn test_wrong_provider_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(Inspector::open(&sample_file(&dir), 8).is_err());
    }
}
