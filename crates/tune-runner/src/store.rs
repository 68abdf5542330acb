//! Append-only trial records, persisted as one pretty JSON array per
//! provider and service.

use crate::bench::PhaseTiming;
use crate::config::ParamSet;
use crate::cost::DerivedMetrics;
use crate::error::TuneError;
use crate::metrics::{MetricName, MetricScope, Metrics, Objective};
use crate::settings::Mode;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_id: String,
    pub trial: u64,
    pub timestamp: String,
    pub provider: String,
    pub service: String,
    pub mode: Mode,
    pub config: ParamSet,
    pub config_digest: String,
    pub primary_metric: MetricName,
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived: Option<DerivedMetrics>,
    #[serde(default)]
    pub annotations: BTreeMap<String, Value>,
    #[serde(default)]
    pub timings: Vec<PhaseTiming>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TrialRecord {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn primary_value(&self) -> Option<f64> {
        self.metrics.get(self.primary_metric)
    }

    /// Raw value of the requested metric, derived cost metrics included.
    pub fn measured(&self, objective: &Objective) -> Option<f64> {
        match objective.scope {
            MetricScope::Baseline => self.baseline.as_ref()?.get(objective.metric),
            MetricScope::Benchmark => match objective.metric {
                MetricName::CostPerHour => self.derived.map(|d| d.cost_per_hour),
                MetricName::CostEfficiency => self.derived.map(|d| d.cost_efficiency),
                metric => self.metrics.get(metric),
            },
        }
    }

    /// Usable as a cache hit for `objective`.
    pub fn qualifies(&self, objective: &Objective) -> bool {
        self.is_success()
            && self.primary_value().map(|v| v > 0.0).unwrap_or(false)
            && self.measured(objective).is_some()
    }
}

pub fn find_cached_in<'a>(
    records: &'a [TrialRecord],
    canonical_key: &str,
    objective: &Objective,
) -> Option<&'a TrialRecord> {
    records
        .iter()
        .rev()
        .find(|r| r.qualifies(objective) && r.config.canonical_key() == canonical_key)
}

pub struct ResultStore {
    path: PathBuf,
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_err(&self, detail: impl ToString) -> TuneError {
        TuneError::Store {
            path: self.path.display().to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn load(&self) -> Result<Vec<TrialRecord>, TuneError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|e| self.store_err(e))
    }

    /// Reads the whole collection, appends, and atomically replaces the file.
    pub fn append(&self, record: TrialRecord) -> Result<(), TuneError> {
        let mut records = self.load()?;
        records.push(record);
        let bytes = serde_json::to_vec_pretty(&records).map_err(|e| self.store_err(e))?;
        atomic_write_bytes(&self.path, &bytes)?;
        Ok(())
    }

    pub fn find_cached(
        &self,
        canonical_key: &str,
        objective: &Objective,
    ) -> Result<Option<TrialRecord>, TuneError> {
        let records = self.load()?;
        Ok(find_cached_in(&records, canonical_key, objective).cloned())
    }

    /// Successful trials as (configuration, objective value) pairs.
    pub fn history(&self, objective: &Objective) -> Result<Vec<(ParamSet, f64)>, TuneError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.is_success())
            .filter_map(|r| {
                let value = r.measured(objective)?;
                Some((r.config, objective.to_objective(value)))
            })
            .collect())
    }

    pub fn best(&self, objective: &Objective) -> Result<Option<TrialRecord>, TuneError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.qualifies(objective))
            .filter_map(|r| {
                let score = objective.to_objective(r.measured(objective)?);
                Some((score, r))
            })
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, r)| r))
    }

    pub fn next_trial_number(&self) -> Result<u64, TuneError> {
        Ok(self.load()?.iter().map(|r| r.trial).max().unwrap_or(0) + 1)
    }
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("results");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> (PathBuf, ResultStore) {
        let dir = std::env::temp_dir().join(format!(
            "tune_store_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let store = ResultStore::new(dir.join("results_redis_selectel.json"));
        (dir, store)
    }

    fn record(trial: u64, cpu: i64, ops: Option<f64>, error: Option<&str>) -> TrialRecord {
        let config = ParamSet::new().with("cpu_per_node", cpu).with("mode", "single");
        TrialRecord {
            trial_id: format!("trial_{}", trial),
            trial,
            timestamp: Utc::now().to_rfc3339(),
            provider: "selectel".to_string(),
            service: "redis".to_string(),
            mode: Mode::Infra,
            config_digest: config.digest(),
            config,
            primary_metric: MetricName::OpsPerSec,
            metrics: Metrics {
                ops_per_sec: ops,
                p99_latency_ms: ops.map(|_| 2.5),
                ..Metrics::default()
            },
            baseline: None,
            derived: ops.map(|v| DerivedMetrics {
                cost_per_hour: 3.0,
                cost_efficiency: v / 3.0,
            }),
            annotations: BTreeMap::new(),
            timings: Vec::new(),
            warnings: Vec::new(),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn find_cached_skips_errors_and_non_positive_metrics() {
        let key = ParamSet::new()
            .with("mode", "single")
            .with("cpu_per_node", 4i64)
            .canonical_key();
        let ops = Objective::new(MetricName::OpsPerSec);
        let records = vec![
            record(1, 4, Some(0.0), None),
            record(2, 4, Some(900.0), Some("benchmark: phase memtier exited with status 1")),
        ];
        assert!(find_cached_in(&records, &key, &ops).is_none());

        let mut with_hit = records.clone();
        with_hit.push(record(3, 4, Some(1200.0), None));
        with_hit.push(record(4, 8, Some(1500.0), None));
        let hit = find_cached_in(&with_hit, &key, &ops).expect("hit");
        assert_eq!(hit.trial, 3);
    }

    #[test]
    fn find_cached_requires_the_requested_metric() {
        let key = record(1, 4, None, None).config.canonical_key();
        let records = vec![record(1, 4, Some(1000.0), None)];
        let p999 = Objective::new(MetricName::P999LatencyMs);
        assert!(find_cached_in(&records, &key, &p999).is_none());
        let p99 = Objective::new(MetricName::P99LatencyMs);
        assert!(find_cached_in(&records, &key, &p99).is_some());
        let efficiency = Objective::new(MetricName::CostEfficiency);
        assert!(find_cached_in(&records, &key, &efficiency).is_some());
    }

    #[test]
    fn latest_qualifying_record_wins() {
        let key = record(1, 4, None, None).config.canonical_key();
        let records = vec![record(1, 4, Some(1000.0), None), record(2, 4, Some(1100.0), None)];
        let hit = find_cached_in(&records, &key, &Objective::new(MetricName::OpsPerSec));
        assert_eq!(hit.map(|r| r.trial), Some(2));
    }

    #[test]
    fn append_rewrites_a_valid_json_array() {
        let (dir, store) = temp_store("append");
        assert_eq!(store.next_trial_number().expect("empty"), 1);
        store.append(record(1, 2, Some(800.0), None)).expect("append 1");
        store.append(record(2, 4, None, Some("infra: boom"))).expect("append 2");
        store.append(record(3, 8, Some(1600.0), None)).expect("append 3");

        let raw = fs::read_to_string(store.path()).expect("read");
        let parsed: Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(parsed.as_array().map(Vec::len), Some(3));
        let leftovers = fs::read_dir(&dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
        assert_eq!(store.next_trial_number().expect("next"), 4);

        let ops = Objective::new(MetricName::OpsPerSec);
        let history = store.history(&ops).expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(store.best(&ops).expect("best").map(|r| r.trial), Some(3));

        // minimize metrics come back negated
        let p99 = Objective::new(MetricName::P99LatencyMs);
        let history = store.history(&p99).expect("history");
        assert!(history.iter().all(|(_, v)| *v == -2.5));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_file_is_a_store_error() {
        let (dir, store) = temp_store("corrupt");
        fs::create_dir_all(&dir).expect("dir");
        fs::write(store.path(), "[{\"trial\": ").expect("write");
        assert!(matches!(store.load(), Err(TuneError::Store { .. })));
        let _ = fs::remove_dir_all(dir);
    }
}
