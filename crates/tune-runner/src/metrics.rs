//! Typed benchmark metrics and the objective convention used towards the
//! search strategy.

use crate::error::TuneError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Measured values. `None` means the workload did not report the field,
/// which is different from a measured zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_mib_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put_mib_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_mib_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_obj_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put_obj_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_obj_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p50_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p99_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p999_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_duration_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_rows_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_batch_durations: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexing_time_s: Option<f64>,
}

fn overlay<T>(dst: &mut Option<T>, src: Option<T>) {
    if src.is_some() {
        *dst = src;
    }
}

impl Metrics {
    /// Fields reported by `other` replace the current ones.
    pub fn merge(&mut self, other: Metrics) {
        overlay(&mut self.ops_per_sec, other.ops_per_sec);
        overlay(&mut self.get_mib_s, other.get_mib_s);
        overlay(&mut self.put_mib_s, other.put_mib_s);
        overlay(&mut self.total_mib_s, other.total_mib_s);
        overlay(&mut self.get_obj_s, other.get_obj_s);
        overlay(&mut self.put_obj_s, other.put_obj_s);
        overlay(&mut self.total_obj_s, other.total_obj_s);
        overlay(&mut self.avg_latency_ms, other.avg_latency_ms);
        overlay(&mut self.p50_latency_ms, other.p50_latency_ms);
        overlay(&mut self.p95_latency_ms, other.p95_latency_ms);
        overlay(&mut self.p99_latency_ms, other.p99_latency_ms);
        overlay(&mut self.p999_latency_ms, other.p999_latency_ms);
        overlay(&mut self.kb_per_sec, other.kb_per_sec);
        overlay(&mut self.qps, other.qps);
        overlay(&mut self.tps, other.tps);
        overlay(&mut self.error_rate, other.error_rate);
        overlay(&mut self.gen_rows, other.gen_rows);
        overlay(&mut self.gen_duration_s, other.gen_duration_s);
        overlay(&mut self.gen_rows_per_sec, other.gen_rows_per_sec);
        overlay(&mut self.gen_batch_durations, other.gen_batch_durations);
        overlay(&mut self.indexing_time_s, other.indexing_time_s);
    }

    /// Value of a measured metric. Derived cost metrics are not stored here
    /// and always return `None`.
    pub fn get(&self, name: MetricName) -> Option<f64> {
        match name {
            MetricName::OpsPerSec => self.ops_per_sec,
            MetricName::GetMibS => self.get_mib_s,
            MetricName::PutMibS => self.put_mib_s,
            MetricName::TotalMibS => self.total_mib_s,
            MetricName::TotalObjS => self.total_obj_s,
            MetricName::AvgLatencyMs => self.avg_latency_ms,
            MetricName::P50LatencyMs => self.p50_latency_ms,
            MetricName::P95LatencyMs => self.p95_latency_ms,
            MetricName::P99LatencyMs => self.p99_latency_ms,
            MetricName::P999LatencyMs => self.p999_latency_ms,
            MetricName::Qps => self.qps,
            MetricName::Tps => self.tps,
            MetricName::ErrorRate => self.error_rate,
            MetricName::GenRowsPerSec => self.gen_rows_per_sec,
            MetricName::IndexingTimeS => self.indexing_time_s,
            MetricName::CostPerHour | MetricName::CostEfficiency => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Maximize,
    Minimize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    OpsPerSec,
    GetMibS,
    PutMibS,
    TotalMibS,
    TotalObjS,
    AvgLatencyMs,
    P50LatencyMs,
    P95LatencyMs,
    P99LatencyMs,
    P999LatencyMs,
    Qps,
    Tps,
    ErrorRate,
    GenRowsPerSec,
    IndexingTimeS,
    CostPerHour,
    CostEfficiency,
}

impl MetricName {
    pub const ALL: [MetricName; 17] = [
        MetricName::OpsPerSec,
        MetricName::GetMibS,
        MetricName::PutMibS,
        MetricName::TotalMibS,
        MetricName::TotalObjS,
        MetricName::AvgLatencyMs,
        MetricName::P50LatencyMs,
        MetricName::P95LatencyMs,
        MetricName::P99LatencyMs,
        MetricName::P999LatencyMs,
        MetricName::Qps,
        MetricName::Tps,
        MetricName::ErrorRate,
        MetricName::GenRowsPerSec,
        MetricName::IndexingTimeS,
        MetricName::CostPerHour,
        MetricName::CostEfficiency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::OpsPerSec => "ops_per_sec",
            MetricName::GetMibS => "get_mib_s",
            MetricName::PutMibS => "put_mib_s",
            MetricName::TotalMibS => "total_mib_s",
            MetricName::TotalObjS => "total_obj_s",
            MetricName::AvgLatencyMs => "avg_latency_ms",
            MetricName::P50LatencyMs => "p50_latency_ms",
            MetricName::P95LatencyMs => "p95_latency_ms",
            MetricName::P99LatencyMs => "p99_latency_ms",
            MetricName::P999LatencyMs => "p999_latency_ms",
            MetricName::Qps => "qps",
            MetricName::Tps => "tps",
            MetricName::ErrorRate => "error_rate",
            MetricName::GenRowsPerSec => "gen_rows_per_sec",
            MetricName::IndexingTimeS => "indexing_time_s",
            MetricName::CostPerHour => "cost_per_hour",
            MetricName::CostEfficiency => "cost_efficiency",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            MetricName::AvgLatencyMs
            | MetricName::P50LatencyMs
            | MetricName::P95LatencyMs
            | MetricName::P99LatencyMs
            | MetricName::P999LatencyMs
            | MetricName::ErrorRate
            | MetricName::IndexingTimeS
            | MetricName::CostPerHour => Direction::Minimize,
            _ => Direction::Maximize,
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self, MetricName::CostPerHour | MetricName::CostEfficiency)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricName {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let alias = match lowered.as_str() {
            "throughput" | "ops" => "ops_per_sec",
            "p50_ms" | "p50" => "p50_latency_ms",
            "p95_ms" | "p95" => "p95_latency_ms",
            "p99_ms" | "p99" => "p99_latency_ms",
            "p999_ms" | "p999" => "p999_latency_ms",
            "avg_ms" | "avg_latency" => "avg_latency_ms",
            "indexing_time" => "indexing_time_s",
            other => other,
        };
        MetricName::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == alias)
            .ok_or_else(|| TuneError::UnknownMetric(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricScope {
    #[default]
    Benchmark,
    Baseline,
}

/// The metric requested by the search loop, e.g. `qps` or
/// `baseline:total_mib_s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Objective {
    pub metric: MetricName,
    pub scope: MetricScope,
}

impl Objective {
    pub fn new(metric: MetricName) -> Self {
        Self {
            metric,
            scope: MetricScope::Benchmark,
        }
    }

    pub fn direction(&self) -> Direction {
        self.metric.direction()
    }

    /// The search strategy always maximizes: minimize metrics are negated.
    pub fn to_objective(&self, raw: f64) -> f64 {
        match self.direction() {
            Direction::Maximize => raw,
            Direction::Minimize => -raw,
        }
    }

    /// Returned for failed trials so ordering stays consistent: nothing is
    /// worse than a failed trial.
    pub fn sentinel(&self) -> f64 {
        match self.direction() {
            Direction::Maximize => 0.0,
            Direction::Minimize => f64::NEG_INFINITY,
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            MetricScope::Benchmark => write!(f, "{}", self.metric),
            MetricScope::Baseline => write!(f, "baseline:{}", self.metric),
        }
    }
}

impl FromStr for Objective {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("baseline", rest)) => {
                let metric: MetricName = rest.parse()?;
                if metric.is_derived() {
                    return Err(TuneError::UnknownMetric(s.to_string()));
                }
                Ok(Self {
                    metric,
                    scope: MetricScope::Baseline,
                })
            }
            Some(_) => Err(TuneError::UnknownMetric(s.to_string())),
            None => Ok(Self::new(s.parse()?)),
        }
    }
}
