//! Best-effort extraction of [`Metrics`] from third-party tool output.
//!
//! Parsers never fail. Anything they cannot find is left unset and reported
//! as a soft failure so the trial can decide what to do with a partial
//! result. Remote transports re-wrap long lines, so text parsers match
//! against whitespace-normalized output with permissive patterns.

use crate::metrics::{MetricName, Metrics};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseReport {
    pub metrics: Metrics,
    pub soft_failures: Vec<String>,
}

impl ParseReport {
    pub fn is_clean(&self) -> bool {
        self.soft_failures.is_empty()
    }

    fn note(&mut self, message: impl Into<String>) {
        self.soft_failures.push(message.into());
    }
}

pub trait BestEffortParser {
    fn name(&self) -> &'static str;
    fn parse(&self, raw: &str) -> ParseReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    Warp,
    Memtier,
    K6Summary,
    Pgbench,
    GenerationReport,
}

impl ParserKind {
    pub fn parser(&self) -> Box<dyn BestEffortParser> {
        match self {
            ParserKind::Warp => Box::new(WarpParser),
            ParserKind::Memtier => Box::new(MemtierParser),
            ParserKind::K6Summary => Box::new(K6SummaryParser),
            ParserKind::Pgbench => Box::new(PgbenchParser),
            ParserKind::GenerationReport => Box::new(GenerationReportParser),
        }
    }

    /// Metrics the parser can fill in. Fallback paths may report fewer.
    pub fn metrics(&self) -> &'static [MetricName] {
        match self {
            ParserKind::Warp => &[
                MetricName::GetMibS,
                MetricName::PutMibS,
                MetricName::TotalMibS,
                MetricName::TotalObjS,
            ],
            ParserKind::Memtier => &[
                MetricName::OpsPerSec,
                MetricName::AvgLatencyMs,
                MetricName::P50LatencyMs,
                MetricName::P99LatencyMs,
                MetricName::P999LatencyMs,
            ],
            ParserKind::K6Summary => &[
                MetricName::Qps,
                MetricName::AvgLatencyMs,
                MetricName::P50LatencyMs,
                MetricName::P95LatencyMs,
                MetricName::P99LatencyMs,
                MetricName::ErrorRate,
            ],
            ParserKind::Pgbench => &[MetricName::Tps, MetricName::AvgLatencyMs, MetricName::ErrorRate],
            ParserKind::GenerationReport => &[MetricName::GenRowsPerSec],
        }
    }
}

pub fn normalize_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn pattern(re: &str) -> Option<Regex> {
    Regex::new(re).ok()
}

fn number(s: &str) -> Option<f64> {
    s.replace(',', "").parse().ok()
}

fn sample(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Locates the first JSON object in `raw` and decodes just that object, so
/// banners before it and trailing data after it are ignored.
pub fn first_json_object(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    serde_json::Deserializer::from_str(&raw[start..])
        .into_iter::<Value>()
        .next()
        .and_then(|v| v.ok())
}

/// Pending-work counter printed by a completion poll: the `total` field of
/// a JSON status document, or else the last integer in the output.
pub fn parse_pending_count(raw: &str) -> Option<u64> {
    if let Some(total) = first_json_object(raw).and_then(|v| v.get("total").and_then(Value::as_u64)) {
        return Some(total);
    }
    raw.split(|c: char| !c.is_ascii_digit())
        .filter(|t| !t.is_empty())
        .last()
        .and_then(|t| t.parse().ok())
}

/// MinIO `warp` text report.
pub struct WarpParser;

impl BestEffortParser for WarpParser {
    fn name(&self) -> &'static str {
        "warp"
    }

    fn parse(&self, raw: &str) -> ParseReport {
        let text = normalize_whitespace(raw);
        let mut report = ParseReport::default();
        let read = |op: &str| -> Option<(f64, f64)> {
            let re = pattern(&format!(
                r"(?i)Report:\s*{}.*?Average:\s*([\d.]+)\s*MiB/s,\s*([\d.]+)\s*obj/s",
                op
            ))?;
            let caps = re.captures(&text)?;
            Some((number(&caps[1])?, number(&caps[2])?))
        };
        let get = read("GET");
        let put = read("PUT");
        let total = read("Total");

        if let Some((mib, obj)) = get {
            report.metrics.get_mib_s = Some(mib);
            report.metrics.get_obj_s = Some(obj);
        }
        if let Some((mib, obj)) = put {
            report.metrics.put_mib_s = Some(mib);
            report.metrics.put_obj_s = Some(obj);
        }
        match (total, get, put) {
            (Some((mib, obj)), _, _) => {
                report.metrics.total_mib_s = Some(mib);
                report.metrics.total_obj_s = Some(obj);
            }
            (None, None, None) => {
                report.note(format!("warp: no GET/PUT/Total report in output: {}", sample(&text)));
            }
            (None, get, put) => {
                let (gm, go) = get.unwrap_or((0.0, 0.0));
                let (pm, po) = put.unwrap_or((0.0, 0.0));
                report.metrics.total_mib_s = Some(gm + pm);
                report.metrics.total_obj_s = Some(go + po);
                report.note("warp: Total block missing, derived from GET + PUT");
            }
        }
        report
    }
}

/// `memtier_benchmark --hide-histogram` summary table.
pub struct MemtierParser;

impl BestEffortParser for MemtierParser {
    fn name(&self) -> &'static str {
        "memtier"
    }

    fn parse(&self, raw: &str) -> ParseReport {
        let mut report = ParseReport::default();
        // Type  Ops/sec  Hits/sec  Misses/sec  Avg.Latency  p50  p99  p99.9  KB/sec
        let totals = pattern(
            r"Totals\s+([\d.]+)\s+[\d.\-]+\s+[\d.\-]+\s+([\d.]+)\s+([\d.]+)\s+([\d.]+)\s+([\d.]+)\s+([\d.]+)",
        )
        .and_then(|re| re.captures(raw).map(|c| {
            [1, 2, 3, 4, 5, 6].map(|i| number(&c[i]))
        }));
        if let Some([ops, avg, p50, p99, p999, kb]) = totals {
            report.metrics.ops_per_sec = ops;
            report.metrics.avg_latency_ms = avg;
            report.metrics.p50_latency_ms = p50;
            report.metrics.p99_latency_ms = p99;
            report.metrics.p999_latency_ms = p999;
            report.metrics.kb_per_sec = kb;
            return report;
        }

        let row = |label: &str| -> Option<f64> {
            let re = pattern(&format!(r"(?m)^\s*{}\s+([\d.]+)", label))?;
            re.captures(raw).and_then(|c| number(&c[1]))
        };
        match (row("Gets"), row("Sets")) {
            (None, None) => {
                report.note(format!(
                    "memtier: no Totals row in output: {}",
                    sample(&normalize_whitespace(raw))
                ));
            }
            (gets, sets) => {
                report.metrics.ops_per_sec = Some(gets.unwrap_or(0.0) + sets.unwrap_or(0.0));
                report.note("memtier: Totals row missing, ops/sec derived from Gets + Sets");
            }
        }
        report
    }
}

/// k6 `--summary-export` JSON. The search latency trend is a custom metric
/// of the load script; the built-in request duration is the fallback.
pub struct K6SummaryParser;

impl BestEffortParser for K6SummaryParser {
    fn name(&self) -> &'static str {
        "k6"
    }

    fn parse(&self, raw: &str) -> ParseReport {
        let mut report = ParseReport::default();
        let Some(doc) = first_json_object(raw) else {
            report.note(format!("k6: no JSON summary found: {}", sample(raw)));
            return report;
        };
        let metrics = doc.get("metrics").cloned().unwrap_or(Value::Null);
        let field = |metric: &str, key: &str| -> Option<f64> {
            metrics.get(metric).and_then(|m| m.get(key)).and_then(Value::as_f64)
        };

        report.metrics.qps = field("http_reqs", "rate");
        if report.metrics.qps.is_none() {
            report.note("k6: http_reqs.rate missing");
        }

        let trend = if metrics.get("search_latency_ms").is_some() {
            "search_latency_ms"
        } else {
            report.note("k6: search_latency_ms missing, using http_req_duration");
            "http_req_duration"
        };
        report.metrics.avg_latency_ms = field(trend, "avg");
        report.metrics.p50_latency_ms = field(trend, "med");
        report.metrics.p95_latency_ms = field(trend, "p(95)");
        report.metrics.p99_latency_ms = field(trend, "p(99)");

        let requests = field("http_reqs", "count").unwrap_or(0.0);
        report.metrics.error_rate = match field("search_errors", "count") {
            Some(errors) if requests > 0.0 => Some(errors / requests),
            Some(_) => Some(0.0),
            None => field("http_req_failed", "value").or(Some(0.0)),
        };
        report
    }
}

/// `pgbench` run summary.
pub struct PgbenchParser;

impl BestEffortParser for PgbenchParser {
    fn name(&self) -> &'static str {
        "pgbench"
    }

    fn parse(&self, raw: &str) -> ParseReport {
        let text = normalize_whitespace(raw);
        let mut report = ParseReport::default();
        let capture = |re: &str| -> Option<f64> {
            pattern(re)?.captures(&text).and_then(|c| number(&c[1]))
        };

        report.metrics.tps = capture(r"tps = ([\d.]+) \((?:without|excluding)")
            .or_else(|| capture(r"tps = ([\d.]+)"));
        if report.metrics.tps.is_none() {
            report.note(format!("pgbench: no tps line in output: {}", sample(&text)));
        }
        report.metrics.avg_latency_ms = capture(r"latency average = ([\d.]+) ms");

        let processed = capture(r"number of transactions actually processed: (\d+)");
        let failed = capture(r"number of failed transactions: (\d+)");
        report.metrics.error_rate = match (failed, processed) {
            (Some(f), Some(p)) if f + p > 0.0 => Some(f / (f + p)),
            (Some(_), _) => Some(0.0),
            _ => None,
        };
        report
    }
}

/// Bulk generation report: a JSON document with per-table row counts and
/// timings, or the generator's console summary when no report was printed.
pub struct GenerationReportParser;

impl GenerationReportParser {
    fn from_json(doc: &Value) -> Option<Metrics> {
        let tables = doc
            .get("databases")?
            .as_array()?
            .iter()
            .filter_map(|db| db.get("tables").and_then(Value::as_array))
            .flatten();
        let table = tables.max_by_key(|t| t.get("rows").and_then(Value::as_u64).unwrap_or(0))?;
        let rows = table.get("rows").and_then(Value::as_u64)?;
        let duration_ms = table.get("durationMs").and_then(Value::as_f64);
        let rate = table
            .get("rowsPerSecond")
            .and_then(Value::as_f64)
            .or_else(|| duration_ms.filter(|d| *d > 0.0).map(|d| rows as f64 / (d / 1000.0)));
        let batches = table.get("batchDurations").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_f64)
                .map(|ms| ms / 1000.0)
                .collect()
        });
        Some(Metrics {
            gen_rows: Some(rows),
            gen_duration_s: duration_ms.map(|d| d / 1000.0),
            gen_rows_per_sec: rate,
            gen_batch_durations: batches,
            ..Metrics::default()
        })
    }

    fn from_console(raw: &str) -> Option<Metrics> {
        let rows_re = pattern(r"Generated\s+([\d,]+)\s+total\s+rows")?;
        let rows = rows_re
            .captures(raw)
            .and_then(|c| c[1].replace(',', "").parse::<u64>().ok())?;
        let rate = pattern(r"([\d,]+(?:\.\d+)?)\s+rows/s")
            .and_then(|re| re.captures(&raw.to_lowercase()).and_then(|c| number(&c[1])));
        Some(Metrics {
            gen_rows: Some(rows),
            gen_rows_per_sec: Some(rate.unwrap_or(0.0)),
            ..Metrics::default()
        })
    }
}

impl BestEffortParser for GenerationReportParser {
    fn name(&self) -> &'static str {
        "generation"
    }

    fn parse(&self, raw: &str) -> ParseReport {
        let mut report = ParseReport::default();
        if let Some(metrics) = first_json_object(raw).as_ref().and_then(Self::from_json) {
            report.metrics = metrics;
            return report;
        }
        match Self::from_console(raw) {
            Some(metrics) => {
                report.metrics = metrics;
                report.note("generation: JSON report unavailable, used console summary");
            }
            None => report.note(format!(
                "generation: no report or console summary: {}",
                sample(&normalize_whitespace(raw))
            )),
        }
        report
    }
}
