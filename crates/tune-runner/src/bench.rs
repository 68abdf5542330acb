//! Declarative multi-phase workloads and their execution against a deployed
//! service.

use crate::error::BenchError;
use crate::infra::Endpoints;
use crate::metrics::{MetricName, Metrics};
use crate::parser::{parse_pending_count, ParserKind};
use crate::remote::{poll_until, ExecStatus, RemoteExec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const POLL_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    #[default]
    Driver,
    /// The service host, reached through the driver as jump host.
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Fail,
    Warn,
}

/// Records a phase's wall time as a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationMetric {
    IndexingTimeS,
    GenDurationS,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSpec {
    /// Prints the number of pending work items; polled until it reports 0.
    pub command: String,
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_timeout")]
    pub timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_poll_timeout() -> u64 {
    1800
}

fn default_phase_timeout() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub target: Target,
    #[serde(default = "default_phase_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub parser: Option<ParserKind>,
    /// Its output is parsed instead of the phase command's own output.
    #[serde(default)]
    pub report_command: Option<String>,
    #[serde(default)]
    pub poll: Option<PollSpec>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub duration_metric: Option<DurationMetric>,
}

impl PhaseSpec {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            target: Target::Driver,
            timeout_secs: default_phase_timeout(),
            parser: None,
            report_command: None,
            poll: None,
            on_failure: OnFailure::Fail,
            duration_metric: None,
        }
    }

    pub fn on_service(mut self) -> Self {
        self.target = Target::Service;
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn parsed_by(mut self, parser: ParserKind) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn report(mut self, command: &str) -> Self {
        self.report_command = Some(command.to_string());
        self
    }

    pub fn poll(mut self, command: &str, interval_secs: u64, timeout_secs: u64) -> Self {
        self.poll = Some(PollSpec {
            command: command.to_string(),
            interval_secs,
            timeout_secs,
        });
        self
    }

    pub fn warn_on_failure(mut self) -> Self {
        self.on_failure = OnFailure::Warn;
        self
    }

    pub fn timed_as(mut self, metric: DurationMetric) -> Self {
        self.duration_metric = Some(metric);
        self
    }
}

/// Service liveness check, run on the service host via the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub command: String,
    /// Substring the output must contain; exit status alone when absent.
    #[serde(default)]
    pub expect: Option<String>,
}

impl HealthCheck {
    pub fn passes(&self, status: &ExecStatus, output: &str) -> bool {
        *status == ExecStatus::Exited(0)
            && self
                .expect
                .as_deref()
                .map(|e| output.contains(e))
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub primary_metric: MetricName,
    pub health: HealthCheck,
    /// Workload knobs available to phase templates.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    pub phases: Vec<PhaseSpec>,
}

impl Workload {
    /// Measured metrics some phase can report, in declaration order.
    pub fn reported_metrics(&self) -> Vec<MetricName> {
        let mut out: Vec<MetricName> = Vec::new();
        for phase in &self.phases {
            let parsed = phase.parser.map(|p| p.metrics()).unwrap_or(&[]);
            let timed = match phase.duration_metric {
                Some(DurationMetric::IndexingTimeS) => Some(MetricName::IndexingTimeS),
                Some(DurationMetric::GenDurationS) | None => None,
            };
            for metric in parsed.iter().copied().chain(timed) {
                if !out.contains(&metric) {
                    out.push(metric);
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub name: String,
    pub seconds: f64,
    pub ok: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchOutcome {
    pub metrics: Metrics,
    pub timings: Vec<PhaseTiming>,
    pub soft_failures: Vec<String>,
    pub failure: Option<BenchError>,
}

/// Replaces `{name}` placeholders whose name is in `vars`. Anything else,
/// including shell `${VAR}` and JSON braces, is left untouched.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if vars.contains_key(&after[..close]) => {
                out.push_str(&vars[&after[..close]]);
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Runs every phase in order. Phase failures with the `Fail` policy stop
/// the workload; the primary metric must be present and positive for the
/// run to count.
pub fn run_workload<R: RemoteExec + ?Sized>(
    remote: &R,
    workload: &Workload,
    endpoints: &Endpoints,
    vars: &BTreeMap<String, String>,
) -> BenchOutcome {
    let mut all_vars = workload.vars.clone();
    all_vars.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    all_vars.insert("driver_host".to_string(), endpoints.driver_host.clone());
    all_vars.insert("service_host".to_string(), endpoints.service_host.clone());

    let mut outcome = BenchOutcome::default();
    for phase in &workload.phases {
        let (host, jump) = match phase.target {
            Target::Driver => (endpoints.driver_host.as_str(), None),
            Target::Service => (
                endpoints.service_host.as_str(),
                Some(endpoints.driver_host.as_str()),
            ),
        };
        let started = Instant::now();
        let timeout = Duration::from_secs(phase.timeout_secs);
        info!(phase = %phase.name, host, "running phase");
        let out = remote.exec(host, &render(&phase.command, &all_vars), timeout, jump);

        if !out.success() {
            let err = match out.status {
                ExecStatus::TimedOut => BenchError::Timeout {
                    phase: phase.name.clone(),
                    timeout,
                },
                ref status => BenchError::NonZeroExit {
                    phase: phase.name.clone(),
                    status: status.code(),
                    tail: out.tail(5),
                },
            };
            outcome.timings.push(PhaseTiming {
                name: phase.name.clone(),
                seconds: started.elapsed().as_secs_f64(),
                ok: false,
            });
            match phase.on_failure {
                OnFailure::Warn => {
                    warn!(phase = %phase.name, "phase failed, continuing: {}", err);
                    outcome.soft_failures.push(err.to_string());
                    continue;
                }
                OnFailure::Fail => {
                    outcome.failure = Some(err);
                    return outcome;
                }
            }
        }

        if let Some(poll) = &phase.poll {
            let command = render(&poll.command, &all_vars);
            let done = poll_until(
                Duration::from_secs(poll.interval_secs),
                Duration::from_secs(poll.timeout_secs),
                || {
                    let pending = remote.exec(host, &command, POLL_EXEC_TIMEOUT, jump);
                    pending.success() && parse_pending_count(&pending.output) == Some(0)
                },
            );
            if !done {
                let msg = format!(
                    "{}: work still pending after {}s",
                    phase.name, poll.timeout_secs
                );
                warn!("{}", msg);
                outcome.soft_failures.push(msg);
            }
        }
        let seconds = started.elapsed().as_secs_f64();

        if let Some(kind) = phase.parser {
            let text = match &phase.report_command {
                Some(report) => {
                    let fetched = remote.exec(host, &render(report, &all_vars), POLL_EXEC_TIMEOUT, jump);
                    if !fetched.success() {
                        outcome
                            .soft_failures
                            .push(format!("{}: report command failed: {}", phase.name, fetched.tail(3)));
                    }
                    fetched.output
                }
                None => out.output,
            };
            let report = kind.parser().parse(&text);
            outcome.metrics.merge(report.metrics);
            outcome.soft_failures.extend(report.soft_failures);
        }
        match phase.duration_metric {
            Some(DurationMetric::IndexingTimeS) => outcome.metrics.indexing_time_s = Some(seconds),
            // a generator report carries its own, tighter timing
            Some(DurationMetric::GenDurationS) => {
                outcome.metrics.gen_duration_s.get_or_insert(seconds);
            }
            None => {}
        }
        outcome.timings.push(PhaseTiming {
            name: phase.name.clone(),
            seconds,
            ok: true,
        });
    }

    match outcome.metrics.get(workload.primary_metric) {
        Some(v) if v > 0.0 => {}
        other => {
            outcome.failure = Some(BenchError::Unparseable {
                metric: workload.primary_metric.to_string(),
                detail: match other {
                    Some(v) => format!("value {}", v),
                    None => outcome
                        .soft_failures
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "not reported".to_string()),
                },
            });
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;

    fn endpoints() -> Endpoints {
        Endpoints {
            driver_host: "203.0.113.7".to_string(),
            service_host: "10.0.0.10".to_string(),
        }
    }

    fn memtier_workload() -> Workload {
        Workload {
            primary_metric: MetricName::OpsPerSec,
            health: HealthCheck {
                command: "redis-cli ping".to_string(),
                expect: Some("PONG".to_string()),
            },
            vars: [("clients".to_string(), "50".to_string())].into_iter().collect(),
            phases: vec![
                PhaseSpec::new("flush", "redis-cli -h {service_host} FLUSHALL").warn_on_failure(),
                PhaseSpec::new("memtier", "memtier_benchmark -s {service_host} -c {clients}")
                    .parsed_by(ParserKind::Memtier),
            ],
        }
    }

    #[test]
    fn reported_metrics_follow_parsers_and_timed_phases() {
        let reported = memtier_workload().reported_metrics();
        assert_eq!(reported[0], MetricName::OpsPerSec);
        assert!(reported.contains(&MetricName::P99LatencyMs));
        assert!(!reported.contains(&MetricName::P95LatencyMs));

        let mut timed = memtier_workload();
        timed.phases[0] = timed.phases[0].clone().timed_as(DurationMetric::IndexingTimeS);
        assert!(timed.reported_metrics().contains(&MetricName::IndexingTimeS));
    }

    #[test]
    fn render_substitutes_known_keys_only() {
        let vars: BTreeMap<String, String> = [
            ("host".to_string(), "10.0.0.10".to_string()),
            ("vus".to_string(), "8".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            render("k6 run -e HOST={host} --vus {vus} ${HOME} {\"a\":1} {unknown}", &vars),
            "k6 run -e HOST=10.0.0.10 --vus 8 ${HOME} {\"a\":1} {unknown}"
        );
        assert_eq!(render("{host", &vars), "{host");
    }

    #[test]
    fn warn_phase_failure_is_soft_and_metrics_are_parsed() {
        let remote = FakeRemote::new()
            .respond("FLUSHALL", 1, "NOAUTH")
            .respond("memtier_benchmark", 0, "Totals 5000.00 4000.00 100.00 1.0 0.9 2.0 3.0 900.0");
        let outcome = run_workload(&remote, &memtier_workload(), &endpoints(), &BTreeMap::new());
        assert_eq!(outcome.failure, None);
        assert_eq!(outcome.metrics.ops_per_sec, Some(5000.0));
        assert_eq!(outcome.soft_failures.len(), 1);
        assert_eq!(outcome.timings.len(), 2);
        assert!(!outcome.timings[0].ok);
        assert!(remote
            .commands()
            .contains(&"memtier_benchmark -s 10.0.0.10 -c 50".to_string()));
    }

    #[test]
    fn fail_phase_stops_the_workload_with_non_zero_exit() {
        let remote = FakeRemote::new().respond("memtier_benchmark", 137, "Killed");
        let outcome = run_workload(&remote, &memtier_workload(), &endpoints(), &BTreeMap::new());
        match outcome.failure {
            Some(BenchError::NonZeroExit { ref phase, status, .. }) => {
                assert_eq!(phase, "memtier");
                assert_eq!(status, 137);
            }
            ref other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[test]
    fn timeout_is_reported_as_timeout() {
        let remote = FakeRemote::new().time_out_on("memtier_benchmark");
        let outcome = run_workload(&remote, &memtier_workload(), &endpoints(), &BTreeMap::new());
        assert!(matches!(outcome.failure, Some(BenchError::Timeout { .. })));
    }

    #[test]
    fn missing_primary_metric_is_unparseable() {
        let remote = FakeRemote::new().respond("memtier_benchmark", 0, "connection refused");
        let outcome = run_workload(&remote, &memtier_workload(), &endpoints(), &BTreeMap::new());
        assert!(matches!(
            outcome.failure,
            Some(BenchError::Unparseable { ref metric, .. }) if metric == "ops_per_sec"
        ));
    }

    #[test]
    fn poll_waits_for_zero_pending_and_report_command_is_parsed() {
        let workload = Workload {
            primary_metric: MetricName::Qps,
            health: HealthCheck {
                command: "curl -sf http://localhost:7700/health".to_string(),
                expect: Some("available".to_string()),
            },
            vars: BTreeMap::new(),
            phases: vec![
                PhaseSpec::new("upload", "upload-docs --host {service_host}")
                    .poll("curl -s tasks?statuses=processing,enqueued", 0, 5)
                    .timed_as(DurationMetric::IndexingTimeS),
                PhaseSpec::new("search", "k6 run search.js")
                    .parsed_by(ParserKind::K6Summary)
                    .report("cat /tmp/k6_results.json"),
            ],
        };
        let remote = FakeRemote::new()
            .respond_seq(
                "tasks?statuses",
                vec![(0, r#"{"total": 2}"#), (0, r#"{"total": 1}"#), (0, r#"{"total": 0}"#)],
            )
            .respond("k6 run", 0, "running (1m00s), 0/8 VUs")
            .respond(
                "cat /tmp/k6_results.json",
                0,
                r#"{"metrics": {"http_reqs": {"count": 600, "rate": 10.0},
                    "search_latency_ms": {"avg": 5, "med": 4, "p(95)": 9, "p(99)": 12}}}"#,
            );
        let outcome = run_workload(&remote, &workload, &endpoints(), &BTreeMap::new());
        assert_eq!(outcome.failure, None, "{:?}", outcome.soft_failures);
        assert_eq!(outcome.metrics.qps, Some(10.0));
        assert!(outcome.metrics.indexing_time_s.is_some());
        assert_eq!(
            remote.commands().iter().filter(|c| c.contains("tasks?statuses")).count(),
            3
        );
    }
}
