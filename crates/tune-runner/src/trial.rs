//! One configuration in, one objective value out.
//!
//! The orchestrator is the only component the search loop talks to. It
//! checks the result cache, provisions, benchmarks, prices and persists.
//! Trial-level problems never raise: they become an errored
//! [`TrialRecord`] and the objective's sentinel value. A result store that
//! cannot be read or written does raise, since further trials would be
//! measured and then lost.

use crate::bench::{render, run_workload, BenchOutcome, PhaseTiming, Workload};
use crate::config::ParamSet;
use crate::cost::{self, validate_shape};
use crate::error::{TrialFailure, TuneError};
use crate::infra::{InfraManager, InfraState};
use crate::metrics::{MetricName, MetricScope, Metrics, Objective};
use crate::provision::Provisioner;
use crate::remote::RemoteExec;
use crate::service::{Service, ServiceConfig};
use crate::settings::{Mode, ProviderProfile, TunerSettings};
use crate::store::{ResultStore, TrialRecord};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub provider: String,
    pub service: Service,
    pub mode: Mode,
    pub objective: Objective,
    pub use_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialOutcome {
    /// Objective value handed to the search strategy (always maximized).
    pub value: f64,
    pub cached: bool,
    pub record: TrialRecord,
}

pub struct TrialOrchestrator<P: Provisioner, R: RemoteExec> {
    options: RunOptions,
    profile: ProviderProfile,
    workload: Workload,
    baseline: Option<Workload>,
    settle: Duration,
    infra: InfraManager<P>,
    remote: R,
    store: ResultStore,
}

impl<P: Provisioner, R: RemoteExec> TrialOrchestrator<P, R> {
    /// Validates the run configuration, including that the workload can
    /// report the requested metric at all.
    pub fn new(
        settings: &TunerSettings,
        options: RunOptions,
        provisioner: P,
        remote: R,
    ) -> Result<Self, TuneError> {
        let profile = settings.provider(&options.provider)?.clone();
        if options.mode == Mode::Config && !options.service.supports_config_mode() {
            return Err(TuneError::InvalidSettings(format!(
                "{} does not support config mode",
                options.service
            )));
        }
        let workload = settings.workload(options.service);
        let baseline = settings.baseline(options.service);
        let measured_by = match options.objective.scope {
            MetricScope::Benchmark => &workload,
            MetricScope::Baseline => baseline.as_ref().ok_or_else(|| {
                TuneError::InvalidSettings(format!(
                    "metric {} needs a baseline workload for {}",
                    options.objective, options.service
                ))
            })?,
        };
        check_reported(&options, measured_by)?;
        let infra = InfraManager::new(
            provisioner,
            options.service,
            profile.clone(),
            settings.retry.clone(),
            settings.readiness.clone(),
            workload.health.clone(),
        );
        let store = ResultStore::new(settings.results_path(options.service, &options.provider));
        info!(
            provider = %options.provider,
            service = %options.service,
            mode = %options.mode,
            metric = %options.objective,
            results = %store.path().display(),
            "trial orchestrator ready"
        );
        Ok(Self {
            options,
            profile,
            workload,
            baseline,
            settle: Duration::from_secs(settings.teardown_settle_secs),
            infra,
            remote,
            store,
        })
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn infra(&self) -> &InfraManager<P> {
        &self.infra
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn evaluate(&mut self, params: &ParamSet) -> Result<f64, TuneError> {
        Ok(self.run_trial(params)?.value)
    }

    /// Evaluates one configuration. Errors only when the result store is
    /// unusable; the store is checked before anything is provisioned.
    pub fn run_trial(&mut self, params: &ParamSet) -> Result<TrialOutcome, TuneError> {
        let objective = self.options.objective;
        let key = params.canonical_key();

        if self.options.use_cache {
            if let Some(record) = self.store.find_cached(&key, &objective)? {
                if let Some(raw) = record.measured(&objective) {
                    info!(trial = %record.trial_id, config = %key, "cache hit, {} = {}", objective, raw);
                    return Ok(TrialOutcome {
                        value: objective.to_objective(raw),
                        cached: true,
                        record,
                    });
                }
            }
        }

        let trial = self.store.next_trial_number()?;
        let mut record = self.blank_record(trial, params);
        info!(trial = %record.trial_id, config = %key, "starting trial");

        if let Err(failure) = self.execute(params, &mut record) {
            warn!(trial = %record.trial_id, "trial failed: {}", failure);
            record.error = Some(failure.to_string());
        }

        let value = match (&record.error, record.measured(&objective)) {
            (None, Some(raw)) => {
                info!(trial = %record.trial_id, "{} = {}", objective, raw);
                objective.to_objective(raw)
            }
            (None, None) => {
                let msg = format!("{} missing from trial results", objective);
                warn!(trial = %record.trial_id, "{}", msg);
                record.error = Some(msg);
                objective.sentinel()
            }
            (Some(_), _) => objective.sentinel(),
        };

        self.store.append(record.clone())?;
        Ok(TrialOutcome {
            value,
            cached: false,
            record,
        })
    }

    fn blank_record(&self, trial: u64, params: &ParamSet) -> TrialRecord {
        TrialRecord {
            trial_id: format!("trial_{}", trial),
            trial,
            timestamp: Utc::now().to_rfc3339(),
            provider: self.options.provider.clone(),
            service: self.options.service.name().to_string(),
            mode: self.options.mode,
            config: params.clone(),
            config_digest: params.digest(),
            primary_metric: self.workload.primary_metric,
            metrics: Metrics::default(),
            baseline: None,
            derived: None,
            annotations: BTreeMap::new(),
            timings: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    fn template_vars(&self, params: &ParamSet, config: &dyn ServiceConfig) -> BTreeMap<String, String> {
        let mut vars = self.workload.vars.clone();
        vars.extend(params.iter().map(|(k, v)| (k.clone(), v.to_string())));
        vars.extend(config.workload_vars());
        vars
    }

    fn execute(&mut self, params: &ParamSet, record: &mut TrialRecord) -> Result<(), TrialFailure> {
        let config = self.options.service.parse_config(params)?;
        let shape = config
            .shape()
            .with_default_drive_kind(self.profile.default_disk_type());
        validate_shape(&shape, &self.profile.constraints, &self.options.provider)?;
        record.annotations = config.annotations();

        let started = Instant::now();
        if self.options.mode == Mode::Infra && self.infra.state() != InfraState::Absent {
            self.infra.teardown_service()?;
            if !self.settle.is_zero() {
                info!("waiting {}s for teardown to settle", self.settle.as_secs());
                thread::sleep(self.settle);
            }
        }
        let (endpoints, _) = self.infra.ensure(&self.remote, config.as_ref())?;
        record.timings.push(PhaseTiming {
            name: "provision".to_string(),
            seconds: started.elapsed().as_secs_f64(),
            ok: true,
        });

        let vars = self.template_vars(params, config.as_ref());
        if let Some(script) = config.settings_script() {
            let started = Instant::now();
            self.infra.apply_settings(&self.remote, &render(&script, &vars))?;
            record.timings.push(PhaseTiming {
                name: "settings".to_string(),
                seconds: started.elapsed().as_secs_f64(),
                ok: true,
            });
        }

        if let Some(baseline) = &self.baseline {
            info!("running baseline workload");
            let outcome = run_workload(&self.remote, baseline, &endpoints, &vars);
            let metrics = absorb(record, outcome, "baseline:")?;
            record.baseline = Some(metrics);
        }

        info!("running benchmark workload");
        let outcome = run_workload(&self.remote, &self.workload, &endpoints, &vars);
        record.metrics = absorb(record, outcome, "")?;

        let throughput = record.primary_value().unwrap_or(0.0);
        record.derived = Some(cost::derive(&shape, &self.profile.pricing, throughput));
        Ok(())
    }

    /// Ends the run. Infrastructure is kept unless `destroy` is set.
    pub fn finish(&mut self, destroy: bool) -> Result<(), TrialFailure> {
        if destroy {
            self.infra.destroy_all()?;
        } else {
            info!("leaving infrastructure running");
        }
        Ok(())
    }
}

/// Rejects objectives the workload can never report, before any trial runs.
/// Cost metrics are derived from the benchmark throughput and have no
/// baseline counterpart.
fn check_reported(options: &RunOptions, workload: &Workload) -> Result<(), TuneError> {
    let objective = options.objective;
    let derived = objective.metric.is_derived() && objective.scope == MetricScope::Benchmark;
    let reported = workload.reported_metrics();
    if derived || reported.contains(&objective.metric) {
        return Ok(());
    }
    let mut available: Vec<String> = reported.iter().map(MetricName::to_string).collect();
    if objective.scope == MetricScope::Benchmark {
        available.extend([MetricName::CostPerHour, MetricName::CostEfficiency].map(|m| m.to_string()));
    }
    Err(TuneError::UnsupportedMetric {
        metric: objective.to_string(),
        service: options.service.to_string(),
        available: available.join(", "),
    })
}

/// Moves timings and warnings onto the record. Partial metrics are kept
/// even when the workload failed.
fn absorb(record: &mut TrialRecord, outcome: BenchOutcome, prefix: &str) -> Result<Metrics, TrialFailure> {
    record
        .timings
        .extend(outcome.timings.into_iter().map(|mut t| {
            t.name = format!("{}{}", prefix, t.name);
            t
        }));
    record.warnings.extend(outcome.soft_failures);
    match outcome.failure {
        Some(failure) => {
            if prefix.is_empty() {
                record.metrics = outcome.metrics;
            } else {
                record.baseline = Some(outcome.metrics);
            }
            Err(failure.into())
        }
        None => Ok(outcome.metrics),
    }
}
