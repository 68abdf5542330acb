pub mod bench;
pub mod config;
pub mod cost;
pub mod error;
pub mod infra;
pub mod metrics;
pub mod parser;
pub mod provision;
pub mod remote;
pub mod retry;
pub mod service;
pub mod settings;
pub mod store;
pub mod strategy;
pub mod trial;

pub use config::{ParamSet, ParamValue, ResourceShape};
pub use error::{BenchError, ConfigError, InfraError, TrialFailure, TuneError};
pub use infra::{Endpoints, InfraManager, InfraState};
pub use metrics::{Direction, MetricName, Metrics, Objective};
pub use provision::{Provisioner, TerraformCli};
pub use remote::{RemoteExec, SshExecutor};
pub use service::{Service, ServiceConfig};
pub use settings::{Mode, TunerSettings};
pub use store::{ResultStore, TrialRecord};
pub use strategy::{warm_start, GridSearch, RandomSearch, SearchSpace, SearchStrategy};
pub use trial::{RunOptions, TrialOrchestrator, TrialOutcome};

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct SearchSummary {
    pub strategy: String,
    pub trials: Vec<TrialOutcome>,
    /// Best successful record in the result store, earlier runs included.
    pub best: Option<TrialRecord>,
}

impl SearchSummary {
    pub fn evaluated(&self) -> usize {
        self.trials.iter().filter(|t| !t.cached).count()
    }

    pub fn failed(&self) -> usize {
        self.trials
            .iter()
            .filter(|t| !t.record.is_success())
            .count()
    }
}

/// Drives `strategy` for up to `trials` proposals. With the cache enabled
/// the strategy is warm-started from the result store, so configurations
/// measured by earlier runs are not proposed again. An unusable result
/// store ends the search with an error.
pub fn run_search<P: Provisioner, R: RemoteExec>(
    orchestrator: &mut TrialOrchestrator<P, R>,
    strategy: &mut dyn SearchStrategy,
    trials: usize,
) -> Result<SearchSummary> {
    let objective = orchestrator.options().objective;
    if orchestrator.options().use_cache {
        let history = orchestrator
            .store()
            .history(&objective)
            .with_context(|| format!("loading history from {}", orchestrator.store().path().display()))?;
        if !history.is_empty() {
            info!(previous = history.len(), "warm-starting {} search", strategy.name());
        }
        warm_start(strategy, &history);
    }

    let mut outcomes = Vec::new();
    for n in 1..=trials {
        let Some(params) = strategy.propose() else {
            info!("search space exhausted after {} trials", n - 1);
            break;
        };
        info!(n, of = trials, config = %params.canonical_key(), "proposing");
        let outcome = orchestrator
            .run_trial(&params)
            .with_context(|| format!("trial {} stopped the search", n))?;
        strategy.observe(&params, outcome.value);
        outcomes.push(outcome);
    }

    let best = orchestrator
        .store()
        .best(&objective)
        .context("reading best trial")?;
    Ok(SearchSummary {
        strategy: strategy.name().to_string(),
        trials: outcomes,
        best,
    })
}

/// Builds the production orchestrator: terraform in the provider's working
/// directory and SSH for remote commands.
pub fn ssh_orchestrator(
    settings: &TunerSettings,
    options: RunOptions,
) -> Result<TrialOrchestrator<TerraformCli, SshExecutor>> {
    let profile = settings.provider(&options.provider)?;
    let terraform = TerraformCli::new(
        profile.terraform_dir.clone(),
        Duration::from_secs(settings.provision_timeout_secs),
    )
    .with_base_vars(profile.extra_vars.clone());
    let ssh = SshExecutor::new(settings.ssh.clone());
    Ok(TrialOrchestrator::new(settings, options, terraform, ssh)?)
}
