use std::time::Duration;
use thiserror::Error;

/// Errors raised before any trial starts. These are the only errors that
/// reach the process boundary.
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("unknown provider: {name} (available: {available})")]
    UnknownProvider { name: String, available: String },

    #[error("unknown service: {0} (available: minio, redis, postgres, meilisearch)")]
    UnknownService(String),

    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("{service} workload does not report {metric} (reports: {available})")]
    UnsupportedMetric {
        metric: String,
        service: String,
        available: String,
    },

    #[error("unknown mode: {0} (available: infra, config)")]
    UnknownMode(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("result store {path}: {detail}")]
    Store { path: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// A proposed configuration that cannot be turned into a deployment.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing parameter: {0}")]
    MissingParam(String),

    #[error("parameter {name} has unsupported value {value}")]
    InvalidParam { name: String, value: String },

    #[error("infeasible on {provider}: {reason}")]
    Infeasible { provider: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InfraError {
    #[error("{operation}: stale provisioning state persisted after {attempts} attempts: {detail}")]
    StaleState {
        operation: String,
        attempts: u32,
        detail: String,
    },

    #[error("{operation}: resource conflict persisted after {attempts} attempts: {detail}")]
    TransientConflict {
        operation: String,
        attempts: u32,
        detail: String,
    },

    #[error("{operation} failed: {detail}")]
    Fatal { operation: String, detail: String },

    #[error("provisioning output {0} is missing")]
    MissingOutput(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BenchError {
    #[error("phase {phase} timed out after {}s", timeout.as_secs())]
    Timeout { phase: String, timeout: Duration },

    #[error("phase {phase} exited with status {status}: {tail}")]
    NonZeroExit {
        phase: String,
        status: i32,
        tail: String,
    },

    #[error("{metric} missing from benchmark output ({detail})")]
    Unparseable { metric: String, detail: String },
}

/// Everything that ends a single trial. Rendered into the record's `error`
/// field; never propagated to the search loop.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrialFailure {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("infra: {0}")]
    Infra(#[from] InfraError),

    #[error("benchmark: {0}")]
    Bench(#[from] BenchError),
}
