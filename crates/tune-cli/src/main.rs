use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tune_runner::{
    GridSearch, Mode, Objective, ParamSet, ParamValue, RandomSearch, ResultStore, RunOptions,
    SearchStrategy, Service, TrialOutcome, TrialRecord, TunerSettings,
};

#[derive(Parser)]
#[command(name = "tune", version, about = "Empirical infrastructure tuning")]
struct Cli {
    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Target {
    /// YAML settings file; built-in defaults when omitted.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long, default_value = "selectel")]
    provider: String,
    #[arg(long)]
    service: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "infra")]
    Infra,
    #[value(name = "config")]
    Config,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Infra => Mode::Infra,
            ModeArg::Config => Mode::Config,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    #[value(name = "grid")]
    Grid,
    #[value(name = "random")]
    Random,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the configuration space.
    Run {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_enum, default_value = "infra")]
        mode: ModeArg,
        /// Metric to optimize; the workload's primary metric when omitted.
        #[arg(long)]
        metric: Option<String>,
        #[arg(long, default_value_t = 10)]
        trials: usize,
        #[arg(long)]
        no_cache: bool,
        #[arg(long)]
        destroy_at_end: bool,
        #[arg(long, value_enum, default_value = "random")]
        strategy: StrategyArg,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Pins a dimension, e.g. the host shape in config mode.
        #[arg(long = "fixed")]
        fixed_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run a single trial.
    Evaluate {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_enum, default_value = "infra")]
        mode: ModeArg,
        #[arg(long)]
        metric: Option<String>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        no_cache: bool,
        #[arg(long)]
        destroy_at_end: bool,
        #[arg(long)]
        json: bool,
    },
    /// List stored trials.
    Results {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        metric: Option<String>,
        /// Only the best successful trial.
        #[arg(long)]
        best: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the search space.
    Space {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_enum, default_value = "infra")]
        mode: ModeArg,
        #[arg(long = "fixed")]
        fixed_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Tear down all infrastructure, driver host included.
    Destroy {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // stdout is reserved for results and --json payloads
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            target,
            mode,
            metric,
            trials,
            no_cache,
            destroy_at_end,
            strategy,
            seed,
            fixed_values,
            json,
        } => {
            let (settings, service) = load_target(&target)?;
            let mode: Mode = mode.into();
            let fixed = parse_set_bindings(&fixed_values)?;
            let profile = settings.provider(&target.provider)?;
            let space = service
                .search_space(mode, &profile.disk_types)?
                .with_fixed(&fixed)
                .feasible_on(service, &target.provider, &profile.constraints);
            let mut strategy: Box<dyn SearchStrategy> = match strategy {
                StrategyArg::Grid => Box::new(GridSearch::new(space)),
                StrategyArg::Random => Box::new(RandomSearch::new(space, seed)),
            };
            let options = run_options(&settings, &target, service, mode, metric.as_deref(), !no_cache)?;
            let mut orchestrator = tune_runner::ssh_orchestrator(&settings, options)?;
            let summary = tune_runner::run_search(&mut orchestrator, strategy.as_mut(), trials);
            orchestrator.finish(destroy_at_end)?;
            let summary = summary?;
            let objective = orchestrator.options().objective;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "provider": target.provider,
                    "service": service.name(),
                    "mode": mode.as_str(),
                    "metric": objective.to_string(),
                    "strategy": summary.strategy,
                    "evaluated": summary.evaluated(),
                    "failed": summary.failed(),
                    "trials": summary.trials.iter().map(outcome_to_json).collect::<Vec<_>>(),
                    "best": summary.best.as_ref().map(|r| record_to_json(r, &objective)),
                    "results_path": orchestrator.store().path().display().to_string()
                })));
            }
            println!("strategy: {}", summary.strategy);
            println!(
                "trials: {} ({} evaluated, {} failed)",
                summary.trials.len(),
                summary.evaluated(),
                summary.failed()
            );
            for outcome in &summary.trials {
                print_record(&outcome.record, &objective, outcome.cached);
            }
            match &summary.best {
                Some(best) => {
                    println!("best:");
                    print_record(best, &objective, false);
                }
                None => println!("best: none"),
            }
            println!("results: {}", orchestrator.store().path().display());
        }
        Commands::Evaluate {
            target,
            mode,
            metric,
            set_values,
            no_cache,
            destroy_at_end,
            json,
        } => {
            let (settings, service) = load_target(&target)?;
            let params = parse_set_bindings(&set_values)?;
            if params.is_empty() {
                return Err(anyhow!("evaluate needs at least one --set k=v"));
            }
            let options = run_options(&settings, &target, service, mode.into(), metric.as_deref(), !no_cache)?;
            let mut orchestrator = tune_runner::ssh_orchestrator(&settings, options)?;
            let outcome = orchestrator.run_trial(&params);
            orchestrator.finish(destroy_at_end)?;
            let outcome = outcome?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "evaluate",
                    "trial": outcome_to_json(&outcome)
                })));
            }
            print_record(&outcome.record, &orchestrator.options().objective, outcome.cached);
            println!("objective: {}", outcome.value);
        }
        Commands::Results {
            target,
            metric,
            best,
            json,
        } => {
            let (settings, service) = load_target(&target)?;
            settings.provider(&target.provider)?;
            let objective = objective_for(&settings, service, metric.as_deref())?;
            let store = ResultStore::new(settings.results_path(service, &target.provider));
            let records = if best {
                store.best(&objective)?.into_iter().collect()
            } else {
                store.load()?
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "results",
                    "path": store.path().display().to_string(),
                    "metric": objective.to_string(),
                    "records": records.iter().map(|r| record_to_json(r, &objective)).collect::<Vec<_>>()
                })));
            }
            println!("results: {}", store.path().display());
            if records.is_empty() {
                println!("no trials recorded");
            }
            for record in &records {
                print_record(record, &objective, false);
            }
        }
        Commands::Space {
            target,
            mode,
            fixed_values,
            json,
        } => {
            let (settings, service) = load_target(&target)?;
            let profile = settings.provider(&target.provider)?;
            let fixed = parse_set_bindings(&fixed_values)?;
            let space = service
                .search_space(mode.into(), &profile.disk_types)?
                .with_fixed(&fixed)
                .feasible_on(service, &target.provider, &profile.constraints);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "space",
                    "service": service.name(),
                    "size": space.size(),
                    "feasible": space.feasible_size(),
                    "fixed": space.fixed,
                    "dimensions": space.dims.iter().map(|d| json!({
                        "name": d.name,
                        "choices": d.choices
                    })).collect::<Vec<_>>()
                })));
            }
            println!("service: {}", service);
            println!("size: {} ({} feasible on {})", space.size(), space.feasible_size(), target.provider);
            for (name, value) in space.fixed.iter() {
                println!("  {} = {}", name, value);
            }
            for dim in &space.dims {
                let choices: Vec<String> = dim.choices.iter().map(ParamValue::to_string).collect();
                println!("  {}: [{}]", dim.name, choices.join(", "));
            }
        }
        Commands::Destroy { target, json } => {
            let (settings, service) = load_target(&target)?;
            let objective = objective_for(&settings, service, None)?;
            let options = RunOptions {
                provider: target.provider.clone(),
                service,
                mode: Mode::Infra,
                objective,
                use_cache: false,
            };
            let mut orchestrator = tune_runner::ssh_orchestrator(&settings, options)?;
            orchestrator.finish(true)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "destroy",
                    "provider": target.provider
                })));
            }
            println!("destroyed: {}", target.provider);
        }
    }
    Ok(None)
}

fn load_target(target: &Target) -> Result<(TunerSettings, Service)> {
    let settings = match &target.settings {
        Some(path) => TunerSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => TunerSettings::default(),
    };
    let service: Service = target.service.parse()?;
    Ok((settings, service))
}

fn objective_for(settings: &TunerSettings, service: Service, metric: Option<&str>) -> Result<Objective> {
    Ok(match metric {
        Some(raw) => raw.parse()?,
        None => Objective::new(settings.workload(service).primary_metric),
    })
}

fn run_options(
    settings: &TunerSettings,
    target: &Target,
    service: Service,
    mode: Mode,
    metric: Option<&str>,
    use_cache: bool,
) -> Result<RunOptions> {
    Ok(RunOptions {
        provider: target.provider.clone(),
        service,
        mode,
        objective: objective_for(settings, service, metric)?,
        use_cache,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Evaluate { json, .. }
        | Commands::Results { json, .. }
        | Commands::Space { json, .. }
        | Commands::Destroy { json, .. } => *json,
    }
}

fn record_to_json(record: &TrialRecord, objective: &Objective) -> Value {
    json!({
        "trial_id": record.trial_id,
        "timestamp": record.timestamp,
        "config": record.config,
        "config_digest": record.config_digest,
        "value": record.measured(objective),
        "metrics": record.metrics,
        "derived": record.derived,
        "timings": record.timings,
        "warnings": record.warnings,
        "error": record.error
    })
}

fn outcome_to_json(outcome: &TrialOutcome) -> Value {
    json!({
        "cached": outcome.cached,
        // non-finite sentinels have no JSON form
        "objective": if outcome.value.is_finite() { json!(outcome.value) } else { Value::Null },
        "record": outcome.record
    })
}

fn print_record(record: &TrialRecord, objective: &Objective, cached: bool) {
    let status = match (&record.error, cached) {
        (Some(_), _) => "error",
        (None, true) => "cached",
        (None, false) => "ok",
    };
    let value = record
        .measured(objective)
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {} [{}] {}={} {}",
        record.trial_id,
        status,
        objective,
        value,
        record.config.canonical_key()
    );
    if let Some(error) = &record.error {
        println!("    error: {}", error);
    }
}

fn parse_set_bindings(values: &[String]) -> Result<ParamSet> {
    let mut out = ParamSet::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid binding '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid binding '{}': key cannot be empty", raw));
        }
        let value: ParamValue = match val_raw.parse() {
            Ok(v) => v,
            Err(never) => match never {},
        };
        out.insert(key.trim(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bindings_are_typed() {
        let params = parse_set_bindings(&[
            "cpu=4".to_string(),
            "ratio=0.5".to_string(),
            "mode=single".to_string(),
        ])
        .expect("bindings");
        assert_eq!(params.get("cpu"), Some(&ParamValue::Int(4)));
        assert_eq!(params.get("ratio"), Some(&ParamValue::Float(0.5)));
        assert_eq!(params.get("mode"), Some(&ParamValue::Text("single".to_string())));
    }

    #[test]
    fn malformed_bindings_are_rejected() {
        assert!(parse_set_bindings(&["cpu".to_string()]).is_err());
        assert!(parse_set_bindings(&[" =4".to_string()]).is_err());
    }

    #[test]
    fn error_envelope_shape() {
        let payload = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["error"]["code"], json!("command_failed"));
        assert_eq!(payload["error"]["message"], json!("boom"));
    }
}
