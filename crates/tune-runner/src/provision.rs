//! The provisioning backend seam and its terraform implementation.

use crate::remote::{run_captured, ExecStatus};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionOutput {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProvisionOutput {
    pub fn ok() -> Self {
        Self {
            status: ExecStatus::Exited(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::Exited(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == ExecStatus::Exited(0)
    }

    /// Text used for failure classification and error messages.
    pub fn diagnostics(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            self.stderr.clone()
        }
    }
}

/// Resource-graph operations of the provisioning backend. Implementations
/// own their working state (state files, plugin caches).
pub trait Provisioner {
    fn apply(&mut self, vars: &BTreeMap<String, String>) -> ProvisionOutput;
    fn destroy(&mut self) -> ProvisionOutput;
    /// Reconciles recorded state with reality; returns the exit code.
    fn refresh(&mut self) -> i32;
    fn output(&mut self, name: &str) -> Option<String>;
    /// Drops local state so the next apply starts from scratch.
    fn reset_state(&mut self) -> ProvisionOutput;
    fn taint(&mut self, resource: &str) -> ProvisionOutput;
}

pub struct TerraformCli {
    dir: PathBuf,
    binary: String,
    timeout: Duration,
    base_vars: BTreeMap<String, String>,
}

impl TerraformCli {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            binary: "terraform".to_string(),
            timeout,
            base_vars: BTreeMap::new(),
        }
    }

    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    /// Variables passed to every apply and destroy, such as credentials
    /// file paths or the region.
    pub fn with_base_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.base_vars = vars;
        self
    }

    fn run(&self, args: &[String]) -> ProvisionOutput {
        debug!(dir = %self.dir.display(), "{} {}", self.binary, args.join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&self.dir).args(args);
        let captured = run_captured(cmd, self.timeout);
        ProvisionOutput {
            status: captured.status,
            stdout: captured.stdout,
            stderr: captured.stderr,
        }
    }

    fn ensure_init(&self) -> Option<ProvisionOutput> {
        if self.dir.join(".terraform").exists() {
            return None;
        }
        let out = self.init();
        if out.success() {
            None
        } else {
            Some(out)
        }
    }

    fn init(&self) -> ProvisionOutput {
        info!(dir = %self.dir.display(), "terraform init");
        self.run(&["init".into(), "-input=false".into(), "-no-color".into()])
    }

    fn var_args(&self, vars: &BTreeMap<String, String>) -> Vec<String> {
        let mut merged = self.base_vars.clone();
        merged.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .into_iter()
            .flat_map(|(k, v)| ["-var".to_string(), format!("{}={}", k, v)])
            .collect()
    }
}

impl Provisioner for TerraformCli {
    fn apply(&mut self, vars: &BTreeMap<String, String>) -> ProvisionOutput {
        if let Some(failed) = self.ensure_init() {
            return failed;
        }
        let mut args: Vec<String> = ["apply", "-auto-approve", "-input=false", "-no-color"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.var_args(vars));
        self.run(&args)
    }

    fn destroy(&mut self) -> ProvisionOutput {
        if let Some(failed) = self.ensure_init() {
            return failed;
        }
        let mut args: Vec<String> = ["destroy", "-auto-approve", "-input=false", "-no-color"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.var_args(&BTreeMap::new()));
        self.run(&args)
    }

    fn refresh(&mut self) -> i32 {
        let mut args: Vec<String> = [
            "apply",
            "-refresh-only",
            "-auto-approve",
            "-input=false",
            "-no-color",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(self.var_args(&BTreeMap::new()));
        self.run(&args).status.code()
    }

    fn output(&mut self, name: &str) -> Option<String> {
        let out = self.run(&["output".into(), "-raw".into(), name.to_string()]);
        if !out.success() {
            return None;
        }
        let value = out.stdout.trim().trim_matches('"').to_string();
        if value.is_empty() || value == "null" {
            None
        } else {
            Some(value)
        }
    }

    fn reset_state(&mut self) -> ProvisionOutput {
        let state = self.dir.join("terraform.tfstate");
        if state.exists() {
            let backup = self.dir.join(format!(
                "terraform.tfstate.stale-{}",
                Utc::now().format("%Y%m%d%H%M%S")
            ));
            warn!(backup = %backup.display(), "moving stale terraform state aside");
            if let Err(e) = fs::rename(&state, &backup) {
                return ProvisionOutput::failed(format!("backup {}: {}", state.display(), e));
            }
        }
        let _ = fs::remove_file(self.dir.join("terraform.tfstate.backup"));
        let _ = fs::remove_file(self.dir.join(".terraform.tfstate.lock.info"));
        let plugins = self.dir.join(".terraform");
        if plugins.exists() {
            if let Err(e) = fs::remove_dir_all(&plugins) {
                return ProvisionOutput::failed(format!("remove {}: {}", plugins.display(), e));
            }
        }
        self.init()
    }

    fn taint(&mut self, resource: &str) -> ProvisionOutput {
        self.run(&["taint".into(), "-no-color".into(), resource.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tune_provision_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn var_args_merge_base_vars_with_call_vars() {
        let base: BTreeMap<String, String> = [("region".to_string(), "ru-9".to_string())]
            .into_iter()
            .collect();
        let tf = TerraformCli::new("/tmp", Duration::from_secs(1)).with_base_vars(base);
        let vars: BTreeMap<String, String> = [
            ("redis_enabled".to_string(), "false".to_string()),
            ("region".to_string(), "ru-7".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            tf.var_args(&vars),
            vec!["-var", "redis_enabled=false", "-var", "region=ru-7"]
        );
    }

    #[test]
    fn reset_state_moves_state_aside_and_reinitializes() {
        let dir = temp_dir("reset");
        fs::write(dir.join("terraform.tfstate"), "{}").expect("state");
        fs::create_dir_all(dir.join(".terraform/providers")).expect("plugins");
        // `true` stands in for terraform: init succeeds without doing anything.
        let mut tf = TerraformCli::new(&dir, Duration::from_secs(5)).with_binary("true");
        let out = tf.reset_state();
        assert!(out.success(), "{:?}", out);
        assert!(!dir.join("terraform.tfstate").exists());
        assert!(!dir.join(".terraform").exists());
        let backups = fs::read_dir(&dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".stale-"))
            .count();
        assert_eq!(backups, 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn output_treats_null_and_failures_as_missing() {
        let dir = temp_dir("output");
        fs::create_dir_all(dir.join(".terraform")).expect("plugins");
        let mut tf = TerraformCli::new(&dir, Duration::from_secs(5)).with_binary("false");
        assert_eq!(tf.output("benchmark_vm_ip"), None);
        let mut tf = TerraformCli::new(&dir, Duration::from_secs(5)).with_binary("echo");
        // echo prints its arguments: "output -raw <name>"
        assert_eq!(
            tf.output("benchmark_vm_ip").as_deref(),
            Some("output -raw benchmark_vm_ip")
        );
        let _ = fs::remove_dir_all(dir);
    }
}
