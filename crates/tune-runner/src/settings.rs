//! Run-wide settings, loaded from YAML. Every field has a default so an
//! empty file (or no file) describes a working setup for the built-in
//! providers.

use crate::bench::Workload;
use crate::cost::{PricingTable, ProviderConstraints};
use crate::error::TuneError;
use crate::remote::SshSettings;
use crate::retry::RetryPolicy;
use crate::service::Service;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Vary the physical shape; every trial re-provisions.
    #[default]
    Infra,
    /// Keep a fixed shape and vary service-level settings.
    Config,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Infra => "infra",
            Mode::Config => "config",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "infra" => Ok(Mode::Infra),
            "config" => Ok(Mode::Config),
            _ => Err(TuneError::UnknownMode(s.to_string())),
        }
    }
}

/// How resources are tainted before a service deployment is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaintScope {
    Once,
    PerNode,
    PerDrive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaintRule {
    pub resource: String,
    pub scope: TaintScope,
}

impl TaintRule {
    fn new(resource: &str, scope: TaintScope) -> Self {
        Self {
            resource: resource.to_string(),
            scope,
        }
    }

    /// Concrete resource addresses for a deployment.
    pub fn expand(&self, nodes: u32, total_drives: u32) -> Vec<String> {
        let count = match self.scope {
            TaintScope::Once => return vec![self.resource.clone()],
            TaintScope::PerNode => nodes,
            TaintScope::PerDrive => total_drives,
        };
        (0..count)
            .map(|i| format!("{}[{}]", self.resource, i))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub terraform_dir: PathBuf,
    pub pricing: PricingTable,
    #[serde(default)]
    pub constraints: ProviderConstraints,
    #[serde(default)]
    pub disk_types: Vec<String>,
    #[serde(default = "default_driver_output")]
    pub driver_output: String,
    /// Service name to output name; `<service>_vm_ip` when absent.
    #[serde(default)]
    pub service_outputs: BTreeMap<String, String>,
    /// Passed to every apply.
    #[serde(default)]
    pub extra_vars: BTreeMap<String, String>,
    /// Service name to resources forced into recreation on create.
    #[serde(default)]
    pub taint_on_create: BTreeMap<String, Vec<TaintRule>>,
}

fn default_driver_output() -> String {
    "benchmark_vm_ip".to_string()
}

impl ProviderProfile {
    pub fn service_output(&self, service: Service) -> String {
        self.service_outputs
            .get(service.name())
            .cloned()
            .unwrap_or_else(|| format!("{}_vm_ip", service.name()))
    }

    /// First listed disk type; what the provider attaches unless told otherwise.
    pub fn default_disk_type(&self) -> &str {
        self.disk_types.first().map(String::as_str).unwrap_or_default()
    }

    pub fn taint_rules(&self, service: Service) -> &[TaintRule] {
        self.taint_on_create
            .get(service.name())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn rates(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    pub fn selectel() -> Self {
        Self {
            terraform_dir: PathBuf::from("terraform/selectel"),
            pricing: PricingTable {
                cpu_rate: 0.5,
                ram_rate: 0.1,
                drive_rates: Self::rates(&[("fast", 0.01), ("universal", 0.005), ("basic", 0.002)]),
                fallback_drive_rate: 0.01,
            },
            constraints: ProviderConstraints {
                min_ram_gb_by_cpu: [(2, 2), (4, 4), (8, 8), (16, 32), (32, 64)]
                    .into_iter()
                    .collect(),
            },
            disk_types: vec!["fast".into(), "universal".into(), "basic".into()],
            driver_output: default_driver_output(),
            service_outputs: BTreeMap::new(),
            extra_vars: BTreeMap::new(),
            taint_on_create: [(
                "minio".to_string(),
                vec![
                    TaintRule::new("openstack_compute_instance_v2.minio", TaintScope::PerNode),
                    TaintRule::new("openstack_blockstorage_volume_v3.minio_boot", TaintScope::PerNode),
                    TaintRule::new("openstack_networking_port_v2.minio", TaintScope::PerNode),
                    TaintRule::new("openstack_blockstorage_volume_v3.minio_data", TaintScope::PerDrive),
                ],
            )]
            .into_iter()
            .collect(),
        }
    }

    pub fn timeweb() -> Self {
        Self {
            terraform_dir: PathBuf::from("terraform/timeweb"),
            pricing: PricingTable {
                cpu_rate: 0.4,
                ram_rate: 0.08,
                drive_rates: Self::rates(&[("nvme", 0.012), ("ssd", 0.008), ("hdd", 0.003)]),
                fallback_drive_rate: 0.01,
            },
            constraints: ProviderConstraints::default(),
            disk_types: vec!["nvme".into(), "ssd".into(), "hdd".into()],
            driver_output: default_driver_output(),
            service_outputs: BTreeMap::new(),
            extra_vars: BTreeMap::new(),
            taint_on_create: [(
                "minio".to_string(),
                vec![
                    TaintRule::new("twc_server.minio", TaintScope::PerNode),
                    TaintRule::new("twc_server_disk.minio_data", TaintScope::PerDrive),
                ],
            )]
            .into_iter()
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub check_timeout_secs: u64,
    /// File created on the driver host once its tooling is installed.
    pub driver_marker: String,
    pub driver_timeout_secs: u64,
    /// Remote timeout for service settings scripts.
    pub settings_timeout_secs: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_secs: 300,
            check_timeout_secs: 30,
            driver_marker: "/root/benchmark-ready".to_string(),
            driver_timeout_secs: 600,
            settings_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerSettings {
    pub results_dir: PathBuf,
    pub providers: BTreeMap<String, ProviderProfile>,
    pub ssh: SshSettings,
    pub retry: RetryPolicy,
    pub readiness: ReadinessSettings,
    pub provision_timeout_secs: u64,
    /// Seconds to wait after a teardown before the next create.
    pub teardown_settle_secs: u64,
    /// Per-service workload overrides.
    pub workloads: BTreeMap<String, Workload>,
    /// Per-service baseline workloads, run before the benchmark.
    pub baselines: BTreeMap<String, Workload>,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            providers: [
                ("selectel".to_string(), ProviderProfile::selectel()),
                ("timeweb".to_string(), ProviderProfile::timeweb()),
            ]
            .into_iter()
            .collect(),
            ssh: SshSettings::default(),
            retry: RetryPolicy::default(),
            readiness: ReadinessSettings::default(),
            provision_timeout_secs: 1800,
            teardown_settle_secs: 10,
            workloads: BTreeMap::new(),
            baselines: BTreeMap::new(),
        }
    }
}

impl TunerSettings {
    pub fn from_yaml(raw: &str) -> Result<Self, TuneError> {
        let settings: TunerSettings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, TuneError> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    fn validate(&self) -> Result<(), TuneError> {
        for (name, workload) in self.workloads.iter().chain(self.baselines.iter()) {
            name.parse::<Service>()?;
            if workload.phases.is_empty() {
                return Err(TuneError::InvalidSettings(format!(
                    "workload for {} has no phases",
                    name
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(TuneError::InvalidSettings(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Result<&ProviderProfile, TuneError> {
        self.providers
            .get(name)
            .ok_or_else(|| TuneError::UnknownProvider {
                name: name.to_string(),
                available: self.providers.keys().cloned().collect::<Vec<_>>().join(", "),
            })
    }

    pub fn workload(&self, service: Service) -> Workload {
        self.workloads
            .get(service.name())
            .cloned()
            .unwrap_or_else(|| service.default_workload())
    }

    pub fn baseline(&self, service: Service) -> Option<Workload> {
        self.baselines.get(service.name()).cloned()
    }

    pub fn results_path(&self, service: Service, provider: &str) -> PathBuf {
        self.results_dir
            .join(format!("results_{}_{}.json", service.name(), provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricName;

    #[test]
    fn empty_yaml_yields_builtin_providers() {
        let settings = TunerSettings::from_yaml("{}").expect("defaults");
        let selectel = settings.provider("selectel").expect("selectel");
        assert_eq!(selectel.pricing.drive_rate("fast"), 0.01);
        assert_eq!(selectel.constraints.min_ram_gb_by_cpu.get(&16), Some(&32));
        assert_eq!(selectel.service_output(Service::Redis), "redis_vm_ip");
        assert_eq!(selectel.default_disk_type(), "fast");
        assert_eq!(settings.provider("timeweb").expect("timeweb").default_disk_type(), "nvme");
        assert_eq!(settings.teardown_settle_secs, 10);

        let err = settings.provider("aws").expect_err("unknown");
        assert!(err.to_string().contains("selectel, timeweb"), "{}", err);
    }

    #[test]
    fn yaml_overrides_merge_with_defaults() {
        let raw = r#"
results_dir: /var/lib/tune
retry:
  conflict_backoff_secs: 1
readiness:
  timeout_secs: 60
workloads:
  redis:
    primary_metric: p99_latency_ms
    health: {command: "redis-cli ping", expect: PONG}
    phases:
      - name: memtier
        command: "memtier_benchmark -s {service_host}"
        parser: memtier
"#;
        let settings = TunerSettings::from_yaml(raw).expect("parse");
        assert_eq!(settings.retry.conflict_backoff_secs, 1);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.readiness.interval_secs, 10);
        assert_eq!(settings.readiness.timeout_secs, 60);
        let workload = settings.workload(Service::Redis);
        assert_eq!(workload.primary_metric, MetricName::P99LatencyMs);
        assert_eq!(workload.phases[0].timeout_secs, 600);
        assert_eq!(settings.workload(Service::Minio).primary_metric, MetricName::GenRowsPerSec);
        assert_eq!(
            settings.results_path(Service::Redis, "timeweb"),
            PathBuf::from("/var/lib/tune/results_redis_timeweb.json")
        );
    }

    #[test]
    fn workload_for_unknown_service_is_rejected() {
        let raw = "workloads:\n  mongo:\n    primary_metric: qps\n    health: {command: 'true'}\n    phases: []\n";
        assert!(matches!(
            TunerSettings::from_yaml(raw),
            Err(TuneError::UnknownService(_))
        ));
    }

    #[test]
    fn taint_rules_expand_per_node_and_drive() {
        let profile = ProviderProfile::timeweb();
        let resources: Vec<String> = profile
            .taint_rules(Service::Minio)
            .iter()
            .flat_map(|r| r.expand(2, 4))
            .collect();
        assert_eq!(resources.len(), 6);
        assert_eq!(resources[0], "twc_server.minio[0]");
        assert_eq!(resources[5], "twc_server_disk.minio_data[3]");
        assert!(profile.taint_rules(Service::Redis).is_empty());
    }
}
