//! Services under test: typed configuration records, search spaces and
//! default workloads.

use crate::bench::{DurationMetric, HealthCheck, PhaseSpec, Workload};
use crate::config::{canonicalize_vars, DriveGroup, ParamSet, ResourceShape};
use crate::error::{ConfigError, TuneError};
use crate::metrics::MetricName;
use crate::parser::ParserKind;
use crate::remote::shell_quote;
use crate::settings::Mode;
use crate::strategy::SearchSpace;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {
    Minio,
    Redis,
    Postgres,
    Meilisearch,
}

impl Service {
    pub const ALL: [Service; 4] = [
        Service::Minio,
        Service::Redis,
        Service::Postgres,
        Service::Meilisearch,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Service::Minio => "minio",
            Service::Redis => "redis",
            Service::Postgres => "postgres",
            Service::Meilisearch => "meilisearch",
        }
    }

    pub fn enabled_var(&self) -> String {
        format!("{}_enabled", self.name())
    }

    /// Every service switched off: leaves only the driver host.
    pub fn all_disabled_vars() -> BTreeMap<String, String> {
        Service::ALL
            .iter()
            .map(|s| (s.enabled_var(), "false".to_string()))
            .collect()
    }

    fn enabled_vars(&self) -> BTreeMap<String, String> {
        let mut vars = Service::all_disabled_vars();
        vars.insert(self.enabled_var(), "true".to_string());
        vars
    }

    pub fn supports_config_mode(&self) -> bool {
        matches!(self, Service::Postgres | Service::Meilisearch)
    }

    pub fn parse_config(&self, params: &ParamSet) -> Result<Box<dyn ServiceConfig>, ConfigError> {
        Ok(match self {
            Service::Minio => Box::new(MinioConfig::from_params(params)?),
            Service::Redis => Box::new(RedisConfig::from_params(params)?),
            Service::Postgres => Box::new(PostgresConfig::from_params(params)?),
            Service::Meilisearch => Box::new(MeilisearchConfig::from_params(params)?),
        })
    }

    pub fn search_space(&self, mode: Mode, disk_types: &[String]) -> Result<SearchSpace, TuneError> {
        let disks = disk_types.to_vec();
        let first_disk = disk_types.first().cloned().unwrap_or_else(|| "fast".to_string());
        let space = match (self, mode) {
            (Service::Minio, Mode::Infra) => SearchSpace::new()
                .choice("nodes", vec![1i64, 2, 3, 4])
                .choice("cpu_per_node", vec![2i64, 4, 8])
                .choice("ram_per_node", vec![4i64, 8, 16, 32])
                .choice("drives_per_node", vec![1i64, 2, 3, 4])
                .choice("drive_size_gb", vec![100i64, 200])
                .choice("drive_type", disks),
            (Service::Redis, Mode::Infra) => SearchSpace::new()
                .choice("mode", vec!["single", "sentinel"])
                .choice("cpu_per_node", vec![2i64, 4, 8])
                .choice("ram_per_node", vec![4i64, 8, 16, 32])
                .choice("maxmemory_policy", vec!["allkeys-lru", "volatile-lru"])
                .choice("io_threads", vec![1i64, 2, 4])
                .choice("persistence", vec!["none", "rdb"]),
            (Service::Postgres, Mode::Infra) => SearchSpace::new()
                .choice("mode", vec!["single", "cluster"])
                .choice("cpu", vec![2i64, 4, 8])
                .choice("ram_gb", vec![4i64, 8, 16, 32])
                .choice("disk_type", disks)
                .choice("disk_size_gb", vec![50i64, 100]),
            (Service::Postgres, Mode::Config) => SearchSpace::new()
                .fixed("mode", "single")
                .fixed("cpu", 4i64)
                .fixed("ram_gb", 16i64)
                .fixed("disk_type", first_disk)
                .fixed("disk_size_gb", 100i64)
                .choice("shared_buffers_pct", vec![15i64, 25, 40])
                .choice("work_mem_mb", vec![4i64, 16, 64])
                .choice("max_connections", vec![100i64, 200, 400]),
            (Service::Meilisearch, Mode::Infra) => SearchSpace::new()
                .choice("cpu", vec![2i64, 4, 8, 16])
                .choice("ram_gb", vec![4i64, 8, 16, 32])
                .choice("disk_type", disks),
            (Service::Meilisearch, Mode::Config) => SearchSpace::new()
                .fixed("cpu", 4i64)
                .fixed("ram_gb", 8i64)
                .fixed("disk_type", first_disk)
                .choice("max_indexing_memory_mb", vec![256i64, 512, 1024, 2048])
                .choice("max_indexing_threads", vec![0i64, 2, 4, 8]),
            (service, Mode::Config) => {
                return Err(TuneError::InvalidSettings(format!(
                    "{} has no config-level parameters; use --mode infra",
                    service
                )))
            }
        };
        Ok(space)
    }

    pub fn default_workload(&self) -> Workload {
        match self {
            Service::Minio => minio_workload(),
            Service::Redis => redis_workload(),
            Service::Postgres => postgres_workload(),
            Service::Meilisearch => meilisearch_workload(),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Service {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let name = if lowered == "meili" { "meilisearch" } else { lowered.as_str() };
        Service::ALL
            .iter()
            .copied()
            .find(|svc| svc.name() == name)
            .ok_or_else(|| TuneError::UnknownService(s.to_string()))
    }
}

/// Shared capability of the typed per-service configuration records.
pub trait ServiceConfig: fmt::Debug {
    fn service(&self) -> Service;

    fn params(&self) -> ParamSet;

    fn canonical_key(&self) -> String {
        self.params().canonical_key()
    }

    fn shape(&self) -> ResourceShape;

    fn provisioning_vars(&self) -> BTreeMap<String, String>;

    /// Equal shape keys describe the same deployment.
    fn shape_key(&self) -> String {
        canonicalize_vars(&self.provisioning_vars())
    }

    /// Remote command applying runtime settings on the service host.
    fn settings_script(&self) -> Option<String> {
        None
    }

    fn workload_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn annotations(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

fn positive(params: &ParamSet, name: &str) -> Result<u32, ConfigError> {
    let v = params.require_u32(name)?;
    if v == 0 {
        return Err(ConfigError::InvalidParam {
            name: name.to_string(),
            value: v.to_string(),
        });
    }
    Ok(v)
}

fn vars<const N: usize>(base: BTreeMap<String, String>, pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    let mut out = base;
    out.extend(pairs.into_iter().map(|(k, v)| (k.to_string(), v)));
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinioConfig {
    pub nodes: u32,
    pub cpu_per_node: u32,
    pub ram_per_node: u32,
    pub drives_per_node: u32,
    pub drive_size_gb: u32,
    pub drive_type: String,
}

impl MinioConfig {
    pub fn from_params(p: &ParamSet) -> Result<Self, ConfigError> {
        Ok(Self {
            nodes: positive(p, "nodes")?,
            cpu_per_node: positive(p, "cpu_per_node")?,
            ram_per_node: positive(p, "ram_per_node")?,
            drives_per_node: positive(p, "drives_per_node")?,
            drive_size_gb: positive(p, "drive_size_gb")?,
            drive_type: p.require_text("drive_type")?,
        })
    }

    pub fn total_drives(&self) -> u32 {
        self.nodes * self.drives_per_node
    }

    /// Parity drives per erasure set; MinIO needs at least four drives.
    pub fn ec_level(&self) -> u32 {
        let total = self.total_drives();
        if total >= 4 {
            total / 2
        } else {
            0
        }
    }
}

impl ServiceConfig for MinioConfig {
    fn service(&self) -> Service {
        Service::Minio
    }

    fn params(&self) -> ParamSet {
        ParamSet::new()
            .with("nodes", self.nodes)
            .with("cpu_per_node", self.cpu_per_node)
            .with("ram_per_node", self.ram_per_node)
            .with("drives_per_node", self.drives_per_node)
            .with("drive_size_gb", self.drive_size_gb)
            .with("drive_type", self.drive_type.as_str())
    }

    fn shape(&self) -> ResourceShape {
        ResourceShape {
            nodes: self.nodes,
            cpu_per_node: self.cpu_per_node,
            ram_gb_per_node: self.ram_per_node,
            drives: vec![DriveGroup {
                count: self.drives_per_node,
                size_gb: self.drive_size_gb,
                kind: self.drive_type.clone(),
            }],
        }
    }

    fn provisioning_vars(&self) -> BTreeMap<String, String> {
        vars(
            Service::Minio.enabled_vars(),
            [
                ("minio_node_count", self.nodes.to_string()),
                ("minio_node_cpu", self.cpu_per_node.to_string()),
                ("minio_node_ram_gb", self.ram_per_node.to_string()),
                ("minio_drives_per_node", self.drives_per_node.to_string()),
                ("minio_drive_size_gb", self.drive_size_gb.to_string()),
                ("minio_drive_type", self.drive_type.clone()),
            ],
        )
    }

    fn annotations(&self) -> BTreeMap<String, Value> {
        [
            ("total_drives".to_string(), json!(self.total_drives())),
            ("ec_level".to_string(), json!(self.ec_level())),
        ]
        .into_iter()
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    pub mode: String,
    pub cpu_per_node: u32,
    pub ram_per_node: u32,
    pub maxmemory_policy: String,
    pub io_threads: u32,
    pub persistence: String,
    /// Boot disk type; the provider's stock disk when unset.
    pub disk_type: Option<String>,
}

const REDIS_BOOT_DISK_GB: u32 = 50;

impl RedisConfig {
    pub fn from_params(p: &ParamSet) -> Result<Self, ConfigError> {
        Ok(Self {
            mode: p.require_choice("mode", &["single", "sentinel"])?,
            cpu_per_node: positive(p, "cpu_per_node")?,
            ram_per_node: positive(p, "ram_per_node")?,
            maxmemory_policy: p.require_choice(
                "maxmemory_policy",
                &[
                    "allkeys-lru",
                    "volatile-lru",
                    "allkeys-lfu",
                    "volatile-lfu",
                    "allkeys-random",
                    "noeviction",
                ],
            )?,
            io_threads: positive(p, "io_threads")?,
            persistence: p.require_choice("persistence", &["none", "rdb", "aof"])?,
            disk_type: p.optional_text("disk_type"),
        })
    }

    pub fn nodes(&self) -> u32 {
        if self.mode == "sentinel" {
            3
        } else {
            1
        }
    }
}

impl ServiceConfig for RedisConfig {
    fn service(&self) -> Service {
        Service::Redis
    }

    fn params(&self) -> ParamSet {
        let mut p = ParamSet::new()
            .with("mode", self.mode.as_str())
            .with("cpu_per_node", self.cpu_per_node)
            .with("ram_per_node", self.ram_per_node)
            .with("maxmemory_policy", self.maxmemory_policy.as_str())
            .with("io_threads", self.io_threads)
            .with("persistence", self.persistence.as_str());
        if let Some(disk) = &self.disk_type {
            p.insert("disk_type", disk.as_str());
        }
        p
    }

    fn shape(&self) -> ResourceShape {
        ResourceShape {
            nodes: self.nodes(),
            cpu_per_node: self.cpu_per_node,
            ram_gb_per_node: self.ram_per_node,
            drives: vec![DriveGroup {
                count: 1,
                size_gb: REDIS_BOOT_DISK_GB,
                kind: self.disk_type.clone().unwrap_or_default(),
            }],
        }
    }

    fn provisioning_vars(&self) -> BTreeMap<String, String> {
        let mut out = vars(
            Service::Redis.enabled_vars(),
            [
                ("redis_mode", self.mode.clone()),
                ("redis_node_cpu", self.cpu_per_node.to_string()),
                ("redis_node_ram_gb", self.ram_per_node.to_string()),
                ("redis_maxmemory_policy", self.maxmemory_policy.clone()),
                ("redis_io_threads", self.io_threads.to_string()),
                ("redis_persistence", self.persistence.clone()),
            ],
        );
        if let Some(disk) = &self.disk_type {
            out.insert("redis_disk_type".to_string(), disk.clone());
        }
        out
    }

    fn annotations(&self) -> BTreeMap<String, Value> {
        [("nodes".to_string(), json!(self.nodes()))].into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostgresConfig {
    pub mode: String,
    pub cpu: u32,
    pub ram_gb: u32,
    pub disk_type: String,
    pub disk_size_gb: u32,
    pub shared_buffers_pct: Option<u32>,
    pub work_mem_mb: Option<u32>,
    pub max_connections: Option<u32>,
}

impl PostgresConfig {
    pub fn from_params(p: &ParamSet) -> Result<Self, ConfigError> {
        let shared_buffers_pct = p.optional_u32("shared_buffers_pct")?;
        if let Some(pct) = shared_buffers_pct {
            if pct == 0 || pct > 80 {
                return Err(ConfigError::InvalidParam {
                    name: "shared_buffers_pct".to_string(),
                    value: pct.to_string(),
                });
            }
        }
        Ok(Self {
            mode: p.require_choice("mode", &["single", "cluster"])?,
            cpu: positive(p, "cpu")?,
            ram_gb: positive(p, "ram_gb")?,
            disk_type: p.require_text("disk_type")?,
            disk_size_gb: positive(p, "disk_size_gb")?,
            shared_buffers_pct,
            work_mem_mb: p.optional_u32("work_mem_mb")?,
            max_connections: p.optional_u32("max_connections")?,
        })
    }

    pub fn nodes(&self) -> u32 {
        if self.mode == "cluster" {
            3
        } else {
            1
        }
    }

    fn server_settings(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(pct) = self.shared_buffers_pct {
            out.push(("shared_buffers", format!("{}MB", self.ram_gb * 1024 * pct / 100)));
        }
        if let Some(mb) = self.work_mem_mb {
            out.push(("work_mem", format!("{}MB", mb)));
        }
        if let Some(n) = self.max_connections {
            out.push(("max_connections", n.to_string()));
        }
        out
    }
}

impl ServiceConfig for PostgresConfig {
    fn service(&self) -> Service {
        Service::Postgres
    }

    fn params(&self) -> ParamSet {
        let mut p = ParamSet::new()
            .with("mode", self.mode.as_str())
            .with("cpu", self.cpu)
            .with("ram_gb", self.ram_gb)
            .with("disk_type", self.disk_type.as_str())
            .with("disk_size_gb", self.disk_size_gb);
        if let Some(v) = self.shared_buffers_pct {
            p.insert("shared_buffers_pct", v);
        }
        if let Some(v) = self.work_mem_mb {
            p.insert("work_mem_mb", v);
        }
        if let Some(v) = self.max_connections {
            p.insert("max_connections", v);
        }
        p
    }

    fn shape(&self) -> ResourceShape {
        ResourceShape {
            nodes: self.nodes(),
            cpu_per_node: self.cpu,
            ram_gb_per_node: self.ram_gb,
            drives: vec![DriveGroup {
                count: 1,
                size_gb: self.disk_size_gb,
                kind: self.disk_type.clone(),
            }],
        }
    }

    fn provisioning_vars(&self) -> BTreeMap<String, String> {
        vars(
            Service::Postgres.enabled_vars(),
            [
                ("postgres_mode", self.mode.clone()),
                ("postgres_cpu", self.cpu.to_string()),
                ("postgres_ram_gb", self.ram_gb.to_string()),
                ("postgres_disk_type", self.disk_type.clone()),
                ("postgres_disk_size_gb", self.disk_size_gb.to_string()),
            ],
        )
    }

    fn settings_script(&self) -> Option<String> {
        let settings = self.server_settings();
        if settings.is_empty() {
            return None;
        }
        let mut steps: Vec<String> = settings
            .iter()
            .map(|(name, value)| {
                let sql = format!("ALTER SYSTEM SET {} = '{}'", name, value);
                format!("sudo -u postgres psql -qc {}", shell_quote(&sql))
            })
            .collect();
        steps.push("systemctl restart postgresql".to_string());
        Some(steps.join(" && "))
    }

    fn workload_vars(&self) -> BTreeMap<String, String> {
        let mut clients = self.cpu * 4;
        if let Some(max) = self.max_connections {
            clients = clients.min(max.saturating_sub(5).max(1));
        }
        [
            ("clients".to_string(), clients.to_string()),
            ("jobs".to_string(), self.cpu.to_string()),
        ]
        .into_iter()
        .collect()
    }

    fn annotations(&self) -> BTreeMap<String, Value> {
        let mut out: BTreeMap<String, Value> =
            [("nodes".to_string(), json!(self.nodes()))].into_iter().collect();
        for (name, value) in self.server_settings() {
            out.insert(name.to_string(), json!(value));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeilisearchConfig {
    pub cpu: u32,
    pub ram_gb: u32,
    pub disk_type: String,
    pub max_indexing_memory_mb: Option<u32>,
    /// 0 lets the engine pick.
    pub max_indexing_threads: Option<u32>,
}

const MEILI_DISK_GB: u32 = 50;

impl MeilisearchConfig {
    pub fn from_params(p: &ParamSet) -> Result<Self, ConfigError> {
        Ok(Self {
            cpu: positive(p, "cpu")?,
            ram_gb: positive(p, "ram_gb")?,
            disk_type: p.require_text("disk_type")?,
            max_indexing_memory_mb: p.optional_u32("max_indexing_memory_mb")?,
            max_indexing_threads: p.optional_u32("max_indexing_threads")?,
        })
    }
}

impl ServiceConfig for MeilisearchConfig {
    fn service(&self) -> Service {
        Service::Meilisearch
    }

    fn params(&self) -> ParamSet {
        let mut p = ParamSet::new()
            .with("cpu", self.cpu)
            .with("ram_gb", self.ram_gb)
            .with("disk_type", self.disk_type.as_str());
        if let Some(v) = self.max_indexing_memory_mb {
            p.insert("max_indexing_memory_mb", v);
        }
        if let Some(v) = self.max_indexing_threads {
            p.insert("max_indexing_threads", v);
        }
        p
    }

    fn shape(&self) -> ResourceShape {
        ResourceShape {
            nodes: 1,
            cpu_per_node: self.cpu,
            ram_gb_per_node: self.ram_gb,
            drives: vec![DriveGroup {
                count: 1,
                size_gb: MEILI_DISK_GB,
                kind: self.disk_type.clone(),
            }],
        }
    }

    fn provisioning_vars(&self) -> BTreeMap<String, String> {
        vars(
            Service::Meilisearch.enabled_vars(),
            [
                ("meilisearch_cpu", self.cpu.to_string()),
                ("meilisearch_ram_gb", self.ram_gb.to_string()),
                ("meilisearch_disk_type", self.disk_type.clone()),
            ],
        )
    }

    fn settings_script(&self) -> Option<String> {
        if self.max_indexing_memory_mb.is_none() && self.max_indexing_threads.is_none() {
            return None;
        }
        let mut lines = vec![
            "MEILI_ENV=production".to_string(),
            "MEILI_HTTP_ADDR=0.0.0.0:7700".to_string(),
            "MEILI_MASTER_KEY={master_key}".to_string(),
            "MEILI_NO_ANALYTICS=true".to_string(),
        ];
        if let Some(mb) = self.max_indexing_memory_mb {
            lines.push(format!("MEILI_MAX_INDEXING_MEMORY={}Mb", mb));
        }
        match self.max_indexing_threads {
            Some(0) | None => {}
            Some(n) => lines.push(format!("MEILI_MAX_INDEXING_THREADS={}", n)),
        }
        Some(format!(
            "printf '%s\\n' {} > /etc/meilisearch.env && systemctl restart meilisearch",
            lines.iter().map(|l| shell_quote(l)).collect::<Vec<_>>().join(" ")
        ))
    }

    fn workload_vars(&self) -> BTreeMap<String, String> {
        [("vus".to_string(), (self.cpu * 2).to_string())]
            .into_iter()
            .collect()
    }
}

fn knobs<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Object throughput from `warp`, then Trino/Iceberg ingestion through the
/// fresh deployment. Warp failures only warn.
fn minio_workload() -> Workload {
    Workload {
        primary_metric: MetricName::GenRowsPerSec,
        health: HealthCheck {
            command: "curl -sf http://localhost:9000/minio/health/live && echo live".to_string(),
            expect: Some("live".to_string()),
        },
        vars: knobs([
            ("access_key", "minioadmin"),
            ("secret_key", "minioadmin123"),
            ("duration", "5m"),
            ("bench_dir", "/root/indexless-query-benchmarks"),
            ("gen_rows", "100000000"),
            ("gen_batch", "100000000"),
            ("trino_settle_secs", "30"),
        ]),
        phases: vec![
            PhaseSpec::new(
                "warp",
                "warp mixed --host={service_host}:9000 --access-key={access_key} \
                 --secret-key={secret_key} --get-distrib 60 --stat-distrib 25 \
                 --put-distrib 10 --delete-distrib 5 --duration={duration} --autoterm 2>&1",
            )
            .timeout(1200)
            .parsed_by(ParserKind::Warp)
            .warn_on_failure(),
            // Trino holds connections to the previous deployment
            PhaseSpec::new(
                "trino-restart",
                "cd {bench_dir} && (pnpm compose:down 2>/dev/null; \
                 pnpm compose:up:trino:64gb:standalone-minio) && sleep {trino_settle_secs}",
            )
            .timeout(600)
            .warn_on_failure(),
            PhaseSpec::new(
                "generate",
                "cd {bench_dir} && pnpm generate --trino -n {gen_rows} -b {gen_batch} --report \
                 > /tmp/generate.log 2>&1; status=$?; tail -n 50 /tmp/generate.log; exit $status",
            )
            .timeout(7200)
            .parsed_by(ParserKind::GenerationReport)
            .report(
                "cd {bench_dir} && report=$(sed -n 's/.*Generated JSON report: //p' /tmp/generate.log | tail -n 1) \
                 && test -n \"$report\" && cat \"$report\" || cat /tmp/generate.log",
            )
            .timed_as(DurationMetric::GenDurationS),
        ],
    }
}

fn redis_workload() -> Workload {
    Workload {
        primary_metric: MetricName::OpsPerSec,
        health: HealthCheck {
            command: "test -f /root/redis-ready && redis-cli ping".to_string(),
            expect: Some("PONG".to_string()),
        },
        vars: knobs([
            ("clients", "50"),
            ("threads", "4"),
            ("ratio", "1:4"),
            ("duration", "60"),
            ("data_size", "256"),
        ]),
        phases: vec![
            PhaseSpec::new(
                "install-memtier",
                "command -v memtier_benchmark || (apt-get update && apt-get install -y memtier-benchmark)",
            )
            .timeout(300)
            .warn_on_failure(),
            PhaseSpec::new(
                "memtier",
                "memtier_benchmark -s {service_host} -p 6379 --protocol=redis \
                 --clients={clients} --threads={threads} --ratio={ratio} \
                 --data-size={data_size} --test-time={duration} --hide-histogram 2>&1",
            )
            .timeout(300)
            .parsed_by(ParserKind::Memtier),
        ],
    }
}

fn postgres_workload() -> Workload {
    Workload {
        primary_metric: MetricName::Tps,
        health: HealthCheck {
            command: "pg_isready -q && echo ready".to_string(),
            expect: Some("ready".to_string()),
        },
        vars: knobs([("scale", "100"), ("duration", "60"), ("db_user", "postgres")]),
        phases: vec![
            PhaseSpec::new(
                "pgbench-init",
                "PGPASSWORD=postgres pgbench -h {service_host} -U {db_user} -i -s {scale} postgres 2>&1",
            )
            .timeout(1800),
            PhaseSpec::new(
                "pgbench",
                "PGPASSWORD=postgres pgbench -h {service_host} -U {db_user} -c {clients} -j {jobs} \
                 -T {duration} postgres 2>&1",
            )
            .timeout(600)
            .parsed_by(ParserKind::Pgbench),
        ],
    }
}

fn meilisearch_workload() -> Workload {
    let auth = "-H 'Authorization: Bearer {master_key}'";
    Workload {
        primary_metric: MetricName::Qps,
        health: HealthCheck {
            command: "curl -sf http://localhost:7700/health".to_string(),
            expect: Some("available".to_string()),
        },
        vars: knobs([
            ("master_key", "benchmark-master-key-change-in-production"),
            ("dataset_size", "500000"),
            ("duration", "60"),
        ]),
        phases: vec![
            PhaseSpec::new(
                "dataset",
                "test -s /tmp/products.ndjson || node /opt/benchmark/generate-products.js {dataset_size} /tmp/products.ndjson",
            )
            .timeout(300),
            PhaseSpec::new(
                "index-reset",
                &format!(
                    "curl -s -X DELETE http://{{service_host}}:7700/indexes/products {auth}; \
                     curl -sf -X POST http://{{service_host}}:7700/indexes {auth} \
                     -H 'Content-Type: application/json' --data '{{\"uid\": \"products\", \"primaryKey\": \"id\"}}'",
                ),
            )
            .timeout(60),
            PhaseSpec::new(
                "index-settings",
                &format!(
                    "curl -sf -X PATCH http://{{service_host}}:7700/indexes/products/settings {auth} \
                     -H 'Content-Type: application/json' --data \
                     '{{\"searchableAttributes\": [\"title\", \"description\", \"brand\"], \
                     \"filterableAttributes\": [\"category\", \"brand\", \"price\", \"rating\", \"in_stock\"], \
                     \"sortableAttributes\": [\"price\", \"rating\"]}}'",
                ),
            )
            .timeout(60)
            .warn_on_failure(),
            PhaseSpec::new(
                "upload",
                &format!(
                    "rm -f /tmp/batch_* && split -l 50000 /tmp/products.ndjson /tmp/batch_ && \
                     for f in /tmp/batch_*; do curl -sf -X POST \
                     http://{{service_host}}:7700/indexes/products/documents {auth} \
                     -H 'Content-Type: application/x-ndjson' --data-binary @\"$f\" || exit 1; done",
                ),
            )
            .timeout(600)
            .poll(
                &format!(
                    "curl -sf 'http://{{service_host}}:7700/tasks?statuses=processing,enqueued' {auth}"
                ),
                2,
                1800,
            )
            .timed_as(DurationMetric::IndexingTimeS),
            PhaseSpec::new(
                "k6",
                "k6 run /opt/benchmark/meilisearch.js -e MEILI_URL=http://{service_host}:7700 \
                 -e MEILI_KEY={master_key} -e VUS={vus} -e DURATION={duration}s \
                 --summary-export=/tmp/k6_results.json 2>&1",
            )
            .timeout(300)
            .parsed_by(ParserKind::K6Summary)
            .report("cat /tmp/k6_results.json"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamValue;

    fn minio(nodes: i64, drives: i64) -> ParamSet {
        ParamSet::new()
            .with("nodes", nodes)
            .with("cpu_per_node", 4i64)
            .with("ram_per_node", 8i64)
            .with("drives_per_node", drives)
            .with("drive_size_gb", 100i64)
            .with("drive_type", "fast")
    }

    #[test]
    fn minio_erasure_coding_level_follows_total_drives() {
        let small = MinioConfig::from_params(&minio(1, 2)).expect("config");
        assert_eq!(small.total_drives(), 2);
        assert_eq!(small.ec_level(), 0);
        let big = MinioConfig::from_params(&minio(3, 4)).expect("config");
        assert_eq!(big.annotations()["total_drives"], json!(12));
        assert_eq!(big.annotations()["ec_level"], json!(6));
    }

    #[test]
    fn parse_config_round_trips_through_params() {
        let params = minio(2, 2);
        let config = Service::Minio.parse_config(&params).expect("valid");
        assert_eq!(config.canonical_key(), params.canonical_key());
        let vars = config.provisioning_vars();
        assert_eq!(vars["minio_enabled"], "true");
        assert_eq!(vars["redis_enabled"], "false");
        assert_eq!(vars["minio_node_count"], "2");
    }

    #[test]
    fn missing_or_invalid_params_are_config_errors() {
        let mut params = minio(2, 2);
        params.insert("nodes", 0i64);
        assert!(matches!(
            Service::Minio.parse_config(&params),
            Err(ConfigError::InvalidParam { .. })
        ));
        let redis = ParamSet::new().with("mode", "cluster");
        assert!(Service::Redis.parse_config(&redis).is_err());
    }

    #[test]
    fn meilisearch_config_settings_do_not_change_shape_key() {
        let base = ParamSet::new()
            .with("cpu", 4i64)
            .with("ram_gb", 8i64)
            .with("disk_type", "fast");
        let a = Service::Meilisearch
            .parse_config(&base.clone().with("max_indexing_memory_mb", 256i64))
            .expect("a");
        let b = Service::Meilisearch
            .parse_config(&base.with("max_indexing_memory_mb", 2048i64).with("max_indexing_threads", 4i64))
            .expect("b");
        assert_eq!(a.shape_key(), b.shape_key());
        assert_ne!(a.canonical_key(), b.canonical_key());
        let script = b.settings_script().expect("script");
        assert!(script.contains("MEILI_MAX_INDEXING_MEMORY=2048Mb"));
        assert!(script.contains("MEILI_MAX_INDEXING_THREADS=4"));
        assert!(script.contains("systemctl restart meilisearch"));
        assert_eq!(b.workload_vars()["vus"], "8");
    }

    #[test]
    fn postgres_settings_script_sizes_shared_buffers_from_ram() {
        let params = ParamSet::new()
            .with("mode", "single")
            .with("cpu", 4i64)
            .with("ram_gb", 16i64)
            .with("disk_type", "fast")
            .with("disk_size_gb", 100i64)
            .with("shared_buffers_pct", 25i64)
            .with("max_connections", 20i64);
        let config = PostgresConfig::from_params(&params).expect("config");
        let script = config.settings_script().expect("script");
        assert!(script.contains("ALTER SYSTEM SET shared_buffers"), "{}", script);
        assert!(script.contains("4096MB"), "{}", script);
        assert!(script.ends_with("systemctl restart postgresql"));
        assert_eq!(config.workload_vars()["clients"], "15");
    }

    #[test]
    fn redis_sentinel_costs_three_nodes() {
        let params = ParamSet::new()
            .with("mode", "sentinel")
            .with("cpu_per_node", 2i64)
            .with("ram_per_node", 4i64)
            .with("maxmemory_policy", "allkeys-lru")
            .with("io_threads", 2i64)
            .with("persistence", "none");
        let config = Service::Redis.parse_config(&params).expect("config");
        let shape = config.shape();
        assert_eq!(shape.nodes, 3);
        assert_eq!(shape.drives[0].size_gb, 50);
        assert_eq!(shape.drives[0].kind, "");
        assert!(!config.provisioning_vars().contains_key("redis_disk_type"));

        let ssd = Service::Redis
            .parse_config(&params.with("disk_type", "ssd"))
            .expect("config");
        assert_eq!(ssd.shape().drives[0].kind, "ssd");
        assert_eq!(ssd.provisioning_vars()["redis_disk_type"], "ssd");
        assert!(ssd.canonical_key().contains("disk_type"));
    }

    #[test]
    fn default_workloads_report_their_primary_metric() {
        for service in Service::ALL {
            let workload = service.default_workload();
            assert!(
                workload.reported_metrics().contains(&workload.primary_metric),
                "{} cannot report {}",
                service,
                workload.primary_metric
            );
        }
        let minio = Service::Minio.default_workload();
        let generate = minio.phases.iter().find(|p| p.name == "generate").expect("generate phase");
        assert_eq!(generate.parser, Some(ParserKind::GenerationReport));
        assert!(minio.reported_metrics().contains(&MetricName::TotalMibS));
    }

    #[test]
    fn search_spaces_follow_mode() {
        let disks = vec!["fast".to_string(), "basic".to_string()];
        let infra = Service::Minio.search_space(Mode::Infra, &disks).expect("space");
        let drive_types = &infra.dims.iter().find(|d| d.name == "drive_type").expect("dim").choices;
        assert_eq!(drive_types, &vec![ParamValue::from("fast"), ParamValue::from("basic")]);
        assert!(Service::Minio.search_space(Mode::Config, &disks).is_err());
        let config = Service::Meilisearch.search_space(Mode::Config, &disks).expect("space");
        assert_eq!(config.size(), 16);
        assert_eq!(config.fixed.get("disk_type"), Some(&ParamValue::from("fast")));
    }

    #[test]
    fn service_names_parse_with_alias() {
        assert_eq!("meili".parse::<Service>().expect("alias"), Service::Meilisearch);
        assert_eq!("Redis".parse::<Service>().expect("case"), Service::Redis);
        assert!("mongo".parse::<Service>().is_err());
    }
}
