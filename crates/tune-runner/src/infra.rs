//! Idempotent lifecycle of the driver host and the service under test.
//!
//! One manager per provider and service. It tracks what it believes is
//! deployed so that an unchanged shape is reused without touching the
//! provisioning backend, and it recovers from stale state and transient
//! conflicts through a bounded [`RetryMachine`].

use crate::bench::HealthCheck;
use crate::error::InfraError;
use crate::provision::{ProvisionOutput, Provisioner};
use crate::remote::{poll_until, RemoteExec};
use crate::retry::{FailureClass, RetryMachine, RetryPolicy, RetryStep};
use crate::service::{Service, ServiceConfig};
use crate::settings::{ProviderProfile, ReadinessSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraState {
    Unknown,
    Provisioning,
    Ready,
    Stale,
    Destroying,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub driver_host: String,
    pub service_host: String,
}

pub struct InfraManager<P: Provisioner> {
    provisioner: P,
    service: Service,
    profile: ProviderProfile,
    retry: RetryPolicy,
    readiness: ReadinessSettings,
    health: HealthCheck,
    state: InfraState,
    deployed_shape: Option<String>,
    driver_host: Option<String>,
    service_host: Option<String>,
}

impl<P: Provisioner> InfraManager<P> {
    pub fn new(
        provisioner: P,
        service: Service,
        profile: ProviderProfile,
        retry: RetryPolicy,
        readiness: ReadinessSettings,
        health: HealthCheck,
    ) -> Self {
        Self {
            provisioner,
            service,
            profile,
            retry,
            readiness,
            health,
            state: InfraState::Unknown,
            deployed_shape: None,
            driver_host: None,
            service_host: None,
        }
    }

    pub fn state(&self) -> InfraState {
        self.state
    }

    pub fn endpoints(&self) -> Option<Endpoints> {
        Some(Endpoints {
            driver_host: self.driver_host.clone()?,
            service_host: self.service_host.clone()?,
        })
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness.check_timeout_secs)
    }

    fn driver_answers<R: RemoteExec + ?Sized>(&self, remote: &R, host: &str) -> bool {
        let answer = remote.exec(host, "echo ok", self.check_timeout(), None);
        answer.success() && answer.output.contains("ok")
    }

    /// Driver host address, creating the host when it is missing or does
    /// not answer. A known host is checked on every call, so a driver lost
    /// between trials is replaced instead of failing the next workload.
    pub fn ensure_driver<R: RemoteExec + ?Sized>(&mut self, remote: &R) -> Result<String, InfraError> {
        let lost = self.driver_host.take();
        if let Some(host) = &lost {
            if self.driver_answers(remote, host) {
                self.driver_host = lost.clone();
                return Ok(host.clone());
            }
            warn!(driver = %host, "driver host stopped answering");
        }

        // recorded state may predate out-of-band changes to the hosts
        let code = self.provisioner.refresh();
        if code != 0 {
            warn!(code, "state refresh failed, using recorded outputs");
        }
        if let Some(ip) = self.provisioner.output(&self.profile.driver_output) {
            if lost.as_deref() != Some(ip.as_str()) && self.driver_answers(remote, &ip) {
                info!(driver = %ip, "reusing driver host");
                self.driver_host = Some(ip.clone());
                return Ok(ip);
            }
            warn!(driver = %ip, "driver host does not answer, re-applying");
        }

        info!("creating driver host");
        let vars = self.with_extra_vars(Service::all_disabled_vars());
        self.apply_with_retry("create driver", &vars)?;
        self.state = InfraState::Absent;
        self.deployed_shape = None;
        self.service_host = None;

        let ip = self
            .provisioner
            .output(&self.profile.driver_output)
            .ok_or_else(|| InfraError::MissingOutput(self.profile.driver_output.clone()))?;
        let marker = format!("test -f {} && echo ready", self.readiness.driver_marker);
        let ready = poll_until(
            Duration::from_secs(self.readiness.interval_secs),
            Duration::from_secs(self.readiness.driver_timeout_secs),
            || {
                let out = remote.exec(&ip, &marker, self.check_timeout(), None);
                out.success() && out.output.contains("ready")
            },
        );
        if !ready {
            warn!(
                driver = %ip,
                "driver not ready after {}s, continuing anyway",
                self.readiness.driver_timeout_secs
            );
        }
        self.driver_host = Some(ip.clone());
        Ok(ip)
    }

    /// Brings the service deployment to the shape of `config`. Returns the
    /// endpoints and the time spent.
    pub fn ensure<R: RemoteExec + ?Sized>(
        &mut self,
        remote: &R,
        config: &dyn ServiceConfig,
    ) -> Result<(Endpoints, Duration), InfraError> {
        let started = Instant::now();
        let driver = self.ensure_driver(remote)?;
        let shape_key = config.shape_key();

        if self.state == InfraState::Ready && self.deployed_shape.as_deref() == Some(&shape_key) {
            if let Some(host) = self.service_host.clone() {
                if self.is_healthy(remote, &driver, &host) {
                    info!(service = %self.service, host = %host, "deployment reused");
                    return Ok((
                        Endpoints {
                            driver_host: driver,
                            service_host: host,
                        },
                        started.elapsed(),
                    ));
                }
            }
            warn!(service = %self.service, "liveness check failed, recreating");
            self.state = InfraState::Stale;
        }

        if self.state != InfraState::Absent {
            self.teardown_service()?;
        }
        let endpoints = self.create(remote, config, &shape_key)?;
        Ok((endpoints, started.elapsed()))
    }

    fn create<R: RemoteExec + ?Sized>(
        &mut self,
        remote: &R,
        config: &dyn ServiceConfig,
        shape_key: &str,
    ) -> Result<Endpoints, InfraError> {
        self.state = InfraState::Provisioning;
        let shape = config.shape();
        let resources: Vec<String> = self
            .profile
            .taint_rules(self.service)
            .iter()
            .flat_map(|rule| rule.expand(shape.nodes, shape.total_drives()))
            .collect();
        if !resources.is_empty() {
            self.taint(&resources);
        }

        info!(service = %self.service, shape = %shape_key, "provisioning");
        let vars = self.with_extra_vars(config.provisioning_vars());
        self.apply_with_retry(&format!("create {}", self.service), &vars)?;

        let output = self.profile.service_output(self.service);
        let host = match self.provisioner.output(&output) {
            Some(host) => host,
            None => {
                self.state = InfraState::Unknown;
                return Err(InfraError::MissingOutput(output));
            }
        };
        // a state reset during the apply may have replaced the driver
        if let Some(driver) = self.provisioner.output(&self.profile.driver_output) {
            self.driver_host = Some(driver);
        }
        let driver = self
            .driver_host
            .clone()
            .ok_or_else(|| InfraError::MissingOutput(self.profile.driver_output.clone()))?;

        self.wait_until_ready(remote, &driver, &host);
        self.state = InfraState::Ready;
        self.deployed_shape = Some(shape_key.to_string());
        self.service_host = Some(host.clone());
        Ok(Endpoints {
            driver_host: driver,
            service_host: host,
        })
    }

    /// Removes the service under test, keeping the driver host.
    pub fn teardown_service(&mut self) -> Result<(), InfraError> {
        if self.state == InfraState::Absent {
            return Ok(());
        }
        info!(service = %self.service, "tearing down service deployment");
        self.state = InfraState::Destroying;
        let vars = self.with_extra_vars(Service::all_disabled_vars());
        self.apply_with_retry(&format!("teardown {}", self.service), &vars)?;
        self.state = InfraState::Absent;
        self.deployed_shape = None;
        self.service_host = None;
        Ok(())
    }

    /// Full teardown, driver host included.
    pub fn destroy_all(&mut self) -> Result<(), InfraError> {
        info!("destroying all infrastructure");
        self.state = InfraState::Destroying;
        self.with_retry("destroy", |p| p.destroy())?;
        self.state = InfraState::Absent;
        self.deployed_shape = None;
        self.service_host = None;
        self.driver_host = None;
        Ok(())
    }

    /// Runs an already rendered settings script on the service host, then
    /// waits for the service to come back.
    pub fn apply_settings<R: RemoteExec + ?Sized>(
        &mut self,
        remote: &R,
        script: &str,
    ) -> Result<(), InfraError> {
        let endpoints = self.endpoints().ok_or_else(|| InfraError::Fatal {
            operation: "apply settings".to_string(),
            detail: "service is not deployed".to_string(),
        })?;
        info!(service = %self.service, "applying service settings");
        let out = remote.exec(
            &endpoints.service_host,
            script,
            Duration::from_secs(self.readiness.settings_timeout_secs),
            Some(&endpoints.driver_host),
        );
        if !out.success() {
            return Err(InfraError::Fatal {
                operation: "apply settings".to_string(),
                detail: out.tail(5),
            });
        }
        self.wait_until_ready(remote, &endpoints.driver_host, &endpoints.service_host);
        Ok(())
    }

    /// Marks resources for recreation on the next apply. Returns how many
    /// were tainted; resources that do not exist yet are skipped.
    pub fn taint(&mut self, resources: &[String]) -> usize {
        let mut tainted = 0;
        for resource in resources {
            let out = self.provisioner.taint(resource);
            if out.success() {
                tainted += 1;
            } else {
                debug!(resource = %resource, "taint skipped: {}", out.diagnostics().trim());
            }
        }
        tainted
    }

    fn is_healthy<R: RemoteExec + ?Sized>(&self, remote: &R, driver: &str, host: &str) -> bool {
        let out = remote.exec(host, &self.health.command, self.check_timeout(), Some(driver));
        self.health.passes(&out.status, &out.output)
    }

    fn wait_until_ready<R: RemoteExec + ?Sized>(&self, remote: &R, driver: &str, host: &str) -> bool {
        let ready = poll_until(
            Duration::from_secs(self.readiness.interval_secs),
            Duration::from_secs(self.readiness.timeout_secs),
            || self.is_healthy(remote, driver, host),
        );
        if !ready {
            warn!(
                service = %self.service,
                host,
                "not ready after {}s, continuing anyway",
                self.readiness.timeout_secs
            );
        }
        ready
    }

    fn with_extra_vars(&self, vars: BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut out = self.profile.extra_vars.clone();
        out.extend(vars);
        out
    }

    fn apply_with_retry(
        &mut self,
        operation: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), InfraError> {
        self.with_retry(operation, |p| p.apply(vars))
    }

    fn with_retry<F>(&mut self, operation: &str, mut op: F) -> Result<(), InfraError>
    where
        F: FnMut(&mut P) -> ProvisionOutput,
    {
        let mut machine = RetryMachine::new(&self.retry);
        loop {
            let out = op(&mut self.provisioner);
            if out.success() {
                return Ok(());
            }
            let diagnostics = out.diagnostics();
            match machine.on_failure(&diagnostics) {
                RetryStep::ResetAndRetry { attempt } => {
                    warn!(operation, attempt, "stale provisioning state, resetting");
                    self.state = InfraState::Stale;
                    let reset = self.provisioner.reset_state();
                    if !reset.success() {
                        warn!(operation, "state reset failed: {}", reset.diagnostics().trim());
                    }
                }
                RetryStep::BackoffAndRetry { attempt, delay } => {
                    warn!(
                        operation,
                        attempt,
                        "resource conflict, retrying in {}s",
                        delay.as_secs()
                    );
                    thread::sleep(delay);
                }
                RetryStep::GiveUp { class, attempts } => {
                    self.state = InfraState::Unknown;
                    self.deployed_shape = None;
                    let detail = tail(&diagnostics, 5);
                    let operation = operation.to_string();
                    return Err(match class {
                        FailureClass::StaleState => InfraError::StaleState {
                            operation,
                            attempts,
                            detail,
                        },
                        FailureClass::TransientConflict => InfraError::TransientConflict {
                            operation,
                            attempts,
                            detail,
                        },
                        FailureClass::Fatal => InfraError::Fatal { operation, detail },
                    });
                }
            }
        }
    }
}

fn tail(text: &str, lines: usize) -> String {
    let kept: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    kept[kept.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamSet;
    use crate::testing::{FakeProvisioner, FakeRemote};

    fn readiness() -> ReadinessSettings {
        ReadinessSettings {
            interval_secs: 0,
            timeout_secs: 0,
            check_timeout_secs: 1,
            driver_timeout_secs: 0,
            ..ReadinessSettings::default()
        }
    }

    fn manager(provisioner: FakeProvisioner) -> InfraManager<FakeProvisioner> {
        InfraManager::new(
            provisioner,
            Service::Redis,
            ProviderProfile::selectel(),
            RetryPolicy {
                conflict_backoff_secs: 0,
                ..RetryPolicy::default()
            },
            readiness(),
            Service::Redis.default_workload().health,
        )
    }

    fn redis(cpu: i64) -> Box<dyn ServiceConfig> {
        let params = ParamSet::new()
            .with("mode", "single")
            .with("cpu_per_node", cpu)
            .with("ram_per_node", 8i64)
            .with("maxmemory_policy", "allkeys-lru")
            .with("io_threads", 2i64)
            .with("persistence", "none");
        Service::Redis.parse_config(&params).expect("config")
    }

    fn healthy_remote() -> FakeRemote {
        FakeRemote::new()
            .respond("echo ok", 0, "ok")
            .respond("redis-cli ping", 0, "PONG")
    }

    fn provisioner() -> FakeProvisioner {
        FakeProvisioner::new()
            .with_output("benchmark_vm_ip", "203.0.113.7")
            .with_output("redis_vm_ip", "10.0.0.20")
    }

    #[test]
    fn ensure_twice_with_same_shape_does_not_reprovision() {
        let remote = healthy_remote();
        let mut infra = manager(provisioner());
        let config = redis(4);
        let (endpoints, _) = infra.ensure(&remote, config.as_ref()).expect("first ensure");
        assert_eq!(endpoints.service_host, "10.0.0.20");
        assert_eq!(infra.state(), InfraState::Ready);
        let applies = infra.provisioner().applies().len();
        let destroys = infra.provisioner().destroys();

        let (again, _) = infra.ensure(&remote, config.as_ref()).expect("second ensure");
        assert_eq!(again, endpoints);
        assert_eq!(infra.provisioner().applies().len(), applies);
        assert_eq!(infra.provisioner().destroys(), destroys);
    }

    #[test]
    fn changed_shape_tears_down_then_creates() {
        let remote = healthy_remote();
        let mut infra = manager(provisioner());
        infra.ensure(&remote, redis(2).as_ref()).expect("first");
        let before = infra.provisioner().applies().len();
        infra.ensure(&remote, redis(4).as_ref()).expect("second");
        let applies = infra.provisioner().applies();
        assert_eq!(applies.len(), before + 2);
        assert_eq!(applies[before]["redis_enabled"], "false");
        assert_eq!(applies[before + 1]["redis_enabled"], "true");
        assert_eq!(applies[before + 1]["redis_node_cpu"], "4");
    }

    #[test]
    fn failed_liveness_check_forces_recreation() {
        let mut infra = manager(provisioner());
        infra.ensure(&healthy_remote(), redis(2).as_ref()).expect("first");
        let before = infra.provisioner().applies().len();
        let dead = FakeRemote::new()
            .respond("echo ok", 0, "ok")
            .respond("redis-cli ping", 1, "Could not connect");
        infra.ensure(&dead, redis(2).as_ref()).expect("recreated");
        assert_eq!(infra.provisioner().applies().len(), before + 2);
    }

    #[test]
    fn stale_state_is_reset_and_retried() {
        let provisioner = provisioner().fail_next_apply("Error: 404 not found: volume 1f2e");
        let mut infra = manager(provisioner);
        // driver reused, first service apply (teardown) hits the stale error
        let result = infra.ensure(&healthy_remote(), redis(2).as_ref());
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(infra.provisioner().resets(), 1);
        assert_eq!(infra.state(), InfraState::Ready);
    }

    #[test]
    fn persistent_conflict_gives_up_after_the_bound() {
        let provisioner = provisioner()
            .fail_next_apply("409 Conflict: port already in use")
            .fail_next_apply("409 Conflict: port already in use")
            .fail_next_apply("409 Conflict: port already in use");
        let mut infra = manager(provisioner);
        let err = infra
            .ensure(&healthy_remote(), redis(2).as_ref())
            .expect_err("gives up");
        assert!(matches!(err, InfraError::TransientConflict { attempts: 3, .. }), "{}", err);
        assert_eq!(infra.provisioner().applies().len(), 3);
        assert_eq!(infra.state(), InfraState::Unknown);
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let provisioner = provisioner().fail_next_apply("Error: quota exceeded for instances");
        let mut infra = manager(provisioner);
        let err = infra
            .ensure(&healthy_remote(), redis(2).as_ref())
            .expect_err("fatal");
        assert!(matches!(err, InfraError::Fatal { .. }));
        assert_eq!(infra.provisioner().applies().len(), 1);
    }

    #[test]
    fn unreachable_driver_is_recreated_with_services_disabled() {
        let remote = FakeRemote::new()
            .respond("echo ok", 255, "ssh: connect to host 203.0.113.7 port 22: Connection refused")
            .respond("benchmark-ready", 0, "ready")
            .respond("redis-cli ping", 0, "PONG");
        let mut infra = manager(provisioner());
        let driver = infra.ensure_driver(&remote).expect("driver");
        assert_eq!(driver, "203.0.113.7");
        let applies = infra.provisioner().applies();
        assert_eq!(applies.len(), 1);
        assert!(applies[0].values().all(|v| v == "false"));
        assert_eq!(infra.state(), InfraState::Absent);
    }

    #[test]
    fn known_driver_is_checked_again_and_replaced_when_lost() {
        let mut infra = manager(provisioner());
        infra.ensure(&healthy_remote(), redis(2).as_ref()).expect("first");
        assert_eq!(infra.provisioner().refreshes(), 1);
        let before = infra.provisioner().applies().len();

        let lost = FakeRemote::new()
            .respond_seq(
                "echo ok",
                vec![(255, "ssh: connect to host 203.0.113.7 port 22: No route to host"), (0, "ok")],
            )
            .respond("benchmark-ready", 0, "ready")
            .respond("redis-cli ping", 0, "PONG");
        let (endpoints, _) = infra.ensure(&lost, redis(2).as_ref()).expect("recovered");
        assert_eq!(endpoints.driver_host, "203.0.113.7");
        assert_eq!(infra.provisioner().refreshes(), 2);
        let applies = infra.provisioner().applies();
        // driver recreated with services off, then the service comes back
        assert_eq!(applies.len(), before + 2);
        assert!(applies[before].values().all(|v| v == "false"));
        assert_eq!(applies[before + 1]["redis_enabled"], "true");
        assert_eq!(lost.count("echo ok"), 1);
        assert_eq!(infra.state(), InfraState::Ready);
    }

    #[test]
    fn teardown_when_absent_is_a_no_op_and_destroy_all_clears_endpoints() {
        let remote = healthy_remote();
        let mut infra = manager(provisioner());
        infra.ensure(&remote, redis(2).as_ref()).expect("ensure");
        infra.teardown_service().expect("teardown");
        let applies = infra.provisioner().applies().len();
        infra.teardown_service().expect("no-op");
        assert_eq!(infra.provisioner().applies().len(), applies);

        infra.destroy_all().expect("destroy");
        assert_eq!(infra.provisioner().destroys(), 1);
        assert_eq!(infra.endpoints(), None);
        assert_eq!(infra.state(), InfraState::Absent);
    }

    #[test]
    fn apply_settings_runs_on_service_via_driver() {
        let remote = healthy_remote().respond("systemctl restart", 0, "");
        let mut infra = manager(provisioner());
        infra.ensure(&remote, redis(2).as_ref()).expect("ensure");
        infra
            .apply_settings(&remote, "systemctl restart redis")
            .expect("settings");
        let call = remote
            .calls()
            .into_iter()
            .find(|c| c.command.contains("systemctl restart"))
            .expect("settings call");
        assert_eq!(call.host, "10.0.0.20");
        assert_eq!(call.jump.as_deref(), Some("203.0.113.7"));

        let failing = FakeRemote::new().respond("systemctl", 1, "unit not found");
        assert!(infra.apply_settings(&failing, "systemctl restart redis").is_err());
    }
}
