//! Remote command execution over SSH.
//!
//! Remote failures are data, not errors: an unreachable host, a non-zero
//! exit and a local timeout all come back as an [`ExecOutput`] whose status
//! says what happened.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    Exited(i32),
    Signaled,
    TimedOut,
    SpawnFailed(String),
}

impl ExecStatus {
    fn from_exit(status: ExitStatus) -> Self {
        status
            .code()
            .map(ExecStatus::Exited)
            .unwrap_or(ExecStatus::Signaled)
    }

    /// Numeric form for error messages; -1 when the process never exited.
    pub fn code(&self) -> i32 {
        match self {
            ExecStatus::Exited(code) => *code,
            _ => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub status: ExecStatus,
    /// stdout followed by stderr.
    pub output: String,
    pub elapsed: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == ExecStatus::Exited(0)
    }

    /// Last non-empty lines, for error messages.
    pub fn tail(&self, lines: usize) -> String {
        let kept: Vec<&str> = self
            .output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = kept.len().saturating_sub(lines);
        kept[start..].join("\n")
    }
}

pub trait RemoteExec {
    fn exec(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
        jump_host: Option<&str>,
    ) -> ExecOutput;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub user: String,
    pub binary: String,
    pub connect_timeout_secs: u64,
    pub identity_file: Option<String>,
    pub forward_agent: bool,
    pub extra_options: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            binary: "ssh".to_string(),
            connect_timeout_secs: 10,
            identity_file: None,
            forward_agent: true,
            extra_options: Vec::new(),
        }
    }
}

pub struct SshExecutor {
    settings: SshSettings,
}

impl SshExecutor {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    /// Arguments passed to the ssh binary, command last.
    pub fn args(&self, host: &str, command: &str, jump_host: Option<&str>) -> Vec<String> {
        let s = &self.settings;
        let mut args: Vec<String> = [
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            format!("ConnectTimeout={}", s.connect_timeout_secs),
            "BatchMode=yes".to_string(),
            "LogLevel=ERROR".to_string(),
        ]
        .into_iter()
        .chain(s.extra_options.iter().cloned())
        .flat_map(|opt| ["-o".to_string(), opt])
        .collect();
        if let Some(identity) = &s.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        if s.forward_agent {
            args.push("-A".to_string());
        }
        if let Some(jump) = jump_host {
            args.push("-J".to_string());
            args.push(format!("{}@{}", s.user, jump));
        }
        args.push(format!("{}@{}", s.user, host));
        args.push(command.to_string());
        args
    }
}

impl RemoteExec for SshExecutor {
    fn exec(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
        jump_host: Option<&str>,
    ) -> ExecOutput {
        debug!(host, jump = jump_host.unwrap_or("-"), "ssh exec: {}", command);
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(self.args(host, command, jump_host));
        let captured = run_captured(cmd, timeout);
        let mut output = captured.stdout;
        output.push_str(&captured.stderr);
        ExecOutput {
            status: captured.status,
            output,
            elapsed: captured.elapsed,
        }
    }
}

pub(crate) struct Captured {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Runs a local process to completion or until `timeout`, capturing both
/// streams. The child is killed on timeout.
pub(crate) fn run_captured(mut cmd: Command, timeout: Duration) -> Captured {
    let started = Instant::now();
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Captured {
                status: ExecStatus::SpawnFailed(e.to_string()),
                stdout: String::new(),
                stderr: e.to_string(),
                elapsed: started.elapsed(),
            }
        }
    };
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = started + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break ExecStatus::from_exit(status),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                break ExecStatus::TimedOut;
            }
            Ok(None) => thread::sleep(Duration::from_millis(100)),
            Err(e) => break ExecStatus::SpawnFailed(e.to_string()),
        }
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    Captured {
        status,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        elapsed: started.elapsed(),
    }
}

/// Calls `check` every `interval` until it returns true or `timeout`
/// elapses. `check` always runs at least once.
pub fn poll_until<F: FnMut() -> bool>(interval: Duration, timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() + interval > deadline {
            return false;
        }
        thread::sleep(interval);
    }
}

pub(crate) fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_args_use_proxy_jump_and_batch_mode() {
        let ssh = SshExecutor::new(SshSettings::default());
        let args = ssh.args("10.0.0.5", "redis-cli ping", Some("203.0.113.7"));
        assert_eq!(args.last().map(String::as_str), Some("redis-cli ping"));
        assert_eq!(args[args.len() - 2], "root@10.0.0.5");
        let jump = args.iter().position(|a| a == "-J").expect("jump flag");
        assert_eq!(args[jump + 1], "root@203.0.113.7");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"-A".to_string()));

        let direct = ssh.args("10.0.0.5", "true", None);
        assert!(!direct.contains(&"-J".to_string()));
    }

    #[test]
    fn run_captured_reports_exit_codes_and_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let captured = run_captured(cmd, Duration::from_secs(10));
        assert_eq!(captured.status, ExecStatus::Exited(3));
        assert_eq!(captured.stdout.trim(), "out");
        assert_eq!(captured.stderr.trim(), "err");
    }

    #[test]
    fn run_captured_kills_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let captured = run_captured(cmd, Duration::from_millis(200));
        assert_eq!(captured.status, ExecStatus::TimedOut);
        assert!(captured.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn missing_binary_is_a_spawn_failure_not_a_panic() {
        let cmd = Command::new("/nonexistent/ssh-binary");
        let captured = run_captured(cmd, Duration::from_secs(1));
        assert!(matches!(captured.status, ExecStatus::SpawnFailed(_)));
    }

    #[test]
    fn poll_until_checks_at_least_once_and_stops_at_timeout() {
        let mut calls = 0;
        let ok = poll_until(Duration::from_millis(5), Duration::ZERO, || {
            calls += 1;
            false
        });
        assert!(!ok);
        assert_eq!(calls, 1);

        let mut countdown = 3;
        let ok = poll_until(Duration::from_millis(1), Duration::from_secs(5), || {
            countdown -= 1;
            countdown == 0
        });
        assert!(ok);
    }

    #[test]
    fn tail_skips_blank_lines() {
        let out = ExecOutput {
            status: ExecStatus::Exited(1),
            output: "a\n\nb\nc\n\n".to_string(),
            elapsed: Duration::ZERO,
        };
        assert_eq!(out.tail(2), "b\nc");
        assert!(!out.success());
    }

    #[test]
    fn shell_quote_wraps_unsafe_values() {
        assert_eq!(shell_quote("MEILI_MAX_INDEXING_THREADS=4"), "MEILI_MAX_INDEXING_THREADS=4");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }
}
