//! Command execution on a SUT or on the controlling host.
//!
//! [`SutExecutor`] is the seam every provider talks through. Production code
//! uses [`SshExecutor`] (system `ssh` client) and [`LocalExecutor`]; tests
//! and dry runs use [`ScriptedExecutor`], which answers from a rule table and
//! records every command it saw.
//!
//! ```text
//!  providers / cases
//!         │
//!         ▼
//!   ┌─────────────┐
//!   │ SutExecutor │ (trait)
//!   └─────────────┘
//!     │     │     │
//!     ▼     ▼     ▼
//!   Ssh   Local  Scripted
//! ```

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SutConfig;
use crate::error::ExecError;
use crate::metrics as m;
use crate::types::{CommandOutput, OsType};

/// Boxed future used by the dyn-compatible traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Exit code `ssh` reports when the connection itself failed.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Runs shell command lines on one machine.
pub trait SutExecutor: Send + Sync {
    /// OS of the machine commands run on.
    fn os_type(&self) -> OsType;

    /// Human-readable target, e.g. `root@10.0.0.5:22`.
    fn description(&self) -> String;

    /// Runs `command` and waits for it, at most `timeout`.
    ///
    /// A non-zero exit code is NOT an error here; see
    /// [`SutExecutor::execute_checked`].
    fn execute<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>>;

    /// Like [`execute`](SutExecutor::execute) but fails on a non-zero exit.
    fn execute_checked<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>> {
        Box::pin(async move { self.execute(command, timeout).await?.ensure_success() })
    }

    /// Runs `command` with `cwd` as working directory.
    fn execute_in<'a>(
        &'a self,
        command: &'a str,
        cwd: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>> {
        Box::pin(async move {
            let line = match self.os_type() {
                OsType::Windows => format!("cd /d {cwd} && {command}"),
                OsType::Linux | OsType::Esxi => format!("cd {cwd} && {command}"),
            };
            self.execute(&line, timeout).await
        })
    }

    /// Starts `command` in the background and returns without waiting.
    fn spawn_detached<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<(), ExecError>> {
        Box::pin(async move {
            let line = detached_line(self.os_type(), command);
            self.execute_checked(&line, Duration::from_secs(30))
                .await
                .map(|_| ())
        })
    }

    /// [`spawn_detached`](SutExecutor::spawn_detached) with `cwd` as
    /// working directory.
    fn spawn_detached_in<'a>(
        &'a self,
        command: &'a str,
        cwd: &'a str,
    ) -> BoxFuture<'a, Result<(), ExecError>> {
        Box::pin(async move {
            let line = detached_line(self.os_type(), command);
            self.execute_in(&line, cwd, Duration::from_secs(30))
                .await?
                .ensure_success()
                .map(|_| ())
        })
    }

    /// Whether the machine answers a trivial command.
    fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            matches!(
                self.execute("echo alive", Duration::from_secs(15)).await,
                Ok(out) if out.success()
            )
        })
    }
}

fn detached_line(os: OsType, command: &str) -> String {
    match os {
        OsType::Windows => format!("start /b {command}"),
        OsType::Linux | OsType::Esxi => format!("nohup {command} > /dev/null 2>&1 &"),
    }
}

// ─── process plumbing ────────────────────────────────────────────────

async fn run_process(
    mut cmd: Command,
    shown: &str,
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = shown, timeout_secs = timeout.as_secs(), "executing");
    counter!(m::COMMANDS_EXECUTED_TOTAL).increment(1);
    let started = Instant::now();

    let child = cmd.spawn().map_err(|e| ExecError::Spawn {
        command: shown.to_owned(),
        reason: e.to_string(),
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            counter!(m::COMMANDS_FAILED_TOTAL).increment(1);
            return Err(ExecError::Spawn {
                command: shown.to_owned(),
                reason: e.to_string(),
            });
        }
        Err(_) => {
            counter!(m::COMMANDS_FAILED_TOTAL).increment(1);
            warn!(command = shown, ?timeout, "command timed out");
            return Err(ExecError::Timeout {
                command: shown.to_owned(),
                timeout,
            });
        }
    };

    let result = CommandOutput {
        command: shown.to_owned(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
        duration: started.elapsed(),
    };
    if !result.success() {
        counter!(m::COMMANDS_FAILED_TOTAL).increment(1);
    }
    debug!(
        command = shown,
        exit_code = result.exit_code,
        elapsed_ms = result.duration.as_millis() as u64,
        "command finished"
    );
    Ok(result)
}

// ─── SshExecutor ─────────────────────────────────────────────────────

/// Executes commands on a remote SUT through the system `ssh` client.
///
/// Authentication is key based (`BatchMode=yes`); a password prompt would
/// hang the harness, so it is refused up front.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    host: String,
    port: u16,
    user: String,
    identity_file: Option<String>,
    connect_timeout_secs: u64,
    os: OsType,
}

impl SshExecutor {
    pub fn from_config(config: &SutConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            identity_file: (!config.identity_file.is_empty())
                .then(|| config.identity_file.clone()),
            connect_timeout_secs: config.connect_timeout_secs,
            os: config.os,
        }
    }

    /// Arguments passed to `ssh` for `remote`.
    pub fn ssh_args(&self, remote: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            "StrictHostKeyChecking=no".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-p".to_owned(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.identity_file {
            args.push("-i".to_owned());
            args.push(key.clone());
        }
        args.push(format!("{}@{}", self.user, self.host));
        args.push("--".to_owned());
        args.push(remote.to_owned());
        args
    }
}

impl SutExecutor for SshExecutor {
    fn os_type(&self) -> OsType {
        self.os
    }

    fn description(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    fn execute<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>> {
        Box::pin(async move {
            let mut cmd = Command::new("ssh");
            cmd.args(self.ssh_args(command));
            let out = run_process(cmd, command, timeout).await?;
            if out.exit_code == SSH_TRANSPORT_EXIT && out.stdout.is_empty() {
                return Err(ExecError::Transport(format!(
                    "{}: {}",
                    self.description(),
                    out.stderr.trim()
                )));
            }
            Ok(out)
        })
    }
}

// ─── LocalExecutor ───────────────────────────────────────────────────

/// Executes commands on the controlling host.
#[derive(Debug, Clone, Copy)]
pub struct LocalExecutor {
    os: OsType,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self { os: OsType::host() }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SutExecutor for LocalExecutor {
    fn os_type(&self) -> OsType {
        self.os
    }

    fn description(&self) -> String {
        "localhost".to_owned()
    }

    fn execute<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>> {
        Box::pin(async move {
            let cmd = match self.os {
                OsType::Windows => {
                    let mut c = Command::new("cmd");
                    c.args(["/C", command]);
                    c
                }
                OsType::Linux | OsType::Esxi => {
                    let mut c = Command::new("sh");
                    c.args(["-c", command]);
                    c
                }
            };
            run_process(cmd, command, timeout).await
        })
    }
}

// ─── ScriptedExecutor ────────────────────────────────────────────────

/// Canned reply of a [`ScriptedExecutor`] rule.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Answer with [`ExecError::Timeout`] instead of an output
    pub timeout: bool,
}

impl Reply {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Self::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            timeout: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    reply: Reply,
    once: bool,
}

/// Deterministic executor answering from a rule table.
///
/// Rules are matched in insertion order by substring; the first match
/// wins. One-shot rules are consumed on use, so a one-shot rule placed
/// before a persistent one for the same command models output that
/// changes over time. Commands matching no rule get the default reply
/// (exit 0, empty output).
#[derive(Debug)]
pub struct ScriptedExecutor {
    os: OsType,
    rules: Mutex<Vec<Rule>>,
    history: Mutex<Vec<String>>,
    default: Reply,
    alive: Mutex<Vec<bool>>,
    log_commands: bool,
}

impl ScriptedExecutor {
    pub fn new(os: OsType) -> Self {
        Self {
            os,
            rules: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            default: Reply::default(),
            alive: Mutex::new(Vec::new()),
            log_commands: false,
        }
    }

    /// Executor for `--dry-run`: every command succeeds and is logged.
    pub fn dry_run(os: OsType) -> Self {
        Self {
            log_commands: true,
            ..Self::new(os)
        }
    }

    pub fn with_reply(self, pattern: &str, stdout: &str) -> Self {
        self.with_rule(pattern, Reply::stdout(stdout), false)
    }

    pub fn with_once(self, pattern: &str, stdout: &str) -> Self {
        self.with_rule(pattern, Reply::stdout(stdout), true)
    }

    pub fn with_failure(self, pattern: &str, exit_code: i32, stderr: &str) -> Self {
        self.with_rule(pattern, Reply::failure(exit_code, stderr), false)
    }

    pub fn with_rule(self, pattern: &str, reply: Reply, once: bool) -> Self {
        self.push_rule(pattern, reply, once);
        self
    }

    pub fn with_default(mut self, reply: Reply) -> Self {
        self.default = reply;
        self
    }

    /// Liveness answers returned by successive `is_alive` calls; the last
    /// one repeats. Without a sequence the executor is always alive.
    pub fn with_alive_sequence(self, sequence: &[bool]) -> Self {
        *lock(&self.alive) = sequence.iter().rev().copied().collect();
        self
    }

    /// Adds a rule after construction (the rule goes to the front).
    pub fn push_rule(&self, pattern: &str, reply: Reply, once: bool) {
        let rule = Rule {
            pattern: pattern.to_owned(),
            reply,
            once,
        };
        let mut rules = lock(&self.rules);
        if once {
            rules.insert(0, rule);
        } else {
            rules.push(rule);
        }
    }

    /// Every command executed so far, in order.
    pub fn history(&self) -> Vec<String> {
        lock(&self.history).clone()
    }

    /// Number of executed commands containing `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        lock(&self.history)
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// Position in the history of the first command containing `pattern`.
    pub fn position_of(&self, pattern: &str) -> Option<usize> {
        lock(&self.history).iter().position(|c| c.contains(pattern))
    }

    fn answer(&self, command: &str) -> Reply {
        lock(&self.history).push(command.to_owned());
        let mut rules = lock(&self.rules);
        match rules.iter().position(|r| command.contains(&r.pattern)) {
            Some(idx) if rules[idx].once => rules.remove(idx).reply,
            Some(idx) => rules[idx].reply.clone(),
            None => self.default.clone(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SutExecutor for ScriptedExecutor {
    fn os_type(&self) -> OsType {
        self.os
    }

    fn description(&self) -> String {
        format!("scripted-{}", self.os)
    }

    fn execute<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, ExecError>> {
        Box::pin(async move {
            if self.log_commands {
                info!(command, "dry-run");
            }
            let reply = self.answer(command);
            if reply.timeout {
                return Err(ExecError::Timeout {
                    command: command.to_owned(),
                    timeout,
                });
            }
            Ok(CommandOutput {
                command: command.to_owned(),
                stdout: reply.stdout,
                stderr: reply.stderr,
                exit_code: reply.exit_code,
                duration: Duration::ZERO,
            })
        })
    }

    fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut seq = lock(&self.alive);
            match seq.len() {
                0 => true,
                1 => seq[0],
                _ => seq.pop().unwrap_or(true),
            }
        })
    }
}
