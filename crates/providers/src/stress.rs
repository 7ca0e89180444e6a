//! Stress tools on the SUT: foreground runs, detached runs, liveness
//! checks and forced termination, plus stressapptest log parsing.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use platval_core::config::StressConfig;
use platval_core::error::{PlatvalError, TestError};
use platval_core::exec::{BoxFuture, SutExecutor};
use platval_core::types::{CommandOutput, OsType};

use crate::error::ProviderError;

/// Outcome of one stressapptest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StressAppResult {
    pub passed: bool,
    /// Hardware incidents stressapptest reported
    pub error_count: u64,
    /// The `Status:` line as printed
    pub status: String,
}

/// Reads a stressapptest log. A `Status: PASS` line passes; `Status: FAIL`
/// or no status line at all is a failure.
pub fn parse_stressapptest_log(log: &str) -> Result<StressAppResult, PlatvalError> {
    let incidents = Regex::new(r"Found (\d+) hardware incidents").map_err(ProviderError::from)?;
    let error_count = incidents
        .captures(log)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    let Some(status) = log
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("Status:"))
    else {
        return Err(TestError::Fail("stressapptest log has no status line".to_owned()).into());
    };
    if status.starts_with("Status: PASS") {
        Ok(StressAppResult {
            passed: true,
            error_count,
            status: status.to_owned(),
        })
    } else {
        Err(TestError::Fail(format!(
            "stressapptest reported '{status}' with {error_count} hardware incident(s)"
        ))
        .into())
    }
}

pub trait StressAppTestProvider: Send + Sync {
    fn config(&self) -> &StressConfig;

    /// Runs a stress command in the tool directory and waits for it.
    fn execute_installer_stressapp_test<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, PlatvalError>>;

    /// Whether a process named `name` runs, optionally requiring its
    /// command line to contain `command`.
    fn check_app_running<'a>(
        &'a self,
        name: &'a str,
        command: Option<&'a str>,
    ) -> BoxFuture<'a, Result<bool, PlatvalError>>;

    /// Asks the OS to end `name`; `force` escalates.
    fn terminate<'a>(&'a self, name: &'a str, force: bool) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// Runs stressapptest for `duration` and parses its log.
    fn run_stressapptest<'a>(
        &'a self,
        duration: Duration,
        log_file: &'a str,
    ) -> BoxFuture<'a, Result<StressAppResult, PlatvalError>>;

    /// Starts `command` detached in `cwd` and requires it to be running
    /// after the settle time.
    fn execute_async_stress_tool<'a>(
        &'a self,
        command: &'a str,
        name: &'a str,
        cwd: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// Stops a running stress tool: a polite kill first, then up to
    /// `kill_retries` forced kills with `kill_pause_secs` in between.
    fn kill_stress_tool<'a>(
        &'a self,
        name: &'a str,
        command: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            if !self.check_app_running(name, command).await? {
                debug!(tool = name, "not running, nothing to kill");
                return Ok(());
            }
            info!(tool = name, "killing stress tool");
            self.terminate(name, false).await?;

            let pause = Duration::from_secs(self.config().kill_pause_secs);
            for attempt in 1..=self.config().kill_retries {
                tokio::time::sleep(pause).await;
                if !self.check_app_running(name, command).await? {
                    info!(tool = name, "stress tool stopped");
                    return Ok(());
                }
                warn!(tool = name, attempt, "still running, killing again");
                self.terminate(name, true).await?;
            }
            if self.check_app_running(name, command).await? {
                return Err(TestError::Setup(format!("{name} could not be killed")).into());
            }
            Ok(())
        })
    }
}

async fn spawn_and_verify(
    provider: &(impl StressAppTestProvider + ?Sized),
    executor: &dyn SutExecutor,
    command: &str,
    name: &str,
    cwd: &str,
) -> Result<(), PlatvalError> {
    info!(tool = name, command, "starting stress tool in the background");
    executor.spawn_detached_in(command, cwd).await?;
    let settle = Duration::from_secs(provider.config().settle_secs);
    if !settle.is_zero() {
        tokio::time::sleep(settle).await;
    }
    if !provider.check_app_running(name, Some(command)).await? {
        return Err(TestError::Fail(format!("{name} stress tool is not running")).into());
    }
    Ok(())
}

// ─── Linux ───────────────────────────────────────────────────────────

pub struct LinuxStressAppTest {
    executor: Arc<dyn SutExecutor>,
    config: StressConfig,
    timeout: Duration,
}

impl LinuxStressAppTest {
    pub fn new(executor: Arc<dyn SutExecutor>, config: &StressConfig, timeout: Duration) -> Self {
        Self {
            executor,
            config: config.clone(),
            timeout,
        }
    }
}

impl StressAppTestProvider for LinuxStressAppTest {
    fn config(&self) -> &StressConfig {
        &self.config
    }

    fn execute_installer_stressapp_test<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, PlatvalError>> {
        Box::pin(async move {
            info!(command, "running stress command");
            let out = self
                .executor
                .execute_in(command, &self.config.tool_dir, timeout)
                .await?
                .ensure_success()?;
            Ok(out)
        })
    }

    fn check_app_running<'a>(
        &'a self,
        name: &'a str,
        command: Option<&'a str>,
    ) -> BoxFuture<'a, Result<bool, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute(&format!("ps -ef |grep {name}|grep -v grep"), self.timeout)
                .await?;
            let running = match command {
                Some(command) => out.stdout.contains(command),
                None => !out.stdout.trim().is_empty(),
            };
            Ok(running)
        })
    }

    fn terminate<'a>(&'a self, name: &'a str, force: bool) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let command = if force {
                format!("killall {name}")
            } else {
                format!("pkill {name}")
            };
            self.executor.execute(&command, self.timeout).await?;
            Ok(())
        })
    }

    fn run_stressapptest<'a>(
        &'a self,
        duration: Duration,
        log_file: &'a str,
    ) -> BoxFuture<'a, Result<StressAppResult, PlatvalError>> {
        Box::pin(async move {
            let secs = duration.as_secs();
            let command = format!("./stressapptest -s {secs} -M -m -W -l {log_file}");
            info!(secs, log_file, "running stressapptest");
            let out = self
                .executor
                .execute_in(&command, &self.config.tool_dir, duration + Duration::from_secs(120))
                .await?;
            if !out.success() {
                warn!(exit_code = out.exit_code, "stressapptest exited non-zero");
            }
            let log = self
                .executor
                .execute_in(&format!("cat {log_file}"), &self.config.tool_dir, self.timeout)
                .await?
                .ensure_success()?;
            let result = parse_stressapptest_log(&log.stdout)?;
            info!(status = %result.status, errors = result.error_count, "stressapptest finished");
            Ok(result)
        })
    }

    fn execute_async_stress_tool<'a>(
        &'a self,
        command: &'a str,
        name: &'a str,
        cwd: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(spawn_and_verify(self, self.executor.as_ref(), command, name, cwd))
    }
}

// ─── Windows ─────────────────────────────────────────────────────────

pub struct WindowsStressAppTest {
    executor: Arc<dyn SutExecutor>,
    config: StressConfig,
    timeout: Duration,
}

impl WindowsStressAppTest {
    pub fn new(executor: Arc<dyn SutExecutor>, config: &StressConfig, timeout: Duration) -> Self {
        Self {
            executor,
            config: config.clone(),
            timeout,
        }
    }
}

impl StressAppTestProvider for WindowsStressAppTest {
    fn config(&self) -> &StressConfig {
        &self.config
    }

    fn execute_installer_stressapp_test<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput, PlatvalError>> {
        Box::pin(async move {
            Ok(self
                .executor
                .execute_in(command, &self.config.tool_dir, timeout)
                .await?
                .ensure_success()?)
        })
    }

    fn check_app_running<'a>(
        &'a self,
        name: &'a str,
        _command: Option<&'a str>,
    ) -> BoxFuture<'a, Result<bool, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute(&format!("tasklist /FI \"IMAGENAME eq {name}*\""), self.timeout)
                .await?;
            let needle = name.to_ascii_lowercase();
            Ok(out
                .lines()
                .any(|line| line.to_ascii_lowercase().starts_with(&needle)))
        })
    }

    fn terminate<'a>(&'a self, name: &'a str, _force: bool) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let image = if name.ends_with(".exe") {
                name.to_owned()
            } else {
                format!("{name}.exe")
            };
            self.executor
                .execute(&format!("taskkill /F /IM {image}"), self.timeout)
                .await?;
            Ok(())
        })
    }

    fn run_stressapptest<'a>(
        &'a self,
        _duration: Duration,
        _log_file: &'a str,
    ) -> BoxFuture<'a, Result<StressAppResult, PlatvalError>> {
        Box::pin(async { Err(TestError::Unsupported("stressapptest on windows".to_owned()).into()) })
    }

    fn execute_async_stress_tool<'a>(
        &'a self,
        command: &'a str,
        name: &'a str,
        cwd: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(spawn_and_verify(self, self.executor.as_ref(), command, name, cwd))
    }
}

pub fn factory(
    os: OsType,
    executor: Arc<dyn SutExecutor>,
    config: &StressConfig,
    timeout: Duration,
) -> Result<Box<dyn StressAppTestProvider>, PlatvalError> {
    match os {
        OsType::Linux => Ok(Box::new(LinuxStressAppTest::new(executor, config, timeout))),
        OsType::Windows => Ok(Box::new(WindowsStressAppTest::new(executor, config, timeout))),
        OsType::Esxi => Err(TestError::Unsupported("stress tools on esxi".to_owned()).into()),
    }
}
