//! Workload kept running on the SUT while a capsule stages.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use platval_core::error::{ExecError, PlatvalError, TestError};
use platval_core::exec::SutExecutor;
use platval_core::types::CommandOutput;

pub struct BackgroundWorkload {
    executor: Arc<dyn SutExecutor>,
    command: String,
    stop_command: String,
    token: CancellationToken,
    handle: Option<JoinHandle<Result<Option<CommandOutput>, ExecError>>>,
    ended_early: bool,
    timeout: Duration,
}

impl BackgroundWorkload {
    /// Spawns `command` on the SUT. `timeout` bounds the command itself and
    /// should outlast the whole update.
    pub fn start(
        executor: Arc<dyn SutExecutor>,
        command: &str,
        stop_command: &str,
        timeout: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let task_exec = executor.clone();
        let task_token = token.clone();
        let task_command = command.to_owned();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = task_token.cancelled() => Ok(None),
                result = task_exec.execute(&task_command, timeout) => result.map(Some),
            }
        });
        info!(command, "background workload started");
        Self {
            executor,
            command: command.to_owned(),
            stop_command: stop_command.to_owned(),
            token,
            handle: Some(handle),
            ended_early: false,
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Kills the workload on the SUT and cancels the local task.
    pub async fn stop(&mut self) -> Result<(), PlatvalError> {
        self.ended_early = !self.is_running() && self.handle.is_some();
        if self.ended_early {
            warn!(command = %self.command, "workload ended before it was stopped");
        } else if !self.stop_command.is_empty() {
            let out = self.executor.execute(&self.stop_command, self.timeout).await?;
            if !out.success() {
                warn!(command = %self.stop_command, stderr = %out.stderr.trim(), "workload stop command failed");
            }
        }
        self.token.cancel();
        Ok(())
    }

    /// Waits for the task. A workload that ended on its own with a
    /// non-zero exit, or could not run at all, is a failure.
    pub async fn join(&mut self) -> Result<Option<CommandOutput>, PlatvalError> {
        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };
        let result = handle.await.map_err(|e| {
            TestError::Setup(format!("workload task for '{}' panicked: {e}", self.command))
        })?;
        match result {
            Ok(Some(out)) if self.ended_early && !out.success() => Err(TestError::Fail(format!(
                "workload '{}' exited with code {}: {}",
                self.command,
                out.exit_code,
                out.text().trim()
            ))
            .into()),
            Ok(out) => {
                info!(command = %self.command, "background workload joined");
                Ok(out)
            }
            Err(e) => Err(TestError::Fail(format!("workload '{}' failed: {e}", self.command)).into()),
        }
    }
}

impl Drop for BackgroundWorkload {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platval_core::exec::ScriptedExecutor;
    use platval_core::types::{OsType, Verdict};

    const T: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn clean_exit_before_stop_is_fine() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux).with_reply("fio", "fio done"));
        let mut workload = BackgroundWorkload::start(exec.clone(), "fio --name=x", "killall fio", T);
        tokio::task::yield_now().await;
        while workload.is_running() {
            tokio::task::yield_now().await;
        }
        workload.stop().await.unwrap();
        let out = workload.join().await.unwrap().unwrap();
        assert_eq!(out.stdout, "fio done");
        assert_eq!(exec.count_matching("killall fio"), 0);
    }

    #[tokio::test]
    async fn early_failure_fails_the_join() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Linux).with_failure("stressapptest", 1, "miscompare"),
        );
        let mut workload = BackgroundWorkload::start(exec, "./stressapptest -s 3600", "", T);
        while workload.is_running() {
            tokio::task::yield_now().await;
        }
        workload.stop().await.unwrap();
        let err = workload.join().await.unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
        assert!(err.to_string().contains("miscompare"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_kills_and_cancels_long_runner() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux));
        let sleeper = Arc::new(SlowExecutor(exec.clone()));
        let mut workload = BackgroundWorkload::start(sleeper, "iperf3 -c 10.0.0.2 -t 3600", "pkill iperf3", T);
        assert!(workload.is_running());
        workload.stop().await.unwrap();
        assert!(workload.join().await.unwrap().is_none());
        assert_eq!(exec.count_matching("pkill iperf3"), 1);
    }

    #[tokio::test]
    async fn join_without_start_output_is_idempotent() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux));
        let mut workload = BackgroundWorkload::start(exec, "true", "", T);
        workload.stop().await.unwrap();
        workload.join().await.unwrap();
        assert!(workload.join().await.unwrap().is_none());
    }

    /// Delegates to a scripted executor but sleeps for an hour first.
    struct SlowExecutor(Arc<ScriptedExecutor>);

    impl SutExecutor for SlowExecutor {
        fn os_type(&self) -> OsType {
            self.0.os_type()
        }

        fn description(&self) -> String {
            "slow".to_owned()
        }

        fn execute<'a>(
            &'a self,
            command: &'a str,
            timeout: Duration,
        ) -> platval_core::exec::BoxFuture<'a, Result<CommandOutput, ExecError>> {
            Box::pin(async move {
                if command.starts_with("iperf3") {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                self.0.execute(command, timeout).await
            })
        }
    }
}
