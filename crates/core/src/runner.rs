//! Drives a test case through its lifecycle and reports the outcome.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PlatvalError;
use crate::metrics as m;
use crate::oslog;
use crate::testcase::{DynTestCase, TestContext};
use crate::types::Verdict;

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Execute,
    Cleanup,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub duration_ms: u64,
    pub ok: bool,
}

/// Outcome of one run, rendered by the CLI and written as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub test_id: String,
    pub test_name: String,
    pub sut: String,
    pub verdict: Verdict,
    /// Error that decided the verdict, if any
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseTiming>,
    pub notes: Vec<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    /// Writes `{test_id}-{run_id}.json` into `dir`.
    pub async fn write_json(&self, dir: &Path) -> Result<PathBuf, PlatvalError> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}-{}.json", self.test_id, self.run_id));
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

/// Runner switches.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Clear OS error logs before `prepare`
    pub clear_os_logs: bool,
    /// Attach OS error lines found after `execute` as notes
    pub collect_os_errors: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            clear_os_logs: true,
            collect_os_errors: true,
        }
    }
}

pub struct TestRunner {
    options: RunOptions,
}

impl TestRunner {
    pub fn new(options: RunOptions) -> Self {
        Self { options }
    }

    /// Runs `case` to completion and never returns an error: every failure
    /// ends up in the report's verdict.
    ///
    /// - unsupported SUT OS: `Unsupported`, nothing runs
    /// - `prepare` failure skips `execute`
    /// - `cleanup` always runs after `prepare` was attempted
    /// - the first error decides the verdict; a cleanup error only turns
    ///   an otherwise passing run into `Error`
    pub async fn run(&self, case: &mut dyn DynTestCase, ctx: &TestContext) -> RunReport {
        let info = case.info().clone();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let wall = Instant::now();
        let mut phases = Vec::new();
        let mut notes = Vec::new();

        info!(test_id = info.id, %run_id, sut = %ctx.sut.description(), "test run started");

        let os = ctx.os();
        if !info.supports(os) {
            let message = format!("{} does not support {os}", info.id);
            warn!(test_id = info.id, %os, "unsupported os");
            return self.finish(
                FinishParts {
                    run_id,
                    test_id: info.id,
                    test_name: info.name,
                    sut: ctx.sut.description(),
                    verdict: Verdict::Unsupported,
                    message: Some(message),
                    started_at,
                    phases,
                    notes,
                },
                wall,
            );
        }

        let mut first_error: Option<PlatvalError> = None;

        let t = Instant::now();
        let mut prepared = Ok(());
        if self.options.clear_os_logs {
            prepared = oslog::clear_os_error_logs(ctx.sut.as_ref(), ctx.timeout()).await;
            if let Err(e) = &prepared {
                warn!(error = %e, "could not clear os error logs");
            }
        }
        if prepared.is_ok() {
            prepared = case.prepare(ctx).await;
        }
        phases.push(timing(Phase::Prepare, t, prepared.is_ok()));
        if let Err(e) = prepared {
            error!(test_id = info.id, error = %e, "prepare failed");
            first_error = Some(e);
        }

        if first_error.is_none() {
            let t = Instant::now();
            let executed = case.execute(ctx).await;
            phases.push(timing(Phase::Execute, t, executed.is_ok()));
            if let Err(e) = executed {
                error!(test_id = info.id, error = %e, "execute failed");
                first_error = Some(e);
            }
            if self.options.collect_os_errors {
                match oslog::collect_os_errors(ctx.sut.as_ref(), ctx.timeout()).await {
                    Ok(lines) => notes.extend(lines.into_iter().map(|l| format!("os log: {l}"))),
                    Err(e) => warn!(error = %e, "could not collect os error logs"),
                }
            }
        }

        let mut verdict = first_error
            .as_ref()
            .map_or(Verdict::Pass, PlatvalError::verdict);
        let mut message = first_error.map(|e| e.to_string());

        let t = Instant::now();
        let cleaned = case.cleanup(ctx, verdict).await;
        phases.push(timing(Phase::Cleanup, t, cleaned.is_ok()));
        if let Err(e) = cleaned {
            error!(test_id = info.id, error = %e, "cleanup failed");
            if verdict.is_pass() {
                verdict = Verdict::Error;
                message = Some(format!("cleanup failed: {e}"));
            } else {
                notes.push(format!("cleanup failed: {e}"));
            }
        }

        notes.extend(ctx.take_notes());

        self.finish(
            FinishParts {
                run_id,
                test_id: info.id,
                test_name: info.name,
                sut: ctx.sut.description(),
                verdict,
                message,
                started_at,
                phases,
                notes,
            },
            wall,
        )
    }

    fn finish(&self, parts: FinishParts, wall: Instant) -> RunReport {
        let elapsed = wall.elapsed();
        counter!(
            m::TEST_RUNS_TOTAL,
            m::LABEL_TEST_ID => parts.test_id,
            m::LABEL_VERDICT => format!("{:?}", parts.verdict).to_lowercase()
        )
        .increment(1);
        histogram!(m::TEST_DURATION_SECONDS, m::LABEL_TEST_ID => parts.test_id)
            .record(elapsed.as_secs_f64());
        info!(
            test_id = parts.test_id,
            verdict = %parts.verdict,
            elapsed_ms = elapsed.as_millis() as u64,
            "test run finished"
        );
        RunReport {
            run_id: parts.run_id,
            test_id: parts.test_id.to_owned(),
            test_name: parts.test_name.to_owned(),
            sut: parts.sut,
            verdict: parts.verdict,
            message: parts.message,
            started_at: parts.started_at,
            finished_at: Utc::now(),
            phases: parts.phases,
            notes: parts.notes,
        }
    }
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new(RunOptions::default())
    }
}

struct FinishParts {
    run_id: Uuid,
    test_id: &'static str,
    test_name: &'static str,
    sut: String,
    verdict: Verdict,
    message: Option<String>,
    started_at: DateTime<Utc>,
    phases: Vec<PhaseTiming>,
    notes: Vec<String>,
}

fn timing(phase: Phase, started: Instant, ok: bool) -> PhaseTiming {
    PhaseTiming {
        phase,
        duration_ms: started.elapsed().as_millis() as u64,
        ok,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::PlatvalConfig;
    use crate::error::TestError;
    use crate::exec::ScriptedExecutor;
    use crate::power::SshPowerControl;
    use crate::testcase::{TestCase, TestCaseInfo};
    use crate::types::OsType;

    const INFO: TestCaseInfo = TestCaseInfo {
        id: "scripted",
        name: "Scripted case",
        description: "test double",
        tags: &[],
        supported_os: &[OsType::Linux],
    };

    #[derive(Default)]
    struct Calls {
        prepare: AtomicUsize,
        execute: AtomicUsize,
        cleanup: AtomicUsize,
    }

    struct Scripted {
        info: TestCaseInfo,
        calls: Arc<Calls>,
        prepare: Option<TestError>,
        execute: Option<TestError>,
        cleanup: Option<TestError>,
        seen_verdict: Arc<std::sync::Mutex<Option<Verdict>>>,
    }

    impl Scripted {
        fn new(calls: Arc<Calls>) -> Self {
            Self {
                info: INFO,
                calls,
                prepare: None,
                execute: None,
                cleanup: None,
                seen_verdict: Arc::default(),
            }
        }
    }

    impl TestCase for Scripted {
        fn info(&self) -> &TestCaseInfo {
            &self.info
        }

        async fn prepare(&mut self, _ctx: &TestContext) -> Result<(), PlatvalError> {
            self.calls.prepare.fetch_add(1, Ordering::SeqCst);
            self.prepare.clone().map_or(Ok(()), |e| Err(e.into()))
        }

        async fn execute(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
            self.calls.execute.fetch_add(1, Ordering::SeqCst);
            ctx.note("executed");
            self.execute.clone().map_or(Ok(()), |e| Err(e.into()))
        }

        async fn cleanup(&mut self, _ctx: &TestContext, verdict: Verdict) -> Result<(), PlatvalError> {
            self.calls.cleanup.fetch_add(1, Ordering::SeqCst);
            *self.seen_verdict.lock().unwrap() = Some(verdict);
            self.cleanup.clone().map_or(Ok(()), |e| Err(e.into()))
        }
    }

    fn context(os: OsType) -> (TestContext, Arc<ScriptedExecutor>) {
        let sut = Arc::new(ScriptedExecutor::new(os));
        let host = Arc::new(ScriptedExecutor::new(OsType::Linux));
        let power = Arc::new(SshPowerControl::new(
            sut.clone(),
            Duration::from_millis(1),
            Duration::ZERO,
        ));
        let ctx = TestContext::new(sut.clone(), host, power, Arc::new(PlatvalConfig::default()));
        (ctx, sut)
    }

    #[tokio::test]
    async fn passing_run_calls_every_phase_once() {
        let calls = Arc::new(Calls::default());
        let mut case = Scripted::new(calls.clone());
        let (ctx, sut) = context(OsType::Linux);
        let report = TestRunner::default().run(&mut case, &ctx).await;

        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(calls.prepare.load(Ordering::SeqCst), 1);
        assert_eq!(calls.execute.load(Ordering::SeqCst), 1);
        assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);
        assert_eq!(report.phases.len(), 3);
        assert!(report.notes.contains(&"executed".to_owned()));
        assert!(sut.count_matching("dmesg --clear") == 1);
    }

    #[tokio::test]
    async fn prepare_failure_skips_execute_but_cleans_up() {
        let calls = Arc::new(Calls::default());
        let mut case = Scripted::new(calls.clone());
        case.prepare = Some(TestError::NotApplicable("no NIC".to_owned()));
        let seen = case.seen_verdict.clone();
        let (ctx, _) = context(OsType::Linux);
        let report = TestRunner::default().run(&mut case, &ctx).await;

        assert_eq!(report.verdict, Verdict::NotApplicable);
        assert_eq!(calls.execute.load(Ordering::SeqCst), 0);
        assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), Some(Verdict::NotApplicable));
        assert!(report.message.unwrap().contains("no NIC"));
    }

    #[tokio::test]
    async fn execute_failure_is_reported_and_cleanup_runs() {
        let calls = Arc::new(Calls::default());
        let mut case = Scripted::new(calls.clone());
        case.execute = Some(TestError::Fail("ping lost".to_owned()));
        let (ctx, _) = context(OsType::Linux);
        let report = TestRunner::default().run(&mut case, &ctx).await;

        assert_eq!(report.verdict, Verdict::Fail);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_failure_downgrades_pass_to_error() {
        let calls = Arc::new(Calls::default());
        let mut case = Scripted::new(calls);
        case.cleanup = Some(TestError::Setup("could not re-enable".to_owned()));
        let (ctx, _) = context(OsType::Linux);
        let report = TestRunner::default().run(&mut case, &ctx).await;

        assert_eq!(report.verdict, Verdict::Error);
        assert!(report.message.unwrap().starts_with("cleanup failed"));
    }

    #[tokio::test]
    async fn cleanup_failure_keeps_first_error() {
        let calls = Arc::new(Calls::default());
        let mut case = Scripted::new(calls);
        case.execute = Some(TestError::Fail("first".to_owned()));
        case.cleanup = Some(TestError::Setup("second".to_owned()));
        let (ctx, _) = context(OsType::Linux);
        let report = TestRunner::default().run(&mut case, &ctx).await;

        assert_eq!(report.verdict, Verdict::Fail);
        assert!(report.message.unwrap().contains("first"));
        assert!(report.notes.iter().any(|n| n.contains("second")));
    }

    #[tokio::test]
    async fn unsupported_os_runs_nothing() {
        let calls = Arc::new(Calls::default());
        let mut case = Scripted::new(calls.clone());
        let (ctx, sut) = context(OsType::Windows);
        let report = TestRunner::default().run(&mut case, &ctx).await;

        assert_eq!(report.verdict, Verdict::Unsupported);
        assert_eq!(calls.prepare.load(Ordering::SeqCst), 0);
        assert_eq!(calls.cleanup.load(Ordering::SeqCst), 0);
        assert!(sut.history().is_empty());
    }

    #[tokio::test]
    async fn os_log_clear_failure_fails_prepare() {
        let calls = Arc::new(Calls::default());
        let mut case = Scripted::new(calls.clone());
        let (ctx, sut) = context(OsType::Linux);
        sut.push_rule(
            "dmesg --clear",
            crate::exec::Reply::failure(1, "denied"),
            false,
        );
        let report = TestRunner::default().run(&mut case, &ctx).await;

        assert_eq!(report.verdict, Verdict::Fail);
        assert_eq!(calls.prepare.load(Ordering::SeqCst), 0);
        assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn os_errors_become_notes() {
        let calls = Arc::new(Calls::default());
        let mut case = Scripted::new(calls);
        let (ctx, sut) = context(OsType::Linux);
        sut.push_rule(
            "egrep",
            crate::exec::Reply::stdout("mce: hardware error\n"),
            false,
        );
        let report = TestRunner::default().run(&mut case, &ctx).await;
        assert!(report.notes.iter().any(|n| n == "os log: mce: hardware error"));
    }

    #[tokio::test]
    async fn report_written_as_json() {
        let calls = Arc::new(Calls::default());
        let mut case = Scripted::new(calls);
        let (ctx, _) = context(OsType::Linux);
        let report = TestRunner::new(RunOptions {
            clear_os_logs: false,
            collect_os_errors: false,
        })
        .run(&mut case, &ctx)
        .await;

        let dir = tempfile::tempdir().unwrap();
        let path = report.write_json(dir.path()).await.unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["verdict"], "pass");
        assert_eq!(value["test_id"], "scripted");
        assert_eq!(value["phases"][0]["phase"], "prepare");
    }
}
