//! `platval run` command handler

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use serde::Serialize;

use platval_core::config::{BmcConfig, PlatvalConfig};
use platval_core::{
    LocalExecutor, PlatvalError, PowerControl, RegistryError, RunOptions, RunReport,
    ScriptedExecutor, SshExecutor, SshPowerControl, SutExecutor, TestContext, TestRegistry,
    TestRunner,
};
use platval_seamless::{RedfishClient, RedfishPowerControl};

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Runs the case and returns the process exit code of its verdict.
/// `--help` among the case arguments prints the case usage and exits 0.
pub async fn execute(
    args: RunArgs,
    config: PlatvalConfig,
    registry: &TestRegistry,
    writer: &OutputWriter,
) -> Result<i32, CliError> {
    let (case_args, dry_run) = args.split_dry_run();
    let mut case = match registry.create(&args.case, &case_args) {
        Ok(case) => case,
        Err(PlatvalError::Registry(RegistryError::Help { id, text })) => {
            writer.render(&CaseHelp { case: id, usage: text })?;
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let ctx = if dry_run {
        dry_run_context(config, args.os)
    } else {
        live_context(config)?
    };
    info!(case = %args.case, dry_run, sut = %ctx.sut.description(), "running test case");

    let report = TestRunner::new(RunOptions::default())
        .run(case.as_mut(), &ctx)
        .await;

    let report_dir = ctx.config.general.report_dir.as_str();
    if !report_dir.is_empty() {
        match report.write_json(Path::new(report_dir)).await {
            Ok(path) => info!(path = %path.display(), "run report written"),
            Err(e) => warn!(error = %e, "could not write run report"),
        }
    }

    writer.render(&RunSummary(&report))?;
    Ok(report.exit_code())
}

fn ssh_power(sut: Arc<dyn SutExecutor>, config: &PlatvalConfig) -> Arc<dyn PowerControl> {
    Arc::new(SshPowerControl::new(
        sut,
        Duration::from_secs(config.timeouts.power_poll_secs),
        Duration::from_secs(config.timeouts.shutdown_grace_secs),
    ))
}

/// SSH to the SUTs, local commands on the host, BMC resets when a BMC
/// is configured and OS reboots otherwise.
fn live_context(config: PlatvalConfig) -> Result<TestContext, CliError> {
    let sut: Arc<dyn SutExecutor> = Arc::new(SshExecutor::from_config(&config.sut));
    let power: Arc<dyn PowerControl> = if config.bmc.is_configured() {
        let bmc = RedfishClient::new(&config.bmc).map_err(platval_core::PlatvalError::from)?;
        Arc::new(RedfishPowerControl::new(
            Arc::new(bmc),
            sut.clone(),
            Duration::from_secs(config.timeouts.power_poll_secs),
            Duration::from_secs(config.timeouts.shutdown_grace_secs),
        ))
    } else {
        ssh_power(sut.clone(), &config)
    };
    let sut2 = config
        .sut2
        .as_ref()
        .map(|c| Arc::new(SshExecutor::from_config(c)) as Arc<dyn SutExecutor>);

    let mut ctx = TestContext::new(sut, Arc::new(LocalExecutor::new()), power, Arc::new(config));
    if let Some(sut2) = sut2 {
        ctx = ctx.with_sut2(sut2);
    }
    Ok(ctx)
}

/// Every command succeeds with empty output and is logged; waits are
/// zeroed and the BMC is never contacted.
fn dry_run_context(config: PlatvalConfig, os: Option<platval_core::OsType>) -> TestContext {
    let mut config = config.without_waits();
    config.bmc = BmcConfig::default();
    let sut_os = os.unwrap_or(config.sut.os);
    let sut: Arc<dyn SutExecutor> = Arc::new(ScriptedExecutor::dry_run(sut_os));
    let host: Arc<dyn SutExecutor> = Arc::new(ScriptedExecutor::dry_run(config.host.os));
    let power = ssh_power(sut.clone(), &config);
    let sut2 = config
        .sut2
        .as_ref()
        .map(|c| Arc::new(ScriptedExecutor::dry_run(c.os)) as Arc<dyn SutExecutor>);

    let mut ctx = TestContext::new(sut, host, power, Arc::new(config)).with_dry_run(true);
    if let Some(sut2) = sut2 {
        ctx = ctx.with_sut2(sut2);
    }
    ctx
}

#[derive(Serialize)]
struct CaseHelp {
    case: String,
    usage: String,
}

impl Render for CaseHelp {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write!(w, "{}", self.usage)
    }
}

/// Text/JSON view of a [`RunReport`].
pub struct RunSummary<'a>(pub &'a RunReport);

impl serde::Serialize for RunSummary<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl Render for RunSummary<'_> {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        let report = self.0;
        let verdict = report.verdict.to_string();
        let verdict = if report.verdict.is_pass() {
            verdict.green().bold()
        } else {
            verdict.red().bold()
        };
        writeln!(w, "{} ({}) on {}", report.test_id.bold(), report.test_name, report.sut)?;
        writeln!(w, "  Verdict: {verdict} (exit code {})", report.exit_code())?;
        if let Some(message) = &report.message {
            writeln!(w, "  Reason:  {message}")?;
        }
        for phase in &report.phases {
            let status = if phase.ok { "ok".green() } else { "failed".red() };
            writeln!(w, "  {:<8} {:>8} ms  {status}", format!("{:?}", phase.phase).to_lowercase(), phase.duration_ms)?;
        }
        for note in &report.notes {
            writeln!(w, "  - {note}")?;
        }
        writeln!(w, "  Run id:  {}", report.run_id)
    }
}
