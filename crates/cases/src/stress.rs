//! stressapptest memory stress.

use std::time::Duration;

use clap::Parser;

use platval_core::error::{PlatvalError, TestError};
use platval_core::testcase::{TestCase, TestCaseInfo, TestContext};
use platval_core::types::{OsType, Verdict};
use platval_providers::stress::{self, StressAppTestProvider};

pub const INFO: TestCaseInfo = TestCaseInfo {
    id: "stressapptest",
    name: "stressapptest",
    description: "Runs stressapptest for a fixed time and requires a PASS status in its log",
    tags: &["stress", "memory"],
    supported_os: &[OsType::Linux, OsType::Windows],
};

#[derive(Debug, Clone, Parser)]
pub struct StressArgs {
    /// Run time in seconds (default stress.duration_secs)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub duration: Option<u64>,

    /// Log file name in the tool directory
    #[arg(long, default_value = "stressapptest.log")]
    pub log: String,
}

const TOOL: &str = "stressapptest";

pub struct StressAppTest {
    duration: Option<u64>,
    log: String,
    provider: Option<Box<dyn StressAppTestProvider>>,
}

impl StressAppTest {
    pub fn new(args: StressArgs) -> Result<Self, PlatvalError> {
        Ok(Self {
            duration: args.duration,
            log: args.log,
            provider: None,
        })
    }
}

impl TestCase for StressAppTest {
    fn info(&self) -> &TestCaseInfo {
        &INFO
    }

    async fn prepare(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        self.provider = Some(stress::factory(ctx.os(), ctx.sut.clone(), &ctx.config.stress, ctx.timeout())?);
        Ok(())
    }

    async fn execute(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let provider = self
            .provider
            .as_deref()
            .ok_or_else(|| TestError::Setup("stress provider not prepared".to_owned()))?;
        let secs = self.duration.unwrap_or(ctx.config.stress.duration_secs);
        let result = provider
            .run_stressapptest(Duration::from_secs(secs), &self.log)
            .await?;
        ctx.note(format!("{} ({} hardware incidents)", result.status, result.error_count));
        Ok(())
    }

    /// A run cut short by a timeout leaves the tool running.
    async fn cleanup(&mut self, _ctx: &TestContext, _verdict: Verdict) -> Result<(), PlatvalError> {
        match self.provider.as_deref() {
            Some(provider) => provider.kill_stress_tool(TOOL, None).await,
            None => Ok(()),
        }
    }
}
