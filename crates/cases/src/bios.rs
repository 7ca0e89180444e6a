//! BIOS knob programming.

use std::time::Duration;

use clap::{ArgGroup, Parser};
use tracing::info;

use platval_core::bios::{BiosKnobTool, KnobSet};
use platval_core::error::{PlatvalError, TestError};
use platval_core::power::ResetKind;
use platval_core::testcase::{TestCase, TestCaseInfo, TestContext};
use platval_core::types::{OsType, Verdict};

pub const INFO: TestCaseInfo = TestCaseInfo {
    id: "bios-knobs",
    name: "BIOS knob programming",
    description: "Writes BIOS knobs, warm resets the SUT and verifies the knobs read back \
                  with the written values",
    tags: &["bios"],
    supported_os: &[OsType::Linux, OsType::Windows],
};

fn parse_knobs(text: &str) -> Result<KnobSet, String> {
    KnobSet::parse_inline(text).map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Parser)]
#[command(group(ArgGroup::new("source").required(true).args(["knob_file", "knobs"])))]
pub struct BiosArgs {
    /// .cfg file with Name=Value lines
    #[arg(long)]
    pub knob_file: Option<String>,

    /// Inline knobs, e.g. VTdSupport=1,InterruptRemap=1
    #[arg(long, value_parser = parse_knobs)]
    pub knobs: Option<KnobSet>,

    /// Write back the previous values afterwards
    #[arg(long)]
    pub restore: bool,
}

enum KnobSource {
    File(String),
    Inline(KnobSet),
}

pub struct BiosKnobs {
    source: KnobSource,
    restore: bool,
    knobs: KnobSet,
    previous: Option<KnobSet>,
    tool: Option<BiosKnobTool>,
    applied: bool,
}

impl BiosKnobs {
    pub fn new(args: BiosArgs) -> Result<Self, PlatvalError> {
        let source = match (args.knob_file, args.knobs) {
            (Some(path), None) => KnobSource::File(path),
            (None, Some(knobs)) => KnobSource::Inline(knobs),
            _ => {
                return Err(TestError::Setup(
                    "exactly one of --knob-file and --knobs is required".to_owned(),
                )
                .into());
            }
        };
        Ok(Self {
            source,
            restore: args.restore,
            knobs: KnobSet::new(),
            previous: None,
            tool: None,
            applied: false,
        })
    }
}

fn boot_timeout(ctx: &TestContext) -> Duration {
    ctx.config.timeouts.os_boot()
}

impl TestCase for BiosKnobs {
    fn info(&self) -> &TestCaseInfo {
        &INFO
    }

    async fn prepare(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        self.knobs = match &self.source {
            KnobSource::File(path) => KnobSet::from_file(path).await?,
            KnobSource::Inline(knobs) => knobs.clone(),
        };
        if self.knobs.is_empty() {
            return Err(TestError::Setup("no knobs to write".to_owned()).into());
        }
        let tool = BiosKnobTool::new(ctx.sut.clone(), &ctx.config.bios)?;
        if self.restore {
            self.previous = Some(tool.read(self.knobs.names()).await?);
        }
        self.tool = Some(tool);
        Ok(())
    }

    async fn execute(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let tool = self
            .tool
            .as_ref()
            .ok_or_else(|| TestError::Setup("knob tool not prepared".to_owned()))?;
        tool.apply(&self.knobs).await?;
        self.applied = true;
        ctx.power.reset_and_wait(ResetKind::Warm, boot_timeout(ctx)).await?;
        tool.verify(&self.knobs).await?;
        ctx.note(format!("{} bios knobs verified", self.knobs.len()));
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &TestContext, _verdict: Verdict) -> Result<(), PlatvalError> {
        let (Some(tool), Some(previous)) = (self.tool.as_ref(), self.previous.as_ref()) else {
            return Ok(());
        };
        if !self.applied || previous.is_empty() {
            return Ok(());
        }
        info!(count = previous.len(), "restoring previous bios knobs");
        tool.apply(previous).await?;
        ctx.power.reset_and_wait(ResetKind::Warm, boot_timeout(ctx)).await
    }
}
