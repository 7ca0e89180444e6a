//! Seamless capsule update through the BMC.
//!
//! `--capsule-path`/`--expected-ver` describe the upgrade leg,
//! `--capsule-path2`/`--expected-ver2` an optional downgrade leg. Each of
//! the `--loop` iterations sends the upgrade and then the downgrade.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use platval_core::config::PlatvalConfig;
use platval_core::error::{PlatvalError, TestError};
use platval_core::testcase::{TestCase, TestCaseInfo, TestContext};
use platval_core::types::{FirmwareKind, OsType, Verdict};
use platval_seamless::{BmcClient, CapsuleUpdate, RedfishClient, ResetPolicy, SeamlessUpdater};

pub const INFO: TestCaseInfo = TestCaseInfo {
    id: "capsule-update",
    name: "Seamless capsule update",
    description: "Stages a firmware capsule through the BMC while the SUT runs, activates it \
                  and verifies the new version and that nothing else changed",
    tags: &["seamless", "firmware", "bmc"],
    supported_os: &[OsType::Linux, OsType::Windows],
};

#[derive(Debug, Clone, Parser)]
pub struct CapsuleArgs {
    /// bios, sps, ucode, bmc, prm, cpld or ssd
    #[arg(long, default_value = "bios")]
    pub kind: FirmwareKind,

    /// Capsule to send
    #[arg(long, required_unless_present = "activation")]
    pub capsule_path: Option<PathBuf>,

    /// Version expected after the update
    #[arg(long)]
    pub expected_ver: String,

    /// Second image of a two-capsule update
    #[arg(long)]
    pub second_capsule: Option<PathBuf>,

    /// Capsule of the downgrade leg
    #[arg(long, requires = "expected_ver2")]
    pub capsule_path2: Option<PathBuf>,

    /// Version expected after the downgrade
    #[arg(long, requires = "capsule_path2")]
    pub expected_ver2: Option<String>,

    /// Iterations, each an upgrade followed by the downgrade
    #[arg(long = "loop", default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub loops: u32,

    /// Warm reset to activate
    #[arg(long, conflicts_with_all = ["cold_reset", "ac_cycle"])]
    pub warm_reset: bool,

    /// Cold reset to activate
    #[arg(long, conflicts_with = "ac_cycle")]
    pub cold_reset: bool,

    /// AC cycle to activate
    #[arg(long)]
    pub ac_cycle: bool,

    /// Run seamless.workload_command during staging
    #[arg(long)]
    pub start_workload: bool,

    /// Skip staging, only activate
    #[arg(long)]
    pub activation: bool,

    /// Staging timeout in seconds (default timeouts.staging_secs)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub staging_timeout: Option<u64>,
}

impl CapsuleArgs {
    fn reset_policy(&self) -> ResetPolicy {
        if self.warm_reset {
            ResetPolicy::Warm
        } else if self.cold_reset {
            ResetPolicy::Cold
        } else if self.ac_cycle {
            ResetPolicy::AcCycle
        } else {
            ResetPolicy::None
        }
    }
}

/// Opens the BMC connection for a run.
pub type BmcConnector<B> =
    Box<dyn Fn(&PlatvalConfig) -> Result<Arc<B>, PlatvalError> + Send + Sync>;

pub struct CapsuleUpdateCase<B: BmcClient = RedfishClient> {
    upgrade: CapsuleUpdate,
    downgrade: Option<CapsuleUpdate>,
    loops: u32,
    staging_timeout: Option<u64>,
    connect: BmcConnector<B>,
    updater: Option<SeamlessUpdater<B>>,
}

impl CapsuleUpdateCase<RedfishClient> {
    /// Case talking Redfish to the BMC in `[bmc]`.
    pub fn new(args: CapsuleArgs) -> Result<Self, PlatvalError> {
        Self::with_connector(
            args,
            Box::new(|config| Ok(Arc::new(RedfishClient::new(&config.bmc)?))),
        )
    }
}

impl<B: BmcClient> CapsuleUpdateCase<B> {
    pub fn with_connector(args: CapsuleArgs, connect: BmcConnector<B>) -> Result<Self, PlatvalError> {
        let reset = args.reset_policy();
        let leg = |capsule: PathBuf, expected: &str| {
            let mut update = CapsuleUpdate::new(args.kind, capsule, expected).with_reset(reset);
            if args.start_workload {
                update = update.with_workload();
            }
            update
        };

        let capsule = match (&args.capsule_path, args.activation) {
            (Some(path), _) => path.clone(),
            (None, true) => PathBuf::new(),
            (None, false) => {
                return Err(TestError::Setup(
                    "--capsule-path is required unless --activation is given".to_owned(),
                )
                .into());
            }
        };
        let mut upgrade = leg(capsule, &args.expected_ver);
        if let Some(second) = &args.second_capsule {
            upgrade = upgrade.with_second_capsule(second.clone());
        }
        if args.activation {
            upgrade = upgrade.activation_only();
        }
        let downgrade = match (&args.capsule_path2, &args.expected_ver2) {
            (Some(path), Some(expected)) => Some(leg(path.clone(), expected)),
            _ => None,
        };

        Ok(Self {
            upgrade,
            downgrade,
            loops: args.loops,
            staging_timeout: args.staging_timeout,
            connect,
            updater: None,
        })
    }
}

fn millis(ms: Option<u64>) -> String {
    ms.map_or_else(|| "-".to_owned(), |ms| format!("{ms} ms"))
}

impl<B: BmcClient> TestCase for CapsuleUpdateCase<B> {
    fn info(&self) -> &TestCaseInfo {
        &INFO
    }

    async fn prepare(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let bmc = (self.connect)(&ctx.config)?;
        let staging = Duration::from_secs(
            self.staging_timeout
                .unwrap_or(ctx.config.timeouts.staging_secs),
        );
        self.upgrade.staging_timeout = staging;
        if let Some(downgrade) = self.downgrade.as_mut() {
            downgrade.staging_timeout = staging;
        }
        let mut updater = SeamlessUpdater::new(bmc, ctx.sut.clone(), ctx.power.clone(), &ctx.config)?;
        updater.prime_logs().await?;
        self.updater = Some(updater);
        Ok(())
    }

    async fn execute(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let updater = self
            .updater
            .as_mut()
            .ok_or_else(|| TestError::Setup("updater not prepared".to_owned()))?;
        let (reports, post) = updater
            .run_loop(Some(&self.upgrade), self.downgrade.as_ref(), self.loops)
            .await?;

        for report in &reports {
            ctx.note(format!(
                "{}: {} -> {} (staging {}, activation {})",
                report.firmware,
                report.pre_version,
                report.post_version,
                millis(report.staging_ms),
                millis(report.activation_ms),
            ));
            if report.kpi_failed {
                ctx.note(format!("{} update missed its timing KPI", report.firmware));
            }
        }
        for message in &post.bmc_critical_errors {
            ctx.note(format!("bmc critical: {message}"));
        }
        if !post.os_errors.is_empty() {
            ctx.note(format!("{} os error lines after the update", post.os_errors.len()));
        }
        Ok(())
    }

    /// Leaves the SUT booted for whatever runs next.
    async fn cleanup(&mut self, ctx: &TestContext, verdict: Verdict) -> Result<(), PlatvalError> {
        if ctx.sut.is_alive().await {
            return Ok(());
        }
        warn!(%verdict, "sut is not in an os after the update, waiting for it");
        ctx.power.wait_for_os(ctx.config.timeouts.os_boot()).await
    }
}
