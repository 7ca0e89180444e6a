//! Seamless capsule update flow.
//!
//! One [`SeamlessUpdater::send_capsule`] call takes a capsule from upload to
//! a verified version:
//!
//! ```text
//! drain logs ─► pre version ─► [workload] ─► stage ─► wait journal ─► stop workload
//!                                                                     │
//!            compare ◄── post version ◄── activation (reset / SPS / BMC) ◄┘
//! ```
//!
//! Timings are checked against KPIs (`seamless.kpi_*`). A missed KPI is
//! reported and counted but does not fail the update.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use platval_core::config::{PlatvalConfig, SeamlessConfig, TimeoutConfig};
use platval_core::error::{PlatvalError, TestError};
use platval_core::exec::SutExecutor;
use platval_core::metrics as m;
use platval_core::oslog;
use platval_core::power::{PowerControl, ResetKind};
use platval_core::types::{FirmwareKind, FirmwareVersions, VERSION_NONE};

use crate::bmc::{BmcClient, FirmwareInventoryItem, LogCursor};
use crate::staging::{is_critical, wait_for_staging};
use crate::version::{VersionReader, matches_expected};
use crate::workload::BackgroundWorkload;

/// Components compared before and after an update.
pub const SNAPSHOT_KINDS: [FirmwareKind; 6] = [
    FirmwareKind::Bios,
    FirmwareKind::Ucode,
    FirmwareKind::Sps,
    FirmwareKind::Bmc,
    FirmwareKind::Cpld,
    FirmwareKind::Prm,
];

/// How a staged capsule gets activated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// No reset; the version read before the update is kept
    #[default]
    None,
    Warm,
    Cold,
    AcCycle,
}

impl ResetPolicy {
    pub fn reset_kind(self) -> Option<ResetKind> {
        match self {
            Self::None => None,
            Self::Warm => Some(ResetKind::Warm),
            Self::Cold => Some(ResetKind::Cold),
            Self::AcCycle => Some(ResetKind::AcCycle),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapsuleUpdate {
    pub kind: FirmwareKind,
    pub capsule: PathBuf,
    /// Second image of a two-capsule update, staged right after the first
    pub capsule2: Option<PathBuf>,
    pub expected_version: String,
    pub reset: ResetPolicy,
    /// Skip staging; only activate what is already staged
    pub activation_only: bool,
    pub start_workload: bool,
    pub staging_timeout: Duration,
}

impl CapsuleUpdate {
    pub fn new(kind: FirmwareKind, capsule: impl Into<PathBuf>, expected_version: &str) -> Self {
        Self {
            kind,
            capsule: capsule.into(),
            capsule2: None,
            expected_version: expected_version.to_owned(),
            reset: ResetPolicy::None,
            activation_only: false,
            start_workload: false,
            staging_timeout: Duration::from_secs(TimeoutConfig::default().staging_secs),
        }
    }

    pub fn with_second_capsule(mut self, capsule: impl Into<PathBuf>) -> Self {
        self.capsule2 = Some(capsule.into());
        self
    }

    pub fn with_reset(mut self, reset: ResetPolicy) -> Self {
        self.reset = reset;
        self
    }

    pub fn with_workload(mut self) -> Self {
        self.start_workload = true;
        self
    }

    pub fn activation_only(mut self) -> Self {
        self.activation_only = true;
        self
    }

    pub fn with_staging_timeout(mut self, timeout: Duration) -> Self {
        self.staging_timeout = timeout;
        self
    }

    fn capsules(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.capsule.as_path()).chain(self.capsule2.as_deref())
    }
}

/// Result of one capsule update.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub firmware: FirmwareKind,
    pub capsule: String,
    pub pre_version: String,
    pub post_version: String,
    pub expected_version: String,
    pub staging_ms: Option<u64>,
    pub activation_ms: Option<u64>,
    pub kpi_failed: bool,
    pub bmc_critical_errors: Vec<String>,
}

/// Findings of [`SeamlessUpdater::examine_post_update_conditions`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PostUpdateReport {
    pub inventory: Vec<FirmwareInventoryItem>,
    /// Components other than the target whose version moved
    pub changed: Vec<(FirmwareKind, String, String)>,
    pub os_errors: Vec<String>,
    pub bmc_critical_errors: Vec<String>,
}

pub struct SeamlessUpdater<B: BmcClient> {
    bmc: Arc<B>,
    sut: Arc<dyn SutExecutor>,
    power: Arc<dyn PowerControl>,
    versions: VersionReader<B>,
    seamless: SeamlessConfig,
    timeouts: TimeoutConfig,
    journal: LogCursor,
    sel: LogCursor,
    baseline: Option<FirmwareVersions>,
    critical: Vec<String>,
}

impl<B: BmcClient> SeamlessUpdater<B> {
    pub fn new(
        bmc: Arc<B>,
        sut: Arc<dyn SutExecutor>,
        power: Arc<dyn PowerControl>,
        config: &PlatvalConfig,
    ) -> Result<Self, PlatvalError> {
        let versions = VersionReader::new(sut.clone(), bmc.clone(), config.timeouts.command())?;
        Ok(Self {
            bmc,
            sut,
            power,
            versions,
            seamless: config.seamless.clone(),
            timeouts: config.timeouts.clone(),
            journal: LogCursor::new(),
            sel: LogCursor::new(),
            baseline: None,
            critical: Vec::new(),
        })
    }

    /// Versions captured before the first update of this updater.
    pub fn baseline(&self) -> Option<&FirmwareVersions> {
        self.baseline.as_ref()
    }

    pub fn versions(&self) -> &VersionReader<B> {
        &self.versions
    }

    /// Marks every journal and SEL entry logged so far as seen.
    pub async fn prime_logs(&mut self) -> Result<(), PlatvalError> {
        let journal = self.journal.skip(self.bmc.journal_entries().await?);
        let sel = self.sel.skip(self.bmc.sel_entries().await?);
        debug!(journal, sel, "skipped existing bmc log entries");
        Ok(())
    }

    /// New critical SEL entries since the last call.
    async fn collect_critical(&mut self) -> Result<Vec<String>, PlatvalError> {
        let fresh: Vec<String> = self
            .sel
            .fresh(self.bmc.sel_entries().await?)
            .into_iter()
            .filter(is_critical)
            .map(|entry| entry.message)
            .collect();
        for message in &fresh {
            warn!(%message, "bmc critical error");
        }
        self.critical.extend(fresh.iter().cloned());
        Ok(fresh)
    }

    pub async fn send_capsule(&mut self, update: &CapsuleUpdate) -> Result<UpdateReport, PlatvalError> {
        let firmware = update.kind.to_string();
        info!(%firmware, capsule = %update.capsule.display(), expected = %update.expected_version, "sending capsule");
        self.prime_logs().await?;

        let in_os = self.sut.is_alive().await;
        let pre_version = if in_os {
            self.versions.read(update.kind).await?
        } else {
            warn!("sut is not in an os, skipping the pre-update version");
            VERSION_NONE.to_owned()
        };
        if in_os && self.baseline.is_none() {
            self.baseline = Some(self.versions.snapshot(&SNAPSHOT_KINDS).await?);
        }
        info!(%firmware, %pre_version, "version before update");

        let mut workload = if update.start_workload {
            Some(self.start_workload().await?)
        } else {
            None
        };
        let staged = self.stage(update).await;
        let workload_result = match workload.as_mut() {
            Some(w) => match w.stop().await {
                Ok(()) => w.join().await.map(|_| ()),
                Err(e) => Err(e),
            },
            None => Ok(()),
        };
        let staging = staged?;
        workload_result?;

        let mut kpi_failed = false;
        if let Some(staging) = staging {
            histogram!(m::CAPSULE_STAGING_SECONDS, m::LABEL_FIRMWARE => firmware.clone())
                .record(staging.as_secs_f64());
            if staging > Duration::from_secs(self.seamless.kpi_staging_secs) {
                warn!(%firmware, staging_ms = staging.as_millis() as u64, "staging KPI missed");
                kpi_failed = true;
            }
        }

        let (post_version, activation) = self.activate(update, &pre_version).await?;
        if let Some(activation) = activation {
            histogram!(m::CAPSULE_ACTIVATION_SECONDS, m::LABEL_FIRMWARE => firmware.clone())
                .record(activation.as_secs_f64());
            if update.kind == FirmwareKind::Sps
                && activation > Duration::from_secs(self.seamless.kpi_sps_activation_secs)
            {
                warn!(activation_ms = activation.as_millis() as u64, "sps activation KPI missed");
                kpi_failed = true;
            }
        }
        if kpi_failed {
            counter!(m::CAPSULE_KPI_MISSED_TOTAL, m::LABEL_FIRMWARE => firmware.clone()).increment(1);
        }

        if post_version == VERSION_NONE || !matches_expected(&post_version, &update.expected_version) {
            return Err(TestError::Fail(format!(
                "{firmware} version after update is '{post_version}', expected '{}'",
                update.expected_version
            ))
            .into());
        }
        info!(%firmware, %pre_version, %post_version, kpi_failed, "capsule update verified");

        Ok(UpdateReport {
            firmware: update.kind,
            capsule: update.capsule.display().to_string(),
            pre_version,
            post_version,
            expected_version: update.expected_version.clone(),
            staging_ms: staging.map(|d| d.as_millis() as u64),
            activation_ms: activation.map(|d| d.as_millis() as u64),
            kpi_failed,
            bmc_critical_errors: self.collect_critical().await?,
        })
    }

    /// `loops` rounds of upgrade then downgrade (either may be absent),
    /// stopping at the first failure. Post-update conditions are examined
    /// once at the end.
    pub async fn run_loop(
        &mut self,
        upgrade: Option<&CapsuleUpdate>,
        downgrade: Option<&CapsuleUpdate>,
        loops: u32,
    ) -> Result<(Vec<UpdateReport>, PostUpdateReport), PlatvalError> {
        let Some(target) = upgrade.or(downgrade).map(|u| u.kind) else {
            return Err(TestError::Setup("no capsule to send".to_owned()).into());
        };
        let mut reports = Vec::new();
        for round in 1..=loops.max(1) {
            info!(round, loops, "capsule update round");
            for update in [upgrade, downgrade].into_iter().flatten() {
                reports.push(self.send_capsule(update).await?);
            }
        }
        let post = self.examine_post_update_conditions(target).await?;
        Ok((reports, post))
    }

    /// Checks that nothing but `target` changed and gathers OS and BMC
    /// errors logged since the baseline.
    pub async fn examine_post_update_conditions(
        &mut self,
        target: FirmwareKind,
    ) -> Result<PostUpdateReport, PlatvalError> {
        let inventory = self.bmc.firmware_inventory().await?;
        for item in &inventory {
            info!(id = %item.id, description = %item.description, version = %item.version, "firmware inventory");
        }
        self.collect_critical().await?;
        let mut report = PostUpdateReport {
            inventory,
            bmc_critical_errors: self.critical.clone(),
            ..PostUpdateReport::default()
        };

        if !self.sut.is_alive().await {
            warn!("sut is not in an os, skipping version and os log checks");
            return Ok(report);
        }
        if let Some(baseline) = &self.baseline {
            let now = self.versions.snapshot(&SNAPSHOT_KINDS).await?;
            report.changed = baseline.changed_since(&now, target);
        }
        report.os_errors = oslog::collect_os_errors(self.sut.as_ref(), self.timeouts.command()).await?;
        if !report.os_errors.is_empty() {
            warn!(count = report.os_errors.len(), "os error log lines found after update");
        }

        if !report.changed.is_empty() {
            let changes: Vec<String> = report
                .changed
                .iter()
                .map(|(kind, before, after)| format!("{kind}: '{before}' -> '{after}'"))
                .collect();
            return Err(TestError::Fail(format!(
                "firmware other than {target} changed during the update: {}",
                changes.join(", ")
            ))
            .into());
        }
        info!(%target, "post update firmware versions are as expected");
        Ok(report)
    }

    async fn start_workload(&self) -> Result<BackgroundWorkload, PlatvalError> {
        if self.seamless.workload_command.is_empty() {
            return Err(TestError::Setup("seamless.workload_command is empty".to_owned()).into());
        }
        let budget = Duration::from_secs(
            self.timeouts.staging_secs + self.timeouts.reboot_secs + self.timeouts.command_secs,
        );
        let workload = BackgroundWorkload::start(
            self.sut.clone(),
            &self.seamless.workload_command,
            &self.seamless.workload_stop_command,
            budget,
        );
        tokio::time::sleep(Duration::from_secs(self.seamless.workload_settle_secs)).await;
        Ok(workload)
    }

    async fn stage(&mut self, update: &CapsuleUpdate) -> Result<Option<Duration>, PlatvalError> {
        if update.activation_only {
            info!("activation only, skipping staging");
            return Ok(None);
        }
        let poll = Duration::from_millis(self.seamless.journal_poll_ms);
        let mut total = Duration::ZERO;
        for capsule in update.capsules() {
            if !tokio::fs::try_exists(capsule).await? {
                return Err(TestError::Setup(format!("capsule '{}' not found", capsule.display())).into());
            }
            info!(capsule = %capsule.display(), "staging capsule");
            self.bmc.stage_capsule(capsule).await?;
            total += wait_for_staging(self.bmc.as_ref(), &mut self.journal, update.staging_timeout, poll).await?;
        }
        Ok(Some(total))
    }

    /// Returns the post-activation version and how long activation took.
    async fn activate(
        &mut self,
        update: &CapsuleUpdate,
        pre_version: &str,
    ) -> Result<(String, Option<Duration>), PlatvalError> {
        let started = Instant::now();
        match (update.kind, update.reset.reset_kind()) {
            (FirmwareKind::Sps, reset) => {
                if let Some(kind) = reset {
                    self.power.reset_and_wait(kind, self.reboot_timeout()).await?;
                }
                let post = if matches_expected(pre_version, &update.expected_version) {
                    self.versions.read(FirmwareKind::Sps).await?
                } else {
                    self.wait_for_transition(FirmwareKind::Sps, pre_version).await?
                };
                Ok((post, Some(started.elapsed())))
            }
            (FirmwareKind::Bmc, Some(_)) => {
                self.bmc.reset_bmc().await?;
                let post = self.wait_for_transition(FirmwareKind::Bmc, pre_version).await?;
                Ok((post, Some(started.elapsed())))
            }
            (kind, Some(reset)) => {
                self.power.reset_and_wait(reset, self.reboot_timeout()).await?;
                let post = self.versions.read(kind).await?;
                Ok((post, Some(started.elapsed())))
            }
            (_, None) => {
                info!("no reset requested, keeping the pre-update version");
                Ok((pre_version.to_owned(), None))
            }
        }
    }

    /// Polls `kind` until it differs from `pre_version`. Read errors count
    /// as "not yet" while the component restarts.
    async fn wait_for_transition(&self, kind: FirmwareKind, pre_version: &str) -> Result<String, PlatvalError> {
        let timeout = Duration::from_secs(self.timeouts.sps_transition_secs);
        let poll = Duration::from_secs(self.timeouts.power_poll_secs);
        let started = Instant::now();
        loop {
            match self.versions.read(kind).await {
                Ok(post) if post != pre_version && post != VERSION_NONE => {
                    info!(firmware = %kind, %post, "version transitioned");
                    return Ok(post);
                }
                Ok(_) => {}
                Err(e) => debug!(firmware = %kind, error = %e, "version not readable yet"),
            }
            if started.elapsed() >= timeout {
                return Err(TestError::Fail(format!(
                    "{kind} version did not transition from '{pre_version}' within {}s",
                    timeout.as_secs()
                ))
                .into());
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.reboot_secs)
    }
}
