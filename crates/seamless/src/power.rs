//! Out-of-band power control through the BMC.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::info;

use platval_core::error::PlatvalError;
use platval_core::exec::{BoxFuture, SutExecutor};
use platval_core::metrics as m;
use platval_core::power::{PowerControl, ResetKind, wait_until_alive};

use crate::bmc::{BmcClient, SystemResetType};

/// Warm: `GracefulRestart`. Cold: `ForceOff`, pause, `On`.
/// AC cycle: `PowerCycle`.
pub struct RedfishPowerControl<B> {
    bmc: Arc<B>,
    sut: Arc<dyn SutExecutor>,
    poll: Duration,
    shutdown_grace: Duration,
}

impl<B: BmcClient> RedfishPowerControl<B> {
    pub fn new(
        bmc: Arc<B>,
        sut: Arc<dyn SutExecutor>,
        poll: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            bmc,
            sut,
            poll,
            shutdown_grace,
        }
    }
}

impl<B: BmcClient> PowerControl for RedfishPowerControl<B> {
    fn description(&self) -> String {
        format!("redfish power control of {}", self.sut.description())
    }

    fn reset(&self, kind: ResetKind) -> BoxFuture<'_, Result<(), PlatvalError>> {
        Box::pin(async move {
            info!(%kind, "resetting sut through the bmc");
            counter!(m::SUT_RESETS_TOTAL).increment(1);
            match kind {
                ResetKind::Warm => self.bmc.system_reset(SystemResetType::GracefulRestart).await?,
                ResetKind::Cold => {
                    self.bmc.system_reset(SystemResetType::ForceOff).await?;
                    tokio::time::sleep(self.shutdown_grace).await;
                    self.bmc.system_reset(SystemResetType::On).await?;
                }
                ResetKind::AcCycle => self.bmc.system_reset(SystemResetType::PowerCycle).await?,
            }
            tokio::time::sleep(self.shutdown_grace).await;
            Ok(())
        })
    }

    fn wait_for_os(&self, timeout: Duration) -> BoxFuture<'_, Result<(), PlatvalError>> {
        Box::pin(async move { wait_until_alive(self.sut.as_ref(), timeout, self.poll).await })
    }
}
