//! Power-cycling primitives.
//!
//! [`PowerControl`] resets the SUT and waits for its OS to come back.
//! [`SshPowerControl`] can only do what the running OS can do for itself
//! (warm reset); out-of-band resets need a BMC-backed implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{PlatvalError, TestError};
use crate::exec::{BoxFuture, SutExecutor};
use crate::metrics as m;
use crate::types::OsType;

/// Kind of reset applied to the SUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetKind {
    /// OS-initiated reboot
    Warm,
    /// DC power cycle
    Cold,
    /// AC power removed and restored
    AcCycle,
}

impl fmt::Display for ResetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warm => write!(f, "warm reset"),
            Self::Cold => write!(f, "cold reset"),
            Self::AcCycle => write!(f, "ac cycle"),
        }
    }
}

pub trait PowerControl: Send + Sync {
    fn description(&self) -> String;

    /// Issues the reset. Returns once the reset has been requested; use
    /// [`PowerControl::wait_for_os`] to wait for the SUT.
    fn reset(&self, kind: ResetKind) -> BoxFuture<'_, Result<(), PlatvalError>>;

    /// Polls until the OS answers or `timeout` elapses.
    fn wait_for_os(&self, timeout: Duration) -> BoxFuture<'_, Result<(), PlatvalError>>;

    /// `reset` followed by `wait_for_os`.
    fn reset_and_wait(
        &self,
        kind: ResetKind,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.reset(kind).await?;
            self.wait_for_os(timeout).await
        })
    }
}

/// Polls `executor.is_alive()` every `poll` until it answers or `timeout`.
pub async fn wait_until_alive(
    executor: &dyn SutExecutor,
    timeout: Duration,
    poll: Duration,
) -> Result<(), PlatvalError> {
    let deadline = Instant::now() + timeout;
    loop {
        if executor.is_alive().await {
            info!(target_sut = %executor.description(), "OS is alive");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TestError::Fail(format!(
                "{} did not come back within {:?}",
                executor.description(),
                timeout
            ))
            .into());
        }
        debug!(target_sut = %executor.description(), "waiting for OS");
        tokio::time::sleep(poll).await;
    }
}

/// Resets through the SUT's own OS.
pub struct SshPowerControl {
    executor: Arc<dyn SutExecutor>,
    poll: Duration,
    shutdown_grace: Duration,
}

impl SshPowerControl {
    pub fn new(executor: Arc<dyn SutExecutor>, poll: Duration, shutdown_grace: Duration) -> Self {
        Self {
            executor,
            poll,
            shutdown_grace,
        }
    }
}

impl PowerControl for SshPowerControl {
    fn description(&self) -> String {
        format!("os reboot via {}", self.executor.description())
    }

    fn reset(&self, kind: ResetKind) -> BoxFuture<'_, Result<(), PlatvalError>> {
        Box::pin(async move {
            if kind != ResetKind::Warm {
                return Err(TestError::Unsupported(format!(
                    "{kind} needs out-of-band power control"
                ))
                .into());
            }
            let command = match self.executor.os_type() {
                OsType::Windows => "shutdown /r /t 0",
                OsType::Linux | OsType::Esxi => "reboot",
            };
            info!(command, "issuing warm reset");
            counter!(m::SUT_RESETS_TOTAL).increment(1);
            // The session usually drops while the OS goes down.
            if let Err(e) = self.executor.execute(command, Duration::from_secs(30)).await {
                debug!(error = %e, "reboot command ended with an error, expected during reset");
            }
            tokio::time::sleep(self.shutdown_grace).await;
            Ok(())
        })
    }

    fn wait_for_os(&self, timeout: Duration) -> BoxFuture<'_, Result<(), PlatvalError>> {
        Box::pin(async move { wait_until_alive(self.executor.as_ref(), timeout, self.poll).await })
    }
}
