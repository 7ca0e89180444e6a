//! Capsule staging progress as reported by the BMC journal.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use platval_core::error::{PlatvalError, TestError};

use crate::bmc::{BmcClient, LogCursor, LogEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingEvent {
    Started,
    Completed,
    Failed,
    Other,
}

/// Classifies one journal message.
pub fn classify(message: &str) -> StagingEvent {
    let lower = message.to_ascii_lowercase();
    if message.contains("SEAMLESS_UPDATE_FAILED") || (lower.contains("update") && lower.contains("failed"))
    {
        StagingEvent::Failed
    } else if message.contains("SEAMLESS_UPDATE_COMPLETE")
        || (message.contains("Seamless")
            && message.contains("update")
            && message.contains("completed successfully"))
    {
        StagingEvent::Completed
    } else if message.contains("firmware update") && message.contains("started") {
        StagingEvent::Started
    } else {
        StagingEvent::Other
    }
}

/// Critical entries other than the update's own start/complete notices.
pub fn is_critical(entry: &LogEntry) -> bool {
    let critical = entry.severity == "Critical" || entry.message.contains("Severity: Critical");
    let own_notice = entry.message.contains("Seamless")
        && entry.message.contains("update")
        && (entry.message.contains("started") || entry.message.contains("completed"));
    critical && !own_notice
}

/// Polls the journal every `poll` until staging completes.
///
/// Returns the time from the first poll to the completion entry. A failure
/// entry fails immediately; after `timeout` the journal is swept one last
/// time before giving up.
pub async fn wait_for_staging<B: BmcClient>(
    bmc: &B,
    cursor: &mut LogCursor,
    timeout: Duration,
    poll: Duration,
) -> Result<Duration, PlatvalError> {
    let started = Instant::now();
    let mut seen_start = false;
    loop {
        let expired = started.elapsed() >= timeout;
        for entry in cursor.fresh(bmc.journal_entries().await?) {
            match classify(&entry.message) {
                StagingEvent::Started if !seen_start => {
                    seen_start = true;
                    info!(message = %entry.message, "capsule staging started");
                }
                StagingEvent::Completed => {
                    let elapsed = started.elapsed();
                    info!(elapsed_ms = elapsed.as_millis() as u64, "capsule staging completed");
                    return Ok(elapsed);
                }
                StagingEvent::Failed => {
                    warn!(message = %entry.message, "capsule staging failed");
                    return Err(TestError::Fail(format!("capsule staging failed: {}", entry.message)).into());
                }
                StagingEvent::Started | StagingEvent::Other => {
                    debug!(message = %entry.message, "journal");
                }
            }
        }
        if expired {
            let state = if seen_start { "started but did not complete" } else { "never started" };
            return Err(TestError::Fail(format!(
                "capsule staging {state} within {}s",
                timeout.as_secs()
            ))
            .into());
        }
        tokio::time::sleep(poll).await;
    }
}
