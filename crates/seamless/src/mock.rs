//! In-memory BMC for tests and offline runs.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::bmc::{BmcClient, FirmwareInventoryItem, LogEntry, SystemResetType};
use crate::error::SeamlessError;

/// What the mock BMC logs (and which inventory versions change) when a
/// capsule is staged.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    journal: Vec<String>,
    inventory: Vec<(String, String)>,
}

impl StageOutcome {
    pub fn completes() -> Self {
        Self::default()
            .with_message("Seamless firmware update started")
            .with_message("Seamless update completed successfully")
    }

    pub fn fails() -> Self {
        Self::default()
            .with_message("Seamless firmware update started")
            .with_message("SEAMLESS_UPDATE_FAILED: capsule authentication error")
    }

    /// Staging starts but never finishes.
    pub fn hangs() -> Self {
        Self::default().with_message("Seamless firmware update started")
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.journal.push(message.to_owned());
        self
    }

    pub fn with_inventory(mut self, id: &str, version: &str) -> Self {
        self.inventory.push((id.to_owned(), version.to_owned()));
        self
    }
}

#[derive(Debug, Default)]
struct State {
    journal: Vec<LogEntry>,
    sel: Vec<LogEntry>,
    inventory: Vec<FirmwareInventoryItem>,
    outcomes: VecDeque<StageOutcome>,
    staged: Vec<PathBuf>,
    system_resets: Vec<SystemResetType>,
    bmc_resets: u32,
    next_id: u64,
    stage_error: Option<u16>,
}

impl State {
    fn entry(&mut self, message: &str, severity: &str) -> LogEntry {
        self.next_id += 1;
        LogEntry {
            id: self.next_id.to_string(),
            message: message.to_owned(),
            created: format!("2024-01-01T00:00:{:02}+00:00", self.next_id % 60),
            severity: severity.to_owned(),
        }
    }

    fn set_inventory(&mut self, id: &str, version: &str) {
        match self.inventory.iter_mut().find(|item| item.id == id) {
            Some(item) => item.version = version.to_owned(),
            None => self.inventory.push(FirmwareInventoryItem {
                id: id.to_owned(),
                description: format!("{id} firmware"),
                version: version.to_owned(),
            }),
        }
    }
}

/// Scripted [`BmcClient`]. Every `stage_capsule` call consumes the next
/// queued [`StageOutcome`] (none queued: the BMC logs nothing).
#[derive(Debug, Default)]
pub struct MockBmc {
    state: Mutex<State>,
}

impl MockBmc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inventory(self, id: &str, version: &str) -> Self {
        self.lock().set_inventory(id, version);
        self
    }

    pub fn with_journal(self, message: &str) -> Self {
        self.push_journal(message, "OK");
        self
    }

    pub fn with_sel(self, message: &str, severity: &str) -> Self {
        self.push_sel(message, severity);
        self
    }

    pub fn with_stage_outcome(self, outcome: StageOutcome) -> Self {
        self.lock().outcomes.push_back(outcome);
        self
    }

    /// Every upload is answered with HTTP `status`.
    pub fn with_stage_error(self, status: u16) -> Self {
        self.lock().stage_error = Some(status);
        self
    }

    pub fn push_journal(&self, message: &str, severity: &str) {
        let mut state = self.lock();
        let entry = state.entry(message, severity);
        state.journal.push(entry);
    }

    pub fn push_sel(&self, message: &str, severity: &str) {
        let mut state = self.lock();
        let entry = state.entry(message, severity);
        state.sel.push(entry);
    }

    pub fn set_inventory(&self, id: &str, version: &str) {
        self.lock().set_inventory(id, version);
    }

    pub fn staged(&self) -> Vec<PathBuf> {
        self.lock().staged.clone()
    }

    pub fn system_resets(&self) -> Vec<SystemResetType> {
        self.lock().system_resets.clone()
    }

    pub fn bmc_resets(&self) -> u32 {
        self.lock().bmc_resets
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl BmcClient for MockBmc {
    async fn stage_capsule(&self, capsule: &Path) -> Result<(), SeamlessError> {
        let mut state = self.lock();
        if let Some(status) = state.stage_error {
            return Err(SeamlessError::Status {
                url: "mock://UpdateService/update".to_owned(),
                status,
                body: "upload rejected".to_owned(),
            });
        }
        state.staged.push(capsule.to_path_buf());
        let outcome = state.outcomes.pop_front().unwrap_or_default();
        for message in &outcome.journal {
            let entry = state.entry(message, "OK");
            state.journal.push(entry);
        }
        for (id, version) in &outcome.inventory {
            state.set_inventory(id, version);
        }
        Ok(())
    }

    async fn journal_entries(&self) -> Result<Vec<LogEntry>, SeamlessError> {
        Ok(self.lock().journal.clone())
    }

    async fn sel_entries(&self) -> Result<Vec<LogEntry>, SeamlessError> {
        Ok(self.lock().sel.clone())
    }

    async fn firmware_inventory(&self) -> Result<Vec<FirmwareInventoryItem>, SeamlessError> {
        Ok(self.lock().inventory.clone())
    }

    async fn reset_bmc(&self) -> Result<(), SeamlessError> {
        self.lock().bmc_resets += 1;
        Ok(())
    }

    async fn system_reset(&self, reset: SystemResetType) -> Result<(), SeamlessError> {
        self.lock().system_resets.push(reset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn staging_appends_queued_outcome() {
        let bmc = MockBmc::new()
            .with_journal("BMC booted")
            .with_stage_outcome(StageOutcome::completes().with_inventory("bmc_active", "2.1"));
        bmc.stage_capsule(Path::new("/caps/bmc.bin")).await.unwrap();

        let journal = bmc.journal_entries().await.unwrap();
        assert_eq!(journal.len(), 3);
        assert_ne!(journal[1].id, journal[2].id);
        let inventory = bmc.firmware_inventory().await.unwrap();
        assert_eq!(inventory[0].version, "2.1");
        assert_eq!(bmc.staged(), vec![PathBuf::from("/caps/bmc.bin")]);
    }

    #[tokio::test]
    async fn stage_error_is_reported_as_status() {
        let bmc = MockBmc::new().with_stage_error(503);
        let err = bmc.stage_capsule(Path::new("x.cap")).await.unwrap_err();
        assert!(matches!(err, SeamlessError::Status { status: 503, .. }));
        assert!(bmc.staged().is_empty());
    }
}
