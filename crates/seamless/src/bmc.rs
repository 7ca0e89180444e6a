//! BMC access over Redfish.
//!
//! The [`BmcClient`] trait abstracts the handful of Redfish calls the
//! update flow needs, so that production code talks to a real BMC through
//! [`RedfishClient`] while tests use [`MockBmc`](crate::mock::MockBmc).
//!
//! ```text
//! SeamlessUpdater ──► BmcClient (trait)
//!                       │        │
//!                 RedfishClient  MockBmc
//!                       │
//!                 BMC (HTTPS, basic auth)
//! ```
//!
//! Log services return their whole history on every call; a [`LogCursor`]
//! turns that into a stream of entries not seen before.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, header};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use platval_core::config::BmcConfig;

use crate::error::SeamlessError;

pub const UPDATE_SERVICE_PATH: &str = "/redfish/v1/UpdateService";
/// Push URI used when the update service does not advertise one
pub const DEFAULT_PUSH_URI: &str = "/redfish/v1/UpdateService/update";
pub const JOURNAL_PATH: &str = "/redfish/v1/Managers/bmc/LogServices/Journal/Entries";
pub const SEL_PATH: &str = "/redfish/v1/Systems/system/LogServices/EventLog/Entries";
pub const FIRMWARE_INVENTORY_PATH: &str = "/redfish/v1/UpdateService/FirmwareInventory";
pub const MANAGER_RESET_PATH: &str = "/redfish/v1/Managers/bmc/Actions/Manager.Reset";
pub const SYSTEM_RESET_PATH: &str = "/redfish/v1/Systems/system/Actions/ComputerSystem.Reset";

// ─── Redfish resources ───────────────────────────────────────────────

/// Journal or SEL entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogEntry {
    pub id: String,
    pub message: String,
    pub created: String,
    /// `OK`, `Warning` or `Critical`
    pub severity: String,
}

impl LogEntry {
    fn key(&self) -> String {
        if self.id.is_empty() {
            format!("{}|{}", self.created, self.message)
        } else {
            self.id.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FirmwareInventoryItem {
    pub id: String,
    pub description: String,
    pub version: String,
}

/// `ResetType` of `ComputerSystem.Reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemResetType {
    On,
    ForceOff,
    GracefulShutdown,
    GracefulRestart,
    ForceRestart,
    PowerCycle,
}

impl fmt::Display for SystemResetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::On => "On",
            Self::ForceOff => "ForceOff",
            Self::GracefulShutdown => "GracefulShutdown",
            Self::GracefulRestart => "GracefulRestart",
            Self::ForceRestart => "ForceRestart",
            Self::PowerCycle => "PowerCycle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(rename = "Members", default = "Vec::new")]
    members: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ODataLink {
    #[serde(rename = "@odata.id")]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct UpdateService {
    http_push_uri: Option<String>,
}

// ─── LogCursor ───────────────────────────────────────────────────────

/// Remembers which log entries were already handed out.
#[derive(Debug, Default)]
pub struct LogCursor {
    seen: HashSet<String>,
}

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of `entries` not returned by an earlier call.
    pub fn fresh(&mut self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        entries
            .into_iter()
            .filter(|entry| self.seen.insert(entry.key()))
            .collect()
    }

    /// Marks everything in `entries` as seen.
    pub fn skip(&mut self, entries: Vec<LogEntry>) -> usize {
        self.fresh(entries).len()
    }

    pub fn seen(&self) -> usize {
        self.seen.len()
    }
}

// ─── BmcClient ───────────────────────────────────────────────────────

pub trait BmcClient: Send + Sync + 'static {
    /// Uploads a capsule to the update service. Staging progress shows up
    /// in the journal afterwards.
    fn stage_capsule(&self, capsule: &Path) -> impl Future<Output = Result<(), SeamlessError>> + Send;

    fn journal_entries(&self) -> impl Future<Output = Result<Vec<LogEntry>, SeamlessError>> + Send;

    fn sel_entries(&self) -> impl Future<Output = Result<Vec<LogEntry>, SeamlessError>> + Send;

    fn firmware_inventory(
        &self,
    ) -> impl Future<Output = Result<Vec<FirmwareInventoryItem>, SeamlessError>> + Send;

    /// Graceful restart of the BMC itself.
    fn reset_bmc(&self) -> impl Future<Output = Result<(), SeamlessError>> + Send;

    fn system_reset(
        &self,
        reset: SystemResetType,
    ) -> impl Future<Output = Result<(), SeamlessError>> + Send;
}

// ─── RedfishClient ───────────────────────────────────────────────────

pub struct RedfishClient {
    client: Client,
    base_url: String,
    user: String,
    password: String,
}

impl fmt::Debug for RedfishClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedfishClient")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl RedfishClient {
    pub fn new(config: &BmcConfig) -> Result<Self, SeamlessError> {
        if !config.is_configured() {
            return Err(SeamlessError::NotConfigured);
        }
        let client = Client::builder()
            .user_agent(concat!("platval/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else {
            format!("{}{path}", self.base_url)
        }
    }

    async fn checked_body(url: &str, response: reqwest::Response) -> Result<Bytes, SeamlessError> {
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(SeamlessError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).trim().chars().take(512).collect(),
            });
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SeamlessError> {
        let url = self.url(path);
        debug!(%url, "redfish get");
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        let body = Self::checked_body(&url, response).await?;
        serde_json::from_slice(&body).map_err(|e| SeamlessError::Decode {
            url,
            reason: e.to_string(),
        })
    }

    async fn post_json(&self, path: &str, payload: &serde_json::Value) -> Result<(), SeamlessError> {
        let url = self.url(path);
        debug!(%url, %payload, "redfish post");
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(payload)
            .send()
            .await?;
        Self::checked_body(&url, response).await?;
        Ok(())
    }

    async fn push_uri(&self) -> Result<String, SeamlessError> {
        let service: UpdateService = self.get_json(UPDATE_SERVICE_PATH).await?;
        Ok(service
            .http_push_uri
            .filter(|uri| !uri.is_empty())
            .unwrap_or_else(|| DEFAULT_PUSH_URI.to_owned()))
    }
}

impl BmcClient for RedfishClient {
    async fn stage_capsule(&self, capsule: &Path) -> Result<(), SeamlessError> {
        let image = tokio::fs::read(capsule).await.map_err(|e| {
            SeamlessError::Capsule(format!("cannot read '{}': {e}", capsule.display()))
        })?;
        let url = self.url(&self.push_uri().await?);
        info!(capsule = %capsule.display(), bytes = image.len(), %url, "uploading capsule");
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Bytes::from(image))
            .send()
            .await?;
        Self::checked_body(&url, response).await?;
        Ok(())
    }

    async fn journal_entries(&self) -> Result<Vec<LogEntry>, SeamlessError> {
        let entries: Collection<LogEntry> = self.get_json(JOURNAL_PATH).await?;
        Ok(entries.members)
    }

    async fn sel_entries(&self) -> Result<Vec<LogEntry>, SeamlessError> {
        let entries: Collection<LogEntry> = self.get_json(SEL_PATH).await?;
        Ok(entries.members)
    }

    async fn firmware_inventory(&self) -> Result<Vec<FirmwareInventoryItem>, SeamlessError> {
        let links: Collection<ODataLink> = self.get_json(FIRMWARE_INVENTORY_PATH).await?;
        let mut items = Vec::with_capacity(links.members.len());
        for link in links.members {
            items.push(self.get_json::<FirmwareInventoryItem>(&link.id).await?);
        }
        Ok(items)
    }

    async fn reset_bmc(&self) -> Result<(), SeamlessError> {
        info!("requesting bmc graceful restart");
        self.post_json(
            MANAGER_RESET_PATH,
            &serde_json::json!({ "ResetType": "GracefulRestart" }),
        )
        .await
    }

    async fn system_reset(&self, reset: SystemResetType) -> Result<(), SeamlessError> {
        info!(%reset, "requesting system reset");
        self.post_json(SYSTEM_RESET_PATH, &serde_json::json!({ "ResetType": reset }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, message: &str) -> LogEntry {
        LogEntry {
            id: id.to_owned(),
            message: message.to_owned(),
            ..LogEntry::default()
        }
    }

    #[test]
    fn log_entries_decode_from_redfish_json() {
        let body = r#"{
            "@odata.id": "/redfish/v1/Managers/bmc/LogServices/Journal/Entries",
            "Members": [
                {"Id": "1", "Message": "Seamless firmware update started", "Created": "2024-03-01T10:00:00+00:00", "Severity": "OK"},
                {"Id": "2", "Message": "Power supply failure", "Severity": "Critical"}
            ],
            "Members@odata.count": 2
        }"#;
        let entries: Collection<LogEntry> = serde_json::from_str(body).unwrap();
        assert_eq!(entries.members.len(), 2);
        assert_eq!(entries.members[1].severity, "Critical");
        assert!(entries.members[1].created.is_empty());
    }

    #[test]
    fn update_service_without_push_uri() {
        let service: UpdateService = serde_json::from_str(r#"{"ServiceEnabled": true}"#).unwrap();
        assert!(service.http_push_uri.is_none());
    }

    #[test]
    fn reset_type_serializes_as_redfish_name() {
        let payload = serde_json::json!({ "ResetType": SystemResetType::PowerCycle });
        assert_eq!(payload.to_string(), r#"{"ResetType":"PowerCycle"}"#);
        assert_eq!(SystemResetType::ForceOff.to_string(), "ForceOff");
    }

    #[test]
    fn cursor_returns_each_entry_once() {
        let mut cursor = LogCursor::new();
        assert_eq!(cursor.skip(vec![entry("1", "boot"), entry("2", "sel cleared")]), 2);

        let fresh = cursor.fresh(vec![
            entry("1", "boot"),
            entry("2", "sel cleared"),
            entry("3", "firmware update started"),
        ]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, "3");
        assert!(cursor.fresh(vec![entry("3", "firmware update started")]).is_empty());
        assert_eq!(cursor.seen(), 3);
    }

    #[test]
    fn cursor_keys_entries_without_id_by_content() {
        let mut cursor = LogCursor::new();
        let a = LogEntry {
            message: "x".to_owned(),
            created: "t1".to_owned(),
            ..LogEntry::default()
        };
        let b = LogEntry {
            created: "t2".to_owned(),
            ..a.clone()
        };
        assert_eq!(cursor.fresh(vec![a.clone(), b]).len(), 2);
        assert!(cursor.fresh(vec![a]).is_empty());
    }

    #[test]
    fn client_requires_configured_bmc() {
        let err = RedfishClient::new(&BmcConfig::default()).unwrap_err();
        assert!(matches!(err, SeamlessError::NotConfigured));
    }

    #[test]
    fn client_joins_relative_and_absolute_urls() {
        let config = BmcConfig {
            url: "https://10.0.0.6/".to_owned(),
            password: "secret".to_owned(),
            ..BmcConfig::default()
        };
        let client = RedfishClient::new(&config).unwrap();
        assert_eq!(client.base_url(), "https://10.0.0.6");
        assert_eq!(client.url(JOURNAL_PATH), format!("https://10.0.0.6{JOURNAL_PATH}"));
        assert_eq!(client.url("https://other/x"), "https://other/x");
        assert!(!format!("{client:?}").contains("secret"));
    }
}
