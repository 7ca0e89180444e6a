//! Reading firmware versions from the SUT and the BMC.
//!
//! BIOS and microcode are read in-band through the SUT's OS; everything
//! else comes from the BMC firmware inventory. A version that cannot be
//! found reads as [`VERSION_NONE`].

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use platval_core::error::PlatvalError;
use platval_core::exec::SutExecutor;
use platval_core::types::{FirmwareKind, FirmwareVersions, OsType, VERSION_NONE};

use crate::bmc::{BmcClient, FirmwareInventoryItem};
use crate::error::SeamlessError;

const WINDOWS_BIOS_COMMAND: &str =
    "powershell \"Get-CimInstance Win32_BIOS | Format-List SMBIOSBIOSVersion\"";
const WINDOWS_UCODE_COMMAND: &str =
    "reg query \"HKLM\\HARDWARE\\DESCRIPTION\\System\\CentralProcessor\\0\" /v \"Update Revision\"";

/// Lenient comparison: equal, or `actual` contains `expected`.
pub fn matches_expected(actual: &str, expected: &str) -> bool {
    let (actual, expected) = (actual.trim(), expected.trim());
    if expected.is_empty() || actual == VERSION_NONE {
        return false;
    }
    actual == expected || actual.contains(expected)
}

/// Whether an inventory item id names `kind` (`bmc_active`, `bios`, `me`).
pub fn inventory_matches(id: &str, kind: FirmwareKind) -> bool {
    let keyword = kind.inventory_keyword();
    id.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == keyword)
}

/// `revision` from a Windows `Update Revision` REG_BINARY (the revision is
/// the little-endian upper dword).
fn windows_ucode_revision(output: &str) -> Option<String> {
    let hex = output
        .lines()
        .find(|line| line.contains("REG_BINARY"))?
        .split_whitespace()
        .last()?;
    if hex.len() != 16 {
        return None;
    }
    let bytes: Vec<u8> = (0..8)
        .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16))
        .collect::<Result<_, _>>()
        .ok()?;
    let revision = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Some(format!("0x{revision:x}"))
}

pub struct VersionReader<B> {
    sut: Arc<dyn SutExecutor>,
    bmc: Arc<B>,
    timeout: Duration,
    microcode: Regex,
    smbios: Regex,
}

impl<B: BmcClient> VersionReader<B> {
    pub fn new(
        sut: Arc<dyn SutExecutor>,
        bmc: Arc<B>,
        timeout: Duration,
    ) -> Result<Self, SeamlessError> {
        Ok(Self {
            sut,
            bmc,
            timeout,
            microcode: Regex::new(r"microcode\s*:\s*(0x[0-9a-fA-F]+)")?,
            smbios: Regex::new(r"SMBIOSBIOSVersion\s*:\s*(\S+)")?,
        })
    }

    pub async fn read(&self, kind: FirmwareKind) -> Result<String, PlatvalError> {
        let version = match kind {
            FirmwareKind::Bios => self.bios().await?,
            FirmwareKind::Ucode => self.microcode().await?,
            _ => {
                let inventory = self.bmc.firmware_inventory().await?;
                from_inventory(&inventory, kind)
            }
        };
        let version = if version.is_empty() { VERSION_NONE.to_owned() } else { version };
        debug!(firmware = %kind, %version, "version read");
        Ok(version)
    }

    /// Versions of every kind in `kinds`.
    pub async fn snapshot(&self, kinds: &[FirmwareKind]) -> Result<FirmwareVersions, PlatvalError> {
        let mut versions = FirmwareVersions::new();
        let inventory = self.bmc.firmware_inventory().await?;
        for &kind in kinds {
            let version = match kind {
                FirmwareKind::Bios | FirmwareKind::Ucode => self.read(kind).await?,
                _ => from_inventory(&inventory, kind),
            };
            versions.insert(kind, version);
        }
        info!(?versions, "firmware snapshot");
        Ok(versions)
    }

    async fn bios(&self) -> Result<String, PlatvalError> {
        match self.sut.os_type() {
            OsType::Windows => {
                let out = self.sut.execute_checked(WINDOWS_BIOS_COMMAND, self.timeout).await?;
                Ok(self
                    .smbios
                    .captures(&out.stdout)
                    .map(|c| c[1].to_owned())
                    .unwrap_or_default())
            }
            OsType::Linux | OsType::Esxi => {
                let out = self
                    .sut
                    .execute_checked("dmidecode -s bios-version", self.timeout)
                    .await?;
                Ok(out.stdout.trim().to_owned())
            }
        }
    }

    async fn microcode(&self) -> Result<String, PlatvalError> {
        match self.sut.os_type() {
            OsType::Windows => {
                let out = self.sut.execute_checked(WINDOWS_UCODE_COMMAND, self.timeout).await?;
                Ok(windows_ucode_revision(&out.stdout).unwrap_or_default())
            }
            OsType::Linux | OsType::Esxi => {
                let out = self
                    .sut
                    .execute_checked("grep -m 1 microcode /proc/cpuinfo", self.timeout)
                    .await?;
                Ok(self
                    .microcode
                    .captures(&out.stdout)
                    .map(|c| c[1].to_owned())
                    .unwrap_or_default())
            }
        }
    }
}

fn from_inventory(inventory: &[FirmwareInventoryItem], kind: FirmwareKind) -> String {
    inventory
        .iter()
        .find(|item| inventory_matches(&item.id, kind))
        .map(|item| item.version.trim().to_owned())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| VERSION_NONE.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBmc;
    use platval_core::exec::ScriptedExecutor;

    const T: Duration = Duration::from_secs(5);

    fn reader(exec: ScriptedExecutor, bmc: MockBmc) -> VersionReader<MockBmc> {
        VersionReader::new(Arc::new(exec), Arc::new(bmc), T).unwrap()
    }

    #[test]
    fn lenient_version_match() {
        assert!(matches_expected("EGSDCRB1.SYS.0091.D01", "EGSDCRB1.SYS.0091.D01"));
        assert!(matches_expected("Operational: 6.0.4.60 Recovery: 6.0.4.60", "6.0.4.60"));
        assert!(!matches_expected("EGSDCRB1.SYS.0090", "EGSDCRB1.SYS.0091"));
        assert!(!matches_expected("NONE", "NONE"));
        assert!(!matches_expected("1.2", ""));
    }

    #[test]
    fn inventory_ids_match_whole_tokens() {
        assert!(inventory_matches("bmc_active", FirmwareKind::Bmc));
        assert!(inventory_matches("me", FirmwareKind::Sps));
        assert!(!inventory_matches("memory_controller", FirmwareKind::Sps));
        assert!(inventory_matches("CPLD-Main", FirmwareKind::Cpld));
    }

    #[test]
    fn windows_update_revision() {
        let out = "\r\nHKEY_LOCAL_MACHINE\\HARDWARE\\DESCRIPTION\\System\\CentralProcessor\\0\r\n    Update Revision    REG_BINARY    000000006003000D\r\n";
        assert_eq!(windows_ucode_revision(out).as_deref(), Some("0xd000360"));
        assert_eq!(windows_ucode_revision("nothing"), None);
    }

    #[tokio::test]
    async fn linux_bios_and_microcode() {
        let exec = ScriptedExecutor::new(OsType::Linux)
            .with_reply("dmidecode -s bios-version", "EGSDCRB1.SYS.0090.D03\n")
            .with_reply("microcode /proc/cpuinfo", "microcode\t: 0x8d000360\n");
        let reader = reader(exec, MockBmc::new());
        assert_eq!(reader.read(FirmwareKind::Bios).await.unwrap(), "EGSDCRB1.SYS.0090.D03");
        assert_eq!(reader.read(FirmwareKind::Ucode).await.unwrap(), "0x8d000360");
    }

    #[tokio::test]
    async fn windows_bios_from_cim() {
        let exec = ScriptedExecutor::new(OsType::Windows)
            .with_reply("Win32_BIOS", "\r\nSMBIOSBIOSVersion : WLYDCRB1.SYS.0027.P01\r\n\r\n");
        let reader = reader(exec, MockBmc::new());
        assert_eq!(reader.read(FirmwareKind::Bios).await.unwrap(), "WLYDCRB1.SYS.0027.P01");
    }

    #[tokio::test]
    async fn inventory_kinds_and_missing_versions() {
        let bmc = MockBmc::new()
            .with_inventory("bmc_active", "2.13.0")
            .with_inventory("me", "6.0.4.60");
        let reader = reader(ScriptedExecutor::new(OsType::Linux), bmc);
        assert_eq!(reader.read(FirmwareKind::Bmc).await.unwrap(), "2.13.0");
        assert_eq!(reader.read(FirmwareKind::Sps).await.unwrap(), "6.0.4.60");
        assert_eq!(reader.read(FirmwareKind::Cpld).await.unwrap(), VERSION_NONE);
        // empty dmidecode output
        assert_eq!(reader.read(FirmwareKind::Bios).await.unwrap(), VERSION_NONE);
    }

    #[tokio::test]
    async fn snapshot_reads_each_kind() {
        let exec = ScriptedExecutor::new(OsType::Linux)
            .with_reply("dmidecode", "BIOS.1\n");
        let bmc = MockBmc::new().with_inventory("cpld", "3.0");
        let snapshot = reader(exec, bmc)
            .snapshot(&[FirmwareKind::Bios, FirmwareKind::Cpld, FirmwareKind::Prm])
            .await
            .unwrap();
        assert_eq!(snapshot.get(FirmwareKind::Bios), Some("BIOS.1"));
        assert_eq!(snapshot.get(FirmwareKind::Cpld), Some("3.0"));
        assert_eq!(snapshot.get(FirmwareKind::Prm), Some(VERSION_NONE));
    }
}
