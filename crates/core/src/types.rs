//! Domain types shared by every platval crate.
//!
//! Everything here is transient: command results, parsed version strings,
//! and the verdict a test run ends with.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

// ─── OsType ──────────────────────────────────────────────────────────

/// Operating system running on a SUT or on the controlling host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Windows,
    Esxi,
}

impl OsType {
    /// OS type of the machine this binary is running on.
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Linux
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Windows => write!(f, "windows"),
            Self::Esxi => write!(f, "esxi"),
        }
    }
}

impl FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            "esxi" | "vmware" => Ok(Self::Esxi),
            other => Err(format!("unknown os type '{other}'")),
        }
    }
}

// ─── CommandOutput ───────────────────────────────────────────────────

/// Result of a single command executed on a SUT or on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Command line as it was submitted
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` when the process was killed by a signal)
    pub exit_code: i32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl CommandOutput {
    /// Successful output carrying only stdout.
    pub fn ok(command: impl Into<String>, stdout: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turns a non-zero exit code into [`ExecError::NonZeroExit`].
    pub fn ensure_success(self) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::NonZeroExit {
                command: self.command,
                code: self.exit_code,
                stderr: self.stderr.trim().to_owned(),
            })
        }
    }

    /// stdout, or stderr when stdout is empty.
    pub fn text(&self) -> &str {
        if self.stdout.trim().is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }

    /// Non-empty, trimmed stdout lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ─── Verdict ─────────────────────────────────────────────────────────

/// Final outcome of a test case run.
///
/// Each verdict has a stable process exit code so that lab schedulers can
/// tell "the platform failed" apart from "the test could not run here".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    NotApplicable,
    Unsupported,
    NotImplemented,
    /// Harness or infrastructure error, nothing was concluded about the SUT
    Error,
}

impl Verdict {
    /// | Verdict        | Code |
    /// |----------------|------|
    /// | Pass           | 0    |
    /// | Fail           | 1    |
    /// | Error          | 2    |
    /// | NotApplicable  | 3    |
    /// | Unsupported    | 4    |
    /// | NotImplemented | 5    |
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Error => 2,
            Self::NotApplicable => 3,
            Self::Unsupported => 4,
            Self::NotImplemented => 5,
        }
    }

    pub fn is_pass(self) -> bool {
        self == Self::Pass
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::NotApplicable => write!(f, "N/A"),
            Self::Unsupported => write!(f, "UNSUPPORTED"),
            Self::NotImplemented => write!(f, "NOT IMPLEMENTED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

// ─── Firmware ────────────────────────────────────────────────────────

/// Firmware component that can be updated with a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareKind {
    Bios,
    Bmc,
    /// Server Platform Services (ME) firmware
    Sps,
    Ucode,
    Prm,
    Cpld,
    Ssd,
}

impl FirmwareKind {
    pub const ALL: [FirmwareKind; 7] = [
        Self::Bios,
        Self::Bmc,
        Self::Sps,
        Self::Ucode,
        Self::Prm,
        Self::Cpld,
        Self::Ssd,
    ];

    /// Keyword looked up in BMC firmware inventory item ids.
    pub fn inventory_keyword(self) -> &'static str {
        match self {
            Self::Bios => "bios",
            Self::Bmc => "bmc",
            Self::Sps => "me",
            Self::Ucode => "ucode",
            Self::Prm => "prm",
            Self::Cpld => "cpld",
            Self::Ssd => "ssd",
        }
    }
}

impl fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bios => "bios",
            Self::Bmc => "bmc",
            Self::Sps => "sps",
            Self::Ucode => "ucode",
            Self::Prm => "prm",
            Self::Cpld => "cpld",
            Self::Ssd => "ssd",
        };
        f.write_str(name)
    }
}

impl FromStr for FirmwareKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bios" | "ifwi" => Ok(Self::Bios),
            "bmc" => Ok(Self::Bmc),
            "sps" | "me" => Ok(Self::Sps),
            "ucode" | "microcode" => Ok(Self::Ucode),
            "prm" => Ok(Self::Prm),
            "cpld" => Ok(Self::Cpld),
            "ssd" => Ok(Self::Ssd),
            other => Err(format!("unknown firmware kind '{other}'")),
        }
    }
}

/// Version string reported when a component's version cannot be read.
pub const VERSION_NONE: &str = "NONE";

/// Snapshot of firmware versions keyed by component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersions(BTreeMap<FirmwareKind, String>);

impl FirmwareVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: FirmwareKind, version: impl Into<String>) {
        self.0.insert(kind, version.into());
    }

    pub fn get(&self, kind: FirmwareKind) -> Option<&str> {
        self.0.get(&kind).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FirmwareKind, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Components whose version differs between `self` and `after`,
    /// skipping `except`. Returns `(kind, before, after)`.
    pub fn changed_since(
        &self,
        after: &FirmwareVersions,
        except: FirmwareKind,
    ) -> Vec<(FirmwareKind, String, String)> {
        self.iter()
            .filter(|(kind, _)| *kind != except)
            .filter_map(|(kind, before)| {
                let now = after.get(kind).unwrap_or(VERSION_NONE);
                (now != before).then(|| (kind, before.to_owned(), now.to_owned()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_type_parses_case_insensitively() {
        assert_eq!("Linux".parse::<OsType>().unwrap(), OsType::Linux);
        assert_eq!(" WINDOWS ".parse::<OsType>().unwrap(), OsType::Windows);
        assert_eq!("vmware".parse::<OsType>().unwrap(), OsType::Esxi);
        assert!("solaris".parse::<OsType>().is_err());
    }

    #[test]
    fn os_type_serde_lowercase() {
        let json = serde_json::to_string(&OsType::Windows).unwrap();
        assert_eq!(json, "\"windows\"");
    }

    #[test]
    fn ensure_success_passes_zero_exit() {
        let out = CommandOutput::ok("lsmod", "ice 123 0");
        assert!(out.ensure_success().is_ok());
    }

    #[test]
    fn ensure_success_maps_non_zero_exit() {
        let out = CommandOutput {
            command: "rmmod ice".to_owned(),
            stdout: String::new(),
            stderr: "rmmod: ERROR: Module ice is in use\n".to_owned(),
            exit_code: 1,
            duration: Duration::from_millis(20),
        };
        match out.ensure_success() {
            Err(ExecError::NonZeroExit {
                command,
                code,
                stderr,
            }) => {
                assert_eq!(command, "rmmod ice");
                assert_eq!(code, 1);
                assert_eq!(stderr, "rmmod: ERROR: Module ice is in use");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn text_falls_back_to_stderr() {
        let out = CommandOutput {
            command: "x".to_owned(),
            stdout: "  \n".to_owned(),
            stderr: "only stderr".to_owned(),
            exit_code: 0,
            duration: Duration::ZERO,
        };
        assert_eq!(out.text(), "only stderr");
    }

    #[test]
    fn lines_skip_blank() {
        let out = CommandOutput::ok("x", "a\n\n  b  \n");
        assert_eq!(out.lines().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn command_output_serializes_duration_as_millis() {
        let mut out = CommandOutput::ok("x", "");
        out.duration = Duration::from_millis(1500);
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["duration"], 1500);
    }

    #[test]
    fn verdict_exit_codes_are_stable() {
        assert_eq!(Verdict::Pass.exit_code(), 0);
        assert_eq!(Verdict::Fail.exit_code(), 1);
        assert_eq!(Verdict::Error.exit_code(), 2);
        assert_eq!(Verdict::NotApplicable.exit_code(), 3);
        assert_eq!(Verdict::Unsupported.exit_code(), 4);
        assert_eq!(Verdict::NotImplemented.exit_code(), 5);
    }

    #[test]
    fn firmware_kind_aliases() {
        assert_eq!("ME".parse::<FirmwareKind>().unwrap(), FirmwareKind::Sps);
        assert_eq!(
            "microcode".parse::<FirmwareKind>().unwrap(),
            FirmwareKind::Ucode
        );
        assert_eq!(FirmwareKind::Sps.to_string(), "sps");
    }

    #[test]
    fn changed_since_ignores_target_kind() {
        let mut before = FirmwareVersions::new();
        before.insert(FirmwareKind::Bios, "EGSDCRB1.SYS.0090");
        before.insert(FirmwareKind::Sps, "4.4.4.300");
        before.insert(FirmwareKind::Ucode, "0x8d000360");

        let mut after = before.clone();
        after.insert(FirmwareKind::Bios, "EGSDCRB1.SYS.0091");
        assert!(before.changed_since(&after, FirmwareKind::Bios).is_empty());

        after.insert(FirmwareKind::Ucode, "0x8d000370");
        let changed = before.changed_since(&after, FirmwareKind::Bios);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0, FirmwareKind::Ucode);
        assert_eq!(changed[0].2, "0x8d000370");
    }

    #[test]
    fn changed_since_reports_missing_as_none() {
        let mut before = FirmwareVersions::new();
        before.insert(FirmwareKind::Cpld, "1.2");
        let changed = before.changed_since(&FirmwareVersions::new(), FirmwareKind::Bios);
        assert_eq!(changed[0].2, VERSION_NONE);
    }
}
