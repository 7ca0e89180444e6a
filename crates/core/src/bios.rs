//! BIOS knob files and the knob utility running on the SUT.
//!
//! Knob files (`.cfg`) look like:
//!
//! ```text
//! [BiosKnobs]
//! ; comment
//! VTdSupport = 0x1
//! ProcessorVmxEnable=1
//! ```
//!
//! Decimal values are kept as written. Hex values are canonicalised to
//! lower case without leading zeros (`0x01` and `0X1` both become `0x1`).
//! [`KnobSet::mismatches`] compares a hex value and a decimal value by
//! number, so `1` in a file matches `0x1` in a read-back.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::BiosConfig;
use crate::error::{KnobError, PlatvalError, TestError};
use crate::exec::SutExecutor;

/// Ordered set of BIOS knob assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KnobSet {
    knobs: Vec<(String, String)>,
}

/// One knob whose read-back value differs from the requested one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnobMismatch {
    pub name: String,
    pub expected: String,
    /// `None` when the knob was absent from the read-back
    pub actual: Option<String>,
}

impl KnobSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `.cfg` knob file. Later duplicates replace earlier ones.
    pub fn parse(text: &str) -> Result<Self, KnobError> {
        let mut set = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with(';')
                || (line.starts_with('[') && line.ends_with(']'))
            {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                return Err(KnobError::Parse {
                    line: idx + 1,
                    reason: format!("expected 'Name = Value', got '{line}'"),
                });
            };
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(KnobError::Parse {
                    line: idx + 1,
                    reason: format!("invalid knob name '{name}'"),
                });
            }
            if value.is_empty() {
                return Err(KnobError::Parse {
                    line: idx + 1,
                    reason: format!("knob '{name}' has no value"),
                });
            }
            set.insert(name, value);
        }
        Ok(set)
    }

    /// Parses a comma separated `Name=Value, Name=Value` list.
    pub fn parse_inline(text: &str) -> Result<Self, KnobError> {
        Self::parse(&text.replace(',', "\n"))
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, PlatvalError> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(Self::parse(&text)?)
    }

    /// Parses knob utility read-back output.
    ///
    /// Accepts `Name | Value` and `Name = Value` lines; everything else
    /// (banners, separators) is skipped.
    pub fn parse_readback(text: &str) -> Self {
        let mut set = Self::new();
        for line in text.lines() {
            let line = line.trim();
            let pair = line.split_once('|').or_else(|| line.split_once('='));
            let Some((name, value)) = pair else {
                continue;
            };
            let name = name.trim();
            let value = value.trim().trim_matches('|').trim();
            if name.is_empty()
                || value.is_empty()
                || name.contains(char::is_whitespace)
                || name.chars().all(|c| c == '-' || c == '=')
            {
                continue;
            }
            set.insert(name, value);
        }
        set
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        let value = normalize_value(value);
        match self.knobs.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.knobs.push((name.to_owned(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.knobs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.knobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.knobs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.knobs.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.knobs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// `Name=Value,Name=Value` as the knob utility expects it.
    pub fn to_inline(&self) -> String {
        self.iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Knobs of `self` whose value in `actual` differs or is missing.
    pub fn mismatches(&self, actual: &KnobSet) -> Vec<KnobMismatch> {
        self.iter()
            .filter_map(|(name, expected)| match actual.get(name) {
                Some(value) if values_match(expected, value) => None,
                other => Some(KnobMismatch {
                    name: name.to_owned(),
                    expected: expected.to_owned(),
                    actual: other.map(str::to_owned),
                }),
            })
            .collect()
    }
}

fn hex_digits(value: &str) -> Option<&str> {
    value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))
}

fn normalize_value(value: &str) -> String {
    let value = value.trim();
    match hex_digits(value).and_then(|digits| u64::from_str_radix(digits, 16).ok()) {
        Some(n) => format!("0x{n:x}"),
        None => value.to_owned(),
    }
}

fn numeric_value(value: &str) -> Option<u64> {
    match hex_digits(value) {
        Some(digits) => u64::from_str_radix(digits, 16).ok(),
        None if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => value.parse().ok(),
        None => None,
    }
}

fn values_match(expected: &str, actual: &str) -> bool {
    if expected == actual {
        return true;
    }
    match (numeric_value(expected), numeric_value(actual)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Drives the BIOS knob utility on the SUT.
pub struct BiosKnobTool {
    executor: Arc<dyn SutExecutor>,
    write_command: String,
    read_command: String,
    timeout: Duration,
}

impl BiosKnobTool {
    pub fn new(executor: Arc<dyn SutExecutor>, config: &BiosConfig) -> Result<Self, KnobError> {
        if !config.write_command.contains("{knobs}") {
            return Err(KnobError::Template {
                template: config.write_command.clone(),
                placeholder: "{knobs}",
            });
        }
        if !config.read_command.contains("{names}") {
            return Err(KnobError::Template {
                template: config.read_command.clone(),
                placeholder: "{names}",
            });
        }
        Ok(Self {
            executor,
            write_command: config.write_command.clone(),
            read_command: config.read_command.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
        })
    }

    /// Writes the knobs. They take effect after the next reset.
    pub async fn apply(&self, knobs: &KnobSet) -> Result<(), PlatvalError> {
        if knobs.is_empty() {
            return Ok(());
        }
        let command = self.write_command.replace("{knobs}", &knobs.to_inline());
        info!(count = knobs.len(), "writing bios knobs");
        self.executor.execute_checked(&command, self.timeout).await?;
        Ok(())
    }

    /// Reads the current value of the given knobs.
    pub async fn read<'a>(
        &self,
        names: impl Iterator<Item = &'a str>,
    ) -> Result<KnobSet, PlatvalError> {
        let names = names.collect::<Vec<_>>().join(",");
        let command = self.read_command.replace("{names}", &names);
        let out = self.executor.execute_checked(&command, self.timeout).await?;
        Ok(KnobSet::parse_readback(&out.stdout))
    }

    /// Reads back `expected` and fails listing every mismatching knob.
    pub async fn verify(&self, expected: &KnobSet) -> Result<(), PlatvalError> {
        let actual = self.read(expected.names()).await?;
        let mismatches = expected.mismatches(&actual);
        if mismatches.is_empty() {
            info!(count = expected.len(), "bios knobs verified");
            return Ok(());
        }
        let detail = mismatches
            .iter()
            .map(|m| {
                format!(
                    "{}: expected {}, got {}",
                    m.name,
                    m.expected,
                    m.actual.as_deref().unwrap_or("<missing>")
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        warn!(%detail, "bios knob mismatch");
        Err(TestError::Fail(format!("bios knob mismatch: {detail}")).into())
    }
}
