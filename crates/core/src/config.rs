//! Configuration: `platval.toml` parsing, env overrides and validation.
//!
//! [`PlatvalConfig`] is the top-level structure; every crate reads only the
//! section it needs.
//!
//! # Loading order
//! 1. TOML file
//! 2. Environment variables (`PLATVAL_SUT_HOST=10.0.0.5`)
//! 3. `validate()`
//!
//! Missing sections and fields fall back to their `Default` values.
//!
//! ```no_run
//! # async fn example() -> Result<(), platval_core::error::PlatvalError> {
//! use platval_core::config::PlatvalConfig;
//!
//! let config = PlatvalConfig::load("platval.toml").await?;
//! let config = PlatvalConfig::parse("[sut]\nhost = \"10.0.0.5\"")?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, PlatvalError};
use crate::types::OsType;

/// platval configuration root
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatvalConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    /// Primary system under test
    #[serde(default)]
    pub sut: SutConfig,
    /// Optional peer SUT for two-machine scenarios (iperf, cross ping)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sut2: Option<SutConfig>,
    /// Controlling host
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub bmc: BmcConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub drivers: DriverConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub stress: StressConfig,
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub bios: BiosConfig,
    #[serde(default)]
    pub seamless: SeamlessConfig,
}

impl PlatvalConfig {
    /// Loads the file, applies env overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PlatvalError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads the file without env overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, PlatvalError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PlatvalError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                PlatvalError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(toml_str: &str) -> Result<Self, PlatvalError> {
        toml::from_str(toml_str).map_err(|e| {
            PlatvalError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Env var naming: `PLATVAL_{SECTION}_{FIELD}`.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "PLATVAL_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "PLATVAL_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.report_dir, "PLATVAL_GENERAL_REPORT_DIR");

        // SUT
        override_string(&mut self.sut.host, "PLATVAL_SUT_HOST");
        override_parsed(&mut self.sut.port, "PLATVAL_SUT_PORT");
        override_string(&mut self.sut.user, "PLATVAL_SUT_USER");
        override_string(&mut self.sut.identity_file, "PLATVAL_SUT_IDENTITY_FILE");
        override_parsed(&mut self.sut.os, "PLATVAL_SUT_OS");

        // Host
        override_parsed(&mut self.host.os, "PLATVAL_HOST_OS");
        override_string(&mut self.host.usb_mount_root, "PLATVAL_HOST_USB_MOUNT_ROOT");
        override_string(
            &mut self.host.usb_switch_to_host,
            "PLATVAL_HOST_USB_SWITCH_TO_HOST",
        );
        override_string(
            &mut self.host.usb_switch_to_sut,
            "PLATVAL_HOST_USB_SWITCH_TO_SUT",
        );

        // BMC
        override_string(&mut self.bmc.url, "PLATVAL_BMC_URL");
        override_string(&mut self.bmc.user, "PLATVAL_BMC_USER");
        override_string(&mut self.bmc.password, "PLATVAL_BMC_PASSWORD");
        override_parsed(&mut self.bmc.verify_tls, "PLATVAL_BMC_VERIFY_TLS");
        override_parsed(
            &mut self.bmc.request_timeout_secs,
            "PLATVAL_BMC_REQUEST_TIMEOUT_SECS",
        );

        // Timeouts
        override_parsed(
            &mut self.timeouts.command_secs,
            "PLATVAL_TIMEOUTS_COMMAND_SECS",
        );
        override_parsed(&mut self.timeouts.reboot_secs, "PLATVAL_TIMEOUTS_REBOOT_SECS");
        override_parsed(
            &mut self.timeouts.os_boot_secs,
            "PLATVAL_TIMEOUTS_OS_BOOT_SECS",
        );
        override_parsed(
            &mut self.timeouts.staging_secs,
            "PLATVAL_TIMEOUTS_STAGING_SECS",
        );
        override_parsed(
            &mut self.timeouts.sps_transition_secs,
            "PLATVAL_TIMEOUTS_SPS_TRANSITION_SECS",
        );

        // Drivers
        override_string(&mut self.drivers.sut_dir, "PLATVAL_DRIVERS_SUT_DIR");
        override_string(&mut self.drivers.host_dir, "PLATVAL_DRIVERS_HOST_DIR");

        // Network
        override_string(
            &mut self.network.management_ip_prefix,
            "PLATVAL_NETWORK_MANAGEMENT_IP_PREFIX",
        );
        override_string(
            &mut self.network.static_ip_prefix,
            "PLATVAL_NETWORK_STATIC_IP_PREFIX",
        );
        override_string(&mut self.network.vf_ip_prefix, "PLATVAL_NETWORK_VF_IP_PREFIX");
        override_parsed(&mut self.network.ping_count, "PLATVAL_NETWORK_PING_COUNT");

        // Stress
        override_string(&mut self.stress.tool_dir, "PLATVAL_STRESS_TOOL_DIR");
        override_parsed(
            &mut self.stress.duration_secs,
            "PLATVAL_STRESS_DURATION_SECS",
        );

        // VM
        override_string(&mut self.vm.image_dir, "PLATVAL_VM_IMAGE_DIR");
        override_string(&mut self.vm.bridge, "PLATVAL_VM_BRIDGE");

        // BIOS
        override_string(&mut self.bios.write_command, "PLATVAL_BIOS_WRITE_COMMAND");
        override_string(&mut self.bios.read_command, "PLATVAL_BIOS_READ_COMMAND");

        // Seamless
        override_string(
            &mut self.seamless.workload_command,
            "PLATVAL_SEAMLESS_WORKLOAD_COMMAND",
        );
        override_parsed(
            &mut self.seamless.kpi_staging_secs,
            "PLATVAL_SEAMLESS_KPI_STAGING_SECS",
        );
        override_parsed(
            &mut self.seamless.journal_poll_ms,
            "PLATVAL_SEAMLESS_JOURNAL_POLL_MS",
        );
    }

    pub fn validate(&self) -> Result<(), PlatvalError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        self.sut.validate("sut")?;
        if let Some(sut2) = &self.sut2 {
            sut2.validate("sut2")?;
        }

        if !self.bmc.url.is_empty()
            && !(self.bmc.url.starts_with("https://") || self.bmc.url.starts_with("http://"))
        {
            return Err(invalid("bmc.url", "must start with http:// or https://"));
        }

        let timeouts = [
            ("timeouts.command_secs", self.timeouts.command_secs),
            ("timeouts.reboot_secs", self.timeouts.reboot_secs),
            ("timeouts.os_boot_secs", self.timeouts.os_boot_secs),
            ("timeouts.staging_secs", self.timeouts.staging_secs),
            ("timeouts.sps_transition_secs", self.timeouts.sps_transition_secs),
            ("timeouts.power_poll_secs", self.timeouts.power_poll_secs),
            ("bmc.request_timeout_secs", self.bmc.request_timeout_secs),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(invalid(field, "must be greater than 0"));
            }
        }

        if self.network.ping_count == 0 {
            return Err(invalid("network.ping_count", "must be greater than 0"));
        }

        if self.seamless.journal_poll_ms == 0 {
            return Err(invalid("seamless.journal_poll_ms", "must be greater than 0"));
        }

        if !self.bios.write_command.contains("{knobs}") {
            return Err(invalid(
                "bios.write_command",
                "must contain the {knobs} placeholder",
            ));
        }
        if !self.bios.read_command.contains("{names}") {
            return Err(invalid(
                "bios.read_command",
                "must contain the {names} placeholder",
            ));
        }

        Ok(())
    }

    /// Copy with every settle / pause interval zeroed, for dry runs where
    /// nothing real happens between commands.
    pub fn without_waits(&self) -> Self {
        let mut config = self.clone();
        config.host.usb_settle_secs = 0;
        config.timeouts.shutdown_grace_secs = 0;
        config.network.settle_secs = 0;
        config.stress.kill_pause_secs = 0;
        config.stress.settle_secs = 0;
        config.vm.boot_wait_secs = 0;
        config.seamless.workload_settle_secs = 0;
        config
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> PlatvalError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
    .into()
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// json, pretty
    pub log_format: String,
    /// Directory receiving JSON run reports (empty disables reports)
    pub report_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
            report_dir: String::new(),
        }
    }
}

/// SSH access to a system under test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SutConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key passed to `ssh -i` (empty uses the agent / default keys)
    pub identity_file: String,
    pub os: OsType,
    pub connect_timeout_secs: u64,
}

impl SutConfig {
    fn validate(&self, section: &str) -> Result<(), PlatvalError> {
        if self.host.trim().is_empty() {
            return Err(invalid(&format!("{section}.host"), "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid(&format!("{section}.port"), "must be greater than 0"));
        }
        if self.user.trim().is_empty() {
            return Err(invalid(&format!("{section}.user"), "must not be empty"));
        }
        Ok(())
    }
}

impl Default for SutConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 22,
            user: "root".to_owned(),
            identity_file: String::new(),
            os: OsType::Linux,
            connect_timeout_secs: 10,
        }
    }
}

/// Controlling host settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub os: OsType,
    /// Where hot-plugged USB drives get mounted on a Linux host
    pub usb_mount_root: String,
    /// Host command routing the shared USB drive to the host (empty: no switch)
    pub usb_switch_to_host: String,
    /// Host command routing the shared USB drive to the SUT
    pub usb_switch_to_sut: String,
    /// Wait after switching the drive before it is used
    pub usb_settle_secs: u64,
}

impl HostConfig {
    pub fn has_usb_switch(&self) -> bool {
        !self.usb_switch_to_host.is_empty() && !self.usb_switch_to_sut.is_empty()
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            os: OsType::host(),
            usb_mount_root: "/media".to_owned(),
            usb_switch_to_host: String::new(),
            usb_switch_to_sut: String::new(),
            usb_settle_secs: 15,
        }
    }
}

/// Redfish access to the BMC
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BmcConfig {
    /// Base URL, e.g. `https://10.0.0.6` (empty: no BMC)
    pub url: String,
    pub user: String,
    pub password: String,
    pub verify_tls: bool,
    pub request_timeout_secs: u64,
}

impl BmcConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }

    /// Copy with the password blanked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.password.is_empty() {
            copy.password = "***REDACTED***".to_owned();
        }
        copy
    }
}

impl fmt::Debug for BmcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BmcConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"***")
            .field("verify_tls", &self.verify_tls)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: "root".to_owned(),
            password: String::new(),
            verify_tls: false,
            request_timeout_secs: 60,
        }
    }
}

/// Timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default per-command timeout
    pub command_secs: u64,
    pub reboot_secs: u64,
    pub os_boot_secs: u64,
    /// Capsule staging wait
    pub staging_secs: u64,
    /// SPS version transition wait after activation
    pub sps_transition_secs: u64,
    /// Interval between OS liveness checks
    pub power_poll_secs: u64,
    /// Pause after issuing a reset before probing the OS
    pub shutdown_grace_secs: u64,
}

impl TimeoutConfig {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn os_boot(&self) -> Duration {
        Duration::from_secs(self.os_boot_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: 60,
            reboot_secs: 900,
            os_boot_secs: 600,
            staging_secs: 1800,
            sps_transition_secs: 600,
            power_poll_secs: 5,
            shutdown_grace_secs: 30,
        }
    }
}

/// Driver collateral locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Directory on the SUT holding driver archives / inf trees
    pub sut_dir: String,
    /// Directory on the host holding driver archives to ferry over USB
    pub host_dir: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            sut_dir: "/root/drivers".to_owned(),
            host_dir: "collateral/drivers".to_owned(),
        }
    }
}

/// Addressing and timing for network scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address prefix of the management network carrying the SUT's own IP
    pub management_ip_prefix: String,
    /// Physical interface `i` gets `{static_ip_prefix}{i}`
    pub static_ip_prefix: String,
    /// Virtual function `i` gets `{vf_ip_prefix}{i}`
    pub vf_ip_prefix: String,
    pub netmask: String,
    pub ping_count: u32,
    /// Wait after toggling an adapter or creating VFs
    pub settle_secs: u64,
    pub iperf_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            management_ip_prefix: "192.".to_owned(),
            static_ip_prefix: "10.10.10.1".to_owned(),
            vf_ip_prefix: "20.20.20.2".to_owned(),
            netmask: "255.255.255.0".to_owned(),
            ping_count: 4,
            settle_secs: 30,
            iperf_secs: 60,
        }
    }
}

/// Stress tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    /// Directory on the SUT containing `stressapptest`
    pub tool_dir: String,
    pub duration_secs: u64,
    pub kill_retries: u32,
    pub kill_pause_secs: u64,
    /// Wait after spawning a detached stress tool before checking it runs
    pub settle_secs: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            tool_dir: "/root/stressapptest".to_owned(),
            duration_secs: 60,
            kill_retries: 5,
            kill_pause_secs: 5,
            settle_secs: 10,
        }
    }
}

/// Guest provisioning defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Directory on the SUT holding guest base images
    pub image_dir: String,
    pub pool_name: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub bridge: String,
    pub os_variant: String,
    pub boot_wait_secs: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            image_dir: "/var/lib/libvirt/images".to_owned(),
            pool_name: "platval_pool".to_owned(),
            memory_mb: 4096,
            vcpus: 2,
            bridge: "virbr0".to_owned(),
            os_variant: "rhel8.0".to_owned(),
            boot_wait_secs: 300,
        }
    }
}

/// BIOS knob utility command templates, run on the SUT
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiosConfig {
    /// `{knobs}` receives `Name=Value,Name=Value`
    pub write_command: String,
    /// `{names}` receives `Name,Name`
    pub read_command: String,
    pub command_timeout_secs: u64,
}

impl Default for BiosConfig {
    fn default() -> Self {
        Self {
            write_command: "xmlcli setknobs \"{knobs}\"".to_owned(),
            read_command: "xmlcli readknobs \"{names}\"".to_owned(),
            command_timeout_secs: 300,
        }
    }
}

/// Seamless capsule update settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeamlessConfig {
    /// Background workload started with `--start-workload`
    pub workload_command: String,
    pub workload_stop_command: String,
    /// Wait for the workload to stabilise before staging
    pub workload_settle_secs: u64,
    /// Staging longer than this marks the KPI as failed
    pub kpi_staging_secs: u64,
    /// SPS activation longer than this marks the KPI as failed
    pub kpi_sps_activation_secs: u64,
    pub journal_poll_ms: u64,
}

impl Default for SeamlessConfig {
    fn default() -> Self {
        Self {
            workload_command: "fio --name=seamless --rw=randrw --size=1G --time_based --runtime=3600"
                .to_owned(),
            workload_stop_command: "killall fio".to_owned(),
            workload_settle_secs: 120,
            kpi_staging_secs: 300,
            kpi_sps_activation_secs: 10,
            journal_poll_ms: 1000,
        }
    }
}

// --- env override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parsed<T: FromStr>(target: &mut T, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = std::any::type_name::<T>(),
                "failed to parse env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_has_sane_values() {
        let config = PlatvalConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.sut.port, 22);
        assert_eq!(config.sut.os, OsType::Linux);
        assert!(config.sut2.is_none());
        assert!(!config.bmc.is_configured());
        assert_eq!(config.seamless.kpi_staging_secs, 300);
        assert_eq!(config.seamless.kpi_sps_activation_secs, 10);
    }

    #[test]
    fn default_config_passes_validation() {
        PlatvalConfig::default().validate().unwrap();
    }

    #[test]
    fn parse_empty_toml_uses_defaults() {
        let config = PlatvalConfig::parse("").unwrap();
        assert_eq!(config.network.static_ip_prefix, "10.10.10.1");
        assert_eq!(config.stress.kill_retries, 5);
    }

    #[test]
    fn parse_partial_toml_merges_with_defaults() {
        let toml = r#"
[sut]
host = "10.20.30.40"
os = "windows"

[sut2]
host = "10.20.30.41"
"#;
        let config = PlatvalConfig::parse(toml).unwrap();
        assert_eq!(config.sut.host, "10.20.30.40");
        assert_eq!(config.sut.os, OsType::Windows);
        assert_eq!(config.sut.user, "root");
        let sut2 = config.sut2.unwrap();
        assert_eq!(sut2.host, "10.20.30.41");
        assert_eq!(sut2.os, OsType::Linux);
    }

    #[test]
    fn parse_invalid_toml_returns_parse_error() {
        let err = PlatvalConfig::parse("[sut\nhost=").unwrap_err();
        assert!(matches!(
            err,
            PlatvalError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn parse_rejects_unknown_os() {
        let err = PlatvalConfig::parse("[sut]\nos = \"beos\"").unwrap_err();
        assert!(matches!(
            err,
            PlatvalError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = PlatvalConfig::default();
        config.general.log_level = "verbose".to_owned();
        assert!(config.validate().unwrap_err().to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_empty_sut_host() {
        let mut config = PlatvalConfig::default();
        config.sut.host = "  ".to_owned();
        assert!(config.validate().unwrap_err().to_string().contains("sut.host"));
    }

    #[test]
    fn validate_rejects_empty_sut2_host() {
        let mut config = PlatvalConfig::default();
        config.sut2 = Some(SutConfig {
            host: String::new(),
            ..SutConfig::default()
        });
        assert!(config.validate().unwrap_err().to_string().contains("sut2.host"));
    }

    #[test]
    fn validate_rejects_non_http_bmc_url() {
        let mut config = PlatvalConfig::default();
        config.bmc.url = "10.0.0.6".to_owned();
        assert!(config.validate().unwrap_err().to_string().contains("bmc.url"));

        config.bmc.url = "https://10.0.0.6".to_owned();
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut config = PlatvalConfig::default();
        config.timeouts.staging_secs = 0;
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("timeouts.staging_secs")
        );
    }

    #[test]
    fn validate_requires_knobs_placeholder() {
        let mut config = PlatvalConfig::default();
        config.bios.write_command = "xmlcli setknobs".to_owned();
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("bios.write_command")
        );
    }

    #[test]
    fn validate_requires_names_placeholder() {
        let mut config = PlatvalConfig::default();
        config.bios.read_command = "xmlcli readknobs".to_owned();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("bios.read_command"), "{err}");
        assert!(err.contains("{names}"), "{err}");
    }

    #[test]
    fn validate_rejects_zero_bmc_request_timeout() {
        let mut config = PlatvalConfig::default();
        config.bmc.request_timeout_secs = 0;
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("bmc.request_timeout_secs")
        );
    }

    #[test]
    fn without_waits_zeroes_settle_times_only() {
        let config = PlatvalConfig::default().without_waits();
        assert_eq!(config.network.settle_secs, 0);
        assert_eq!(config.seamless.workload_settle_secs, 0);
        assert_eq!(config.stress.kill_pause_secs, 0);
        assert_eq!(config.timeouts.command_secs, 60);
        config.validate().unwrap();
    }

    #[test]
    fn usb_switch_needs_both_commands() {
        let mut host = HostConfig::default();
        assert!(!host.has_usb_switch());
        host.usb_switch_to_host = "usbswitch --host".to_owned();
        assert!(!host.has_usb_switch());
        host.usb_switch_to_sut = "usbswitch --sut".to_owned();
        assert!(host.has_usb_switch());
    }

    #[test]
    fn bmc_debug_hides_password() {
        let bmc = BmcConfig {
            password: "hunter2".to_owned(),
            ..BmcConfig::default()
        };
        let debug = format!("{bmc:?}");
        assert!(!debug.contains("hunter2"));
        assert_eq!(bmc.redacted().password, "***REDACTED***");
    }

    #[test]
    #[serial]
    fn env_override_string() {
        let mut val = "original".to_owned();
        // SAFETY: serialised with other env-mutating tests.
        unsafe { std::env::set_var("TEST_PLATVAL_STR", "overridden") };
        override_string(&mut val, "TEST_PLATVAL_STR");
        assert_eq!(val, "overridden");
        unsafe { std::env::remove_var("TEST_PLATVAL_STR") };
    }

    #[test]
    #[serial]
    fn env_override_parsed_invalid_keeps_original() {
        let mut port: u16 = 22;
        // SAFETY: serialised with other env-mutating tests.
        unsafe { std::env::set_var("TEST_PLATVAL_PORT", "not-a-port") };
        override_parsed(&mut port, "TEST_PLATVAL_PORT");
        assert_eq!(port, 22);
        unsafe { std::env::remove_var("TEST_PLATVAL_PORT") };
    }

    #[test]
    #[serial]
    fn env_override_applies_os_type() {
        let mut config = PlatvalConfig::default();
        // SAFETY: serialised with other env-mutating tests.
        unsafe { std::env::set_var("PLATVAL_SUT_OS", "Windows") };
        config.apply_env_overrides();
        unsafe { std::env::remove_var("PLATVAL_SUT_OS") };
        assert_eq!(config.sut.os, OsType::Windows);
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = "original".to_owned();
        override_string(&mut val, "TEST_PLATVAL_NONEXISTENT_12345");
        assert_eq!(val, "original");
    }

    #[test]
    fn config_serialize_roundtrip() {
        let mut config = PlatvalConfig::default();
        config.sut2 = Some(SutConfig::default());
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = PlatvalConfig::parse(&toml_str).unwrap();
        assert_eq!(parsed.sut.host, config.sut.host);
        assert!(parsed.sut2.is_some());
        assert_eq!(parsed.vm.pool_name, "platval_pool");
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let err = PlatvalConfig::from_file("/nonexistent/path/platval.toml")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PlatvalError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
