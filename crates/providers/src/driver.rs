//! NIC driver install / uninstall / identification.
//!
//! On Linux a driver is addressed by its module code (`ice`, `i40e`,
//! `igc`); on Windows by its `.inf` file plus the PCI device id. The
//! [`DriverProvider`] methods take `(code, name)` and each implementation
//! reads them accordingly:
//!
//! | OS      | `code`       | `name`            |
//! |---------|--------------|-------------------|
//! | Linux   | module code  | NIC model name    |
//! | Windows | `.inf` file  | device id         |

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use platval_core::config::{DriverConfig, PlatvalConfig};
use platval_core::error::{PlatvalError, TestError};
use platval_core::exec::{BoxFuture, SutExecutor};
use platval_core::types::OsType;

use crate::error::ProviderError;
use crate::usb::{self, HostUsbDriveProvider, UsbSwitch, LSBLK_USB_COMMAND};

// ─── NIC models ──────────────────────────────────────────────────────

/// One supported NIC family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NicModel {
    pub name: &'static str,
    /// Linux kernel module
    pub driver_code: &'static str,
    /// PCI device id as it appears in Windows hardware ids
    pub device_id: &'static str,
    /// Needs an SFP loopback plug for link tests
    pub sfp_loopback: bool,
}

pub const NIC_MODELS: &[NicModel] = &[
    NicModel {
        name: "jacksonville",
        driver_code: "igc",
        device_id: "DEV_15F4",
        sfp_loopback: false,
    },
    NicModel {
        name: "foxville",
        driver_code: "igc",
        device_id: "DEV_15F2",
        sfp_loopback: false,
    },
    NicModel {
        name: "fortville",
        driver_code: "i40e",
        device_id: "DEV_1583",
        sfp_loopback: true,
    },
    NicModel {
        name: "carlsville",
        driver_code: "i40e",
        device_id: "DEV_15FF",
        sfp_loopback: false,
    },
    NicModel {
        name: "columbiaville",
        driver_code: "ice",
        device_id: "DEV_1593",
        sfp_loopback: true,
    },
];

impl NicModel {
    /// Case-insensitive lookup by model name.
    pub fn lookup(name: &str) -> Result<&'static NicModel, ProviderError> {
        NIC_MODELS
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| ProviderError::UnknownNicModel(name.to_owned()))
    }

    pub fn names() -> Vec<&'static str> {
        NIC_MODELS.iter().map(|m| m.name).collect()
    }
}

/// `lspci` line filter for controllers of a driver family.
fn controller_pattern(driver_code: &str) -> &'static str {
    match driver_code {
        "i40e" => r".*\sEthernet\sController\s.*710.*",
        "ice" => r".*\sEthernet\sController\sE810-C.*",
        "igc" => r".*\sEthernet\sController\sI22[56].*",
        _ => ".*",
    }
}

// ─── trait ───────────────────────────────────────────────────────────

pub trait DriverProvider: Send + Sync {
    /// Installs the driver unless it is already present, then verifies.
    fn install_driver<'a>(
        &'a self,
        code: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// Removes the driver; fails when it is still present afterwards.
    fn uninstall_driver<'a>(
        &'a self,
        code: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// Loads an installed driver and verifies it is active.
    fn load_driver<'a>(
        &'a self,
        code: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// `Some(handle)` when the driver is installed. The handle is the module
    /// code on Linux and the published `oemNN.inf` name on Windows.
    fn is_driver_installed<'a>(
        &'a self,
        code: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, PlatvalError>>;

    /// Builds and installs the driver from a source archive already on
    /// the SUT.
    fn install_from_source<'a>(
        &'a self,
        code: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// Ethernet controller lines as reported by the SUT.
    fn get_ethernet_devices(&self) -> BoxFuture<'_, Result<Vec<String>, PlatvalError>>;

    /// Verifies that every controller of the family is bound to `code`.
    /// Returns the PCI addresses of the verified controllers.
    fn identify_device_controller<'a>(
        &'a self,
        devices: &'a [String],
        code: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, PlatvalError>>;

    /// Ferries a driver archive through the shared USB drive into the
    /// driver directory on the SUT.
    fn copy_driver_files<'a>(
        &'a self,
        usb: &'a dyn HostUsbDriveProvider,
        switch: &'a dyn UsbSwitch,
        archive: &'a Path,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;
}

// ─── Linux ───────────────────────────────────────────────────────────

/// Mount point used for the shared drive on a Linux SUT.
pub const SUT_USB_MOUNT: &str = "/mnt/platval-usb";

pub struct LinuxDriverProvider {
    executor: Arc<dyn SutExecutor>,
    sut_dir: String,
    timeout: Duration,
    kernel_driver: Regex,
}

impl LinuxDriverProvider {
    pub fn new(
        executor: Arc<dyn SutExecutor>,
        config: &DriverConfig,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            executor,
            sut_dir: config.sut_dir.trim_end_matches('/').to_owned(),
            timeout,
            kernel_driver: Regex::new(r"Kernel driver in use:\s*(\S+)")?,
        })
    }

    async fn lsmod_lists(&self, code: &str) -> Result<bool, PlatvalError> {
        let out = self
            .executor
            .execute(&format!("lsmod | grep {code}"), self.timeout)
            .await?;
        Ok(out
            .lines()
            .any(|line| line.split_whitespace().next() == Some(code)))
    }

    /// Device node of the shared drive as the SUT sees it.
    async fn find_sut_usb(&self, serial: Option<&str>) -> Result<usb::UsbDrive, PlatvalError> {
        let out = self
            .executor
            .execute_checked(LSBLK_USB_COMMAND, self.timeout)
            .await?;
        let mut drives = usb::parse_lsblk(&out.stdout);
        if let Some(serial) = serial {
            drives.retain(|d| d.serial.as_deref() == Some(serial));
        }
        match drives.len() {
            1 => Ok(drives.remove(0)),
            0 => Err(TestError::Fail("usb drive is not detected on the sut".to_owned()).into()),
            n => Err(TestError::Setup(format!(
                "{n} usb drives are attached to the sut, cannot tell which one to use"
            ))
            .into()),
        }
    }
}

impl DriverProvider for LinuxDriverProvider {
    fn install_driver<'a>(
        &'a self,
        code: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            if !self.lsmod_lists(code).await? {
                info!(driver = code, name, "installing driver");
                self.executor
                    .execute_checked(&format!("modprobe {code}"), self.timeout)
                    .await?;
            }
            self.load_driver(code, name).await
        })
    }

    fn uninstall_driver<'a>(
        &'a self,
        code: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            info!(driver = code, name, "uninstalling driver");
            self.executor
                .execute(&format!("rmmod {code}"), self.timeout)
                .await?;
            if self.lsmod_lists(code).await? {
                return Err(TestError::Fail(format!("{name} driver is not uninstalled properly")).into());
            }
            info!(driver = code, "driver uninstalled");
            Ok(())
        })
    }

    fn load_driver<'a>(
        &'a self,
        code: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            if !self.lsmod_lists(code).await? {
                self.executor
                    .execute_checked(&format!("modprobe {code}"), self.timeout)
                    .await?;
            }
            if !self.lsmod_lists(code).await? {
                return Err(TestError::Fail(format!("{name} driver is not loaded")).into());
            }
            info!(driver = code, name, "driver loaded");
            Ok(())
        })
    }

    fn is_driver_installed<'a>(
        &'a self,
        code: &'a str,
        _name: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, PlatvalError>> {
        Box::pin(async move {
            Ok(self
                .lsmod_lists(code)
                .await?
                .then(|| code.to_owned()))
        })
    }

    fn install_from_source<'a>(
        &'a self,
        code: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let find = format!("find {} -type f -name '{code}*.tar.gz'", self.sut_dir);
            let out = self.executor.execute_checked(&find, self.timeout).await?;
            let Some(archive) = out.lines().last().map(str::to_owned) else {
                return Err(TestError::Fail(format!("could not find {code} sources on the sut")).into());
            };
            let parent = archive
                .rsplit_once('/')
                .map_or(self.sut_dir.as_str(), |(dir, _)| dir);
            let source_dir = archive.trim_end_matches(".tar.gz");
            debug!(%archive, source_dir, "unpacking driver sources");
            self.executor
                .execute_checked(&format!("tar -xvf {archive} -C {parent}"), self.timeout)
                .await?;

            let build_dir = format!("{source_dir}/src");
            info!(driver = code, %build_dir, "building driver");
            let out = self
                .executor
                .execute_in("make install", &build_dir, self.timeout * 10)
                .await?
                .ensure_success()?;
            if out.text().trim().is_empty() {
                return Err(ProviderError::unexpected("make install", "no build output").into());
            }
            self.load_driver(code, name).await
        })
    }

    fn get_ethernet_devices(&self) -> BoxFuture<'_, Result<Vec<String>, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute("lspci | grep Ethernet", self.timeout)
                .await?;
            let devices: Vec<String> = out.lines().map(str::to_owned).collect();
            if devices.is_empty() {
                return Err(TestError::Fail("no ethernet devices found on the sut".to_owned()).into());
            }
            debug!(count = devices.len(), "ethernet devices");
            Ok(devices)
        })
    }

    fn identify_device_controller<'a>(
        &'a self,
        devices: &'a [String],
        code: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, PlatvalError>> {
        Box::pin(async move {
            let filter = Regex::new(controller_pattern(code)).map_err(ProviderError::from)?;
            let bdfs: Vec<&str> = devices
                .iter()
                .filter(|d| filter.is_match(d))
                .filter_map(|d| d.split_whitespace().next())
                .collect();
            if bdfs.is_empty() {
                return Err(TestError::Fail(format!("no controller for the {code} driver")).into());
            }

            for bdf in &bdfs {
                let command = format!("lspci -s {bdf} -vvv");
                let out = self.executor.execute_checked(&command, self.timeout).await?;
                let in_use = self
                    .kernel_driver
                    .captures(&out.stdout)
                    .map(|c| c[1].to_owned())
                    .ok_or_else(|| ProviderError::unexpected(&command, "no 'Kernel driver in use' line"))?;
                if in_use != code {
                    return Err(TestError::Fail(format!(
                        "controller {bdf} uses the {in_use} driver, expected {code}"
                    ))
                    .into());
                }
                debug!(bdf, driver = code, "controller bound");
            }
            info!(count = bdfs.len(), driver = code, "controllers identified");
            Ok(bdfs.into_iter().map(str::to_owned).collect())
        })
    }

    fn copy_driver_files<'a>(
        &'a self,
        host_usb: &'a dyn HostUsbDriveProvider,
        switch: &'a dyn UsbSwitch,
        archive: &'a Path,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let staged = usb::stage_archive_for_sut(host_usb, switch, archive).await?;
            let drive = self.find_sut_usb(staged.serial.as_deref()).await?;
            let mount = if drive.mount_point.is_empty() {
                self.executor
                    .execute_checked(
                        &format!("mkdir -p {SUT_USB_MOUNT} && mount {} {SUT_USB_MOUNT}", drive.device),
                        self.timeout,
                    )
                    .await?;
                SUT_USB_MOUNT.to_owned()
            } else {
                drive.mount_point
            };
            self.executor
                .execute_checked(
                    &format!("mkdir -p {dir} && cp -rf '{mount}'/* {dir}/", dir = self.sut_dir),
                    self.timeout * 4,
                )
                .await?;
            info!(source = %mount, destination = %self.sut_dir, "driver files copied to the sut");
            Ok(())
        })
    }
}

// ─── Windows ─────────────────────────────────────────────────────────

/// One block of `pnputil /enum-drivers` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverPackage {
    pub published_name: String,
    pub original_name: String,
    pub provider: String,
    pub version: String,
}

/// Splits `pnputil /enum-drivers` output into packages. A package starts
/// at each `Published Name` line.
pub fn parse_pnputil_drivers(output: &str) -> Vec<DriverPackage> {
    let mut packages: Vec<DriverPackage> = Vec::new();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_owned();
        match key.trim() {
            "Published Name" => packages.push(DriverPackage {
                published_name: value,
                ..DriverPackage::default()
            }),
            "Original Name" => {
                if let Some(p) = packages.last_mut() {
                    p.original_name = value;
                }
            }
            "Provider Name" => {
                if let Some(p) = packages.last_mut() {
                    p.provider = value;
                }
            }
            "Driver Version" => {
                if let Some(p) = packages.last_mut() {
                    p.version = value;
                }
            }
            _ => {}
        }
    }
    packages
}

pub struct WindowsDriverProvider {
    executor: Arc<dyn SutExecutor>,
    timeout: Duration,
    removable_disk: Regex,
}

impl WindowsDriverProvider {
    pub fn new(executor: Arc<dyn SutExecutor>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            executor,
            timeout,
            removable_disk: usb::removable_disk_pattern()?,
        })
    }

    async fn device_present(&self, device_id: &str) -> Result<bool, PlatvalError> {
        let command = format!("wmic path Win32_PnpEntity where \"DeviceID like '%{device_id}%'\" get DeviceID");
        let out = self.executor.execute_checked(&command, self.timeout).await?;
        Ok(out.stdout.contains(device_id))
    }
}

impl DriverProvider for WindowsDriverProvider {
    fn install_driver<'a>(
        &'a self,
        inf: &'a str,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            if self.is_driver_installed(inf, device_id).await?.is_some() {
                info!(inf, "driver already installed");
                return Ok(());
            }
            if !self.device_present(device_id).await? {
                return Err(TestError::NotApplicable(format!(
                    "device {device_id} is not present on the sut"
                ))
                .into());
            }

            let out = self
                .executor
                .execute_checked(usb::WMIC_REMOVABLE_COMMAND, self.timeout)
                .await?;
            let Some(drive) = self.removable_disk.captures(&out.stdout).map(|c| c[1].to_owned()) else {
                return Err(TestError::Fail("usb drive is not detected on the sut".to_owned()).into());
            };
            debug!(%drive, "usb drive on the sut");

            let search = format!(
                "powershell.exe \"(Get-ChildItem '{drive}\\' -File -Filter {inf} -Recurse).FullName\""
            );
            let out = self.executor.execute_checked(&search, self.timeout).await?;
            let Some(path) = out.lines().next().map(str::to_owned) else {
                return Err(TestError::Fail(format!("{inf} not found on drive {drive}")).into());
            };

            info!(inf = %path, "installing driver package");
            self.executor
                .execute_checked(&format!("pnputil /add-driver \"{path}\" /install"), self.timeout)
                .await?;
            if self.is_driver_installed(inf, device_id).await?.is_none() {
                return Err(TestError::Fail(format!("{inf} is not listed after installation")).into());
            }
            Ok(())
        })
    }

    fn uninstall_driver<'a>(
        &'a self,
        inf: &'a str,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let Some(oem) = self.is_driver_installed(inf, device_id).await? else {
                return Err(TestError::Fail(format!("{inf} is not installed as expected")).into());
            };
            info!(inf, %oem, device_id, "removing device driver");
            let out = self
                .executor
                .execute_checked(&format!("devcon /r remove =net *{device_id}*"), self.timeout)
                .await?;
            debug!(output = %out.stdout, "devcon remove");
            self.executor
                .execute_checked(&format!("pnputil /delete-driver {oem} /uninstall /force"), self.timeout)
                .await?;
            // brings the device node back without a driver so a reinstall finds it
            self.executor.execute_checked("devcon rescan", self.timeout).await?;
            if self.is_driver_installed(inf, device_id).await?.is_some() {
                return Err(TestError::Fail(format!("{inf} is still listed after uninstall")).into());
            }
            info!(inf, %oem, "driver package deleted");
            Ok(())
        })
    }

    fn load_driver<'a>(
        &'a self,
        _inf: &'a str,
        _device_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async {
            Err(TestError::NotImplemented("loading drivers on windows".to_owned()).into())
        })
    }

    fn is_driver_installed<'a>(
        &'a self,
        inf: &'a str,
        _device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute_checked("pnputil /enum-drivers", self.timeout)
                .await?;
            let published = parse_pnputil_drivers(&out.stdout)
                .into_iter()
                .find(|p| p.original_name.eq_ignore_ascii_case(inf))
                .map(|p| p.published_name);
            debug!(inf, ?published, "driver package lookup");
            Ok(published)
        })
    }

    fn install_from_source<'a>(
        &'a self,
        _inf: &'a str,
        _device_id: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async {
            Err(TestError::NotImplemented("building drivers from source on windows".to_owned()).into())
        })
    }

    fn get_ethernet_devices(&self) -> BoxFuture<'_, Result<Vec<String>, PlatvalError>> {
        Box::pin(async {
            Err(TestError::NotImplemented("ethernet device enumeration on windows".to_owned()).into())
        })
    }

    fn identify_device_controller<'a>(
        &'a self,
        _devices: &'a [String],
        _code: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, PlatvalError>> {
        Box::pin(async {
            Err(TestError::NotImplemented("controller identification on windows".to_owned()).into())
        })
    }

    fn copy_driver_files<'a>(
        &'a self,
        host_usb: &'a dyn HostUsbDriveProvider,
        switch: &'a dyn UsbSwitch,
        archive: &'a Path,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            // install_driver searches the removable drive directly
            let staged = usb::stage_archive_for_sut(host_usb, switch, archive).await?;
            if let Some(serial) = staged.serial {
                debug!(%serial, "driver archive staged");
            }
            Ok(())
        })
    }
}

/// Picks the driver provider for the SUT's OS.
pub fn factory(
    os: OsType,
    executor: Arc<dyn SutExecutor>,
    config: &PlatvalConfig,
) -> Result<Box<dyn DriverProvider>, PlatvalError> {
    let timeout = Duration::from_secs(config.timeouts.command_secs);
    match os {
        OsType::Linux => Ok(Box::new(LinuxDriverProvider::new(
            executor,
            &config.drivers,
            timeout,
        )?)),
        OsType::Windows => Ok(Box::new(WindowsDriverProvider::new(executor, timeout)?)),
        OsType::Esxi => {
            warn!("driver provider requested for esxi");
            Err(TestError::Unsupported("driver management on esxi".to_owned()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platval_core::exec::ScriptedExecutor;
    use platval_core::types::Verdict;

    const T: Duration = Duration::from_secs(5);

    fn linux(exec: &Arc<ScriptedExecutor>) -> LinuxDriverProvider {
        LinuxDriverProvider::new(exec.clone(), &DriverConfig::default(), T).unwrap()
    }

    const LSPCI: &str = "\
3b:00.0 Ethernet controller: Intel Corporation Ethernet Controller XL710 for 40GbE QSFP+ (rev 02)
5e:00.0 Ethernet controller: Intel Corporation Ethernet Controller E810-C for QSFP (rev 01)
b1:00.0 Ethernet controller: Intel Corporation Ethernet Controller I225-LM (rev 03)";

    #[test]
    fn nic_lookup_is_case_insensitive() {
        let model = NicModel::lookup("Columbiaville").unwrap();
        assert_eq!(model.driver_code, "ice");
        assert_eq!(model.device_id, "DEV_1593");
        assert!(model.sfp_loopback);
        assert!(!NicModel::lookup("FOXVILLE").unwrap().sfp_loopback);
        assert!(matches!(
            NicModel::lookup("tigerlake"),
            Err(ProviderError::UnknownNicModel(_))
        ));
    }

    #[tokio::test]
    async fn installed_check_needs_line_starting_with_code() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Linux)
                .with_reply("lsmod | grep ice", "irdma 1 0\nib_core 2 1 ice\n"),
        );
        let provider = linux(&exec);
        assert_eq!(provider.is_driver_installed("ice", "columbiaville").await.unwrap(), None);

        exec.push_rule(
            "lsmod | grep ice",
            platval_core::exec::Reply::stdout("ice 1 0\n"),
            true,
        );
        assert_eq!(
            provider.is_driver_installed("ice", "columbiaville").await.unwrap(),
            Some("ice".to_owned())
        );
    }

    #[tokio::test]
    async fn install_loads_missing_module() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Linux)
                .with_reply("lsmod | grep igc", "igc 1 0\n")
                .with_once("lsmod | grep igc", ""),
        );
        linux(&exec).install_driver("igc", "foxville").await.unwrap();
        assert_eq!(exec.count_matching("modprobe igc"), 1);
    }

    #[tokio::test]
    async fn uninstall_fails_when_module_stays_loaded() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux).with_reply("lsmod | grep i40e", "i40e 1 0\n"));
        let err = linux(&exec)
            .uninstall_driver("i40e", "fortville")
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
        assert!(err.to_string().contains("not uninstalled properly"));
        assert_eq!(exec.position_of("rmmod i40e"), Some(0));
    }

    #[tokio::test]
    async fn uninstall_passes_when_module_is_gone() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux));
        linux(&exec).uninstall_driver("ice", "columbiaville").await.unwrap();
    }

    #[tokio::test]
    async fn no_ethernet_devices_is_a_failure() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux));
        let err = linux(&exec).get_ethernet_devices().await.unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
    }

    #[tokio::test]
    async fn identify_checks_kernel_driver_of_matching_controller() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Linux)
                .with_reply("lspci | grep Ethernet", LSPCI)
                .with_reply(
                    "lspci -s 5e:00.0 -vvv",
                    "\tSubsystem: Intel Corporation Device 0001\n\tKernel driver in use: ice\n\tKernel modules: ice\n",
                ),
        );
        let provider = linux(&exec);
        let devices = provider.get_ethernet_devices().await.unwrap();
        assert_eq!(devices.len(), 3);
        let bdfs = provider
            .identify_device_controller(&devices, "ice")
            .await
            .unwrap();
        assert_eq!(bdfs, vec!["5e:00.0"]);
        assert_eq!(exec.count_matching("lspci -s"), 1);
    }

    const TWO_E810: &str = "\
5e:00.0 Ethernet controller: Intel Corporation Ethernet Controller E810-C for QSFP (rev 01)
5e:00.1 Ethernet controller: Intel Corporation Ethernet Controller E810-C for QSFP (rev 01)
b1:00.0 Ethernet controller: Intel Corporation Ethernet Controller I225-LM (rev 03)";

    #[tokio::test]
    async fn identify_checks_every_matching_controller() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Linux)
                .with_reply("lspci -s 5e:00.0 -vvv", "\tKernel driver in use: ice\n")
                .with_reply("lspci -s 5e:00.1 -vvv", "\tKernel driver in use: ice\n"),
        );
        let devices: Vec<String> = TWO_E810.lines().map(str::to_owned).collect();
        let bdfs = linux(&exec)
            .identify_device_controller(&devices, "ice")
            .await
            .unwrap();
        assert_eq!(bdfs, vec!["5e:00.0", "5e:00.1"]);
        assert_eq!(exec.count_matching("lspci -s b1:00.0"), 0);
    }

    #[tokio::test]
    async fn identify_fails_when_second_controller_is_rebound() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Linux)
                .with_reply("lspci -s 5e:00.0 -vvv", "\tKernel driver in use: ice\n")
                .with_reply("lspci -s 5e:00.1 -vvv", "\tKernel driver in use: vfio-pci\n"),
        );
        let devices: Vec<String> = TWO_E810.lines().map(str::to_owned).collect();
        let err = linux(&exec)
            .identify_device_controller(&devices, "ice")
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
        assert!(err.to_string().contains("5e:00.1"));
        assert!(err.to_string().contains("vfio-pci"));
    }

    #[tokio::test]
    async fn igc_only_checks_i225_family() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux).with_reply("lspci -s b1:00.0 -vvv", "\tKernel driver in use: igc\n"));
        let devices: Vec<String> = LSPCI.lines().map(str::to_owned).collect();
        let bdfs = linux(&exec)
            .identify_device_controller(&devices, "igc")
            .await
            .unwrap();
        assert_eq!(bdfs, vec!["b1:00.0"]);
        assert_eq!(exec.history(), vec!["lspci -s b1:00.0 -vvv"]);
    }

    #[tokio::test]
    async fn identify_fails_on_driver_mismatch() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Linux)
                .with_reply("lspci -s 3b:00.0 -vvv", "\tKernel driver in use: vfio-pci\n"),
        );
        let devices: Vec<String> = LSPCI.lines().map(str::to_owned).collect();
        let err = linux(&exec)
            .identify_device_controller(&devices, "i40e")
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
        assert!(err.to_string().contains("vfio-pci"));
    }

    #[tokio::test]
    async fn source_install_unpacks_builds_and_loads() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Linux)
                .with_reply("find /root/drivers", "/root/drivers/ice-1.9.11.tar.gz\n")
                .with_reply("make install", "CC [M] ice_main.o\n")
                .with_reply("lsmod | grep ice", "ice 1 0\n"),
        );
        linux(&exec)
            .install_from_source("ice", "columbiaville")
            .await
            .unwrap();
        let history = exec.history();
        assert!(history.contains(&"tar -xvf /root/drivers/ice-1.9.11.tar.gz -C /root/drivers".to_owned()));
        assert!(history.contains(&"cd /root/drivers/ice-1.9.11/src && make install".to_owned()));
    }

    #[tokio::test]
    async fn source_install_without_archive_fails() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux));
        let err = linux(&exec)
            .install_from_source("igc", "foxville")
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
    }

    const ENUM_DRIVERS: &str = "\
Microsoft PnP Utility

Published Name:     oem3.inf
Original Name:      e1d68x64.inf
Provider Name:      Intel
Driver Version:     12/05/2022 12.19.1.37

Published Name:     oem7.inf
Original Name:      icea68.inf
Provider Name:      Intel
Driver Version:     03/01/2023 1.13.236.0
";

    #[test]
    fn pnputil_blocks_start_at_published_name() {
        let packages = parse_pnputil_drivers(ENUM_DRIVERS);
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[1].published_name, "oem7.inf");
        assert_eq!(packages[1].original_name, "icea68.inf");
        assert_eq!(packages[1].version, "03/01/2023 1.13.236.0");
    }

    #[tokio::test]
    async fn windows_installed_check_returns_published_name() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Windows).with_reply("pnputil /enum-drivers", ENUM_DRIVERS));
        let provider = WindowsDriverProvider::new(exec, T).unwrap();
        let oem = provider.is_driver_installed("icea68.inf", "DEV_1593").await.unwrap();
        assert_eq!(oem.as_deref(), Some("oem7.inf"));
        assert_eq!(provider.is_driver_installed("i40ea68.inf", "DEV_1583").await.unwrap(), None);
    }

    #[tokio::test]
    async fn windows_install_locates_inf_on_usb() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Windows)
                .with_reply("pnputil /enum-drivers", ENUM_DRIVERS)
                .with_once("pnputil /enum-drivers", "Microsoft PnP Utility\n")
                .with_reply("Win32_PnpEntity", "DeviceID\r\nPCI\\VEN_8086&DEV_1593&SUBSYS\r\n")
                .with_reply("wmic logicaldisk", "Description     DeviceID\r\nRemovable Disk  E:\r\n")
                .with_reply("Get-ChildItem", "E:\\ice\\icea68.inf\r\n"),
        );
        let provider = WindowsDriverProvider::new(exec.clone(), T).unwrap();
        provider.install_driver("icea68.inf", "DEV_1593").await.unwrap();
        assert_eq!(exec.count_matching("pnputil /add-driver \"E:\\ice\\icea68.inf\" /install"), 1);
    }

    #[tokio::test]
    async fn windows_install_without_device_is_not_applicable() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Windows).with_reply("Win32_PnpEntity", "DeviceID\r\n"));
        let provider = WindowsDriverProvider::new(exec, T).unwrap();
        let err = provider.install_driver("icea68.inf", "DEV_1593").await.unwrap_err();
        assert_eq!(err.verdict(), Verdict::NotApplicable);
    }

    #[tokio::test]
    async fn windows_uninstall_requires_installed_driver() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Windows).with_reply("pnputil /enum-drivers", ENUM_DRIVERS));
        let provider = WindowsDriverProvider::new(exec.clone(), T).unwrap();
        let err = provider.uninstall_driver("i40ea68.inf", "DEV_1583").await.unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
        assert_eq!(exec.count_matching("devcon"), 0);
    }

    #[tokio::test]
    async fn windows_uninstall_deletes_package_and_rescans() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Windows)
                .with_reply("pnputil /enum-drivers", "Microsoft PnP Utility\n")
                .with_once("pnputil /enum-drivers", ENUM_DRIVERS),
        );
        let provider = WindowsDriverProvider::new(exec.clone(), T).unwrap();
        provider.uninstall_driver("icea68.inf", "DEV_1593").await.unwrap();

        let removed = exec.position_of("devcon /r remove =net *DEV_1593*").unwrap();
        let deleted = exec.position_of("pnputil /delete-driver oem7.inf /uninstall /force").unwrap();
        let rescanned = exec.position_of("devcon rescan").unwrap();
        assert!(removed < deleted && deleted < rescanned);
        assert_eq!(exec.count_matching("pnputil /enum-drivers"), 2);
    }

    #[tokio::test]
    async fn windows_uninstall_fails_when_package_stays_listed() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Windows).with_reply("pnputil /enum-drivers", ENUM_DRIVERS));
        let provider = WindowsDriverProvider::new(exec.clone(), T).unwrap();
        let err = provider.uninstall_driver("icea68.inf", "DEV_1593").await.unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
        assert!(err.to_string().contains("still listed"));
    }

    #[tokio::test]
    async fn windows_enumeration_is_not_implemented() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Windows));
        let provider = WindowsDriverProvider::new(exec, T).unwrap();
        let err = provider.get_ethernet_devices().await.unwrap_err();
        assert_eq!(err.verdict(), Verdict::NotImplemented);
    }

    #[test]
    fn esxi_is_unsupported() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Esxi));
        let err = factory(OsType::Esxi, exec, &PlatvalConfig::default()).err().unwrap();
        assert_eq!(err.verdict(), Verdict::Unsupported);
    }
}
