//! Host-side USB flash drive used to ferry collateral to the SUT.
//!
//! The drive sits behind a switch that routes it either to the controlling
//! host or to the SUT. The host fills it, then hands it over:
//!
//! ```text
//!  host ──(switch: host)──▶ format, extract ──(switch: sut)──▶ SUT mounts it
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use platval_core::config::HostConfig;
use platval_core::error::{PlatvalError, TestError};
use platval_core::exec::{BoxFuture, SutExecutor};
use platval_core::types::OsType;

use crate::error::ProviderError;

/// A mounted (or mountable) USB partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbDrive {
    /// `/dev/sdb1` on Linux, `E:` on Windows
    pub device: String,
    /// Empty when the partition is not mounted
    pub mount_point: String,
    pub serial: Option<String>,
}

// ─── UsbSwitch ───────────────────────────────────────────────────────

/// Routes the shared drive between host and SUT.
pub trait UsbSwitch: Send + Sync {
    fn connect_to_host(&self) -> BoxFuture<'_, Result<(), PlatvalError>>;

    fn connect_to_sut(&self) -> BoxFuture<'_, Result<(), PlatvalError>>;
}

/// Switch driven by two host commands from `[host]`.
pub struct CommandUsbSwitch {
    executor: Arc<dyn SutExecutor>,
    to_host: String,
    to_sut: String,
    settle: Duration,
    timeout: Duration,
}

impl CommandUsbSwitch {
    /// `None` unless both switch commands are configured.
    pub fn from_config(
        executor: Arc<dyn SutExecutor>,
        config: &HostConfig,
        timeout: Duration,
    ) -> Option<Self> {
        config.has_usb_switch().then(|| Self {
            executor,
            to_host: config.usb_switch_to_host.clone(),
            to_sut: config.usb_switch_to_sut.clone(),
            settle: Duration::from_secs(config.usb_settle_secs),
            timeout,
        })
    }

    async fn switch(&self, command: &str, side: &str) -> Result<(), PlatvalError> {
        info!(side, "switching usb drive");
        self.executor.execute_checked(command, self.timeout).await?;
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        Ok(())
    }
}

impl UsbSwitch for CommandUsbSwitch {
    fn connect_to_host(&self) -> BoxFuture<'_, Result<(), PlatvalError>> {
        Box::pin(self.switch(&self.to_host, "host"))
    }

    fn connect_to_sut(&self) -> BoxFuture<'_, Result<(), PlatvalError>> {
        Box::pin(self.switch(&self.to_sut, "sut"))
    }
}

// ─── HostUsbDriveProvider ────────────────────────────────────────────

pub trait HostUsbDriveProvider: Send + Sync {
    /// USB drives currently mounted on the host.
    fn get_mount_points(&self) -> BoxFuture<'_, Result<Vec<UsbDrive>, PlatvalError>>;

    /// Formats `drive` as FAT32 and leaves it mounted where it was.
    fn format_drive<'a>(&'a self, drive: &'a UsbDrive) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// Lower-cased serial number, when the host can tell.
    fn get_drive_serial_number<'a>(
        &'a self,
        drive: &'a UsbDrive,
    ) -> BoxFuture<'a, Result<Option<String>, PlatvalError>>;

    /// Unpacks a `.zip` / `.tar.gz` archive onto the drive.
    fn extract_archive_to_usb<'a>(
        &'a self,
        archive: &'a Path,
        drive: &'a UsbDrive,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// The one drive that appears when the switch moves from the SUT to
    /// the host. Leaves the drive connected to the host.
    fn get_hotplugged_usb_drive<'a>(
        &'a self,
        switch: &'a dyn UsbSwitch,
    ) -> BoxFuture<'a, Result<UsbDrive, PlatvalError>> {
        Box::pin(async move {
            switch.connect_to_sut().await?;
            let before = self.get_mount_points().await?;
            debug!(?before, "usb drives with the switch on the sut");
            switch.connect_to_host().await?;
            let after = self.get_mount_points().await?;
            debug!(?after, "usb drives with the switch on the host");

            let mut appeared: Vec<UsbDrive> = after
                .into_iter()
                .filter(|d| !before.iter().any(|b| b.mount_point == d.mount_point))
                .collect();
            match appeared.len() {
                0 => Err(ProviderError::UsbDrive(
                    "no usb drive appeared after switching to the host".to_owned(),
                )
                .into()),
                1 => {
                    let drive = appeared.remove(0);
                    info!(mount_point = %drive.mount_point, "hot-plugged usb drive");
                    Ok(drive)
                }
                n => Err(ProviderError::UsbDrive(format!(
                    "{n} usb drives appeared after switching to the host, expected one"
                ))
                .into()),
            }
        })
    }

    /// Copies a file or directory tree onto the drive root.
    fn copy_file_to_usb<'a>(
        &'a self,
        host_path: &'a Path,
        drive: &'a UsbDrive,
    ) -> BoxFuture<'a, Result<PathBuf, PlatvalError>> {
        Box::pin(async move {
            let name = host_path.file_name().ok_or_else(|| {
                ProviderError::UsbDrive(format!("'{}' has no file name", host_path.display()))
            })?;
            let target = Path::new(&drive.mount_point).join(name);
            let bytes = copy_path(host_path, &target).await?;
            info!(source = %host_path.display(), destination = %target.display(), bytes, "copied to usb");
            Ok(target)
        })
    }

    fn copy_file_from_usb<'a>(
        &'a self,
        usb_path: &'a Path,
        host_path: &'a Path,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let bytes = copy_path(usb_path, host_path).await?;
            info!(source = %usb_path.display(), destination = %host_path.display(), bytes, "copied from usb");
            Ok(())
        })
    }
}

/// Recursively copies `src` to `dst`, returning the number of bytes copied.
pub async fn copy_path(src: &Path, dst: &Path) -> Result<u64, ProviderError> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    let mut copied = 0;
    while let Some((from, to)) = pending.pop() {
        if tokio::fs::metadata(&from).await?.is_dir() {
            tokio::fs::create_dir_all(&to).await?;
            let mut entries = tokio::fs::read_dir(&from).await?;
            while let Some(entry) = entries.next_entry().await? {
                pending.push((entry.path(), to.join(entry.file_name())));
            }
        } else {
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            copied += tokio::fs::copy(&from, &to).await?;
        }
    }
    Ok(copied)
}

/// Fills the shared drive with `archive` and hands it to the SUT.
pub async fn stage_archive_for_sut(
    usb: &dyn HostUsbDriveProvider,
    switch: &dyn UsbSwitch,
    archive: &Path,
) -> Result<UsbDrive, PlatvalError> {
    if !tokio::fs::try_exists(archive).await? {
        return Err(TestError::Setup(format!("archive '{}' not found", archive.display())).into());
    }
    let drive = usb.get_hotplugged_usb_drive(switch).await?;
    usb.format_drive(&drive).await?;
    usb.extract_archive_to_usb(archive, &drive).await?;
    let serial = usb.get_drive_serial_number(&drive).await?;
    switch.connect_to_sut().await?;
    info!(archive = %archive.display(), "archive staged on usb drive for the sut");
    Ok(UsbDrive { serial, ..drive })
}

// ─── lsblk ───────────────────────────────────────────────────────────

/// Columns requested from `lsblk -P`.
pub const LSBLK_USB_COMMAND: &str = "lsblk -P -o NAME,TYPE,TRAN,MOUNTPOINT,SERIAL";

/// USB partitions (and whole-disk filesystems) from `lsblk -P` output.
///
/// Partitions inherit transport and serial from the disk row above them.
pub fn parse_lsblk(output: &str) -> Vec<UsbDrive> {
    let mut drives = Vec::new();
    let mut disk_is_usb = false;
    let mut disk_serial = String::new();
    for line in output.lines() {
        let pairs = parse_pairs(line);
        let field = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map_or("", |(_, v)| *v)
        };
        let mount_point = field("MOUNTPOINT");
        match field("TYPE") {
            "disk" => {
                disk_is_usb = field("TRAN") == "usb";
                disk_serial = field("SERIAL").to_lowercase();
                if disk_is_usb && !mount_point.is_empty() {
                    drives.push(usb_drive(field("NAME"), mount_point, &disk_serial));
                }
            }
            "part" if disk_is_usb => {
                drives.push(usb_drive(field("NAME"), mount_point, &disk_serial));
            }
            _ => {}
        }
    }
    drives
}

fn usb_drive(name: &str, mount_point: &str, serial: &str) -> UsbDrive {
    UsbDrive {
        device: format!("/dev/{name}"),
        mount_point: mount_point.to_owned(),
        serial: (!serial.is_empty()).then(|| serial.to_owned()),
    }
}

/// `KEY="value" KEY="value"` pairs; values may contain spaces.
fn parse_pairs(line: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    let mut rest = line.trim();
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim();
        let after = &rest[eq + 2..];
        let Some(end) = after.find('"') else {
            break;
        };
        pairs.push((key, &after[..end]));
        rest = &after[end + 1..];
    }
    pairs
}

// ─── Linux host ──────────────────────────────────────────────────────

pub struct LinuxHostUsbDrive {
    executor: Arc<dyn SutExecutor>,
    mount_root: String,
    timeout: Duration,
}

impl LinuxHostUsbDrive {
    pub fn new(executor: Arc<dyn SutExecutor>, mount_root: &str, timeout: Duration) -> Self {
        Self {
            executor,
            mount_root: mount_root.trim_end_matches('/').to_owned(),
            timeout,
        }
    }
}

impl HostUsbDriveProvider for LinuxHostUsbDrive {
    fn get_mount_points(&self) -> BoxFuture<'_, Result<Vec<UsbDrive>, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute_checked(LSBLK_USB_COMMAND, self.timeout)
                .await?;
            Ok(parse_lsblk(&out.stdout)
                .into_iter()
                .filter(|d| d.mount_point.starts_with(&self.mount_root))
                .collect())
        })
    }

    fn format_drive<'a>(&'a self, drive: &'a UsbDrive) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            info!(device = %drive.device, "formatting usb drive as fat32");
            let commands = [
                format!("umount {}", drive.device),
                format!("mkfs.vfat -F 32 {}", drive.device),
                format!("mount {} '{}'", drive.device, drive.mount_point),
            ];
            for command in &commands {
                self.executor.execute_checked(command, self.timeout).await?;
            }
            Ok(())
        })
    }

    fn get_drive_serial_number<'a>(
        &'a self,
        drive: &'a UsbDrive,
    ) -> BoxFuture<'a, Result<Option<String>, PlatvalError>> {
        Box::pin(async move {
            let drives = self.get_mount_points().await?;
            Ok(drives
                .into_iter()
                .find(|d| d.mount_point == drive.mount_point)
                .and_then(|d| d.serial))
        })
    }

    fn extract_archive_to_usb<'a>(
        &'a self,
        archive: &'a Path,
        drive: &'a UsbDrive,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let archive = archive.display();
            let command = if archive.to_string().ends_with(".zip") {
                format!("unzip -o '{archive}' -d '{}'", drive.mount_point)
            } else {
                format!("tar -xf '{archive}' -C '{}'", drive.mount_point)
            };
            self.executor.execute_checked(&command, self.timeout).await?;
            Ok(())
        })
    }
}

// ─── Windows host ────────────────────────────────────────────────────

pub const WMIC_REMOVABLE_COMMAND: &str = "wmic logicaldisk where drivetype=2 get deviceid, description";

pub struct WindowsHostUsbDrive {
    executor: Arc<dyn SutExecutor>,
    timeout: Duration,
    removable_disk: Regex,
    volume_serial: Regex,
}

impl WindowsHostUsbDrive {
    pub fn new(executor: Arc<dyn SutExecutor>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            executor,
            timeout,
            removable_disk: removable_disk_pattern()?,
            volume_serial: Regex::new(r"Serial Number is ([0-9A-Fa-f]{4}-[0-9A-Fa-f]{4})")?,
        })
    }
}

/// Matches `Removable Disk  E:` rows of [`WMIC_REMOVABLE_COMMAND`].
pub fn removable_disk_pattern() -> Result<Regex, regex::Error> {
    Regex::new(r"Removable\sDisk\s+([A-Z]:)")
}

impl HostUsbDriveProvider for WindowsHostUsbDrive {
    fn get_mount_points(&self) -> BoxFuture<'_, Result<Vec<UsbDrive>, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute_checked(WMIC_REMOVABLE_COMMAND, self.timeout)
                .await?;
            Ok(self
                .removable_disk
                .captures_iter(&out.stdout)
                .map(|c| UsbDrive {
                    device: c[1].to_owned(),
                    mount_point: format!("{}\\", &c[1]),
                    serial: None,
                })
                .collect())
        })
    }

    fn format_drive<'a>(&'a self, drive: &'a UsbDrive) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            info!(device = %drive.device, "formatting usb drive as fat32");
            let command = format!("format {} /FS:FAT32 /Q /Y", drive.device);
            self.executor.execute_checked(&command, self.timeout).await?;
            Ok(())
        })
    }

    fn get_drive_serial_number<'a>(
        &'a self,
        drive: &'a UsbDrive,
    ) -> BoxFuture<'a, Result<Option<String>, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute_checked(&format!("vol {}", drive.device), self.timeout)
                .await?;
            Ok(self
                .volume_serial
                .captures(&out.stdout)
                .map(|c| c[1].to_lowercase()))
        })
    }

    fn extract_archive_to_usb<'a>(
        &'a self,
        archive: &'a Path,
        drive: &'a UsbDrive,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let command = format!(
                "powershell Expand-Archive -Force -Path '{}' -DestinationPath '{}'",
                archive.display(),
                drive.mount_point
            );
            self.executor.execute_checked(&command, self.timeout).await?;
            Ok(())
        })
    }
}

/// Picks the implementation for the controlling host's OS.
pub fn factory(
    host_os: OsType,
    executor: Arc<dyn SutExecutor>,
    config: &HostConfig,
    timeout: Duration,
) -> Result<Box<dyn HostUsbDriveProvider>, PlatvalError> {
    match host_os {
        OsType::Linux => Ok(Box::new(LinuxHostUsbDrive::new(
            executor,
            &config.usb_mount_root,
            timeout,
        ))),
        OsType::Windows => Ok(Box::new(WindowsHostUsbDrive::new(executor, timeout)?)),
        OsType::Esxi => Err(TestError::Unsupported("usb drives on an esxi host".to_owned()).into()),
    }
}
