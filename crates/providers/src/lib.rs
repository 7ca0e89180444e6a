#![doc = include_str!("../README.md")]
//!
//! # Modules
//!
//! - [`driver`]: NIC driver install / uninstall / load, source builds and controller lookup
//! - [`network`]: adapter discovery, up/down toggling, ping, SR-IOV virtual functions and iperf3 pairs
//! - [`usb`]: host-side USB drive staging and the host/SUT USB switch
//! - [`stress`]: stressapptest and detached stress tools
//! - [`vm`]: guest and storage pool management (KVM, Hyper-V)
//! - [`error`]: provider error type
//!
//! Every module exposes a `factory` that picks the implementation for an
//! [`OsType`](platval_core::OsType); ESXi answers `Unsupported`.

pub mod driver;
pub mod error;
pub mod network;
pub mod stress;
pub mod usb;
pub mod vm;

// errors
pub use error::ProviderError;

// drivers
pub use driver::{DriverProvider, LinuxDriverProvider, NicModel, WindowsDriverProvider, NIC_MODELS};

// network
pub use network::{
    AdapterStatus, InterfaceMap, IperfReport, LinuxNetworkProvider, NetworkProvider,
    WindowsNetworkProvider, run_iperf_pair,
};

// usb
pub use usb::{CommandUsbSwitch, HostUsbDriveProvider, UsbDrive, UsbSwitch};

// stress
pub use stress::{StressAppResult, StressAppTestProvider};

// virtualization
pub use vm::{HyperVProvider, KvmProvider, VmInfo, VmProvider, VmSpec};
