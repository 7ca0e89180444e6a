#![doc = include_str!("../README.md")]

pub mod bios;
pub mod capsule;
pub mod driver;
pub mod network;
pub mod stress;
pub mod vm;

use platval_core::error::RegistryError;
use platval_core::testcase::TestRegistry;
use platval_seamless::RedfishClient;

pub use bios::BiosKnobs;
pub use capsule::{BmcConnector, CapsuleUpdateCase};
pub use driver::DriverInstallCycle;
pub use network::{IperfPair, NetworkAdapterToggle, SriovVf};
pub use stress::StressAppTest;
pub use vm::VmProvisioning;

/// Registry holding every shipped test case.
pub fn default_registry() -> Result<TestRegistry, RegistryError> {
    let mut registry = TestRegistry::new();
    registry.register(driver::INFO, DriverInstallCycle::new)?;
    registry.register(network::TOGGLE_INFO, NetworkAdapterToggle::new)?;
    registry.register(network::SRIOV_INFO, SriovVf::new)?;
    registry.register(network::IPERF_INFO, IperfPair::new)?;
    registry.register(stress::INFO, StressAppTest::new)?;
    registry.register(vm::INFO, VmProvisioning::new)?;
    registry.register(bios::INFO, BiosKnobs::new)?;
    registry.register(capsule::INFO, CapsuleUpdateCase::<RedfishClient>::new)?;
    Ok(registry)
}
