//! Network adapter scenarios: link toggling, SR-IOV virtual functions and
//! iperf3 traffic between two SUTs.

use clap::Parser;
use tracing::{info, warn};

use platval_core::error::{PlatvalError, TestError};
use platval_core::testcase::{TestCase, TestCaseInfo, TestContext};
use platval_core::types::{OsType, Verdict};
use platval_providers::network::{self, AdapterStatus, NetworkProvider};

fn not_prepared() -> PlatvalError {
    TestError::Setup("network provider not prepared".to_owned()).into()
}

/// `wanted`, or the first test interface when none was asked for.
fn pick_interface(
    interfaces: &network::InterfaceMap,
    wanted: Option<&str>,
) -> Result<(String, String), PlatvalError> {
    match wanted {
        Some(name) => interfaces
            .get(name)
            .map(|ip| (name.to_owned(), ip.clone()))
            .ok_or_else(|| {
                TestError::Setup(format!("{name} is not a connected test interface")).into()
            }),
        None => interfaces
            .iter()
            .next()
            .map(|(name, ip)| (name.clone(), ip.clone()))
            .ok_or_else(|| {
                TestError::NotApplicable("no test interface besides the management one".to_owned())
                    .into()
            }),
    }
}

// ─── network-adapter-toggle ──────────────────────────────────────────

pub const TOGGLE_INFO: TestCaseInfo = TestCaseInfo {
    id: "network-adapter-toggle",
    name: "Network adapter disable/enable",
    description: "Disables a test adapter and requires its address to stop answering, \
                  then enables it and requires replies again",
    tags: &["network"],
    supported_os: &[OsType::Linux, OsType::Windows],
};

/// Disable a test adapter, then enable it again.
#[derive(Debug, Clone, Default, Parser)]
pub struct ToggleArgs {
    /// Test interface (default: first non-management interface)
    #[arg(long)]
    pub interface: Option<String>,

    /// Assign the static test addresses before toggling
    #[arg(long)]
    pub static_ip: bool,
}

pub struct NetworkAdapterToggle {
    interface: Option<String>,
    static_ip: bool,
    provider: Option<Box<dyn NetworkProvider>>,
    target: Option<(String, String)>,
    disabled: bool,
}

impl NetworkAdapterToggle {
    pub fn new(args: ToggleArgs) -> Result<Self, PlatvalError> {
        Ok(Self {
            interface: args.interface,
            static_ip: args.static_ip,
            provider: None,
            target: None,
            disabled: false,
        })
    }
}

impl TestCase for NetworkAdapterToggle {
    fn info(&self) -> &TestCaseInfo {
        &TOGGLE_INFO
    }

    async fn prepare(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let provider = network::factory(ctx.os(), ctx.sut.clone(), &ctx.config.network, ctx.timeout())?;
        let interfaces = provider.get_network_adapter_interfaces(self.static_ip).await?;
        let (interface, ip) = pick_interface(&interfaces, self.interface.as_deref())?;
        if ip.is_empty() {
            return Err(TestError::Setup(format!("{interface} has no ipv4 address")).into());
        }
        info!(%interface, %ip, "toggling adapter");
        self.target = Some((interface, ip));
        self.provider = Some(provider);
        Ok(())
    }

    async fn execute(&mut self, _ctx: &TestContext) -> Result<(), PlatvalError> {
        let provider = self.provider.as_deref().ok_or_else(not_prepared)?;
        let (interface, ip) = self.target.as_ref().ok_or_else(not_prepared)?;

        self.disabled = true;
        provider.disable_network_adapter_and_ping(interface, ip).await?;
        provider.enable_network_adapter_and_ping(interface, ip).await?;
        self.disabled = false;
        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &TestContext, _verdict: Verdict) -> Result<(), PlatvalError> {
        let (Some(provider), Some((interface, _))) = (self.provider.as_deref(), self.target.as_ref()) else {
            return Ok(());
        };
        if self.disabled {
            warn!(%interface, "adapter left disabled, enabling");
            provider
                .change_network_adapter_status(interface, AdapterStatus::Up)
                .await?;
        }
        if self.static_ip {
            provider.deallocate_static_ip(std::slice::from_ref(interface)).await?;
        }
        Ok(())
    }
}

// ─── sriov-vf ────────────────────────────────────────────────────────

pub const SRIOV_INFO: TestCaseInfo = TestCaseInfo {
    id: "sriov-vf",
    name: "SR-IOV virtual functions",
    description: "Creates virtual functions on a physical function, gives each a static \
                  address and requires it to answer pings",
    tags: &["network", "sriov"],
    supported_os: &[OsType::Linux, OsType::Windows],
};

/// Create SR-IOV virtual functions and ping each of them.
#[derive(Debug, Clone, Parser)]
pub struct SriovArgs {
    /// Physical function (default: first non-management interface)
    #[arg(long)]
    pub interface: Option<String>,

    /// Number of virtual functions
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..=128))]
    pub vfs: u32,
}

pub struct SriovVf {
    interface: Option<String>,
    count: u32,
    provider: Option<Box<dyn NetworkProvider>>,
    requested: bool,
}

impl SriovVf {
    pub fn new(args: SriovArgs) -> Result<Self, PlatvalError> {
        Ok(Self {
            interface: args.interface,
            count: args.vfs,
            provider: None,
            requested: false,
        })
    }
}

impl TestCase for SriovVf {
    fn info(&self) -> &TestCaseInfo {
        &SRIOV_INFO
    }

    async fn prepare(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let provider = network::factory(ctx.os(), ctx.sut.clone(), &ctx.config.network, ctx.timeout())?;
        if self.interface.is_none() {
            let interfaces = provider.get_network_adapter_interfaces(false).await?;
            self.interface = Some(pick_interface(&interfaces, None)?.0);
        }
        self.provider = Some(provider);
        Ok(())
    }

    async fn execute(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let provider = self.provider.as_deref().ok_or_else(not_prepared)?;
        let interface = self.interface.as_deref().ok_or_else(not_prepared)?;

        self.requested = true;
        let vfs = provider.generate_virtual_functions(interface, self.count).await?;
        let addresses = provider
            .assign_static_ip_to_virtual_interfaces_and_ping(&vfs)
            .await?;
        for (vf, ip) in &addresses {
            ctx.note(format!("{vf}: {ip} answers"));
        }
        info!(interface, count = vfs.len(), "virtual functions reachable");
        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &TestContext, _verdict: Verdict) -> Result<(), PlatvalError> {
        let (Some(provider), Some(interface)) = (self.provider.as_deref(), self.interface.as_deref()) else {
            return Ok(());
        };
        if !self.requested {
            return Ok(());
        }
        match provider.reset_virtual_network_adapters(interface).await {
            Err(PlatvalError::Test(TestError::NotImplemented(_))) => Ok(()),
            other => other,
        }
    }
}

// ─── iperf-pair ──────────────────────────────────────────────────────

pub const IPERF_INFO: TestCaseInfo = TestCaseInfo {
    id: "iperf-pair",
    name: "iperf3 between two SUTs",
    description: "Runs an iperf3 server on the second SUT and a client on the first; \
                  any interval without traffic fails",
    tags: &["network", "iperf", "two-sut"],
    supported_os: &[OsType::Linux, OsType::Windows],
};

/// iperf3 traffic from the first SUT to the second.
#[derive(Debug, Clone, Default, Parser)]
pub struct IperfArgs {
    /// Client run time (default network.iperf_secs)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub seconds: Option<u64>,

    /// Address of the second SUT (default: its management address)
    #[arg(long)]
    pub server_ip: Option<String>,
}

pub struct IperfPair {
    seconds: Option<u64>,
    server_ip: Option<String>,
}

impl IperfPair {
    pub fn new(args: IperfArgs) -> Result<Self, PlatvalError> {
        Ok(Self {
            seconds: args.seconds,
            server_ip: args.server_ip,
        })
    }
}

impl TestCase for IperfPair {
    fn info(&self) -> &TestCaseInfo {
        &IPERF_INFO
    }

    async fn prepare(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let sut2 = ctx.require_sut2()?;
        if self.server_ip.is_none() {
            let peer = network::factory(sut2.os_type(), sut2, &ctx.config.network, ctx.timeout())?;
            self.server_ip = Some(peer.get_sut_ip().await?.ip);
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let sut2 = ctx.require_sut2()?;
        let server_ip = self.server_ip.as_deref().ok_or_else(not_prepared)?;
        let seconds = self.seconds.unwrap_or(ctx.config.network.iperf_secs);
        let report = network::run_iperf_pair(sut2, ctx.sut.clone(), server_ip, seconds).await?;
        if let Some(bitrate) = &report.bitrate {
            ctx.note(format!("iperf3 sender bitrate {bitrate}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platval_core::testcase::parse_case_args;

    fn interfaces() -> network::InterfaceMap {
        [("ens1f0", "10.10.10.10"), ("ens1f1", "10.10.10.11")]
            .into_iter()
            .map(|(i, ip)| (i.to_owned(), ip.to_owned()))
            .collect()
    }

    #[test]
    fn picks_first_or_named_interface() {
        assert_eq!(pick_interface(&interfaces(), None).unwrap().0, "ens1f0");
        assert_eq!(pick_interface(&interfaces(), Some("ens1f1")).unwrap().1, "10.10.10.11");
        let err = pick_interface(&interfaces(), Some("eth9")).unwrap_err();
        assert_eq!(err.verdict(), Verdict::Error);
    }

    #[test]
    fn no_test_interface_is_not_applicable() {
        let err = pick_interface(&network::InterfaceMap::new(), None).unwrap_err();
        assert_eq!(err.verdict(), Verdict::NotApplicable);
    }

    #[test]
    fn vf_count_is_range_checked() {
        let parse = |tokens: &[&str]| parse_case_args::<SriovArgs, _, _>(SRIOV_INFO.id, tokens.iter().copied());
        assert!(parse(&["--vfs", "0"]).is_err());
        assert!(parse(&["--vfs", "many"]).is_err());
        let case = SriovVf::new(parse(&[]).unwrap()).unwrap();
        assert_eq!(case.count, 4);
    }
}
