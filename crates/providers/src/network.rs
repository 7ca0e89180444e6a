//! NIC connectivity: interface discovery, static addressing, adapter
//! toggling, SR-IOV virtual functions and iperf3 throughput pairs.
//!
//! The provider is stateless. Callers keep the interface map returned by
//! [`NetworkProvider::get_network_adapter_interfaces`] and hand the pieces
//! they need back in.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use platval_core::config::NetworkConfig;
use platval_core::error::{PlatvalError, TestError};
use platval_core::exec::{BoxFuture, SutExecutor};
use platval_core::types::{CommandOutput, OsType};

use crate::error::ProviderError;

/// Interface name → IPv4 address (empty when none is assigned).
pub type InterfaceMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    Up,
    Down,
}

impl fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Address of the SUT on the management network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagementAddress {
    pub interface: String,
    pub ip: String,
}

pub trait NetworkProvider: Send + Sync {
    /// Connected ethernet interfaces.
    fn get_network_interfaces(&self) -> BoxFuture<'_, Result<Vec<String>, PlatvalError>>;

    /// Interface and address of the management connection. Fails with
    /// `Setup` when no interface carries a management-network address.
    fn get_sut_ip(&self) -> BoxFuture<'_, Result<ManagementAddress, PlatvalError>>;

    /// Name of the management interface.
    fn get_network_interface_name(&self) -> BoxFuture<'_, Result<String, PlatvalError>> {
        Box::pin(async move { Ok(self.get_sut_ip().await?.interface) })
    }

    /// Test interfaces (every connected interface but the management one)
    /// with their addresses. With `assign_static_ip` interface `i` first
    /// gets the `i`-th static address.
    fn get_network_adapter_interfaces(
        &self,
        assign_static_ip: bool,
    ) -> BoxFuture<'_, Result<InterfaceMap, PlatvalError>>;

    fn change_network_adapter_status<'a>(
        &'a self,
        interface: &'a str,
        status: AdapterStatus,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// Whether `ip` answers pings.
    fn ping_network_adapter_ip<'a>(&'a self, ip: &'a str) -> BoxFuture<'a, Result<bool, PlatvalError>>;

    /// Disconnects `interface`; `ip` must stop answering.
    fn disable_network_adapter_and_ping<'a>(
        &'a self,
        interface: &'a str,
        ip: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// Reconnects `interface`; `ip` must answer again.
    fn enable_network_adapter_and_ping<'a>(
        &'a self,
        interface: &'a str,
        ip: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// Creates `count` SR-IOV virtual functions on `interface` and returns
    /// their interface names.
    fn generate_virtual_functions<'a>(
        &'a self,
        interface: &'a str,
        count: u32,
    ) -> BoxFuture<'a, Result<Vec<String>, PlatvalError>>;

    /// Gives VF `i` the `i`-th VF address and requires it to answer pings.
    fn assign_static_ip_to_virtual_interfaces_and_ping<'a>(
        &'a self,
        vfs: &'a [String],
    ) -> BoxFuture<'a, Result<InterfaceMap, PlatvalError>>;

    fn reset_virtual_network_adapters<'a>(
        &'a self,
        interface: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;

    fn deallocate_static_ip<'a>(
        &'a self,
        interfaces: &'a [String],
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;
}

/// Static address of test interface `index`.
pub fn static_ip(config: &NetworkConfig, index: usize) -> String {
    format!("{}{index}", config.static_ip_prefix)
}

/// Static address of virtual function `index`.
pub fn vf_ip(config: &NetworkConfig, index: usize) -> String {
    format!("{}{index}", config.vf_ip_prefix)
}

async fn settle(config: &NetworkConfig) {
    if config.settle_secs > 0 {
        tokio::time::sleep(Duration::from_secs(config.settle_secs)).await;
    }
}

// ─── Linux ───────────────────────────────────────────────────────────

pub struct LinuxNetworkProvider {
    executor: Arc<dyn SutExecutor>,
    config: NetworkConfig,
    timeout: Duration,
    connected: Regex,
    inet: Regex,
    ping_reply: Regex,
    virtual_function: Regex,
}

impl LinuxNetworkProvider {
    pub fn new(
        executor: Arc<dyn SutExecutor>,
        config: &NetworkConfig,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            executor,
            config: config.clone(),
            timeout,
            connected: Regex::new(r"ethernet\s+connected")?,
            inet: Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+)")?,
            ping_reply: Regex::new(r"bytes\sfrom.*icmp_seq.*ttl.*time")?,
            virtual_function: Regex::new(r"Ethernet\scontroller.*Virtual\sFunction")?,
        })
    }

    async fn interface_ip(&self, interface: &str) -> Result<String, PlatvalError> {
        let out = self
            .executor
            .execute(&format!("ifconfig {interface}"), self.timeout)
            .await?;
        Ok(self
            .inet
            .captures(&out.stdout)
            .map(|c| c[1].to_owned())
            .unwrap_or_default())
    }

    async fn assign(&self, interface: &str, ip: &str) -> Result<(), PlatvalError> {
        info!(interface, ip, "assigning static ip");
        self.executor
            .execute_checked(&format!("ifconfig {interface} {ip}"), self.timeout)
            .await?;
        Ok(())
    }
}

impl NetworkProvider for LinuxNetworkProvider {
    fn get_network_interfaces(&self) -> BoxFuture<'_, Result<Vec<String>, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute_checked("nmcli device status", self.timeout)
                .await?;
            let interfaces: Vec<String> = out
                .lines()
                .filter(|line| self.connected.is_match(line))
                .filter_map(|line| line.split_whitespace().next())
                .map(str::to_owned)
                .collect();
            debug!(?interfaces, "connected ethernet interfaces");
            Ok(interfaces)
        })
    }

    fn get_sut_ip(&self) -> BoxFuture<'_, Result<ManagementAddress, PlatvalError>> {
        Box::pin(async move {
            for interface in self.get_network_interfaces().await? {
                let ip = self.interface_ip(&interface).await?;
                if ip.starts_with(&self.config.management_ip_prefix) {
                    debug!(%interface, %ip, "management interface");
                    return Ok(ManagementAddress { interface, ip });
                }
            }
            Err(TestError::Setup(format!(
                "no interface has a {}x management address",
                self.config.management_ip_prefix
            ))
            .into())
        })
    }

    fn get_network_adapter_interfaces(
        &self,
        assign_static_ip: bool,
    ) -> BoxFuture<'_, Result<InterfaceMap, PlatvalError>> {
        Box::pin(async move {
            let management = self.get_network_interface_name().await?;
            let mut map = InterfaceMap::new();
            let test_interfaces = self
                .get_network_interfaces()
                .await?
                .into_iter()
                .filter(|i| *i != management);
            for (index, interface) in test_interfaces.enumerate() {
                let ip = if assign_static_ip {
                    let ip = static_ip(&self.config, index);
                    self.assign(&interface, &ip).await?;
                    ip
                } else {
                    self.interface_ip(&interface).await?
                };
                map.insert(interface, ip);
            }
            info!(?map, "test interfaces");
            Ok(map)
        })
    }

    fn change_network_adapter_status<'a>(
        &'a self,
        interface: &'a str,
        status: AdapterStatus,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.executor
                .execute_checked(&format!("ifconfig {interface} {status}"), self.timeout)
                .await?;
            info!(interface, %status, "adapter status changed");
            Ok(())
        })
    }

    fn ping_network_adapter_ip<'a>(&'a self, ip: &'a str) -> BoxFuture<'a, Result<bool, PlatvalError>> {
        Box::pin(async move {
            let command = format!("ping {ip} -c {}", self.config.ping_count);
            let out = self.executor.execute(&command, self.timeout).await?;
            let replies = self.ping_reply.is_match(&out.stdout);
            debug!(ip, replies, "ping");
            Ok(replies)
        })
    }

    fn disable_network_adapter_and_ping<'a>(
        &'a self,
        interface: &'a str,
        ip: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            info!(interface, "disconnecting adapter");
            self.executor
                .execute_checked(&format!("nmcli device disconnect {interface}"), self.timeout)
                .await?;
            settle(&self.config).await;
            if self.ping_network_adapter_ip(ip).await? {
                return Err(TestError::Fail(format!(
                    "{ip} still answers after disabling {interface}"
                ))
                .into());
            }
            info!(interface, ip, "no replies while disabled");
            Ok(())
        })
    }

    fn enable_network_adapter_and_ping<'a>(
        &'a self,
        interface: &'a str,
        ip: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            info!(interface, "connecting adapter");
            self.executor
                .execute_checked(&format!("nmcli device connect {interface}"), self.timeout)
                .await?;
            settle(&self.config).await;
            if !self.ping_network_adapter_ip(ip).await? {
                return Err(TestError::Fail(format!(
                    "{ip} does not answer after enabling {interface}"
                ))
                .into());
            }
            info!(interface, ip, "replies after enabling");
            Ok(())
        })
    }

    fn generate_virtual_functions<'a>(
        &'a self,
        interface: &'a str,
        count: u32,
    ) -> BoxFuture<'a, Result<Vec<String>, PlatvalError>> {
        Box::pin(async move {
            info!(interface, count, "creating virtual functions");
            self.executor
                .execute_checked(
                    &format!("echo {count} > /sys/class/net/{interface}/device/sriov_numvfs"),
                    self.timeout,
                )
                .await?;
            let out = self
                .executor
                .execute_checked("lspci | grep net", self.timeout)
                .await?;
            let found = out
                .lines()
                .filter(|line| self.virtual_function.is_match(line))
                .count();
            if found != count as usize {
                return Err(TestError::Fail(format!(
                    "expected {count} virtual functions, lspci shows {found}"
                ))
                .into());
            }
            Ok((0..count).map(|i| format!("{interface}v{i}")).collect())
        })
    }

    fn assign_static_ip_to_virtual_interfaces_and_ping<'a>(
        &'a self,
        vfs: &'a [String],
    ) -> BoxFuture<'a, Result<InterfaceMap, PlatvalError>> {
        Box::pin(async move {
            settle(&self.config).await;
            let mut map = InterfaceMap::new();
            for (index, vf) in vfs.iter().enumerate() {
                let ip = vf_ip(&self.config, index);
                self.assign(vf, &ip).await?;
                if !self.ping_network_adapter_ip(&ip).await? {
                    return Err(TestError::Fail(format!(
                        "{ip} assigned to virtual interface {vf} does not answer"
                    ))
                    .into());
                }
                map.insert(vf.clone(), ip);
            }
            Ok(map)
        })
    }

    fn reset_virtual_network_adapters<'a>(
        &'a self,
        interface: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.executor
                .execute_checked(
                    &format!("echo 0 > /sys/class/net/{interface}/device/sriov_numvfs"),
                    self.timeout,
                )
                .await?;
            info!(interface, "virtual functions removed");
            Ok(())
        })
    }

    fn deallocate_static_ip<'a>(
        &'a self,
        interfaces: &'a [String],
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            for interface in interfaces {
                self.executor
                    .execute_checked(&format!("ifconfig {interface} 0.0.0.0"), self.timeout)
                    .await?;
            }
            info!(count = interfaces.len(), "static addresses released");
            Ok(())
        })
    }
}

// ─── Windows ─────────────────────────────────────────────────────────

pub struct WindowsNetworkProvider {
    executor: Arc<dyn SutExecutor>,
    config: NetworkConfig,
    timeout: Duration,
    ping_reply: Regex,
}

impl WindowsNetworkProvider {
    pub fn new(
        executor: Arc<dyn SutExecutor>,
        config: &NetworkConfig,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            executor,
            config: config.clone(),
            timeout,
            ping_reply: Regex::new(r"Reply from .*TTL=")?,
        })
    }

    async fn interface_ip(&self, interface: &str) -> Result<String, PlatvalError> {
        let command = format!(
            "powershell \"(Get-NetIPAddress -InterfaceAlias '{interface}' -AddressFamily IPv4).IPAddress\""
        );
        let out = self.executor.execute(&command, self.timeout).await?;
        Ok(out.lines().next().unwrap_or_default().to_owned())
    }

    async fn set_adapter(&self, interface: &str, enable: bool) -> Result<(), PlatvalError> {
        let verb = if enable { "Enable" } else { "Disable" };
        let command = format!("powershell \"{verb}-NetAdapter -Name '{interface}' -Confirm:$false\"");
        self.executor.execute_checked(&command, self.timeout).await?;
        info!(interface, verb, "adapter toggled");
        Ok(())
    }
}

impl NetworkProvider for WindowsNetworkProvider {
    fn get_network_interfaces(&self) -> BoxFuture<'_, Result<Vec<String>, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute_checked(
                    "powershell \"Get-NetAdapter | Where-Object Status -eq 'Up' | Select-Object -ExpandProperty Name\"",
                    self.timeout,
                )
                .await?;
            Ok(out.lines().map(str::to_owned).collect())
        })
    }

    fn get_sut_ip(&self) -> BoxFuture<'_, Result<ManagementAddress, PlatvalError>> {
        Box::pin(async move {
            for interface in self.get_network_interfaces().await? {
                let ip = self.interface_ip(&interface).await?;
                if ip.starts_with(&self.config.management_ip_prefix) {
                    return Ok(ManagementAddress { interface, ip });
                }
            }
            Err(TestError::Setup(format!(
                "no adapter has a {}x management address",
                self.config.management_ip_prefix
            ))
            .into())
        })
    }

    fn get_network_adapter_interfaces(
        &self,
        assign_static_ip: bool,
    ) -> BoxFuture<'_, Result<InterfaceMap, PlatvalError>> {
        Box::pin(async move {
            let management = self.get_network_interface_name().await?;
            let mut map = InterfaceMap::new();
            let test_interfaces = self
                .get_network_interfaces()
                .await?
                .into_iter()
                .filter(|i| *i != management);
            for (index, interface) in test_interfaces.enumerate() {
                let ip = if assign_static_ip {
                    let ip = static_ip(&self.config, index);
                    let command = format!(
                        "netsh interface ipv4 set address name=\"{interface}\" static {ip} {}",
                        self.config.netmask
                    );
                    self.executor.execute_checked(&command, self.timeout).await?;
                    ip
                } else {
                    self.interface_ip(&interface).await?
                };
                map.insert(interface, ip);
            }
            Ok(map)
        })
    }

    fn change_network_adapter_status<'a>(
        &'a self,
        interface: &'a str,
        status: AdapterStatus,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(self.set_adapter(interface, status == AdapterStatus::Up))
    }

    fn ping_network_adapter_ip<'a>(&'a self, ip: &'a str) -> BoxFuture<'a, Result<bool, PlatvalError>> {
        Box::pin(async move {
            let command = format!("ping -n {} {ip}", self.config.ping_count);
            let out = self.executor.execute(&command, self.timeout).await?;
            Ok(self.ping_reply.is_match(&out.stdout))
        })
    }

    fn disable_network_adapter_and_ping<'a>(
        &'a self,
        interface: &'a str,
        ip: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.set_adapter(interface, false).await?;
            settle(&self.config).await;
            if self.ping_network_adapter_ip(ip).await? {
                return Err(TestError::Fail(format!(
                    "{ip} still answers after disabling {interface}"
                ))
                .into());
            }
            Ok(())
        })
    }

    fn enable_network_adapter_and_ping<'a>(
        &'a self,
        interface: &'a str,
        ip: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.set_adapter(interface, true).await?;
            settle(&self.config).await;
            if !self.ping_network_adapter_ip(ip).await? {
                return Err(TestError::Fail(format!(
                    "{ip} does not answer after enabling {interface}"
                ))
                .into());
            }
            Ok(())
        })
    }

    fn generate_virtual_functions<'a>(
        &'a self,
        _interface: &'a str,
        _count: u32,
    ) -> BoxFuture<'a, Result<Vec<String>, PlatvalError>> {
        Box::pin(async { Err(TestError::NotImplemented("sr-iov on windows".to_owned()).into()) })
    }

    fn assign_static_ip_to_virtual_interfaces_and_ping<'a>(
        &'a self,
        _vfs: &'a [String],
    ) -> BoxFuture<'a, Result<InterfaceMap, PlatvalError>> {
        Box::pin(async { Err(TestError::NotImplemented("sr-iov on windows".to_owned()).into()) })
    }

    fn reset_virtual_network_adapters<'a>(
        &'a self,
        _interface: &'a str,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async { Err(TestError::NotImplemented("sr-iov on windows".to_owned()).into()) })
    }

    fn deallocate_static_ip<'a>(
        &'a self,
        interfaces: &'a [String],
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            for interface in interfaces {
                let command = format!("netsh interface ip set address \"{interface}\" dhcp");
                self.executor.execute_checked(&command, self.timeout).await?;
            }
            Ok(())
        })
    }
}

pub fn factory(
    os: OsType,
    executor: Arc<dyn SutExecutor>,
    config: &NetworkConfig,
    timeout: Duration,
) -> Result<Box<dyn NetworkProvider>, PlatvalError> {
    match os {
        OsType::Linux => Ok(Box::new(LinuxNetworkProvider::new(executor, config, timeout)?)),
        OsType::Windows => Ok(Box::new(WindowsNetworkProvider::new(executor, config, timeout)?)),
        OsType::Esxi => Err(TestError::Unsupported("network provider on esxi".to_owned()).into()),
    }
}

// ─── iperf3 ──────────────────────────────────────────────────────────

/// Delay between starting the server and starting the client.
const IPERF_SERVER_STARTUP: Duration = Duration::from_secs(2);

/// Outputs of a finished iperf3 pair.
#[derive(Debug, Clone)]
pub struct IperfReport {
    pub server: CommandOutput,
    pub client: CommandOutput,
    /// Sender bitrate from the client summary, e.g. `9.41 Gbits/sec`
    pub bitrate: Option<String>,
}

fn iperf_binary(os: OsType) -> &'static str {
    match os {
        OsType::Windows => "iperf3.exe",
        OsType::Linux | OsType::Esxi => "iperf3",
    }
}

/// Interval lines reporting zero bytes transferred.
pub fn data_loss_lines(output: &str) -> Result<Vec<String>, ProviderError> {
    let loss = Regex::new(r"sec\s+0\.00\s+Bytes\s+0\.00\s+bits/sec")?;
    Ok(output
        .lines()
        .filter(|line| loss.is_match(line))
        .map(|line| line.trim().to_owned())
        .collect())
}

/// Runs a one-shot iperf3 server on `server` and a client on `client`
/// concurrently. Any interval without traffic on either side fails the
/// pair.
pub async fn run_iperf_pair(
    server: Arc<dyn SutExecutor>,
    client: Arc<dyn SutExecutor>,
    server_ip: &str,
    seconds: u64,
) -> Result<IperfReport, PlatvalError> {
    let budget = Duration::from_secs(seconds + 60);
    let server_cmd = format!("{} -s -1", iperf_binary(server.os_type()));
    info!(server = %server.description(), "starting iperf3 server");
    let server_task = tokio::spawn(async move { server.execute_checked(&server_cmd, budget).await });

    tokio::time::sleep(IPERF_SERVER_STARTUP).await;
    let client_cmd = format!("{} -c {server_ip} -t {seconds}", iperf_binary(client.os_type()));
    info!(client = %client.description(), server_ip, seconds, "starting iperf3 client");
    let client_result = client.execute_checked(&client_cmd, budget).await;

    let server_result = match server_task.await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "iperf3 server task did not complete");
            return Err(TestError::Setup(format!("iperf3 server task failed: {e}")).into());
        }
    };
    let client_out = client_result?;
    let server_out = server_result?;

    for (side, out) in [("client", &client_out), ("server", &server_out)] {
        let lost = data_loss_lines(&out.stdout)?;
        if let Some(first) = lost.first() {
            return Err(TestError::Fail(format!(
                "iperf3 {side} reported {} interval(s) without traffic, first: {first}",
                lost.len()
            ))
            .into());
        }
    }

    let bitrate = Regex::new(r"([\d.]+\s+[KMG]?bits/sec).*sender")
        .map_err(ProviderError::from)?
        .captures(&client_out.stdout)
        .map(|c| c[1].to_owned());
    info!(?bitrate, "iperf3 pair finished without data loss");
    Ok(IperfReport {
        server: server_out,
        client: client_out,
        bitrate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use platval_core::exec::ScriptedExecutor;
    use platval_core::types::Verdict;

    const T: Duration = Duration::from_secs(5);

    const NMCLI: &str = "\
DEVICE      TYPE      STATE         CONNECTION
eno1        ethernet  connected     eno1
ens1f0      ethernet  connected     ens1f0
ens1f1      ethernet  connected     ens1f1
ens2f0      ethernet  disconnected  --
lo          loopback  unmanaged     --";

    fn config() -> NetworkConfig {
        NetworkConfig {
            settle_secs: 0,
            ..NetworkConfig::default()
        }
    }

    fn linux(exec: &Arc<ScriptedExecutor>) -> LinuxNetworkProvider {
        LinuxNetworkProvider::new(exec.clone(), &config(), T).unwrap()
    }

    fn linux_sut() -> Arc<ScriptedExecutor> {
        Arc::new(
            ScriptedExecutor::new(OsType::Linux)
                .with_reply("nmcli device status", NMCLI)
                .with_reply(
                    "ifconfig eno1",
                    "eno1: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 1500\n        inet 192.168.1.20  netmask 255.255.255.0  broadcast 192.168.1.255\n",
                )
                .with_reply(
                    "ifconfig ens1f0",
                    "ens1f0: flags=4163<UP>  mtu 1500\n        inet 10.10.10.10  netmask 255.255.255.0  broadcast 10.10.10.255\n",
                ),
        )
    }

    #[tokio::test]
    async fn interfaces_are_connected_ethernet_rows() {
        let exec = linux_sut();
        let ifaces = linux(&exec).get_network_interfaces().await.unwrap();
        assert_eq!(ifaces, vec!["eno1", "ens1f0", "ens1f1"]);
    }

    #[tokio::test]
    async fn management_interface_has_prefix_address() {
        let exec = linux_sut();
        let addr = linux(&exec).get_sut_ip().await.unwrap();
        assert_eq!(addr.interface, "eno1");
        assert_eq!(addr.ip, "192.168.1.20");
    }

    #[tokio::test]
    async fn missing_management_address_is_setup_error() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux).with_reply("nmcli device status", NMCLI));
        let err = linux(&exec).get_sut_ip().await.unwrap_err();
        assert_eq!(err.verdict(), Verdict::Error);
    }

    #[tokio::test]
    async fn adapter_interfaces_skip_management_and_read_addresses() {
        let exec = linux_sut();
        let map = linux(&exec)
            .get_network_adapter_interfaces(false)
            .await
            .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["ens1f0"], "10.10.10.10");
        assert_eq!(map["ens1f1"], "");
    }

    #[tokio::test]
    async fn adapter_interfaces_get_static_addresses_in_order() {
        let exec = linux_sut();
        let map = linux(&exec)
            .get_network_adapter_interfaces(true)
            .await
            .unwrap();
        assert_eq!(map["ens1f0"], "10.10.10.10");
        assert_eq!(map["ens1f1"], "10.10.10.11");
        assert_eq!(exec.count_matching("ifconfig ens1f1 10.10.10.11"), 1);
    }

    #[tokio::test]
    async fn disable_fails_when_address_still_answers() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux).with_reply(
            "ping 10.10.10.10",
            "64 bytes from 10.10.10.10: icmp_seq=1 ttl=64 time=0.045 ms\n",
        ));
        let err = linux(&exec)
            .disable_network_adapter_and_ping("ens1f0", "10.10.10.10")
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
        assert!(exec.position_of("nmcli device disconnect ens1f0") < exec.position_of("ping"));
    }

    #[tokio::test]
    async fn disable_passes_when_unreachable() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux).with_failure(
            "ping 10.10.10.10",
            1,
            "",
        ));
        linux(&exec)
            .disable_network_adapter_and_ping("ens1f0", "10.10.10.10")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn enable_requires_replies() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux));
        let err = linux(&exec)
            .enable_network_adapter_and_ping("ens1f0", "10.10.10.10")
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
        assert_eq!(exec.count_matching("nmcli device connect ens1f0"), 1);
        assert_eq!(exec.count_matching("ping 10.10.10.10 -c 4"), 1);
    }

    #[tokio::test]
    async fn virtual_functions_are_counted_in_lspci() {
        let lspci = "\
5e:00.0 Ethernet controller: Intel Corporation Ethernet Controller E810-C for QSFP
5e:01.0 Ethernet controller: Intel Corporation Ethernet Adaptive Virtual Function (rev 02)
5e:01.1 Ethernet controller: Intel Corporation Ethernet Adaptive Virtual Function (rev 02)";
        let exec = Arc::new(ScriptedExecutor::new(OsType::Linux).with_reply("lspci | grep net", lspci));
        let provider = linux(&exec);
        let vfs = provider.generate_virtual_functions("ens1f0", 2).await.unwrap();
        assert_eq!(vfs, vec!["ens1f0v0", "ens1f0v1"]);
        assert_eq!(
            exec.history()[0],
            "echo 2 > /sys/class/net/ens1f0/device/sriov_numvfs"
        );

        let err = provider
            .generate_virtual_functions("ens1f0", 4)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected 4 virtual functions"));
    }

    #[tokio::test]
    async fn vf_addresses_must_answer() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Linux)
                .with_reply("ping 20.20.20.20", "64 bytes from 20.20.20.20: icmp_seq=1 ttl=64 time=0.1 ms"),
        );
        let provider = linux(&exec);
        let vfs = vec!["ens1f0v0".to_owned(), "ens1f0v1".to_owned()];
        let err = provider
            .assign_static_ip_to_virtual_interfaces_and_ping(&vfs)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("20.20.20.21"));
        assert_eq!(exec.count_matching("ifconfig ens1f0v0 20.20.20.20"), 1);
    }

    #[tokio::test]
    async fn windows_sriov_is_not_implemented() {
        let exec = Arc::new(ScriptedExecutor::new(OsType::Windows));
        let provider = WindowsNetworkProvider::new(exec, &config(), T).unwrap();
        let err = provider
            .generate_virtual_functions("Ethernet 2", 2)
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Verdict::NotImplemented);
    }

    #[tokio::test]
    async fn windows_ping_needs_ttl_reply() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Windows)
                .with_reply("ping -n 4 10.10.10.10", "Reply from 10.10.10.10: bytes=32 time<1ms TTL=128\r\n")
                .with_reply("ping -n 4 10.10.10.11", "Reply from 10.10.10.1: Destination host unreachable.\r\n"),
        );
        let provider = WindowsNetworkProvider::new(exec, &config(), T).unwrap();
        assert!(provider.ping_network_adapter_ip("10.10.10.10").await.unwrap());
        assert!(!provider.ping_network_adapter_ip("10.10.10.11").await.unwrap());
    }

    #[tokio::test]
    async fn windows_static_addresses_use_netsh() {
        let exec = Arc::new(
            ScriptedExecutor::new(OsType::Windows)
                .with_reply("Get-NetAdapter", "Ethernet\r\nEthernet 2\r\n")
                .with_reply("-InterfaceAlias 'Ethernet'", "192.168.1.30\r\n"),
        );
        let provider = WindowsNetworkProvider::new(exec.clone(), &config(), T).unwrap();
        let map = provider.get_network_adapter_interfaces(true).await.unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["Ethernet 2"], "10.10.10.10");
        assert_eq!(
            exec.count_matching(
                "netsh interface ipv4 set address name=\"Ethernet 2\" static 10.10.10.10 255.255.255.0"
            ),
            1
        );
    }

    #[test]
    fn data_loss_detects_zero_intervals_only() {
        let out = "\
[  5]   0.00-1.00   sec  1.09 GBytes  9.39 Gbits/sec    0   1.52 MBytes
[  5]   1.00-2.00   sec  0.00 Bytes  0.00 bits/sec    2   1.41 KBytes
[  5]   2.00-3.00   sec   110.00 MBytes   920.00 Mbits/sec";
        let lost = data_loss_lines(out).unwrap();
        assert_eq!(lost.len(), 1);
        assert!(lost[0].starts_with("[  5]   1.00-2.00"));
    }

    const IPERF_CLIENT: &str = "\
[  5]   0.00-1.00   sec  1.09 GBytes  9.39 Gbits/sec    0   1.52 MBytes
[ ID] Interval           Transfer     Bitrate         Retr
[  5]   0.00-10.00  sec  10.9 GBytes  9.41 Gbits/sec    0             sender
[  5]   0.00-10.04  sec  10.9 GBytes  9.37 Gbits/sec                  receiver";

    #[tokio::test(start_paused = true)]
    async fn iperf_pair_runs_server_and_client() {
        let server = Arc::new(ScriptedExecutor::new(OsType::Linux).with_reply("iperf3 -s -1", "Server listening on 5201"));
        let client = Arc::new(ScriptedExecutor::new(OsType::Linux).with_reply("iperf3 -c", IPERF_CLIENT));
        let report = run_iperf_pair(server.clone(), client.clone(), "10.10.10.11", 10)
            .await
            .unwrap();
        assert_eq!(report.bitrate.as_deref(), Some("9.41 Gbits/sec"));
        assert_eq!(server.history(), vec!["iperf3 -s -1"]);
        assert_eq!(client.history(), vec!["iperf3 -c 10.10.10.11 -t 10"]);
    }

    #[tokio::test(start_paused = true)]
    async fn iperf_pair_fails_on_server_side_loss() {
        let server = Arc::new(ScriptedExecutor::new(OsType::Linux).with_reply(
            "iperf3 -s -1",
            "[  5]   3.00-4.00   sec  0.00 Bytes  0.00 bits/sec",
        ));
        let client = Arc::new(ScriptedExecutor::new(OsType::Windows).with_reply("iperf3.exe -c", IPERF_CLIENT));
        let err = run_iperf_pair(server, client.clone(), "10.10.10.11", 10)
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
        assert!(err.to_string().contains("server"));
        assert_eq!(client.history(), vec!["iperf3.exe -c 10.10.10.11 -t 10"]);
    }
}
