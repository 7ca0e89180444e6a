//! Guest provisioning on the SUT: KVM through `virt-install` / `virsh`,
//! Hyper-V through its PowerShell module.
//!
//! Guests boot from a private copy of a base image in `vm.image_dir`, so
//! destroying a guest never touches the base image. Storage pools are
//! directories named after the pool under the same directory.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use platval_core::config::VmConfig;
use platval_core::error::{PlatvalError, TestError};
use platval_core::exec::{BoxFuture, SutExecutor};
use platval_core::types::OsType;

use crate::error::ProviderError;

const IP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmSpec {
    pub name: String,
    /// Base image file name inside `image_dir`
    pub image: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    /// Linux bridge (KVM) or virtual switch (Hyper-V)
    pub bridge: String,
    pub os_variant: String,
}

impl VmSpec {
    pub fn from_config(name: &str, image: &str, config: &VmConfig) -> Self {
        Self {
            name: name.to_owned(),
            image: image.to_owned(),
            memory_mb: config.memory_mb,
            vcpus: config.vcpus,
            bridge: config.bridge.clone(),
            os_variant: config.os_variant.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmInfo {
    pub name: String,
    /// As the hypervisor prints it (`running`, `shut off`, `Off`, ...)
    pub state: String,
}

pub trait VmProvider: Send + Sync {
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> BoxFuture<'a, Result<(), PlatvalError>>;

    fn start_vm<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>>;

    fn shutdown_vm<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>>;

    /// Powers the guest off and removes it together with its disk.
    fn destroy_vm<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>>;

    fn list_vms(&self) -> BoxFuture<'_, Result<Vec<VmInfo>, PlatvalError>>;

    /// IPv4 address of the guest once it has one.
    fn get_vm_ip<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>, PlatvalError>>;

    fn ping_vm_from_sut<'a>(&'a self, ip: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>>;

    fn create_storage_pool<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>>;

    fn find_if_storage_pool_exist<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, PlatvalError>>;

    fn delete_storage_pool<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>>;

    fn check_if_vm_exist<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, PlatvalError>> {
        Box::pin(async move { Ok(self.list_vms().await?.iter().any(|vm| vm.name == name)) })
    }

    /// Polls for the guest's address until `timeout`; `Fail` when none
    /// shows up.
    fn wait_for_vm<'a>(
        &'a self,
        name: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String, PlatvalError>> {
        Box::pin(async move {
            let started = Instant::now();
            loop {
                if let Some(ip) = self.get_vm_ip(name).await? {
                    info!(vm = name, %ip, elapsed_ms = started.elapsed().as_millis() as u64, "vm is up");
                    return Ok(ip);
                }
                if started.elapsed() >= timeout {
                    return Err(TestError::Fail(format!(
                        "vm {name} has no ip address after {}s",
                        timeout.as_secs()
                    ))
                    .into());
                }
                debug!(vm = name, "waiting for vm ip");
                tokio::time::sleep(IP_POLL_INTERVAL).await;
            }
        })
    }
}

// ─── KVM ─────────────────────────────────────────────────────────────

/// `virsh list --all` rows below the dashed separator.
pub fn parse_virsh_list(output: &str) -> Vec<VmInfo> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _id = fields.next()?;
            let name = fields.next()?;
            let state = fields.collect::<Vec<_>>().join(" ");
            Some(VmInfo {
                name: name.to_owned(),
                state,
            })
        })
        .collect()
}

/// Pool names from `virsh pool-list --all`.
pub fn parse_pool_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_owned)
        .collect()
}

pub struct KvmProvider {
    executor: Arc<dyn SutExecutor>,
    image_dir: String,
    timeout: Duration,
    domifaddr: Regex,
    ping_reply: Regex,
}

impl KvmProvider {
    pub fn new(
        executor: Arc<dyn SutExecutor>,
        config: &VmConfig,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            executor,
            image_dir: config.image_dir.trim_end_matches('/').to_owned(),
            timeout,
            domifaddr: Regex::new(r"ipv4\s+(\d+\.\d+\.\d+\.\d+)(/\d+)?")?,
            ping_reply: Regex::new(r"bytes\sfrom.*icmp_seq.*ttl.*time")?,
        })
    }

    async fn virsh(&self, args: &str) -> Result<String, PlatvalError> {
        let out = self
            .executor
            .execute_checked(&format!("virsh {args}"), self.timeout)
            .await?;
        Ok(out.stdout)
    }

    fn disk_path(&self, name: &str) -> String {
        format!("{}/{name}.qcow2", self.image_dir)
    }
}

impl VmProvider for KvmProvider {
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            if self.check_if_vm_exist(&spec.name).await? {
                return Err(TestError::Setup(format!("vm {} already exists", spec.name)).into());
            }
            let disk = self.disk_path(&spec.name);
            self.executor
                .execute_checked(
                    &format!("cp --sparse=always {}/{} {disk}", self.image_dir, spec.image),
                    self.timeout * 4,
                )
                .await?;
            let command = format!(
                "virt-install --name {name} --memory {mem} --vcpus {cpus} \
                 --disk path={disk},format=qcow2,bus=virtio --import \
                 --os-variant {variant} --network bridge={bridge},model=virtio --noautoconsole",
                name = spec.name,
                mem = spec.memory_mb,
                cpus = spec.vcpus,
                variant = spec.os_variant,
                bridge = spec.bridge,
            );
            info!(vm = %spec.name, image = %spec.image, "creating vm");
            self.executor.execute_checked(&command, self.timeout * 4).await?;
            Ok(())
        })
    }

    fn start_vm<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.virsh(&format!("start {name}")).await?;
            info!(vm = name, "vm started");
            Ok(())
        })
    }

    fn shutdown_vm<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.virsh(&format!("shutdown {name}")).await?;
            info!(vm = name, "vm shutdown requested");
            Ok(())
        })
    }

    fn destroy_vm<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let off = self
                .executor
                .execute(&format!("virsh destroy {name}"), self.timeout)
                .await?;
            if !off.success() {
                debug!(vm = name, stderr = %off.stderr.trim(), "vm was not running");
            }
            self.virsh(&format!("undefine {name} --remove-all-storage")).await?;
            info!(vm = name, "vm removed");
            Ok(())
        })
    }

    fn list_vms(&self) -> BoxFuture<'_, Result<Vec<VmInfo>, PlatvalError>> {
        Box::pin(async move { Ok(parse_virsh_list(&self.virsh("list --all").await?)) })
    }

    fn get_vm_ip<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute(&format!("virsh domifaddr {name}"), self.timeout)
                .await?;
            Ok(self
                .domifaddr
                .captures(&out.stdout)
                .map(|c| c[1].to_owned()))
        })
    }

    fn ping_vm_from_sut<'a>(&'a self, ip: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute(&format!("ping {ip} -c 4"), self.timeout)
                .await?;
            if !self.ping_reply.is_match(&out.stdout) {
                return Err(TestError::Fail(format!("vm at {ip} does not answer pings")).into());
            }
            Ok(())
        })
    }

    fn create_storage_pool<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let target = format!("{}/{name}", self.image_dir);
            self.virsh(&format!("pool-define-as {name} --type dir --target {target}"))
                .await?;
            for step in ["pool-build", "pool-start", "pool-autostart"] {
                self.virsh(&format!("{step} {name}")).await?;
            }
            info!(pool = name, %target, "storage pool created");
            Ok(())
        })
    }

    fn find_if_storage_pool_exist<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, PlatvalError>> {
        Box::pin(async move {
            let pools = parse_pool_list(&self.virsh("pool-list --all").await?);
            Ok(pools.iter().any(|p| p == name))
        })
    }

    fn delete_storage_pool<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let stop = self
                .executor
                .execute(&format!("virsh pool-destroy {name}"), self.timeout)
                .await?;
            if !stop.success() {
                warn!(pool = name, stderr = %stop.stderr.trim(), "pool was not active");
            }
            self.virsh(&format!("pool-undefine {name}")).await?;
            info!(pool = name, "storage pool deleted");
            Ok(())
        })
    }
}

// ─── Hyper-V ─────────────────────────────────────────────────────────

pub struct HyperVProvider {
    executor: Arc<dyn SutExecutor>,
    image_dir: String,
    timeout: Duration,
    ping_reply: Regex,
}

impl HyperVProvider {
    pub fn new(
        executor: Arc<dyn SutExecutor>,
        config: &VmConfig,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            executor,
            image_dir: config.image_dir.trim_end_matches(['\\', '/']).to_owned(),
            timeout,
            ping_reply: Regex::new(r"Reply from .*TTL=")?,
        })
    }

    async fn powershell(&self, script: &str) -> Result<String, PlatvalError> {
        let out = self
            .executor
            .execute_checked(&format!("powershell \"{script}\""), self.timeout)
            .await?;
        Ok(out.stdout)
    }

    fn disk_path(&self, name: &str) -> String {
        format!("{}\\{name}.vhdx", self.image_dir)
    }
}

/// `Get-VM` rows as `Name State`; the state is the last column.
pub fn parse_get_vm(output: &str) -> Vec<VmInfo> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, state) = line.rsplit_once(char::is_whitespace)?;
            Some(VmInfo {
                name: name.trim().to_owned(),
                state: state.to_owned(),
            })
        })
        .collect()
}

impl VmProvider for HyperVProvider {
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            if self.check_if_vm_exist(&spec.name).await? {
                return Err(TestError::Setup(format!("vm {} already exists", spec.name)).into());
            }
            let disk = self.disk_path(&spec.name);
            self.powershell(&format!(
                "Copy-Item '{}\\{}' '{disk}'",
                self.image_dir, spec.image
            ))
            .await?;
            info!(vm = %spec.name, image = %spec.image, "creating vm");
            self.powershell(&format!(
                "New-VM -Name '{}' -MemoryStartupBytes {}MB -Generation 2 -VHDPath '{disk}' -SwitchName '{}'",
                spec.name, spec.memory_mb, spec.bridge
            ))
            .await?;
            self.powershell(&format!(
                "Set-VMProcessor -VMName '{}' -Count {}",
                spec.name, spec.vcpus
            ))
            .await?;
            Ok(())
        })
    }

    fn start_vm<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.powershell(&format!("Start-VM -Name '{name}'")).await?;
            Ok(())
        })
    }

    fn shutdown_vm<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.powershell(&format!("Stop-VM -Name '{name}' -Force")).await?;
            Ok(())
        })
    }

    fn destroy_vm<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.powershell(&format!("Stop-VM -Name '{name}' -TurnOff -Force"))
                .await?;
            self.powershell(&format!("Remove-VM -Name '{name}' -Force"))
                .await?;
            let disk = self.disk_path(name);
            self.powershell(&format!("Remove-Item -Force '{disk}'")).await?;
            info!(vm = name, "vm removed");
            Ok(())
        })
    }

    fn list_vms(&self) -> BoxFuture<'_, Result<Vec<VmInfo>, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .powershell("Get-VM | Format-Table -Property Name,State -HideTableHeaders")
                .await?;
            Ok(parse_get_vm(&out))
        })
    }

    fn get_vm_ip<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .powershell(&format!("(Get-VMNetworkAdapter -VMName '{name}').IPAddresses"))
                .await?;
            Ok(out
                .lines()
                .map(str::trim)
                .find(|addr| addr.split('.').count() == 4)
                .map(str::to_owned))
        })
    }

    fn ping_vm_from_sut<'a>(&'a self, ip: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            let out = self
                .executor
                .execute(&format!("ping -n 4 {ip}"), self.timeout)
                .await?;
            if !self.ping_reply.is_match(&out.stdout) {
                return Err(TestError::Fail(format!("vm at {ip} does not answer pings")).into());
            }
            Ok(())
        })
    }

    fn create_storage_pool<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.powershell(&format!(
                "New-Item -ItemType Directory -Force -Path '{}\\{name}'",
                self.image_dir
            ))
            .await?;
            Ok(())
        })
    }

    fn find_if_storage_pool_exist<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, PlatvalError>> {
        Box::pin(async move {
            let out = self
                .powershell(&format!("Test-Path '{}\\{name}'", self.image_dir))
                .await?;
            Ok(out.trim().eq_ignore_ascii_case("true"))
        })
    }

    fn delete_storage_pool<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(async move {
            self.powershell(&format!(
                "Remove-Item -Recurse -Force '{}\\{name}'",
                self.image_dir
            ))
            .await?;
            Ok(())
        })
    }
}

pub fn factory(
    os: OsType,
    executor: Arc<dyn SutExecutor>,
    config: &VmConfig,
    timeout: Duration,
) -> Result<Box<dyn VmProvider>, PlatvalError> {
    match os {
        OsType::Linux => Ok(Box::new(KvmProvider::new(executor, config, timeout)?)),
        OsType::Windows => Ok(Box::new(HyperVProvider::new(executor, config, timeout)?)),
        OsType::Esxi => Err(TestError::Unsupported("vm provisioning on esxi".to_owned()).into()),
    }
}
