//! Guest provisioning on the SUT's hypervisor.

use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use platval_core::error::{PlatvalError, TestError};
use platval_core::testcase::{TestCase, TestCaseInfo, TestContext};
use platval_core::types::{OsType, Verdict};
use platval_providers::vm::{self, VmProvider, VmSpec};

pub const INFO: TestCaseInfo = TestCaseInfo {
    id: "vm-provisioning",
    name: "VM provisioning",
    description: "Creates a storage pool and a guest from a base image, waits for the guest's \
                  address and pings it from the SUT; the guest and pool are removed afterwards",
    tags: &["vm", "virtualization"],
    supported_os: &[OsType::Linux, OsType::Windows],
};

#[derive(Debug, Clone, Parser)]
pub struct VmArgs {
    /// Base image file name in vm.image_dir
    #[arg(long)]
    pub image: String,

    /// Guest name
    #[arg(long, default_value = "platval-vm")]
    pub name: String,

    /// Storage pool (default vm.pool_name)
    #[arg(long)]
    pub pool: Option<String>,

    /// Seconds to wait for the guest address (default vm.boot_wait_secs)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub boot_timeout: Option<u64>,
}

pub struct VmProvisioning {
    image: String,
    name: String,
    pool: Option<String>,
    boot_timeout: Option<u64>,
    provider: Option<Box<dyn VmProvider>>,
    created_pool: bool,
    created_vm: bool,
}

impl VmProvisioning {
    pub fn new(args: VmArgs) -> Result<Self, PlatvalError> {
        Ok(Self {
            image: args.image,
            name: args.name,
            pool: args.pool,
            boot_timeout: args.boot_timeout,
            provider: None,
            created_pool: false,
            created_vm: false,
        })
    }
}

fn not_prepared() -> PlatvalError {
    TestError::Setup("vm provider not prepared".to_owned()).into()
}

impl TestCase for VmProvisioning {
    fn info(&self) -> &TestCaseInfo {
        &INFO
    }

    async fn prepare(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let provider = vm::factory(ctx.os(), ctx.sut.clone(), &ctx.config.vm, ctx.timeout())?;
        let pool = self.pool.get_or_insert_with(|| ctx.config.vm.pool_name.clone());
        if !provider.find_if_storage_pool_exist(pool).await? {
            provider.create_storage_pool(pool).await?;
            self.created_pool = true;
        }
        if provider.check_if_vm_exist(&self.name).await? {
            warn!(vm = %self.name, "removing leftover guest");
            provider.destroy_vm(&self.name).await?;
        }
        self.provider = Some(provider);
        Ok(())
    }

    async fn execute(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let provider = self.provider.as_deref().ok_or_else(not_prepared)?;
        let spec = VmSpec::from_config(&self.name, &self.image, &ctx.config.vm);

        provider.create_vm(&spec).await?;
        self.created_vm = true;
        let running = provider
            .list_vms()
            .await?
            .iter()
            .any(|vm| vm.name == spec.name && vm.state.eq_ignore_ascii_case("running"));
        if !running {
            provider.start_vm(&spec.name).await?;
        }

        let timeout = Duration::from_secs(self.boot_timeout.unwrap_or(ctx.config.vm.boot_wait_secs));
        let ip = provider.wait_for_vm(&spec.name, timeout).await?;
        provider.ping_vm_from_sut(&ip).await?;
        info!(vm = %spec.name, %ip, "guest reachable from the sut");
        ctx.note(format!("{} is reachable at {ip}", spec.name));
        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &TestContext, _verdict: Verdict) -> Result<(), PlatvalError> {
        let Some(provider) = self.provider.as_deref() else {
            return Ok(());
        };
        let mut first_error = None;
        if self.created_vm {
            if let Err(e) = provider.destroy_vm(&self.name).await {
                warn!(vm = %self.name, error = %e, "could not remove guest");
                first_error.get_or_insert(e);
            }
        }
        if self.created_pool {
            if let Some(pool) = &self.pool {
                if let Err(e) = provider.delete_storage_pool(pool).await {
                    warn!(%pool, error = %e, "could not remove storage pool");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
