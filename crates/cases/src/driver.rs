//! NIC driver install / uninstall cycle.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use platval_core::error::{PlatvalError, TestError};
use platval_core::testcase::{TestCase, TestCaseInfo, TestContext};
use platval_core::types::{OsType, Verdict};
use platval_providers::driver::{self, DriverProvider, NicModel};
use platval_providers::usb::{self, CommandUsbSwitch};

pub const INFO: TestCaseInfo = TestCaseInfo {
    id: "driver-install-cycle",
    name: "NIC driver install cycle",
    description: "Installs the driver of a NIC model, checks the controller is bound to it, \
                  uninstalls it, verifies it is gone and installs it again",
    tags: &["driver", "network"],
    supported_os: &[OsType::Linux, OsType::Windows],
};

fn parse_nic(name: &str) -> Result<&'static NicModel, String> {
    NicModel::lookup(name).map_err(|_| format!("expected one of: {}", NicModel::names().join(", ")))
}

/// Install, verify, uninstall and reinstall a NIC driver.
#[derive(Debug, Clone, Parser)]
pub struct DriverArgs {
    /// NIC model: jacksonville, foxville, fortville, carlsville, columbiaville
    #[arg(long, value_parser = parse_nic)]
    pub nic: &'static NicModel,

    /// Driver inf file name (Windows)
    #[arg(long)]
    pub inf: Option<String>,

    /// Driver archive on the host, ferried to the SUT over USB first
    #[arg(long)]
    pub archive: Option<PathBuf>,

    /// Build the driver from its source archive on the SUT (Linux)
    #[arg(long)]
    pub from_source: bool,
}

pub struct DriverInstallCycle {
    model: &'static NicModel,
    inf: Option<String>,
    archive: Option<PathBuf>,
    from_source: bool,
    provider: Option<Box<dyn DriverProvider>>,
    uninstalled: bool,
}

impl DriverInstallCycle {
    pub fn new(args: DriverArgs) -> Result<Self, PlatvalError> {
        Ok(Self {
            model: args.nic,
            inf: args.inf,
            archive: args.archive,
            from_source: args.from_source,
            provider: None,
            uninstalled: false,
        })
    }

    /// `(code, name)` as the provider of `os` expects them.
    fn handles(&self, os: OsType) -> Result<(String, String), PlatvalError> {
        match os {
            OsType::Windows => {
                let inf = self.inf.clone().ok_or_else(|| {
                    TestError::Setup("--inf is required on windows".to_owned())
                })?;
                Ok((inf, self.model.device_id.to_owned()))
            }
            OsType::Linux | OsType::Esxi => {
                Ok((self.model.driver_code.to_owned(), self.model.name.to_owned()))
            }
        }
    }
}

fn not_prepared() -> PlatvalError {
    TestError::Setup("driver provider not prepared".to_owned()).into()
}

impl TestCase for DriverInstallCycle {
    fn info(&self) -> &TestCaseInfo {
        &INFO
    }

    async fn prepare(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let provider = driver::factory(ctx.os(), ctx.sut.clone(), &ctx.config)?;
        if let Some(archive) = &self.archive {
            let host = &ctx.config.host;
            let switch = CommandUsbSwitch::from_config(ctx.host.clone(), host, ctx.timeout())
                .ok_or_else(|| {
                    TestError::Setup("--archive needs usb switch commands in [host]".to_owned())
                })?;
            let host_usb = usb::factory(host.os, ctx.host.clone(), host, ctx.timeout())?;
            provider
                .copy_driver_files(host_usb.as_ref(), &switch, archive)
                .await?;
        }
        self.provider = Some(provider);
        Ok(())
    }

    async fn execute(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
        let (code, name) = self.handles(ctx.os())?;
        let (code, name) = (code.as_str(), name.as_str());
        let provider = self.provider.as_deref().ok_or_else(not_prepared)?;

        if self.from_source {
            provider.install_from_source(code, name).await?;
        } else {
            provider.install_driver(code, name).await?;
        }

        match provider.get_ethernet_devices().await {
            Ok(devices) => {
                let bdfs = provider.identify_device_controller(&devices, code).await?;
                ctx.note(format!(
                    "{} controller(s) at {} use {code}",
                    self.model.name,
                    bdfs.join(", ")
                ));
            }
            Err(PlatvalError::Test(TestError::NotImplemented(what))) => {
                info!(%what, "controller identification skipped");
            }
            Err(e) => return Err(e),
        }

        provider.uninstall_driver(code, name).await?;
        if provider.is_driver_installed(code, name).await?.is_some() {
            return Err(TestError::Fail(format!("{name} driver still present after uninstall")).into());
        }
        self.uninstalled = true;

        provider.install_driver(code, name).await?;
        let Some(handle) = provider.is_driver_installed(code, name).await? else {
            return Err(TestError::Fail(format!("{name} driver missing after reinstall")).into());
        };
        self.uninstalled = false;
        info!(driver = %handle, "driver install cycle complete");
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &TestContext, verdict: Verdict) -> Result<(), PlatvalError> {
        if !self.uninstalled {
            return Ok(());
        }
        warn!(%verdict, "driver left uninstalled, reinstalling");
        let (code, name) = self.handles(ctx.os())?;
        let provider = self.provider.as_deref().ok_or_else(not_prepared)?;
        provider.install_driver(&code, &name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platval_core::testcase::parse_case_args;

    fn args(tokens: &[&str]) -> DriverArgs {
        parse_case_args(INFO.id, tokens.iter().copied()).unwrap()
    }

    #[test]
    fn nic_model_is_resolved_while_parsing() {
        let case = DriverInstallCycle::new(args(&["--nic", "Columbiaville"])).unwrap();
        assert_eq!(case.model.driver_code, "ice");
        let (code, name) = case.handles(OsType::Linux).unwrap();
        assert_eq!((code.as_str(), name.as_str()), ("ice", "columbiaville"));
    }

    #[test]
    fn unknown_model_is_rejected() {
        let err = parse_case_args::<DriverArgs, _, _>(INFO.id, ["--nic", "tahoe"]).unwrap_err();
        assert!(err.to_string().contains("columbiaville"));
    }

    #[test]
    fn windows_needs_inf() {
        let case = DriverInstallCycle::new(args(&["--nic", "foxville"])).unwrap();
        assert!(case.handles(OsType::Windows).is_err());
        let case = DriverInstallCycle::new(args(&["--nic", "foxville", "--inf", "e2f.inf"])).unwrap();
        let (inf, device) = case.handles(OsType::Windows).unwrap();
        assert_eq!((inf.as_str(), device.as_str()), ("e2f.inf", "DEV_15F2"));
    }
}
