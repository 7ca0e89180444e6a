#![doc = include_str!("../README.md")]

pub mod bios;
pub mod config;
pub mod error;
pub mod exec;
pub mod metrics;
pub mod oslog;
pub mod power;
pub mod runner;
pub mod testcase;
pub mod types;

// errors
pub use error::{ConfigError, ExecError, KnobError, PlatvalError, RegistryError, TestError};

// configuration
pub use config::PlatvalConfig;

// execution
pub use exec::{BoxFuture, LocalExecutor, Reply, ScriptedExecutor, SshExecutor, SutExecutor};
pub use power::{PowerControl, ResetKind, SshPowerControl};

// lifecycle
pub use runner::{RunOptions, RunReport, TestRunner};
pub use testcase::{
    CaseFactory, DynTestCase, TestCase, TestCaseInfo, TestContext, TestRegistry, parse_case_args,
};

// domain types
pub use bios::{BiosKnobTool, KnobSet};
pub use types::{CommandOutput, FirmwareKind, FirmwareVersions, OsType, Verdict};
