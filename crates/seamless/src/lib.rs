#![doc = include_str!("../README.md")]
//!
//! # Modules
//!
//! - [`bmc`]: the [`BmcClient`] seam, its Redfish implementation and the journal/SEL cursor
//! - [`mock`]: scripted in-memory BMC
//! - [`staging`]: journal classification and the staging wait
//! - [`version`]: in-band and inventory version reads
//! - [`workload`]: a workload kept busy on the SUT during staging
//! - [`power`]: SUT resets through Redfish `ComputerSystem.Reset`
//! - [`update`]: the update flow, loops and post-update checks
//! - [`error`]: seamless error type

pub mod bmc;
pub mod error;
pub mod mock;
pub mod power;
pub mod staging;
pub mod update;
pub mod version;
pub mod workload;

// errors
pub use error::SeamlessError;

// bmc
pub use bmc::{BmcClient, FirmwareInventoryItem, LogCursor, LogEntry, RedfishClient, SystemResetType};
pub use mock::{MockBmc, StageOutcome};
pub use power::RedfishPowerControl;

// update flow
pub use staging::{StagingEvent, classify, wait_for_staging};
pub use update::{
    CapsuleUpdate, PostUpdateReport, ResetPolicy, SNAPSHOT_KINDS, SeamlessUpdater, UpdateReport,
};
pub use version::{VersionReader, matches_expected};
pub use workload::BackgroundWorkload;
