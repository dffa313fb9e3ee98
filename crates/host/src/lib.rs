//! Virtual USB host controller
//!
//! Routes USB transfers submitted by drivers to simulated devices, either
//! emulated in-process or living in a separate device process.

pub mod config;
pub mod vhc;

pub use config::HostConfig;
pub use vhc::{
    DeviceId, DeviceRegistry, DeviceTarget, OwnerHandle, ProcessorSettings, SubmitError, Transfer,
    VirtualDevice,
};
