//! Common utilities for the virtual host controller
//!
//! This crate provides shared functionality between the host controller and
//! device processes, including the device-emulation contract, error handling,
//! logging setup, and the async channel bridge used to run an emulation on a
//! dedicated thread.

pub mod channel;
pub mod emulation;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{DeviceBridge, DeviceCommand, DeviceWorker, create_device_bridge};
pub use emulation::{LoopbackDevice, UsbEmulation};
pub use error::{Error, Result};
pub use logging::setup_logging;
