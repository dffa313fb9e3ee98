//! Virtual device process
//!
//! Runs a device emulation on a dedicated thread and serves it to a host
//! controller over a framed-message byte stream, normally a Unix socket.

pub mod config;
pub mod server;
pub mod worker;

pub use config::VdevConfig;
pub use server::DeviceServer;
pub use worker::{DeviceWorkerThread, spawn_device_worker};
