//! Virtual host controller transfer scheduling
//!
//! Drivers build a [`Transfer`] and hand it to [`DeviceRegistry::submit`],
//! which queues it on the device holding the target address. Each plugged
//! [`VirtualDevice`] has a [`QueueProcessor`] task that executes its queue in
//! order through a [`DeviceTarget`] and reports results through the
//! transfer's completion callback.

pub mod device;
pub mod executor;
pub mod processor;
pub mod registry;
pub mod remote;
pub mod requests;
pub mod transfer;

pub use device::{DeviceId, ProcessorState, VirtualDevice};
pub use executor::{DeviceOps, DeviceTarget, LocalExecutor, dispatch_transfer};
pub use processor::{DEFAULT_BUS_DELAY, ProcessorSettings, QueueProcessor, UnplugPolicy};
pub use registry::{DeviceRegistry, SubmitError};
pub use remote::RemoteExecutor;
pub use transfer::{CallbackArg, InCallback, OutCallback, OwnerHandle, Transfer, TransferId};
