//! Virtual device state
//!
//! A [`VirtualDevice`] owns the FIFO of transfers waiting for it, its current
//! bus address, and the target its queue processor executes against. All
//! mutable state sits behind one per-device guard that is only ever held for
//! a structural mutation, never across execution or a callback.

use crate::vhc::executor::DeviceTarget;
use crate::vhc::transfer::Transfer;
use protocol::UsbAddress;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

/// Registry-assigned device identifier
///
/// Stable for the lifetime of the device, unlike its bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vdev{}", self.0)
    }
}

/// What a device's queue processor is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Queue empty, waiting for work
    Idle,
    /// A transfer has been handed to the executor
    Executing,
    /// Device unplugged, loop finished
    Stopped,
}

/// State guarded by the per-device lock
#[derive(Debug)]
pub(crate) struct DeviceState {
    pub(crate) address: UsbAddress,
    pub(crate) plugged: bool,
    pub(crate) queue: VecDeque<Transfer>,
    pub(crate) processor: ProcessorState,
}

/// A simulated USB peripheral attached to the host controller
pub struct VirtualDevice {
    id: DeviceId,
    state: Mutex<DeviceState>,
    /// Signalled by submit and unplug
    wake: Notify,
    /// Signalled by unplug only, cuts the inter-iteration pause short
    unplugged: Notify,
    target: DeviceTarget,
    processor_task: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualDevice {
    pub(crate) fn new(id: DeviceId, address: UsbAddress, target: DeviceTarget) -> Self {
        Self {
            id,
            state: Mutex::new(DeviceState {
                address,
                plugged: true,
                queue: VecDeque::new(),
                processor: ProcessorState::Idle,
            }),
            wake: Notify::new(),
            unplugged: Notify::new(),
            target,
            processor_task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Current bus address
    pub fn address(&self) -> UsbAddress {
        self.lock().address
    }

    pub fn is_plugged(&self) -> bool {
        self.lock().plugged
    }

    /// Number of transfers waiting, not counting one being executed
    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn state(&self) -> ProcessorState {
        self.lock().processor
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    /// Acquire the device guard
    ///
    /// Every critical section is a single structural update, so a poisoned
    /// guard still protects consistent state.
    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake the queue processor if it is waiting for work
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    /// Suspend until [`wake`](Self::wake) is called
    ///
    /// A wake issued while nobody waits is remembered, so checking the queue
    /// under the guard and then waiting here cannot miss a submission.
    pub(crate) async fn wait_for_work(&self) {
        self.wake.notified().await;
    }

    /// Suspend until the device is unplugged
    pub(crate) async fn wait_for_unplug(&self) {
        self.unplugged.notified().await;
    }

    pub(crate) fn attach_processor(&self, handle: JoinHandle<()>) {
        let previous = self
            .processor_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if previous.is_some() {
            warn!("Device {} already had a queue processor attached", self.id);
        }
    }

    /// Clear the plugged flag and wake the processor so its loop exits
    pub(crate) fn request_stop(&self) {
        self.lock().plugged = false;
        self.wake();
        self.unplugged.notify_one();
    }

    /// Stop the queue processor and wait for its loop to terminate
    pub(crate) async fn stop(&self) {
        self.request_stop();

        let handle = self
            .processor_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Queue processor for device {} ended abnormally: {}", self.id, e);
            }
        }
    }
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("VirtualDevice")
            .field("id", &self.id)
            .field("address", &state.address)
            .field("plugged", &state.plugged)
            .field("queue_len", &state.queue.len())
            .field("processor", &state.processor)
            .field("target", &self.target.kind())
            .finish()
    }
}
