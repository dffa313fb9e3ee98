//! Device registry and transfer dispatcher
//!
//! The registry is the set of plugged virtual devices. [`DeviceRegistry::submit`]
//! routes a transfer to the device currently holding its bus address;
//! plugging a device starts its queue processor and unplugging stops it.
//!
//! Lock order is always registry guard, then device guard.

use crate::vhc::device::{DeviceId, VirtualDevice};
use crate::vhc::executor::DeviceTarget;
use crate::vhc::processor::{ProcessorSettings, QueueProcessor};
use crate::vhc::transfer::Transfer;
use protocol::UsbAddress;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Why a transfer could not be queued
#[derive(Debug, Error)]
pub enum SubmitError {
    /// No plugged device has the transfer's address
    ///
    /// The transfer is handed back untouched; no callback has run.
    #[error("no device at address {address}")]
    NotFound {
        address: UsbAddress,
        transfer: Box<Transfer>,
    },
}

impl SubmitError {
    /// Recover the rejected transfer
    pub fn into_transfer(self) -> Transfer {
        match self {
            SubmitError::NotFound { transfer, .. } => *transfer,
        }
    }
}

/// The set of plugged virtual devices
pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<VirtualDevice>>>,
    settings: ProcessorSettings,
    next_device_id: AtomicU32,
}

impl DeviceRegistry {
    pub fn new(settings: ProcessorSettings) -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            settings,
            next_device_id: AtomicU32::new(1),
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    fn devices_guard(&self) -> MutexGuard<'_, Vec<Arc<VirtualDevice>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a transfer on the device holding its address
    ///
    /// Never blocks on execution. When several devices share the address,
    /// the first registered one gets the transfer and the ambiguity is
    /// logged. On success the transfer belongs to the device until its
    /// callback fires.
    pub fn submit(&self, transfer: Transfer) -> Result<(), SubmitError> {
        let address = transfer.address();
        let transfer_id = transfer.id();
        let mut pending = Some(transfer);

        let devices = self.devices_guard();
        for device in devices.iter() {
            let mut state = device.lock();
            if state.address != address {
                continue;
            }
            match pending.take() {
                Some(transfer) => {
                    state.queue.push_back(transfer);
                    device.wake();
                    debug!(
                        "Transfer {} queued on device {} (address {})",
                        transfer_id,
                        device.id(),
                        address
                    );
                }
                None => warn!(
                    "Transfer {} would be accepted by more devices (address {}), \
                     also matched {}",
                    transfer_id,
                    address,
                    device.id()
                ),
            }
        }
        drop(devices);

        match pending {
            None => Ok(()),
            Some(transfer) => {
                debug!("Transfer {} rejected, no device at address {}", transfer_id, address);
                Err(SubmitError::NotFound {
                    address,
                    transfer: Box::new(transfer),
                })
            }
        }
    }

    /// Register a device and start its queue processor
    ///
    /// Must be called from within a Tokio runtime.
    pub fn plug(
        &self,
        address: UsbAddress,
        target: DeviceTarget,
    ) -> common::Result<Arc<VirtualDevice>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| common::Error::Other(format!("no Tokio runtime to plug into: {}", e)))?;

        let id = DeviceId(self.next_device_id.fetch_add(1, Ordering::Relaxed));
        let device = Arc::new(VirtualDevice::new(id, address, target));

        self.devices_guard().push(device.clone());

        let processor = QueueProcessor::new(device.clone(), self.settings.clone());
        device.attach_processor(runtime.spawn(processor.run()));

        info!(
            "Plugged device {} ({}) at address {}",
            id,
            device.target().kind(),
            address
        );
        Ok(device)
    }

    /// Remove a device and wait for its queue processor to finish
    pub async fn unplug(&self, id: DeviceId) -> common::Result<()> {
        let device = {
            let mut devices = self.devices_guard();
            let index = devices
                .iter()
                .position(|d| d.id() == id)
                .ok_or_else(|| common::Error::DeviceNotFound(id.to_string()))?;
            devices.remove(index)
        };

        device.stop().await;
        info!("Unplugged device {}", id);
        Ok(())
    }

    /// Unplug every device
    ///
    /// All devices leave the bus and are told to stop before any processor
    /// is joined, so one stalled device cannot hold the others on the bus.
    pub async fn unplug_all(&self) {
        let devices = std::mem::take(&mut *self.devices_guard());
        for device in &devices {
            device.request_stop();
        }

        let mut stopping = JoinSet::new();
        for device in devices {
            stopping.spawn(async move {
                device.stop().await;
                device.id()
            });
        }

        while let Some(joined) = stopping.join_next().await {
            match joined {
                Ok(id) => info!("Unplugged device {}", id),
                Err(e) => warn!("Failed to unplug device: {}", e),
            }
        }
    }

    /// Snapshot of the plugged devices, in registration order
    pub fn devices(&self) -> Vec<Arc<VirtualDevice>> {
        self.devices_guard().clone()
    }

    /// First registered device currently holding `address`
    pub fn find_by_address(&self, address: UsbAddress) -> Option<Arc<VirtualDevice>> {
        self.devices_guard()
            .iter()
            .find(|d| d.address() == address)
            .cloned()
    }

    pub fn find(&self, id: DeviceId) -> Option<Arc<VirtualDevice>> {
        self.devices_guard().iter().find(|d| d.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices_guard().is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(ProcessorSettings::default())
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        // Processors still running hold their own device handles; make
        // their loops exit.
        for device in self.devices_guard().iter() {
            device.request_stop();
        }
    }
}
