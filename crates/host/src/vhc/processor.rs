//! Per-device queue processor
//!
//! One long-lived task per plugged device. It takes transfers from the head
//! of the device queue, executes them against the device target outside the
//! device guard, intercepts SET_ADDRESS, requeues NAK'd transfers at the tail,
//! and invokes completion callbacks. The loop ends once the device has been
//! unplugged.

use crate::vhc::device::{DeviceState, ProcessorState, VirtualDevice};
use crate::vhc::transfer::Transfer;
use protocol::UsbError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Fixed pause between loop iterations by default
pub const DEFAULT_BUS_DELAY: Duration = Duration::from_millis(100);

/// What happens to transfers still queued when a device is unplugged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnplugPolicy {
    /// Complete each pending transfer with [`UsbError::Cancelled`]
    #[default]
    CancelPending,
    /// Drop pending transfers without invoking their callbacks
    Abandon,
}

/// Tuning shared by every queue processor of a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSettings {
    /// Pause after each processed transfer; zero only yields to the runtime
    pub bus_delay: Duration,
    /// Complete a transfer with NAK once it has been NAK'd more often than
    /// this. `None` retries forever.
    pub nak_retry_limit: Option<u32>,
    pub unplug_policy: UnplugPolicy,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            bus_delay: DEFAULT_BUS_DELAY,
            nak_retry_limit: None,
            unplug_policy: UnplugPolicy::default(),
        }
    }
}

/// Outcome of one execution, decided under the device guard
enum Disposition {
    Complete(Transfer, Result<usize, UsbError>),
    Requeued,
}

/// Drains one device's queue until the device is unplugged
pub struct QueueProcessor {
    device: Arc<VirtualDevice>,
    settings: ProcessorSettings,
}

impl QueueProcessor {
    pub fn new(device: Arc<VirtualDevice>, settings: ProcessorSettings) -> Self {
        Self { device, settings }
    }

    /// Run the processing loop
    pub async fn run(self) {
        let device_id = self.device.id();
        debug!("Queue processor for device {} started", device_id);

        loop {
            let next = {
                let mut state = self.device.lock();
                if !state.plugged {
                    break;
                }
                let next = state.queue.pop_front();
                state.processor = if next.is_some() {
                    ProcessorState::Executing
                } else {
                    ProcessorState::Idle
                };
                next
            };

            match next {
                Some(transfer) => {
                    self.process(transfer).await;
                    self.throttle().await;
                }
                // An empty queue goes straight back to the check once woken
                None => self.device.wait_for_work().await,
            }
        }

        self.shutdown();
        debug!("Queue processor for device {} stopped", device_id);
    }

    /// Execute one transfer and settle its outcome
    async fn process(&self, mut transfer: Transfer) {
        trace!("Device {} executing transfer {}", self.device.id(), transfer.id());

        let result = self.device.target().execute(&mut transfer).await;

        let disposition = {
            let mut state = self.device.lock();
            let disposition = self.settle(&mut state, transfer, result);
            state.processor = ProcessorState::Idle;
            disposition
        };

        // Callbacks never run under the device guard.
        if let Disposition::Complete(transfer, result) = disposition {
            debug!(
                "Transfer {} processed on device {}: {:?}",
                transfer.id(),
                self.device.id(),
                result
            );
            transfer.complete(result);
        }
    }

    fn settle(
        &self,
        state: &mut DeviceState,
        mut transfer: Transfer,
        result: Result<usize, UsbError>,
    ) -> Disposition {
        match result {
            Ok(size) => {
                if let Some(new_address) = transfer.set_address_target() {
                    info!(
                        "Device {} address changed from {} to {}",
                        self.device.id(),
                        state.address,
                        new_address
                    );
                    state.address = new_address;
                }
                Disposition::Complete(transfer, Ok(size))
            }
            Err(UsbError::Nak) => {
                let naks = transfer.record_nak();
                match self.settings.nak_retry_limit {
                    Some(limit) if naks > limit => {
                        warn!(
                            "Transfer {} NAK'd {} times, giving up",
                            transfer.id(),
                            naks
                        );
                        Disposition::Complete(transfer, Err(UsbError::Nak))
                    }
                    _ => {
                        trace!("Transfer {} NAK'd, requeued at tail", transfer.id());
                        state.queue.push_back(transfer);
                        Disposition::Requeued
                    }
                }
            }
            Err(e) => Disposition::Complete(transfer, Err(e)),
        }
    }

    /// Pause after a processed transfer, ending early if the device is unplugged
    async fn throttle(&self) {
        if self.settings.bus_delay.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.settings.bus_delay) => {}
            _ = self.device.wait_for_unplug() => {}
        }
    }

    /// Mark the processor stopped and apply the unplug policy to leftovers
    fn shutdown(&self) {
        let pending: Vec<Transfer> = {
            let mut state = self.device.lock();
            state.processor = ProcessorState::Stopped;
            state.queue.drain(..).collect()
        };

        if pending.is_empty() {
            return;
        }

        match self.settings.unplug_policy {
            UnplugPolicy::CancelPending => {
                debug!(
                    "Cancelling {} pending transfers of device {}",
                    pending.len(),
                    self.device.id()
                );
                for transfer in pending {
                    transfer.complete(Err(UsbError::Cancelled));
                }
            }
            UnplugPolicy::Abandon => {
                warn!(
                    "Device {} unplugged with {} pending transfers, dropping them",
                    self.device.id(),
                    pending.len()
                );
            }
        }
    }
}
