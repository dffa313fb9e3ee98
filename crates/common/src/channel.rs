//! Async channel bridge between Tokio runtime and a device-emulation thread
//!
//! Device emulations are plain blocking code. The device process runs one on
//! a dedicated thread and talks to it from async connection handlers through
//! this bridge: commands go in over a bounded channel, each carrying a
//! oneshot sender for its reply.

use async_channel::{Receiver, Sender, bounded};
use protocol::{TransferType, UsbEndpoint, UsbError};
use tokio::sync::oneshot;

/// Commands from Tokio runtime to the device thread
#[derive(Debug)]
pub enum DeviceCommand {
    /// Control transfer, device to host
    ControlRead {
        setup: Vec<u8>,
        /// Size of the buffer to fill
        length: usize,
        response: oneshot::Sender<Result<Vec<u8>, UsbError>>,
    },

    /// Control transfer, host to device
    ControlWrite {
        setup: Vec<u8>,
        data: Vec<u8>,
        response: oneshot::Sender<Result<(), UsbError>>,
    },

    /// Data transfer, device to host
    DataIn {
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        length: usize,
        response: oneshot::Sender<Result<Vec<u8>, UsbError>>,
    },

    /// Data transfer, host to device
    DataOut {
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: Vec<u8>,
        response: oneshot::Sender<Result<(), UsbError>>,
    },

    /// Shutdown the device thread gracefully
    Shutdown,
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct DeviceBridge {
    cmd_tx: Sender<DeviceCommand>,
}

impl DeviceBridge {
    /// Send a command to the device thread
    pub async fn send_command(&self, cmd: DeviceCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Run a control read on the device thread
    pub async fn control_read(
        &self,
        setup: Vec<u8>,
        length: usize,
    ) -> crate::Result<Result<Vec<u8>, UsbError>> {
        let (response, rx) = oneshot::channel();
        self.send_command(DeviceCommand::ControlRead {
            setup,
            length,
            response,
        })
        .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Run a control write on the device thread
    pub async fn control_write(
        &self,
        setup: Vec<u8>,
        data: Vec<u8>,
    ) -> crate::Result<Result<(), UsbError>> {
        let (response, rx) = oneshot::channel();
        self.send_command(DeviceCommand::ControlWrite {
            setup,
            data,
            response,
        })
        .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Run a data IN transfer on the device thread
    pub async fn data_in(
        &self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        length: usize,
    ) -> crate::Result<Result<Vec<u8>, UsbError>> {
        let (response, rx) = oneshot::channel();
        self.send_command(DeviceCommand::DataIn {
            transfer_type,
            endpoint,
            length,
            response,
        })
        .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Run a data OUT transfer on the device thread
    pub async fn data_out(
        &self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: Vec<u8>,
    ) -> crate::Result<Result<(), UsbError>> {
        let (response, rx) = oneshot::channel();
        self.send_command(DeviceCommand::DataOut {
            transfer_type,
            endpoint,
            data,
            response,
        })
        .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the device thread to stop
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send_command(DeviceCommand::Shutdown).await
    }
}

/// Handle for the device thread (blocking)
pub struct DeviceWorker {
    cmd_rx: Receiver<DeviceCommand>,
}

impl DeviceWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<DeviceCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and the device thread
///
/// Returns (DeviceBridge for Tokio, DeviceWorker for the device thread)
pub fn create_device_bridge() -> (DeviceBridge, DeviceWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    (DeviceBridge { cmd_tx }, DeviceWorker { cmd_rx })
}
