//! Device worker thread
//!
//! Dedicated thread that owns the device emulation. Emulations are blocking
//! code; connection handlers on the Tokio runtime reach them through the
//! [`DeviceBridge`](common::DeviceBridge) and get each result back on a
//! oneshot channel.

use common::{DeviceCommand, DeviceWorker, UsbEmulation};
use tracing::{debug, error, info};

/// Device worker thread
///
/// Executes commands from the Tokio runtime against the emulation, one at a
/// time, until a Shutdown command arrives or every bridge is dropped.
pub struct DeviceWorkerThread {
    emulation: Box<dyn UsbEmulation>,
    worker: DeviceWorker,
}

impl DeviceWorkerThread {
    pub fn new(worker: DeviceWorker, emulation: Box<dyn UsbEmulation>) -> Self {
        Self { emulation, worker }
    }

    /// Run the command loop
    pub fn run(mut self) {
        info!("Device worker thread started");

        loop {
            match self.worker.recv_command() {
                Ok(DeviceCommand::Shutdown) => {
                    info!("Device worker shutting down");
                    break;
                }
                Ok(cmd) => self.handle_command(cmd),
                Err(e) => {
                    debug!("Device command channel closed: {}", e);
                    break;
                }
            }
        }

        info!("Device worker thread stopped");
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: DeviceCommand) {
        // A panicking emulation must not take the thread down; the dropped
        // response sender tells the caller the command failed.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in device command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: DeviceCommand) {
        match cmd {
            DeviceCommand::ControlRead {
                setup,
                length,
                response,
            } => {
                let mut buffer = vec![0u8; length];
                let result = self
                    .emulation
                    .control_read(&setup, &mut buffer)
                    .map(|len| {
                        buffer.truncate(len);
                        buffer
                    });
                debug!("Control read of {} bytes: {:?}", length, result.as_ref().map(Vec::len));
                let _ = response.send(result);
            }

            DeviceCommand::ControlWrite {
                setup,
                data,
                response,
            } => {
                let result = self.emulation.control_write(&setup, &data);
                debug!("Control write of {} bytes: {:?}", data.len(), result);
                let _ = response.send(result);
            }

            DeviceCommand::DataIn {
                transfer_type,
                endpoint,
                length,
                response,
            } => {
                let mut buffer = vec![0u8; length];
                let result = self
                    .emulation
                    .data_in(transfer_type, endpoint, &mut buffer)
                    .map(|len| {
                        buffer.truncate(len);
                        buffer
                    });
                debug!(
                    "{} IN on endpoint {}: {:?}",
                    transfer_type,
                    endpoint,
                    result.as_ref().map(Vec::len)
                );
                let _ = response.send(result);
            }

            DeviceCommand::DataOut {
                transfer_type,
                endpoint,
                data,
                response,
            } => {
                let result = self.emulation.data_out(transfer_type, endpoint, &data);
                debug!(
                    "{} OUT of {} bytes on endpoint {}: {:?}",
                    transfer_type,
                    data.len(),
                    endpoint,
                    result
                );
                let _ = response.send(result);
            }

            // Handled by the run loop
            DeviceCommand::Shutdown => {}
        }
    }
}

/// Spawn the device worker thread
///
/// The thread runs until a Shutdown command is received or the bridge is
/// dropped.
pub fn spawn_device_worker(
    worker: DeviceWorker,
    emulation: Box<dyn UsbEmulation>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("device-worker".to_string())
        .spawn(move || DeviceWorkerThread::new(worker, emulation).run())
}
