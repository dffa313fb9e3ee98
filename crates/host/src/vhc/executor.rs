//! Transfer execution
//!
//! Both device variants expose the same four operations through
//! [`DeviceOps`]. [`dispatch_transfer`] picks the operation from the
//! transfer's type and direction; [`DeviceTarget`] is the per-device choice
//! between an in-process emulation and a remote device process.

use crate::vhc::remote::RemoteExecutor;
use crate::vhc::transfer::Transfer;
use common::UsbEmulation;
use protocol::{Direction, TransferType, UsbEndpoint, UsbError};
use std::future::{Future, ready};
use std::sync::{Mutex, MutexGuard};

/// The four protocol operations a device can perform
///
/// IN operations fill `data` and return how many bytes were produced.
pub trait DeviceOps: Send + Sync {
    fn control_read(
        &self,
        setup: &[u8],
        data: &mut [u8],
    ) -> impl Future<Output = Result<usize, UsbError>> + Send;

    fn control_write(
        &self,
        setup: &[u8],
        data: &[u8],
    ) -> impl Future<Output = Result<(), UsbError>> + Send;

    fn data_in(
        &self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &mut [u8],
    ) -> impl Future<Output = Result<usize, UsbError>> + Send;

    fn data_out(
        &self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &[u8],
    ) -> impl Future<Output = Result<(), UsbError>> + Send;
}

/// Execute `transfer` against `ops`
///
/// Returns the number of bytes transferred: filled bytes for IN, the payload
/// size for OUT.
pub async fn dispatch_transfer<O>(ops: &O, transfer: &mut Transfer) -> Result<usize, UsbError>
where
    O: DeviceOps + ?Sized,
{
    let transfer_type = transfer.transfer_type();
    let endpoint = transfer.endpoint();

    match (transfer_type.is_control(), transfer.direction()) {
        (true, Direction::In) => {
            let (setup, data) = transfer.control_buffers();
            ops.control_read(setup, data).await
        }
        (true, Direction::Out) => ops
            .control_write(transfer.setup(), transfer.data())
            .await
            .map(|()| transfer.data().len()),
        (false, Direction::In) => {
            ops.data_in(transfer_type, endpoint, transfer.data_mut())
                .await
        }
        (false, Direction::Out) => ops
            .data_out(transfer_type, endpoint, transfer.data())
            .await
            .map(|()| transfer.data().len()),
    }
}

/// Executes transfers directly against an in-process emulation
pub struct LocalExecutor {
    emulation: Mutex<Box<dyn UsbEmulation>>,
}

impl LocalExecutor {
    pub fn new(emulation: impl UsbEmulation + 'static) -> Self {
        Self {
            emulation: Mutex::new(Box::new(emulation)),
        }
    }

    fn emulation(&self) -> MutexGuard<'_, Box<dyn UsbEmulation>> {
        self.emulation.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// Emulation calls are synchronous; each future is already resolved.
impl DeviceOps for LocalExecutor {
    fn control_read(
        &self,
        setup: &[u8],
        data: &mut [u8],
    ) -> impl Future<Output = Result<usize, UsbError>> + Send {
        ready(self.emulation().control_read(setup, data))
    }

    fn control_write(
        &self,
        setup: &[u8],
        data: &[u8],
    ) -> impl Future<Output = Result<(), UsbError>> + Send {
        ready(self.emulation().control_write(setup, data))
    }

    fn data_in(
        &self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &mut [u8],
    ) -> impl Future<Output = Result<usize, UsbError>> + Send {
        ready(self.emulation().data_in(transfer_type, endpoint, data))
    }

    fn data_out(
        &self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &[u8],
    ) -> impl Future<Output = Result<(), UsbError>> + Send {
        ready(self.emulation().data_out(transfer_type, endpoint, data))
    }
}

/// Where a device's transfers are executed, chosen once at plug time
pub enum DeviceTarget {
    /// In-process emulation
    Local(LocalExecutor),
    /// Separate device process over an IPC channel
    Remote(RemoteExecutor),
}

impl DeviceTarget {
    /// Target an in-process emulation
    pub fn local(emulation: impl UsbEmulation + 'static) -> Self {
        DeviceTarget::Local(LocalExecutor::new(emulation))
    }

    /// Target a remote device process
    pub fn remote(executor: RemoteExecutor) -> Self {
        DeviceTarget::Remote(executor)
    }

    /// Execute one transfer, filling its data buffer for IN transfers
    pub async fn execute(&self, transfer: &mut Transfer) -> Result<usize, UsbError> {
        match self {
            DeviceTarget::Local(local) => dispatch_transfer(local, transfer).await,
            DeviceTarget::Remote(remote) => dispatch_transfer(remote, transfer).await,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceTarget::Local(_) => "local",
            DeviceTarget::Remote(_) => "remote",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhc::transfer::OwnerHandle;
    use common::test_utils::{MockEmulation, MockOp, set_address_setup};

    fn transfer(direction: Direction, transfer_type: TransferType, endpoint: u8) -> Transfer {
        Transfer::create(1, endpoint, direction, transfer_type, OwnerHandle(1), Box::new(()))
    }

    #[tokio::test]
    async fn test_dispatch_selects_operation() {
        let mock = MockEmulation::new();
        let target = DeviceTarget::local(mock.clone());

        let mut control_in = transfer(Direction::In, TransferType::Control, 0)
            .with_setup(vec![0x80, 0x06, 0, 1, 0, 0, 18, 0])
            .with_in_buffer(18);
        let mut control_out = transfer(Direction::Out, TransferType::Control, 0)
            .with_setup(set_address_setup(3));
        let mut bulk_in = transfer(Direction::In, TransferType::Bulk, 1).with_in_buffer(64);
        let mut intr_out = transfer(Direction::Out, TransferType::Interrupt, 2).with_data(vec![1]);

        target.execute(&mut control_in).await.unwrap();
        target.execute(&mut control_out).await.unwrap();
        target.execute(&mut bulk_in).await.unwrap();
        target.execute(&mut intr_out).await.unwrap();

        let ops: Vec<MockOp> = mock.calls().iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                MockOp::ControlRead,
                MockOp::ControlWrite,
                MockOp::DataIn,
                MockOp::DataOut
            ]
        );

        let calls = mock.calls();
        assert_eq!(calls[1].setup, set_address_setup(3));
        assert_eq!(calls[2].endpoint, 1);
        assert_eq!(calls[2].data.len(), 64);
        assert_eq!(calls[3].transfer_type, TransferType::Interrupt);
        assert_eq!(calls[3].data, vec![1]);
    }

    #[tokio::test]
    async fn test_in_transfer_fills_buffer() {
        let mock = MockEmulation::new();
        mock.push_result(Ok(vec![0xAA; 7]));
        let target = DeviceTarget::local(mock);

        let mut bulk_in = transfer(Direction::In, TransferType::Bulk, 1).with_in_buffer(16);
        assert_eq!(target.execute(&mut bulk_in).await, Ok(7));
        assert_eq!(&bulk_in.data()[..7], &[0xAA; 7]);
        assert_eq!(bulk_in.data()[7], 0);
    }

    #[tokio::test]
    async fn test_error_passes_through() {
        let mock = MockEmulation::new();
        mock.push_result(Err(UsbError::Stall));
        let target = DeviceTarget::local(mock);

        let mut out = transfer(Direction::Out, TransferType::Bulk, 1).with_data(vec![1, 2]);
        assert_eq!(target.execute(&mut out).await, Err(UsbError::Stall));
        assert_eq!(target.kind(), "local");
    }
}
