//! USB transfer requests
//!
//! A [`Transfer`] is one request a driver hands to the host controller. It is
//! built by the caller, moved into exactly one device queue by
//! [`DeviceRegistry::submit`](crate::vhc::DeviceRegistry::submit), and
//! consumed by the queue processor when its completion callback fires.

use protocol::{
    Direction, SetupPacket, TransferType, USB_DEVREQ_SET_ADDRESS, UsbAddress, UsbEndpoint,
    UsbError,
};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

/// Opaque reference to the driver function that owns a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerHandle(pub u64);

/// Diagnostic identifier, unique per process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque value passed back to the completion callback unchanged
pub type CallbackArg = Box<dyn Any + Send>;

/// Completion of an IN transfer
///
/// Receives the owner, the result (bytes actually transferred on success),
/// the data buffer handed back to the caller, and the callback argument.
pub type InCallback =
    Box<dyn FnOnce(OwnerHandle, Result<usize, UsbError>, Vec<u8>, CallbackArg) + Send>;

/// Completion of an OUT transfer
pub type OutCallback = Box<dyn FnOnce(OwnerHandle, Result<(), UsbError>, CallbackArg) + Send>;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// One USB request
pub struct Transfer {
    id: TransferId,
    address: UsbAddress,
    endpoint: UsbEndpoint,
    direction: Direction,
    transfer_type: TransferType,
    setup: Vec<u8>,
    data: Vec<u8>,
    owner: OwnerHandle,
    callback_arg: CallbackArg,
    callback_in: Option<InCallback>,
    callback_out: Option<OutCallback>,
    nak_count: u32,
}

impl Transfer {
    /// Create a transfer with empty buffers and no callbacks bound
    pub fn create(
        address: UsbAddress,
        endpoint: UsbEndpoint,
        direction: Direction,
        transfer_type: TransferType,
        owner: OwnerHandle,
        callback_arg: CallbackArg,
    ) -> Self {
        let id = TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed));

        trace!(
            "Created transfer {} ({}.{} {} {})",
            id, address, endpoint, transfer_type, direction
        );

        Self {
            id,
            address,
            endpoint,
            direction,
            transfer_type,
            setup: Vec::new(),
            data: Vec::new(),
            owner,
            callback_arg,
            callback_in: None,
            callback_out: None,
            nak_count: 0,
        }
    }

    /// Attach the setup packet of a control transfer
    pub fn with_setup(mut self, setup: impl Into<Vec<u8>>) -> Self {
        self.setup = setup.into();
        self
    }

    /// Attach the payload of an OUT transfer
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Attach an empty buffer of `size` bytes for an IN transfer to fill
    pub fn with_in_buffer(mut self, size: usize) -> Self {
        self.data = vec![0; size];
        self
    }

    /// Bind the IN completion callback
    pub fn on_in_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(OwnerHandle, Result<usize, UsbError>, Vec<u8>, CallbackArg) + Send + 'static,
    {
        self.callback_in = Some(Box::new(callback));
        self
    }

    /// Bind the OUT completion callback
    pub fn on_out_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(OwnerHandle, Result<(), UsbError>, CallbackArg) + Send + 'static,
    {
        self.callback_out = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn address(&self) -> UsbAddress {
        self.address
    }

    pub fn endpoint(&self) -> UsbEndpoint {
        self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn owner(&self) -> OwnerHandle {
        self.owner
    }

    pub fn setup(&self) -> &[u8] {
        &self.setup
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// How many times the device has NAK'd this transfer
    pub fn nak_count(&self) -> u32 {
        self.nak_count
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Setup packet and data buffer, borrowed for a control read
    pub(crate) fn control_buffers(&mut self) -> (&[u8], &mut [u8]) {
        (&self.setup, &mut self.data)
    }

    pub(crate) fn record_nak(&mut self) -> u32 {
        self.nak_count = self.nak_count.saturating_add(1);
        self.nak_count
    }

    /// New address carried by a standard SET_ADDRESS request, if this is one
    ///
    /// Matches only an OUT control transfer on endpoint 0 whose setup packet
    /// is exactly 8 bytes with bmRequestType 0 and bRequest SET_ADDRESS.
    /// wValue is taken as-is, truncated to the 8-bit address type.
    pub fn set_address_target(&self) -> Option<UsbAddress> {
        if self.endpoint != 0
            || !self.transfer_type.is_control()
            || self.direction != Direction::Out
        {
            return None;
        }
        let setup = SetupPacket::parse(&self.setup)?;
        if setup.request_type != 0 || setup.request != USB_DEVREQ_SET_ADDRESS {
            return None;
        }
        Some(setup.value as UsbAddress)
    }

    /// Deliver the final result and release the transfer
    ///
    /// Invokes the callback matching the transfer's direction exactly once.
    pub(crate) fn complete(self, result: Result<usize, UsbError>) {
        let Transfer {
            id,
            direction,
            data,
            owner,
            callback_arg,
            callback_in,
            callback_out,
            ..
        } = self;

        match direction {
            Direction::In => match callback_in {
                Some(callback) => callback(owner, result, data, callback_arg),
                None => warn!("Transfer {} completed without an IN callback", id),
            },
            Direction::Out => match callback_out {
                Some(callback) => callback(owner, result.map(|_| ()), callback_arg),
                None => warn!("Transfer {} completed without an OUT callback", id),
            },
        }
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("endpoint", &self.endpoint)
            .field("direction", &self.direction)
            .field("transfer_type", &self.transfer_type)
            .field("setup_len", &self.setup.len())
            .field("data_len", &self.data.len())
            .field("owner", &self.owner)
            .field("nak_count", &self.nak_count)
            .finish_non_exhaustive()
    }
}
