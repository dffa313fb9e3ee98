//! USB and protocol type definitions
//!
//! This module defines the USB vocabulary shared by the host controller and
//! device processes: transfer direction and type, the control setup packet,
//! and the result codes a device operation can produce.

use serde::{Deserialize, Serialize};

/// Bus address of a USB device (0 = default address before SET_ADDRESS)
pub type UsbAddress = u8;

/// Endpoint number (0 = default control endpoint)
pub type UsbEndpoint = u8;

/// Size of a standard USB setup packet in bytes
pub const SETUP_PACKET_SIZE: usize = 8;

/// Standard device request: SET_ADDRESS (USB 2.0, 9.4.6)
pub const USB_DEVREQ_SET_ADDRESS: u8 = 0x05;

/// Standard device request: GET_DESCRIPTOR (USB 2.0, 9.4.3)
pub const USB_DEVREQ_GET_DESCRIPTOR: u8 = 0x06;

/// Request ID for matching replies to requests on an IPC channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Direction of a transfer, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

/// USB transfer types
///
/// Bulk, interrupt and isochronous transfers are scheduled uniformly as
/// data transfers; only control transfers carry a setup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

impl TransferType {
    /// Whether this transfer carries a setup packet
    pub fn is_control(self) -> bool {
        matches!(self, TransferType::Control)
    }

    /// Short name used in log lines
    pub fn short_name(self) -> &'static str {
        match self {
            TransferType::Control => "ctrl",
            TransferType::Bulk => "bulk",
            TransferType::Interrupt => "intr",
            TransferType::Isochronous => "iso",
        }
    }
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Standard 8-byte USB setup packet
///
/// Multi-byte fields are little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Parse a setup packet from raw bytes
    ///
    /// Returns `None` unless `bytes` is exactly [`SETUP_PACKET_SIZE`] long.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; SETUP_PACKET_SIZE] = bytes.try_into().ok()?;
        Some(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    /// Encode into the 8-byte wire layout
    pub fn to_bytes(self) -> [u8; SETUP_PACKET_SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// SET_ADDRESS request assigning `address`
    pub fn set_address(address: UsbAddress) -> Self {
        Self {
            request_type: 0x00,
            request: USB_DEVREQ_SET_ADDRESS,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    /// GET_DESCRIPTOR request for descriptor `kind`/`index`, reading up to `length` bytes
    pub fn get_descriptor(kind: u8, index: u8, length: u16) -> Self {
        Self {
            request_type: 0x80,
            request: USB_DEVREQ_GET_DESCRIPTOR,
            value: ((kind as u16) << 8) | index as u16,
            index: 0,
            length,
        }
    }
}

/// USB error types
///
/// Every non-success result code a device operation can report. `Nak` is
/// the transient "not ready, retry" condition; everything else is terminal
/// for the transfer that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsbError {
    /// Device is busy, retry later (NAK)
    Nak,
    /// Endpoint stalled (protocol error)
    Stall,
    /// The channel to a remote device failed
    Transport { message: String },
    /// Transfer was cancelled before it executed
    Cancelled,
    /// Transfer timed out
    Timeout,
    /// Device produced more data than the buffer holds
    Overflow,
    /// Malformed request (bad setup packet, unknown endpoint)
    InvalidParam,
    /// Operation not supported by the device
    NotSupported,
    /// Other error with message
    Other { message: String },
}

impl UsbError {
    /// Transport error with a message
    pub fn transport(message: impl Into<String>) -> Self {
        UsbError::Transport {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for UsbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsbError::Nak => write!(f, "NAK"),
            UsbError::Stall => write!(f, "endpoint stalled"),
            UsbError::Transport { message } => write!(f, "transport error: {}", message),
            UsbError::Cancelled => write!(f, "cancelled"),
            UsbError::Timeout => write!(f, "timed out"),
            UsbError::Overflow => write!(f, "buffer overflow"),
            UsbError::InvalidParam => write!(f, "invalid parameter"),
            UsbError::NotSupported => write!(f, "not supported"),
            UsbError::Other { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for UsbError {}
