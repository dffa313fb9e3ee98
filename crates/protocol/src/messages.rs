//! Protocol message definitions
//!
//! Messages exchanged between the host controller and a device process.
//! The host sends one request at a time and waits for the matching reply:
//! - Control transfers (read/write with setup packet)
//! - Data transfers (bulk, interrupt, isochronous in/out)
//! - Liveness (ping/pong, errors)

use crate::types::{Direction, RequestId, TransferType, UsbEndpoint, UsbError};
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};

/// Top-level message envelope
///
/// All protocol messages are wrapped in this envelope which includes
/// the protocol version for compatibility checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version of this message
    pub version: ProtocolVersion,
    /// Message payload
    pub payload: MessagePayload,
}

/// All message types in the protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    // Host -> device requests
    /// Control transfer, device to host
    ControlRead {
        id: RequestId,
        /// Raw setup packet as submitted by the driver
        #[serde(with = "serde_bytes")]
        setup: Vec<u8>,
        /// Size of the host's data buffer
        length: u32,
    },

    /// Control transfer, host to device
    ControlWrite {
        id: RequestId,
        #[serde(with = "serde_bytes")]
        setup: Vec<u8>,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    /// Data transfer, device to host
    DataIn {
        id: RequestId,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        /// Size of the host's data buffer
        length: u32,
    },

    /// Data transfer, host to device
    DataOut {
        id: RequestId,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        /// CRC32 of `data`
        checksum: u32,
    },

    // Device -> host replies
    /// Completion of a ControlRead or DataIn
    InComplete {
        id: RequestId,
        result: Result<InPayload, UsbError>,
    },

    /// Completion of a ControlWrite or DataOut
    OutComplete {
        id: RequestId,
        result: Result<(), UsbError>,
    },

    // Connection management
    /// Liveness probe
    Ping,

    /// Reply to Ping
    Pong,

    /// Protocol-level error (undecodable or unexpected request)
    Error {
        /// Human-readable error message
        message: String,
    },
}

/// Data produced by an IN operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InPayload {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// CRC32 of `data`
    pub checksum: u32,
}

impl MessagePayload {
    /// Request ID carried by this payload, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            MessagePayload::ControlRead { id, .. }
            | MessagePayload::ControlWrite { id, .. }
            | MessagePayload::DataIn { id, .. }
            | MessagePayload::DataOut { id, .. }
            | MessagePayload::InComplete { id, .. }
            | MessagePayload::OutComplete { id, .. } => Some(*id),
            MessagePayload::Ping | MessagePayload::Pong | MessagePayload::Error { .. } => None,
        }
    }

    /// Direction of a request payload, `None` for replies and control messages
    pub fn request_direction(&self) -> Option<Direction> {
        match self {
            MessagePayload::ControlRead { .. } | MessagePayload::DataIn { .. } => {
                Some(Direction::In)
            }
            MessagePayload::ControlWrite { .. } | MessagePayload::DataOut { .. } => {
                Some(Direction::Out)
            }
            _ => None,
        }
    }
}
