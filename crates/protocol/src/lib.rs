//! Protocol library for the virtual host controller
//!
//! This crate defines the USB vocabulary and the message protocol spoken
//! between the host controller and device processes reachable over an
//! inter-process channel. It provides type-safe message definitions,
//! serialization using postcard, length-prefixed framing and protocol
//! versioning.
//!
//! # Example
//!
//! ```
//! use protocol::{Message, MessagePayload, RequestId, SetupPacket, CURRENT_VERSION};
//! use protocol::{decode_message, encode_message};
//!
//! let msg = Message {
//!     version: CURRENT_VERSION,
//!     payload: MessagePayload::ControlWrite {
//!         id: RequestId(1),
//!         setup: SetupPacket::set_address(9).to_bytes().to_vec(),
//!         data: Vec::new(),
//!     },
//! };
//!
//! let bytes = encode_message(&msg).unwrap();
//! let decoded = decode_message(&bytes).unwrap();
//! assert_eq!(decoded.version, CURRENT_VERSION);
//! ```

pub mod codec;
pub mod error;
pub mod integrity;
pub mod messages;
pub mod types;
pub mod version;

pub use codec::{MAX_FRAME_SIZE, decode_message, encode_framed, encode_message, validate_version};

#[cfg(feature = "async")]
pub use codec::{read_message_async, write_message_async};
pub use error::{ProtocolError, Result};
pub use messages::{InPayload, Message, MessagePayload};
pub use types::{
    Direction, RequestId, SETUP_PACKET_SIZE, SetupPacket, TransferType, USB_DEVREQ_GET_DESCRIPTOR,
    USB_DEVREQ_SET_ADDRESS, UsbAddress, UsbEndpoint, UsbError,
};
pub use version::{CURRENT_VERSION, ProtocolVersion};
