//! Device server
//!
//! Speaks the host/device protocol on a byte stream. Each request is handed
//! to the device worker thread through the bridge and answered with a reply
//! carrying the same request id. Connections are served one at a time.

use common::{DeviceBridge, UsbEmulation, create_device_bridge};
use protocol::integrity::{compute_checksum, verify_checksum};
use protocol::{
    CURRENT_VERSION, InPayload, MAX_FRAME_SIZE, Message, MessagePayload, ProtocolError, UsbError,
    read_message_async, validate_version, write_message_async,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace, warn};

use crate::worker::spawn_device_worker;

/// Serves one device emulation to host controllers
#[derive(Clone)]
pub struct DeviceServer {
    bridge: DeviceBridge,
}

impl DeviceServer {
    pub fn new(bridge: DeviceBridge) -> Self {
        Self { bridge }
    }

    /// Start a worker thread for `emulation` and a server in front of it
    pub fn spawn(
        emulation: impl UsbEmulation + 'static,
    ) -> std::io::Result<(Self, std::thread::JoinHandle<()>)> {
        let (bridge, worker) = create_device_bridge();
        let handle = spawn_device_worker(worker, Box::new(emulation))?;
        Ok((Self::new(bridge), handle))
    }

    /// Stop the device worker thread
    pub async fn shutdown(&self) -> common::Result<()> {
        self.bridge.shutdown().await
    }

    /// Serve requests on `stream` until the host disconnects
    ///
    /// Returns an error if the stream breaks or the device worker is gone.
    pub async fn serve_connection<S>(&self, stream: S) -> common::Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        loop {
            let message = match read_message_async(&mut reader).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("Host closed the connection");
                    return Ok(());
                }
                // The frame was consumed whole, so the stream is still aligned
                Err(ProtocolError::Serialization(e)) => {
                    warn!("Undecodable request: {}", e);
                    let reply = MessagePayload::Error {
                        message: format!("undecodable request: {}", e),
                    };
                    write_reply(&mut writer, reply).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let reply = match validate_version(&message.version) {
                Ok(()) => self.handle_payload(message.payload).await?,
                Err(e) => {
                    warn!("Rejecting request: {}", e);
                    MessagePayload::Error {
                        message: e.to_string(),
                    }
                }
            };

            write_reply(&mut writer, reply).await?;
        }
    }

    async fn handle_payload(&self, payload: MessagePayload) -> common::Result<MessagePayload> {
        let reply = match payload {
            MessagePayload::ControlRead { id, setup, length } => {
                trace!("{:?} ControlRead {} bytes", id, length);
                let result = match checked_length(length) {
                    Ok(length) => self.bridge.control_read(setup, length).await?,
                    Err(e) => Err(e),
                };
                MessagePayload::InComplete {
                    id,
                    result: result.map(in_payload),
                }
            }

            MessagePayload::ControlWrite { id, setup, data } => {
                trace!("{:?} ControlWrite {} bytes", id, data.len());
                MessagePayload::OutComplete {
                    id,
                    result: self.bridge.control_write(setup, data).await?,
                }
            }

            MessagePayload::DataIn {
                id,
                transfer_type,
                endpoint,
                length,
            } => {
                trace!("{:?} {} IN ep{} {} bytes", id, transfer_type, endpoint, length);
                let result = match checked_length(length) {
                    Ok(length) => self.bridge.data_in(transfer_type, endpoint, length).await?,
                    Err(e) => Err(e),
                };
                MessagePayload::InComplete {
                    id,
                    result: result.map(in_payload),
                }
            }

            MessagePayload::DataOut {
                id,
                transfer_type,
                endpoint,
                data,
                checksum,
            } => {
                trace!("{:?} {} OUT ep{} {} bytes", id, transfer_type, endpoint, data.len());
                let result = if verify_checksum(&data, checksum) {
                    self.bridge.data_out(transfer_type, endpoint, data).await?
                } else {
                    warn!("Checksum mismatch on OUT data for {:?}", id);
                    Err(UsbError::transport("checksum mismatch on OUT data"))
                };
                MessagePayload::OutComplete { id, result }
            }

            MessagePayload::Ping => MessagePayload::Pong,

            other => {
                warn!("Unexpected message from host: {:?}", other.request_id());
                MessagePayload::Error {
                    message: "unexpected message: not a request".to_string(),
                }
            }
        };

        Ok(reply)
    }

    /// Accept host connections on a Unix socket, one at a time
    #[cfg(unix)]
    pub async fn serve_unix(&self, listener: tokio::net::UnixListener) -> common::Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            info!("Host connected");

            match self.serve_connection(stream).await {
                Ok(()) => info!("Host disconnected"),
                Err(common::Error::Channel(e)) => {
                    // The device worker is gone; nothing left to serve
                    return Err(common::Error::Channel(e));
                }
                Err(e) => warn!("Connection ended with error: {}", e),
            }
        }
    }
}

async fn write_reply<W>(writer: &mut W, payload: MessagePayload) -> common::Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    let message = Message {
        version: CURRENT_VERSION,
        payload,
    };
    write_message_async(writer, &message).await?;
    Ok(())
}

/// Host buffer size as a local length, bounded by what one frame can carry
fn checked_length(length: u32) -> Result<usize, UsbError> {
    let length = length as usize;
    if length > MAX_FRAME_SIZE {
        warn!("Requested {} bytes, more than one frame can carry", length);
        return Err(UsbError::InvalidParam);
    }
    Ok(length)
}

fn in_payload(data: Vec<u8>) -> InPayload {
    InPayload {
        checksum: compute_checksum(&data),
        data,
    }
}
