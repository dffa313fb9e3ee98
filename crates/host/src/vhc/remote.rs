//! Remote executor
//!
//! Forwards transfers to a device emulated in a separate process. Requests go
//! out one at a time as framed protocol messages and the executor waits for
//! the reply carrying the same request id. Any failure of the channel itself
//! is reported to the transfer as [`UsbError::Transport`].

use crate::vhc::executor::DeviceOps;
use protocol::integrity::{compute_checksum, verify_checksum};
use protocol::{
    CURRENT_VERSION, Direction, InPayload, Message, MessagePayload, ProtocolError, RequestId,
    TransferType, UsbEndpoint, UsbError, read_message_async, validate_version, write_message_async,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{trace, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection state, owned by whichever request currently holds the lock
struct RemoteChannel {
    reader: BoxedReader,
    writer: BoxedWriter,
    next_request_id: u64,
    /// Set once the stream is unusable; every later request fails fast
    closed: bool,
}

impl RemoteChannel {
    fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    async fn exchange(&mut self, request: &Message) -> protocol::Result<Message> {
        write_message_async(&mut self.writer, request).await?;

        let reply = read_message_async(&mut self.reader).await?.ok_or_else(|| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device process closed the channel",
            ))
        })?;

        validate_version(&reply.version)?;
        Ok(reply)
    }
}

/// Executes transfers against a device process over a byte stream
pub struct RemoteExecutor {
    channel: Mutex<RemoteChannel>,
}

impl RemoteExecutor {
    /// Wrap an already connected stream
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            channel: Mutex::new(RemoteChannel {
                reader: Box::new(reader),
                writer: Box::new(writer),
                next_request_id: 1,
                closed: false,
            }),
        }
    }

    /// Connect to a device process listening on a Unix socket
    ///
    /// The connection is verified with a ping before it is returned.
    #[cfg(unix)]
    pub async fn connect(path: impl AsRef<std::path::Path>) -> common::Result<Self> {
        let path = path.as_ref();
        let stream = tokio::net::UnixStream::connect(path).await?;
        let executor = Self::new(stream);
        executor.ping().await?;
        tracing::info!("Connected to device process at {}", path.display());
        Ok(executor)
    }

    /// Check that the device process is answering
    pub async fn ping(&self) -> Result<(), UsbError> {
        self.round_trip(|_| MessagePayload::Ping).await.map(|_| ())
    }

    /// Whether the channel has failed
    pub async fn is_closed(&self) -> bool {
        self.channel.lock().await.closed
    }

    /// Send one request and return the reply that answers it
    ///
    /// The reply must match the request's id and kind. Anything else means
    /// the stream can no longer be trusted, so the channel is closed.
    async fn round_trip<F>(&self, build: F) -> Result<MessagePayload, UsbError>
    where
        F: FnOnce(RequestId) -> MessagePayload,
    {
        let mut channel = self.channel.lock().await;
        if channel.closed {
            return Err(UsbError::transport("channel to device process is closed"));
        }

        let id = channel.next_request_id();
        let payload = build(id);
        let expected = payload.request_direction();
        trace!("-> {} {:?}", payload_name(&payload), id);

        let request = Message {
            version: CURRENT_VERSION,
            payload,
        };

        let reply = match channel.exchange(&request).await {
            Ok(reply) => reply.payload,
            Err(e) => {
                warn!("Channel to device process failed: {}", e);
                channel.closed = true;
                return Err(UsbError::transport(e.to_string()));
            }
        };
        trace!("<- {} {:?}", payload_name(&reply), reply.request_id());

        let answered = match (&reply, expected) {
            (MessagePayload::InComplete { id: reply_id, .. }, Some(Direction::In))
            | (MessagePayload::OutComplete { id: reply_id, .. }, Some(Direction::Out)) => {
                *reply_id == id
            }
            (MessagePayload::Pong, None) => true,
            (MessagePayload::Error { message }, _) => {
                warn!("Device process rejected request {:?}: {}", id, message);
                return Err(UsbError::transport(format!(
                    "device process rejected request: {}",
                    message
                )));
            }
            _ => false,
        };

        if !answered {
            warn!(
                "Unexpected {} in reply to request {:?}, closing channel",
                payload_name(&reply),
                id
            );
            channel.closed = true;
            return Err(UsbError::transport(format!(
                "unexpected {} from device process",
                payload_name(&reply)
            )));
        }

        Ok(reply)
    }

    async fn request_in<F>(&self, data: &mut [u8], build: F) -> Result<usize, UsbError>
    where
        F: FnOnce(RequestId, u32) -> MessagePayload,
    {
        let length = u32::try_from(data.len()).map_err(|_| UsbError::InvalidParam)?;

        match self.round_trip(|id| build(id, length)).await? {
            MessagePayload::InComplete { result, .. } => copy_in(result?, data),
            _ => Err(UsbError::transport("reply does not complete an IN request")),
        }
    }

    async fn request_out<F>(&self, build: F) -> Result<(), UsbError>
    where
        F: FnOnce(RequestId) -> MessagePayload,
    {
        match self.round_trip(build).await? {
            MessagePayload::OutComplete { result, .. } => result,
            _ => Err(UsbError::transport("reply does not complete an OUT request")),
        }
    }
}

/// Copy an IN reply into the host buffer
///
/// A reply longer than the buffer is truncated and reported as overflow.
fn copy_in(payload: InPayload, data: &mut [u8]) -> Result<usize, UsbError> {
    if !verify_checksum(&payload.data, payload.checksum) {
        warn!(
            "Checksum mismatch on {} byte IN reply (expected {:08x}, got {:08x})",
            payload.data.len(),
            payload.checksum,
            compute_checksum(&payload.data)
        );
        return Err(UsbError::transport("checksum mismatch on IN data"));
    }

    let len = payload.data.len().min(data.len());
    data[..len].copy_from_slice(&payload.data[..len]);

    if payload.data.len() > data.len() {
        warn!(
            "Device returned {} bytes for a {} byte buffer",
            payload.data.len(),
            data.len()
        );
        return Err(UsbError::Overflow);
    }
    Ok(len)
}

fn payload_name(payload: &MessagePayload) -> &'static str {
    match payload {
        MessagePayload::ControlRead { .. } => "ControlRead",
        MessagePayload::ControlWrite { .. } => "ControlWrite",
        MessagePayload::DataIn { .. } => "DataIn",
        MessagePayload::DataOut { .. } => "DataOut",
        MessagePayload::InComplete { .. } => "InComplete",
        MessagePayload::OutComplete { .. } => "OutComplete",
        MessagePayload::Ping => "Ping",
        MessagePayload::Pong => "Pong",
        MessagePayload::Error { .. } => "Error",
    }
}

impl DeviceOps for RemoteExecutor {
    async fn control_read(&self, setup: &[u8], data: &mut [u8]) -> Result<usize, UsbError> {
        self.request_in(data, |id, length| MessagePayload::ControlRead {
            id,
            setup: setup.to_vec(),
            length,
        })
        .await
    }

    async fn control_write(&self, setup: &[u8], data: &[u8]) -> Result<(), UsbError> {
        self.request_out(|id| MessagePayload::ControlWrite {
            id,
            setup: setup.to_vec(),
            data: data.to_vec(),
        })
        .await
    }

    async fn data_in(
        &self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        self.request_in(data, |id, length| MessagePayload::DataIn {
            id,
            transfer_type,
            endpoint,
            length,
        })
        .await
    }

    async fn data_out(
        &self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &[u8],
    ) -> Result<(), UsbError> {
        self.request_out(|id| MessagePayload::DataOut {
            id,
            transfer_type,
            endpoint,
            data: data.to_vec(),
            checksum: compute_checksum(data),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    /// Answer exactly one request on `peer` with the reply built by `respond`
    async fn answer_once<F>(peer: &mut DuplexStream, respond: F)
    where
        F: FnOnce(MessagePayload) -> MessagePayload,
    {
        let request = read_message_async(peer).await.unwrap().unwrap();
        let reply = Message {
            version: CURRENT_VERSION,
            payload: respond(request.payload),
        };
        write_message_async(peer, &reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (host, mut device) = duplex(4096);
        let executor = RemoteExecutor::new(host);

        let (result, ()) = tokio::join!(
            executor.ping(),
            answer_once(&mut device, |_| MessagePayload::Pong)
        );
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_oversized_in_reply_is_overflow() {
        let (host, mut device) = duplex(4096);
        let executor = RemoteExecutor::new(host);
        let mut buffer = [0u8; 4];

        let (result, ()) = tokio::join!(
            executor.data_in(TransferType::Bulk, 1, &mut buffer),
            answer_once(&mut device, |request| {
                let data = vec![9u8; 6];
                MessagePayload::InComplete {
                    id: request.request_id().unwrap(),
                    result: Ok(InPayload {
                        checksum: compute_checksum(&data),
                        data,
                    }),
                }
            })
        );

        assert_eq!(result, Err(UsbError::Overflow));
        assert_eq!(buffer, [9; 4]);
        assert!(!executor.is_closed().await);
    }

    #[tokio::test]
    async fn test_mismatched_id_closes_channel() {
        let (host, mut device) = duplex(4096);
        let executor = RemoteExecutor::new(host);

        let (result, ()) = tokio::join!(
            executor.data_out(TransferType::Bulk, 1, &[1, 2]),
            answer_once(&mut device, |_| MessagePayload::OutComplete {
                id: RequestId(999),
                result: Ok(()),
            })
        );

        assert!(matches!(result, Err(UsbError::Transport { .. })));
        assert!(executor.is_closed().await);

        // Fails fast without touching the stream
        let result = executor.control_write(&[0; 8], &[]).await;
        assert!(matches!(result, Err(UsbError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_bad_checksum_is_transport_error() {
        let (host, mut device) = duplex(4096);
        let executor = RemoteExecutor::new(host);
        let mut buffer = [0u8; 8];

        let (result, ()) = tokio::join!(
            executor.control_read(&[0x80, 0x06, 0, 1, 0, 0, 8, 0], &mut buffer),
            answer_once(&mut device, |request| MessagePayload::InComplete {
                id: request.request_id().unwrap(),
                result: Ok(InPayload {
                    data: vec![1, 2, 3],
                    checksum: 0,
                }),
            })
        );

        assert!(matches!(result, Err(UsbError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_closed_stream_is_transport_error() {
        let (host, device) = duplex(4096);
        drop(device);
        let executor = RemoteExecutor::new(host);

        let result = executor.data_out(TransferType::Interrupt, 2, &[0]).await;
        assert!(matches!(result, Err(UsbError::Transport { .. })));
        assert!(executor.is_closed().await);
    }
}
