//! Device server tests over an in-memory stream

use common::LoopbackDevice;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_bulk_data, with_timeout};
use protocol::integrity::{compute_checksum, verify_checksum};
use protocol::{
    CURRENT_VERSION, Message, MessagePayload, ProtocolVersion, RequestId, SetupPacket,
    TransferType, UsbError, read_message_async, write_message_async,
};
use tokio::io::{DuplexStream, duplex};
use vdev::DeviceServer;

struct Harness {
    host: DuplexStream,
    server: DeviceServer,
    serve: tokio::task::JoinHandle<common::Result<()>>,
    worker: std::thread::JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        let (server, worker) = DeviceServer::spawn(LoopbackDevice::new()).unwrap();
        let (host, device) = duplex(64 * 1024);
        let serving = server.clone();
        let serve = tokio::spawn(async move { serving.serve_connection(device).await });
        Self {
            host,
            server,
            serve,
            worker,
        }
    }

    async fn request(&mut self, payload: MessagePayload) -> MessagePayload {
        self.request_with_version(CURRENT_VERSION, payload).await
    }

    async fn request_with_version(
        &mut self,
        version: ProtocolVersion,
        payload: MessagePayload,
    ) -> MessagePayload {
        let message = Message { version, payload };
        write_message_async(&mut self.host, &message).await.unwrap();
        with_timeout(DEFAULT_TEST_TIMEOUT, read_message_async(&mut self.host))
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .payload
    }

    async fn finish(self) {
        drop(self.host);
        self.serve.await.unwrap().unwrap();
        self.server.shutdown().await.unwrap();
        self.worker.join().unwrap();
    }
}

#[tokio::test]
async fn test_ping() {
    let mut harness = Harness::start();
    assert!(matches!(
        harness.request(MessagePayload::Ping).await,
        MessagePayload::Pong
    ));
    harness.finish().await;
}

#[tokio::test]
async fn test_control_read_device_descriptor() {
    let mut harness = Harness::start();

    let reply = harness
        .request(MessagePayload::ControlRead {
            id: RequestId(1),
            setup: SetupPacket::get_descriptor(1, 0, 18).to_bytes().to_vec(),
            length: 64,
        })
        .await;

    let MessagePayload::InComplete { id, result } = reply else {
        panic!("expected InComplete, got {:?}", reply);
    };
    assert_eq!(id, RequestId(1));
    let payload = result.unwrap();
    assert_eq!(payload.data.len(), 18);
    assert_eq!(payload.data, LoopbackDevice::device_descriptor().to_vec());
    assert!(verify_checksum(&payload.data, payload.checksum));

    harness.finish().await;
}

#[tokio::test]
async fn test_bulk_echo_and_nak() {
    let mut harness = Harness::start();
    let data = create_mock_bulk_data(300);

    let reply = harness
        .request(MessagePayload::DataOut {
            id: RequestId(1),
            transfer_type: TransferType::Bulk,
            endpoint: 1,
            checksum: compute_checksum(&data),
            data: data.clone(),
        })
        .await;
    assert!(matches!(
        reply,
        MessagePayload::OutComplete {
            id: RequestId(1),
            result: Ok(())
        }
    ));

    let reply = harness
        .request(MessagePayload::DataIn {
            id: RequestId(2),
            transfer_type: TransferType::Bulk,
            endpoint: 1,
            length: 512,
        })
        .await;
    let MessagePayload::InComplete { result, .. } = reply else {
        panic!("expected InComplete, got {:?}", reply);
    };
    assert_eq!(result.unwrap().data, data);

    // Nothing left to echo
    let reply = harness
        .request(MessagePayload::DataIn {
            id: RequestId(3),
            transfer_type: TransferType::Bulk,
            endpoint: 1,
            length: 512,
        })
        .await;
    assert!(matches!(
        reply,
        MessagePayload::InComplete {
            id: RequestId(3),
            result: Err(UsbError::Nak)
        }
    ));

    harness.finish().await;
}

#[tokio::test]
async fn test_out_checksum_mismatch() {
    let mut harness = Harness::start();

    let reply = harness
        .request(MessagePayload::DataOut {
            id: RequestId(4),
            transfer_type: TransferType::Interrupt,
            endpoint: 1,
            data: vec![1, 2, 3],
            checksum: 0xDEAD_BEEF,
        })
        .await;
    assert!(matches!(
        reply,
        MessagePayload::OutComplete {
            result: Err(UsbError::Transport { .. }),
            ..
        }
    ));

    harness.finish().await;
}

#[tokio::test]
async fn test_incompatible_version_is_rejected() {
    let mut harness = Harness::start();

    let reply = harness
        .request_with_version(
            ProtocolVersion {
                major: CURRENT_VERSION.major + 1,
                minor: 0,
                patch: 0,
            },
            MessagePayload::Ping,
        )
        .await;
    assert!(matches!(reply, MessagePayload::Error { .. }));

    // The connection stays usable
    assert!(matches!(
        harness.request(MessagePayload::Ping).await,
        MessagePayload::Pong
    ));
    harness.finish().await;
}

#[tokio::test]
async fn test_reply_sent_as_request_is_rejected() {
    let mut harness = Harness::start();

    let reply = harness
        .request(MessagePayload::OutComplete {
            id: RequestId(1),
            result: Ok(()),
        })
        .await;
    assert!(matches!(reply, MessagePayload::Error { .. }));

    harness.finish().await;
}
