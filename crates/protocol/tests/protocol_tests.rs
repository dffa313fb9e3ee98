//! Integration tests for the host/device protocol
//!
//! Covers framing over in-memory streams, version checks, and the shape of
//! the request/reply messages the host and device processes exchange.

use protocol::integrity::{compute_checksum, verify_checksum};
use protocol::{
    CURRENT_VERSION, Direction, InPayload, MAX_FRAME_SIZE, Message, MessagePayload,
    ProtocolError, ProtocolVersion, RequestId, SetupPacket, TransferType, UsbError,
    decode_message, encode_framed, encode_message, read_message_async, validate_version,
    write_message_async,
};

fn message(payload: MessagePayload) -> Message {
    Message {
        version: CURRENT_VERSION,
        payload,
    }
}

mod framing {
    use super::*;

    #[tokio::test]
    async fn test_sequential_frames_on_one_stream() {
        let mut buffer = Vec::new();
        write_message_async(&mut buffer, &message(MessagePayload::Ping))
            .await
            .unwrap();
        write_message_async(
            &mut buffer,
            &message(MessagePayload::OutComplete {
                id: RequestId(3),
                result: Err(UsbError::Stall),
            }),
        )
        .await
        .unwrap();

        let mut reader = buffer.as_slice();
        assert!(matches!(
            read_message_async(&mut reader).await.unwrap().unwrap().payload,
            MessagePayload::Ping
        ));
        assert!(matches!(
            read_message_async(&mut reader).await.unwrap().unwrap().payload,
            MessagePayload::OutComplete {
                id: RequestId(3),
                result: Err(UsbError::Stall)
            }
        ));
        assert!(read_message_async(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let mut frame = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 16]);

        let result = read_message_async(&mut frame.as_slice()).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_rejected() {
        let framed = encode_framed(&message(MessagePayload::Pong)).unwrap();
        let mut reader = &framed[..framed.len() - 1];
        assert!(read_message_async(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_async_stream_exchange() {
        let (mut host, mut device) = tokio::io::duplex(4096);

        let request = message(MessagePayload::ControlRead {
            id: RequestId(11),
            setup: SetupPacket::get_descriptor(1, 0, 18).to_bytes().to_vec(),
            length: 18,
        });
        write_message_async(&mut host, &request).await.unwrap();

        let received = read_message_async(&mut device).await.unwrap().unwrap();
        let MessagePayload::ControlRead { id, setup, length } = received.payload else {
            panic!("expected ControlRead");
        };
        assert_eq!(id, RequestId(11));
        assert_eq!(length, 18);
        assert_eq!(SetupPacket::parse(&setup), Some(SetupPacket::get_descriptor(1, 0, 18)));

        drop(host);
        assert!(read_message_async(&mut device).await.unwrap().is_none());
    }
}

mod versioning {
    use super::*;

    #[test]
    fn test_same_major_is_accepted() {
        let newer_minor = ProtocolVersion {
            major: CURRENT_VERSION.major,
            minor: CURRENT_VERSION.minor + 1,
            patch: 0,
        };
        assert!(validate_version(&newer_minor).is_ok());
    }

    #[test]
    fn test_other_major_is_rejected() {
        let next_major = ProtocolVersion {
            major: CURRENT_VERSION.major + 1,
            minor: 0,
            patch: 0,
        };
        let err = validate_version(&next_major).unwrap_err();
        assert!(matches!(err, ProtocolError::IncompatibleVersion { .. }));
    }
}

mod messages {
    use super::*;

    #[test]
    fn test_in_reply_carries_checked_data() {
        let data = vec![0x12, 0x01, 0x00, 0x02];
        let reply = message(MessagePayload::InComplete {
            id: RequestId(5),
            result: Ok(InPayload {
                checksum: compute_checksum(&data),
                data: data.clone(),
            }),
        });

        let decoded = decode_message(&encode_message(&reply).unwrap()).unwrap();
        let MessagePayload::InComplete { result, .. } = decoded.payload else {
            panic!("expected InComplete");
        };
        let payload = result.unwrap();
        assert_eq!(payload.data, data);
        assert!(verify_checksum(&payload.data, payload.checksum));
    }

    #[test]
    fn test_error_results_survive_encoding() {
        let errors = vec![
            UsbError::Nak,
            UsbError::Stall,
            UsbError::transport("pipe closed"),
            UsbError::Cancelled,
            UsbError::Overflow,
            UsbError::Other {
                message: "device on fire".to_string(),
            },
        ];

        for error in errors {
            let reply = message(MessagePayload::OutComplete {
                id: RequestId(1),
                result: Err(error.clone()),
            });
            let decoded = decode_message(&encode_message(&reply).unwrap()).unwrap();
            let MessagePayload::OutComplete { result, .. } = decoded.payload else {
                panic!("expected OutComplete");
            };
            assert_eq!(result, Err(error));
        }
    }

    #[test]
    fn test_request_direction() {
        let requests = [
            (
                MessagePayload::ControlWrite {
                    id: RequestId(1),
                    setup: SetupPacket::set_address(4).to_bytes().to_vec(),
                    data: Vec::new(),
                },
                Some(Direction::Out),
            ),
            (
                MessagePayload::DataIn {
                    id: RequestId(2),
                    transfer_type: TransferType::Isochronous,
                    endpoint: 3,
                    length: 192,
                },
                Some(Direction::In),
            ),
            (MessagePayload::Ping, None),
        ];

        for (payload, direction) in requests {
            assert_eq!(payload.request_direction(), direction);
        }
    }

    #[test]
    fn test_largest_data_out_fits_in_a_frame() {
        let data = vec![0xA5; MAX_FRAME_SIZE - 64];
        let request = message(MessagePayload::DataOut {
            id: RequestId(9),
            transfer_type: TransferType::Bulk,
            endpoint: 2,
            checksum: compute_checksum(&data),
            data,
        });
        assert!(encode_framed(&request).is_ok());
    }
}
