//! Remote executor tests against a real device server

use common::LoopbackDevice;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, MockEmulation, with_timeout};
use host::vhc::requests::{control_read, set_address};
use host::vhc::{
    DeviceOps, DeviceRegistry, DeviceTarget, OwnerHandle, ProcessorSettings, ProcessorState,
    RemoteExecutor, Transfer,
};
use protocol::{Direction, SetupPacket, TransferType, UsbError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::duplex;
use tokio::sync::oneshot;
use vdev::DeviceServer;

struct RemoteDevice {
    executor: RemoteExecutor,
    server: DeviceServer,
    serve: tokio::task::JoinHandle<common::Result<()>>,
    worker: std::thread::JoinHandle<()>,
}

/// Loopback emulation behind a device server, reachable through an executor
fn remote_loopback() -> RemoteDevice {
    let (server, worker) = DeviceServer::spawn(LoopbackDevice::new()).unwrap();
    let (host_side, device_side) = duplex(64 * 1024);

    let serving = server.clone();
    let serve = tokio::spawn(async move { serving.serve_connection(device_side).await });

    RemoteDevice {
        executor: RemoteExecutor::new(host_side),
        server,
        serve,
        worker,
    }
}

async fn stop_server(
    server: DeviceServer,
    serve: tokio::task::JoinHandle<common::Result<()>>,
    worker: std::thread::JoinHandle<()>,
) {
    let _ = serve.await;
    server.shutdown().await.unwrap();
    worker.join().unwrap();
}

#[tokio::test]
async fn test_remote_operations() {
    let RemoteDevice {
        executor,
        server,
        serve,
        worker,
    } = remote_loopback();

    executor.ping().await.unwrap();

    let mut descriptor = [0u8; 18];
    let setup = SetupPacket::get_descriptor(1, 0, 18).to_bytes();
    assert_eq!(executor.control_read(&setup, &mut descriptor).await, Ok(18));
    assert_eq!(descriptor, LoopbackDevice::device_descriptor());

    executor
        .data_out(TransferType::Bulk, 1, &[1, 2, 3, 4])
        .await
        .unwrap();

    let mut buffer = [0u8; 64];
    assert_eq!(
        executor.data_in(TransferType::Bulk, 1, &mut buffer).await,
        Ok(4)
    );
    assert_eq!(&buffer[..4], &[1, 2, 3, 4]);

    // Empty endpoint and unknown endpoint come back as device results
    assert_eq!(
        executor.data_in(TransferType::Bulk, 1, &mut buffer).await,
        Err(UsbError::Nak)
    );
    assert_eq!(
        executor.data_out(TransferType::Bulk, 5, &[0]).await,
        Err(UsbError::Stall)
    );

    drop(executor);
    stop_server(server, serve, worker).await;
}

#[tokio::test]
async fn test_short_host_buffer_is_filled() {
    let RemoteDevice {
        executor,
        server,
        serve,
        worker,
    } = remote_loopback();

    // The loopback device hands back at most the requested length, so a
    // short buffer never sees more than fits.
    let mut small = [0u8; 8];
    let setup = SetupPacket::get_descriptor(1, 0, 18).to_bytes();
    assert_eq!(executor.control_read(&setup, &mut small).await, Ok(8));
    assert_eq!(small[..], LoopbackDevice::device_descriptor()[..8]);

    drop(executor);
    stop_server(server, serve, worker).await;
}

#[tokio::test]
async fn test_remote_device_through_registry() {
    let RemoteDevice {
        executor,
        server,
        serve,
        worker,
    } = remote_loopback();

    let registry = DeviceRegistry::new(ProcessorSettings {
        bus_delay: Duration::ZERO,
        ..Default::default()
    });
    let device = registry.plug(0, DeviceTarget::remote(executor)).unwrap();
    assert_eq!(device.target().kind(), "remote");

    with_timeout(DEFAULT_TEST_TIMEOUT, set_address(&registry, 0, 12))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.address(), 12);

    let descriptor = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        control_read(&registry, 12, SetupPacket::get_descriptor(1, 0, 18)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(descriptor, LoopbackDevice::device_descriptor().to_vec());

    // Bulk echo through the queue processor
    let (tx, rx) = oneshot::channel();
    let out = Transfer::create(12, 1, Direction::Out, TransferType::Bulk, OwnerHandle(2), Box::new(()))
        .with_data(vec![9, 8, 7])
        .on_out_complete(move |_, result, _| {
            let _ = tx.send(result);
        });
    registry.submit(out).unwrap();
    assert_eq!(with_timeout(DEFAULT_TEST_TIMEOUT, rx).await.unwrap().unwrap(), Ok(()));

    let (tx, rx) = oneshot::channel();
    let input = Transfer::create(12, 1, Direction::In, TransferType::Bulk, OwnerHandle(2), Box::new(()))
        .with_in_buffer(16)
        .on_in_complete(move |_, result, data, _| {
            let _ = tx.send((result, data));
        });
    registry.submit(input).unwrap();
    let (result, data) = with_timeout(DEFAULT_TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert_eq!(result, Ok(3));
    assert_eq!(&data[..3], &[9, 8, 7]);

    // Dropping the executor with the device closes the stream
    registry.unplug_all().await;
    drop(device);
    stop_server(server, serve, worker).await;
}

#[tokio::test]
async fn test_transport_failure_completes_transfer() {
    let (host_side, device_side) = duplex(1024);
    drop(device_side);

    let registry = DeviceRegistry::new(ProcessorSettings {
        bus_delay: Duration::ZERO,
        ..Default::default()
    });
    let device = registry
        .plug(3, DeviceTarget::remote(RemoteExecutor::new(host_side)))
        .unwrap();

    let (tx, rx) = oneshot::channel();
    let transfer = Transfer::create(3, 1, Direction::Out, TransferType::Bulk, OwnerHandle(1), Box::new(()))
        .with_data(vec![1])
        .on_out_complete(move |_, result, _| {
            let _ = tx.send(result);
        });
    registry.submit(transfer).unwrap();

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert!(matches!(result, Err(UsbError::Transport { .. })));

    // The processor keeps running after a transport failure
    assert!(device.is_plugged());
    registry.unplug_all().await;
}

#[tokio::test]
async fn test_stalled_remote_does_not_block_unplug_all() {
    // The peer end is kept open but never answers
    let (host_side, device_side) = duplex(1024);

    let registry = Arc::new(DeviceRegistry::new(ProcessorSettings {
        bus_delay: Duration::from_secs(3600),
        ..Default::default()
    }));
    let stalled = registry
        .plug(1, DeviceTarget::remote(RemoteExecutor::new(host_side)))
        .unwrap();
    let local = registry
        .plug(2, DeviceTarget::local(MockEmulation::new()))
        .unwrap();

    let (tx, stalled_result) = oneshot::channel();
    let transfer = Transfer::create(1, 1, Direction::Out, TransferType::Bulk, OwnerHandle(1), Box::new(()))
        .with_data(vec![1])
        .on_out_complete(move |_, result, _| {
            let _ = tx.send(result);
        });
    registry.submit(transfer).unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let results = results.clone();
        let transfer = Transfer::create(2, 1, Direction::Out, TransferType::Bulk, OwnerHandle(2), Box::new(()))
            .on_out_complete(move |_, result, _| results.lock().unwrap().push(result));
        registry.submit(transfer).unwrap();
    }

    // Remote processor waits on its reply; local one is pausing after the first transfer
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        while stalled.state() != ProcessorState::Executing || results.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let unplugging = registry.clone();
    let unplug_all = tokio::spawn(async move { unplugging.unplug_all().await });

    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        while local.state() != ProcessorState::Stopped {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert!(registry.is_empty());
    assert!(!stalled.is_plugged());
    assert_eq!(
        *results.lock().unwrap(),
        vec![Ok(()), Err(UsbError::Cancelled)]
    );
    assert!(!unplug_all.is_finished());

    // Closing the peer fails the stalled request and lets unplug_all finish
    drop(device_side);
    let result = with_timeout(DEFAULT_TEST_TIMEOUT, stalled_result).await.unwrap().unwrap();
    assert!(matches!(result, Err(UsbError::Transport { .. })));
    with_timeout(DEFAULT_TEST_TIMEOUT, unplug_all).await.unwrap().unwrap();
    assert_eq!(stalled.state(), ProcessorState::Stopped);
}
