//! Awaitable standard requests
//!
//! Thin wrappers that build a control transfer, submit it, and wait for its
//! completion callback through a oneshot channel. Used for enumeration.

use crate::vhc::registry::DeviceRegistry;
use crate::vhc::transfer::{OwnerHandle, Transfer};
use protocol::{Direction, SetupPacket, TransferType, UsbAddress};
use tokio::sync::oneshot;

/// Owner reported for requests issued by the host controller itself
pub const HOST_OWNER: OwnerHandle = OwnerHandle(0);

/// Issue a device-to-host control request on endpoint 0
///
/// Returns the bytes the device actually produced.
pub async fn control_read(
    registry: &DeviceRegistry,
    address: UsbAddress,
    setup: SetupPacket,
) -> common::Result<Vec<u8>> {
    let (tx, rx) = oneshot::channel();

    let transfer = Transfer::create(
        address,
        0,
        Direction::In,
        TransferType::Control,
        HOST_OWNER,
        Box::new(()),
    )
    .with_setup(setup.to_bytes().to_vec())
    .with_in_buffer(setup.length as usize)
    .on_in_complete(move |_, result, data, _| {
        let _ = tx.send(result.map(|size| data[..size.min(data.len())].to_vec()));
    });

    submit(registry, transfer)?;

    let data = rx
        .await
        .map_err(|_| common::Error::Channel("control read dropped without completion".into()))??;
    Ok(data)
}

/// Issue a host-to-device control request on endpoint 0
pub async fn control_write(
    registry: &DeviceRegistry,
    address: UsbAddress,
    setup: SetupPacket,
    data: Vec<u8>,
) -> common::Result<()> {
    let (tx, rx) = oneshot::channel();

    let transfer = Transfer::create(
        address,
        0,
        Direction::Out,
        TransferType::Control,
        HOST_OWNER,
        Box::new(()),
    )
    .with_setup(setup.to_bytes().to_vec())
    .with_data(data)
    .on_out_complete(move |_, result, _| {
        let _ = tx.send(result);
    });

    submit(registry, transfer)?;

    rx.await
        .map_err(|_| common::Error::Channel("control write dropped without completion".into()))??;
    Ok(())
}

/// Move a device from `address` to `new_address`
pub async fn set_address(
    registry: &DeviceRegistry,
    address: UsbAddress,
    new_address: UsbAddress,
) -> common::Result<()> {
    control_write(registry, address, SetupPacket::set_address(new_address), Vec::new()).await
}

fn submit(registry: &DeviceRegistry, transfer: Transfer) -> common::Result<()> {
    registry
        .submit(transfer)
        .map_err(|e| common::Error::DeviceNotFound(e.to_string()))
}
