//! Device emulation contract
//!
//! A [`UsbEmulation`] is what a virtual device does when the host pokes it.
//! The host controller calls it directly for in-process devices, and the
//! device process calls it on behalf of a remote host.

use protocol::{
    SetupPacket, TransferType, USB_DEVREQ_GET_DESCRIPTOR, USB_DEVREQ_SET_ADDRESS, UsbAddress,
    UsbEndpoint, UsbError,
};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// The four operations a virtual device exposes to the host
///
/// IN operations fill `data` and return the number of bytes produced.
/// Returning `Err(UsbError::Nak)` asks the host to retry later.
pub trait UsbEmulation: Send {
    /// Control transfer, device to host
    fn control_read(&mut self, setup: &[u8], data: &mut [u8]) -> Result<usize, UsbError>;

    /// Control transfer, host to device
    fn control_write(&mut self, setup: &[u8], data: &[u8]) -> Result<(), UsbError>;

    /// Bulk, interrupt or isochronous transfer, device to host
    fn data_in(
        &mut self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &mut [u8],
    ) -> Result<usize, UsbError>;

    /// Bulk, interrupt or isochronous transfer, host to device
    fn data_out(
        &mut self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &[u8],
    ) -> Result<(), UsbError>;
}

impl<T: UsbEmulation + ?Sized> UsbEmulation for Box<T> {
    fn control_read(&mut self, setup: &[u8], data: &mut [u8]) -> Result<usize, UsbError> {
        (**self).control_read(setup, data)
    }

    fn control_write(&mut self, setup: &[u8], data: &[u8]) -> Result<(), UsbError> {
        (**self).control_write(setup, data)
    }

    fn data_in(
        &mut self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        (**self).data_in(transfer_type, endpoint, data)
    }

    fn data_out(
        &mut self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &[u8],
    ) -> Result<(), UsbError> {
        (**self).data_out(transfer_type, endpoint, data)
    }
}

const DESC_DEVICE: u8 = 0x01;
const DESC_CONFIGURATION: u8 = 0x02;
const REQ_GET_STATUS: u8 = 0x00;
const REQ_GET_CONFIGURATION: u8 = 0x08;
const REQ_SET_CONFIGURATION: u8 = 0x09;

/// Loopback endpoint number (EP1 OUT / EP1 IN)
pub const LOOPBACK_ENDPOINT: UsbEndpoint = 1;

/// Vendor-specific loopback device
///
/// Answers the standard enumeration requests and echoes whatever is written
/// to bulk EP1 OUT back on EP1 IN. Reading an empty endpoint NAKs.
#[derive(Debug, Default)]
pub struct LoopbackDevice {
    address: UsbAddress,
    configuration: u8,
    pending: HashMap<UsbEndpoint, VecDeque<Vec<u8>>>,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address last assigned by SET_ADDRESS
    pub fn address(&self) -> UsbAddress {
        self.address
    }

    /// Currently selected configuration (0 = unconfigured)
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Standard 18-byte device descriptor
    pub fn device_descriptor() -> [u8; 18] {
        [
            0x12, // bLength
            0x01, // bDescriptorType (Device)
            0x00, 0x02, // bcdUSB (2.00)
            0xFF, // bDeviceClass (Vendor-specific)
            0x00, // bDeviceSubClass
            0x00, // bDeviceProtocol
            0x40, // bMaxPacketSize0 (64 bytes)
            0x09, 0x12, // idVendor (0x1209)
            0x01, 0x00, // idProduct (0x0001)
            0x00, 0x01, // bcdDevice (1.00)
            0x00, // iManufacturer
            0x00, // iProduct
            0x00, // iSerialNumber
            0x01, // bNumConfigurations
        ]
    }

    /// Configuration descriptor with one interface and two bulk endpoints
    pub fn config_descriptor() -> [u8; 32] {
        [
            // Configuration descriptor
            0x09, 0x02, 0x20, 0x00, // bLength, type, wTotalLength (32)
            0x01, 0x01, 0x00, 0x80, // interfaces, value, iConfiguration, bus-powered
            0x32, // bMaxPower (100mA)
            // Interface descriptor
            0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00,
            // EP1 OUT, bulk, 64 bytes
            0x07, 0x05, 0x01, 0x02, 0x40, 0x00, 0x00,
            // EP1 IN, bulk, 64 bytes
            0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00,
        ]
    }

    fn copy_out(source: &[u8], data: &mut [u8], requested: u16) -> usize {
        let len = source.len().min(data.len()).min(requested as usize);
        data[..len].copy_from_slice(&source[..len]);
        len
    }
}

impl UsbEmulation for LoopbackDevice {
    fn control_read(&mut self, setup: &[u8], data: &mut [u8]) -> Result<usize, UsbError> {
        let setup = SetupPacket::parse(setup).ok_or(UsbError::InvalidParam)?;
        trace!("Loopback control read: {:?}", setup);

        match setup.request {
            USB_DEVREQ_GET_DESCRIPTOR => match (setup.value >> 8) as u8 {
                DESC_DEVICE => Ok(Self::copy_out(
                    &Self::device_descriptor(),
                    data,
                    setup.length,
                )),
                DESC_CONFIGURATION => Ok(Self::copy_out(
                    &Self::config_descriptor(),
                    data,
                    setup.length,
                )),
                _ => Err(UsbError::Stall),
            },
            REQ_GET_STATUS => Ok(Self::copy_out(&[0x00, 0x00], data, setup.length)),
            REQ_GET_CONFIGURATION => Ok(Self::copy_out(&[self.configuration], data, setup.length)),
            _ => Err(UsbError::Stall),
        }
    }

    fn control_write(&mut self, setup: &[u8], _data: &[u8]) -> Result<(), UsbError> {
        let setup = SetupPacket::parse(setup).ok_or(UsbError::InvalidParam)?;
        trace!("Loopback control write: {:?}", setup);

        match setup.request {
            USB_DEVREQ_SET_ADDRESS => {
                self.address = setup.value as UsbAddress;
                debug!("Loopback device accepted address {}", self.address);
                Ok(())
            }
            REQ_SET_CONFIGURATION => {
                self.configuration = setup.value as u8;
                Ok(())
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn data_in(
        &mut self,
        _transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        if endpoint != LOOPBACK_ENDPOINT {
            return Err(UsbError::Stall);
        }
        let queue = self.pending.entry(endpoint).or_default();
        let Some(mut packet) = queue.pop_front() else {
            return Err(UsbError::Nak);
        };

        let len = packet.len().min(data.len());
        data[..len].copy_from_slice(&packet[..len]);
        if len < packet.len() {
            // Keep the remainder for the next read
            packet.drain(..len);
            queue.push_front(packet);
        }
        Ok(len)
    }

    fn data_out(
        &mut self,
        _transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &[u8],
    ) -> Result<(), UsbError> {
        if endpoint != LOOPBACK_ENDPOINT {
            return Err(UsbError::Stall);
        }
        self.pending
            .entry(endpoint)
            .or_default()
            .push_back(data.to_vec());
        Ok(())
    }
}
