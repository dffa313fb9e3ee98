//! Test utilities for the virtual host controller
//!
//! Provides a scriptable mock emulation and helper functions for testing
//! across crates.
//!
//! # Example
//!
//! ```
//! use common::UsbEmulation;
//! use common::test_utils::{MockEmulation, MockOp};
//! use protocol::{TransferType, UsbError};
//!
//! let mock = MockEmulation::new();
//! mock.push_result(Err(UsbError::Nak));
//!
//! let mut device = mock.clone();
//! assert_eq!(device.data_out(TransferType::Bulk, 1, &[1]), Err(UsbError::Nak));
//! assert_eq!(mock.calls()[0].op, MockOp::DataOut);
//! ```

use crate::emulation::UsbEmulation;
use protocol::{SetupPacket, TransferType, UsbEndpoint, UsbError};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Which emulation operation a [`MockCall`] recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    ControlRead,
    ControlWrite,
    DataIn,
    DataOut,
}

/// One recorded call into a [`MockEmulation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub setup: Vec<u8>,
    pub transfer_type: TransferType,
    pub endpoint: UsbEndpoint,
    /// OUT payload, or the IN buffer size as zeroes
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    results: VecDeque<Result<Vec<u8>, UsbError>>,
}

/// Scriptable emulation for tests
///
/// Each call pops the next queued result. `Ok(bytes)` fills the IN buffer
/// (truncated to its size) and is plain success for OUT operations. With no
/// result queued every call succeeds with no data. Clones share state, so a
/// test can keep one handle while the device owns another.
#[derive(Debug, Clone, Default)]
pub struct MockEmulation {
    state: Arc<Mutex<MockState>>,
}

impl MockEmulation {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue the result for the next call
    pub fn push_result(&self, result: Result<Vec<u8>, UsbError>) {
        self.state().results.push_back(result);
    }

    /// Queue the same result `count` times
    pub fn push_results(&self, result: Result<Vec<u8>, UsbError>, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            state.results.push_back(result.clone());
        }
    }

    /// All calls recorded so far
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Number of calls recorded so far
    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    fn record(&self, call: MockCall) -> Result<Vec<u8>, UsbError> {
        let mut state = self.state();
        state.calls.push(call);
        state.results.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    fn fill(result: Result<Vec<u8>, UsbError>, data: &mut [u8]) -> Result<usize, UsbError> {
        let bytes = result?;
        let len = bytes.len().min(data.len());
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }
}

impl UsbEmulation for MockEmulation {
    fn control_read(&mut self, setup: &[u8], data: &mut [u8]) -> Result<usize, UsbError> {
        let result = self.record(MockCall {
            op: MockOp::ControlRead,
            setup: setup.to_vec(),
            transfer_type: TransferType::Control,
            endpoint: 0,
            data: vec![0; data.len()],
        });
        Self::fill(result, data)
    }

    fn control_write(&mut self, setup: &[u8], data: &[u8]) -> Result<(), UsbError> {
        self.record(MockCall {
            op: MockOp::ControlWrite,
            setup: setup.to_vec(),
            transfer_type: TransferType::Control,
            endpoint: 0,
            data: data.to_vec(),
        })
        .map(|_| ())
    }

    fn data_in(
        &mut self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        let result = self.record(MockCall {
            op: MockOp::DataIn,
            setup: Vec::new(),
            transfer_type,
            endpoint,
            data: vec![0; data.len()],
        });
        Self::fill(result, data)
    }

    fn data_out(
        &mut self,
        transfer_type: TransferType,
        endpoint: UsbEndpoint,
        data: &[u8],
    ) -> Result<(), UsbError> {
        self.record(MockCall {
            op: MockOp::DataOut,
            setup: Vec::new(),
            transfer_type,
            endpoint,
            data: data.to_vec(),
        })
        .map(|_| ())
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Raw bytes of a SET_ADDRESS setup packet
pub fn set_address_setup(address: u8) -> Vec<u8> {
    SetupPacket::set_address(address).to_bytes().to_vec()
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}
