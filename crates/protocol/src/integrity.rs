//! Payload integrity for data carried over a device channel
//!
//! Data payloads of OUT requests and IN replies carry a CRC32 of their
//! bytes. A mismatch on receipt is reported as a transport error for the
//! transfer rather than handing corrupted data to a driver.

use crc32fast::Hasher;

/// Compute the CRC32 checksum of a payload
#[inline]
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify a payload against its expected checksum
#[inline]
pub fn verify_checksum(data: &[u8], expected_checksum: u32) -> bool {
    compute_checksum(data) == expected_checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_deterministic() {
        let data = b"virtual usb payload";
        assert_eq!(compute_checksum(data), compute_checksum(data));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut data = vec![0x12, 0x34, 0x56, 0x78];
        let checksum = compute_checksum(&data);
        assert!(verify_checksum(&data, checksum));

        data[2] ^= 0x01;
        assert!(!verify_checksum(&data, checksum));
    }

    #[test]
    fn test_empty_payload() {
        // CRC32 of nothing is zero
        assert_eq!(compute_checksum(&[]), 0);
        assert!(verify_checksum(&[], 0));
    }
}
