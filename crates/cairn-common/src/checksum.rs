//! Checksum utilities for Cairn
//!
//! Payloads are addressed by SHA-256; encoded frames (objects, index records,
//! pack entries) are protected by CRC32C.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 checksum of an object payload
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    /// Compute the checksum of a payload
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Verify data against this checksum
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", hex::encode(self.0))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Shorthand for [`Checksum::compute`]
#[must_use]
pub fn payload_checksum(data: &[u8]) -> Checksum {
    Checksum::compute(data)
}

/// Append a little-endian CRC32C of `buf` to itself
pub fn seal_frame(buf: &mut Vec<u8>) {
    let crc = crc32c::crc32c(buf);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Split a sealed frame into its body, verifying the trailing CRC32C
///
/// Returns `None` when the frame is too short or the CRC does not match.
#[must_use]
pub fn open_frame(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < 4 {
        return None;
    }
    let (body, crc) = frame.split_at(frame.len() - 4);
    let stored = u32::from_le_bytes(crc.try_into().ok()?);
    (crc32c::crc32c(body) == stored).then_some(body)
}
