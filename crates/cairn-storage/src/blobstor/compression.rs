//! Optional zstd compression of stored objects
//!
//! Every stored blob starts with one encoding byte, so a blob store can mix
//! compressed and plain entries whatever the object bytes begin with.

use cairn_common::{Error, Result};

/// Encoding byte of blobs stored as is
pub const ENCODING_PLAIN: u8 = 0;
/// Encoding byte of blobs holding a zstd frame
pub const ENCODING_ZSTD: u8 = 1;

#[derive(Clone, Copy, Debug)]
pub struct Compressor {
    enabled: bool,
    level: i32,
}

impl Compressor {
    #[must_use]
    pub const fn new(enabled: bool, level: i32) -> Self {
        Self { enabled, level }
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Stored form of `data`, compressed when enabled and worth it
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.enabled {
            let compressed = zstd::bulk::compress(data, self.level)?;
            if compressed.len() < data.len() {
                return Ok(tagged(ENCODING_ZSTD, &compressed));
            }
        }
        Ok(tagged(ENCODING_PLAIN, data))
    }

    /// Original bytes of a stored blob
    ///
    /// An unknown encoding byte or a broken zstd frame is `Corruption`.
    pub fn decode(mut stored: Vec<u8>) -> Result<Vec<u8>> {
        match stored.first().copied() {
            Some(ENCODING_PLAIN) => {
                stored.remove(0);
                Ok(stored)
            }
            Some(ENCODING_ZSTD) => zstd::stream::decode_all(&stored[1..])
                .map_err(|e| Error::corruption(format!("corrupt zstd frame: {e}"))),
            Some(other) => Err(Error::corruption(format!("unknown blob encoding {other}"))),
            None => Err(Error::corruption("empty blob")),
        }
    }
}

fn tagged(encoding: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + data.len());
    out.push(encoding);
    out.extend_from_slice(data);
    out
}

/// Whether a stored blob holds a zstd frame
#[must_use]
pub fn is_compressed(stored: &[u8]) -> bool {
    stored.first() == Some(&ENCODING_ZSTD)
}
