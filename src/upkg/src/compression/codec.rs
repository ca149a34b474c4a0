//! Block codec backends
//!
//! Every codec the engine understands sits behind [`BlockCodec`]. Backends
//! return the bytes a block actually produced; the chunk layer compares that
//! against the declared size so that a short or long block is always reported
//! as corruption rather than silently padded or truncated.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;

use crate::{Error, Result};

/// LZX window used by console packages, 2^17 bytes
const LZX_WINDOW_BITS: u32 = 17;

/// Interchangeable block decompressor
pub trait BlockCodec: Send + Sync {
    /// Decompress one block whose declared output size is `expected`
    fn decompress_block(&self, compressed: &[u8], expected: usize) -> Result<Vec<u8>>;

    /// Compress one block; decompression-only codecs refuse
    fn compress_block(&self, _data: &[u8]) -> Result<Vec<u8>> {
        Err(Error::UnsupportedCodec(self.name()))
    }

    /// Backend name for diagnostics
    fn name(&self) -> &'static str;
}

/// Identity codec for stored blocks
#[derive(Debug, Default)]
pub struct StoreCodec;

impl BlockCodec for StoreCodec {
    fn decompress_block(&self, compressed: &[u8], _expected: usize) -> Result<Vec<u8>> {
        Ok(compressed.to_vec())
    }

    fn compress_block(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn name(&self) -> &'static str {
        "store"
    }
}

#[derive(Debug, Default)]
pub struct ZlibCodec;

impl BlockCodec for ZlibCodec {
    fn decompress_block(&self, compressed: &[u8], expected: usize) -> Result<Vec<u8>> {
        // one byte of headroom lets an overlong stream show up as a size mismatch
        let mut output = Vec::with_capacity(expected);
        ZlibDecoder::new(compressed)
            .take(expected as u64 + 1)
            .read_to_end(&mut output)
            .map_err(|e| Error::Codec {
                codec: self.name(),
                message: e.to_string(),
            })?;
        Ok(output)
    }

    fn compress_block(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn name(&self) -> &'static str {
        "zlib"
    }
}

#[derive(Debug, Default)]
pub struct LzoCodec;

impl BlockCodec for LzoCodec {
    fn decompress_block(&self, compressed: &[u8], _expected: usize) -> Result<Vec<u8>> {
        lzokay_native::decompress_all(compressed, None).map_err(|e| Error::Codec {
            codec: self.name(),
            message: format!("{e:?}"),
        })
    }

    fn compress_block(&self, data: &[u8]) -> Result<Vec<u8>> {
        lzokay_native::compress(data).map_err(|e| Error::Codec {
            codec: self.name(),
            message: format!("{e:?}"),
        })
    }

    fn name(&self) -> &'static str {
        "lzo"
    }
}

/// Raw LZ4 block format
#[derive(Debug, Default)]
pub struct Lz4Codec;

impl BlockCodec for Lz4Codec {
    fn decompress_block(&self, compressed: &[u8], expected: usize) -> Result<Vec<u8>> {
        let mut output = vec![0u8; expected + 1];
        let written = lz4_flex::block::decompress_into(compressed, &mut output).map_err(|e| {
            Error::Codec {
                codec: self.name(),
                message: e.to_string(),
            }
        })?;
        output.truncate(written);
        Ok(output)
    }

    fn compress_block(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::block::compress(data))
    }

    fn name(&self) -> &'static str {
        "lz4"
    }
}

/// LZX with a 128 KiB window, one continuous stream per block
#[derive(Debug, Default)]
pub struct LzxCodec;

impl BlockCodec for LzxCodec {
    fn decompress_block(&self, compressed: &[u8], expected: usize) -> Result<Vec<u8>> {
        super::lzx::decompress(compressed, expected, LZX_WINDOW_BITS)
    }

    fn name(&self) -> &'static str {
        "lzx"
    }
}

/// Open-source Oodle decompressor using the oozextract crate
pub struct OodleCodec {
    extractor: Mutex<oozextract::Extractor>,
}

impl OodleCodec {
    pub fn new() -> Self {
        Self {
            extractor: Mutex::new(oozextract::Extractor::new()),
        }
    }
}

impl Default for OodleCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OodleCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OodleCodec").finish()
    }
}

impl BlockCodec for OodleCodec {
    fn decompress_block(&self, compressed: &[u8], expected: usize) -> Result<Vec<u8>> {
        let mut output = vec![0u8; expected];
        let actual = self
            .extractor
            .lock()
            .read_from_slice(compressed, &mut output)
            .map_err(|e| Error::Codec {
                codec: self.name(),
                message: format!("oozextract: {e:?}"),
            })?;
        output.truncate(actual);
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "oodle"
    }
}
