//! Compressed chunk block header
//!
//! Every compressed chunk payload starts with:
//!
//! ```text
//! u32 tag               0x9E2A83C1 (byte-reversed for big-endian payloads)
//! u32 block_size        0x9E2A83C1 here means the default of 0x20000
//! u32 compressed_size   sum of block payload sizes
//! u32 uncompressed_size sum of block output sizes
//! { u32 compressed, u32 uncompressed } per block, until outputs cover the chunk
//! ```

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::codec::BlockCodec;
use crate::{Error, Result, PACKAGE_FILE_TAG, PACKAGE_FILE_TAG_SWAPPED};

/// Block size used when the header does not declare one
pub const DEFAULT_BLOCK_SIZE: u32 = 0x20000;

const FIXED_HEADER_LEN: usize = 16;
const BLOCK_RECORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBlock {
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub block_size: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub blocks: Vec<ChunkBlock>,
    /// Header and block records are big-endian
    pub swapped: bool,
}

impl ChunkHeader {
    /// Parse the header at the start of `data`; `offset` is only used in errors
    pub fn parse(data: &[u8], offset: u64) -> Result<Self> {
        let bad = |reason: String| Error::BadChunkHeader { offset, reason };

        if data.len() < FIXED_HEADER_LEN {
            return Err(bad(format!("{} bytes is too short", data.len())));
        }
        let swapped = match LittleEndian::read_u32(data) {
            PACKAGE_FILE_TAG => false,
            PACKAGE_FILE_TAG_SWAPPED => true,
            other => return Err(bad(format!("tag {other:#010x}"))),
        };
        let word = |at: usize| {
            if swapped {
                BigEndian::read_u32(&data[at..])
            } else {
                LittleEndian::read_u32(&data[at..])
            }
        };

        let block_size = match word(4) {
            PACKAGE_FILE_TAG => DEFAULT_BLOCK_SIZE,
            size => size,
        };
        let compressed_size = word(8);
        let uncompressed_size = word(12);

        let mut blocks = Vec::new();
        let mut covered: u64 = 0;
        let mut at = FIXED_HEADER_LEN;
        while covered < uncompressed_size as u64 {
            if at + BLOCK_RECORD_LEN > data.len() {
                return Err(bad(format!(
                    "block table truncated after {} blocks",
                    blocks.len()
                )));
            }
            let block = ChunkBlock {
                compressed_size: word(at),
                uncompressed_size: word(at + 4),
            };
            if block.uncompressed_size == 0 {
                return Err(bad(format!("block {} is empty", blocks.len())));
            }
            covered += block.uncompressed_size as u64;
            blocks.push(block);
            at += BLOCK_RECORD_LEN;
        }

        Ok(Self {
            block_size,
            compressed_size,
            uncompressed_size,
            blocks,
            swapped,
        })
    }

    /// Size of the header including block records
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.blocks.len() * BLOCK_RECORD_LEN
    }

    /// Payload ranges of each block, relative to the start of the header
    pub fn block_ranges(&self) -> Vec<std::ops::Range<usize>> {
        let mut start = self.encoded_len();
        self.blocks
            .iter()
            .map(|block| {
                let range = start..start + block.compressed_size as usize;
                start = range.end;
                range
            })
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len()];
        let put = |buf: &mut [u8], value: u32| {
            if self.swapped {
                BigEndian::write_u32(buf, value)
            } else {
                LittleEndian::write_u32(buf, value)
            }
        };
        put(&mut out[0..], PACKAGE_FILE_TAG);
        put(&mut out[4..], self.block_size);
        put(&mut out[8..], self.compressed_size);
        put(&mut out[12..], self.uncompressed_size);
        for (i, block) in self.blocks.iter().enumerate() {
            let at = FIXED_HEADER_LEN + i * BLOCK_RECORD_LEN;
            put(&mut out[at..], block.compressed_size);
            put(&mut out[at + 4..], block.uncompressed_size);
        }
        out
    }
}

/// Compress `data` into one chunk payload: header followed by block payloads
pub fn encode_chunk(data: &[u8], codec: &dyn BlockCodec, block_size: u32) -> Result<Vec<u8>> {
    let mut payloads = Vec::new();
    let mut blocks = Vec::new();
    for piece in data.chunks(block_size.max(1) as usize) {
        let packed = codec.compress_block(piece)?;
        blocks.push(ChunkBlock {
            compressed_size: packed.len() as u32,
            uncompressed_size: piece.len() as u32,
        });
        payloads.push(packed);
    }

    let header = ChunkHeader {
        block_size,
        compressed_size: payloads.iter().map(|p| p.len() as u32).sum(),
        uncompressed_size: data.len() as u32,
        blocks,
        swapped: false,
    };
    let mut out = header.encode();
    for payload in payloads {
        out.extend_from_slice(&payload);
    }
    Ok(out)
}
