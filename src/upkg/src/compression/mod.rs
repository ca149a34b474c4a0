//! Chunked package compression
//!
//! Two package shapes exist:
//!
//! - **Partially compressed**: the summary is stored raw and lists a chunk
//!   table; export data is read through [`ChunkedSource`], which expands the
//!   owning chunk on demand.
//! - **Fully compressed**: the whole file is one chunk stream (see
//!   [`header::ChunkHeader`]) that is expanded before anything is parsed.
//!
//! Chunks are independent. [`decompress`] precomputes every chunk's output
//! slice from the table and fills them in parallel.

mod chunked;
pub mod codec;
pub mod header;
mod lzx;

use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use once_cell::sync::OnceCell;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub use chunked::ChunkedSource;
pub use codec::BlockCodec;
pub use header::{encode_chunk, ChunkBlock, ChunkHeader, DEFAULT_BLOCK_SIZE};

use crate::config::CancelToken;
use crate::{Error, Result, PACKAGE_FILE_TAG, PACKAGE_FILE_TAG_SWAPPED};

/// Package compression flag bits
pub mod flags {
    pub const ZLIB: u32 = 0x01;
    pub const LZO: u32 = 0x02;
    pub const LZX: u32 = 0x04;
    pub const LZ4: u32 = 0x10;
    pub const OODLE: u32 = 0x100;
}

/// Closed set of block codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Store,
    Zlib,
    Lzo,
    Lzx,
    Lz4,
    Oodle,
}

impl Codec {
    pub const ALL: [Codec; 6] = [
        Codec::Store,
        Codec::Zlib,
        Codec::Lzo,
        Codec::Lzx,
        Codec::Lz4,
        Codec::Oodle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Codec::Store => "store",
            Codec::Zlib => "zlib",
            Codec::Lzo => "lzo",
            Codec::Lzx => "lzx",
            Codec::Lz4 => "lz4",
            Codec::Oodle => "oodle",
        }
    }

    /// Codec named by a package's compression flags, if any bit is known
    pub fn from_flags(value: u32) -> Option<Codec> {
        if value & flags::ZLIB != 0 {
            Some(Codec::Zlib)
        } else if value & flags::LZO != 0 {
            Some(Codec::Lzo)
        } else if value & flags::LZX != 0 {
            Some(Codec::Lzx)
        } else if value & flags::LZ4 != 0 {
            Some(Codec::Lz4)
        } else if value & flags::OODLE != 0 {
            Some(Codec::Oodle)
        } else {
            None
        }
    }

    pub fn flag(self) -> u32 {
        match self {
            Codec::Store => 0,
            Codec::Zlib => flags::ZLIB,
            Codec::Lzo => flags::LZO,
            Codec::Lzx => flags::LZX,
            Codec::Lz4 => flags::LZ4,
            Codec::Oodle => flags::OODLE,
        }
    }

    /// Guess the codec from the first bytes of a compressed block
    pub fn detect(block: &[u8]) -> Codec {
        match block {
            [0x78, 0x9C | 0xDA, ..] => Codec::Zlib,
            [0x8C | 0xCC, 0x05 | 0x06 | 0x0A | 0x0B | 0x0C, ..] => Codec::Oodle,
            _ => Codec::Lzo,
        }
    }

    pub fn backend(self) -> Box<dyn BlockCodec> {
        match self {
            Codec::Store => Box::new(codec::StoreCodec),
            Codec::Zlib => Box::new(codec::ZlibCodec),
            Codec::Lzo => Box::new(codec::LzoCodec),
            Codec::Lzx => Box::new(codec::LzxCodec),
            Codec::Lz4 => Box::new(codec::Lz4Codec),
            Codec::Oodle => Box::new(codec::OodleCodec::new()),
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Codec::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Config(format!("unknown codec '{s}'")))
    }
}

/// Picks the codec for a package: explicit override, then package flag, then
/// magic-byte detection on the first compressed block (cached)
#[derive(Debug, Default)]
pub struct CodecSelector {
    forced: Option<Codec>,
    flagged: Option<Codec>,
    detected: OnceCell<Codec>,
}

impl CodecSelector {
    pub fn new(forced: Option<Codec>, flagged: Option<Codec>) -> Self {
        Self {
            forced,
            flagged,
            detected: OnceCell::new(),
        }
    }

    pub fn select(&self, first_block: &[u8]) -> Codec {
        self.forced
            .or(self.flagged)
            .unwrap_or_else(|| *self.detected.get_or_init(|| Codec::detect(first_block)))
    }
}

/// On-disk field order of a chunk record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkFieldOrder {
    /// `{uncompressedOffset, uncompressedSize, compressedOffset, compressedSize}`
    #[default]
    UncompressedFirst,
    /// `{compressedOffset, compressedSize, uncompressedOffset, uncompressedSize}`
    CompressedFirst,
}

/// One independently compressed region of a package
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompressionChunk {
    pub uncompressed_offset: u64,
    pub uncompressed_size: u64,
    pub compressed_offset: u64,
    pub compressed_size: u64,
}

impl CompressionChunk {
    pub fn uncompressed_end(&self) -> u64 {
        self.uncompressed_offset + self.uncompressed_size
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.uncompressed_offset && pos < self.uncompressed_end()
    }

    /// Build from the four raw record fields in on-disk order
    pub fn from_fields(fields: [i32; 4], order: ChunkFieldOrder) -> Result<Self> {
        if let Some(bad) = fields.iter().find(|&&v| v < 0) {
            return Err(Error::InvalidSummary(format!(
                "negative chunk field {bad}"
            )));
        }
        let [a, b, c, d] = fields.map(|v| v as u64);
        Ok(match order {
            ChunkFieldOrder::UncompressedFirst => Self {
                uncompressed_offset: a,
                uncompressed_size: b,
                compressed_offset: c,
                compressed_size: d,
            },
            ChunkFieldOrder::CompressedFirst => Self {
                compressed_offset: a,
                compressed_size: b,
                uncompressed_offset: c,
                uncompressed_size: d,
            },
        })
    }

    pub fn to_fields(&self, order: ChunkFieldOrder) -> [i32; 4] {
        let [uo, us, co, cs] = [
            self.uncompressed_offset,
            self.uncompressed_size,
            self.compressed_offset,
            self.compressed_size,
        ]
        .map(|v| v as i32);
        match order {
            ChunkFieldOrder::UncompressedFirst => [uo, us, co, cs],
            ChunkFieldOrder::CompressedFirst => [co, cs, uo, us],
        }
    }
}

/// First compressed block of a chunk, used for codec detection
fn first_block<'a>(chunk: &CompressionChunk, raw: &'a [u8]) -> &'a [u8] {
    let start = chunk.compressed_offset as usize;
    let end = (chunk.compressed_offset + chunk.compressed_size) as usize;
    let Some(payload) = raw.get(start..end.min(raw.len())) else {
        return &[];
    };
    match ChunkHeader::parse(payload, chunk.compressed_offset) {
        Ok(header) => payload.get(header.encoded_len()..).unwrap_or(&[]),
        Err(_) => &[],
    }
}

/// Expand one chunk's payload from `raw` (the compressed file bytes)
pub fn decompress_chunk(
    index: usize,
    chunk: &CompressionChunk,
    selector: &CodecSelector,
    raw: &[u8],
) -> Result<Vec<u8>> {
    let start = chunk.compressed_offset as usize;
    let payload = raw
        .get(start..start + chunk.compressed_size as usize)
        .ok_or_else(|| Error::BadChunkHeader {
            offset: chunk.compressed_offset,
            reason: format!(
                "payload of {} bytes runs past end of file ({} bytes)",
                chunk.compressed_size,
                raw.len()
            ),
        })?;

    // equal sizes mean the chunk was stored without a block header
    let output = if chunk.compressed_size == chunk.uncompressed_size {
        payload.to_vec()
    } else {
        let header = ChunkHeader::parse(payload, chunk.compressed_offset)?;
        let codec = selector.select(payload.get(header.encoded_len()..).unwrap_or(&[]));
        decompress_blocks(index, &header, payload, codec, false)?
    };

    if output.len() as u64 != chunk.uncompressed_size {
        return Err(Error::CorruptChunk {
            index,
            expected: chunk.uncompressed_size as usize,
            actual: output.len(),
        });
    }
    Ok(output)
}

fn decompress_blocks(
    index: usize,
    header: &ChunkHeader,
    payload: &[u8],
    codec: Codec,
    parallel: bool,
) -> Result<Vec<u8>> {
    let ranges = header.block_ranges();
    if let Some(last) = ranges.last() {
        if last.end > payload.len() {
            return Err(Error::BadChunkHeader {
                offset: 0,
                reason: format!(
                    "block payloads need {} bytes, chunk has {}",
                    last.end,
                    payload.len()
                ),
            });
        }
    }

    let backend = codec.backend();
    let decode = |(range, block): (&std::ops::Range<usize>, &ChunkBlock)| {
        backend.decompress_block(&payload[range.clone()], block.uncompressed_size as usize)
    };
    let pieces: Vec<Vec<u8>> = if parallel {
        ranges
            .par_iter()
            .zip(header.blocks.par_iter())
            .map(decode)
            .collect::<Result<_>>()?
    } else {
        ranges
            .iter()
            .zip(header.blocks.iter())
            .map(decode)
            .collect::<Result<_>>()?
    };

    let mut output = Vec::with_capacity(header.uncompressed_size as usize);
    for (piece, block) in pieces.iter().zip(&header.blocks) {
        if piece.len() != block.uncompressed_size as usize {
            return Err(Error::CorruptChunk {
                index,
                expected: header.uncompressed_size as usize,
                actual: output.len() + piece.len(),
            });
        }
        output.extend_from_slice(piece);
    }
    Ok(output)
}

/// Expand every chunk of a partially compressed package into one buffer.
///
/// Bytes before the first chunk are copied from `raw` unchanged (the summary
/// region is never compressed). Each chunk writes into its own precomputed
/// slice, so chunks may complete in any order.
pub fn decompress(
    chunks: &[CompressionChunk],
    selector: &CodecSelector,
    raw: &[u8],
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    let mut order: Vec<usize> = (0..chunks.len()).collect();
    order.sort_by_key(|&i| chunks[i].uncompressed_offset);

    let Some(&first) = order.first() else {
        return Ok(raw.to_vec());
    };
    let prefix = chunks[first].uncompressed_offset as usize;
    let total = order
        .iter()
        .map(|&i| chunks[i].uncompressed_end())
        .max()
        .unwrap_or(0) as usize;
    if prefix > raw.len() {
        return Err(Error::InvalidSummary(format!(
            "first chunk starts at {prefix:#x}, past end of file"
        )));
    }

    // detect once up front so parallel chunks agree on the codec
    selector.select(first_block(&chunks[first], raw));

    let mut output = vec![0u8; total];
    output[..prefix].copy_from_slice(&raw[..prefix]);

    let mut slices: Vec<(usize, &mut [u8])> = Vec::with_capacity(chunks.len());
    let mut rest = &mut output[prefix..];
    let mut cursor = prefix as u64;
    for &i in &order {
        let chunk = &chunks[i];
        if chunk.uncompressed_offset < cursor {
            return Err(Error::InvalidSummary(format!(
                "chunk {i} overlaps the previous chunk at {:#x}",
                chunk.uncompressed_offset
            )));
        }
        let gap = (chunk.uncompressed_offset - cursor) as usize;
        if gap > 0 {
            tracing::warn!(chunk = i, gap, "gap between compressed chunks");
        }
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(gap);
        let (slot, tail) = tail.split_at_mut(chunk.uncompressed_size as usize);
        slices.push((i, slot));
        rest = tail;
        cursor = chunk.uncompressed_end();
    }

    slices.into_par_iter().try_for_each(|(i, slot)| {
        cancel.check()?;
        let data = decompress_chunk(i, &chunks[i], selector, raw)?;
        slot.copy_from_slice(&data);
        Ok::<(), Error>(())
    })?;

    tracing::debug!(chunks = chunks.len(), bytes = total, "decompressed package");
    Ok(output)
}

/// Whether `data` begins with a whole-file chunk stream rather than a summary
pub fn is_fully_compressed(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    let swapped = match LittleEndian::read_u32(data) {
        PACKAGE_FILE_TAG => false,
        PACKAGE_FILE_TAG_SWAPPED => true,
        _ => return false,
    };
    let second = if swapped {
        BigEndian::read_u32(&data[4..])
    } else {
        LittleEndian::read_u32(&data[4..])
    };
    matches!(second, PACKAGE_FILE_TAG | 0x20000 | 0x10000)
}

/// Expand a fully compressed file. Console (byte-swapped) streams default to
/// LZX when no codec is forced.
pub fn expand_fully_compressed(data: &[u8], forced: Option<Codec>) -> Result<Vec<u8>> {
    let header = ChunkHeader::parse(data, 0)?;
    let flagged = header.swapped.then_some(Codec::Lzx);
    let selector = CodecSelector::new(forced, flagged);
    let codec = selector.select(data.get(header.encoded_len()..).unwrap_or(&[]));
    tracing::debug!(
        codec = codec.name(),
        blocks = header.blocks.len(),
        size = header.uncompressed_size,
        "expanding fully compressed package"
    );

    let output = decompress_blocks(0, &header, data, codec, true)?;
    if output.len() != header.uncompressed_size as usize {
        return Err(Error::CorruptChunk {
            index: 0,
            expected: header.uncompressed_size as usize,
            actual: output.len(),
        });
    }
    Ok(output)
}

/// Result of [`compress_chunked`]
#[derive(Debug, Clone)]
pub struct CompressedImage {
    pub chunks: Vec<CompressionChunk>,
    /// Compressed bytes, addressed by the chunks' compressed offsets
    pub payload: Vec<u8>,
}

/// Split `data` into chunks of `chunk_size` and compress each with `codec`.
///
/// Compressed offsets start at `base_offset`, which lets callers place the
/// payload after an uncompressed header.
pub fn compress_chunked(
    data: &[u8],
    codec: Codec,
    chunk_size: usize,
    block_size: u32,
    base_offset: u64,
) -> Result<CompressedImage> {
    let backend = codec.backend();
    let mut chunks = Vec::new();
    let mut payload = Vec::new();
    for (i, piece) in data.chunks(chunk_size.max(1)).enumerate() {
        let encoded = encode_chunk(piece, backend.as_ref(), block_size)?;
        chunks.push(CompressionChunk {
            uncompressed_offset: base_offset + (i * chunk_size) as u64,
            uncompressed_size: piece.len() as u64,
            compressed_offset: base_offset + payload.len() as u64,
            compressed_size: encoded.len() as u64,
        });
        payload.extend_from_slice(&encoded);
    }
    Ok(CompressedImage { chunks, payload })
}
