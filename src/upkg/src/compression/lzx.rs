//! LZX stream decoder
//!
//! Console packages store every compressed block as one LZX stream with no
//! per-frame size prefixes. Output is produced in 32 KiB frames and the
//! bitstream is realigned to a 16-bit word after each one. An uncompressed
//! block of odd length is followed directly by the next block header, with
//! no padding byte.

use crate::{Error, Result};

/// Output produced between bitstream realignments
const FRAME_SIZE: usize = 0x8000;

const NUM_CHARS: usize = 256;
const MIN_MATCH: usize = 2;
const NUM_PRIMARY_LENGTHS: usize = 7;
const LENGTH_SYMBOLS: usize = 249;
const PRETREE_SYMBOLS: usize = 20;
const ALIGNED_SYMBOLS: usize = 8;
const MAX_CODE_LEN: u32 = 16;

/// Frames past this index are never E8-translated
const E8_MAX_FRAME: usize = 32768;

const EXTRA_BITS: [u8; 51] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13, 14, 14, 15, 15, 16, 16, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17,
];

const POSITION_BASE: [u32; 51] = [
    0, 1, 2, 3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536,
    2048, 3072, 4096, 6144, 8192, 12288, 16384, 24576, 32768, 49152, 65536, 98304, 131072, 196608,
    262144, 393216, 524288, 655360, 786432, 917504, 1048576, 1179648, 1310720, 1441792, 1572864,
    1703936, 1835008, 1966080, 2097152,
];

fn corrupt(message: impl Into<String>) -> Error {
    Error::Codec {
        codec: "lzx",
        message: message.into(),
    }
}

/// Decode one stream of `expected` bytes using a `2^window_bits` window
pub fn decompress(input: &[u8], expected: usize, window_bits: u32) -> Result<Vec<u8>> {
    if !(15..=21).contains(&window_bits) {
        return Err(corrupt(format!("unsupported window of 2^{window_bits} bytes")));
    }
    if expected == 0 {
        return Ok(Vec::new());
    }
    Decoder::new(input, window_bits).run(expected)
}

/// MSB-first reader over little-endian 16-bit words
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    buffer: u32,
    bits_left: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            buffer: 0,
            bits_left: 0,
        }
    }

    /// Two zero bytes past the end are allowed so lookahead can fill a word
    fn next_byte(&mut self) -> Result<u8> {
        if self.pos >= self.data.len() + 2 {
            return Err(corrupt("unexpected end of stream"));
        }
        let byte = self.data.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        Ok(byte)
    }

    /// Buffer at least `count` (at most 17) bits
    fn ensure(&mut self, count: u32) -> Result<()> {
        while self.bits_left < count {
            let lo = self.next_byte()?;
            let hi = self.next_byte()?;
            let word = u32::from(u16::from_le_bytes([lo, hi]));
            self.buffer |= word << (16 - self.bits_left);
            self.bits_left += 16;
        }
        Ok(())
    }

    fn peek(&self, count: u32) -> u32 {
        self.buffer >> (32 - count)
    }

    fn remove(&mut self, count: u32) {
        self.buffer <<= count;
        self.bits_left -= count;
    }

    fn read_bits(&mut self, count: u32) -> Result<u32> {
        if count == 0 {
            return Ok(0);
        }
        self.ensure(count)?;
        let value = self.peek(count);
        self.remove(count);
        Ok(value)
    }

    /// Drop the unread rest of the current word at a frame boundary
    fn align_frame(&mut self) {
        let partial = self.bits_left & 15;
        self.remove(partial);
    }

    /// Skip the 1-16 padding bits between an uncompressed block header and
    /// its raw bytes
    fn align_raw(&mut self) -> Result<()> {
        self.ensure(16)?;
        if self.bits_left > 16 {
            self.pos -= 2;
        }
        self.bits_left = 0;
        self.buffer = 0;
        Ok(())
    }

    fn read_raw(&mut self, out: &mut [u8]) -> Result<()> {
        let end = self.pos + out.len();
        let src = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| corrupt("unexpected end of stream"))?;
        out.copy_from_slice(src);
        self.pos = end;
        Ok(())
    }
}

/// Canonical Huffman code, decoded against left-justified code limits
struct Huffman {
    first: [u32; 17],
    limit: [u32; 17],
    base: [usize; 17],
    symbols: Vec<u16>,
}

impl Huffman {
    /// `None` when every length is zero. Codes must be complete.
    fn build(lengths: &[u8]) -> Result<Option<Self>> {
        let mut counts = [0u32; 17];
        for &len in lengths {
            if u32::from(len) > MAX_CODE_LEN {
                return Err(corrupt(format!("code length {len}")));
            }
            counts[len as usize] += 1;
        }
        if counts[1..].iter().all(|&c| c == 0) {
            return Ok(None);
        }

        let mut first = [0u32; 17];
        let mut limit = [0u32; 17];
        let mut base = [0usize; 17];
        let mut next = 0u32;
        let mut index = 0usize;
        for len in 1..=16usize {
            let count = counts[len];
            if next + count > 1u32 << len {
                return Err(corrupt("over-subscribed Huffman code"));
            }
            first[len] = next;
            base[len] = index;
            limit[len] = (next + count) << (16 - len);
            index += count as usize;
            next = (next + count) << 1;
        }
        if limit[16] != 1 << 16 {
            return Err(corrupt("incomplete Huffman code"));
        }

        let mut symbols = Vec::with_capacity(index);
        for len in 1..=16u8 {
            symbols.extend(
                lengths
                    .iter()
                    .enumerate()
                    .filter(|&(_, &l)| l == len)
                    .map(|(s, _)| s as u16),
            );
        }
        Ok(Some(Self {
            first,
            limit,
            base,
            symbols,
        }))
    }

    fn decode(&self, bits: &mut BitReader) -> Result<usize> {
        bits.ensure(MAX_CODE_LEN)?;
        let value = bits.peek(MAX_CODE_LEN);
        for len in 1..=16usize {
            if value < self.limit[len] {
                bits.remove(len as u32);
                let offset = ((value >> (16 - len)) - self.first[len]) as usize;
                return Ok(self.symbols[self.base[len] + offset] as usize);
            }
        }
        Err(corrupt("invalid Huffman code"))
    }
}

/// Lengths are sent as deltas from the previous block's, modulo 17
fn apply_delta(previous: u8, delta: usize) -> u8 {
    (i32::from(previous) - delta as i32).rem_euclid(17) as u8
}

/// Read code lengths through a pretree, updating `lengths` in place
fn read_lengths(bits: &mut BitReader, lengths: &mut [u8]) -> Result<()> {
    let mut pre = [0u8; PRETREE_SYMBOLS];
    for len in pre.iter_mut() {
        *len = bits.read_bits(4)? as u8;
    }
    let pretree = Huffman::build(&pre)?.ok_or_else(|| corrupt("empty pretree"))?;

    let mut x = 0;
    while x < lengths.len() {
        let (run, value) = match pretree.decode(bits)? {
            17 => (bits.read_bits(4)? as usize + 4, 0),
            18 => (bits.read_bits(5)? as usize + 20, 0),
            19 => {
                let run = bits.read_bits(1)? as usize + 4;
                let delta = pretree.decode(bits)?;
                (run, apply_delta(lengths[x], delta))
            }
            delta => (1, apply_delta(lengths[x], delta)),
        };
        let end = x + run;
        lengths
            .get_mut(x..end)
            .ok_or_else(|| corrupt("code length run overflows its table"))?
            .fill(value);
        x = end;
    }
    Ok(())
}

/// Undo the x86 call-address transform on one output frame
fn translate_e8(frame: &mut [u8], mut position: i32, file_size: i32) {
    let end = frame.len() - 10;
    let mut i = 0;
    while i < end {
        if frame[i] != 0xE8 {
            i += 1;
            position = position.wrapping_add(1);
            continue;
        }
        let absolute = i32::from_le_bytes([frame[i + 1], frame[i + 2], frame[i + 3], frame[i + 4]]);
        if absolute >= position.wrapping_neg() && absolute < file_size {
            let relative = if absolute >= 0 {
                absolute.wrapping_sub(position)
            } else {
                absolute.wrapping_add(file_size)
            };
            frame[i + 1..i + 5].copy_from_slice(&relative.to_le_bytes());
        }
        i += 5;
        position = position.wrapping_add(5);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Verbatim,
    Aligned,
    Uncompressed,
}

struct Decoder<'a> {
    bits: BitReader<'a>,
    window: Vec<u8>,
    window_pos: usize,
    frame_pos: usize,
    /// Repeated-offset queue
    r: [u32; 3],
    main_lengths: Vec<u8>,
    length_lengths: [u8; LENGTH_SYMBOLS],
    main: Option<Huffman>,
    length: Option<Huffman>,
    aligned: Option<Huffman>,
    kind: BlockKind,
    block_remaining: usize,
    e8_started: bool,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8], window_bits: u32) -> Self {
        let position_slots = match window_bits {
            21 => 50,
            20 => 42,
            bits => bits as usize * 2,
        };
        Self {
            bits: BitReader::new(input),
            window: vec![0; 1 << window_bits],
            window_pos: 0,
            frame_pos: 0,
            r: [1, 1, 1],
            main_lengths: vec![0; NUM_CHARS + position_slots * 8],
            length_lengths: [0; LENGTH_SYMBOLS],
            main: None,
            length: None,
            aligned: None,
            kind: BlockKind::Verbatim,
            block_remaining: 0,
            e8_started: false,
        }
    }

    fn run(mut self, expected: usize) -> Result<Vec<u8>> {
        let e8_file_size = if self.bits.read_bits(1)? == 1 {
            let hi = self.bits.read_bits(16)?;
            let lo = self.bits.read_bits(16)?;
            ((hi << 16) | lo) as i32
        } else {
            0
        };
        let mut e8_position = 0i32;
        let mut output = Vec::with_capacity(expected);
        let mut frame_index = 0usize;

        while output.len() < expected {
            let frame_size = FRAME_SIZE.min(expected - output.len());
            let mut todo = frame_size;
            while todo > 0 {
                if self.block_remaining == 0 {
                    self.read_block_header()?;
                }
                let run = self.block_remaining.min(todo);
                todo -= run;
                self.block_remaining -= run;
                match self.kind {
                    BlockKind::Uncompressed => {
                        let dest = &mut self.window[self.window_pos..self.window_pos + run];
                        self.bits.read_raw(dest)?;
                        self.window_pos += run;
                    }
                    kind => self.decode_run(run, kind == BlockKind::Aligned, output.len())?,
                }
            }
            self.bits.align_frame();

            let start = output.len();
            output.extend_from_slice(&self.window[self.frame_pos..self.frame_pos + frame_size]);
            if e8_file_size != 0 {
                if self.e8_started && frame_index <= E8_MAX_FRAME && frame_size > 10 {
                    translate_e8(&mut output[start..], e8_position, e8_file_size);
                }
                e8_position = e8_position.wrapping_add(frame_size as i32);
            }

            self.frame_pos += frame_size;
            frame_index += 1;
            if self.window_pos == self.window.len() {
                self.window_pos = 0;
            }
            if self.frame_pos == self.window.len() {
                self.frame_pos = 0;
            }
        }
        Ok(output)
    }

    fn read_block_header(&mut self) -> Result<()> {
        let kind = self.bits.read_bits(3)?;
        let hi = self.bits.read_bits(16)?;
        let lo = self.bits.read_bits(8)?;
        self.block_remaining = ((hi << 8) | lo) as usize;
        self.kind = match kind {
            1 => BlockKind::Verbatim,
            2 => BlockKind::Aligned,
            3 => BlockKind::Uncompressed,
            other => return Err(corrupt(format!("invalid block type {other}"))),
        };

        if self.kind == BlockKind::Uncompressed {
            self.e8_started = true;
            self.bits.align_raw()?;
            let mut stored = [0u8; 12];
            self.bits.read_raw(&mut stored)?;
            for (r, bytes) in self.r.iter_mut().zip(stored.chunks_exact(4)) {
                *r = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            return Ok(());
        }

        if self.kind == BlockKind::Aligned {
            let mut lengths = [0u8; ALIGNED_SYMBOLS];
            for len in lengths.iter_mut() {
                *len = self.bits.read_bits(3)? as u8;
            }
            self.aligned =
                Some(Huffman::build(&lengths)?.ok_or_else(|| corrupt("empty aligned tree"))?);
        }
        let (chars, matches) = self.main_lengths.split_at_mut(NUM_CHARS);
        read_lengths(&mut self.bits, chars)?;
        read_lengths(&mut self.bits, matches)?;
        self.main =
            Some(Huffman::build(&self.main_lengths)?.ok_or_else(|| corrupt("empty main tree"))?);
        if self.main_lengths[0xE8] != 0 {
            self.e8_started = true;
        }
        read_lengths(&mut self.bits, &mut self.length_lengths)?;
        self.length = Huffman::build(&self.length_lengths)?;
        Ok(())
    }

    /// Decode exactly `run` bytes of a verbatim or aligned block; `emitted`
    /// counts the bytes of earlier frames
    fn decode_run(&mut self, run: usize, aligned: bool, emitted: usize) -> Result<()> {
        let main = self
            .main
            .as_ref()
            .ok_or_else(|| corrupt("missing main tree"))?;
        let window_size = self.window.len();
        let mask = window_size - 1;

        let mut left = run;
        while left > 0 {
            let symbol = main.decode(&mut self.bits)?;
            if symbol < NUM_CHARS {
                self.window[self.window_pos] = symbol as u8;
                self.window_pos += 1;
                left -= 1;
                continue;
            }

            let symbol = symbol - NUM_CHARS;
            let mut length = symbol & NUM_PRIMARY_LENGTHS;
            if length == NUM_PRIMARY_LENGTHS {
                let tree = self
                    .length
                    .as_ref()
                    .ok_or_else(|| corrupt("match length with an empty length tree"))?;
                length += tree.decode(&mut self.bits)?;
            }
            length += MIN_MATCH;

            let offset = match symbol >> 3 {
                0 => self.r[0],
                1 => {
                    self.r.swap(0, 1);
                    self.r[0]
                }
                2 => {
                    self.r.swap(0, 2);
                    self.r[0]
                }
                slot => {
                    let extra = u32::from(EXTRA_BITS[slot]);
                    let base = POSITION_BASE[slot] - 2;
                    let offset = if aligned {
                        let tree = self
                            .aligned
                            .as_ref()
                            .ok_or_else(|| corrupt("missing aligned tree"))?;
                        match extra {
                            0 => 1,
                            1 | 2 => base + self.bits.read_bits(extra)?,
                            3 => base + tree.decode(&mut self.bits)? as u32,
                            _ => {
                                let verbatim = self.bits.read_bits(extra - 3)? << 3;
                                base + verbatim + tree.decode(&mut self.bits)? as u32
                            }
                        }
                    } else {
                        base + self.bits.read_bits(extra)?
                    };
                    self.r = [offset, self.r[0], self.r[1]];
                    offset
                }
            };

            let offset = offset as usize;
            if length > left {
                return Err(corrupt("match crosses a frame or block boundary"));
            }
            if self.window_pos + length > window_size {
                return Err(corrupt("match runs past the end of the window"));
            }
            let decoded = emitted + (self.window_pos - self.frame_pos);
            if offset == 0 || offset > decoded || offset > window_size {
                return Err(corrupt(format!(
                    "match offset {offset} reaches before the stream start"
                )));
            }
            for i in self.window_pos..self.window_pos + length {
                self.window[i] = self.window[(i + window_size - offset) & mask];
            }
            self.window_pos += length;
            left -= length;
        }
        Ok(())
    }
}
