//! Positioned, bounded, endian-aware byte reader
//!
//! An [`Archive`] reads from any [`Source`]: a file on disk, an owned memory
//! buffer, or a chunked view over a partially compressed package. Reads never
//! cross the stopper (an exclusive upper bound set for the current object
//! window) and multi-byte values honour the byte-order flag.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::quirks::EngineGeneration;
use crate::{Error, Result};

/// Random-access byte backend behind an [`Archive`]
pub trait Source: Send {
    /// Total number of addressable bytes
    fn len(&self) -> u64;

    /// Fill `buf` completely from `pos`
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Streams bytes from an open file
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl Source for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(buf)?;
        Ok(())
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource").field("len", &self.len).finish()
    }
}

/// Wraps a buffer that is already fully in memory
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }
}

impl Source for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(pos).map_err(|_| Error::eof("position overflow"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::eof(format!("read of {} bytes at {pos:#x}", buf.len())))?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

/// How FName references are stored in this package
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameEncoding {
    /// Variable-length compact index (UE1/UE2)
    #[default]
    CompactIndex,
    /// Plain i32 index
    Index32,
    /// i32 index followed by an i32 instance number
    IndexNumber,
}

/// Version context of the package an archive belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub generation: EngineGeneration,
    pub file_version: u16,
    pub licensee_version: u16,
    pub game: Option<String>,
    pub name_encoding: NameEncoding,
}

impl VersionInfo {
    pub fn is_ue3(&self) -> bool {
        self.generation == EngineGeneration::Ue3
    }
}

/// 128-bit package or object GUID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid(pub [u32; 4]);

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08X}-{:08X}-{:08X}-{:08X}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

macro_rules! read_primitive {
    ($(#[$meta:meta])* $name:ident, $ty:ty, $width:expr, $conv:ident) => {
        $(#[$meta])*
        #[inline]
        pub fn $name(&mut self) -> Result<$ty> {
            let mut bytes = [0u8; $width];
            self.read(&mut bytes)?;
            Ok(if self.swap {
                BigEndian::$conv(&bytes)
            } else {
                LittleEndian::$conv(&bytes)
            })
        }
    };
}

/// Cursor over a [`Source`] with a stopper and byte-order flag
pub struct Archive {
    source: Box<dyn Source>,
    size: u64,
    pos: u64,
    stopper: Option<u64>,
    swap: bool,
    pub ver: VersionInfo,
}

impl Archive {
    pub fn new(source: Box<dyn Source>) -> Self {
        let size = source.len();
        Self {
            source,
            size,
            pos: 0,
            stopper: None,
            swap: false,
            ver: VersionInfo::default(),
        }
    }

    /// File-backed archive
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Box::new(FileSource::open(path)?)))
    }

    /// Memory-backed archive
    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> Self {
        Self::new(Box::new(MemorySource::new(data)))
    }

    /// Swap the backend in place, keeping position, byte order and version
    pub fn replace_source(&mut self, source: Box<dyn Source>) {
        self.size = source.len();
        self.source = source;
        self.stopper = None;
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.size {
            return Err(Error::OutOfBounds {
                pos,
                size: self.size,
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn stopper(&self) -> Option<u64> {
        self.stopper
    }

    pub fn set_stopper(&mut self, stopper: Option<u64>) {
        self.stopper = stopper;
    }

    /// Exclusive end of the current read window
    #[inline]
    pub fn limit(&self) -> u64 {
        self.stopper.map_or(self.size, |s| s.min(self.size))
    }

    pub fn remaining(&self) -> u64 {
        self.limit().saturating_sub(self.pos)
    }

    pub fn at_stopper(&self) -> bool {
        self.pos >= self.limit()
    }

    pub fn byte_swap(&self) -> bool {
        self.swap
    }

    pub fn set_byte_swap(&mut self, swap: bool) {
        self.swap = swap;
    }

    /// Fill `buf` from the cursor, failing on short reads or stopper crossings
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let end = self.pos + buf.len() as u64;
        if end > self.limit() {
            return Err(match self.stopper {
                Some(stopper) if stopper < self.size => Error::eof(format!(
                    "read of {} bytes at {:#x} crosses stopper {stopper:#x}",
                    buf.len(),
                    self.pos
                )),
                _ => Error::eof(format!(
                    "read of {} bytes at {:#x} past end {:#x}",
                    buf.len(),
                    self.pos,
                    self.size
                )),
            });
        }
        self.source.read_at(self.pos, buf)?;
        self.pos = end;
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if len as u64 > self.remaining() {
            return Err(Error::eof(format!(
                "{len} bytes requested at {:#x}, {} available",
                self.pos,
                self.remaining()
            )));
        }
        let mut buf = vec![0u8; len];
        self.read(&mut buf)?;
        Ok(buf)
    }

    pub fn skip(&mut self, len: u64) -> Result<()> {
        let target = self.pos + len;
        if target > self.limit() {
            return Err(Error::eof(format!("skip of {len} bytes at {:#x}", self.pos)));
        }
        self.pos = target;
        Ok(())
    }

    /// Run `f` inside `[offset, offset+size)`, restoring cursor and stopper afterwards
    pub fn with_window<T>(
        &mut self,
        offset: u64,
        size: u64,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let end = offset + size;
        if end > self.size {
            return Err(Error::OutOfBounds {
                pos: end,
                size: self.size,
            });
        }
        let saved = (self.pos, self.stopper);
        self.pos = offset;
        self.stopper = Some(end);
        let result = f(self);
        self.pos = saved.0;
        self.stopper = saved.1;
        result
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(&mut b)?;
        Ok(b[0])
    }

    #[inline]
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    read_primitive!(read_u16, u16, 2, read_u16);
    read_primitive!(read_i16, i16, 2, read_i16);
    read_primitive!(read_u32, u32, 4, read_u32);
    read_primitive!(read_i32, i32, 4, read_i32);
    read_primitive!(read_u64, u64, 8, read_u64);
    read_primitive!(read_i64, i64, 8, read_i64);
    read_primitive!(read_f32, f32, 4, read_f32);

    /// Variable-length signed integer used by UE1/UE2 for indices and sizes
    pub fn read_compact_index(&mut self) -> Result<i32> {
        let b0 = self.read_u8()?;
        let negative = b0 & 0x80 != 0;
        let mut value = (b0 & 0x3F) as u32;
        if b0 & 0x40 != 0 {
            let mut shift = 6;
            for _ in 0..4 {
                let b = self.read_u8()?;
                value |= ((b & 0x7F) as u32) << shift;
                shift += 7;
                if b & 0x80 == 0 {
                    break;
                }
            }
        }
        let value = value as i32;
        Ok(if negative { value.wrapping_neg() } else { value })
    }

    /// Length-prefixed string; negative lengths are UTF-16
    pub fn read_fstring(&mut self) -> Result<String> {
        let len = self.read_i32()? as i64;
        if len == 0 {
            return Ok(String::new());
        }
        let units = len.unsigned_abs();
        let byte_len = if len < 0 { units * 2 } else { units };
        if byte_len > self.remaining() {
            return Err(Error::eof(format!(
                "string of {len} units at {:#x} exceeds window",
                self.pos
            )));
        }

        if len > 0 {
            let mut bytes = self.read_bytes(units as usize)?;
            if bytes.last() == Some(&0) {
                bytes.pop();
            }
            Ok(bytes.into_iter().map(char::from).collect())
        } else {
            let mut chars = Vec::with_capacity(units as usize);
            for _ in 0..units {
                chars.push(self.read_u16()?);
            }
            if chars.last() == Some(&0) {
                chars.pop();
            }
            Ok(String::from_utf16_lossy(&chars))
        }
    }

    /// Compact-index length string used by UE1/UE2; negative lengths are UTF-16
    pub fn read_compact_string(&mut self) -> Result<String> {
        let len = self.read_compact_index()?;
        let units = len.unsigned_abs() as usize;
        let byte_len = if len < 0 { units * 2 } else { units };
        if byte_len as u64 > self.remaining() {
            return Err(Error::eof(format!(
                "string of {len} units at {:#x} exceeds window",
                self.pos
            )));
        }
        if len >= 0 {
            let bytes = self.read_bytes(units)?;
            Ok(bytes
                .into_iter()
                .take_while(|&b| b != 0)
                .map(char::from)
                .collect())
        } else {
            let mut chars = Vec::with_capacity(units);
            for _ in 0..units {
                chars.push(self.read_u16()?);
            }
            let end = chars.iter().position(|&c| c == 0).unwrap_or(chars.len());
            Ok(String::from_utf16_lossy(&chars[..end]))
        }
    }

    /// Null-terminated Latin-1 string (names before file version 64)
    pub fn read_cstring(&mut self) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.read_u8()? {
                0 => return Ok(out),
                b => out.push(char::from(b)),
            }
        }
    }

    pub fn read_guid(&mut self) -> Result<Guid> {
        Ok(Guid([
            self.read_u32()?,
            self.read_u32()?,
            self.read_u32()?,
            self.read_u32()?,
        ]))
    }

    /// i32 count followed by `count` elements
    pub fn read_array<T>(&mut self, mut element: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count = self.read_i32()?;
        if count < 0 || count as u64 > self.remaining() {
            return Err(Error::eof(format!(
                "array count {count} at {:#x} exceeds window",
                self.pos
            )));
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(element(self)?);
        }
        Ok(items)
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("size", &self.size)
            .field("pos", &self.pos)
            .field("stopper", &self.stopper)
            .field("swap", &self.swap)
            .field("ver", &self.ver)
            .finish()
    }
}
