//! Synthetic package builder for unit tests

use crate::compression::{compress_chunked, encode_chunk, Codec, CompressionChunk, DEFAULT_BLOCK_SIZE};
use crate::quirks::{EngineGeneration, InsertPoint, PKG_COMPRESSED};
use crate::PACKAGE_FILE_TAG;

pub(crate) fn compact_index(value: i32) -> Vec<u8> {
    let mut rest = value.unsigned_abs();
    let mut first = (rest & 0x3F) as u8;
    if value < 0 {
        first |= 0x80;
    }
    rest >>= 6;
    if rest > 0 {
        first |= 0x40;
    }
    let mut out = vec![first];
    while rest > 0 {
        let mut b = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest > 0 {
            b |= 0x80;
        }
        out.push(b);
    }
    out
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Writer {
    pub buf: Vec<u8>,
    pub big_endian: bool,
}

impl Writer {
    pub fn new(big_endian: bool) -> Self {
        Self {
            buf: Vec::new(),
            big_endian,
        }
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        let b = if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
        self.bytes(&b)
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.u32(v as u32)
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        let b = if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
        self.bytes(&b)
    }

    pub fn f32(&mut self, v: f32) -> &mut Self {
        self.u32(v.to_bits())
    }

    pub fn compact(&mut self, v: i32) -> &mut Self {
        self.bytes(&compact_index(v))
    }

    /// Positive-length Latin-1 FString with terminator
    pub fn fstring(&mut self, s: &str) -> &mut Self {
        self.i32(s.len() as i32 + 1);
        self.bytes(s.as_bytes());
        self.u8(0)
    }

    pub fn guid(&mut self, parts: [u32; 4]) -> &mut Self {
        for p in parts {
            self.u32(p);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TestImport {
    pub class_package: String,
    pub class_name: String,
    pub outer: i32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub(crate) struct TestExport {
    pub class: i32,
    pub super_ref: i32,
    pub outer: i32,
    pub name: String,
    pub flags: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
struct TableOffsets {
    names: usize,
    imports: usize,
    exports: usize,
}

/// Builds a complete package image: summary, object bodies, then the tables
#[derive(Debug, Clone)]
pub(crate) struct PackageBuilder {
    pub file_version: u16,
    pub licensee_version: u16,
    pub package_flags: u32,
    pub big_endian: bool,
    pub names: Vec<String>,
    pub imports: Vec<TestImport>,
    pub exports: Vec<TestExport>,
    /// Raw bytes inserted at quirk insertion points
    pub extras: Vec<(InsertPoint, Vec<u8>)>,
}

impl PackageBuilder {
    pub fn with_version(file_version: u16, licensee_version: u16) -> Self {
        Self {
            file_version,
            licensee_version,
            package_flags: 0x1,
            big_endian: false,
            names: vec!["None".to_string()],
            imports: Vec::new(),
            exports: Vec::new(),
            extras: Vec::new(),
        }
    }

    /// UE2-era layout with GUID and generations
    pub fn ue2() -> Self {
        Self::with_version(128, 29)
    }

    /// UE3 layout with wide flags, archetypes and FName numbers
    pub fn ue3() -> Self {
        Self::with_version(491, 0)
    }

    fn is_ue3(&self) -> bool {
        EngineGeneration::from_version(self.file_version) == EngineGeneration::Ue3
    }

    pub fn name(&mut self, name: &str) -> i32 {
        if let Some(i) = self.names.iter().position(|n| n == name) {
            return i as i32;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as i32
    }

    /// Add an import, returning its reference value
    pub fn import(&mut self, class_package: &str, class_name: &str, outer: i32, name: &str) -> i32 {
        for n in [class_package, class_name, name] {
            self.name(n);
        }
        self.imports.push(TestImport {
            class_package: class_package.into(),
            class_name: class_name.into(),
            outer,
            name: name.into(),
        });
        -(self.imports.len() as i32)
    }

    /// Add an export, returning its reference value
    pub fn export(&mut self, class: i32, outer: i32, name: &str, body: Vec<u8>) -> i32 {
        self.name(name);
        self.exports.push(TestExport {
            class,
            super_ref: 0,
            outer,
            name: name.into(),
            flags: 0x0007_0004,
            body,
        });
        self.exports.len() as i32
    }

    /// Convenience: import `Core.Class.<class_name>` and return its reference
    pub fn class(&mut self, class_name: &str) -> i32 {
        if let Some(i) = self
            .imports
            .iter()
            .position(|imp| imp.class_name == "Class" && imp.name == class_name)
        {
            return -(i as i32 + 1);
        }
        let core = match self
            .imports
            .iter()
            .position(|imp| imp.class_name == "Package" && imp.name == "Core")
        {
            Some(i) => -(i as i32 + 1),
            None => self.import("Core", "Package", 0, "Core"),
        };
        self.import("Core", "Class", core, class_name)
    }

    fn writer(&self) -> Writer {
        Writer::new(self.big_endian)
    }

    fn extras(&self, w: &mut Writer, at: InsertPoint) {
        for (point, bytes) in &self.extras {
            if *point == at {
                w.bytes(bytes);
            }
        }
    }

    fn fname(&self, w: &mut Writer, name: &str) {
        let index = self
            .names
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("name {name} not registered")) as i32;
        if self.is_ue3() {
            w.i32(index);
            if self.file_version >= 343 {
                w.i32(0);
            }
        } else {
            w.compact(index);
        }
    }

    fn summary(
        &self,
        offsets: TableOffsets,
        flags: u32,
        compression_flags: u32,
        chunks: &[CompressionChunk],
    ) -> Vec<u8> {
        let ue3 = self.is_ue3();
        let fv = self.file_version;
        let mut w = self.writer();
        w.u32(PACKAGE_FILE_TAG);
        w.u32(fv as u32 | ((self.licensee_version as u32) << 16));
        self.extras(&mut w, InsertPoint::Start);
        if ue3 && fv >= 249 {
            w.i32(0);
        }
        if ue3 && fv >= 269 {
            w.fstring("None");
        }
        self.extras(&mut w, InsertPoint::BeforeFlags);
        w.u32(flags);
        self.extras(&mut w, InsertPoint::AfterFlags);
        w.i32(self.names.len() as i32).i32(offsets.names as i32);
        w.i32(self.exports.len() as i32).i32(offsets.exports as i32);
        self.extras(&mut w, InsertPoint::AfterExports);
        w.i32(self.imports.len() as i32).i32(offsets.imports as i32);
        self.extras(&mut w, InsertPoint::AfterTables);
        if ue3 && fv >= 415 {
            w.i32(0);
        }
        if ue3 && fv >= 623 {
            w.i32(0).i32(0).i32(0);
        }
        if ue3 && fv >= 584 {
            w.i32(0);
        }
        if fv < 68 {
            w.i32(0).i32(0);
        } else {
            w.guid([0x1111, 0x2222, 0x3333, 0x4444]);
            w.i32(1);
            w.i32(self.exports.len() as i32).i32(self.names.len() as i32);
            if ue3 && fv >= 322 {
                w.i32(0);
            }
        }
        if ue3 && fv >= 245 {
            w.i32(3000);
        }
        if ue3 && fv >= 277 {
            w.i32(40);
        }
        self.extras(&mut w, InsertPoint::BeforeCompression);
        if ue3 && fv >= 334 {
            w.u32(compression_flags);
            w.i32(chunks.len() as i32);
            for chunk in chunks {
                w.i32(chunk.uncompressed_offset as i32);
                w.i32(chunk.uncompressed_size as i32);
                w.i32(chunk.compressed_offset as i32);
                w.i32(chunk.compressed_size as i32);
            }
        }
        if ue3 && fv >= 482 {
            w.i32(0);
        }
        self.extras(&mut w, InsertPoint::End);
        w.buf
    }

    /// Everything after the summary, given where it starts
    fn body_and_tables(&self, start: usize) -> (Vec<u8>, TableOffsets) {
        let ue3 = self.is_ue3();
        let fv = self.file_version;
        let mut w = self.writer();

        let mut body_offsets = Vec::with_capacity(self.exports.len());
        for export in &self.exports {
            body_offsets.push(start + w.len());
            w.bytes(&export.body);
        }

        let names = start + w.len();
        for name in &self.names {
            if ue3 {
                w.fstring(name);
                if fv >= 195 {
                    w.u64(0x0007_0010);
                } else {
                    w.u32(0x0007_0010);
                }
            } else if fv < 64 {
                w.bytes(name.as_bytes()).u8(0).u32(0x0007_0010);
            } else {
                w.compact(name.len() as i32 + 1);
                w.bytes(name.as_bytes()).u8(0).u32(0x0007_0010);
            }
        }

        let imports = start + w.len();
        for import in &self.imports {
            self.fname(&mut w, &import.class_package);
            self.fname(&mut w, &import.class_name);
            w.i32(import.outer);
            self.fname(&mut w, &import.name);
        }

        let exports = start + w.len();
        for (export, &offset) in self.exports.iter().zip(&body_offsets) {
            let size = export.body.len() as i32;
            if ue3 {
                w.i32(export.class).i32(export.super_ref).i32(export.outer);
                self.fname(&mut w, &export.name);
                if fv >= 220 {
                    w.i32(0);
                }
                w.u32(export.flags);
                if fv >= 195 {
                    w.u32(0);
                }
                w.i32(size);
                if size != 0 || fv >= 249 {
                    w.i32(offset as i32);
                }
                if fv < 543 {
                    w.i32(0);
                }
                if fv >= 247 {
                    w.u32(0);
                }
                if fv >= 322 {
                    w.i32(0);
                    w.guid([0; 4]);
                }
                if fv >= 475 {
                    w.u32(0);
                }
            } else {
                w.compact(export.class).compact(export.super_ref).i32(export.outer);
                self.fname(&mut w, &export.name);
                w.u32(export.flags);
                w.compact(size);
                if size != 0 {
                    w.compact(offset as i32);
                }
            }
        }

        (
            w.buf,
            TableOffsets {
                names,
                imports,
                exports,
            },
        )
    }

    /// Uncompressed package image
    pub fn build(&self) -> Vec<u8> {
        let header_len = self.summary(TableOffsets::default(), self.package_flags, 0, &[]).len();
        let (rest, offsets) = self.body_and_tables(header_len);
        let mut out = self.summary(offsets, self.package_flags, 0, &[]);
        out.extend_from_slice(&rest);
        out
    }

    /// Partially compressed image: raw summary followed by compressed chunks
    pub fn build_chunked(&self, codec: Codec, chunk_size: usize) -> Vec<u8> {
        assert!(self.is_ue3() && self.file_version >= 334);
        let draft_len = self.summary(TableOffsets::default(), 0, 0, &[]).len();
        let (draft_rest, _) = self.body_and_tables(draft_len);
        let count = draft_rest.len().div_ceil(chunk_size);
        let placeholder = vec![CompressionChunk::default(); count];

        let header_len = self
            .summary(TableOffsets::default(), 0, 0, &placeholder)
            .len();
        let (rest, offsets) = self.body_and_tables(header_len);
        let image =
            compress_chunked(&rest, codec, chunk_size, 0x4000, header_len as u64).expect("compress");
        let flags = self.package_flags | PKG_COMPRESSED;
        let mut out = self.summary(offsets, flags, codec.flag(), &image.chunks);
        assert_eq!(out.len(), header_len);
        out.extend_from_slice(&image.payload);
        out
    }

    /// Whole-file compressed image
    pub fn build_fully_compressed(&self, codec: Codec) -> Vec<u8> {
        let image = self.build();
        encode_chunk(&image, codec.backend().as_ref(), DEFAULT_BLOCK_SIZE).expect("compress")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_import_is_shared() {
        let mut b = PackageBuilder::ue2();
        let a = b.class("Texture");
        let c = b.class("Texture");
        let s = b.class("Sound");
        assert_eq!(a, c);
        assert_ne!(a, s);
        // Core package + two classes
        assert_eq!(b.imports.len(), 3);
    }
}
