use std::sync::Arc;

use super::{decompress_chunk, CodecSelector, CompressionChunk};
use crate::archive::Source;
use crate::{Error, Result};

/// Uncompressed view over a partially compressed package.
///
/// Positions before the first chunk map straight onto the file; anything else
/// is served from the owning chunk, which is expanded on first touch. The most
/// recently expanded chunk stays cached. Errors name chunks by their position
/// in the summary's chunk table.
pub struct ChunkedSource {
    raw: Box<dyn Source>,
    /// Sorted by uncompressed offset
    chunks: Vec<CompressionChunk>,
    table_index: Vec<usize>,
    selector: Arc<CodecSelector>,
    len: u64,
    cache: Option<(usize, Vec<u8>)>,
}

impl ChunkedSource {
    pub fn new(
        raw: Box<dyn Source>,
        chunks: Vec<CompressionChunk>,
        selector: Arc<CodecSelector>,
    ) -> Result<Self> {
        if chunks.is_empty() {
            return Err(Error::InvalidSummary("empty chunk table".into()));
        }
        let mut indexed: Vec<(usize, CompressionChunk)> = chunks.into_iter().enumerate().collect();
        indexed.sort_by_key(|(_, c)| c.uncompressed_offset);
        let (table_index, chunks): (Vec<usize>, Vec<CompressionChunk>) = indexed.into_iter().unzip();
        let len = chunks.iter().map(|c| c.uncompressed_end()).max().unwrap_or(0);
        Ok(Self {
            raw,
            chunks,
            table_index,
            selector,
            len,
            cache: None,
        })
    }

    fn chunk_index(&self, pos: u64) -> Option<usize> {
        let idx = self
            .chunks
            .partition_point(|c| c.uncompressed_offset <= pos)
            .checked_sub(1)?;
        self.chunks[idx].contains(pos).then_some(idx)
    }

    fn load(&mut self, index: usize) -> Result<&[u8]> {
        if self.cache.as_ref().map(|(i, _)| *i) != Some(index) {
            let chunk = self.chunks[index];
            let mut payload = vec![0u8; chunk.compressed_size as usize];
            self.raw.read_at(chunk.compressed_offset, &mut payload)?;
            let local = CompressionChunk {
                compressed_offset: 0,
                ..chunk
            };
            let table_index = self.table_index[index];
            let data = decompress_chunk(table_index, &local, &self.selector, &payload)?;
            tracing::trace!(chunk = table_index, bytes = data.len(), "expanded chunk");
            self.cache = Some((index, data));
        }
        match &self.cache {
            Some((_, data)) => Ok(data),
            None => Err(Error::eof("chunk cache empty")),
        }
    }
}

impl Source for ChunkedSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let header_end = self.chunks[0].uncompressed_offset;
        let mut done = 0usize;
        while done < buf.len() {
            let at = pos + done as u64;
            let want = buf.len() - done;

            if at < header_end {
                let n = want.min((header_end - at) as usize);
                self.raw.read_at(at, &mut buf[done..done + n])?;
                done += n;
                continue;
            }

            let index = self
                .chunk_index(at)
                .ok_or_else(|| Error::eof(format!("position {at:#x} is not covered by any chunk")))?;
            let start = self.chunks[index].uncompressed_offset;
            let data = self.load(index)?;
            let offset = (at - start) as usize;
            let n = want.min(data.len() - offset);
            buf[done..done + n].copy_from_slice(&data[offset..offset + n]);
            done += n;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChunkedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedSource")
            .field("chunks", &self.chunks.len())
            .field("len", &self.len)
            .field("cached", &self.cache.as_ref().map(|(i, _)| *i))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archive, MemorySource};
    use crate::compression::{compress_chunked, Codec};

    fn build(data: &[u8], header: &[u8]) -> (Vec<u8>, Vec<CompressionChunk>) {
        let base = header.len() as u64;
        let image = compress_chunked(data, Codec::Zlib, 1000, 512, base).unwrap();
        let mut raw = header.to_vec();
        raw.extend_from_slice(&image.payload);
        (raw, image.chunks)
    }

    #[test]
    fn test_reads_span_header_and_chunks() {
        let header = b"HEADERBYTES!".to_vec();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let (raw, chunks) = build(&data, &header);

        let source = ChunkedSource::new(
            Box::new(MemorySource::new(raw)),
            chunks,
            Arc::new(CodecSelector::default()),
        )
        .unwrap();
        let mut ar = Archive::new(Box::new(source));
        assert_eq!(ar.len(), (header.len() + data.len()) as u64);

        // header region is identity mapped
        assert_eq!(ar.read_bytes(6).unwrap(), b"HEADER");

        // read straddling the header/chunk boundary and a chunk boundary
        ar.seek(8).unwrap();
        let straddle = ar.read_bytes(1500).unwrap();
        let mut expected = header[8..].to_vec();
        expected.extend_from_slice(&data[..1500 - 4]);
        assert_eq!(straddle, expected);

        // backwards seek into an earlier chunk
        ar.seek(header.len() as u64 + 4990).unwrap();
        assert_eq!(ar.read_bytes(10).unwrap(), &data[4990..]);
        ar.seek(header.len() as u64 + 2).unwrap();
        assert_eq!(ar.read_u8().unwrap(), data[2]);
    }

    #[test]
    fn test_empty_table_rejected() {
        let result = ChunkedSource::new(
            Box::new(MemorySource::new(vec![0u8; 4])),
            Vec::new(),
            Arc::new(CodecSelector::default()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_corrupt_chunk_surfaces_on_access() {
        let data = vec![3u8; 2000];
        let (raw, mut chunks) = build(&data, b"HDR");
        chunks[1].uncompressed_size += 1;
        let mut source = ChunkedSource::new(
            Box::new(MemorySource::new(raw)),
            chunks,
            Arc::new(CodecSelector::default()),
        )
        .unwrap();
        let mut buf = [0u8; 4];
        source.read_at(3, &mut buf).unwrap();
        let err = source.read_at(1003, &mut buf).unwrap_err();
        assert!(matches!(err, Error::CorruptChunk { index: 1, .. }));
    }

    #[test]
    fn test_errors_name_the_table_entry() {
        let data = vec![7u8; 3000];
        let (raw, mut chunks) = build(&data, b"HDR");
        chunks.reverse();
        // last chunk in the file, first entry in the table
        chunks[0].uncompressed_size += 1;
        let mut source = ChunkedSource::new(
            Box::new(MemorySource::new(raw)),
            chunks,
            Arc::new(CodecSelector::default()),
        )
        .unwrap();
        let mut buf = [0u8; 4];
        source.read_at(3 + 1000, &mut buf).unwrap();
        assert_eq!(buf, [7; 4]);
        let err = source.read_at(3 + 2500, &mut buf).unwrap_err();
        assert!(matches!(err, Error::CorruptChunk { index: 0, .. }));
    }
}
