//! An opened package: summary, tables, storage and the per-export object cache

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::archive::{Archive, FileSource, MemorySource, Source};
use crate::compression::{self, ChunkedSource, CodecSelector, CompressionChunk};
use crate::config::{CancelToken, LoaderConfig};
use crate::object::Object;
use crate::quirks::{QuirkTable, PKG_COMPRESSED};
use crate::reference::ObjectRef;
use crate::summary::{self, PackageSummary};
use crate::tables::{self, NameTable, ObjectExport, ObjectImport, Tables};
use crate::{Error, Result};

const MAX_OUTER_DEPTH: usize = 256;

/// Where the raw package bytes live
#[derive(Debug, Clone)]
pub enum RawStorage {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl RawStorage {
    pub fn source(&self) -> Result<Box<dyn Source>> {
        Ok(match self {
            RawStorage::File(path) => Box::new(FileSource::open(path)?),
            RawStorage::Memory(data) => Box::new(MemorySource::new(data.clone())),
        })
    }

    pub fn read_all(&self) -> Result<Arc<[u8]>> {
        match self {
            RawStorage::File(path) => Ok(std::fs::read(path)?.into()),
            RawStorage::Memory(data) => Ok(data.clone()),
        }
    }
}

/// Uncompressed view of a package: raw bytes, optionally behind a chunk table
#[derive(Debug)]
pub struct PackageStorage {
    raw: RawStorage,
    chunks: Vec<CompressionChunk>,
    selector: Arc<CodecSelector>,
}

impl PackageStorage {
    pub fn plain(raw: RawStorage) -> Self {
        Self {
            raw,
            chunks: Vec::new(),
            selector: Arc::new(CodecSelector::default()),
        }
    }

    pub fn chunked(
        raw: RawStorage,
        chunks: Vec<CompressionChunk>,
        selector: Arc<CodecSelector>,
    ) -> Self {
        Self {
            raw,
            chunks,
            selector,
        }
    }

    pub fn is_chunked(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Fresh source over the uncompressed address space
    pub fn open_source(&self) -> Result<Box<dyn Source>> {
        let raw = self.raw.source()?;
        if self.chunks.is_empty() {
            return Ok(raw);
        }
        Ok(Box::new(ChunkedSource::new(
            raw,
            self.chunks.clone(),
            self.selector.clone(),
        )?))
    }

    pub fn read_region(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut source = self.open_source()?;
        let end = offset + size;
        if end > source.len() {
            return Err(Error::OutOfBounds {
                pos: end,
                size: source.len(),
            });
        }
        let mut buf = vec![0u8; size as usize];
        source.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

pub struct DecodedPackage {
    name: String,
    path: Option<PathBuf>,
    summary: PackageSummary,
    tables: Tables,
    storage: Arc<PackageStorage>,
    fully_compressed: bool,
    objects: Vec<OnceCell<Arc<Object>>>,
}

impl DecodedPackage {
    /// Expand, parse the summary and load the tables.
    ///
    /// Fully compressed files are expanded in memory first. Chunk tables are
    /// either expanded eagerly in parallel or served on demand, per
    /// `config.parallel`.
    pub fn open(
        name: impl Into<String>,
        path: Option<PathBuf>,
        mut raw: RawStorage,
        config: &LoaderConfig,
        quirks: &QuirkTable,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let name = name.into();
        let mut head = [0u8; 8];
        let mut source = raw.source()?;
        let fully_compressed = source.len() >= 8 && {
            source.read_at(0, &mut head)?;
            compression::is_fully_compressed(&head)
        };
        drop(source);
        if fully_compressed {
            let data = raw.read_all()?;
            let expanded = compression::expand_fully_compressed(&data, config.codec)?;
            tracing::debug!(package = %name, bytes = expanded.len(), "expanded package");
            raw = RawStorage::Memory(expanded.into());
        }
        cancel.check()?;

        let mut ar = Archive::new(raw.source()?);
        let summary = summary::parse(&mut ar, quirks)?;

        let storage = if summary.is_compressed() {
            let selector = Arc::new(CodecSelector::new(config.codec, summary.flagged_codec()));
            if config.parallel {
                let data = raw.read_all()?;
                let expanded = compression::decompress(
                    &summary.compression_chunks,
                    &selector,
                    &data,
                    cancel,
                )?;
                PackageStorage::plain(RawStorage::Memory(expanded.into()))
            } else {
                PackageStorage::chunked(raw, summary.compression_chunks.clone(), selector)
            }
        } else {
            PackageStorage::plain(raw)
        };
        if summary.is_compressed() {
            ar.replace_source(storage.open_source()?);
        }
        cancel.check()?;

        let tables = tables::load(&mut ar, &summary)?;
        let objects = (0..tables.exports.len()).map(|_| OnceCell::new()).collect();
        tracing::debug!(package = %name, game = summary.game.as_deref(), "opened package");
        Ok(Self {
            name,
            path,
            summary,
            tables,
            storage: Arc::new(storage),
            fully_compressed,
            objects,
        })
    }

    pub fn open_file(
        path: impl AsRef<Path>,
        config: &LoaderConfig,
        quirks: &QuirkTable,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let path = path.as_ref();
        Self::open(
            package_name(path),
            Some(path.to_path_buf()),
            RawStorage::File(path.to_path_buf()),
            config,
            quirks,
            cancel,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn summary(&self) -> &PackageSummary {
        &self.summary
    }

    pub fn names(&self) -> &NameTable {
        &self.tables.names
    }

    pub fn imports(&self) -> &[ObjectImport] {
        &self.tables.imports
    }

    pub fn exports(&self) -> &[ObjectExport] {
        &self.tables.exports
    }

    pub fn storage(&self) -> &Arc<PackageStorage> {
        &self.storage
    }

    pub fn was_fully_compressed(&self) -> bool {
        self.fully_compressed
    }

    /// New archive over the uncompressed package, with byte order and versions set
    pub fn open_archive(&self) -> Result<Archive> {
        let mut ar = Archive::new(self.storage.open_source()?);
        ar.set_byte_swap(self.summary.byte_swapped);
        ar.ver = self.summary.version_info();
        Ok(ar)
    }

    /// Validate a raw reference against this package's tables
    pub fn check_ref(&self, raw: i32) -> Result<ObjectRef> {
        ObjectRef::checked(raw, self.tables.exports.len(), self.tables.imports.len())
    }

    fn export(&self, index: usize) -> Result<&ObjectExport> {
        self.tables.exports.get(index).ok_or(Error::DanglingReference {
            raw: index as i32 + 1,
            table: "export",
            len: self.tables.exports.len(),
        })
    }

    fn import(&self, index: usize) -> Result<&ObjectImport> {
        self.tables.imports.get(index).ok_or(Error::DanglingReference {
            raw: -(index as i32) - 1,
            table: "import",
            len: self.tables.imports.len(),
        })
    }

    /// Object name of a reference; null renders as `None`
    pub fn object_name(&self, r: ObjectRef) -> Result<String> {
        match r {
            ObjectRef::Null => Ok("None".to_string()),
            ObjectRef::Export(i) => self.names().resolve(self.export(i)?.object_name),
            ObjectRef::Import(i) => self.names().resolve(self.import(i)?.object_name),
        }
    }

    fn outer_of(&self, r: ObjectRef) -> Result<ObjectRef> {
        Ok(match r {
            ObjectRef::Null => ObjectRef::Null,
            ObjectRef::Export(i) => self.check_ref(self.export(i)?.outer)?,
            ObjectRef::Import(i) => self.check_ref(self.import(i)?.outer)?,
        })
    }

    /// Names from the outermost object down to `r`
    fn chain(&self, r: ObjectRef) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut cur = r;
        while !cur.is_null() && names.len() < MAX_OUTER_DEPTH {
            names.push(self.object_name(cur)?);
            cur = self.outer_of(cur)?;
        }
        names.reverse();
        Ok(names)
    }

    /// Class name of an export; class references of null mean `Class`
    pub fn export_class_name(&self, index: usize) -> Result<String> {
        match self.check_ref(self.export(index)?.class)? {
            ObjectRef::Null => Ok("Class".to_string()),
            r => self.object_name(r),
        }
    }

    pub fn import_class_name(&self, index: usize) -> Result<String> {
        self.names().resolve(self.import(index)?.class_name)
    }

    /// `Package.Outer.Name` for exports, `Root.Outer.Name` for imports
    pub fn object_path(&self, r: ObjectRef) -> Result<String> {
        let chain = self.chain(r)?;
        Ok(match r {
            ObjectRef::Export(_) => format!("{}.{}", self.name, chain.join(".")),
            _ => chain.join("."),
        })
    }

    /// Name of the package an import lives in: the outermost import of its chain
    pub fn import_root_package(&self, index: usize) -> Result<String> {
        let chain = self.chain(ObjectRef::Import(index))?;
        match chain.first() {
            Some(root) if chain.len() > 1 => Ok(root.clone()),
            // a top-level import names a package itself
            _ => self.object_name(ObjectRef::Import(index)),
        }
    }

    /// Outer path of an import below its root package, `""` when directly inside it
    pub fn import_outer_path(&self, index: usize) -> Result<String> {
        let chain = self.chain(ObjectRef::Import(index))?;
        Ok(chain
            .get(1..chain.len().saturating_sub(1))
            .unwrap_or_default()
            .join("."))
    }

    /// Outer path of an export within this package
    pub fn export_outer_path(&self, index: usize) -> Result<String> {
        let chain = self.chain(ObjectRef::Export(index))?;
        Ok(chain[..chain.len().saturating_sub(1)].join("."))
    }

    /// Export matching an import's name, class and outer path
    pub fn find_export(&self, object_name: &str, class_name: &str, outer_path: &str) -> Option<usize> {
        (0..self.tables.exports.len()).find(|&i| {
            let same = |a: Result<String>, b: &str| a.is_ok_and(|a| a.eq_ignore_ascii_case(b));
            same(self.object_name(ObjectRef::Export(i)), object_name)
                && same(self.export_class_name(i), class_name)
                && same(self.export_outer_path(i), outer_path)
        })
    }

    pub fn cached_object(&self, index: usize) -> Option<Arc<Object>> {
        self.objects.get(index).and_then(|c| c.get().cloned())
    }

    /// Cache `object` for `index`, returning whichever object won
    pub(crate) fn cache_object(&self, index: usize, object: Object) -> Result<(Arc<Object>, bool)> {
        let cell = self.objects.get(index).ok_or(Error::DanglingReference {
            raw: index as i32 + 1,
            table: "export",
            len: self.objects.len(),
        })?;
        let mut created = false;
        let object = cell
            .get_or_init(|| {
                created = true;
                Arc::new(object)
            })
            .clone();
        Ok((object, created))
    }

    /// Whole uncompressed file, with compression bookkeeping removed from the summary.
    ///
    /// Compression flags and the chunk count are zeroed, the compressed
    /// package flag is cleared, and the summary tail is moved up over the
    /// chunk records so every table offset stays valid.
    pub fn unpacked_image(&self) -> Result<Vec<u8>> {
        let mut source = self.storage.open_source()?;
        let mut image = vec![0u8; source.len() as usize];
        source.read_at(0, &mut image)?;

        let offsets = self.summary.offsets;
        let (Some(flags_at), Some(end)) = (offsets.compression_flags, offsets.compression_end)
        else {
            return Ok(image);
        };
        if !self.summary.is_compressed() {
            return Ok(image);
        }
        let swap = self.summary.byte_swapped;
        let put = |image: &mut [u8], at: u64, value: u32| {
            let bytes = if swap {
                value.to_be_bytes()
            } else {
                value.to_le_bytes()
            };
            image[at as usize..at as usize + 4].copy_from_slice(&bytes);
        };
        let get = |image: &[u8], at: u64| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&image[at as usize..at as usize + 4]);
            if swap {
                u32::from_be_bytes(b)
            } else {
                u32::from_le_bytes(b)
            }
        };

        let flags = get(&image, offsets.package_flags);
        put(&mut image, offsets.package_flags, flags & !PKG_COMPRESSED);
        put(&mut image, flags_at, 0);
        put(&mut image, flags_at + 4, 0);

        let tail_start = end as usize;
        let tail_end = self
            .summary
            .compression_chunks
            .iter()
            .map(|c| c.uncompressed_offset as usize)
            .min()
            .unwrap_or(tail_start)
            .max(tail_start);
        let dest = flags_at as usize + 8;
        image.copy_within(tail_start..tail_end, dest);
        let moved_end = dest + (tail_end - tail_start);
        image[moved_end..tail_end].fill(0);
        Ok(image)
    }
}

impl std::fmt::Debug for DecodedPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedPackage")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("names", &self.tables.names.len())
            .field("imports", &self.tables.imports.len())
            .field("exports", &self.tables.exports.len())
            .finish()
    }
}

/// Registry key for a package file: its stem
pub fn package_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Codec;
    use crate::testutil::PackageBuilder;

    fn open_bytes(data: Vec<u8>, config: &LoaderConfig) -> Result<DecodedPackage> {
        DecodedPackage::open(
            "Test",
            None,
            RawStorage::Memory(data.into()),
            config,
            &QuirkTable::builtin(),
            &CancelToken::new(),
        )
    }

    fn sample(mut b: PackageBuilder) -> PackageBuilder {
        let texture = b.class("Texture");
        let package = b.class("Package");
        let group = b.export(package, 0, "Walls", Vec::new());
        b.export(texture, group, "Brick", (0..200u8).collect());
        b.export(texture, 0, "Sky", vec![5u8; 64]);
        b
    }

    #[test]
    fn test_paths_and_names() {
        let pkg = open_bytes(sample(PackageBuilder::ue2()).build(), &LoaderConfig::default()).unwrap();
        assert_eq!(pkg.object_path(ObjectRef::Export(1)).unwrap(), "Test.Walls.Brick");
        assert_eq!(pkg.export_class_name(1).unwrap(), "Texture");
        assert_eq!(pkg.export_outer_path(1).unwrap(), "Walls");
        assert_eq!(pkg.export_outer_path(2).unwrap(), "");
        assert_eq!(pkg.object_path(ObjectRef::Import(1)).unwrap(), "Core.Texture");
        assert_eq!(pkg.import_root_package(1).unwrap(), "Core");
        assert_eq!(pkg.import_root_package(0).unwrap(), "Core");
        assert_eq!(pkg.import_outer_path(1).unwrap(), "");
        assert_eq!(pkg.import_class_name(1).unwrap(), "Class");
        assert_eq!(pkg.object_name(ObjectRef::Null).unwrap(), "None");
        assert_eq!(pkg.find_export("brick", "texture", "walls"), Some(1));
        assert_eq!(pkg.find_export("Brick", "Texture", ""), None);
    }

    #[test]
    fn test_chunked_package_lazy_and_parallel() {
        let b = sample(PackageBuilder::ue3());
        let plain = open_bytes(b.build(), &LoaderConfig::default()).unwrap();
        let data = b.build_chunked(Codec::Zlib, 96);

        for parallel in [false, true] {
            let config = LoaderConfig {
                parallel,
                ..Default::default()
            };
            let pkg = open_bytes(data.clone(), &config).unwrap();
            assert!(pkg.summary().is_compressed());
            assert_eq!(pkg.storage().is_chunked(), !parallel);
            assert_eq!(pkg.names(), plain.names());
            assert_eq!(pkg.exports().len(), plain.exports().len());
            let brick = &pkg.exports()[1];
            let body = pkg
                .storage()
                .read_region(brick.serial_offset, brick.serial_size)
                .unwrap();
            assert_eq!(body, (0..200u8).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_fully_compressed_package() {
        let b = sample(PackageBuilder::ue2());
        let pkg = open_bytes(b.build_fully_compressed(Codec::Zlib), &LoaderConfig::default()).unwrap();
        assert!(pkg.was_fully_compressed());
        assert_eq!(pkg.exports().len(), 3);
        assert_eq!(pkg.unpacked_image().unwrap(), b.build());
    }

    #[test]
    fn test_unpacked_image_reopens_uncompressed() {
        let b = sample(PackageBuilder::ue3());
        let config = LoaderConfig {
            parallel: false,
            ..Default::default()
        };
        let pkg = open_bytes(b.build_chunked(Codec::Lzo, 128), &config).unwrap();
        let image = pkg.unpacked_image().unwrap();

        let reopened = open_bytes(image, &config).unwrap();
        assert!(!reopened.summary().is_compressed());
        assert_eq!(reopened.summary().package_flags & PKG_COMPRESSED, 0);
        assert_eq!(reopened.exports(), pkg.exports());
        assert_eq!(reopened.names(), pkg.names());
    }

    #[test]
    fn test_cancelled_open() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = DecodedPackage::open(
            "Test",
            None,
            RawStorage::Memory(sample(PackageBuilder::ue2()).build().into()),
            &LoaderConfig::default(),
            &QuirkTable::builtin(),
            &cancel,
        );
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Walls.utx");
        std::fs::write(&path, sample(PackageBuilder::ue2()).build()).unwrap();
        let pkg = DecodedPackage::open_file(
            &path,
            &LoaderConfig::default(),
            &QuirkTable::builtin(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(pkg.name(), "Walls");
        assert_eq!(pkg.path(), Some(path.as_path()));
        let mut ar = pkg.open_archive().unwrap();
        assert_eq!(ar.ver.file_version, 128);
        ar.seek(pkg.exports()[2].serial_offset).unwrap();
        assert_eq!(ar.read_u8().unwrap(), 5);
    }
}
