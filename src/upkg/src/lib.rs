//! Unreal package deserialization engine
//!
//! Reads the archive files produced by Unreal Engine 1 through 3 and their
//! licensee forks: detects and expands compressed payloads, parses the package
//! summary through a data-driven quirk table, loads the name/import/export
//! tables, and resolves the object graph lazily with load-transaction
//! semantics.
//!
//! # Package layout
//!
//! ```text
//! +------------------+
//! | Summary          |  magic 0x9E2A83C1, versions, table offsets, chunks
//! +------------------+
//! | Name table       |  strings + flags
//! +------------------+
//! | Import table     |  objects living in other packages
//! +------------------+
//! | Export table     |  objects defined here, with serial windows
//! +------------------+
//! | Object data      |  one [offset, offset+size) window per export
//! +------------------+
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use upkg::{ClassRegistry, LoadSession, LoaderConfig, PackageRegistry};
//!
//! let registry = Arc::new(PackageRegistry::new(LoaderConfig::default())?);
//! let package = registry.open_file("Engine.u")?;
//! let mut session = LoadSession::new(registry.clone(), Arc::new(ClassRegistry::tagged_fallback()));
//! let loaded = session.load_all_exports(&package)?;
//! println!("{} objects, {} warnings", loaded.len(), session.warnings().len());
//! # Ok::<(), upkg::Error>(())
//! ```

pub mod archive;
pub mod bulk;
pub mod compression;
pub mod config;
pub mod object;
pub mod package;
pub mod property;
pub mod quirks;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod summary;
pub mod tables;

#[cfg(test)]
pub(crate) mod testutil;

pub use archive::{Archive, NameEncoding, VersionInfo};
pub use bulk::LazyRegion;
pub use compression::{Codec, CompressionChunk};
pub use config::{CancelToken, LoaderConfig};
pub use object::{NativeObject, Object, ObjectData};
pub use package::DecodedPackage;
pub use property::{Property, PropertyList, PropertyValue};
pub use quirks::{EngineGeneration, FieldLayout, QuirkTable};
pub use reference::ObjectRef;
pub use registry::{ClassDecoder, ClassRegistry, PackageRegistry};
pub use resolver::{DecodeContext, LoadSession, Warning};
pub use summary::PackageSummary;
pub use tables::{FName, NameTable, ObjectExport, ObjectImport};

/// Magic tag at offset 0 of every package
pub const PACKAGE_FILE_TAG: u32 = 0x9E2A83C1;

/// Magic tag as it reads from a package written in the opposite byte order
pub const PACKAGE_FILE_TAG_SWAPPED: u32 = 0xC1832A9E;

/// Error type for package operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad package magic: {}", describe_magic(.found))]
    BadMagic { found: Option<u32> },

    #[error("Seek to {pos:#x} is outside archive of {size} bytes")]
    OutOfBounds { pos: u64, size: u64 },

    #[error("Corrupt chunk {index}: expected {expected} bytes, got {actual}")]
    CorruptChunk {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Bad compressed chunk header at {offset:#x}: {reason}")]
    BadChunkHeader { offset: u64, reason: String },

    #[error("{codec} decompression failed: {message}")]
    Codec {
        codec: &'static str,
        message: String,
    },

    #[error("Codec {0} cannot compress")]
    UnsupportedCodec(&'static str),

    #[error("Invalid package summary: {0}")]
    InvalidSummary(String),

    #[error("Truncated {table} table: read {read} of {expected} records")]
    TruncatedTable {
        table: &'static str,
        expected: usize,
        read: usize,
    },

    #[error("Property stream ended before None after {read} properties")]
    TruncatedPropertyStream { read: usize },

    #[error("Reference {raw} is outside {table} table of {len} entries")]
    DanglingReference {
        raw: i32,
        table: &'static str,
        len: usize,
    },

    #[error("Name index {index} is outside name table of {len} entries")]
    BadNameIndex { index: i64, len: usize },

    #[error("Package {0} not found for import")]
    UnresolvedImportPackage(String),

    #[error("Import {object} not found in package {package}")]
    UnresolvedImport { package: String, object: String },

    #[error("Unknown class {0}")]
    UnknownClass(String),

    #[error("Quirk table error: {0}")]
    Quirks(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Load cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error aborts loading the whole package rather than one object
    pub fn is_package_fatal(&self) -> bool {
        matches!(
            self,
            Error::BadMagic { .. }
                | Error::CorruptChunk { .. }
                | Error::BadChunkHeader { .. }
                | Error::Codec { .. }
                | Error::InvalidSummary(_)
                | Error::TruncatedTable { .. }
                | Error::Quirks(_)
                | Error::Cancelled
        )
    }

    pub(crate) fn eof(what: impl std::fmt::Display) -> Self {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            what.to_string(),
        ))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn describe_magic(found: &Option<u32>) -> String {
    match found {
        Some(magic) => format!("{magic:#010x}"),
        None => "file too short".to_string(),
    }
}
