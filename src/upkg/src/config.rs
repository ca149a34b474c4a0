//! Loader configuration and cancellation

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compression::Codec;
use crate::quirks::QuirkTable;
use crate::{Error, Result};

/// File extensions tried when looking up a package by name
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "u", "ut2", "utx", "uax", "usx", "ukx", "uxx", "upk", "upx", "umap", "udk", "xxx", "u8",
    "ut3", "rom", "unr", "lin",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directories searched (recursively) for imported packages
    pub search_paths: Vec<PathBuf>,
    pub extensions: Vec<String>,
    /// Force a codec for every compressed block, bypassing flags and detection
    pub codec: Option<Codec>,
    /// YAML quirk rules consulted before the builtin table
    pub quirks_file: Option<PathBuf>,
    /// Decompress chunk tables eagerly and in parallel instead of on demand
    pub parallel: bool,
    /// Classes never decoded; their exports stay placeholders without warnings
    pub suppressed_classes: Vec<String>,
    /// Skip `Default__` class default objects in bulk loads
    pub skip_default_objects: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            codec: None,
            quirks_file: None,
            parallel: true,
            suppressed_classes: Vec::new(),
            skip_default_objects: true,
        }
    }
}

impl LoaderConfig {
    /// Builtin quirk rules, overridden by `quirks_file` when set
    pub fn quirk_table(&self) -> Result<QuirkTable> {
        let builtin = QuirkTable::builtin();
        match &self.quirks_file {
            Some(path) => Ok(builtin.with_overrides(QuirkTable::load(path)?)),
            None => Ok(builtin),
        }
    }

    pub fn is_suppressed(&self, class_name: &str) -> bool {
        self.suppressed_classes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(class_name))
    }

    /// Whether `ext` (without the dot) is a package extension
    pub fn is_package_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
}

/// Shared flag checked between chunks and between top-level object loads
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
