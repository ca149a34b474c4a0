//! Command handlers

pub mod dump;
pub mod inspect;
pub mod list;
pub mod unpack;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use upkg::{DecodedPackage, PackageRegistry};

/// Open a package through the registry so its imports can be found
pub fn open(registry: &PackageRegistry, path: &Path) -> Result<Arc<DecodedPackage>> {
    registry
        .open_file(path)
        .with_context(|| format!("Failed to open package {}", path.display()))
}
