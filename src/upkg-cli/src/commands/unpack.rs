//! Write uncompressed copies of packages

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use upkg::{CancelToken, DecodedPackage, LoaderConfig};

pub fn handle(config: LoaderConfig, path: &Path, output: &Path) -> Result<()> {
    let quirks = config.quirk_table().context("Failed to load quirk table")?;
    let package = DecodedPackage::open_file(path, &config, &quirks, &CancelToken::new())
        .with_context(|| format!("Failed to open package {}", path.display()))?;

    let image = package
        .unpacked_image()
        .with_context(|| format!("Failed to expand {}", path.display()))?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(output, &image)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let summary = package.summary();
    let how = if package.was_fully_compressed() {
        "whole-file compression"
    } else if summary.is_compressed() {
        "chunked compression"
    } else {
        "no compression"
    };
    eprintln!(
        "Wrote {} ({} bytes, {how})",
        output.display(),
        image.len()
    );
    Ok(())
}
