//! Batch export listing over many packages

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use upkg::{CancelToken, DecodedPackage, LoaderConfig, ObjectRef, QuirkTable};

/// Package files under `paths`. Files named directly are always included;
/// directories contribute files with a package extension.
pub fn collect_packages(config: &LoaderConfig, paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let is_package = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| config.is_package_extension(e));
            if is_package {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files
}

fn list_package(
    path: &Path,
    config: &LoaderConfig,
    quirks: &QuirkTable,
    cancel: &CancelToken,
) -> Result<Vec<String>> {
    let package = DecodedPackage::open_file(path, config, quirks, cancel)
        .with_context(|| format!("Failed to open package {}", path.display()))?;
    (0..package.exports().len())
        .map(|i| -> Result<String> {
            let class_name = package.export_class_name(i)?;
            let object = package.object_path(ObjectRef::Export(i))?;
            Ok(format!("{class_name:<24} {object}"))
        })
        .collect()
}

pub fn handle(config: LoaderConfig, paths: &[PathBuf]) -> Result<()> {
    let quirks = config.quirk_table().context("Failed to load quirk table")?;
    let cancel = CancelToken::new();
    let files = collect_packages(&config, paths);
    eprintln!("Found {} packages", files.len());

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("#>-"),
    );

    let results: Vec<_> = files
        .par_iter()
        .map(|path| {
            let result = list_package(path, &config, &quirks, &cancel);
            pb.inc(1);
            result
        })
        .collect();

    pb.finish_and_clear();

    let mut failed = 0;
    for (path, result) in files.iter().zip(results) {
        match result {
            Ok(lines) => {
                for line in lines {
                    println!("{}: {line}", path.display());
                }
            }
            Err(e) => {
                eprintln!("Error {}: {:#}", path.display(), e);
                failed += 1;
            }
        }
    }

    eprintln!("Listed: {}, Failed: {}", files.len() - failed, failed);
    Ok(())
}
