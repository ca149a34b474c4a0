//! Summary and table listings

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use upkg::{DecodedPackage, LoaderConfig, ObjectRef, PackageRegistry};

use super::open;

fn print_summary(package: &DecodedPackage) {
    let s = package.summary();
    println!("Package:     {}", package.name());
    if let Some(path) = package.path() {
        println!("Path:        {}", path.display());
    }
    println!(
        "Version:     {}/{} ({:?}{})",
        s.file_version,
        s.licensee_version,
        s.generation,
        s.game.as_deref().map(|g| format!(", {g}")).unwrap_or_default()
    );
    if s.byte_swapped {
        println!("Byte order:  big-endian");
    }
    if !s.package_group.is_empty() && s.package_group != "None" {
        println!("Group:       {}", s.package_group);
    }
    println!("Flags:       {:#010x}", s.package_flags);
    println!("Names:       {} @ {:#x}", s.name_count, s.name_offset);
    println!("Imports:     {} @ {:#x}", s.import_count, s.import_offset);
    println!("Exports:     {} @ {:#x}", s.export_count, s.export_offset);
    println!("GUID:        {}", s.guid);
    println!("Generations: {}", s.generations.len());
    if s.engine_version != 0 || s.cooker_version != 0 {
        println!("Engine:      {} (cooker {})", s.engine_version, s.cooker_version);
    }
    if s.is_compressed() {
        println!(
            "Compression: {:#x}, {} chunks",
            s.compression_flags,
            s.compression_chunks.len()
        );
    }
    if package.was_fully_compressed() {
        println!("Compression: whole file");
    }
}

/// Summaries of several packages; one failure does not stop the rest
pub fn info(config: LoaderConfig, packages: &[PathBuf], json: bool) -> Result<()> {
    let registry = PackageRegistry::new(config).context("Failed to load quirk table")?;
    let mut failed = 0;

    for (i, path) in packages.iter().enumerate() {
        let package = match open(&registry, path) {
            Ok(package) => package,
            Err(e) => {
                eprintln!("Error {}: {:#}", path.display(), e);
                failed += 1;
                continue;
            }
        };
        if json {
            println!("{}", serde_json::to_string_pretty(package.summary())?);
        } else {
            if i > 0 {
                println!();
            }
            print_summary(&package);
        }
    }

    if failed > 0 {
        bail!("{failed} of {} packages failed to open", packages.len());
    }
    Ok(())
}

pub fn names(config: LoaderConfig, path: &Path) -> Result<()> {
    let registry = PackageRegistry::new(config)?;
    let package = open(&registry, path)?;
    for (i, entry) in package.names().entries().iter().enumerate() {
        println!("{i:6}  {:#018x}  {}", entry.flags, entry.name);
    }
    Ok(())
}

pub fn imports(config: LoaderConfig, path: &Path) -> Result<()> {
    let registry = PackageRegistry::new(config)?;
    let package = open(&registry, path)?;
    for (i, import) in package.imports().iter().enumerate() {
        let class_package = package.names().resolve(import.class_package)?;
        let class_name = package.import_class_name(i)?;
        let object = package.object_path(ObjectRef::Import(i))?;
        println!("{i:6}  {:<28} {object}", format!("{class_package}.{class_name}"));
    }
    Ok(())
}

pub fn exports(config: LoaderConfig, path: &Path) -> Result<()> {
    let registry = PackageRegistry::new(config)?;
    let package = open(&registry, path)?;
    for (i, export) in package.exports().iter().enumerate() {
        let class_name = package.export_class_name(i)?;
        let object = package.object_path(ObjectRef::Export(i))?;
        println!(
            "{i:6}  {class_name:<24} {object}  [{:#x}+{}]",
            export.serial_offset, export.serial_size
        );
    }
    Ok(())
}
