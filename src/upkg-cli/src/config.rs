//! Configuration file handling for the upkg CLI
//!
//! The file is TOML with the same fields as [`LoaderConfig`]; flags given on
//! the command line win over it.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use upkg::LoaderConfig;

use crate::cli::Cli;

/// Default config location
pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Could not determine config directory")?
        .join("upkg");

    Ok(config_dir.join("config.toml"))
}

/// Read a config file. A missing default file is an empty config; a missing
/// explicit file is an error.
pub fn load(explicit: Option<&Path>) -> Result<LoaderConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = config_path()?;
            if !path.exists() {
                return Ok(LoaderConfig::default());
            }
            path
        }
    };

    let contents = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loading config");

    parse(&contents).with_context(|| format!("Failed to parse config file {}", path.display()))
}

pub fn parse(contents: &str) -> Result<LoaderConfig> {
    Ok(toml::from_str(contents)?)
}

/// Config file merged with command-line overrides
pub fn resolve(cli: &Cli) -> Result<LoaderConfig> {
    let mut config = load(cli.config.as_deref())?;
    config.search_paths.extend(cli.search_paths.iter().cloned());
    if cli.codec.is_some() {
        config.codec = cli.codec;
    }
    if cli.quirks.is_some() {
        config.quirks_file = cli.quirks.clone();
    }
    if cli.lazy {
        config.parallel = false;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use upkg::Codec;

    #[test]
    fn test_parse_partial_config() {
        let config = parse(
            r#"
search_paths = ["/games/ut2004"]
suppressed_classes = ["Sound"]
codec = "lzo"
"#,
        )
        .unwrap();
        assert_eq!(config.search_paths, vec![PathBuf::from("/games/ut2004")]);
        assert_eq!(config.codec, Some(Codec::Lzo));
        assert!(config.parallel);
        assert!(config.extensions.iter().any(|e| e == "utx"));
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "search_paths = [\"/a\"]\nparallel = true\n").unwrap();

        let cli = Cli::parse_from([
            "upkg",
            "--config",
            path.to_str().unwrap(),
            "-p",
            "/b",
            "--lazy",
            "--codec",
            "zlib",
            "names",
            "Engine.u",
        ]);
        let config = resolve(&cli).unwrap();
        assert_eq!(
            config.search_paths,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert!(!config.parallel);
        assert_eq!(config.codec, Some(Codec::Zlib));
    }

    #[test]
    fn test_missing_explicit_config() {
        assert!(load(Some(Path::new("/nonexistent/upkg.toml"))).is_err());
    }
}
