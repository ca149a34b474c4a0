//! Class decoders and the process-wide package registry

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use walkdir::WalkDir;

use crate::config::{CancelToken, LoaderConfig};
use crate::object::NativeObject;
use crate::package::{package_name, DecodedPackage, RawStorage};
use crate::quirks::QuirkTable;
use crate::resolver::DecodeContext;
use crate::Result;

pub type DecodeFn =
    Arc<dyn Fn(&mut DecodeContext<'_>) -> Result<Box<dyn NativeObject>> + Send + Sync>;

#[derive(Clone)]
pub enum ClassDecoder {
    /// Class-specific binary layout
    Native(DecodeFn),
    /// Generic tagged-property stream
    TaggedProperties,
}

impl std::fmt::Debug for ClassDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassDecoder::Native(_) => f.write_str("Native"),
            ClassDecoder::TaggedProperties => f.write_str("TaggedProperties"),
        }
    }
}

/// Maps class names (case-insensitive) to decoders, with inheritance
#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    decoders: HashMap<String, ClassDecoder>,
    parents: HashMap<String, String>,
    fallback: Option<ClassDecoder>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that decodes every class without its own decoder as tagged properties
    pub fn tagged_fallback() -> Self {
        Self {
            fallback: Some(ClassDecoder::TaggedProperties),
            ..Self::default()
        }
    }

    pub fn register(&mut self, class_name: &str, decoder: ClassDecoder) -> &mut Self {
        self.decoders.insert(class_name.to_ascii_lowercase(), decoder);
        self
    }

    pub fn register_native<F>(&mut self, class_name: &str, decode: F) -> &mut Self
    where
        F: Fn(&mut DecodeContext<'_>) -> Result<Box<dyn NativeObject>> + Send + Sync + 'static,
    {
        self.register(class_name, ClassDecoder::Native(Arc::new(decode)))
    }

    /// Declare `parent` as the superclass of `class_name`
    pub fn register_parent(&mut self, class_name: &str, parent: &str) -> &mut Self {
        self.parents
            .insert(class_name.to_ascii_lowercase(), parent.to_ascii_lowercase());
        self
    }

    /// Decoder for a class, walking superclasses before the fallback
    pub fn lookup(&self, class_name: &str) -> Option<ClassDecoder> {
        let mut key = class_name.to_ascii_lowercase();
        let mut seen = HashSet::new();
        loop {
            if let Some(decoder) = self.decoders.get(&key) {
                return Some(decoder.clone());
            }
            if !seen.insert(key.clone()) {
                break;
            }
            match self.parents.get(&key) {
                Some(parent) => key = parent.clone(),
                None => break,
            }
        }
        self.fallback.clone()
    }
}

/// Loaded packages by name, plus the search index used to find imports.
///
/// Packages become visible only after they open completely. Opening the same
/// name twice keeps the first instance.
pub struct PackageRegistry {
    config: LoaderConfig,
    quirks: QuirkTable,
    cancel: CancelToken,
    packages: RwLock<HashMap<String, Arc<DecodedPackage>>>,
    file_index: OnceCell<HashMap<String, PathBuf>>,
    missing: Mutex<HashSet<String>>,
}

impl PackageRegistry {
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let quirks = config.quirk_table()?;
        Ok(Self::with_quirks(config, quirks))
    }

    pub fn with_quirks(config: LoaderConfig, quirks: QuirkTable) -> Self {
        Self {
            config,
            quirks,
            cancel: CancelToken::new(),
            packages: RwLock::new(HashMap::new()),
            file_index: OnceCell::new(),
            missing: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn quirks(&self) -> &QuirkTable {
        &self.quirks
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    fn insert(&self, package: DecodedPackage) -> Arc<DecodedPackage> {
        let key = Self::key(package.name());
        let mut packages = self.packages.write();
        packages
            .entry(key)
            .or_insert_with(|| Arc::new(package))
            .clone()
    }

    /// Already-registered package by name
    pub fn get(&self, name: &str) -> Option<Arc<DecodedPackage>> {
        self.packages.read().get(&Self::key(name)).cloned()
    }

    pub fn open_file(&self, path: impl AsRef<Path>) -> Result<Arc<DecodedPackage>> {
        let path = path.as_ref();
        if let Some(existing) = self.get(&package_name(path)) {
            return Ok(existing);
        }
        let package = DecodedPackage::open_file(path, &self.config, &self.quirks, &self.cancel)?;
        Ok(self.insert(package))
    }

    pub fn open_bytes(&self, name: &str, data: Vec<u8>) -> Result<Arc<DecodedPackage>> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        let package = DecodedPackage::open(
            name,
            None,
            RawStorage::Memory(data.into()),
            &self.config,
            &self.quirks,
            &self.cancel,
        )?;
        Ok(self.insert(package))
    }

    fn index(&self) -> &HashMap<String, PathBuf> {
        self.file_index.get_or_init(|| {
            let mut index = HashMap::new();
            for root in &self.config.search_paths {
                for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
                    let path = entry.path();
                    let is_package = entry.file_type().is_file()
                        && path
                            .extension()
                            .and_then(|e| e.to_str())
                            .is_some_and(|e| self.config.is_package_extension(e));
                    if is_package {
                        index
                            .entry(Self::key(&package_name(path)))
                            .or_insert_with(|| path.to_path_buf());
                    }
                }
            }
            tracing::debug!(packages = index.len(), "indexed search paths");
            index
        })
    }

    /// Registered package, or one found on the search paths and opened now
    pub fn find_package_by_name(&self, name: &str) -> Result<Option<Arc<DecodedPackage>>> {
        if let Some(package) = self.get(name) {
            return Ok(Some(package));
        }
        match self.index().get(&Self::key(name)) {
            Some(path) => self.open_file(path.clone()).map(Some),
            None => Ok(None),
        }
    }

    /// Record a package that could not be found. Returns true the first time.
    pub fn note_missing(&self, name: &str) -> bool {
        self.missing.lock().insert(Self::key(name))
    }

    /// Drop a package from the registry. Objects holding it keep it alive.
    pub fn release(&self, name: &str) -> Option<Arc<DecodedPackage>> {
        self.packages.write().remove(&Self::key(name))
    }

    pub fn package_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .packages
            .read()
            .values()
            .map(|p| p.name().to_string())
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for PackageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageRegistry")
            .field("packages", &self.packages.read().len())
            .field("search_paths", &self.config.search_paths)
            .finish()
    }
}
