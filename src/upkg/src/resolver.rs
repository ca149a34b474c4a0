//! Object graph resolution with load transactions
//!
//! A [`LoadSession`] turns references into [`Object`]s on demand. Each export
//! is constructed at most once: the object is cached in its package before
//! its body is decoded, so a reference cycle sees the pending instance instead
//! of recursing. Objects built during a transaction are queued and receive
//! `post_load` once, in construction order, when the outermost
//! [`LoadSession::end_load`] runs.
//!
//! Failures local to one object never abort the transaction. They leave a
//! placeholder holding the object's raw window and a [`Warning`] on the
//! session.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::archive::Archive;
use crate::bulk::LazyRegion;
use crate::config::CancelToken;
use crate::object::{Object, ObjectData};
use crate::package::DecodedPackage;
use crate::property::{self, PropertyList};
use crate::reference::ObjectRef;
use crate::registry::{ClassDecoder, ClassRegistry, PackageRegistry};
use crate::tables::{FName, ObjectExport};
use crate::{Error, Result};

/// UE3 objects carry a net index ahead of their properties from this version
const VER_NET_INDEX: u16 = 322;

/// Legacy lazy arrays carry an absolute skip position from this version
const VER_LAZY_ARRAY_SKIP: u16 = 62;

const DEFAULT_OBJECT_PREFIX: &str = "Default__";

/// Non-fatal problem recorded while resolving objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    UnknownClass { class: String },
    MissingPackage { package: String },
    MissingImport { package: String, object: String },
    DecodeFailed {
        object: String,
        class: String,
        message: String,
    },
    UnreadBytes { object: String, bytes: u64 },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnknownClass { class } => write!(f, "unknown class {class}"),
            Warning::MissingPackage { package } => write!(f, "package {package} not found"),
            Warning::MissingImport { package, object } => {
                write!(f, "import {object} not found in {package}")
            }
            Warning::DecodeFailed {
                object,
                class,
                message,
            } => write!(f, "failed to decode {object} ({class}): {message}"),
            Warning::UnreadBytes { object, bytes } => {
                write!(f, "{bytes} bytes left unread in {object}")
            }
        }
    }
}

/// Whether an error escaping a decoder aborts the whole package
fn aborts_package(err: &Error) -> bool {
    match err {
        Error::Io(e) => e.kind() != std::io::ErrorKind::UnexpectedEof,
        other => other.is_package_fatal(),
    }
}

/// Per-thread loading state: the load transaction, open archives and warnings
pub struct LoadSession {
    registry: Arc<PackageRegistry>,
    classes: Arc<ClassRegistry>,
    archives: HashMap<String, Archive>,
    depth: usize,
    pending: Vec<Arc<Object>>,
    warnings: Vec<Warning>,
    warned_classes: HashSet<String>,
    warned_imports: HashSet<(String, String)>,
    cancel: CancelToken,
}

impl LoadSession {
    pub fn new(registry: Arc<PackageRegistry>, classes: Arc<ClassRegistry>) -> Self {
        let cancel = registry.cancel_token().clone();
        Self {
            registry,
            classes,
            archives: HashMap::new(),
            depth: 0,
            pending: Vec::new(),
            warnings: Vec::new(),
            warned_classes: HashSet::new(),
            warned_imports: HashSet::new(),
            cancel,
        }
    }

    pub fn registry(&self) -> &Arc<PackageRegistry> {
        &self.registry
    }

    pub fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    /// Current transaction nesting depth
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn begin_load(&mut self) {
        self.depth += 1;
    }

    /// Close one level. The outermost close runs `post_load` on everything
    /// constructed since the first `begin_load`.
    pub fn end_load(&mut self) {
        if self.depth == 0 {
            return;
        }
        self.depth -= 1;
        if self.depth > 0 {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        tracing::debug!(objects = pending.len(), "ending load transaction");
        for object in pending {
            object.post_load();
        }
        self.archives.clear();
    }

    fn warn(&mut self, warning: Warning) {
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Object for a reference. Null resolves to `None`, as do imports that
    /// name a package rather than an object in it.
    pub fn resolve(
        &mut self,
        package: &Arc<DecodedPackage>,
        r: ObjectRef,
    ) -> Result<Option<Arc<Object>>> {
        match r {
            ObjectRef::Null => Ok(None),
            ObjectRef::Export(i) => self.load_export(package, i).map(Some),
            ObjectRef::Import(i) => self.resolve_import(package, i),
        }
    }

    /// Object for an export, constructing and decoding it on first use
    pub fn load_export(&mut self, package: &Arc<DecodedPackage>, index: usize) -> Result<Arc<Object>> {
        if let Some(object) = package.cached_object(index) {
            return Ok(object);
        }
        self.cancel.check()?;

        let name = package.object_name(ObjectRef::Export(index))?;
        let class = package.export_class_name(index)?;
        let (object, created) =
            package.cache_object(index, Object::new(package, index, name, class))?;
        if !created {
            return Ok(object);
        }
        tracing::trace!(
            package = package.name(),
            object = object.name(),
            class = object.class_name(),
            "constructing"
        );
        self.pending.push(object.clone());

        self.begin_load();
        let result = self.decode(package, index, &object);
        self.end_load();
        result.map(|()| object)
    }

    /// First export with this name, anywhere in the package
    pub fn load_object(
        &mut self,
        package: &Arc<DecodedPackage>,
        name: &str,
    ) -> Result<Option<Arc<Object>>> {
        let found = (0..package.exports().len()).find(|&i| {
            package
                .object_name(ObjectRef::Export(i))
                .is_ok_and(|n| n.eq_ignore_ascii_case(name))
        });
        let Some(index) = found else {
            return Ok(None);
        };
        self.begin_load();
        let result = self.load_export(package, index);
        self.end_load();
        result.map(Some)
    }

    /// Every export of a package inside one transaction
    pub fn load_all_exports(&mut self, package: &Arc<DecodedPackage>) -> Result<Vec<Arc<Object>>> {
        let skip_defaults = self.registry.config().skip_default_objects;
        self.begin_load();
        let result: Result<Vec<Arc<Object>>> = (|| {
            let mut objects = Vec::with_capacity(package.exports().len());
            for index in 0..package.exports().len() {
                if skip_defaults {
                    let name = package.object_name(ObjectRef::Export(index))?;
                    if name.starts_with(DEFAULT_OBJECT_PREFIX) {
                        continue;
                    }
                }
                self.cancel.check()?;
                objects.push(self.load_export(package, index)?);
            }
            Ok(objects)
        })();
        self.end_load();
        result
    }

    fn resolve_import(
        &mut self,
        package: &Arc<DecodedPackage>,
        index: usize,
    ) -> Result<Option<Arc<Object>>> {
        let object_name = package.object_name(ObjectRef::Import(index))?;
        let root = package.import_root_package(index)?;

        let owner = if root.eq_ignore_ascii_case(package.name()) {
            Some(package.clone())
        } else {
            match self.registry.find_package_by_name(&root) {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(package = %root, error = %e, "import package failed to open");
                    None
                }
            }
        };
        let Some(owner) = owner else {
            if self.registry.note_missing(&root) {
                self.warn(Warning::MissingPackage {
                    package: root.clone(),
                });
            }
            return Err(Error::UnresolvedImportPackage(root));
        };

        let outer = package.check_ref(package.imports()[index].outer)?;
        if outer.is_null() {
            // the import is the package itself
            return Ok(None);
        }

        let class_name = package.import_class_name(index)?;
        let outer_path = package.import_outer_path(index)?;
        match owner.find_export(&object_name, &class_name, &outer_path) {
            Some(export) => self.load_export(&owner, export).map(Some),
            None => {
                let path = package.object_path(ObjectRef::Import(index))?;
                let key = (root.to_ascii_lowercase(), path.to_ascii_lowercase());
                if self.warned_imports.insert(key) {
                    self.warn(Warning::MissingImport {
                        package: root.clone(),
                        object: path,
                    });
                }
                Err(Error::UnresolvedImport {
                    package: root,
                    object: object_name,
                })
            }
        }
    }

    fn decode(&mut self, package: &Arc<DecodedPackage>, index: usize, object: &Arc<Object>) -> Result<()> {
        let (offset, size) = {
            let export = &package.exports()[index];
            (export.serial_offset, export.serial_size)
        };
        let placeholder = || ObjectData::Placeholder(LazyRegion::new(package.storage().clone(), offset, size));

        let class = object.class_name();
        if size == 0 || self.registry.config().is_suppressed(class) {
            object.set_data(placeholder());
            return Ok(());
        }
        let Some(decoder) = self.classes.lookup(class) else {
            if self.warned_classes.insert(class.to_ascii_lowercase()) {
                self.warn(Warning::UnknownClass {
                    class: class.to_string(),
                });
            }
            object.set_data(placeholder());
            return Ok(());
        };

        // a nested decode of the same package opens its own archive
        let key = package.name().to_ascii_lowercase();
        let mut ar = match self.archives.remove(&key) {
            Some(ar) => ar,
            None => match package.open_archive() {
                Ok(ar) => ar,
                Err(e) => {
                    object.set_data(placeholder());
                    return Err(e);
                }
            },
        };
        let outcome = ar.with_window(offset, size, |ar| {
            let data = {
                let mut ctx = DecodeContext {
                    session: &mut *self,
                    package,
                    ar: &mut *ar,
                    export_index: index,
                };
                run_decoder(&decoder, &mut ctx)?
            };
            Ok((data, ar.remaining()))
        });
        self.archives.insert(key, ar);

        match outcome {
            Ok((data, unread)) => {
                object.set_data(data);
                if unread > 0 {
                    self.warn(Warning::UnreadBytes {
                        object: object.path(),
                        bytes: unread,
                    });
                }
                Ok(())
            }
            Err(e) if aborts_package(&e) => {
                object.set_data(placeholder());
                Err(e)
            }
            Err(e) => {
                self.warn(Warning::DecodeFailed {
                    object: object.path(),
                    class: class.to_string(),
                    message: e.to_string(),
                });
                object.set_data(placeholder());
                Ok(())
            }
        }
    }
}

fn run_decoder(decoder: &ClassDecoder, ctx: &mut DecodeContext<'_>) -> Result<ObjectData> {
    match decoder {
        ClassDecoder::Native(decode) => Ok(ObjectData::Native(decode(ctx)?)),
        ClassDecoder::TaggedProperties => {
            ctx.read_object_header()?;
            Ok(ObjectData::Properties(ctx.read_properties()?))
        }
    }
}

impl fmt::Debug for LoadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadSession")
            .field("depth", &self.depth)
            .field("pending", &self.pending.len())
            .field("warnings", &self.warnings.len())
            .finish()
    }
}

/// What a class decoder sees: the archive windowed to one export's bytes,
/// plus the means to resolve the references it reads.
pub struct DecodeContext<'a> {
    session: &'a mut LoadSession,
    package: &'a Arc<DecodedPackage>,
    ar: &'a mut Archive,
    export_index: usize,
}

impl<'a> DecodeContext<'a> {
    pub fn archive(&mut self) -> &mut Archive {
        &mut *self.ar
    }

    pub fn package(&self) -> &Arc<DecodedPackage> {
        self.package
    }

    pub fn export_index(&self) -> usize {
        self.export_index
    }

    pub fn export(&self) -> &ObjectExport {
        &self.package.exports()[self.export_index]
    }

    pub fn resolve(&mut self, r: ObjectRef) -> Result<Option<Arc<Object>>> {
        self.session.resolve(self.package, r)
    }

    /// Read a reference and resolve it. Imports whose package or object is
    /// missing resolve to `None`; the session has already recorded why.
    pub fn read_object_ref(&mut self) -> Result<Option<Arc<Object>>> {
        let raw = if self.ar.ver.is_ue3() {
            self.ar.read_i32()?
        } else {
            self.ar.read_compact_index()?
        };
        let r = self.package.check_ref(raw)?;
        match self.resolve(r) {
            Err(Error::UnresolvedImportPackage(_) | Error::UnresolvedImport { .. }) => Ok(None),
            other => other,
        }
    }

    pub fn read_name(&mut self) -> Result<String> {
        let name = FName::read(self.ar)?;
        self.package.names().resolve(name)
    }

    /// Per-object header preceding the property stream
    pub fn read_object_header(&mut self) -> Result<()> {
        if self.ar.ver.is_ue3() && self.ar.ver.file_version >= VER_NET_INDEX {
            let _net_index = self.ar.read_i32()?;
        }
        Ok(())
    }

    pub fn read_properties(&mut self) -> Result<PropertyList> {
        property::read_properties(self.ar, self.package.names(), &self.package.summary().layout)
    }

    /// Record `size` bytes at the cursor as a lazy region and skip them
    pub fn defer_region(&mut self, size: u64) -> Result<LazyRegion> {
        let offset = self.ar.tell();
        self.ar.skip(size)?;
        Ok(LazyRegion::new(self.package.storage().clone(), offset, size))
    }

    /// Lazy array: element count and the region holding the elements.
    ///
    /// Legacy packages from version 62 prefix the array with the absolute
    /// position just past it; otherwise the size is `count * element_size`.
    pub fn read_lazy_array_region(&mut self, element_size: u64) -> Result<(i32, LazyRegion)> {
        let ue3 = self.ar.ver.is_ue3();
        if !ue3 && self.ar.ver.file_version >= VER_LAZY_ARRAY_SKIP {
            let skip_pos = self.ar.read_i32()?;
            let count = self.ar.read_compact_index()?;
            let offset = self.ar.tell();
            let end = u64::try_from(skip_pos)
                .ok()
                .filter(|&end| end >= offset)
                .ok_or_else(|| Error::eof(format!("lazy array skip position {skip_pos}")))?;
            self.ar.seek(end)?;
            let region = LazyRegion::new(self.package.storage().clone(), offset, end - offset);
            return Ok((count, region));
        }

        let count = if ue3 {
            self.ar.read_i32()?
        } else {
            self.ar.read_compact_index()?
        };
        let len = u64::try_from(count)
            .map_err(|_| Error::eof(format!("lazy array count {count}")))?;
        let region = self.defer_region(len * element_size)?;
        Ok((count, region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use crate::object::NativeObject;
    use crate::property::PropertyValue;
    use crate::testutil::{compact_index, PackageBuilder, Writer};
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Node {
        target: Option<String>,
        post_loads: Arc<AtomicUsize>,
        loaded: bool,
    }

    impl NativeObject for Node {
        fn post_load(&mut self) {
            self.loaded = true;
            self.post_loads.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct Blob {
        count: i32,
        region: LazyRegion,
    }

    impl NativeObject for Blob {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Registry where `Node` reads one reference
    fn node_classes(post_loads: &Arc<AtomicUsize>) -> ClassRegistry {
        let post_loads = post_loads.clone();
        let mut classes = ClassRegistry::new();
        classes.register_native("Node", move |ctx| {
            let target = ctx.read_object_ref()?.map(|o| o.path());
            let node: Box<dyn NativeObject> = Box::new(Node {
                target,
                post_loads: post_loads.clone(),
                loaded: false,
            });
            Ok(node)
        });
        classes
    }

    fn registry() -> Arc<PackageRegistry> {
        Arc::new(PackageRegistry::new(LoaderConfig::default()).unwrap())
    }

    fn session(registry: &Arc<PackageRegistry>, classes: ClassRegistry) -> LoadSession {
        LoadSession::new(registry.clone(), Arc::new(classes))
    }

    /// Two nodes referencing each other
    fn cycle() -> Vec<u8> {
        let mut b = PackageBuilder::ue2();
        let node = b.class("Node");
        b.export(node, 0, "A", compact_index(2));
        b.export(node, 0, "B", compact_index(1));
        b.build()
    }

    fn target(object: &Object) -> Option<String> {
        object.native::<Node>().and_then(|n| n.target.clone())
    }

    #[test]
    fn test_cycle_constructs_once() {
        let registry = registry();
        let package = registry.open_bytes("Graph", cycle()).unwrap();
        let post_loads = Arc::new(AtomicUsize::new(0));
        let mut session = session(&registry, node_classes(&post_loads));

        let a = session.load_object(&package, "A").unwrap().unwrap();
        assert_eq!(post_loads.load(Ordering::SeqCst), 2);
        assert_eq!(session.depth(), 0);

        let b = package.cached_object(1).unwrap();
        assert_eq!(target(&a).as_deref(), Some("Graph.B"));
        assert_eq!(target(&b).as_deref(), Some("Graph.A"));
        assert!(a.native::<Node>().unwrap().loaded);
        assert!(b.native::<Node>().unwrap().loaded);

        // resolving again reuses the cached objects
        let again = session.load_export(&package, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(post_loads.load(Ordering::SeqCst), 2);
        assert!(session.warnings().is_empty());
    }

    #[test]
    fn test_post_load_waits_for_outermost_end() {
        let registry = registry();
        let package = registry.open_bytes("Graph", cycle()).unwrap();
        let post_loads = Arc::new(AtomicUsize::new(0));
        let mut session = session(&registry, node_classes(&post_loads));

        session.begin_load();
        session.begin_load();
        session.begin_load();
        let a = session.load_export(&package, 0).unwrap();
        assert!(!a.is_pending());
        assert_eq!(post_loads.load(Ordering::SeqCst), 0);

        session.end_load();
        assert_eq!(post_loads.load(Ordering::SeqCst), 0);
        session.end_load();
        assert_eq!(post_loads.load(Ordering::SeqCst), 0);
        session.end_load();
        assert_eq!(post_loads.load(Ordering::SeqCst), 2);

        // unbalanced end is ignored
        session.end_load();
        assert_eq!(session.depth(), 0);
        assert_eq!(post_loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_class_becomes_placeholder() {
        let mut b = PackageBuilder::ue2();
        let node = b.class("Node");
        let mystery = b.class("Mystery");
        b.export(node, 0, "First", compact_index(0));
        b.export(mystery, 0, "Second", vec![1, 2, 3]);
        b.export(node, 0, "Third", compact_index(1));
        b.export(mystery, 0, "Fourth", vec![4, 5]);

        let registry = registry();
        let package = registry.open_bytes("Mixed", b.build()).unwrap();
        let post_loads = Arc::new(AtomicUsize::new(0));
        let mut session = session(&registry, node_classes(&post_loads));

        let objects = session.load_all_exports(&package).unwrap();
        assert_eq!(objects.len(), 4);
        assert!(objects[0].native::<Node>().is_some());
        assert!(objects[1].is_placeholder());
        assert_eq!(target(&objects[2]).as_deref(), Some("Mixed.First"));
        assert_eq!(
            &objects[1].region().unwrap().bytes().unwrap()[..],
            &[1, 2, 3]
        );

        assert_eq!(
            session.warnings(),
            &[Warning::UnknownClass {
                class: "Mystery".into()
            }]
        );
        assert_eq!(post_loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cross_package_import() {
        let mut textures = PackageBuilder::ue2();
        let texture = textures.class("Texture");
        let mut w = Writer::new(false);
        w.compact(0);
        textures.export(texture, 0, "Rock", w.buf);

        let mut level = PackageBuilder::ue2();
        let node = level.class("Node");
        let pkg = level.import("Core", "Package", 0, "Textures");
        let rock = level.import("Engine", "Texture", pkg, "Rock");
        let absent = level.import("Core", "Package", 0, "Absent");
        let ghost = level.import("Engine", "Texture", absent, "Ghost");
        let missing = level.import("Engine", "Texture", pkg, "Missing");
        level.export(node, 0, "ToRock", compact_index(rock));
        level.export(node, 0, "ToGhost", compact_index(ghost));
        level.export(node, 0, "ToGhostAgain", compact_index(ghost));
        level.export(node, 0, "ToMissing", compact_index(missing));

        let registry = registry();
        registry.open_bytes("Textures", textures.build()).unwrap();
        let package = registry.open_bytes("Level", level.build()).unwrap();

        let post_loads = Arc::new(AtomicUsize::new(0));
        let mut classes = node_classes(&post_loads);
        classes.register("Texture", ClassDecoder::TaggedProperties);
        let mut session = session(&registry, classes);

        let objects = session.load_all_exports(&package).unwrap();
        assert_eq!(target(&objects[0]).as_deref(), Some("Textures.Rock"));
        assert_eq!(target(&objects[1]), None);
        assert_eq!(target(&objects[3]), None);

        let rock = registry.get("Textures").unwrap().cached_object(0).unwrap();
        assert!(rock.properties().unwrap().is_empty());

        assert_eq!(
            session.warnings(),
            &[
                Warning::MissingPackage {
                    package: "Absent".into()
                },
                Warning::MissingImport {
                    package: "Textures".into(),
                    object: "Textures.Missing".into()
                },
            ]
        );

        let err = session
            .resolve(&package, ObjectRef::from_raw(ghost))
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedImportPackage(ref p) if p == "Absent"));
        assert!(session
            .resolve(&package, ObjectRef::from_raw(pkg))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_decode_failures_are_recorded() {
        let mut b = PackageBuilder::ue2();
        let node = b.class("Node");
        // continuation bit with nothing after it
        b.export(node, 0, "Short", vec![0x40]);
        let mut body = compact_index(0);
        body.extend_from_slice(&[9, 9, 9]);
        b.export(node, 0, "Long", body);
        b.export(node, 0, "Dangling", compact_index(40));

        let registry = registry();
        let package = registry.open_bytes("Faulty", b.build()).unwrap();
        let mut session = session(&registry, node_classes(&Arc::new(AtomicUsize::new(0))));
        let objects = session.load_all_exports(&package).unwrap();

        assert!(objects[0].is_placeholder());
        assert!(objects[1].native::<Node>().is_some());
        assert!(objects[2].is_placeholder());

        let warnings = session.take_warnings();
        assert_eq!(warnings.len(), 3);
        assert!(matches!(&warnings[0], Warning::DecodeFailed { object, .. } if object == "Faulty.Short"));
        assert_eq!(
            warnings[1],
            Warning::UnreadBytes {
                object: "Faulty.Long".into(),
                bytes: 3
            }
        );
        assert!(matches!(&warnings[2], Warning::DecodeFailed { message, .. } if message.contains("40")));
        assert!(session.warnings().is_empty());
    }

    #[test]
    fn test_unreadable_storage_leaves_placeholder() {
        let mut b = PackageBuilder::ue2();
        let node = b.class("Node");
        b.export(node, 0, "Orphan", compact_index(0));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Gone.u");
        std::fs::write(&path, b.build()).unwrap();

        let registry = registry();
        let package = registry.open_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut session = session(&registry, node_classes(&Arc::new(AtomicUsize::new(0))));
        assert!(matches!(session.load_export(&package, 0), Err(Error::Io(_))));
        let object = package.cached_object(0).unwrap();
        assert!(!object.is_pending());
        assert!(object.is_placeholder());
    }

    #[test]
    fn test_ue3_tagged_properties() {
        let mut b = PackageBuilder::ue3();
        let actor = b.class("Actor");
        let mut w = Writer::new(false);
        w.i32(-1);
        w.i32(b.name("Health")).i32(0);
        w.i32(b.name("IntProperty")).i32(0);
        w.i32(4).i32(0).i32(75);
        w.i32(0).i32(0);
        b.export(actor, 0, "Hero", w.buf);
        b.export(actor, 0, "Default__Actor", vec![0; 4]);

        let registry = registry();
        let package = registry.open_bytes("Heroes", b.build()).unwrap();
        let mut session = session(&registry, ClassRegistry::tagged_fallback());
        let objects = session.load_all_exports(&package).unwrap();

        assert_eq!(objects.len(), 1);
        let props = objects[0].properties().unwrap();
        assert_eq!(props.get("Health"), Some(&PropertyValue::Int(75)));
        assert!(session.warnings().is_empty());
        assert!(package.cached_object(1).is_none());
    }

    #[test]
    fn test_suppressed_class_skips_decoding() {
        let mut b = PackageBuilder::ue2();
        let sound = b.class("Sound");
        b.export(sound, 0, "Boom", vec![0xFF; 8]);

        let registry = Arc::new(
            PackageRegistry::new(LoaderConfig {
                suppressed_classes: vec!["sound".into()],
                ..Default::default()
            })
            .unwrap(),
        );
        let package = registry.open_bytes("Sounds", b.build()).unwrap();
        let mut session = session(&registry, ClassRegistry::tagged_fallback());
        let objects = session.load_all_exports(&package).unwrap();
        assert!(objects[0].is_placeholder());
        assert!(session.warnings().is_empty());
    }

    #[test]
    fn test_lazy_array_region() {
        let build = |skip_pos: i32| {
            let mut b = PackageBuilder::ue2();
            let blob = b.class("Blob");
            let mut w = Writer::new(false);
            w.i32(skip_pos).compact(3).bytes(&[10, 11, 20, 21, 30, 31]);
            b.export(blob, 0, "Data", w.buf);
            b.build()
        };
        let first_pass = registry().open_bytes("Blobs", build(0)).unwrap();
        let start = first_pass.exports()[0].serial_offset;

        let mut classes = ClassRegistry::new();
        classes.register_native("Blob", |ctx| {
            let (count, region) = ctx.read_lazy_array_region(2)?;
            let blob: Box<dyn NativeObject> = Box::new(Blob { count, region });
            Ok(blob)
        });
        let registry = registry();
        let package = registry
            .open_bytes("Blobs", build(start as i32 + 11))
            .unwrap();
        let mut session = session(&registry, classes);
        let data = session.load_object(&package, "data").unwrap().unwrap();

        let blob = data.native::<Blob>().unwrap();
        assert_eq!(blob.count, 3);
        assert_eq!(blob.region.offset(), start + 5);
        assert!(!blob.region.is_loaded());
        assert_eq!(&blob.region.bytes().unwrap()[..], &[10, 11, 20, 21, 30, 31]);
        assert!(session.warnings().is_empty());
    }

    #[test]
    fn test_cancelled_session() {
        let registry = registry();
        let package = registry.open_bytes("Graph", cycle()).unwrap();
        let mut session = session(&registry, node_classes(&Arc::new(AtomicUsize::new(0))));
        registry.cancel_token().cancel();
        let err = session.load_all_exports(&package).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(package.cached_object(0).is_none());
        assert_eq!(session.depth(), 0);
    }

    #[test]
    fn test_warning_display() {
        let warning = Warning::UnreadBytes {
            object: "Pkg.Obj".into(),
            bytes: 12,
        };
        assert_eq!(warning.to_string(), "12 bytes left unread in Pkg.Obj");
        let json = serde_json::to_value(Warning::UnknownClass {
            class: "Foo".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "unknown_class");
    }
}
