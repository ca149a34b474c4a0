//! Resolved objects
//!
//! Every export resolves to one shared [`Object`]. The object is cached in its
//! package before its data is decoded, so references that loop back to it
//! while it is still decoding see the same instance in the `Pending` state.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

use crate::bulk::LazyRegion;
use crate::package::DecodedPackage;
use crate::property::PropertyList;
use crate::reference::ObjectRef;

/// Class-specific object produced by a native decoder
pub trait NativeObject: Any + Send + Sync + std::fmt::Debug {
    /// Runs once, after the outermost load transaction that created the object ends
    fn post_load(&mut self) {}

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Default)]
pub enum ObjectData {
    /// Constructed, not yet decoded
    #[default]
    Pending,
    Native(Box<dyn NativeObject>),
    Properties(PropertyList),
    /// Class could not be decoded; the raw window is kept
    Placeholder(LazyRegion),
}

pub struct Object {
    package: Weak<DecodedPackage>,
    export_index: usize,
    name: String,
    class_name: String,
    data: RwLock<ObjectData>,
}

impl Object {
    pub(crate) fn new(
        package: &Arc<DecodedPackage>,
        export_index: usize,
        name: String,
        class_name: String,
    ) -> Self {
        Self {
            package: Arc::downgrade(package),
            export_index,
            name,
            class_name,
            data: RwLock::new(ObjectData::Pending),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn export_index(&self) -> usize {
        self.export_index
    }

    /// Owning package, while it is still registered or otherwise held
    pub fn package(&self) -> Option<Arc<DecodedPackage>> {
        self.package.upgrade()
    }

    /// `Package.Outer.Name`
    pub fn path(&self) -> String {
        self.package()
            .and_then(|p| p.object_path(ObjectRef::Export(self.export_index)).ok())
            .unwrap_or_else(|| self.name.clone())
    }

    pub fn data(&self) -> RwLockReadGuard<'_, ObjectData> {
        self.data.read()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.data.read(), ObjectData::Pending)
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(*self.data.read(), ObjectData::Placeholder(_))
    }

    pub fn properties(&self) -> Option<MappedRwLockReadGuard<'_, PropertyList>> {
        RwLockReadGuard::try_map(self.data.read(), |d| match d {
            ObjectData::Properties(props) => Some(props),
            _ => None,
        })
        .ok()
    }

    /// Native payload downcast to its concrete type
    pub fn native<T: NativeObject>(&self) -> Option<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.data.read(), |d| match d {
            ObjectData::Native(native) => native.as_any().downcast_ref::<T>(),
            _ => None,
        })
        .ok()
    }

    /// Raw window of a placeholder
    pub fn region(&self) -> Option<LazyRegion> {
        match &*self.data.read() {
            ObjectData::Placeholder(region) => Some(region.clone()),
            _ => None,
        }
    }

    pub(crate) fn set_data(&self, data: ObjectData) {
        *self.data.write() = data;
    }

    pub(crate) fn post_load(&self) {
        if let ObjectData::Native(native) = &mut *self.data.write() {
            native.post_load();
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("name", &self.name)
            .field("class", &self.class_name)
            .field("export_index", &self.export_index)
            .finish()
    }
}
