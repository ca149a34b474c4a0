//! Lazily materialized byte windows
//!
//! A [`LazyRegion`] names a range of a package's uncompressed address space
//! and reads it the first time its bytes are requested.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::package::PackageStorage;
use crate::Result;

#[derive(Clone)]
pub struct LazyRegion {
    storage: Arc<PackageStorage>,
    offset: u64,
    size: u64,
    cell: Arc<OnceCell<Arc<[u8]>>>,
}

impl LazyRegion {
    pub fn new(storage: Arc<PackageStorage>, offset: u64, size: u64) -> Self {
        Self {
            storage,
            offset,
            size,
            cell: Arc::new(OnceCell::new()),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Read the window on first call; later calls share the same buffer
    pub fn bytes(&self) -> Result<Arc<[u8]>> {
        self.cell
            .get_or_try_init(|| {
                tracing::trace!(offset = self.offset, size = self.size, "materializing region");
                self.storage
                    .read_region(self.offset, self.size)
                    .map(Arc::from)
            })
            .cloned()
    }
}

impl std::fmt::Debug for LazyRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyRegion")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
