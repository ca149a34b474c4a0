//! Name, import and export tables
//!
//! Records hold raw name indices and raw object references; nothing is
//! resolved while loading.

use serde::Serialize;

use crate::archive::{Archive, NameEncoding};
use crate::quirks::FieldLayout;
use crate::reference::ObjectRef;
use crate::summary::PackageSummary;
use crate::{Error, Result};

/// Reference into the name table with an optional instance number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct FName {
    pub index: i32,
    /// 0 for plain names; `n` renders as `Name_{n-1}`
    pub number: i32,
}

impl FName {
    pub fn read(ar: &mut Archive) -> Result<Self> {
        let (index, number) = match ar.ver.name_encoding {
            NameEncoding::CompactIndex => (ar.read_compact_index()?, 0),
            NameEncoding::Index32 => (ar.read_i32()?, 0),
            NameEncoding::IndexNumber => (ar.read_i32()?, ar.read_i32()?),
        };
        Ok(Self { index, number })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameEntry {
    pub name: String,
    pub flags: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct NameTable {
    entries: Vec<NameEntry>,
}

impl NameTable {
    pub fn new(entries: Vec<NameEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[NameEntry] {
        &self.entries
    }

    /// Name at a raw index
    pub fn get(&self, index: i32) -> Result<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
            .map(|e| e.name.as_str())
            .ok_or(Error::BadNameIndex {
                index: index as i64,
                len: self.entries.len(),
            })
    }

    /// Render an FName, appending the instance suffix when present
    pub fn resolve(&self, name: FName) -> Result<String> {
        let base = self.get(name.index)?;
        Ok(if name.number > 0 {
            format!("{base}_{}", name.number - 1)
        } else {
            base.to_string()
        })
    }

    /// Case-insensitive index of a name
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectImport {
    pub class_package: FName,
    pub class_name: FName,
    /// Raw reference to the outer object
    pub outer: i32,
    pub object_name: FName,
}

impl ObjectImport {
    pub fn outer_ref(&self) -> ObjectRef {
        ObjectRef::from_raw(self.outer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectExport {
    pub class: i32,
    pub super_ref: i32,
    pub outer: i32,
    pub object_name: FName,
    pub archetype: i32,
    pub object_flags: u64,
    pub serial_size: u64,
    pub serial_offset: u64,
    pub export_flags: u32,
    pub package_flags: u32,
}

impl ObjectExport {
    pub fn class_ref(&self) -> ObjectRef {
        ObjectRef::from_raw(self.class)
    }

    pub fn super_ref(&self) -> ObjectRef {
        ObjectRef::from_raw(self.super_ref)
    }

    pub fn outer_ref(&self) -> ObjectRef {
        ObjectRef::from_raw(self.outer)
    }

    pub fn has_data(&self) -> bool {
        self.serial_size > 0
    }
}

/// The three tables of one package
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub names: NameTable,
    pub imports: Vec<ObjectImport>,
    pub exports: Vec<ObjectExport>,
}

fn read_table<T>(
    ar: &mut Archive,
    table: &'static str,
    offset: u64,
    count: usize,
    mut record: impl FnMut(&mut Archive) -> Result<T>,
) -> Result<Vec<T>> {
    let truncated = |read| Error::TruncatedTable {
        table,
        expected: count,
        read,
    };
    if count > 0 && offset >= ar.limit() {
        return Err(truncated(0));
    }
    ar.seek(offset).map_err(|_| truncated(0))?;

    let mut items = Vec::with_capacity(count.min(ar.remaining() as usize));
    for read in 0..count {
        match record(ar) {
            Ok(item) => items.push(item),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(truncated(read));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(items)
}

fn read_name(ar: &mut Archive, layout: &FieldLayout) -> Result<NameEntry> {
    let name = if layout.names_are_fstrings() {
        ar.read_fstring()?
    } else if layout.names_are_cstrings() {
        ar.read_cstring()?
    } else {
        ar.read_compact_string()?
    };
    let flags = if layout.has_wide_flags() {
        ar.read_u64()?
    } else {
        ar.read_u32()? as u64
    };
    Ok(NameEntry { name, flags })
}

fn read_import(ar: &mut Archive) -> Result<ObjectImport> {
    Ok(ObjectImport {
        class_package: FName::read(ar)?,
        class_name: FName::read(ar)?,
        outer: ar.read_i32()?,
        object_name: FName::read(ar)?,
    })
}

fn non_negative(value: i32, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::InvalidSummary(format!("export {what} is {value}")))
}

fn read_export(ar: &mut Archive, layout: &FieldLayout) -> Result<ObjectExport> {
    if !layout.is_ue3() {
        let class = ar.read_compact_index()?;
        let super_ref = ar.read_compact_index()?;
        let outer = ar.read_i32()?;
        let object_name = FName::read(ar)?;
        let object_flags = ar.read_u32()? as u64;
        let serial_size = non_negative(ar.read_compact_index()?, "size")?;
        let serial_offset = if serial_size > 0 {
            non_negative(ar.read_compact_index()?, "offset")?
        } else {
            0
        };
        return Ok(ObjectExport {
            class,
            super_ref,
            outer,
            object_name,
            archetype: 0,
            object_flags,
            serial_size,
            serial_offset,
            export_flags: 0,
            package_flags: 0,
        });
    }

    let class = ar.read_i32()?;
    let super_ref = ar.read_i32()?;
    let outer = ar.read_i32()?;
    let object_name = FName::read(ar)?;
    let archetype = if layout.export_has_archetype() {
        ar.read_i32()?
    } else {
        0
    };
    let mut object_flags = ar.read_u32()? as u64;
    if layout.has_wide_flags() {
        object_flags |= (ar.read_u32()? as u64) << 32;
    }
    let serial_size = non_negative(ar.read_i32()?, "size")?;
    let serial_offset = if serial_size > 0 || layout.export_always_has_offset() {
        non_negative(ar.read_i32()?, "offset")?
    } else {
        0
    };
    if layout.export_has_component_map() {
        // {FName, i32} pairs
        ar.read_array(|ar| {
            FName::read(ar)?;
            ar.read_i32()
        })?;
    }
    let export_flags = if layout.export_has_export_flags() {
        ar.read_u32()?
    } else {
        0
    };
    if layout.export_has_net_objects() {
        ar.read_array(Archive::read_i32)?;
        ar.read_guid()?;
    }
    let package_flags = if layout.export_has_package_flags() {
        ar.read_u32()?
    } else {
        0
    };
    Ok(ObjectExport {
        class,
        super_ref,
        outer,
        object_name,
        archetype,
        object_flags,
        serial_size,
        serial_offset,
        export_flags,
        package_flags,
    })
}

/// Read all three tables at the offsets the summary declares
pub fn load(ar: &mut Archive, summary: &PackageSummary) -> Result<Tables> {
    let layout = &summary.layout;
    let names = read_table(ar, "name", summary.name_offset, summary.name_count, |ar| {
        read_name(ar, layout)
    })?;
    let imports = read_table(
        ar,
        "import",
        summary.import_offset,
        summary.import_count,
        read_import,
    )?;
    let exports = read_table(
        ar,
        "export",
        summary.export_offset,
        summary.export_count,
        |ar| read_export(ar, layout),
    )?;
    tracing::debug!(
        names = names.len(),
        imports = imports.len(),
        exports = exports.len(),
        "loaded tables"
    );
    Ok(Tables {
        names: NameTable::new(names),
        imports,
        exports,
    })
}
