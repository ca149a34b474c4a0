//! Generic tagged-property reader
//!
//! A property stream is a sequence of self-describing tags, each followed by
//! its payload, terminated by a tag named `None`. UE1/UE2 pack type, size and
//! array flag into one info byte:
//!
//! ```text
//! bit  7    array flag (bool value for BoolProperty)
//! bits 4-6  size code: 1, 2, 4, 12, 16 bytes, or a following u8 / u16 / i32
//! bits 0-3  type
//! ```
//!
//! UE3 tags spell the type and size out: `FName name, FName type, i32 size,
//! i32 arrayIndex` plus type-specific extras.
//!
//! Payloads whose typed read does not consume exactly the declared size are
//! kept as raw bytes.

use serde::Serialize;

use crate::archive::Archive;
use crate::quirks::FieldLayout;
use crate::reference::ObjectRef;
use crate::tables::{FName, NameTable};
use crate::{Error, Result};

const NONE: &str = "None";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum PropertyValue {
    Byte(u8),
    Enum { enum_name: String, value: String },
    Int(i32),
    Bool(bool),
    Float(f32),
    Object(ObjectRef),
    Name(String),
    Str(String),
    Vector([f32; 3]),
    Rotator([i32; 3]),
    Struct { struct_name: String, data: Vec<u8> },
    Array { count: i32, data: Vec<u8> },
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Property {
    pub name: String,
    pub type_name: String,
    pub array_index: u32,
    pub size: u64,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PropertyList {
    properties: Vec<Property>,
}

impl PropertyList {
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Property> {
        self.properties.iter()
    }

    /// First element of a property, by case-insensitive name
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.get_indexed(name, 0)
    }

    pub fn get_indexed(&self, name: &str, array_index: u32) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|p| p.array_index == array_index && p.name.eq_ignore_ascii_case(name))
            .map(|p| &p.value)
    }

    fn push(&mut self, property: Property) {
        self.properties.push(property);
    }
}

impl<'a> IntoIterator for &'a PropertyList {
    type Item = &'a Property;
    type IntoIter = std::slice::Iter<'a, Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug)]
struct Tag {
    name: String,
    type_name: String,
    /// UE1/UE2 type code
    code: Option<u8>,
    size: u64,
    array_index: u32,
    struct_name: Option<String>,
    bool_value: Option<bool>,
    enum_name: Option<String>,
}

/// Read properties until `None`. Reaching the end of the window first is
/// [`Error::TruncatedPropertyStream`].
pub fn read_properties(
    ar: &mut Archive,
    names: &NameTable,
    layout: &FieldLayout,
) -> Result<PropertyList> {
    let mut list = PropertyList::default();
    loop {
        let read = list.len();
        let tag = if layout.is_ue3() {
            read_tag_ue3(ar, names, layout)
        } else {
            read_tag_legacy(ar, names)
        };
        let Some(tag) = tag.map_err(|e| truncated(e, read))? else {
            break;
        };

        let start = ar.tell();
        let end = start + tag.size;
        if end > ar.limit() {
            return Err(Error::TruncatedPropertyStream { read });
        }
        let value = read_value(ar, &tag, names, layout)?;
        ar.seek(end)?;

        tracing::trace!(name = %tag.name, kind = %tag.type_name, size = tag.size, "property");
        list.push(Property {
            name: tag.name,
            type_name: tag.type_name,
            array_index: tag.array_index,
            size: tag.size,
            value,
        });
    }
    Ok(list)
}

fn truncated(err: Error, read: usize) -> Error {
    match err {
        Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Error::TruncatedPropertyStream { read }
        }
        other => other,
    }
}

fn read_name(ar: &mut Archive, names: &NameTable) -> Result<String> {
    names.resolve(FName::read(ar)?)
}

fn legacy_type_name(code: u8) -> String {
    match code {
        1 => "ByteProperty",
        2 => "IntProperty",
        3 => "BoolProperty",
        4 => "FloatProperty",
        5 => "ObjectProperty",
        6 => "NameProperty",
        8 => "ClassProperty",
        9 => "ArrayProperty",
        10 => "StructProperty",
        13 => "StrProperty",
        14 => "MapProperty",
        15 => "FixedArrayProperty",
        other => return format!("Type{other}"),
    }
    .to_string()
}

fn read_array_index(ar: &mut Archive) -> Result<u32> {
    let b0 = ar.read_u8()? as u32;
    if b0 & 0x80 == 0 {
        return Ok(b0);
    }
    let b1 = ar.read_u8()? as u32;
    if b0 & 0xC0 == 0x80 {
        return Ok(((b0 << 8) | b1) & 0x3FFF);
    }
    let b2 = ar.read_u8()? as u32;
    let b3 = ar.read_u8()? as u32;
    Ok(((b0 << 24) | (b1 << 16) | (b2 << 8) | b3) & 0x3F_FFFF)
}

fn read_tag_legacy(ar: &mut Archive, names: &NameTable) -> Result<Option<Tag>> {
    let name = read_name(ar, names)?;
    if name.eq_ignore_ascii_case(NONE) {
        return Ok(None);
    }
    let info = ar.read_u8()?;
    let code = info & 0x0F;
    let high_bit = info & 0x80 != 0;

    let struct_name = if code == 10 {
        Some(read_name(ar, names)?)
    } else {
        None
    };
    let size = match (info >> 4) & 0x07 {
        0 => 1,
        1 => 2,
        2 => 4,
        3 => 12,
        4 => 16,
        5 => ar.read_u8()? as u64,
        6 => ar.read_u16()? as u64,
        _ => {
            let size = ar.read_i32()?;
            u64::try_from(size).map_err(|_| Error::eof(format!("property size {size}")))?
        }
    };

    let (size, bool_value, array_index) = if code == 3 {
        (0, Some(high_bit), 0)
    } else if high_bit {
        (size, None, read_array_index(ar)?)
    } else {
        (size, None, 0)
    };

    Ok(Some(Tag {
        name,
        type_name: legacy_type_name(code),
        code: Some(code),
        size,
        array_index,
        struct_name,
        bool_value,
        enum_name: None,
    }))
}

fn read_tag_ue3(ar: &mut Archive, names: &NameTable, layout: &FieldLayout) -> Result<Option<Tag>> {
    let name = read_name(ar, names)?;
    if name.eq_ignore_ascii_case(NONE) {
        return Ok(None);
    }
    let type_name = read_name(ar, names)?;
    let size = ar.read_i32()?;
    let size = u64::try_from(size).map_err(|_| Error::eof(format!("property size {size}")))?;
    let array_index = ar.read_i32()? as u32;

    let mut tag = Tag {
        name,
        type_name,
        code: None,
        size,
        array_index,
        struct_name: None,
        bool_value: None,
        enum_name: None,
    };
    match tag.type_name.as_str() {
        "StructProperty" => tag.struct_name = Some(read_name(ar, names)?),
        "BoolProperty" => {
            let value = if layout.property_bool_is_byte() {
                ar.read_u8()? != 0
            } else {
                ar.read_i32()? != 0
            };
            tag.bool_value = Some(value);
        }
        "ByteProperty" if layout.property_has_enum_name() => {
            tag.enum_name = Some(read_name(ar, names)?);
        }
        _ => {}
    }
    Ok(Some(tag))
}

/// Decode the payload at the cursor, falling back to raw bytes
fn read_value(
    ar: &mut Archive,
    tag: &Tag,
    names: &NameTable,
    layout: &FieldLayout,
) -> Result<PropertyValue> {
    if let Some(value) = tag.bool_value {
        return Ok(PropertyValue::Bool(value));
    }
    let start = ar.tell();
    let end = start + tag.size;
    let typed = ar.with_window(start, tag.size, |ar| {
        let value = if layout.is_ue3() {
            read_typed_ue3(ar, tag, names)?
        } else {
            read_typed_legacy(ar, tag, names)?
        };
        Ok((value, ar.tell()))
    });

    match typed {
        Ok((Some(value), pos)) if pos == end => return Ok(value),
        Ok((None, _)) => {}
        Ok((Some(_), pos)) => tracing::warn!(
            property = %tag.name,
            kind = %tag.type_name,
            declared = tag.size,
            consumed = pos - start,
            "property size mismatch, keeping raw bytes"
        ),
        Err(e) => tracing::warn!(
            property = %tag.name,
            kind = %tag.type_name,
            error = %e,
            "property decode failed, keeping raw bytes"
        ),
    }
    ar.seek(start)?;
    Ok(PropertyValue::Raw(ar.read_bytes(tag.size as usize)?))
}

fn read_struct(ar: &mut Archive, tag: &Tag) -> Result<PropertyValue> {
    let struct_name = tag.struct_name.clone().unwrap_or_default();
    Ok(match struct_name.to_ascii_lowercase().as_str() {
        "vector" => PropertyValue::Vector([ar.read_f32()?, ar.read_f32()?, ar.read_f32()?]),
        "rotator" => PropertyValue::Rotator([ar.read_i32()?, ar.read_i32()?, ar.read_i32()?]),
        _ => PropertyValue::Struct {
            struct_name,
            data: ar.read_bytes(tag.size as usize)?,
        },
    })
}

fn read_rest(ar: &mut Archive) -> Result<Vec<u8>> {
    let rest = ar.remaining() as usize;
    ar.read_bytes(rest)
}

fn read_typed_legacy(ar: &mut Archive, tag: &Tag, names: &NameTable) -> Result<Option<PropertyValue>> {
    let value = match tag.code.unwrap_or(0) {
        1 => PropertyValue::Byte(ar.read_u8()?),
        2 => PropertyValue::Int(ar.read_i32()?),
        4 => PropertyValue::Float(ar.read_f32()?),
        5 | 8 => PropertyValue::Object(ObjectRef::from_raw(ar.read_compact_index()?)),
        6 => PropertyValue::Name(read_name(ar, names)?),
        9 => PropertyValue::Array {
            count: ar.read_compact_index()?,
            data: read_rest(ar)?,
        },
        10 => read_struct(ar, tag)?,
        13 => PropertyValue::Str(ar.read_compact_string()?),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn read_typed_ue3(ar: &mut Archive, tag: &Tag, names: &NameTable) -> Result<Option<PropertyValue>> {
    let value = match tag.type_name.as_str() {
        "ByteProperty" => match &tag.enum_name {
            Some(enum_name) if tag.size != 1 && !enum_name.eq_ignore_ascii_case(NONE) => {
                PropertyValue::Enum {
                    enum_name: enum_name.clone(),
                    value: read_name(ar, names)?,
                }
            }
            _ => PropertyValue::Byte(ar.read_u8()?),
        },
        "IntProperty" => PropertyValue::Int(ar.read_i32()?),
        "FloatProperty" => PropertyValue::Float(ar.read_f32()?),
        "ObjectProperty" | "ClassProperty" | "ComponentProperty" | "InterfaceProperty" => {
            PropertyValue::Object(ObjectRef::from_raw(ar.read_i32()?))
        }
        "NameProperty" => PropertyValue::Name(read_name(ar, names)?),
        "StrProperty" => PropertyValue::Str(ar.read_fstring()?),
        "StructProperty" => read_struct(ar, tag)?,
        "ArrayProperty" => PropertyValue::Array {
            count: ar.read_i32()?,
            data: read_rest(ar)?,
        },
        _ => return Ok(None),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quirks::QuirkTable;
    use crate::tables::NameEntry;
    use crate::testutil::Writer;

    const NAMES: &[&str] = &[
        "None", "Health", "Speed", "Enabled", "Owner", "Tag", "Location", "Vector", "Title",
        "Mystery", "Facing", "Rotator", "Items", "IntProperty", "BoolProperty", "ByteProperty",
        "EMood", "Happy", "StructProperty", "ArrayProperty", "StrProperty", "MapProperty",
        "FloatProperty",
    ];

    fn idx(name: &str) -> i32 {
        NAMES.iter().position(|n| *n == name).unwrap() as i32
    }

    fn names() -> NameTable {
        NameTable::new(
            NAMES
                .iter()
                .map(|n| NameEntry {
                    name: n.to_string(),
                    flags: 0,
                })
                .collect(),
        )
    }

    fn read(data: Vec<u8>, file_version: u16) -> Result<(PropertyList, Archive)> {
        let layout = QuirkTable::empty().resolve(file_version, 0);
        let mut ar = Archive::from_bytes(data);
        ar.ver = layout.version_info();
        let props = read_properties(&mut ar, &names(), &layout)?;
        Ok((props, ar))
    }

    /// Legacy tag header: name and info byte
    fn legacy(w: &mut Writer, name: &str, info: u8) {
        w.compact(idx(name)).u8(info);
    }

    fn ue3_name(w: &mut Writer, name: &str) {
        w.i32(idx(name)).i32(0);
    }

    fn ue3_tag(w: &mut Writer, name: &str, kind: &str, size: i32) {
        ue3_name(w, name);
        ue3_name(w, kind);
        w.i32(size).i32(0);
    }

    #[test]
    fn test_legacy_typed_values() {
        let mut w = Writer::new(false);
        legacy(&mut w, "Health", 0x22);
        w.i32(100);
        legacy(&mut w, "Speed", 0x24);
        w.f32(1.5);
        legacy(&mut w, "Enabled", 0x83);
        legacy(&mut w, "Owner", 0x05);
        w.compact(-3);
        legacy(&mut w, "Tag", 0x06);
        w.compact(idx("Happy"));
        legacy(&mut w, "Location", 0x3A);
        w.compact(idx("Vector"));
        w.f32(1.0).f32(2.0).f32(3.0);
        legacy(&mut w, "Title", 0x5D);
        w.u8(5).compact(4).bytes(b"abc\0");
        // second element of Health
        legacy(&mut w, "Health", 0xA2);
        w.u8(3).i32(7);
        w.compact(0);

        let (props, ar) = read(w.buf, 128).unwrap();
        assert!(ar.at_stopper());
        assert_eq!(props.len(), 8);
        assert_eq!(props.get("health"), Some(&PropertyValue::Int(100)));
        assert_eq!(props.get_indexed("Health", 3), Some(&PropertyValue::Int(7)));
        assert_eq!(props.get("Speed"), Some(&PropertyValue::Float(1.5)));
        assert_eq!(props.get("Enabled"), Some(&PropertyValue::Bool(true)));
        assert_eq!(
            props.get("Owner"),
            Some(&PropertyValue::Object(ObjectRef::Import(2)))
        );
        assert_eq!(props.get("Tag"), Some(&PropertyValue::Name("Happy".into())));
        assert_eq!(
            props.get("Location"),
            Some(&PropertyValue::Vector([1.0, 2.0, 3.0]))
        );
        assert_eq!(props.get("Title"), Some(&PropertyValue::Str("abc".into())));
    }

    #[test]
    fn test_unknown_type_skips_declared_size() {
        for (info, size_bytes, size) in [
            (0x5Cu8, vec![0u8], 0usize),
            (0x2C, vec![], 4),
            (0x5C, vec![37], 37),
        ] {
            let mut w = Writer::new(false);
            legacy(&mut w, "Mystery", info);
            w.bytes(&size_bytes);
            w.bytes(&vec![0xEE; size]);
            legacy(&mut w, "Health", 0x22);
            w.i32(42);
            w.compact(0);

            let (props, ar) = read(w.buf, 128).unwrap();
            assert!(ar.at_stopper(), "size {size}");
            assert_eq!(props.len(), 2);
            assert_eq!(props.get("Mystery"), Some(&PropertyValue::Raw(vec![0xEE; size])));
            assert_eq!(props.get("Health"), Some(&PropertyValue::Int(42)));
        }
    }

    #[test]
    fn test_missized_value_kept_raw() {
        let mut w = Writer::new(false);
        // IntProperty declared as 1 byte
        legacy(&mut w, "Health", 0x02);
        w.u8(9);
        legacy(&mut w, "Speed", 0x24);
        w.f32(2.0);
        w.compact(0);

        let (props, _) = read(w.buf, 128).unwrap();
        assert_eq!(props.get("Health"), Some(&PropertyValue::Raw(vec![9])));
        assert_eq!(props.get("Speed"), Some(&PropertyValue::Float(2.0)));
    }

    #[test]
    fn test_missing_terminator() {
        let mut w = Writer::new(false);
        legacy(&mut w, "Health", 0x22);
        w.i32(1);
        let err = read(w.buf, 128).unwrap_err();
        assert!(matches!(err, Error::TruncatedPropertyStream { read: 1 }));

        let mut w = Writer::new(false);
        legacy(&mut w, "Health", 0x72);
        w.i32(1000);
        let err = read(w.buf, 128).unwrap_err();
        assert!(matches!(err, Error::TruncatedPropertyStream { read: 0 }));
    }

    #[test]
    fn test_wide_array_indices() {
        let mut w = Writer::new(false);
        legacy(&mut w, "Health", 0xA2);
        w.u8(0x81).u8(0x05).i32(1);
        legacy(&mut w, "Health", 0xA2);
        w.u8(0xC0).u8(0x01).u8(0x00).u8(0x02).i32(2);
        w.compact(0);

        let (props, _) = read(w.buf, 128).unwrap();
        assert_eq!(props.get_indexed("Health", 0x105), Some(&PropertyValue::Int(1)));
        assert_eq!(props.get_indexed("Health", 0x10002), Some(&PropertyValue::Int(2)));
    }

    #[test]
    fn test_ue3_tags() {
        let mut w = Writer::new(false);
        ue3_tag(&mut w, "Health", "IntProperty", 4);
        w.i32(-5);
        ue3_tag(&mut w, "Enabled", "BoolProperty", 0);
        w.u8(1);
        ue3_tag(&mut w, "Tag", "ByteProperty", 8);
        ue3_name(&mut w, "EMood");
        ue3_name(&mut w, "Happy");
        ue3_tag(&mut w, "Facing", "StructProperty", 12);
        ue3_name(&mut w, "Rotator");
        w.i32(0).i32(16384).i32(0);
        ue3_tag(&mut w, "Items", "ArrayProperty", 12);
        w.i32(2).i32(10).i32(20);
        ue3_tag(&mut w, "Title", "StrProperty", 8);
        w.fstring("abc");
        ue3_tag(&mut w, "Mystery", "MapProperty", 3);
        w.bytes(&[1, 2, 3]);
        ue3_name(&mut w, "None");

        let (props, ar) = read(w.buf, 700).unwrap();
        assert!(ar.at_stopper());
        assert_eq!(props.get("Health"), Some(&PropertyValue::Int(-5)));
        assert_eq!(props.get("Enabled"), Some(&PropertyValue::Bool(true)));
        assert_eq!(
            props.get("Tag"),
            Some(&PropertyValue::Enum {
                enum_name: "EMood".into(),
                value: "Happy".into()
            })
        );
        assert_eq!(
            props.get("Facing"),
            Some(&PropertyValue::Rotator([0, 16384, 0]))
        );
        let Some(PropertyValue::Array { count, data }) = props.get("Items") else {
            panic!("Items is not an array");
        };
        assert_eq!(*count, 2);
        assert_eq!(data.len(), 8);
        assert_eq!(props.get("Title"), Some(&PropertyValue::Str("abc".into())));
        assert_eq!(props.get("Mystery"), Some(&PropertyValue::Raw(vec![1, 2, 3])));
    }

    #[test]
    fn test_ue3_wide_bool_before_673() {
        let mut w = Writer::new(false);
        // i32 bool, no enum name
        ue3_tag(&mut w, "Enabled", "BoolProperty", 0);
        w.i32(1);
        ue3_tag(&mut w, "Tag", "ByteProperty", 1);
        w.u8(4);
        ue3_name(&mut w, "None");

        let (props, ar) = read(w.buf, 500).unwrap();
        assert!(ar.at_stopper());
        assert_eq!(props.get("Enabled"), Some(&PropertyValue::Bool(true)));
        assert_eq!(props.get("Tag"), Some(&PropertyValue::Byte(4)));
    }

    #[test]
    fn test_bad_name_index() {
        let mut w = Writer::new(false);
        w.compact(999);
        let err = read(w.buf, 128).unwrap_err();
        assert!(matches!(err, Error::BadNameIndex { index: 999, .. }));
    }

    #[test]
    fn test_json_serialization() {
        let mut w = Writer::new(false);
        legacy(&mut w, "Health", 0x22);
        w.i32(100);
        w.compact(0);
        let (props, _) = read(w.buf, 128).unwrap();
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json[0]["name"], "Health");
        assert_eq!(json[0]["value"]["type"], "Int");
        assert_eq!(json[0]["value"]["value"], 100);
    }
}
