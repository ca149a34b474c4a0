//! Signed object references
//!
//! Positive values index the export table (`r - 1`), negative values the
//! import table (`-r - 1`), zero is null.

use serde::Serialize;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "index", rename_all = "lowercase")]
pub enum ObjectRef {
    Null,
    Export(usize),
    Import(usize),
}

impl ObjectRef {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ObjectRef::Null,
            r if r > 0 => ObjectRef::Export(r as usize - 1),
            r => ObjectRef::Import((-(r as i64) - 1) as usize),
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            ObjectRef::Null => 0,
            ObjectRef::Export(i) => i as i32 + 1,
            ObjectRef::Import(i) => -(i as i32) - 1,
        }
    }

    pub fn is_null(self) -> bool {
        self == ObjectRef::Null
    }

    /// Decode `raw` and check it against the table sizes
    pub fn checked(raw: i32, exports: usize, imports: usize) -> Result<Self> {
        let r = Self::from_raw(raw);
        match r {
            ObjectRef::Export(i) if i >= exports => Err(Error::DanglingReference {
                raw,
                table: "export",
                len: exports,
            }),
            ObjectRef::Import(i) if i >= imports => Err(Error::DanglingReference {
                raw,
                table: "import",
                len: imports,
            }),
            _ => Ok(r),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectRef::Null => f.write_str("null"),
            ObjectRef::Export(i) => write!(f, "export[{i}]"),
            ObjectRef::Import(i) => write!(f, "import[{i}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoding() {
        assert_eq!(ObjectRef::from_raw(0), ObjectRef::Null);
        assert_eq!(ObjectRef::from_raw(1), ObjectRef::Export(0));
        assert_eq!(ObjectRef::from_raw(-1), ObjectRef::Import(0));
        assert_eq!(ObjectRef::from_raw(7), ObjectRef::Export(6));
        assert_eq!(ObjectRef::from_raw(-7), ObjectRef::Import(6));
        assert_eq!(
            ObjectRef::from_raw(i32::MIN),
            ObjectRef::Import(i32::MAX as usize)
        );
        for raw in [-5, -1, 0, 1, 5] {
            assert_eq!(ObjectRef::from_raw(raw).to_raw(), raw);
        }
    }

    #[test]
    fn test_table_boundaries() {
        // 3 exports, 2 imports
        assert_eq!(ObjectRef::checked(3, 3, 2).unwrap(), ObjectRef::Export(2));
        assert!(matches!(
            ObjectRef::checked(4, 3, 2),
            Err(Error::DanglingReference { raw: 4, table: "export", len: 3 })
        ));
        assert_eq!(ObjectRef::checked(-2, 3, 2).unwrap(), ObjectRef::Import(1));
        assert!(matches!(
            ObjectRef::checked(-3, 3, 2),
            Err(Error::DanglingReference { raw: -3, table: "import", len: 2 })
        ));
        assert_eq!(ObjectRef::checked(0, 0, 0).unwrap(), ObjectRef::Null);
    }

    #[test]
    fn test_display() {
        assert_eq!(ObjectRef::Export(2).to_string(), "export[2]");
        assert_eq!(ObjectRef::Null.to_string(), "null");
    }
}
