//! Version-quirk table
//!
//! Summary and table layouts are uniform per engine generation and file
//! version. Licensee forks deviate in small, known ways: extra fields at fixed
//! points, masked or overridden version numbers, obfuscated table fields,
//! different chunk record order. Those deviations are data ([`QuirkRule`])
//! matched by `(fileVersion, licenseeVersion)` and folded into a resolved
//! [`FieldLayout`] that the parsers consult.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::archive::{Archive, NameEncoding, VersionInfo};
use crate::compression::{ChunkFieldOrder, Codec};
use crate::{Error, Result};

/// First UE2 file version
pub const PACKAGE_V2: u16 = 100;
/// First UE3 file version
pub const PACKAGE_V3: u16 = 180;

// Summary
const VER_GUID_GENERATIONS: u16 = 68;
const VER_ENGINE_VERSION: u16 = 245;
const VER_HEADERS_SIZE: u16 = 249;
const VER_PACKAGE_GROUP: u16 = 269;
const VER_COOKER_VERSION: u16 = 277;
const VER_NET_OBJECTS: u16 = 322;
const VER_COMPRESSION: u16 = 334;
const VER_DEPENDS_OFFSET: u16 = 415;
const VER_RESERVED_482: u16 = 482;
const VER_RESERVED_584: u16 = 584;
const VER_RESERVED_623: u16 = 623;

// Names
const VER_NAME_COMPACT_LENGTH: u16 = 64;
const VER_WIDE_FLAGS: u16 = 195;
const VER_NAME_NUMBER: u16 = 343;

// Exports
const VER_ARCHETYPE: u16 = 220;
const VER_EXPORT_FLAGS: u16 = 247;
const VER_ALWAYS_SERIAL_OFFSET: u16 = 249;
const VER_EXPORT_PACKAGE_FLAGS: u16 = 475;
const VER_NO_COMPONENT_MAP: u16 = 543;

// Tagged properties
const VER_ENUM_NAME: u16 = 633;
const VER_BOOL_BYTE: u16 = 673;

/// Package flag set on cooked packages
pub const PKG_COOKED: u32 = 0x0000_0008;
/// Package flag set on packages with a chunk table
pub const PKG_COMPRESSED: u32 = 0x0200_0000;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EngineGeneration {
    Ue1,
    Ue2,
    #[default]
    Ue3,
}

impl EngineGeneration {
    pub fn from_version(file_version: u16) -> Self {
        if file_version < PACKAGE_V2 {
            EngineGeneration::Ue1
        } else if file_version < PACKAGE_V3 {
            EngineGeneration::Ue2
        } else {
            EngineGeneration::Ue3
        }
    }
}

/// Inclusive version range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    #[serde(default)]
    pub min: u16,
    #[serde(default = "max_version")]
    pub max: u16,
}

fn max_version() -> u16 {
    u16::MAX
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::ANY
    }
}

impl VersionRange {
    pub const ANY: VersionRange = VersionRange {
        min: 0,
        max: u16::MAX,
    };

    pub const fn exact(v: u16) -> Self {
        Self { min: v, max: v }
    }

    pub const fn between(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub const fn at_least(min: u16) -> Self {
        Self { min, max: u16::MAX }
    }

    pub fn contains(&self, v: u16) -> bool {
        v >= self.min && v <= self.max
    }
}

/// One `(fileVersion, licenseeVersion)` pattern a rule matches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMatch {
    #[serde(default)]
    pub file: VersionRange,
    #[serde(default)]
    pub licensee: VersionRange,
}

impl VersionMatch {
    const fn new(file: VersionRange, licensee: VersionRange) -> Self {
        Self { file, licensee }
    }

    fn matches(&self, file_version: u16, licensee_version: u16) -> bool {
        self.file.contains(file_version) && self.licensee.contains(licensee_version)
    }
}

/// Where in the summary an extra field sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPoint {
    /// Directly after the version word
    Start,
    /// Before package flags (after the package group on UE3)
    BeforeFlags,
    AfterFlags,
    /// Between the export and import table fields
    AfterExports,
    /// After the import table fields
    AfterTables,
    /// After engine/cooker versions, before the chunk table
    BeforeCompression,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    I16,
    I32,
    I64,
    Guid,
    Fstring,
    /// i32 count followed by that many bytes
    ByteArray,
    /// i32 count of `{FString key, FString array}` pairs
    StringMap,
}

impl FieldKind {
    /// Consume one value of this kind
    pub fn skip(self, ar: &mut Archive) -> Result<()> {
        match self {
            FieldKind::I16 => ar.skip(2),
            FieldKind::I32 => ar.skip(4),
            FieldKind::I64 => ar.skip(8),
            FieldKind::Guid => ar.skip(16),
            FieldKind::Fstring => ar.read_fstring().map(drop),
            FieldKind::ByteArray => {
                let len = ar.read_i32()?;
                if len < 0 {
                    return Err(Error::InvalidSummary(format!("byte array length {len}")));
                }
                ar.skip(len as u64)
            }
            FieldKind::StringMap => {
                ar.read_array(|ar| {
                    ar.read_fstring()?;
                    ar.read_array(Archive::read_fstring)
                })?;
                Ok(())
            }
        }
    }
}

/// Unknown per-title field to consume and discard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraField {
    pub at: InsertPoint,
    pub kind: FieldKind,
    /// Only present for these licensee versions
    #[serde(default)]
    pub licensee: VersionRange,
    #[serde(default = "one")]
    pub count: u32,
}

fn one() -> u32 {
    1
}

impl ExtraField {
    const fn new(at: InsertPoint, kind: FieldKind, licensee: VersionRange, count: u32) -> Self {
        Self {
            at,
            kind,
            licensee,
            count,
        }
    }
}

/// Maps a package compression flag to a codec for titles that reuse bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecMapping {
    pub flag: u32,
    pub codec: Codec,
}

/// Overrides a rule applies on top of the base layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutPatch {
    pub generation: Option<EngineGeneration>,
    pub file_version: Option<u16>,
    pub licensee_version: Option<u16>,
    pub licensee_mask: Option<u16>,
    pub extra_fields: Vec<ExtraField>,
    pub skip_guid: bool,
    /// Package flag bits cleared right after reading the flags
    pub clear_package_flags: u32,
    /// XOR keys for the six table fields; the summary ends after them
    pub table_xor: Option<[u32; 6]>,
    /// When any of these flags are set, `nameCount` is stored as `nameCount + nameOffset`
    pub relative_name_count_flags: Option<u32>,
    pub name_encoding: Option<NameEncoding>,
    pub chunk_order: Option<ChunkFieldOrder>,
    pub codec_flags: Vec<CodecMapping>,
}

/// Per-title deviation, matched by version pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuirkRule {
    pub game: String,
    pub versions: Vec<VersionMatch>,
    /// Rule only applies when the package flags contain one of these bits
    #[serde(default)]
    pub when_flags: Option<u32>,
    #[serde(default)]
    pub layout: LayoutPatch,
}

impl QuirkRule {
    pub fn matches(&self, file_version: u16, licensee_version: u16) -> bool {
        self.versions
            .iter()
            .any(|m| m.matches(file_version, licensee_version))
    }
}

/// Resolved layout descriptor for one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub generation: EngineGeneration,
    pub game: Option<String>,
    /// Effective versions after masks and overrides
    pub file_version: u16,
    pub licensee_version: u16,
    pub extra_fields: Vec<ExtraField>,
    pub skip_guid: bool,
    pub clear_package_flags: u32,
    pub table_xor: Option<[u32; 6]>,
    pub relative_name_count_flags: Option<u32>,
    pub name_encoding: NameEncoding,
    pub chunk_order: ChunkFieldOrder,
    pub codec_flags: Vec<CodecMapping>,
}

impl FieldLayout {
    /// Layout with no quirks applied
    pub fn base(generation: EngineGeneration, file_version: u16, licensee_version: u16) -> Self {
        let name_encoding = match generation {
            EngineGeneration::Ue3 if file_version >= VER_NAME_NUMBER => NameEncoding::IndexNumber,
            EngineGeneration::Ue3 => NameEncoding::Index32,
            _ => NameEncoding::CompactIndex,
        };
        Self {
            generation,
            game: None,
            file_version,
            licensee_version,
            extra_fields: Vec::new(),
            skip_guid: false,
            clear_package_flags: 0,
            table_xor: None,
            relative_name_count_flags: None,
            name_encoding,
            chunk_order: ChunkFieldOrder::default(),
            codec_flags: Vec::new(),
        }
    }

    fn apply(&mut self, game: &str, patch: &LayoutPatch) {
        self.game = Some(game.to_string());
        if let Some(generation) = patch.generation {
            self.generation = generation;
        }
        if let Some(mask) = patch.licensee_mask {
            self.licensee_version &= mask;
        }
        if let Some(v) = patch.file_version {
            self.file_version = v;
        }
        if let Some(v) = patch.licensee_version {
            self.licensee_version = v;
        }
        let licensee = self.licensee_version;
        self.extra_fields.extend(
            patch
                .extra_fields
                .iter()
                .filter(|f| f.licensee.contains(licensee))
                .copied(),
        );
        self.skip_guid |= patch.skip_guid;
        self.clear_package_flags |= patch.clear_package_flags;
        self.table_xor = patch.table_xor.or(self.table_xor);
        self.relative_name_count_flags = patch
            .relative_name_count_flags
            .or(self.relative_name_count_flags);
        if let Some(encoding) = patch.name_encoding {
            self.name_encoding = encoding;
        }
        if let Some(order) = patch.chunk_order {
            self.chunk_order = order;
        }
        self.codec_flags.extend(patch.codec_flags.iter().copied());
    }

    pub fn is_ue3(&self) -> bool {
        self.generation == EngineGeneration::Ue3
    }

    /// Version context for archives reading this package
    pub fn version_info(&self) -> VersionInfo {
        VersionInfo {
            generation: self.generation,
            file_version: self.file_version,
            licensee_version: self.licensee_version,
            game: self.game.clone(),
            name_encoding: self.name_encoding,
        }
    }

    fn ue3_since(&self, version: u16) -> bool {
        self.is_ue3() && self.file_version >= version
    }

    /// Extra fields declared at `at`
    pub fn extras_at(&self, at: InsertPoint) -> impl Iterator<Item = &ExtraField> {
        self.extra_fields.iter().filter(move |f| f.at == at)
    }

    pub fn has_headers_size(&self) -> bool {
        self.ue3_since(VER_HEADERS_SIZE)
    }

    pub fn has_package_group(&self) -> bool {
        self.ue3_since(VER_PACKAGE_GROUP)
    }

    pub fn has_depends_offset(&self) -> bool {
        self.ue3_since(VER_DEPENDS_OFFSET)
    }

    /// Number of reserved i32 fields between the table fields and the GUID
    pub fn reserved_before_guid(&self) -> usize {
        let mut count = 0;
        if self.ue3_since(VER_RESERVED_623) {
            count += 3;
        }
        if self.ue3_since(VER_RESERVED_584) {
            count += 1;
        }
        count
    }

    /// Old layouts carry heritage fields instead of GUID and generations
    pub fn has_heritage(&self) -> bool {
        self.file_version < VER_GUID_GENERATIONS
    }

    pub fn generation_has_net_objects(&self) -> bool {
        self.ue3_since(VER_NET_OBJECTS)
    }

    pub fn has_engine_version(&self) -> bool {
        self.ue3_since(VER_ENGINE_VERSION)
    }

    pub fn has_cooker_version(&self) -> bool {
        self.ue3_since(VER_COOKER_VERSION)
    }

    pub fn has_compression(&self) -> bool {
        self.ue3_since(VER_COMPRESSION)
    }

    pub fn has_reserved_tail(&self) -> bool {
        self.ue3_since(VER_RESERVED_482)
    }

    /// Names are FStrings (UE3) rather than compact-length strings
    pub fn names_are_fstrings(&self) -> bool {
        self.is_ue3()
    }

    /// Names before version 64 are null-terminated without a length
    pub fn names_are_cstrings(&self) -> bool {
        !self.is_ue3() && self.file_version < VER_NAME_COMPACT_LENGTH
    }

    pub fn has_wide_flags(&self) -> bool {
        self.ue3_since(VER_WIDE_FLAGS)
    }

    pub fn export_has_archetype(&self) -> bool {
        self.ue3_since(VER_ARCHETYPE)
    }

    pub fn export_always_has_offset(&self) -> bool {
        self.ue3_since(VER_ALWAYS_SERIAL_OFFSET)
    }

    pub fn export_has_component_map(&self) -> bool {
        self.is_ue3() && self.file_version < VER_NO_COMPONENT_MAP
    }

    pub fn export_has_export_flags(&self) -> bool {
        self.ue3_since(VER_EXPORT_FLAGS)
    }

    pub fn export_has_net_objects(&self) -> bool {
        self.ue3_since(VER_NET_OBJECTS)
    }

    pub fn export_has_package_flags(&self) -> bool {
        self.ue3_since(VER_EXPORT_PACKAGE_FLAGS)
    }

    pub fn property_has_enum_name(&self) -> bool {
        self.ue3_since(VER_ENUM_NAME)
    }

    pub fn property_bool_is_byte(&self) -> bool {
        self.ue3_since(VER_BOOL_BYTE)
    }

    /// Codec named by package compression flags, honouring remaps
    pub fn codec_for_flags(&self, flags: u32) -> Option<Codec> {
        self.codec_flags
            .iter()
            .find(|m| flags & m.flag != 0)
            .map(|m| m.codec)
            .or_else(|| Codec::from_flags(flags))
    }
}

/// Ordered quirk rules; the first match wins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuirkTable {
    pub rules: Vec<QuirkRule>,
}

impl QuirkTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a YAML quirk document
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Quirks(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text).map_err(|e| Error::Quirks(format!("{}: {e}", path.display())))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Quirks(e.to_string()))
    }

    /// Consult `rules` before this table's own rules
    pub fn with_overrides(mut self, overrides: QuirkTable) -> Self {
        let mut rules = overrides.rules;
        rules.append(&mut self.rules);
        self.rules = rules;
        self
    }

    /// Rule for a version pair, ignoring flag-gated rules
    pub fn detect(&self, file_version: u16, licensee_version: u16) -> Option<&QuirkRule> {
        self.rules
            .iter()
            .find(|r| r.when_flags.is_none() && r.matches(file_version, licensee_version))
    }

    /// Layout for an explicit generation and version pair
    pub fn lookup(
        &self,
        generation: EngineGeneration,
        file_version: u16,
        licensee_version: u16,
    ) -> FieldLayout {
        let mut layout = FieldLayout::base(generation, file_version, licensee_version);
        if let Some(rule) = self.detect(file_version, licensee_version) {
            layout.apply(&rule.game, &rule.layout);
            // overriding versions can change the defaulted name encoding
            if rule.layout.name_encoding.is_none() {
                layout.name_encoding =
                    FieldLayout::base(layout.generation, layout.file_version, 0).name_encoding;
            }
        }
        layout
    }

    /// Layout for a version pair, detecting the generation
    pub fn resolve(&self, file_version: u16, licensee_version: u16) -> FieldLayout {
        let generation = self
            .detect(file_version, licensee_version)
            .and_then(|r| r.layout.generation)
            .unwrap_or_else(|| EngineGeneration::from_version(file_version));
        self.lookup(generation, file_version, licensee_version)
    }

    /// Apply a flag-gated rule once the package flags are known.
    /// Returns whether a rule matched.
    pub fn refine(
        &self,
        layout: &mut FieldLayout,
        raw_file_version: u16,
        raw_licensee: u16,
        package_flags: u32,
    ) -> bool {
        let rule = self.rules.iter().find(|r| {
            r.when_flags.is_some_and(|f| package_flags & f != 0)
                && r.matches(raw_file_version, raw_licensee)
        });
        match rule {
            Some(rule) => {
                layout.apply(&rule.game, &rule.layout);
                true
            }
            None => false,
        }
    }

    /// Titles known to the engine out of the box
    pub fn builtin() -> Self {
        use FieldKind::{ByteArray, StringMap, I32};
        use InsertPoint::{AfterExports, AfterTables, BeforeCompression, Start};

        let any = VersionRange::ANY;
        let exact = VersionRange::exact;
        let v = VersionMatch::new;
        let field = ExtraField::new;

        let mass_effect_extras = vec![
            field(BeforeCompression, I32, VersionRange::between(16, 135), 1),
            field(BeforeCompression, I32, VersionRange::between(32, 135), 1),
            field(BeforeCompression, StringMap, VersionRange::between(35, 112), 1),
            field(BeforeCompression, I32, VersionRange::at_least(37), 2),
            field(BeforeCompression, I32, VersionRange::between(39, 135), 2),
        ];

        let rule = |game: &str, versions: Vec<VersionMatch>, layout: LayoutPatch| QuirkRule {
            game: game.to_string(),
            versions,
            when_flags: None,
            layout,
        };

        let rules = vec![
            rule(
                "SplinterCell",
                vec![
                    v(exact(100), VersionRange::between(9, 17)),
                    v(exact(102), VersionRange::between(28, 29)),
                ],
                LayoutPatch {
                    extra_fields: vec![
                        field(AfterTables, I32, any, 1),
                        field(AfterTables, ByteArray, any, 1),
                    ],
                    ..Default::default()
                },
            ),
            QuirkRule {
                game: "Ragnarok2".into(),
                versions: vec![v(VersionRange::between(0x80, 0x87), any)],
                when_flags: Some(0x10000),
                layout: LayoutPatch {
                    table_xor: Some([
                        0xD977_90C7 ^ 0x1C,
                        0xF208_FB9F ^ 0x40,
                        0xEBBD_E077 ^ 0x04,
                        0xE292_EC62 ^ 0x0003_E9E1,
                        0x201D_A87A ^ 0x05,
                        0xA9B9_99DF ^ 0x003E_9BE,
                    ]),
                    ..Default::default()
                },
            },
            rule(
                "R6Vegas2",
                vec![v(exact(241), exact(71))],
                LayoutPatch {
                    extra_fields: vec![
                        field(Start, I32, VersionRange::at_least(48), 1),
                        field(Start, I32, VersionRange::at_least(49), 1),
                    ],
                    ..Default::default()
                },
            ),
            rule(
                "Huxley",
                vec![
                    v(exact(402), exact(0)),
                    v(exact(402), exact(10)),
                    v(exact(491), VersionRange::between(13, 16)),
                    v(exact(496), VersionRange::between(16, 23)),
                ],
                LayoutPatch {
                    extra_fields: vec![
                        field(Start, I32, VersionRange::at_least(8), 1),
                        field(Start, I32, VersionRange::at_least(17), 1),
                    ],
                    ..Default::default()
                },
            ),
            rule(
                "APB",
                vec![v(exact(547), VersionRange::between(31, 32))],
                LayoutPatch {
                    extra_fields: vec![
                        field(AfterExports, I32, VersionRange::at_least(29), 1),
                        field(AfterExports, I32, VersionRange::at_least(28), 5),
                    ],
                    ..Default::default()
                },
            ),
            rule(
                "Tera",
                vec![
                    v(exact(568), VersionRange::between(9, 10)),
                    v(exact(610), VersionRange::between(13, 14)),
                ],
                LayoutPatch {
                    file_version: Some(568),
                    relative_name_count_flags: Some(PKG_COOKED),
                    ..Default::default()
                },
            ),
            rule(
                "MortalOnline",
                vec![v(exact(678), exact(32771))],
                LayoutPatch {
                    extra_fields: vec![field(Start, I32, VersionRange::at_least(1), 1)],
                    ..Default::default()
                },
            ),
            rule(
                "Bioshock3",
                vec![v(exact(727), exact(75))],
                LayoutPatch {
                    extra_fields: vec![field(Start, I32, VersionRange::at_least(66), 1)],
                    ..Default::default()
                },
            ),
            rule(
                "MassEffect",
                vec![v(exact(391), exact(92)), v(exact(491), exact(1008))],
                LayoutPatch {
                    licensee_version: Some(90),
                    extra_fields: mass_effect_extras.clone(),
                    ..Default::default()
                },
            ),
            rule(
                "MassEffect2",
                vec![v(exact(512), exact(130))],
                LayoutPatch {
                    extra_fields: mass_effect_extras.clone(),
                    ..Default::default()
                },
            ),
            rule(
                "MassEffect3",
                vec![v(exact(684), exact(185)), v(exact(684), exact(194))],
                LayoutPatch {
                    extra_fields: mass_effect_extras,
                    ..Default::default()
                },
            ),
        ];

        Self { rules }
    }
}
