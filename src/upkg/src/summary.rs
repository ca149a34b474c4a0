//! Package summary parser
//!
//! The summary is parsed in two steps. [`SummaryParser::read_header`] checks
//! the magic, fixes the byte order and resolves the [`FieldLayout`] from the
//! quirk table. [`SummaryParser::locate_tables`] then walks the remaining
//! fields according to that layout.
//!
//! ```text
//! u32 tag, u32 version (low 16 file, high 16 licensee)
//! [UE3] i32 headersSize, FString packageGroup
//! u32 packageFlags
//! i32 nameCount, nameOffset, exportCount, exportOffset, importCount, importOffset
//! [UE3] i32 dependsOffset, reserved
//! Guid, generations[]           (heritageCount/Offset before version 68)
//! [UE3] engineVersion, cookerVersion, compressionFlags, chunks[]
//! ```

use serde::Serialize;

use crate::archive::{Archive, Guid, VersionInfo};
use crate::compression::{Codec, CompressionChunk};
use crate::quirks::{EngineGeneration, FieldLayout, InsertPoint, QuirkTable};
use crate::{Error, Result, PACKAGE_FILE_TAG, PACKAGE_FILE_TAG_SWAPPED};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GenerationInfo {
    pub export_count: i32,
    pub name_count: i32,
    pub net_object_count: i32,
}

/// Byte offsets of summary fields rewritten when unpacking a compressed package
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FieldOffsets {
    pub package_flags: u64,
    /// Compression flags word; the chunk count follows it
    pub compression_flags: Option<u64>,
    /// End of the chunk table
    pub compression_end: Option<u64>,
}

/// Magic, byte order and resolved layout
#[derive(Debug, Clone)]
pub struct SummaryHeader {
    pub tag: u32,
    pub byte_swapped: bool,
    /// Versions as stored in the file
    pub file_version: u16,
    pub licensee_version: u16,
    pub layout: FieldLayout,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub tag: u32,
    pub byte_swapped: bool,
    pub file_version: u16,
    pub licensee_version: u16,
    pub generation: EngineGeneration,
    pub game: Option<String>,
    pub headers_size: u32,
    pub package_group: String,
    pub package_flags: u32,
    pub name_count: usize,
    pub name_offset: u64,
    pub export_count: usize,
    pub export_offset: u64,
    pub import_count: usize,
    pub import_offset: u64,
    pub depends_offset: Option<u64>,
    pub guid: Guid,
    pub generations: Vec<GenerationInfo>,
    pub engine_version: i32,
    pub cooker_version: i32,
    pub compression_flags: u32,
    pub compression_chunks: Vec<CompressionChunk>,
    #[serde(skip)]
    pub layout: FieldLayout,
    #[serde(skip)]
    pub offsets: FieldOffsets,
}

impl PackageSummary {
    pub fn is_compressed(&self) -> bool {
        !self.compression_chunks.is_empty()
    }

    /// Codec named by the compression flags, after title remaps
    pub fn flagged_codec(&self) -> Option<Codec> {
        self.layout.codec_for_flags(self.compression_flags)
    }

    /// Effective versions, as the table and property readers see them
    pub fn version_info(&self) -> VersionInfo {
        self.layout.version_info()
    }
}

#[derive(Debug, Clone, Default)]
pub enum ParseState {
    #[default]
    Unparsed,
    HeaderRead(SummaryHeader),
    TablesLocated(Box<PackageSummary>),
}

/// Parses a summary against a quirk table, one stage at a time
#[derive(Debug)]
pub struct SummaryParser<'q> {
    quirks: &'q QuirkTable,
    state: ParseState,
}

impl<'q> SummaryParser<'q> {
    pub fn new(quirks: &'q QuirkTable) -> Self {
        Self {
            quirks,
            state: ParseState::Unparsed,
        }
    }

    pub fn state(&self) -> &ParseState {
        &self.state
    }

    /// Check the magic and resolve the layout. Sets the archive's byte order
    /// and version info.
    pub fn read_header(&mut self, ar: &mut Archive) -> Result<&SummaryHeader> {
        if !matches!(self.state, ParseState::Unparsed) {
            return Err(Error::InvalidSummary("header already read".into()));
        }

        ar.seek(0)?;
        if ar.len() < 4 {
            return Err(Error::BadMagic { found: None });
        }
        let mut tag = [0u8; 4];
        ar.read(&mut tag)?;
        let byte_swapped = match u32::from_le_bytes(tag) {
            PACKAGE_FILE_TAG => false,
            PACKAGE_FILE_TAG_SWAPPED => true,
            other => return Err(Error::BadMagic { found: Some(other) }),
        };
        ar.set_byte_swap(byte_swapped);

        let version = ar.read_u32()?;
        // a chunk header's block size sits where the version word would be
        if matches!(version, PACKAGE_FILE_TAG | 0x20000 | 0x10000) {
            return Err(Error::InvalidSummary(
                "fully compressed package must be expanded first".into(),
            ));
        }
        if (version as i32) < 0 {
            return Err(Error::InvalidSummary(format!(
                "legacy version {} is not a UE1-3 package",
                version as i32
            )));
        }
        let file_version = (version & 0xFFFF) as u16;
        let licensee_version = (version >> 16) as u16;

        let layout = self.quirks.resolve(file_version, licensee_version);
        ar.ver = layout.version_info();
        tracing::debug!(
            file_version,
            licensee_version,
            generation = ?layout.generation,
            game = layout.game.as_deref().unwrap_or("-"),
            byte_swapped,
            "package header"
        );

        self.state = ParseState::HeaderRead(SummaryHeader {
            tag: PACKAGE_FILE_TAG,
            byte_swapped,
            file_version,
            licensee_version,
            layout,
        });
        match &self.state {
            ParseState::HeaderRead(header) => Ok(header),
            _ => Err(Error::InvalidSummary("parser state".into())),
        }
    }

    /// Read the remaining summary fields, leaving the cursor after the summary
    pub fn locate_tables(&mut self, ar: &mut Archive) -> Result<&PackageSummary> {
        let header = match std::mem::take(&mut self.state) {
            ParseState::HeaderRead(header) => header,
            other => {
                self.state = other;
                return Err(Error::InvalidSummary("header not read".into()));
            }
        };
        let summary = match read_fields(self.quirks, &header, ar) {
            Ok(summary) => summary,
            Err(e) => {
                self.state = ParseState::HeaderRead(header);
                return Err(e);
            }
        };
        self.state = ParseState::TablesLocated(Box::new(summary));
        match &self.state {
            ParseState::TablesLocated(summary) => Ok(summary),
            _ => Err(Error::InvalidSummary("parser state".into())),
        }
    }

    pub fn finish(self) -> Option<PackageSummary> {
        match self.state {
            ParseState::TablesLocated(summary) => Some(*summary),
            _ => None,
        }
    }
}

/// Parse a complete summary from the start of `ar`
pub fn parse(ar: &mut Archive, quirks: &QuirkTable) -> Result<PackageSummary> {
    let mut parser = SummaryParser::new(quirks);
    parser.read_header(ar)?;
    parser.locate_tables(ar)?;
    parser
        .finish()
        .ok_or_else(|| Error::InvalidSummary("parser state".into()))
}

fn skip_extras(ar: &mut Archive, layout: &FieldLayout, at: InsertPoint) -> Result<()> {
    for field in layout.extras_at(at) {
        for _ in 0..field.count {
            field.kind.skip(ar)?;
        }
    }
    Ok(())
}

fn count(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidSummary(format!("negative {what} {value}")))
}

fn offset(value: i32, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::InvalidSummary(format!("negative {what} {value}")))
}

fn read_fields(quirks: &QuirkTable, header: &SummaryHeader, ar: &mut Archive) -> Result<PackageSummary> {
    let mut layout = header.layout.clone();
    let ue3 = layout.is_ue3();
    let mut offsets = FieldOffsets::default();

    skip_extras(ar, &layout, InsertPoint::Start)?;
    let mut headers_size = 0;
    let mut package_group = String::new();
    if layout.has_headers_size() {
        headers_size = ar.read_u32()?;
    }
    if layout.has_package_group() {
        package_group = ar.read_fstring()?;
    }
    skip_extras(ar, &layout, InsertPoint::BeforeFlags)?;

    offsets.package_flags = ar.tell();
    let package_flags = ar.read_u32()? & !layout.clear_package_flags;
    if quirks.refine(
        &mut layout,
        header.file_version,
        header.licensee_version,
        package_flags,
    ) {
        tracing::debug!(game = layout.game.as_deref(), "flag-gated quirk applied");
        ar.ver = layout.version_info();
    }
    skip_extras(ar, &layout, InsertPoint::AfterFlags)?;

    let mut fields = [0i32; 6];
    for (i, slot) in fields.iter_mut().enumerate() {
        if i == 4 {
            skip_extras(ar, &layout, InsertPoint::AfterExports)?;
        }
        *slot = ar.read_i32()?;
    }
    if let Some(keys) = layout.table_xor {
        for (field, key) in fields.iter_mut().zip(keys) {
            *field ^= key as i32;
        }
    }
    let [mut name_count, name_offset, export_count, export_offset, import_count, import_offset] =
        fields;
    if layout
        .relative_name_count_flags
        .is_some_and(|f| package_flags & f != 0)
    {
        name_count -= name_offset;
    }

    let mut summary = PackageSummary {
        tag: header.tag,
        byte_swapped: header.byte_swapped,
        file_version: header.file_version,
        licensee_version: header.licensee_version,
        generation: layout.generation,
        game: layout.game.clone(),
        headers_size,
        package_group,
        package_flags,
        name_count: count(name_count, "name count")?,
        name_offset: offset(name_offset, "name offset")?,
        export_count: count(export_count, "export count")?,
        export_offset: offset(export_offset, "export offset")?,
        import_count: count(import_count, "import count")?,
        import_offset: offset(import_offset, "import offset")?,
        depends_offset: None,
        guid: Guid::default(),
        generations: Vec::new(),
        engine_version: 0,
        cooker_version: 0,
        compression_flags: 0,
        compression_chunks: Vec::new(),
        layout: layout.clone(),
        offsets,
    };

    // obfuscated summaries stop after the table fields
    if layout.table_xor.is_some() {
        return Ok(summary);
    }

    skip_extras(ar, &layout, InsertPoint::AfterTables)?;
    if layout.has_depends_offset() {
        summary.depends_offset = Some(offset(ar.read_i32()?, "depends offset")?);
    }
    ar.skip(4 * layout.reserved_before_guid() as u64)?;

    if layout.has_heritage() {
        // heritage count and offset; the table itself is not needed
        ar.skip(8)?;
        summary.generations.push(GenerationInfo {
            export_count,
            name_count,
            net_object_count: 0,
        });
    } else {
        if !layout.skip_guid {
            summary.guid = ar.read_guid()?;
        }
        let net = layout.generation_has_net_objects();
        summary.generations = ar.read_array(|ar| {
            Ok(GenerationInfo {
                export_count: ar.read_i32()?,
                name_count: ar.read_i32()?,
                net_object_count: if net { ar.read_i32()? } else { 0 },
            })
        })?;
    }

    if ue3 {
        if layout.has_engine_version() {
            summary.engine_version = ar.read_i32()?;
        }
        if layout.has_cooker_version() {
            summary.cooker_version = ar.read_i32()?;
        }
    }
    skip_extras(ar, &layout, InsertPoint::BeforeCompression)?;
    if layout.has_compression() {
        summary.offsets.compression_flags = Some(ar.tell());
        summary.compression_flags = ar.read_u32()?;
        let order = layout.chunk_order;
        summary.compression_chunks = ar.read_array(|ar| {
            let fields = [ar.read_i32()?, ar.read_i32()?, ar.read_i32()?, ar.read_i32()?];
            CompressionChunk::from_fields(fields, order)
        })?;
        summary.offsets.compression_end = Some(ar.tell());
    }
    if layout.has_reserved_tail() {
        ar.skip(4)?;
    }
    skip_extras(ar, &layout, InsertPoint::End)?;

    tracing::debug!(
        names = summary.name_count,
        imports = summary.import_count,
        exports = summary.export_count,
        chunks = summary.compression_chunks.len(),
        "located tables"
    );
    Ok(summary)
}
