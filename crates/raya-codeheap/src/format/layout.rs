//! Fixed-layout records of the AOT blob
//!
//! Every record has a `decode` that reads it through [`BlobReader`] and an
//! `encode` that appends it to a [`BlobWriter`]. Sizes are part of the
//! on-disk contract and are checked by the tests below.

use super::reader::{BlobReader, DecodeError};
use super::writer::BlobWriter;

/// Magic bytes at the start of every AOT blob.
pub const BLOB_MAGIC: [u8; 8] = *b"RAYAAOT\x01";

/// The only blob format version this implementation understands.
pub const FORMAT_VERSION: u32 = 1;

/// Size of [`BlobHeader`] in bytes.
pub const HEADER_SIZE: usize = 56;

/// Size of [`BuildConfig`] in bytes (7 ints + 12 flag bytes + padding).
pub const CONFIG_SIZE: usize = 48;

/// Size of a [`SymbolEntry`] in bytes.
pub const SYMBOL_ENTRY_SIZE: usize = 16;

/// Size of a [`KlassRecord`] in bytes.
pub const KLASS_RECORD_SIZE: usize = 24;

/// Size of a [`MethodRecord`] in bytes.
pub const METHOD_RECORD_SIZE: usize = 24;

/// Signed offset meaning "no such list".
pub const NO_OFFSET: i32 = -1;

/// Segment map byte marking a segment that holds no code.
pub const SEGMENT_FREE: u8 = 0xff;

/// Names of the sections every blob exports through its symbol table.
pub mod section {
    /// Build configuration record
    pub const CONFIG: &str = "raya.aot.config";
    /// Native code
    pub const CODE: &str = "raya.aot.code";
    /// One byte per code segment
    pub const CODE_SEGMENTS: &str = "raya.aot.code.segments";
    /// Class records
    pub const KLASSES: &str = "raya.aot.klasses";
    /// Per-class method groups and stub records
    pub const METHODS: &str = "raya.aot.methods";
    /// Per-method metadata records
    pub const METHOD_META: &str = "raya.aot.method.meta";
    /// Dependent-method lists
    pub const DEPENDENCIES: &str = "raya.aot.dependencies";
    /// Name offsets of the metaspace GOT slots
    pub const METASPACE_NAMES: &str = "raya.aot.metaspace.names";
    /// Name offsets of the heap-object GOT slots
    pub const OOP_NAMES: &str = "raya.aot.oop.names";
    /// Runtime stub list
    pub const STUBS: &str = "raya.aot.stubs";
    /// Runtime routines the code expects to be linked
    pub const RUNTIME_LINKS: &str = "raya.aot.runtime.links";

    /// All sections a well-formed blob must export
    pub const REQUIRED: [&str; 11] = [
        CONFIG,
        CODE,
        CODE_SEGMENTS,
        KLASSES,
        METHODS,
        METHOD_META,
        DEPENDENCIES,
        METASPACE_NAMES,
        OOP_NAMES,
        STUBS,
        RUNTIME_LINKS,
    ];
}

/// Header at offset 0 of the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    /// Magic bytes: `b"RAYAAOT\x01"`
    pub magic: [u8; 8],
    /// Format version, must equal [`FORMAT_VERSION`]
    pub version: u32,
    /// Number of class records
    pub class_count: u32,
    /// Number of code slots (methods and runtime stubs)
    pub method_count: u32,
    /// Slots in the metaspace GOT
    pub metaspace_got_size: u32,
    /// Slots in the metadata GOT
    pub metadata_got_size: u32,
    /// Slots in the heap-object GOT
    pub oop_got_size: u32,
    /// Blob offset of the NUL-terminated engine version string
    pub engine_version_offset: u32,
    /// Blob offset of the symbol table
    pub symbol_table_offset: u32,
    /// Number of symbol table entries
    pub symbol_count: u32,
    /// Blob offset of the name pool
    pub names_offset: u32,
    /// Size of the name pool
    pub names_size: u32,
    /// CRC32 of every byte after the header
    pub checksum: u32,
}

impl BlobHeader {
    /// Decode the header. Only reads; magic and version are checked by the loader.
    pub fn decode(reader: &mut BlobReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            magic: reader.read_array()?,
            version: reader.read_u32()?,
            class_count: reader.read_u32()?,
            method_count: reader.read_u32()?,
            metaspace_got_size: reader.read_u32()?,
            metadata_got_size: reader.read_u32()?,
            oop_got_size: reader.read_u32()?,
            engine_version_offset: reader.read_u32()?,
            symbol_table_offset: reader.read_u32()?,
            symbol_count: reader.read_u32()?,
            names_offset: reader.read_u32()?,
            names_size: reader.read_u32()?,
            checksum: reader.read_u32()?,
        })
    }

    /// Append the header
    pub fn encode(&self, writer: &mut BlobWriter) {
        writer.emit_bytes(&self.magic);
        writer.emit_u32(self.version);
        writer.emit_u32(self.class_count);
        writer.emit_u32(self.method_count);
        writer.emit_u32(self.metaspace_got_size);
        writer.emit_u32(self.metadata_got_size);
        writer.emit_u32(self.oop_got_size);
        writer.emit_u32(self.engine_version_offset);
        writer.emit_u32(self.symbol_table_offset);
        writer.emit_u32(self.symbol_count);
        writer.emit_u32(self.names_offset);
        writer.emit_u32(self.names_size);
        writer.emit_u32(self.checksum);
    }
}

/// Build configuration recorded by the AOT compiler.
///
/// Generated code hard-wires these assumptions (pointer decoding, field
/// offsets, barrier placement), so the whole blob is only usable under
/// exactly this configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildConfig {
    /// Size of the record as the compiler saw it; must equal [`CONFIG_SIZE`]
    pub config_size: i32,
    /// Shift applied when decoding compressed object pointers
    pub narrow_oop_shift: i32,
    /// Shift applied when decoding compressed class pointers
    pub narrow_klass_shift: i32,
    /// Padding around contended fields
    pub contended_padding_width: i32,
    /// Field layout strategy
    pub fields_allocation_style: i32,
    /// Object alignment in bytes
    pub object_alignment: i32,
    /// Granularity of the code segment map
    pub code_segment_size: i32,
    /// Debug build of the engine
    pub debug_vm: bool,
    /// Compressed object pointers
    pub use_compressed_oops: bool,
    /// Compressed class pointers
    pub use_compressed_class_pointers: bool,
    /// Fields packed into superclass gaps
    pub compact_fields: bool,
    /// G1 collector barriers
    pub use_g1_gc: bool,
    /// CMS collector barriers
    pub use_cms_gc: bool,
    /// Thread-local allocation buffers
    pub use_tlab: bool,
    /// Biased locking fast paths
    pub use_biased_locking: bool,
    /// Code was compiled for tiered execution and calls back into the profiler
    pub tiered_aot: bool,
    /// Contended field padding is honoured
    pub enable_contended: bool,
    /// Contended padding limited to privileged classes
    pub restrict_contended: bool,
    /// Java-level assertions were stripped from the compiled code
    pub omit_assertions: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            config_size: CONFIG_SIZE as i32,
            narrow_oop_shift: 3,
            narrow_klass_shift: 3,
            contended_padding_width: 128,
            fields_allocation_style: 1,
            object_alignment: 8,
            code_segment_size: 64,
            debug_vm: false,
            use_compressed_oops: true,
            use_compressed_class_pointers: true,
            compact_fields: true,
            use_g1_gc: true,
            use_cms_gc: false,
            use_tlab: true,
            use_biased_locking: false,
            tiered_aot: false,
            enable_contended: true,
            restrict_contended: true,
            omit_assertions: false,
        }
    }
}

impl BuildConfig {
    /// Number of padding bytes after the flag bytes
    const PADDING: usize = CONFIG_SIZE - 7 * 4 - 12;

    /// Decode the record
    pub fn decode(reader: &mut BlobReader<'_>) -> Result<Self, DecodeError> {
        let config = Self {
            config_size: reader.read_i32()?,
            narrow_oop_shift: reader.read_i32()?,
            narrow_klass_shift: reader.read_i32()?,
            contended_padding_width: reader.read_i32()?,
            fields_allocation_style: reader.read_i32()?,
            object_alignment: reader.read_i32()?,
            code_segment_size: reader.read_i32()?,
            debug_vm: reader.read_bool()?,
            use_compressed_oops: reader.read_bool()?,
            use_compressed_class_pointers: reader.read_bool()?,
            compact_fields: reader.read_bool()?,
            use_g1_gc: reader.read_bool()?,
            use_cms_gc: reader.read_bool()?,
            use_tlab: reader.read_bool()?,
            use_biased_locking: reader.read_bool()?,
            tiered_aot: reader.read_bool()?,
            enable_contended: reader.read_bool()?,
            restrict_contended: reader.read_bool()?,
            omit_assertions: reader.read_bool()?,
        };
        reader.read_bytes(Self::PADDING)?;
        Ok(config)
    }

    /// Append the record
    pub fn encode(&self, writer: &mut BlobWriter) {
        for value in [
            self.config_size,
            self.narrow_oop_shift,
            self.narrow_klass_shift,
            self.contended_padding_width,
            self.fields_allocation_style,
            self.object_alignment,
            self.code_segment_size,
        ] {
            writer.emit_i32(value);
        }
        for flag in [
            self.debug_vm,
            self.use_compressed_oops,
            self.use_compressed_class_pointers,
            self.compact_fields,
            self.use_g1_gc,
            self.use_cms_gc,
            self.use_tlab,
            self.use_biased_locking,
            self.tiered_aot,
            self.enable_contended,
            self.restrict_contended,
            self.omit_assertions,
        ] {
            writer.emit_u8(flag as u8);
        }
        writer.emit_bytes(&[0u8; Self::PADDING]);
    }
}

/// What a symbol table entry points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// A named section of the blob
    Section,
    /// A [`KlassRecord`] inside the klasses section
    Klass,
}

impl SymbolKind {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SymbolKind::Section),
            1 => Some(SymbolKind::Klass),
            _ => None,
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            SymbolKind::Section => 0,
            SymbolKind::Klass => 1,
        }
    }
}

/// Entry of the exported symbol table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Offset of the symbol's name in the name pool
    pub name_offset: u32,
    /// What the symbol names
    pub kind: SymbolKind,
    /// Blob offset of the referenced bytes
    pub offset: u32,
    /// Size of the referenced bytes
    pub size: u32,
}

impl SymbolEntry {
    /// Decode one entry
    pub fn decode(reader: &mut BlobReader<'_>) -> Result<Self, DecodeError> {
        let name_offset = reader.read_u32()?;
        let kind_offset = reader.position();
        let raw_kind = reader.read_u32()?;
        let kind = SymbolKind::from_u32(raw_kind)
            .ok_or(DecodeError::InvalidOffset(kind_offset as i64))?;
        Ok(Self {
            name_offset,
            kind,
            offset: reader.read_u32()?,
            size: reader.read_u32()?,
        })
    }

    /// Append one entry
    pub fn encode(&self, writer: &mut BlobWriter) {
        writer.emit_u32(self.name_offset);
        writer.emit_u32(self.kind.as_u32());
        writer.emit_u32(self.offset);
        writer.emit_u32(self.size);
    }
}

/// One class compiled into the blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KlassRecord {
    /// Metaspace GOT slot holding the live class once bound
    pub got_index: i32,
    /// Blob-local class id, `< class_count`
    pub class_id: i32,
    /// Offset of the class's method group in the methods section, or [`NO_OFFSET`]
    pub compiled_methods_offset: i32,
    /// Offset of the dependent-method list in the dependencies section, or [`NO_OFFSET`]
    pub dependent_methods_offset: i32,
    /// Structural fingerprint of the class at compile time
    pub fingerprint: u64,
}

impl KlassRecord {
    /// Decode one record
    pub fn decode(reader: &mut BlobReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            got_index: reader.read_i32()?,
            class_id: reader.read_i32()?,
            compiled_methods_offset: reader.read_i32()?,
            dependent_methods_offset: reader.read_i32()?,
            fingerprint: reader.read_u64()?,
        })
    }

    /// Append one record
    pub fn encode(&self, writer: &mut BlobWriter) {
        writer.emit_i32(self.got_index);
        writer.emit_i32(self.class_id);
        writer.emit_i32(self.compiled_methods_offset);
        writer.emit_i32(self.dependent_methods_offset);
        writer.emit_u64(self.fingerprint);
    }
}

/// One compiled method (or runtime stub) in the blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodRecord {
    /// Name pool offset of the symbolic name (class, method, signature)
    pub name_offset: i32,
    /// Offset of the code in the code section; segment aligned
    pub code_offset: i32,
    /// Offset of the [`MethodMeta`] record
    pub meta_offset: i32,
    /// First slot of the method's slice of the metadata GOT
    pub metadata_got_offset: i32,
    /// Length of that slice
    pub metadata_got_size: i32,
    /// Code slot index
    pub code_id: i32,
}

impl MethodRecord {
    /// Decode one record
    pub fn decode(reader: &mut BlobReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            name_offset: reader.read_i32()?,
            code_offset: reader.read_i32()?,
            meta_offset: reader.read_i32()?,
            metadata_got_offset: reader.read_i32()?,
            metadata_got_size: reader.read_i32()?,
            code_id: reader.read_i32()?,
        })
    }

    /// Append one record
    pub fn encode(&self, writer: &mut BlobWriter) {
        writer.emit_i32(self.name_offset);
        writer.emit_i32(self.code_offset);
        writer.emit_i32(self.meta_offset);
        writer.emit_i32(self.metadata_got_offset);
        writer.emit_i32(self.metadata_got_size);
        writer.emit_i32(self.code_id);
    }
}

/// Per-method metadata: code geometry plus the symbolic references the
/// method's code goes through.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodMeta {
    /// Size of the code including the 4-byte code id header
    pub code_size: u32,
    /// Unverified entry point, relative to the code start
    pub entry_offset: u32,
    /// Verified entry point, relative to the code start
    pub verified_entry_offset: u32,
    /// Frame size in bytes
    pub frame_size: u32,
    /// Name pool offsets describing each local metadata GOT slot
    pub metadata_names: Vec<i32>,
    /// Metaspace GOT slots the code dereferences
    pub klass_refs: Vec<u32>,
    /// Heap-object GOT slots the code dereferences
    pub oop_refs: Vec<u32>,
}

impl MethodMeta {
    /// Decode one record
    pub fn decode(reader: &mut BlobReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            code_size: reader.read_u32()?,
            entry_offset: reader.read_u32()?,
            verified_entry_offset: reader.read_u32()?,
            frame_size: reader.read_u32()?,
            metadata_names: reader.read_i32_list()?,
            klass_refs: reader.read_u32_list()?,
            oop_refs: reader.read_u32_list()?,
        })
    }

    /// Append one record
    pub fn encode(&self, writer: &mut BlobWriter) {
        writer.emit_u32(self.code_size);
        writer.emit_u32(self.entry_offset);
        writer.emit_u32(self.verified_entry_offset);
        writer.emit_u32(self.frame_size);
        writer.emit_i32(self.metadata_names.len() as i32);
        for &name in &self.metadata_names {
            writer.emit_i32(name);
        }
        writer.emit_i32(self.klass_refs.len() as i32);
        for &index in &self.klass_refs {
            writer.emit_u32(index);
        }
        writer.emit_i32(self.oop_refs.len() as i32);
        for &index in &self.oop_refs {
            writer.emit_u32(index);
        }
    }
}
