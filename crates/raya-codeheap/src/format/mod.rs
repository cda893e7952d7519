//! AOT blob binary format
//!
//! The blob is produced by the out-of-process AOT compiler and consumed
//! read-only by the loader. All integers are little-endian.
//!
//! ```text
//! ┌─────────────────────────┐
//! │  Header (56 bytes)      │  ← magic, version, counts, table locations
//! ├─────────────────────────┤
//! │  Engine version string  │  ← NUL-terminated
//! ├─────────────────────────┤
//! │  Sections               │  ← config, code, segment map, klasses,
//! │                         │    methods, method meta, dependencies,
//! │                         │    GOT names, stubs, runtime links
//! ├─────────────────────────┤
//! │  Symbol table           │  ← name → (kind, offset, size)
//! ├─────────────────────────┤
//! │  Name pool              │  ← u16-length-prefixed UTF-8 strings
//! └─────────────────────────┘
//! ```
//!
//! Offsets inside records are relative to the section they point into;
//! symbol table and header offsets are relative to the start of the blob.

mod builder;
mod layout;
mod reader;
mod writer;

pub use builder::{BlobBuilder, KlassHandle, MethodSpec, CODE_HEADER_SIZE};
pub use layout::{
    section, BlobHeader, BuildConfig, KlassRecord, MethodMeta, MethodRecord, SymbolEntry,
    SymbolKind, BLOB_MAGIC, CONFIG_SIZE, FORMAT_VERSION, HEADER_SIZE, KLASS_RECORD_SIZE,
    METHOD_RECORD_SIZE, NO_OFFSET, SEGMENT_FREE, SYMBOL_ENTRY_SIZE,
};
pub use reader::{BlobReader, DecodeError};
pub use writer::BlobWriter;
