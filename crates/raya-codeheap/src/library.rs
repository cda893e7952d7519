//! AOT library loader
//!
//! Parses a blob produced by the AOT compiler and exposes typed,
//! bounds-checked views over it:
//! 1. Check magic and format version
//! 2. Verify the checksum
//! 3. Index the symbol table
//! 4. Locate the required sections and decode the build configuration
//! 5. Optionally map the code section as executable memory
//!
//! The blob bytes are never mutated after loading.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashMap;

use crate::error::AotError;
use crate::format::{
    section, BlobHeader, BlobReader, BuildConfig, DecodeError, KlassRecord, MethodMeta,
    MethodRecord, SymbolEntry, SymbolKind, BLOB_MAGIC, FORMAT_VERSION, HEADER_SIZE,
    KLASS_RECORD_SIZE, NO_OFFSET, SYMBOL_ENTRY_SIZE,
};

/// An exported symbol: a section or a class record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// What the symbol points at
    pub kind: SymbolKind,
    /// Blob offset
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
}

/// Symbolic name of a compiled method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodName {
    /// Binary name of the holder class (empty for runtime stubs)
    pub class: String,
    /// Method name
    pub name: String,
    /// Method signature
    pub signature: String,
}

impl std::fmt::Display for MethodName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.class.is_empty() {
            write!(f, "{}{}", self.name, self.signature)
        } else {
            write!(f, "{}.{}{}", self.class, self.name, self.signature)
        }
    }
}

/// Options for [`AotLib::load_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Compare the stored CRC32 against the blob contents
    pub verify_checksum: bool,
    /// Copy the code section into executable memory
    pub map_executable: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions { verify_checksum: true, map_executable: false }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Section {
    offset: usize,
    size: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Sections {
    code: Section,
    segments: Section,
    klasses: Section,
    methods: Section,
    method_meta: Section,
    dependencies: Section,
    metaspace_names: Section,
    oop_names: Section,
    stubs: Section,
    runtime_links: Section,
}

/// A loaded AOT library
pub struct AotLib {
    name: String,
    id: usize,
    data: Box<[u8]>,
    header: BlobHeader,
    config: BuildConfig,
    engine_version: String,
    symbols: FxHashMap<String, Symbol>,
    sections: Sections,
    names: Section,
    region: Option<CodeRegion>,
    valid: AtomicBool,
}

impl std::fmt::Debug for AotLib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AotLib")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("size", &self.data.len())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl AotLib {
    /// Parse `bytes` as library `name` with the default options
    pub fn load(bytes: Vec<u8>, name: &str, id: usize) -> Result<Self, AotError> {
        Self::load_with(bytes, name, id, LoadOptions::default())
    }

    /// Parse `bytes` as library `name`
    pub fn load_with(
        bytes: Vec<u8>,
        name: &str,
        id: usize,
        options: LoadOptions,
    ) -> Result<Self, AotError> {
        let data = bytes.into_boxed_slice();
        if data.len() < HEADER_SIZE {
            return Err(AotError::format(name, format!("blob is only {} bytes", data.len())));
        }

        let header = BlobHeader::decode(&mut BlobReader::new(&data))
            .map_err(|e| AotError::truncated(name, e))?;
        if header.magic != BLOB_MAGIC {
            return Err(AotError::format(name, format!("bad magic {:02x?}", header.magic)));
        }
        if header.version != FORMAT_VERSION {
            return Err(AotError::format(
                name,
                format!("format version {} (expected {})", header.version, FORMAT_VERSION),
            ));
        }
        if options.verify_checksum {
            let computed = crc32fast::hash(&data[HEADER_SIZE..]);
            if computed != header.checksum {
                return Err(AotError::format(
                    name,
                    format!("checksum {:08x} (stored {:08x})", computed, header.checksum),
                ));
            }
        }

        let engine_version = BlobReader::at(&data, header.engine_version_offset as usize)
            .and_then(|mut r| r.read_c_str())
            .map_err(|e| AotError::truncated(name, e))?
            .to_string();

        let names = checked_range(&data, header.names_offset as usize, header.names_size as usize)
            .map_err(|e| AotError::truncated(name, e))?;
        let symbols = read_symbol_table(&data, &header, names).map_err(|e| AotError::truncated(name, e))?;

        let section = |symbol: &str| -> Result<Section, AotError> {
            match symbols.get(symbol) {
                Some(s) if s.kind == SymbolKind::Section => Ok(Section { offset: s.offset, size: s.size }),
                _ => Err(AotError::MissingSymbol {
                    library: name.to_string(),
                    symbol: symbol.to_string(),
                }),
            }
        };
        let config_section = section(section::CONFIG)?;
        let sections = Sections {
            code: section(section::CODE)?,
            segments: section(section::CODE_SEGMENTS)?,
            klasses: section(section::KLASSES)?,
            methods: section(section::METHODS)?,
            method_meta: section(section::METHOD_META)?,
            dependencies: section(section::DEPENDENCIES)?,
            metaspace_names: section(section::METASPACE_NAMES)?,
            oop_names: section(section::OOP_NAMES)?,
            stubs: section(section::STUBS)?,
            runtime_links: section(section::RUNTIME_LINKS)?,
        };

        let config = BuildConfig::decode(&mut BlobReader::new(slice(&data, config_section)))
            .map_err(|e| AotError::truncated(name, e))?;

        let region = if options.map_executable {
            CodeRegion::map(slice(&data, sections.code))?
        } else {
            None
        };

        log::debug!(
            target: "aot::load",
            "loaded {} (id {}): {} classes, {} code slots, engine {}",
            name,
            id,
            header.class_count,
            header.method_count,
            engine_version
        );

        Ok(AotLib {
            name: name.to_string(),
            id,
            data,
            header,
            config,
            engine_version,
            symbols,
            sections,
            names,
            region,
            valid: AtomicBool::new(true),
        })
    }

    /// Read a library from disk and map its code executable
    pub fn load_file(path: &Path, id: usize) -> Result<Self, AotError> {
        Self::load_file_with(path, id, true)
    }

    /// Read a library from disk, optionally skipping the checksum
    pub fn load_file_with(path: &Path, id: usize, verify_checksum: bool) -> Result<Self, AotError> {
        let bytes = fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let options = LoadOptions { verify_checksum, map_executable: cfg!(unix) };
        Self::load_with(bytes, &name, id, options)
    }

    /// Whether the library passed validation and is still usable
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the library unusable
    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            log::info!(target: "aot::load", "library {} invalidated", self.name);
        }
    }

    /// Library name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Library id within its session
    pub fn id(&self) -> usize {
        self.id
    }

    /// Decoded header
    pub fn header(&self) -> &BlobHeader {
        &self.header
    }

    /// Build configuration the blob was compiled under
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Engine version the blob was compiled for
    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    /// Look up an exported symbol
    pub fn load_symbol(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).copied()
    }

    /// Class record exported under `class_name`, if any
    pub fn find_klass_record(&self, class_name: &str) -> Result<Option<KlassRecord>, AotError> {
        match self.load_symbol(class_name) {
            Some(symbol) if symbol.kind == SymbolKind::Klass => self
                .read(|| KlassRecord::decode(&mut BlobReader::at(&self.data, symbol.offset)?))
                .map(Some),
            _ => Ok(None),
        }
    }

    /// Class record by blob-local class id
    pub fn klass_record(&self, class_id: u32) -> Result<KlassRecord, AotError> {
        let offset = class_id as usize * KLASS_RECORD_SIZE;
        self.read(|| KlassRecord::decode(&mut BlobReader::at(self.section(self.sections.klasses), offset)?))
    }

    /// Methods compiled for a class
    pub fn compiled_methods(&self, klass: &KlassRecord) -> Result<Vec<MethodRecord>, AotError> {
        if klass.compiled_methods_offset == NO_OFFSET {
            return Ok(Vec::new());
        }
        self.read(|| {
            let mut reader =
                BlobReader::at_signed(self.section(self.sections.methods), klass.compiled_methods_offset)?;
            let count = non_negative(reader.read_i32()?)?;
            (0..count).map(|_| MethodRecord::decode(&mut reader)).collect()
        })
    }

    /// Code ids of the methods that depend on a class's shape
    pub fn dependent_methods(&self, klass: &KlassRecord) -> Result<Vec<u32>, AotError> {
        if klass.dependent_methods_offset == NO_OFFSET {
            return Ok(Vec::new());
        }
        self.read(|| {
            let mut reader = BlobReader::at_signed(
                self.section(self.sections.dependencies),
                klass.dependent_methods_offset,
            )?;
            reader
                .read_i32_list()?
                .into_iter()
                .map(|id| non_negative(id).map(|id| id as u32))
                .collect()
        })
    }

    /// Metadata record of a method
    pub fn method_meta(&self, method: &MethodRecord) -> Result<MethodMeta, AotError> {
        self.read(|| {
            MethodMeta::decode(&mut BlobReader::at_signed(
                self.section(self.sections.method_meta),
                method.meta_offset,
            )?)
        })
    }

    /// Symbolic name of a method
    pub fn method_name(&self, method: &MethodRecord) -> Result<MethodName, AotError> {
        self.read(|| {
            let mut reader = BlobReader::at_signed(self.section(self.names), method.name_offset)?;
            Ok(MethodName {
                class: reader.read_name()?.to_string(),
                name: reader.read_name()?.to_string(),
                signature: reader.read_name()?.to_string(),
            })
        })
    }

    /// Records of the runtime stubs
    pub fn stub_records(&self) -> Result<Vec<MethodRecord>, AotError> {
        self.read(|| {
            let offsets = BlobReader::new(self.section(self.sections.stubs)).read_i32_list()?;
            offsets
                .into_iter()
                .map(|offset| {
                    MethodRecord::decode(&mut BlobReader::at_signed(
                        self.section(self.sections.methods),
                        offset,
                    )?)
                })
                .collect()
        })
    }

    /// One byte per code segment
    pub fn segment_map(&self) -> &[u8] {
        self.section(self.sections.segments)
    }

    /// Code id stored in the header of the code at `code_offset`
    pub fn code_id_at(&self, code_offset: usize) -> Result<i32, AotError> {
        self.read(|| BlobReader::at(self.code_bytes(), code_offset)?.read_i32())
    }

    /// Raw bytes of the code section
    pub fn code_bytes(&self) -> &[u8] {
        self.section(self.sections.code)
    }

    /// Address of the first code byte
    pub fn code_base(&self) -> usize {
        match &self.region {
            Some(region) => region.base() as usize,
            None => self.code_bytes().as_ptr() as usize,
        }
    }

    /// Size of the code section
    pub fn code_size(&self) -> usize {
        self.sections.code.size
    }

    /// Whether the code lives in an executable mapping
    pub fn is_mapped(&self) -> bool {
        self.region.is_some()
    }

    /// Class name resolving metaspace GOT slot `index`
    pub fn metaspace_name(&self, index: u32) -> Result<&str, AotError> {
        self.indexed_name(self.sections.metaspace_names, index)
    }

    /// Descriptor of heap-object GOT slot `index`
    pub fn oop_name(&self, index: u32) -> Result<&str, AotError> {
        self.indexed_name(self.sections.oop_names, index)
    }

    /// String at `offset` in the name pool
    pub fn pool_name(&self, offset: i32) -> Result<&str, AotError> {
        self.read(|| BlobReader::at_signed(self.section(self.names), offset)?.read_name())
    }

    /// Runtime routines the code links against
    pub fn runtime_links(&self) -> Result<Vec<&str>, AotError> {
        let offsets = self.read(|| BlobReader::new(self.section(self.sections.runtime_links)).read_i32_list())?;
        offsets.into_iter().map(|offset| self.pool_name(offset)).collect()
    }

    fn indexed_name(&self, table: Section, index: u32) -> Result<&str, AotError> {
        let offset = self.read(|| BlobReader::at(self.section(table), index as usize * 4)?.read_i32())?;
        self.pool_name(offset)
    }

    fn section(&self, section: Section) -> &[u8] {
        slice(&self.data, section)
    }

    fn read<T>(&self, f: impl FnOnce() -> Result<T, DecodeError>) -> Result<T, AotError> {
        f().map_err(|e| AotError::truncated(&self.name, e))
    }
}

fn slice(data: &[u8], section: Section) -> &[u8] {
    &data[section.offset..section.offset + section.size]
}

fn checked_range(data: &[u8], offset: usize, size: usize) -> Result<Section, DecodeError> {
    match offset.checked_add(size) {
        Some(end) if end <= data.len() => Ok(Section { offset, size }),
        _ => Err(DecodeError::UnexpectedEof { offset, needed: size }),
    }
}

fn non_negative(value: i32) -> Result<usize, DecodeError> {
    usize::try_from(value).map_err(|_| DecodeError::InvalidOffset(value as i64))
}

fn read_symbol_table(
    data: &[u8],
    header: &BlobHeader,
    names: Section,
) -> Result<FxHashMap<String, Symbol>, DecodeError> {
    let table_size = (header.symbol_count as usize).saturating_mul(SYMBOL_ENTRY_SIZE);
    checked_range(data, header.symbol_table_offset as usize, table_size)?;

    let pool = slice(data, names);
    let mut reader = BlobReader::at(data, header.symbol_table_offset as usize)?;
    let mut symbols = FxHashMap::default();
    for _ in 0..header.symbol_count {
        let entry = SymbolEntry::decode(&mut reader)?;
        let range = checked_range(data, entry.offset as usize, entry.size as usize)?;
        let name = BlobReader::at(pool, entry.name_offset as usize)?.read_name()?;
        symbols.insert(
            name.to_string(),
            Symbol { kind: entry.kind, offset: range.offset, size: range.size },
        );
    }
    Ok(symbols)
}

/// Code copied into executable memory
pub struct CodeRegion {
    #[cfg(unix)]
    base: *const u8,
    size: usize,
}

// Safety: the region is immutable after mapping (PROT_READ|PROT_EXEC).
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    /// Copy `code` into a fresh mapping and make it executable.
    /// Returns `None` for empty code or on platforms without mmap.
    #[cfg(unix)]
    fn map(code: &[u8]) -> Result<Option<Self>, AotError> {
        if code.is_empty() {
            return Ok(None);
        }

        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                code.len(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error().into());
            }

            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());

            // W^X: drop write before adding execute
            if libc::mprotect(ptr, code.len(), libc::PROT_READ | libc::PROT_EXEC) != 0 {
                let err = std::io::Error::last_os_error();
                libc::munmap(ptr, code.len());
                return Err(err.into());
            }

            Ok(Some(CodeRegion { base: ptr as *const u8, size: code.len() }))
        }
    }

    #[cfg(not(unix))]
    fn map(_code: &[u8]) -> Result<Option<Self>, AotError> {
        Ok(None)
    }

    fn base(&self) -> *const u8 {
        #[cfg(unix)]
        {
            self.base
        }
        #[cfg(not(unix))]
        {
            std::ptr::null()
        }
    }

    /// Size of the mapping in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(unix)]
impl Drop for CodeRegion {
    fn drop(&mut self) {
        if !self.base.is_null() && self.size > 0 {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}
