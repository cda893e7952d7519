//! Blob producer
//!
//! Assembles a complete, checksummed blob from a description of classes,
//! methods, stubs and indirection slots. The AOT compiler drives this when
//! it writes its output; the test suites use it to build fixtures.

use rustc_hash::FxHashMap;

use super::layout::{
    section, BlobHeader, BuildConfig, KlassRecord, MethodMeta, MethodRecord, SymbolEntry,
    SymbolKind, BLOB_MAGIC, FORMAT_VERSION, HEADER_SIZE, KLASS_RECORD_SIZE, NO_OFFSET,
    SEGMENT_FREE,
};
use super::writer::BlobWriter;

/// Size of the code id header in front of every method's instructions.
pub const CODE_HEADER_SIZE: u32 = 4;

/// Fill byte for instructions and padding (x86 `int3`).
const CODE_FILL: u8 = 0xCC;

/// Handle to a class added to a [`BlobBuilder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KlassHandle(usize);

/// Description of one compiled method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSpec {
    /// Method name
    pub name: String,
    /// Method signature
    pub signature: String,
    /// Instruction bytes after the code id header
    pub code_size: u32,
    /// Entry point relative to the first instruction
    pub entry_offset: u32,
    /// Verified entry point relative to the first instruction
    pub verified_entry_offset: u32,
    /// Frame size in bytes
    pub frame_size: u32,
    /// Descriptors of the method's metadata GOT slots
    pub metadata: Vec<String>,
    /// Metaspace GOT slots referenced by the code
    pub klass_refs: Vec<u32>,
    /// Heap-object GOT slots referenced by the code
    pub oop_refs: Vec<u32>,
}

impl MethodSpec {
    /// A method with 32 bytes of code and no references
    pub fn new(name: &str, signature: &str) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            code_size: 32,
            entry_offset: 0,
            verified_entry_offset: 0,
            frame_size: 16,
            metadata: Vec::new(),
            klass_refs: Vec::new(),
            oop_refs: Vec::new(),
        }
    }

    /// Set the instruction size
    pub fn with_code_size(mut self, code_size: u32) -> Self {
        self.code_size = code_size;
        self
    }

    /// Set the frame size
    pub fn with_frame_size(mut self, frame_size: u32) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Add a metadata GOT slot described by `descriptor`
    pub fn with_metadata(mut self, descriptor: &str) -> Self {
        self.metadata.push(descriptor.to_string());
        self
    }

    /// Reference a metaspace GOT slot
    pub fn with_klass_ref(mut self, got_index: u32) -> Self {
        self.klass_refs.push(got_index);
        self
    }

    /// Reference a heap-object GOT slot
    pub fn with_oop_ref(mut self, got_index: u32) -> Self {
        self.oop_refs.push(got_index);
        self
    }
}

#[derive(Debug)]
struct KlassSpec {
    name: String,
    fingerprint: u64,
    got_index: u32,
    methods: Vec<u32>,
    dependents: Vec<u32>,
}

#[derive(Debug)]
struct SlotSpec {
    holder: String,
    method: MethodSpec,
}

/// Name pool with deduplication
#[derive(Debug, Default)]
struct NamePool {
    bytes: BlobWriter,
    interned: FxHashMap<Vec<String>, u32>,
}

impl NamePool {
    fn intern(&mut self, name: &str) -> u32 {
        self.intern_parts(&[name])
    }

    /// Intern consecutive strings and return the offset of the first one
    fn intern_parts(&mut self, parts: &[&str]) -> u32 {
        let key: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
        if let Some(&offset) = self.interned.get(&key) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        for part in parts {
            self.bytes.emit_name(part);
        }
        self.interned.insert(key, offset);
        offset
    }
}

/// Builder for AOT blobs
#[derive(Debug)]
pub struct BlobBuilder {
    config: BuildConfig,
    engine_version: String,
    klasses: Vec<KlassSpec>,
    slots: Vec<SlotSpec>,
    stubs: Vec<u32>,
    metaspace_names: Vec<String>,
    oop_names: Vec<String>,
    runtime_links: Vec<String>,
}

impl BlobBuilder {
    /// Start a blob compiled under `config` for engine `engine_version`
    pub fn new(config: BuildConfig, engine_version: &str) -> Self {
        Self {
            config,
            engine_version: engine_version.to_string(),
            klasses: Vec::new(),
            slots: Vec::new(),
            stubs: Vec::new(),
            metaspace_names: Vec::new(),
            oop_names: Vec::new(),
            runtime_links: Vec::new(),
        }
    }

    /// Add a class; it gets its own metaspace GOT slot
    pub fn add_class(&mut self, name: &str, fingerprint: u64) -> KlassHandle {
        let got_index = self.add_metaspace_slot(name);
        self.klasses.push(KlassSpec {
            name: name.to_string(),
            fingerprint,
            got_index,
            methods: Vec::new(),
            dependents: Vec::new(),
        });
        KlassHandle(self.klasses.len() - 1)
    }

    /// Metaspace GOT slot of a class added with [`add_class`](Self::add_class)
    pub fn got_index(&self, klass: KlassHandle) -> u32 {
        self.klasses[klass.0].got_index
    }

    /// Add a compiled method to `klass`, returning its code id
    pub fn add_method(&mut self, klass: KlassHandle, method: MethodSpec) -> u32 {
        let code_id = self.slots.len() as u32;
        let holder = self.klasses[klass.0].name.clone();
        self.slots.push(SlotSpec { holder, method });
        self.klasses[klass.0].methods.push(code_id);
        code_id
    }

    /// Add a runtime stub, returning its code id
    pub fn add_stub(&mut self, name: &str, code_size: u32) -> u32 {
        let code_id = self.slots.len() as u32;
        self.slots.push(SlotSpec {
            holder: String::new(),
            method: MethodSpec::new(name, "").with_code_size(code_size),
        });
        self.stubs.push(code_id);
        code_id
    }

    /// Record that `code_id` assumes the shape of `klass`
    pub fn add_dependent(&mut self, klass: KlassHandle, code_id: u32) {
        self.klasses[klass.0].dependents.push(code_id);
    }

    /// Metaspace GOT slot resolving to the class `name`; reused if present
    pub fn add_metaspace_slot(&mut self, name: &str) -> u32 {
        if let Some(index) = self.metaspace_names.iter().position(|n| n == name) {
            return index as u32;
        }
        self.metaspace_names.push(name.to_string());
        (self.metaspace_names.len() - 1) as u32
    }

    /// Heap-object GOT slot resolving to `descriptor`
    pub fn add_oop_slot(&mut self, descriptor: &str) -> u32 {
        self.oop_names.push(descriptor.to_string());
        (self.oop_names.len() - 1) as u32
    }

    /// Runtime routine the code expects to be linked at load time
    pub fn add_runtime_link(&mut self, routine: &str) {
        self.runtime_links.push(routine.to_string());
    }

    /// Produce the blob bytes
    pub fn build(&self) -> Vec<u8> {
        let segment_size = self.config.code_segment_size.max(1) as usize;
        let mut names = NamePool::default();
        let mut symbols: Vec<(String, SymbolKind, u32, u32)> = Vec::new();

        let mut w = BlobWriter::new();
        w.emit_bytes(&[0u8; HEADER_SIZE]);

        let engine_version_offset = w.len() as u32;
        w.emit_bytes(self.engine_version.as_bytes());
        w.emit_u8(0);

        // Build configuration
        let start = begin_section(&mut w, 8);
        self.config.encode(&mut w);
        end_section(&mut w, &mut symbols, section::CONFIG, start);

        // Code and segment map
        let mut code = BlobWriter::new();
        let mut code_offsets = Vec::with_capacity(self.slots.len());
        for (code_id, slot) in self.slots.iter().enumerate() {
            code.align_to(segment_size, CODE_FILL);
            code_offsets.push(code.len() as i32);
            code.emit_i32(code_id as i32);
            code.emit_bytes(&vec![CODE_FILL; slot.method.code_size as usize]);
        }
        code.align_to(segment_size, CODE_FILL);

        let mut segments = vec![SEGMENT_FREE; code.len() / segment_size];
        for (slot, &offset) in self.slots.iter().zip(&code_offsets) {
            let first = offset as usize / segment_size;
            let total = (CODE_HEADER_SIZE + slot.method.code_size) as usize;
            let count = total.div_ceil(segment_size);
            for k in 0..count {
                segments[first + k] = k.min(SEGMENT_FREE as usize - 1) as u8;
            }
        }

        let start = begin_section(&mut w, segment_size.max(8));
        w.emit_bytes(&code.buffer);
        end_section(&mut w, &mut symbols, section::CODE, start);

        let start = begin_section(&mut w, 8);
        w.emit_bytes(&segments);
        end_section(&mut w, &mut symbols, section::CODE_SEGMENTS, start);

        // Per-method metadata
        let start = begin_section(&mut w, 8);
        let mut meta_offsets = Vec::with_capacity(self.slots.len());
        let mut metadata_got_offsets = Vec::with_capacity(self.slots.len());
        let mut metadata_got_size = 0i32;
        for slot in &self.slots {
            meta_offsets.push((w.len() - start) as i32);
            metadata_got_offsets.push(metadata_got_size);
            metadata_got_size += slot.method.metadata.len() as i32;
            MethodMeta {
                code_size: CODE_HEADER_SIZE + slot.method.code_size,
                entry_offset: CODE_HEADER_SIZE + slot.method.entry_offset,
                verified_entry_offset: CODE_HEADER_SIZE + slot.method.verified_entry_offset,
                frame_size: slot.method.frame_size,
                metadata_names: slot
                    .method
                    .metadata
                    .iter()
                    .map(|d| names.intern(d) as i32)
                    .collect(),
                klass_refs: slot.method.klass_refs.clone(),
                oop_refs: slot.method.oop_refs.clone(),
            }
            .encode(&mut w);
        }
        end_section(&mut w, &mut symbols, section::METHOD_META, start);

        let record_for = |code_id: u32, names: &mut NamePool| {
            let slot = &self.slots[code_id as usize];
            let index = code_id as usize;
            MethodRecord {
                name_offset: names.intern_parts(&[
                    &slot.holder,
                    &slot.method.name,
                    &slot.method.signature,
                ]) as i32,
                code_offset: code_offsets[index],
                meta_offset: meta_offsets[index],
                metadata_got_offset: metadata_got_offsets[index],
                metadata_got_size: slot.method.metadata.len() as i32,
                code_id: code_id as i32,
            }
        };

        // Method groups, then stub records
        let start = begin_section(&mut w, 8);
        let mut group_offsets = Vec::with_capacity(self.klasses.len());
        for klass in &self.klasses {
            if klass.methods.is_empty() {
                group_offsets.push(NO_OFFSET);
                continue;
            }
            group_offsets.push((w.len() - start) as i32);
            w.emit_i32(klass.methods.len() as i32);
            for &code_id in &klass.methods {
                record_for(code_id, &mut names).encode(&mut w);
            }
        }
        let mut stub_offsets = Vec::with_capacity(self.stubs.len());
        for &code_id in &self.stubs {
            stub_offsets.push((w.len() - start) as i32);
            record_for(code_id, &mut names).encode(&mut w);
        }
        end_section(&mut w, &mut symbols, section::METHODS, start);

        // Dependent-method lists
        let start = begin_section(&mut w, 8);
        let mut dependency_offsets = Vec::with_capacity(self.klasses.len());
        for klass in &self.klasses {
            if klass.dependents.is_empty() {
                dependency_offsets.push(NO_OFFSET);
                continue;
            }
            dependency_offsets.push((w.len() - start) as i32);
            w.emit_i32(klass.dependents.len() as i32);
            for &code_id in &klass.dependents {
                w.emit_i32(code_id as i32);
            }
        }
        end_section(&mut w, &mut symbols, section::DEPENDENCIES, start);

        // Class records, each exported under the class name
        let start = begin_section(&mut w, 8);
        for (class_id, klass) in self.klasses.iter().enumerate() {
            let offset = w.len() as u32;
            KlassRecord {
                got_index: klass.got_index as i32,
                class_id: class_id as i32,
                compiled_methods_offset: group_offsets[class_id],
                dependent_methods_offset: dependency_offsets[class_id],
                fingerprint: klass.fingerprint,
            }
            .encode(&mut w);
            symbols.push((klass.name.clone(), SymbolKind::Klass, offset, KLASS_RECORD_SIZE as u32));
        }
        end_section(&mut w, &mut symbols, section::KLASSES, start);

        let start = begin_section(&mut w, 8);
        for name in &self.metaspace_names {
            w.emit_i32(names.intern(name) as i32);
        }
        end_section(&mut w, &mut symbols, section::METASPACE_NAMES, start);

        let start = begin_section(&mut w, 8);
        for name in &self.oop_names {
            w.emit_i32(names.intern(name) as i32);
        }
        end_section(&mut w, &mut symbols, section::OOP_NAMES, start);

        let start = begin_section(&mut w, 8);
        w.emit_i32(stub_offsets.len() as i32);
        for &offset in &stub_offsets {
            w.emit_i32(offset);
        }
        end_section(&mut w, &mut symbols, section::STUBS, start);

        let start = begin_section(&mut w, 8);
        w.emit_i32(self.runtime_links.len() as i32);
        for routine in &self.runtime_links {
            w.emit_i32(names.intern(routine) as i32);
        }
        end_section(&mut w, &mut symbols, section::RUNTIME_LINKS, start);

        // Symbol table, then the name pool it points into
        let entries: Vec<SymbolEntry> = symbols
            .iter()
            .map(|(name, kind, offset, size)| SymbolEntry {
                name_offset: names.intern(name),
                kind: *kind,
                offset: *offset,
                size: *size,
            })
            .collect();
        let symbol_table_offset = begin_section(&mut w, 8) as u32;
        for entry in &entries {
            entry.encode(&mut w);
        }

        let names_offset = w.len() as u32;
        w.emit_bytes(&names.bytes.buffer);

        let metadata_got_size = metadata_got_size as u32;
        let mut header = BlobHeader {
            magic: BLOB_MAGIC,
            version: FORMAT_VERSION,
            class_count: self.klasses.len() as u32,
            method_count: self.slots.len() as u32,
            metaspace_got_size: self.metaspace_names.len() as u32,
            metadata_got_size,
            oop_got_size: self.oop_names.len() as u32,
            engine_version_offset,
            symbol_table_offset,
            symbol_count: entries.len() as u32,
            names_offset,
            names_size: names.bytes.len() as u32,
            checksum: 0,
        };
        header.checksum = crc32fast::hash(&w.buffer[HEADER_SIZE..]);

        let mut header_bytes = BlobWriter::new();
        header.encode(&mut header_bytes);
        w.buffer[..HEADER_SIZE].copy_from_slice(&header_bytes.buffer);

        w.into_bytes()
    }
}

fn begin_section(w: &mut BlobWriter, alignment: usize) -> usize {
    w.align_to(alignment, 0);
    w.len()
}

fn end_section(
    w: &mut BlobWriter,
    symbols: &mut Vec<(String, SymbolKind, u32, u32)>,
    name: &str,
    start: usize,
) {
    symbols.push((name.to_string(), SymbolKind::Section, start as u32, (w.len() - start) as u32));
}
