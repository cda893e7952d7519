//! AOT code heap
//!
//! One heap per loaded library. It owns the per-method code slots, the
//! three GOTs and the address bounds, and answers the engine's questions
//! about addresses inside the library's code:
//!
//! - `contains(addr)` for the stack walker and signal handlers
//! - `find_owner(addr)` / `find_start(addr)` through the segment map
//! - `lookup(code_id)` / `for_each_alive_method` for the dispatcher
//!
//! Linkage (binding live classes, resolving GOT slots) lives in
//! [`linkage`], invalidation in [`invalidation`].

mod bounds;
mod invalidation;
mod linkage;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::error::AotError;
use crate::format::{MethodMeta, MethodRecord, SEGMENT_FREE};
use crate::got::GotTable;
use crate::library::{AotLib, MethodName};
use crate::method::{AotCompiledMethod, CodeSlot, CodeState, PublishResult};
use crate::runtime::{KlassRef, MetadataRef, MethodRef, ObjectRef, Runtime};
use crate::stats::AotStatistics;

pub use bounds::CodeBounds;
pub use invalidation::SweepReport;
pub use linkage::ClassEntry;

use linkage::AotClass;

/// Method record of a code slot plus the class that owns it
#[derive(Debug, Clone, Copy)]
struct SlotRecord {
    record: MethodRecord,
    /// `None` for runtime stubs
    class_id: Option<u32>,
}

/// A resolved entry of the metaspace or metadata GOT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaspaceEntry {
    /// Metaspace GOT slot
    Klass(KlassRef),
    /// Metadata GOT slot
    Metadata(MetadataRef),
}

/// Code heap of one AOT library
pub struct AotCodeHeap {
    lib: Arc<AotLib>,
    runtime: Arc<dyn Runtime>,
    stats: Arc<AotStatistics>,
    slots: Box<[CodeSlot]>,
    records: Box<[Option<SlotRecord>]>,
    classes: Box<[AotClass]>,
    metaspace_got: GotTable<KlassRef>,
    metadata_got: GotTable<MetadataRef>,
    oop_got: GotTable<ObjectRef>,
    bounds: CodeBounds,
    /// Live class → blob class id, for classes that passed linkage
    bindings: DashMap<KlassRef, u32>,
    /// Addresses of the runtime routines, linked on first class load
    runtime_links: OnceCell<Box<[usize]>>,
    linkage_disabled: AtomicBool,
    segment_shift: u32,
}

impl std::fmt::Debug for AotCodeHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AotCodeHeap")
            .field("library", &self.lib.name())
            .field("slots", &self.slots.len())
            .field("bounds", &self.bounds.get())
            .finish()
    }
}

impl AotCodeHeap {
    /// Build the heap for `lib` with private statistics
    pub fn new(lib: Arc<AotLib>, runtime: Arc<dyn Runtime>) -> Result<Self, AotError> {
        Self::with_statistics(lib, runtime, Arc::new(AotStatistics::new()))
    }

    /// Build the heap for `lib`, registering its runtime stubs
    pub fn with_statistics(
        lib: Arc<AotLib>,
        runtime: Arc<dyn Runtime>,
        stats: Arc<AotStatistics>,
    ) -> Result<Self, AotError> {
        if !lib.is_valid() {
            return Err(AotError::InvalidLibrary(lib.name().to_string()));
        }

        let header = *lib.header();
        let segment_size = lib.config().code_segment_size;
        if segment_size <= 0 || segment_size & (segment_size - 1) != 0 {
            return Err(AotError::format(lib.name(), format!("code segment size {}", segment_size)));
        }
        check_code_size(lib.name(), lib.code_size())?;
        let segment_shift = segment_size.trailing_zeros();
        if lib.segment_map().len() << segment_shift < lib.code_size() {
            return Err(AotError::format(lib.name(), "segment map does not cover the code"));
        }

        let method_count = header.method_count as usize;
        let mut records: Vec<Option<SlotRecord>> = vec![None; method_count];
        let mut classes = Vec::with_capacity(header.class_count as usize);

        for class_id in 0..header.class_count {
            let klass = lib.klass_record(class_id)?;
            if klass.class_id != class_id as i32
                || klass.got_index < 0
                || klass.got_index as u32 >= header.metaspace_got_size
            {
                return Err(AotError::format(lib.name(), format!("corrupt class record {}", class_id)));
            }
            for record in lib.compiled_methods(&klass)? {
                let index = slot_index(&lib, record.code_id, method_count)?;
                records[index] = Some(SlotRecord { record, class_id: Some(class_id) });
            }
            classes.push(AotClass::new());
        }

        let stubs = lib.stub_records()?;
        for record in &stubs {
            let index = slot_index(&lib, record.code_id, method_count)?;
            records[index] = Some(SlotRecord { record: *record, class_id: None });
        }

        let heap = AotCodeHeap {
            slots: (0..method_count).map(|_| CodeSlot::new()).collect(),
            records: records.into_boxed_slice(),
            classes: classes.into_boxed_slice(),
            metaspace_got: GotTable::new(header.metaspace_got_size as usize),
            metadata_got: GotTable::new(header.metadata_got_size as usize),
            oop_got: GotTable::new(header.oop_got_size as usize),
            bounds: CodeBounds::new(),
            bindings: DashMap::new(),
            runtime_links: OnceCell::new(),
            linkage_disabled: AtomicBool::new(false),
            segment_shift,
            lib,
            runtime,
            stats,
        };

        for record in &stubs {
            heap.register_stub(record)?;
        }

        log::debug!(
            target: "aot::load",
            "code heap for {}: {} slots, {} stubs, GOT sizes {}/{}/{}",
            heap.lib.name(),
            method_count,
            stubs.len(),
            heap.metaspace_got.len(),
            heap.metadata_got.len(),
            heap.oop_got.len()
        );
        Ok(heap)
    }

    fn register_stub(&self, record: &MethodRecord) -> Result<(), AotError> {
        let name = self.lib.method_name(record)?;
        let meta = self.lib.method_meta(record)?;
        let stub = Arc::new(self.build_method(record, &meta, name, None, None, None)?);
        let slot = &self.slots[stub.code_id as usize];
        if slot.publish_stub(Arc::clone(&stub)) {
            self.admit(&stub);
            log::trace!(target: "aot::method", "stub {} at {:#x}", stub.name(), stub.code_begin());
        }
        Ok(())
    }

    /// Assemble a compiled method after checking its geometry
    fn build_method(
        &self,
        record: &MethodRecord,
        meta: &MethodMeta,
        name: MethodName,
        method: Option<MethodRef>,
        holder: Option<KlassRef>,
        class_id: Option<u32>,
    ) -> Result<AotCompiledMethod, AotError> {
        let bad = |what: &str| AotError::format(self.lib.name(), format!("{} of {}", what, name));

        let offset = usize::try_from(record.code_offset).map_err(|_| bad("code offset"))?;
        let size = meta.code_size as usize;
        if offset & ((1 << self.segment_shift) - 1) != 0 {
            return Err(bad("unaligned code"));
        }
        if offset.checked_add(size).is_none_or(|end| end > self.lib.code_size()) {
            return Err(bad("code range"));
        }
        if meta.entry_offset as usize >= size || meta.verified_entry_offset as usize >= size {
            return Err(bad("entry point"));
        }

        let got_start = usize::try_from(record.metadata_got_offset).map_err(|_| bad("metadata GOT offset"))?;
        let got_size = usize::try_from(record.metadata_got_size).map_err(|_| bad("metadata GOT size"))?;
        if got_start + got_size > self.metadata_got.len() || meta.metadata_names.len() != got_size {
            return Err(bad("metadata GOT range"));
        }

        Ok(AotCompiledMethod {
            code_id: record.code_id as u32,
            library_id: self.lib.id(),
            name,
            method,
            holder,
            class_id,
            code_begin: self.lib.code_base() + offset,
            code_size: size,
            entry_offset: meta.entry_offset as usize,
            verified_entry_offset: meta.verified_entry_offset as usize,
            frame_size: meta.frame_size,
            metadata_got: got_start..got_start + got_size,
        })
    }

    /// The library backing this heap
    pub fn library(&self) -> &Arc<AotLib> {
        &self.lib
    }

    /// Statistics counters
    pub fn statistics(&self) -> &Arc<AotStatistics> {
        &self.stats
    }

    /// Number of code slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Address of the first code byte
    pub fn code_base(&self) -> usize {
        self.lib.code_base()
    }

    /// Lowest admitted address; equals the high boundary while empty
    pub fn low_boundary(&self) -> usize {
        self.code_base() + self.bounds.get().map_or(0, |(low, _)| low as usize)
    }

    /// One past the highest admitted address
    pub fn high_boundary(&self) -> usize {
        self.code_base() + self.bounds.get().map_or(0, |(_, high)| high as usize)
    }

    /// Whether no code has been admitted yet
    pub fn is_empty(&self) -> bool {
        self.bounds.get().is_none()
    }

    /// Extend the bounds to cover `method`'s code. Idempotent per slot.
    pub fn admit(&self, method: &AotCompiledMethod) -> bool {
        if method.library_id != self.lib.id() {
            return false;
        }
        let Some(slot) = self.slots.get(method.code_id as usize) else {
            return false;
        };
        if !slot.admit() {
            return false;
        }
        let low = (method.code_begin() - self.code_base()) as u32;
        let high = (method.code_end() - self.code_base()) as u32;
        self.bounds.widen(low, high);
        true
    }

    /// Walk the segment map back to the code owning `addr`
    fn owning_slot(&self, addr: usize) -> Option<(&CodeSlot, &Arc<AotCompiledMethod>)> {
        let offset = addr.checked_sub(self.code_base())?;
        if !self.bounds.contains(offset) {
            return None;
        }

        let map = self.lib.segment_map();
        let mut segment = offset >> self.segment_shift;
        loop {
            match *map.get(segment)? {
                SEGMENT_FREE => return None,
                0 => break,
                back => segment = segment.checked_sub(back as usize)?,
            }
        }

        let code_id = self.lib.code_id_at(segment << self.segment_shift).ok()?;
        let slot = self.slots.get(usize::try_from(code_id).ok()?)?;
        let handle = slot.handle()?;
        (slot.is_admitted() && handle.contains(addr)).then_some((slot, handle))
    }

    /// Whether `addr` lies in admitted code of this heap
    pub fn contains(&self, addr: usize) -> bool {
        self.owning_slot(addr).is_some()
    }

    /// Executable method or stub owning `addr`
    pub fn find_owner(&self, addr: usize) -> Option<Arc<AotCompiledMethod>> {
        let (slot, handle) = self.owning_slot(addr)?;
        (slot.state() == CodeState::Resolved).then(|| Arc::clone(handle))
    }

    /// Start of the code containing `addr`
    pub fn find_start(&self, addr: usize) -> Option<usize> {
        self.owning_slot(addr).map(|(_, handle)| handle.code_begin())
    }

    /// Resolved method for `code_id`; stubs are not returned
    pub fn lookup(&self, code_id: u32) -> Option<Arc<AotCompiledMethod>> {
        self.slots
            .get(code_id as usize)?
            .resolved()
            .filter(|m| !m.is_stub())
            .cloned()
    }

    /// State of a code slot
    pub fn state(&self, code_id: u32) -> Option<CodeState> {
        self.slots.get(code_id as usize).map(CodeSlot::state)
    }

    /// Publish `method` into its slot. The winner is admitted, counted and
    /// reported to the engine.
    pub fn publish(&self, method: Arc<AotCompiledMethod>) -> PublishResult {
        let Some(slot) = self.slots.get(method.code_id as usize) else {
            log::warn!(target: "aot::method", "publish of unknown code id {}", method.code_id);
            return PublishResult::Invalidated;
        };
        let result = slot.publish(method);
        if let PublishResult::Published(winner) = &result {
            self.admit(winner);
            self.stats.record_method_published();
            log::debug!(
                target: "aot::method",
                "published {} [{:#x}, {:#x})",
                winner.name(),
                winner.code_begin(),
                winner.code_end()
            );
            self.runtime.install_code(winner);
        }
        result
    }

    /// Visit every resolved method; stubs are skipped
    pub fn for_each_alive_method(&self, mut f: impl FnMut(&Arc<AotCompiledMethod>)) {
        for slot in self.slots.iter() {
            if let Some(method) = slot.resolved().filter(|m| !m.is_stub()) {
                f(method);
            }
        }
    }

    /// First resolved entry in slot order, stubs included
    pub fn first(&self) -> Option<Arc<AotCompiledMethod>> {
        self.next_from(0)
    }

    /// Next resolved entry after `code_id`
    pub fn next(&self, code_id: u32) -> Option<Arc<AotCompiledMethod>> {
        self.next_from(code_id as usize + 1)
    }

    fn next_from(&self, start: usize) -> Option<Arc<AotCompiledMethod>> {
        self.slots.get(start..)?.iter().find_map(|slot| slot.resolved().cloned())
    }

    /// Let the collector update or clear every resolved heap-object slot
    pub fn oops_do(&self, mut f: impl FnMut(ObjectRef) -> Option<ObjectRef>) {
        self.oop_got.update_each(|_, object| f(object));
    }

    /// Visit the metadata slots owned by alive methods
    pub fn metadata_do(&self, mut f: impl FnMut(MetadataRef)) {
        self.for_each_alive_method(|method| {
            for index in method.metadata_got() {
                if let Some(metadata) = self.metadata_got.get(index) {
                    f(metadata);
                }
            }
        });
    }

    /// Visit every resolved metaspace and metadata slot
    pub fn got_metadata_do(&self, mut f: impl FnMut(MetaspaceEntry)) {
        for (_, klass) in self.metaspace_got.iter_resolved() {
            f(MetaspaceEntry::Klass(klass));
        }
        for (_, metadata) in self.metadata_got.iter_resolved() {
            f(MetaspaceEntry::Metadata(metadata));
        }
    }

    /// Current value of a metaspace GOT slot
    pub fn metaspace_slot(&self, index: usize) -> Option<KlassRef> {
        self.metaspace_got.get(index)
    }

    /// Current value of a metadata GOT slot
    pub fn metadata_slot(&self, index: usize) -> Option<MetadataRef> {
        self.metadata_got.get(index)
    }

    /// Current value of a heap-object GOT slot
    pub fn oop_slot(&self, index: usize) -> Option<ObjectRef> {
        self.oop_got.get(index)
    }

    fn record(&self, code_id: u32) -> Option<SlotRecord> {
        self.records.get(code_id as usize).copied().flatten()
    }
}

fn slot_index(lib: &AotLib, code_id: i32, method_count: usize) -> Result<usize, AotError> {
    usize::try_from(code_id)
        .ok()
        .filter(|&index| index < method_count)
        .ok_or_else(|| AotError::format(lib.name(), format!("code id {} out of range", code_id)))
}

/// Code offsets are stored as `u32`
fn check_code_size(lib_name: &str, code_size: usize) -> Result<(), AotError> {
    if code_size > u32::MAX as usize {
        return Err(AotError::format(lib_name, format!("code section of {} bytes exceeds 4 GiB", code_size)));
    }
    Ok(())
}
