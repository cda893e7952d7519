//! AOT cache session
//!
//! Owns every code heap the engine loaded, the compressed-shift agreement
//! between them and the shared statistics. The engine keeps one session
//! and routes class loading, redefinition, unloading and GC walks through
//! it.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{AotCacheConfig, EngineConfig};
use crate::error::AotError;
use crate::heap::{AotCodeHeap, MetaspaceEntry, SweepReport};
use crate::library::{AotLib, LoadOptions};
use crate::method::AotCompiledMethod;
use crate::runtime::{KlassRef, LiveClass, ObjectRef, Runtime};
use crate::stats::{AotStatistics, StatsSnapshot};
use crate::validate::{verify_library, CompressedShifts};

/// Registry of loaded AOT libraries
pub struct AotCodeCache {
    config: AotCacheConfig,
    engine: EngineConfig,
    runtime: Arc<dyn Runtime>,
    shifts: CompressedShifts,
    heaps: RwLock<Vec<Arc<AotCodeHeap>>>,
    stats: Arc<AotStatistics>,
    next_id: AtomicUsize,
}

impl std::fmt::Debug for AotCodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AotCodeCache")
            .field("config", &self.config)
            .field("heaps", &self.heaps.read().len())
            .finish()
    }
}

impl AotCodeCache {
    /// Start an empty session
    pub fn new(config: AotCacheConfig, engine: EngineConfig, runtime: Arc<dyn Runtime>) -> Self {
        AotCodeCache {
            config,
            engine,
            runtime,
            shifts: CompressedShifts::new(),
            heaps: RwLock::new(Vec::new()),
            stats: Arc::new(AotStatistics::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Session options
    pub fn config(&self) -> &AotCacheConfig {
        &self.config
    }

    /// Compressed pointer shifts fixed by the first library
    pub fn shifts(&self) -> &CompressedShifts {
        &self.shifts
    }

    /// Load a library from memory.
    ///
    /// Returns `Ok(None)` when loading is disabled or the library was
    /// rejected and `strict_loading` is off.
    pub fn load(&self, bytes: Vec<u8>, name: &str) -> Result<Option<Arc<AotCodeHeap>>, AotError> {
        if !self.config.enabled {
            return Ok(None);
        }
        if self.is_loaded(name) {
            return self.reject(AotError::DuplicateLibrary(name.to_string()));
        }
        let options = LoadOptions { verify_checksum: self.config.verify_checksum, map_executable: false };
        match AotLib::load_with(bytes, name, self.next_id(), options) {
            Ok(lib) => self.register(lib),
            Err(err) => self.reject(err),
        }
    }

    /// Load a library file, mapping its code executable
    pub fn load_file(&self, path: &Path) -> Result<Option<Arc<AotCodeHeap>>, AotError> {
        if !self.config.enabled {
            return Ok(None);
        }
        match AotLib::load_file_with(path, self.next_id(), self.config.verify_checksum) {
            Ok(lib) if self.is_loaded(lib.name()) => {
                self.reject(AotError::DuplicateLibrary(lib.name().to_string()))
            }
            Ok(lib) => self.register(lib),
            Err(err) => self.reject(err),
        }
    }

    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_loaded(&self, name: &str) -> bool {
        self.heaps.read().iter().any(|heap| heap.library().name() == name)
    }

    fn register(&self, lib: AotLib) -> Result<Option<Arc<AotCodeHeap>>, AotError> {
        if let Err(err) = verify_library(&lib, &self.engine, &self.shifts) {
            return self.reject(err);
        }
        let heap = match AotCodeHeap::with_statistics(
            Arc::new(lib),
            Arc::clone(&self.runtime),
            Arc::clone(&self.stats),
        ) {
            Ok(heap) => Arc::new(heap),
            Err(err) => return self.reject(err),
        };

        let mut heaps = self.heaps.write();
        let name = heap.library().name();
        if heaps.iter().any(|h| h.library().name() == name) {
            drop(heaps);
            return self.reject(AotError::DuplicateLibrary(name.to_string()));
        }
        heaps.push(Arc::clone(&heap));
        log::info!(target: "aot::load", "loaded AOT library {}", name);
        Ok(Some(heap))
    }

    fn reject(&self, err: AotError) -> Result<Option<Arc<AotCodeHeap>>, AotError> {
        if self.config.strict_loading {
            Err(err)
        } else {
            log::warn!(target: "aot::load", "skipping AOT library: {}", err);
            Ok(None)
        }
    }

    /// Heaps in load order
    pub fn heaps(&self) -> Vec<Arc<AotCodeHeap>> {
        self.heaps.read().clone()
    }

    /// Heap whose admitted code contains `addr`
    pub fn find_heap(&self, addr: usize) -> Option<Arc<AotCodeHeap>> {
        self.heaps.read().iter().find(|heap| heap.contains(addr)).cloned()
    }

    /// Whether any heap contains `addr`
    pub fn contains(&self, addr: usize) -> bool {
        self.heaps.read().iter().any(|heap| heap.contains(addr))
    }

    /// Executable AOT code owning `addr`
    pub fn find_owner(&self, addr: usize) -> Option<Arc<AotCompiledMethod>> {
        self.heaps.read().iter().find_map(|heap| heap.find_owner(addr))
    }

    /// Link `live` in every heap and publish its methods; returns how
    /// many methods became executable
    pub fn load_klass_data(&self, live: &LiveClass) -> usize {
        let heaps = self.heaps();
        heaps.iter().filter_map(|heap| heap.load_klass_data(live).ok()).sum()
    }

    /// Sweep the dependents of `class_name` in every heap
    pub fn invalidate_dependents_of(&self, class_name: &str) -> SweepReport {
        self.sweep(|heap| heap.invalidate_dependents_of(class_name))
    }

    /// Class redefinition hook
    pub fn flush_evol_dependents_on(&self, klass: KlassRef) -> SweepReport {
        self.sweep(|heap| heap.flush_evol_dependents_on(klass))
    }

    /// Class unloading hook
    pub fn on_class_unloaded(&self, klass: KlassRef) -> SweepReport {
        self.sweep(|heap| heap.on_class_unloaded(klass))
    }

    fn sweep(&self, f: impl Fn(&AotCodeHeap) -> SweepReport) -> SweepReport {
        let mut report = SweepReport::default();
        for heap in self.heaps() {
            report.merge(f(heap.as_ref()));
        }
        report
    }

    /// GC root walk over every heap's heap-object slots
    pub fn oops_do(&self, mut f: impl FnMut(ObjectRef) -> Option<ObjectRef>) {
        for heap in self.heaps() {
            heap.oops_do(&mut f);
        }
    }

    /// Metadata walk over every heap's GOTs
    pub fn got_metadata_do(&self, mut f: impl FnMut(MetaspaceEntry)) {
        for heap in self.heaps() {
            heap.got_metadata_do(&mut f);
        }
    }

    /// Current statistics
    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for AotCodeCache {
    fn drop(&mut self) {
        if self.config.print_statistics {
            self.stats.log_summary();
        }
    }
}
