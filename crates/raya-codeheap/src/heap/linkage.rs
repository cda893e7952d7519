//! Class linkage and GOT resolution
//!
//! A live class is matched to its blob record by name, then gated on
//! redefinition, fingerprint, assertion status and classloader. Once a
//! class passes, its methods are published lazily the first time the
//! engine asks for them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{AotError, ResolveMiss};
use crate::format::{KlassRecord, MethodRecord};
use crate::method::{CodeState, PublishResult};
use crate::runtime::{KlassRef, LiveClass, LoaderId, MetadataRef, ObjectRef};

use super::AotCodeHeap;

/// A class record of the blob with its blob-local id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassEntry {
    /// Blob-local class id
    pub class_id: u32,
    /// The record itself
    pub record: KlassRecord,
}

/// Per-class binding to the loader that first linked it.
///
/// Never reset: a class reloaded by another loader cannot reuse the code.
#[derive(Debug, Default)]
pub(super) struct AotClass {
    /// 0 while unbound, otherwise loader id + 1
    loader: AtomicU64,
}

impl AotClass {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Bind to `loader` unless bound to another one
    fn bind(&self, loader: LoaderId) -> bool {
        let tagged = loader.0 as u64 + 1;
        match self.loader.compare_exchange(0, tagged, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(current) => current == tagged,
        }
    }

    fn loader(&self) -> Option<LoaderId> {
        match self.loader.load(Ordering::Acquire) {
            0 => None,
            tagged => Some(LoaderId((tagged - 1) as u32)),
        }
    }
}

impl AotCodeHeap {
    /// Class record exported under `name`
    pub fn find_klass(&self, name: &str) -> Option<ClassEntry> {
        match self.lib.find_klass_record(name) {
            Ok(Some(record)) => self.class_entry(record.class_id as u32),
            Ok(None) => None,
            Err(err) => {
                log::warn!(target: "aot::class", "bad class record for {}: {}", name, err);
                None
            }
        }
    }

    pub(super) fn class_entry(&self, class_id: u32) -> Option<ClassEntry> {
        if class_id as usize >= self.classes.len() {
            return None;
        }
        let record = self.lib.klass_record(class_id).ok()?;
        Some(ClassEntry { class_id, record })
    }

    /// Class entry bound to a live class, if linkage succeeded before
    pub fn bound_entry(&self, klass: KlassRef) -> Option<ClassEntry> {
        let class_id = *self.bindings.get(&klass)?;
        self.class_entry(class_id)
    }

    /// Class entry for a live class, bound or only reached through its
    /// metaspace slot
    pub(super) fn entry_for_klass(&self, klass: KlassRef) -> Option<ClassEntry> {
        if let Some(entry) = self.bound_entry(klass) {
            return Some(entry);
        }
        let (got_index, _) = self.metaspace_got.iter_resolved().find(|&(_, k)| k == klass)?;
        (0..self.classes.len() as u32)
            .filter_map(|class_id| self.class_entry(class_id))
            .find(|entry| entry.record.got_index as usize == got_index)
    }

    /// Loader a blob class is bound to
    pub fn bound_loader(&self, class_id: u32) -> Option<LoaderId> {
        self.classes.get(class_id as usize)?.loader()
    }

    /// Match a live class against the blob.
    ///
    /// On success the class id is bound to the live class's loader and the
    /// class's own metaspace slot is filled. A slot already holding another
    /// class counts as a classloader miss. Repeated calls for a bound
    /// class are answered from the binding cache.
    pub fn resolve_class(&self, live: &LiveClass) -> Result<ClassEntry, ResolveMiss> {
        if let Some(entry) = self.bound_entry(live.klass) {
            return Ok(entry);
        }

        self.stats.record_class_examined();
        let entry = self.find_klass(&live.name).ok_or(ResolveMiss::NotFound)?;
        let got_index = entry.record.got_index as usize;

        let miss = if live.redefined {
            Some(ResolveMiss::Redefined)
        } else if entry.record.fingerprint != live.fingerprint {
            self.stats.record_fingerprint_miss();
            Some(ResolveMiss::FingerprintMismatch)
        } else if self.lib.config().omit_assertions && live.assertions_enabled {
            Some(ResolveMiss::AssertionsEnabled)
        } else if self.metaspace_got.get(got_index).is_some_and(|k| k != live.klass)
            || !self.classes[entry.class_id as usize].bind(live.loader)
            || self.metaspace_got.set_if_null(got_index, live.klass) != Some(live.klass)
        {
            // The slot may already hold the class as another loader sees it
            self.stats.record_classloader_miss();
            Some(ResolveMiss::ClassloaderMismatch)
        } else {
            None
        };
        if let Some(miss) = miss {
            log::debug!(target: "aot::class", "{} in {}: {}", live.name, self.lib.name(), miss);
            return Err(miss);
        }

        self.bindings.insert(live.klass, entry.class_id);
        self.stats.record_class_found();
        log::debug!(
            target: "aot::class",
            "bound {} to class {} of {} (loader {})",
            live.name,
            entry.class_id,
            self.lib.name(),
            live.loader.0
        );
        Ok(entry)
    }

    /// Link `live` and publish every method the blob holds for it.
    ///
    /// Returns how many methods this call made executable. A shape miss
    /// (fingerprint, redefinition, assertions) sweeps the class's
    /// dependents and retires its unresolved methods.
    pub fn load_klass_data(&self, live: &LiveClass) -> Result<usize, ResolveMiss> {
        if self.is_linkage_disabled() {
            return Err(ResolveMiss::LinkageDisabled);
        }

        let entry = match self.resolve_class(live) {
            Ok(entry) => entry,
            Err(miss) => {
                if matches!(
                    miss,
                    ResolveMiss::FingerprintMismatch | ResolveMiss::Redefined | ResolveMiss::AssertionsEnabled
                ) {
                    if let Some(entry) = self.find_klass(&live.name) {
                        self.invalidate_dependents(&entry);
                        self.invalidate_unresolved_methods(&entry);
                    }
                }
                return Err(miss);
            }
        };

        if !self.link_runtime_routines() {
            return Err(ResolveMiss::LinkageDisabled);
        }

        let methods = match self.lib.compiled_methods(&entry.record) {
            Ok(methods) => methods,
            Err(err) => {
                log::warn!(target: "aot::class", "methods of {}: {}", live.name, err);
                return Ok(0);
            }
        };

        let mut published = 0;
        for record in &methods {
            match self.publish_method(&entry, live, record) {
                Ok(true) => published += 1,
                Ok(false) => {}
                Err(err) => {
                    if matches!(err, AotError::UnresolvedReference { .. }) {
                        self.stats.record_unresolved_reference();
                    }
                    log::debug!(target: "aot::method", "not publishing code {}: {}", record.code_id, err);
                }
            }
        }
        Ok(published)
    }

    /// Resolve one method's references and publish it.
    /// `Ok(false)` when there is nothing to do for the method.
    fn publish_method(
        &self,
        entry: &ClassEntry,
        live: &LiveClass,
        record: &MethodRecord,
    ) -> Result<bool, AotError> {
        let code_id = record.code_id as u32;
        match self.state(code_id) {
            Some(CodeState::Unresolved) => {}
            _ => return Ok(false),
        }

        let name = self.lib.method_name(record)?;
        let Some(live_method) = self.runtime.find_method(live.klass, &name) else {
            log::debug!(target: "aot::method", "{} has no live method", name);
            return Ok(false);
        };
        if live_method.has_code || live_method.excluded {
            return Ok(false);
        }

        let meta = self.lib.method_meta(record)?;
        let in_method = |err: AotError| match err {
            AotError::UnresolvedReference { reference, .. } => {
                AotError::UnresolvedReference { method: name.to_string(), reference }
            }
            other => other,
        };
        for &index in &meta.klass_refs {
            self.resolve_metaspace_slot(index, live.loader).map_err(in_method)?;
        }
        for local in 0..meta.metadata_names.len() {
            self.resolve_metadata_slot(code_id, local, live).map_err(in_method)?;
        }
        for &index in &meta.oop_refs {
            self.resolve_oop_slot(index).map_err(in_method)?;
        }

        let method = self.build_method(
            record,
            &meta,
            name,
            Some(live_method.method),
            Some(live.klass),
            Some(entry.class_id),
        )?;
        Ok(matches!(self.publish(Arc::new(method)), PublishResult::Published(_)))
    }

    fn unresolved(&self, reference: String) -> AotError {
        AotError::UnresolvedReference { method: self.lib.name().to_string(), reference }
    }

    /// Resolve metaspace slot `index` to the class it names
    pub fn resolve_metaspace_slot(&self, index: u32, loader: LoaderId) -> Result<KlassRef, AotError> {
        let name = self.lib.metaspace_name(index)?;
        self.metaspace_got
            .get_or_resolve(index as usize, || self.runtime.find_class(name, loader))
            .ok_or_else(|| self.unresolved(format!("class {}", name)))
    }

    /// Resolve local metadata slot `local` of method `code_id`
    pub fn resolve_metadata_slot(
        &self,
        code_id: u32,
        local: usize,
        holder: &LiveClass,
    ) -> Result<MetadataRef, AotError> {
        let record = self
            .record(code_id)
            .map(|slot| slot.record)
            .ok_or_else(|| self.unresolved(format!("code id {}", code_id)))?;
        let meta = self.lib.method_meta(&record)?;
        let name_offset = *meta
            .metadata_names
            .get(local)
            .ok_or_else(|| self.unresolved(format!("metadata slot {} of code {}", local, code_id)))?;
        let descriptor = self.lib.pool_name(name_offset)?;

        let index = usize::try_from(record.metadata_got_offset).unwrap_or(usize::MAX).saturating_add(local);
        self.metadata_got
            .get_or_resolve(index, || self.runtime.resolve_metadata(descriptor, holder))
            .ok_or_else(|| self.unresolved(format!("metadata {}", descriptor)))
    }

    /// Resolve heap-object slot `index`
    pub fn resolve_oop_slot(&self, index: u32) -> Result<ObjectRef, AotError> {
        let descriptor = self.lib.oop_name(index)?;
        self.oop_got
            .get_or_resolve(index as usize, || self.runtime.resolve_object(descriptor))
            .ok_or_else(|| self.unresolved(format!("object {}", descriptor)))
    }

    /// Class `name` through the metaspace GOT, resolving it on first use
    /// from the loader of `from`
    pub fn get_klass_from_got(&self, name: &str, from: &LiveClass) -> Option<KlassRef> {
        let entry = self.find_klass(name)?;
        self.metaspace_got.get_or_resolve(entry.record.got_index as usize, || {
            self.runtime.find_class(name, from.loader)
        })
    }

    /// Link the runtime routines the code calls. Runs once; a missing
    /// routine disables linkage for the whole heap.
    fn link_runtime_routines(&self) -> bool {
        let linked = self.runtime_links.get_or_try_init(|| -> Result<Box<[usize]>, AotError> {
            let routines = self.lib.runtime_links()?;
            let addresses = routines
                .iter()
                .map(|&routine| {
                    self.runtime.runtime_routine(routine).ok_or_else(|| AotError::MissingRuntimeRoutine {
                        library: self.lib.name().to_string(),
                        routine: routine.to_string(),
                    })
                })
                .collect::<Result<Box<[usize]>, AotError>>()?;
            log::debug!(target: "aot::load", "linked {} runtime routines for {}", addresses.len(), self.lib.name());
            Ok(addresses)
        });

        match linked {
            Ok(_) => true,
            Err(err) => {
                log::warn!(target: "aot::load", "disabling {}: {}", self.lib.name(), err);
                self.linkage_disabled.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Address linked for runtime routine `index`
    pub fn runtime_routine_address(&self, index: usize) -> Option<usize> {
        self.runtime_links.get()?.get(index).copied()
    }

    /// Whether runtime linking failed for this heap
    pub fn is_linkage_disabled(&self) -> bool {
        self.linkage_disabled.load(Ordering::Acquire)
    }
}
