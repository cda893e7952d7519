//! Linkage statistics
//!
//! Counters bumped on every class examined and every miss. Shared by all
//! heaps of a session.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic linkage counters
#[derive(Debug, Default)]
pub struct AotStatistics {
    classes_examined: AtomicU64,
    classes_found: AtomicU64,
    fingerprint_misses: AtomicU64,
    classloader_misses: AtomicU64,
    methods_published: AtomicU64,
    methods_invalidated: AtomicU64,
    unresolved_references: AtomicU64,
}

/// Point-in-time copy of [`AotStatistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Classes looked up in some library
    pub classes_examined: u64,
    /// Classes bound to AOT code
    pub classes_found: u64,
    /// Classes rejected because their shape changed
    pub fingerprint_misses: u64,
    /// Classes rejected because another loader owns the binding
    pub classloader_misses: u64,
    /// Methods made executable
    pub methods_published: u64,
    /// Methods invalidated
    pub methods_invalidated: u64,
    /// GOT slots that failed to resolve
    pub unresolved_references: u64,
}

macro_rules! counter {
    ($bump:ident, $field:ident) => {
        pub(crate) fn $bump(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl AotStatistics {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_class_examined, classes_examined);
    counter!(record_class_found, classes_found);
    counter!(record_fingerprint_miss, fingerprint_misses);
    counter!(record_classloader_miss, classloader_misses);
    counter!(record_method_published, methods_published);
    counter!(record_method_invalidated, methods_invalidated);
    counter!(record_unresolved_reference, unresolved_references);

    /// Copy the current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            classes_examined: self.classes_examined.load(Ordering::Relaxed),
            classes_found: self.classes_found.load(Ordering::Relaxed),
            fingerprint_misses: self.fingerprint_misses.load(Ordering::Relaxed),
            classloader_misses: self.classloader_misses.load(Ordering::Relaxed),
            methods_published: self.methods_published.load(Ordering::Relaxed),
            methods_invalidated: self.methods_invalidated.load(Ordering::Relaxed),
            unresolved_references: self.unresolved_references.load(Ordering::Relaxed),
        }
    }

    /// Log the counters at info level
    pub fn log_summary(&self) {
        let s = self.snapshot();
        log::info!(
            target: "aot::load",
            "AOT classes: examined={} found={} fingerprint_miss={} classloader_miss={}",
            s.classes_examined,
            s.classes_found,
            s.fingerprint_misses,
            s.classloader_misses
        );
        log::info!(
            target: "aot::load",
            "AOT methods: published={} invalidated={} unresolved_refs={}",
            s.methods_published,
            s.methods_invalidated,
            s.unresolved_references
        );
    }
}
