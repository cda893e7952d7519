//! Dependency sweeps
//!
//! Compiled code assumes things about the classes it was compiled
//! against. The blob records, per class, which code ids depend on that
//! class's shape; the lists are read straight from the blob when the
//! hierarchy changes and every listed slot is moved to invalidated.

use crate::method::{CodeState, InvalidateOutcome};
use crate::runtime::KlassRef;

use super::{AotCodeHeap, ClassEntry};

/// What a sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Slots this sweep moved to invalidated
    pub invalidated: usize,
    /// Of those, slots that held executable code
    pub deoptimized: usize,
    /// Slots that were already invalidated
    pub already_invalidated: usize,
    /// Runtime stubs left alone
    pub stubs_skipped: usize,
}

impl SweepReport {
    pub(crate) fn merge(&mut self, other: SweepReport) {
        self.invalidated += other.invalidated;
        self.deoptimized += other.deoptimized;
        self.already_invalidated += other.already_invalidated;
        self.stubs_skipped += other.stubs_skipped;
    }
}

impl AotCodeHeap {
    /// Invalidate every method that depends on `entry`'s class. Idempotent.
    pub fn invalidate_dependents(&self, entry: &ClassEntry) -> SweepReport {
        let dependents = match self.lib.dependent_methods(&entry.record) {
            Ok(dependents) => dependents,
            Err(err) => {
                log::warn!(target: "aot::deopt", "dependents of class {}: {}", entry.class_id, err);
                return SweepReport::default();
            }
        };

        let mut report = SweepReport::default();
        for code_id in dependents {
            self.invalidate_code(code_id, &mut report);
        }
        if report.invalidated > 0 {
            log::debug!(
                target: "aot::deopt",
                "class {} of {}: invalidated {} dependents ({} deoptimized)",
                entry.class_id,
                self.lib.name(),
                report.invalidated,
                report.deoptimized
            );
        }
        report
    }

    /// Sweep the dependents of the class named `class_name`, bound or not.
    ///
    /// Used when a new subclass or implementor invalidates assumptions
    /// made about `class_name`.
    pub fn invalidate_dependents_of(&self, class_name: &str) -> SweepReport {
        match self.find_klass(class_name) {
            Some(entry) => self.invalidate_dependents(&entry),
            None => SweepReport::default(),
        }
    }

    /// Whether code `code_id` depends on the live class `klass`
    pub fn is_dependent(&self, klass: KlassRef, code_id: u32) -> bool {
        let Some(entry) = self.entry_for_klass(klass) else {
            return false;
        };
        self.lib
            .dependent_methods(&entry.record)
            .is_ok_and(|dependents| dependents.contains(&code_id))
    }

    /// `klass` is being redefined: drop its binding, invalidate its own
    /// executable methods and everything depending on it.
    ///
    /// A class never linked here is still found through its metaspace slot.
    pub fn flush_evol_dependents_on(&self, klass: KlassRef) -> SweepReport {
        let Some(entry) = self.entry_for_klass(klass) else {
            return SweepReport::default();
        };
        self.bindings.remove(&klass);

        let mut report = self.invalidate_dependents(&entry);
        report.merge(self.invalidate_class_methods(entry.class_id, |state| state == CodeState::Resolved));
        log::info!(
            target: "aot::deopt",
            "redefinition of class {} in {}: {} methods invalidated",
            entry.class_id,
            self.lib.name(),
            report.invalidated
        );
        report
    }

    /// `klass` was unloaded: drop its binding, invalidate its methods and
    /// dependents, clear every metaspace slot pointing at it.
    pub fn on_class_unloaded(&self, klass: KlassRef) -> SweepReport {
        let entry = self.entry_for_klass(klass);
        self.bindings.remove(&klass);
        self.metaspace_got.update_each(|_, k| (k != klass).then_some(k));

        let Some(entry) = entry else {
            return SweepReport::default();
        };
        let mut report = self.invalidate_dependents(&entry);
        report.merge(self.invalidate_class_methods(entry.class_id, |state| state != CodeState::Invalidated));
        log::debug!(
            target: "aot::deopt",
            "unloaded class {} of {}: {} methods invalidated",
            entry.class_id,
            self.lib.name(),
            report.invalidated
        );
        report
    }

    /// Retire the unresolved methods of a class that can never be linked
    pub(super) fn invalidate_unresolved_methods(&self, entry: &ClassEntry) -> usize {
        let mut retired = 0;
        for (slot, record) in self.slots.iter().zip(self.records.iter()) {
            if record.is_some_and(|r| r.class_id == Some(entry.class_id)) && slot.invalidate_unresolved() {
                self.stats.record_method_invalidated();
                retired += 1;
            }
        }
        retired
    }

    fn invalidate_class_methods(&self, class_id: u32, select: impl Fn(CodeState) -> bool) -> SweepReport {
        let mut report = SweepReport::default();
        for (code_id, record) in self.records.iter().enumerate() {
            if record.is_some_and(|r| r.class_id == Some(class_id)) && select(self.slots[code_id].state()) {
                self.invalidate_code(code_id as u32, &mut report);
            }
        }
        report
    }

    fn invalidate_code(&self, code_id: u32, report: &mut SweepReport) {
        let Some(slot) = self.slots.get(code_id as usize) else {
            return;
        };
        match slot.invalidate() {
            InvalidateOutcome::Invalidated { was_resolved } => {
                report.invalidated += 1;
                self.stats.record_method_invalidated();
                if was_resolved {
                    report.deoptimized += 1;
                    if let Some(method) = slot.handle() {
                        log::trace!(target: "aot::deopt", "deoptimizing {}", method.name());
                        self.runtime.mark_for_deoptimization(method);
                    }
                }
            }
            InvalidateOutcome::AlreadyInvalidated => report.already_invalidated += 1,
            InvalidateOutcome::RuntimeStub => report.stubs_skipped += 1,
        }
    }
}
