//! Global offset tables
//!
//! Compiled code never embeds live addresses. It loads them through GOT
//! slots that start out null and are filled in lazily at link time. A
//! table is typed by what its slots resolve to, so a metaspace slot can
//! never be read back as a heap object.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::{KlassRef, MetadataRef, ObjectRef};

/// A value that can live in a GOT slot
pub trait GotReferent: Copy {
    /// Decode a non-zero slot value
    fn from_raw(raw: u64) -> Option<Self>;
    /// Encode as a non-zero slot value
    fn to_raw(self) -> u64;
}

macro_rules! impl_referent {
    ($($ty:ty),*) => {
        $(
            impl GotReferent for $ty {
                fn from_raw(raw: u64) -> Option<Self> {
                    <$ty>::new(raw)
                }

                fn to_raw(self) -> u64 {
                    self.raw()
                }
            }
        )*
    };
}

impl_referent!(KlassRef, MetadataRef, ObjectRef);

/// Fixed-size table of lazily resolved references.
///
/// A slot is either null or a live reference. Resolution is first-write
/// wins: once a slot holds a value it only changes through [`clear`](Self::clear)
/// or the collector's [`update_each`](Self::update_each).
pub struct GotTable<T> {
    slots: Box<[AtomicU64]>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: GotReferent> GotTable<T> {
    /// Create a table of `len` null slots
    pub fn new(len: usize) -> Self {
        GotTable {
            slots: (0..len).map(|_| AtomicU64::new(0)).collect(),
            _marker: PhantomData,
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current value of a slot; `None` when null or out of range
    pub fn get(&self, index: usize) -> Option<T> {
        let raw = self.slots.get(index)?.load(Ordering::Acquire);
        T::from_raw(raw)
    }

    /// Store `value` unless the slot is already resolved; returns the
    /// value the slot ends up holding
    pub fn set_if_null(&self, index: usize, value: T) -> Option<T> {
        let slot = self.slots.get(index)?;
        match slot.compare_exchange(0, value.to_raw(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Some(value),
            Err(current) => T::from_raw(current),
        }
    }

    /// Return the slot's value, resolving it with `resolve` if null.
    ///
    /// Concurrent resolvers may both run `resolve`; only the first store
    /// is kept and every caller sees it.
    pub fn get_or_resolve(&self, index: usize, resolve: impl FnOnce() -> Option<T>) -> Option<T> {
        if let Some(value) = self.get(index) {
            return Some(value);
        }
        if index >= self.slots.len() {
            return None;
        }
        let value = resolve()?;
        self.set_if_null(index, value)
    }

    /// Null a slot, returning its previous value
    pub fn clear(&self, index: usize) -> Option<T> {
        let raw = self.slots.get(index)?.swap(0, Ordering::AcqRel);
        T::from_raw(raw)
    }

    /// Resolved slots with their indices
    pub fn iter_resolved(&self) -> impl Iterator<Item = (usize, T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| T::from_raw(slot.load(Ordering::Acquire)).map(|v| (index, v)))
    }

    /// Let `f` update every resolved slot; returning `None` clears it.
    ///
    /// A slot changed by someone else while `f` runs keeps the other value.
    pub fn update_each(&self, mut f: impl FnMut(usize, T) -> Option<T>) {
        for (index, slot) in self.slots.iter().enumerate() {
            let raw = slot.load(Ordering::Acquire);
            let Some(value) = T::from_raw(raw) else {
                continue;
            };
            let updated = f(index, value).map_or(0, T::to_raw);
            if updated != raw {
                let _ = slot.compare_exchange(raw, updated, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }
}

impl<T> std::fmt::Debug for GotTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resolved = self.slots.iter().filter(|s| s.load(Ordering::Relaxed) != 0).count();
        f.debug_struct("GotTable")
            .field("len", &self.slots.len())
            .field("resolved", &resolved)
            .finish()
    }
}
