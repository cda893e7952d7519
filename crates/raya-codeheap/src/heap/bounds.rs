//! Address bounds of the admitted code
//!
//! Both bounds live in one 64-bit word as offsets from the code base:
//! low offset in the low 32 bits, high offset in the high 32 bits. A word
//! of 0 means no code has been admitted. Readers take a single atomic
//! load and can never observe a torn pair.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::Backoff;

/// Monotonically growing `[low, high)` range
#[derive(Debug, Default)]
pub struct CodeBounds {
    word: AtomicU64,
}

fn pack(low: u32, high: u32) -> u64 {
    ((high as u64) << 32) | low as u64
}

fn unpack(word: u64) -> Option<(u32, u32)> {
    if word == 0 {
        None
    } else {
        Some((word as u32, (word >> 32) as u32))
    }
}

impl CodeBounds {
    /// Empty bounds
    pub fn new() -> Self {
        Self::default()
    }

    /// Current `(low, high)` offsets, `None` while empty
    pub fn get(&self) -> Option<(u32, u32)> {
        unpack(self.word.load(Ordering::Acquire))
    }

    /// Whether `offset` is inside the bounds
    pub fn contains(&self, offset: usize) -> bool {
        match self.get() {
            Some((low, high)) => (low as usize..high as usize).contains(&offset),
            None => false,
        }
    }

    /// Grow the bounds to cover `[low, high)`. Never shrinks; empty
    /// ranges are ignored.
    pub fn widen(&self, low: u32, high: u32) {
        if low >= high {
            return;
        }
        let backoff = Backoff::new();
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let (new_low, new_high) = match unpack(current) {
                Some((cur_low, cur_high)) => (cur_low.min(low), cur_high.max(high)),
                None => (low, high),
            };
            let new = pack(new_low, new_high);
            if new == current {
                return;
            }
            match self.word.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }
}
