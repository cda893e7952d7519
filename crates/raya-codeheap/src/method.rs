//! Compiled methods and their code slots
//!
//! Every code id in a library has one [`CodeSlot`]. The slot is a small
//! state machine:
//!
//! ```text
//! Unresolved ──publish──▶ Resolved
//!      │                     │
//!      └──────invalidate─────┴──▶ Invalidated (terminal)
//! ```
//!
//! Publishing races are settled by a single compare-and-swap; the handle
//! lives in a `OnceCell`, so losers observe the winner's method.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use once_cell::sync::OnceCell;

use crate::library::MethodName;
use crate::runtime::{KlassRef, MethodRef};

/// Readiness of a code slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CodeState {
    /// Not linked yet
    Unresolved = 0,
    /// Linked and executable
    Resolved = 1,
    /// Never to be used again
    Invalidated = 2,
}

impl CodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CodeState::Unresolved,
            1 => CodeState::Resolved,
            _ => CodeState::Invalidated,
        }
    }
}

/// A method (or runtime stub) whose code lives in an AOT library
#[derive(Debug)]
pub struct AotCompiledMethod {
    pub(crate) code_id: u32,
    pub(crate) library_id: usize,
    pub(crate) name: MethodName,
    pub(crate) method: Option<MethodRef>,
    pub(crate) holder: Option<KlassRef>,
    pub(crate) class_id: Option<u32>,
    pub(crate) code_begin: usize,
    pub(crate) code_size: usize,
    pub(crate) entry_offset: usize,
    pub(crate) verified_entry_offset: usize,
    pub(crate) frame_size: u32,
    pub(crate) metadata_got: Range<usize>,
}

impl AotCompiledMethod {
    /// Code slot index within the library
    pub fn code_id(&self) -> u32 {
        self.code_id
    }

    /// Library the code belongs to
    pub fn library_id(&self) -> usize {
        self.library_id
    }

    /// Symbolic name
    pub fn name(&self) -> &MethodName {
        &self.name
    }

    /// Live method; `None` for runtime stubs
    pub fn method(&self) -> Option<MethodRef> {
        self.method
    }

    /// Live holder class; `None` for runtime stubs
    pub fn holder(&self) -> Option<KlassRef> {
        self.holder
    }

    /// Blob-local id of the holder class
    pub fn class_id(&self) -> Option<u32> {
        self.class_id
    }

    /// Runtime stubs have no holder and are never invalidated
    pub fn is_stub(&self) -> bool {
        self.method.is_none()
    }

    /// First byte of the code (the code id header)
    pub fn code_begin(&self) -> usize {
        self.code_begin
    }

    /// One past the last byte of the code
    pub fn code_end(&self) -> usize {
        self.code_begin + self.code_size
    }

    /// Whether `addr` lies inside this method's code
    pub fn contains(&self, addr: usize) -> bool {
        (self.code_begin..self.code_end()).contains(&addr)
    }

    /// Unverified entry point
    pub fn entry_point(&self) -> usize {
        self.code_begin + self.entry_offset
    }

    /// Verified entry point
    pub fn verified_entry_point(&self) -> usize {
        self.code_begin + self.verified_entry_offset
    }

    /// Frame size in bytes
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// The method's slice of the metadata GOT
    pub fn metadata_got(&self) -> Range<usize> {
        self.metadata_got.clone()
    }
}

/// Result of [`CodeSlot::publish`]
#[derive(Debug, Clone)]
pub enum PublishResult {
    /// This caller won; the handle is now visible
    Published(Arc<AotCompiledMethod>),
    /// Another caller won first; its handle is returned
    AlreadyPublished(Arc<AotCompiledMethod>),
    /// The slot was invalidated; nothing was published
    Invalidated,
}

/// Result of [`CodeSlot::invalidate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateOutcome {
    /// This call moved the slot to invalidated
    Invalidated {
        /// The slot held executable code
        was_resolved: bool,
    },
    /// The slot was already invalidated
    AlreadyInvalidated,
    /// Runtime stubs are never invalidated
    RuntimeStub,
}

/// Per-code-id registry entry
#[derive(Debug, Default)]
pub struct CodeSlot {
    state: AtomicU8,
    handle: OnceCell<Arc<AotCompiledMethod>>,
    admitted: AtomicBool,
}

impl CodeSlot {
    /// An unresolved, empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> CodeState {
        CodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Handle of a resolved slot
    pub fn resolved(&self) -> Option<&Arc<AotCompiledMethod>> {
        if self.state() == CodeState::Resolved {
            self.handle.get()
        } else {
            None
        }
    }

    /// Handle regardless of state, once one has been published
    pub fn handle(&self) -> Option<&Arc<AotCompiledMethod>> {
        self.handle.get()
    }

    /// Make `method` the slot's code. At most one caller ever wins.
    pub fn publish(&self, method: Arc<AotCompiledMethod>) -> PublishResult {
        match self.state() {
            CodeState::Invalidated => return PublishResult::Invalidated,
            CodeState::Resolved => {
                if let Some(winner) = self.handle.get() {
                    return PublishResult::AlreadyPublished(Arc::clone(winner));
                }
            }
            CodeState::Unresolved => {}
        }

        if self.handle.set(Arc::clone(&method)).is_err() {
            // Lost the race; wait for the winner's state transition
            let backoff = Backoff::new();
            loop {
                match self.state() {
                    CodeState::Resolved => {
                        return match self.handle.get() {
                            Some(winner) => PublishResult::AlreadyPublished(Arc::clone(winner)),
                            None => PublishResult::Invalidated,
                        };
                    }
                    CodeState::Invalidated => return PublishResult::Invalidated,
                    CodeState::Unresolved => backoff.snooze(),
                }
            }
        }

        match self.state.compare_exchange(
            CodeState::Unresolved as u8,
            CodeState::Resolved as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => PublishResult::Published(method),
            Err(_) => PublishResult::Invalidated,
        }
    }

    /// Install a runtime stub: resolved from the start
    pub(crate) fn publish_stub(&self, stub: Arc<AotCompiledMethod>) -> bool {
        if self.handle.set(stub).is_err() {
            return false;
        }
        self.state.store(CodeState::Resolved as u8, Ordering::Release);
        true
    }

    /// Move the slot to invalidated
    pub fn invalidate(&self) -> InvalidateOutcome {
        if self.handle.get().is_some_and(|h| h.is_stub()) {
            return InvalidateOutcome::RuntimeStub;
        }
        match CodeState::from_u8(self.state.swap(CodeState::Invalidated as u8, Ordering::AcqRel)) {
            CodeState::Invalidated => InvalidateOutcome::AlreadyInvalidated,
            CodeState::Resolved => InvalidateOutcome::Invalidated { was_resolved: true },
            CodeState::Unresolved => InvalidateOutcome::Invalidated { was_resolved: false },
        }
    }

    /// Invalidate only if nothing was published yet
    pub fn invalidate_unresolved(&self) -> bool {
        self.state
            .compare_exchange(
                CodeState::Unresolved as u8,
                CodeState::Invalidated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark the code as part of the heap's bounds; true the first time
    pub(crate) fn admit(&self) -> bool {
        !self.admitted.swap(true, Ordering::AcqRel)
    }

    /// Whether the code has been admitted
    pub fn is_admitted(&self) -> bool {
        self.admitted.load(Ordering::Acquire)
    }
}
