//! Raya AOT code heap
//!
//! Loads precompiled native code produced by the out-of-process AOT
//! compiler and links it against the live class model, so the engine can
//! run AOT code in place of freshly JIT-compiled code:
//! - **Format**: blob layout, bounds-checked reader, builder (`format` module)
//! - **Loader**: parsing and mapping a blob (`library` module)
//! - **Validation**: build configuration gate (`validate` module)
//! - **Heap**: code slots, GOTs, class linkage, invalidation (`heap` module)
//! - **Session**: the set of loaded heaps (`cache` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use raya_codeheap::{AotCacheConfig, AotCodeCache, EngineConfig};
//!
//! let cache = AotCodeCache::new(AotCacheConfig::default(), EngineConfig::default(), runtime);
//! cache.load_file(Path::new("libjava.base.aot"))?;
//!
//! // On class initialization
//! let published = cache.load_klass_data(&live_class);
//!
//! // From a signal handler or the stack walker
//! if let Some(method) = cache.find_owner(pc) {
//!     println!("pc in {}", method.name());
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]

pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod format;
pub mod got;
pub mod heap;
pub mod library;
pub mod method;
pub mod runtime;
pub mod stats;
pub mod validate;

pub use cache::AotCodeCache;
pub use config::{AotCacheConfig, EngineConfig};
pub use error::{AotError, ResolveMiss};
pub use fingerprint::{ClassShape, FieldShape};
pub use got::{GotReferent, GotTable};
pub use heap::{AotCodeHeap, ClassEntry, CodeBounds, MetaspaceEntry, SweepReport};
pub use library::{AotLib, LoadOptions, MethodName, Symbol};
pub use method::{AotCompiledMethod, CodeSlot, CodeState, InvalidateOutcome, PublishResult};
pub use runtime::{KlassRef, LiveClass, LiveMethod, LoaderId, MetadataRef, MethodRef, ObjectRef, Runtime};
pub use stats::{AotStatistics, StatsSnapshot};
pub use validate::{validate_config, verify_library, CompressedShifts};
