//! Engine and cache configuration

use serde::{Deserialize, Serialize};

/// Configuration of the running engine.
///
/// A blob is only usable when the build configuration it records matches
/// these values exactly (see [`crate::validate`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine build identifier; must equal the blob's version marker
    pub engine_version: String,
    /// Whether the engine runs tiered compilation
    pub tiered_compilation: bool,
    /// Debug build of the engine
    pub debug_vm: bool,
    /// Compressed object pointers
    pub use_compressed_oops: bool,
    /// Compressed class pointers
    pub use_compressed_class_pointers: bool,
    /// Fields packed into superclass gaps
    pub compact_fields: bool,
    /// G1 collector barriers
    pub use_g1_gc: bool,
    /// CMS collector barriers
    pub use_cms_gc: bool,
    /// Thread-local allocation buffers
    pub use_tlab: bool,
    /// Biased locking fast paths
    pub use_biased_locking: bool,
    /// Object alignment in bytes
    pub object_alignment: i32,
    /// Padding around contended fields
    pub contended_padding_width: i32,
    /// Field layout strategy
    pub fields_allocation_style: i32,
    /// Contended field padding is honoured
    pub enable_contended: bool,
    /// Contended padding limited to privileged classes
    pub restrict_contended: bool,
    /// Granularity of the code segment map
    pub code_segment_size: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            tiered_compilation: false,
            debug_vm: false,
            use_compressed_oops: true,
            use_compressed_class_pointers: true,
            compact_fields: true,
            use_g1_gc: true,
            use_cms_gc: false,
            use_tlab: true,
            use_biased_locking: false,
            object_alignment: 8,
            contended_padding_width: 128,
            fields_allocation_style: 1,
            enable_contended: true,
            restrict_contended: true,
            code_segment_size: 64,
        }
    }
}

impl EngineConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Options of an AOT cache session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AotCacheConfig {
    /// Load AOT libraries at all
    pub enabled: bool,
    /// Report a rejected library as an error instead of skipping it
    pub strict_loading: bool,
    /// Log the statistics counters when the session is dropped
    pub print_statistics: bool,
    /// Check the blob checksum on load
    pub verify_checksum: bool,
}

impl Default for AotCacheConfig {
    fn default() -> Self {
        AotCacheConfig {
            enabled: true,
            strict_loading: false,
            print_statistics: false,
            verify_checksum: true,
        }
    }
}

impl AotCacheConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
