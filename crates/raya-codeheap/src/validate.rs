//! Load-time compatibility checks
//!
//! Generated code bakes in the engine configuration it was compiled for,
//! so a blob is rejected as a whole when any recorded field differs from
//! the running engine.

use once_cell::sync::OnceCell;

use crate::config::EngineConfig;
use crate::error::AotError;
use crate::format::{BuildConfig, CONFIG_SIZE};
use crate::library::AotLib;

macro_rules! check_field {
    ($library:expr, $blob:expr, $engine:expr, $field:ident) => {
        if $blob.$field != $engine.$field {
            return Err(AotError::ConfigMismatch {
                library: $library.to_string(),
                field: stringify!($field),
                blob: $blob.$field.to_string(),
                engine: $engine.$field.to_string(),
            });
        }
    };
}

/// Compare a blob's build configuration with the running engine.
///
/// Returns the first mismatching field.
pub fn validate_config(library: &str, blob: &BuildConfig, engine: &EngineConfig) -> Result<(), AotError> {
    if blob.config_size != CONFIG_SIZE as i32 {
        return Err(AotError::ConfigMismatch {
            library: library.to_string(),
            field: "config_size",
            blob: blob.config_size.to_string(),
            engine: CONFIG_SIZE.to_string(),
        });
    }

    check_field!(library, blob, engine, debug_vm);
    check_field!(library, blob, engine, use_compressed_oops);
    check_field!(library, blob, engine, use_compressed_class_pointers);
    check_field!(library, blob, engine, use_g1_gc);
    check_field!(library, blob, engine, use_cms_gc);
    check_field!(library, blob, engine, use_tlab);
    check_field!(library, blob, engine, use_biased_locking);
    check_field!(library, blob, engine, object_alignment);
    check_field!(library, blob, engine, contended_padding_width);
    check_field!(library, blob, engine, fields_allocation_style);
    check_field!(library, blob, engine, compact_fields);
    check_field!(library, blob, engine, enable_contended);
    check_field!(library, blob, engine, restrict_contended);
    check_field!(library, blob, engine, code_segment_size);

    let segment = blob.code_segment_size;
    if segment <= 0 || segment & (segment - 1) != 0 {
        return Err(AotError::ConfigMismatch {
            library: library.to_string(),
            field: "code_segment_size",
            blob: segment.to_string(),
            engine: "a power of two".to_string(),
        });
    }

    // Tiered code calls back into the profiler
    if blob.tiered_aot && !engine.tiered_compilation {
        return Err(AotError::ConfigMismatch {
            library: library.to_string(),
            field: "tiered_aot",
            blob: "true".to_string(),
            engine: "false".to_string(),
        });
    }

    Ok(())
}

/// Compressed pointer shifts shared by every library of a session.
///
/// The first valid library fixes them; later libraries must agree.
#[derive(Debug, Default)]
pub struct CompressedShifts {
    narrow_oop_shift: OnceCell<i32>,
    narrow_klass_shift: OnceCell<i32>,
}

impl CompressedShifts {
    /// No shift fixed yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Agreed narrow oop shift, if fixed
    pub fn narrow_oop_shift(&self) -> Option<i32> {
        self.narrow_oop_shift.get().copied()
    }

    /// Agreed narrow klass shift, if fixed
    pub fn narrow_klass_shift(&self) -> Option<i32> {
        self.narrow_klass_shift.get().copied()
    }

    /// Check `blob`'s shifts, fixing them if this is the first library
    pub fn agree(&self, library: &str, blob: &BuildConfig) -> Result<(), AotError> {
        if blob.use_compressed_oops {
            let agreed = *self.narrow_oop_shift.get_or_init(|| blob.narrow_oop_shift);
            if agreed != blob.narrow_oop_shift {
                return Err(AotError::ConfigMismatch {
                    library: library.to_string(),
                    field: "narrow_oop_shift",
                    blob: blob.narrow_oop_shift.to_string(),
                    engine: agreed.to_string(),
                });
            }
            if blob.use_compressed_class_pointers {
                let agreed = *self.narrow_klass_shift.get_or_init(|| blob.narrow_klass_shift);
                if agreed != blob.narrow_klass_shift {
                    return Err(AotError::ConfigMismatch {
                        library: library.to_string(),
                        field: "narrow_klass_shift",
                        blob: blob.narrow_klass_shift.to_string(),
                        engine: agreed.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Full load-time gate for a library: engine version, build
/// configuration, compressed shifts. The library is invalidated on failure.
pub fn verify_library(lib: &AotLib, engine: &EngineConfig, shifts: &CompressedShifts) -> Result<(), AotError> {
    let result = verify(lib, engine, shifts);
    if let Err(err) = &result {
        log::warn!(target: "aot::load", "rejecting {}: {}", lib.name(), err);
        lib.invalidate();
    }
    result
}

fn verify(lib: &AotLib, engine: &EngineConfig, shifts: &CompressedShifts) -> Result<(), AotError> {
    if lib.engine_version() != engine.engine_version {
        return Err(AotError::EngineVersionMismatch {
            library: lib.name().to_string(),
            found: lib.engine_version().to_string(),
            expected: engine.engine_version.clone(),
        });
    }
    validate_config(lib.name(), lib.config(), engine)?;
    shifts.agree(lib.name(), lib.config())
}
