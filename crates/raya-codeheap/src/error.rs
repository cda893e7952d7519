//! Error types for the AOT code heap

use thiserror::Error;

use crate::format::DecodeError;

/// Failures while loading, validating or linking an AOT library
#[derive(Debug, Error)]
pub enum AotError {
    /// Bad magic, unknown format version or corrupted contents
    #[error("{library}: format mismatch: {reason}")]
    FormatMismatch {
        /// Library name
        library: String,
        /// What did not match
        reason: String,
    },

    /// A read through the blob ran out of bounds
    #[error("{library}: truncated or malformed blob: {source}")]
    Truncated {
        /// Library name
        library: String,
        /// Underlying decode failure
        #[source]
        source: DecodeError,
    },

    /// The blob was compiled for a different engine build
    #[error("{library}: compiled for engine {found}, running {expected}")]
    EngineVersionMismatch {
        /// Library name
        library: String,
        /// Version recorded in the blob
        found: String,
        /// Version of the running engine
        expected: String,
    },

    /// A build configuration field differs from the running engine
    #[error("{library}: configuration mismatch on {field}: blob has {blob}, engine has {engine}")]
    ConfigMismatch {
        /// Library name
        library: String,
        /// First mismatching field
        field: &'static str,
        /// Value recorded in the blob
        blob: String,
        /// Value of the running engine
        engine: String,
    },

    /// A library with the same name is already loaded in this session
    #[error("library {0} is already loaded")]
    DuplicateLibrary(String),

    /// A section the heap needs is not exported by the blob
    #[error("{library}: missing symbol {symbol}")]
    MissingSymbol {
        /// Library name
        library: String,
        /// Symbol name
        symbol: String,
    },

    /// The library was rejected earlier and cannot be used
    #[error("library {0} is not valid")]
    InvalidLibrary(String),

    /// A runtime routine the code links against is not provided by the engine
    #[error("{library}: missing runtime routine {routine}")]
    MissingRuntimeRoutine {
        /// Library name
        library: String,
        /// Routine name
        routine: String,
    },

    /// A GOT slot of a method could not be resolved
    #[error("unresolved reference {reference} in {method}")]
    UnresolvedReference {
        /// Method whose slot failed
        method: String,
        /// Descriptor of the slot
        reference: String,
    },

    /// I/O error while reading a library file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AotError {
    pub(crate) fn truncated(library: &str, source: DecodeError) -> Self {
        AotError::Truncated { library: library.to_string(), source }
    }

    pub(crate) fn format(library: &str, reason: impl Into<String>) -> Self {
        AotError::FormatMismatch { library: library.to_string(), reason: reason.into() }
    }
}

/// Why a live class could not be bound to AOT code.
///
/// These are ordinary outcomes, not errors: the engine falls back to
/// interpreting or JIT-compiling the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveMiss {
    /// The blob holds no record for the class
    NotFound,
    /// The class changed shape since the blob was compiled
    FingerprintMismatch,
    /// The class is bound to a different classloader
    ClassloaderMismatch,
    /// The live class has been redefined
    Redefined,
    /// Assertions were stripped at compile time but are enabled for the class
    AssertionsEnabled,
    /// Linking runtime routines failed; the heap is unusable
    LinkageDisabled,
}

impl std::fmt::Display for ResolveMiss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolveMiss::NotFound => "not found",
            ResolveMiss::FingerprintMismatch => "fingerprint mismatch",
            ResolveMiss::ClassloaderMismatch => "classloader mismatch",
            ResolveMiss::Redefined => "redefined",
            ResolveMiss::AssertionsEnabled => "assertions enabled",
            ResolveMiss::LinkageDisabled => "linkage disabled",
        };
        f.write_str(s)
    }
}
