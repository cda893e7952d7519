//! Engine-side collaborators
//!
//! The code heap never walks the engine's class hierarchy or heap itself.
//! Everything it needs from the live system goes through [`Runtime`], and
//! every live entity it stores is an opaque, non-null handle.

use std::num::NonZeroU64;

use crate::fingerprint::ClassShape;
use crate::library::MethodName;
use crate::method::AotCompiledMethod;

macro_rules! define_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Wrap a raw handle; `None` for 0
            pub fn new(raw: u64) -> Option<Self> {
                NonZeroU64::new(raw).map($name)
            }

            /// The raw handle
            pub fn raw(self) -> u64 {
                self.0.get()
            }
        }
    };
}

define_ref!(
    /// Handle to a live class
    KlassRef
);
define_ref!(
    /// Handle to a live method
    MethodRef
);
define_ref!(
    /// Handle to runtime metadata (methods, constant pool entries, profiles)
    MetadataRef
);
define_ref!(
    /// Handle to a heap object
    ObjectRef
);

/// Identity of a classloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(pub u32);

impl LoaderId {
    /// The boot loader
    pub const BOOT: LoaderId = LoaderId(0);
}

/// A class as the engine currently sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveClass {
    /// Engine handle of the class
    pub klass: KlassRef,
    /// Binary name
    pub name: String,
    /// Defining loader
    pub loader: LoaderId,
    /// Structural fingerprint of the live shape
    pub fingerprint: u64,
    /// The class has been redefined since it was loaded
    pub redefined: bool,
    /// Assertions are enabled for this class
    pub assertions_enabled: bool,
}

impl LiveClass {
    /// Describe a freshly loaded class from its declared shape
    pub fn from_shape(klass: KlassRef, loader: LoaderId, shape: &ClassShape) -> Self {
        LiveClass {
            klass,
            name: shape.name.clone(),
            loader,
            fingerprint: shape.fingerprint(),
            redefined: false,
            assertions_enabled: false,
        }
    }
}

/// A method of a live class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveMethod {
    /// Engine handle of the method
    pub method: MethodRef,
    /// The engine already has compiled code for the method
    pub has_code: bool,
    /// The method is excluded from compilation
    pub excluded: bool,
}

impl LiveMethod {
    /// A method with no code and no exclusion
    pub fn new(method: MethodRef) -> Self {
        LiveMethod { method, has_code: false, excluded: false }
    }
}

/// Services the engine provides to the code heap.
///
/// Lookups return `None` when the entity does not exist; the heap turns
/// that into a miss or an unresolved reference.
pub trait Runtime: Send + Sync {
    /// Find a class by binary name as seen from `loader`
    fn find_class(&self, name: &str, loader: LoaderId) -> Option<KlassRef>;

    /// Find a declared method of a live class
    fn find_method(&self, klass: KlassRef, name: &MethodName) -> Option<LiveMethod>;

    /// Resolve a metadata descriptor in the context of `holder`
    fn resolve_metadata(&self, descriptor: &str, holder: &LiveClass) -> Option<MetadataRef>;

    /// Resolve a heap-object descriptor (string constants, mirrors)
    fn resolve_object(&self, descriptor: &str) -> Option<ObjectRef>;

    /// Address of a runtime routine the compiled code calls
    fn runtime_routine(&self, name: &str) -> Option<usize>;

    /// AOT code for `method` became executable
    fn install_code(&self, _method: &AotCompiledMethod) {}

    /// Previously executable AOT code was invalidated; frames running it
    /// must be deoptimized
    fn mark_for_deoptimization(&self, _method: &AotCompiledMethod) {}
}
