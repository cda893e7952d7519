//! Test harness for the code heap
//!
//! Provides a fake engine (`FakeRuntime`) and a fixture blob with a small
//! class hierarchy:
//!
//! - `geom/Point`  norm()D, scale(I)V
//! - `geom/Shape`  area()D
//! - `geom/Circle` area()D, depends on `geom/Shape`
//! - one runtime stub, also listed as a dependent of `geom/Shape`

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use raya_codeheap::format::{BlobBuilder, BuildConfig, MethodSpec};
use raya_codeheap::{
    AotCodeHeap, AotCompiledMethod, AotLib, ClassShape, FieldShape, KlassRef, LiveClass, LiveMethod,
    LoaderId, MetadataRef, MethodName, MethodRef, ObjectRef, Runtime,
};

/// Engine version the fixtures are compiled for
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime routines every fixture links against
pub const ROUTINES: [&str; 2] = ["unwind_exception", "new_instance"];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory engine
#[derive(Default)]
pub struct FakeRuntime {
    next_handle: AtomicU64,
    classes: Mutex<FxHashMap<(String, LoaderId), KlassRef>>,
    methods: Mutex<FxHashMap<(KlassRef, String), LiveMethod>>,
    metadata: Mutex<FxHashMap<String, MetadataRef>>,
    objects: Mutex<FxHashMap<String, ObjectRef>>,
    routines: Mutex<FxHashMap<String, usize>>,
    installed: Mutex<Vec<u32>>,
    deoptimized: Mutex<Vec<u32>>,
    object_lookups: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        let runtime = FakeRuntime { next_handle: AtomicU64::new(0x1000), ..Default::default() };
        Arc::new(runtime)
    }

    /// A runtime that knows every symbol the fixture references
    pub fn for_fixture() -> Arc<Self> {
        let runtime = Self::new();
        runtime.define_metadata("geom/Point.norm()D");
        runtime.define_metadata("geom/Circle.area()D");
        runtime.define_object("string:origin");
        for routine in ROUTINES {
            runtime.define_routine(routine);
        }
        runtime
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(8, Ordering::Relaxed)
    }

    /// Load a class: register it and its methods, return its live view
    pub fn define_class(&self, shape: &ClassShape, loader: LoaderId) -> LiveClass {
        let klass = KlassRef::new(self.handle()).unwrap();
        self.classes.lock().insert((shape.name.clone(), loader), klass);
        for (name, signature) in &shape.methods {
            let method = LiveMethod::new(MethodRef::new(self.handle()).unwrap());
            self.methods.lock().insert((klass, format!("{}{}", name, signature)), method);
        }
        LiveClass::from_shape(klass, loader, shape)
    }

    /// Pretend the engine already compiled `name` itself
    pub fn set_has_code(&self, klass: KlassRef, name: &str) {
        if let Some(method) = self.methods.lock().get_mut(&(klass, name.to_string())) {
            method.has_code = true;
        }
    }

    pub fn define_metadata(&self, descriptor: &str) -> MetadataRef {
        let metadata = MetadataRef::new(self.handle()).unwrap();
        self.metadata.lock().insert(descriptor.to_string(), metadata);
        metadata
    }

    pub fn define_object(&self, descriptor: &str) -> ObjectRef {
        let object = ObjectRef::new(self.handle()).unwrap();
        self.objects.lock().insert(descriptor.to_string(), object);
        object
    }

    pub fn define_routine(&self, name: &str) -> usize {
        let address = self.handle() as usize;
        self.routines.lock().insert(name.to_string(), address);
        address
    }

    pub fn remove_routine(&self, name: &str) {
        self.routines.lock().remove(name);
    }

    pub fn metadata_for(&self, descriptor: &str) -> Option<MetadataRef> {
        self.metadata.lock().get(descriptor).copied()
    }

    pub fn object_for(&self, descriptor: &str) -> Option<ObjectRef> {
        self.objects.lock().get(descriptor).copied()
    }

    /// Code ids reported through `install_code`, in order
    pub fn installed(&self) -> Vec<u32> {
        self.installed.lock().clone()
    }

    /// Code ids reported through `mark_for_deoptimization`, in order
    pub fn deoptimized(&self) -> Vec<u32> {
        self.deoptimized.lock().clone()
    }

    pub fn object_lookups(&self) -> usize {
        self.object_lookups.load(Ordering::Relaxed)
    }
}

impl Runtime for FakeRuntime {
    fn find_class(&self, name: &str, loader: LoaderId) -> Option<KlassRef> {
        self.classes.lock().get(&(name.to_string(), loader)).copied()
    }

    fn find_method(&self, klass: KlassRef, name: &MethodName) -> Option<LiveMethod> {
        let key = (klass, format!("{}{}", name.name, name.signature));
        self.methods.lock().get(&key).copied()
    }

    fn resolve_metadata(&self, descriptor: &str, _holder: &LiveClass) -> Option<MetadataRef> {
        self.metadata_for(descriptor)
    }

    fn resolve_object(&self, descriptor: &str) -> Option<ObjectRef> {
        self.object_lookups.fetch_add(1, Ordering::Relaxed);
        self.object_for(descriptor)
    }

    fn runtime_routine(&self, name: &str) -> Option<usize> {
        self.routines.lock().get(name).copied()
    }

    fn install_code(&self, method: &AotCompiledMethod) {
        self.installed.lock().push(method.code_id());
    }

    fn mark_for_deoptimization(&self, method: &AotCompiledMethod) {
        self.deoptimized.lock().push(method.code_id());
    }
}

pub fn point_shape() -> ClassShape {
    ClassShape::new("geom/Point")
        .with_super("java/lang/Object")
        .with_field(FieldShape::new("x", "I"))
        .with_field(FieldShape::new("y", "I"))
        .with_method("norm", "()D")
        .with_method("scale", "(I)V")
}

pub fn shape_shape() -> ClassShape {
    ClassShape::new("geom/Shape")
        .with_super("java/lang/Object")
        .with_method("area", "()D")
}

pub fn circle_shape() -> ClassShape {
    ClassShape::new("geom/Circle")
        .with_super("geom/Shape")
        .with_field(FieldShape::new("r", "D"))
        .with_method("area", "()D")
}

/// Code ids of the fixture blob
#[derive(Debug, Clone, Copy)]
pub struct Ids {
    pub point_norm: u32,
    pub point_scale: u32,
    pub shape_area: u32,
    pub circle_area: u32,
    pub stub: u32,
}

/// The fixture blob with 64-byte segments:
///
/// | code id | method        | code offset | segments |
/// |---------|---------------|-------------|----------|
/// | 0       | Point.norm    | 0           | 0        |
/// | 1       | Point.scale   | 64          | 1..=4    |
/// | 2       | Shape.area    | 320         | 5        |
/// | 3       | Circle.area   | 384         | 6        |
/// | 4       | stub          | 448         | 7        |
pub fn fixture_builder(config: BuildConfig) -> (BlobBuilder, Ids) {
    let mut builder = BlobBuilder::new(config, ENGINE_VERSION);
    let point = builder.add_class("geom/Point", point_shape().fingerprint());
    let shape = builder.add_class("geom/Shape", shape_shape().fingerprint());
    let circle = builder.add_class("geom/Circle", circle_shape().fingerprint());
    let origin = builder.add_oop_slot("string:origin");

    let point_norm = builder.add_method(
        point,
        MethodSpec::new("norm", "()D")
            .with_metadata("geom/Point.norm()D")
            .with_oop_ref(origin),
    );
    let point_scale = builder.add_method(
        point,
        MethodSpec::new("scale", "(I)V")
            .with_code_size(200)
            .with_klass_ref(builder.got_index(point)),
    );
    let shape_area = builder.add_method(shape, MethodSpec::new("area", "()D"));
    let circle_area = builder.add_method(
        circle,
        MethodSpec::new("area", "()D")
            .with_klass_ref(builder.got_index(shape))
            .with_metadata("geom/Circle.area()D"),
    );
    let stub = builder.add_stub("resolve_virtual_call", 48);

    builder.add_dependent(shape, circle_area);
    builder.add_dependent(shape, stub);
    builder.add_dependent(point, point_scale);
    for routine in ROUTINES {
        builder.add_runtime_link(routine);
    }

    (builder, Ids { point_norm, point_scale, shape_area, circle_area, stub })
}

pub fn fixture_bytes() -> Vec<u8> {
    fixture_builder(BuildConfig::default()).0.build()
}

pub fn ids() -> Ids {
    fixture_builder(BuildConfig::default()).1
}

/// A heap over the fixture blob plus the runtime it links against
pub fn fixture_heap() -> (AotCodeHeap, Arc<FakeRuntime>) {
    heap_from(fixture_bytes(), FakeRuntime::for_fixture())
}

pub fn heap_from(bytes: Vec<u8>, runtime: Arc<FakeRuntime>) -> (AotCodeHeap, Arc<FakeRuntime>) {
    init_logging();
    let lib = Arc::new(AotLib::load(bytes, "fixture.aot", 0).unwrap());
    let heap = AotCodeHeap::new(lib, runtime.clone()).unwrap();
    (heap, runtime)
}
