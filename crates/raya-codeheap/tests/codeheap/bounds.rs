//! Address bounds and segment-map queries

use raya_codeheap::{AotCacheConfig, AotCodeCache, EngineConfig, LoaderId};

use super::harness::*;

#[test]
fn test_bounds_start_at_stubs() {
    let (heap, _) = fixture_heap();
    let stub = heap.first().unwrap();

    assert!(!heap.is_empty());
    assert_eq!(heap.low_boundary(), heap.code_base() + 448);
    assert_eq!(heap.high_boundary(), stub.code_end());
    assert_eq!(heap.find_owner(stub.code_begin() + 10).unwrap().code_id(), ids().stub);
}

#[test]
fn test_bounds_only_grow() {
    let (heap, runtime) = fixture_heap();
    let base = heap.code_base();
    let mut previous = (heap.low_boundary(), heap.high_boundary());

    for shape in [shape_shape(), circle_shape(), point_shape()] {
        let live = runtime.define_class(&shape, LoaderId::BOOT);
        heap.load_klass_data(&live).unwrap();
        let current = (heap.low_boundary(), heap.high_boundary());
        assert!(current.0 <= previous.0);
        assert!(current.1 >= previous.1);
        previous = current;
    }
    assert_eq!(previous.0, base);

    // Invalidation never shrinks the bounds
    heap.invalidate_dependents_of("geom/Point");
    heap.invalidate_dependents_of("geom/Shape");
    assert_eq!((heap.low_boundary(), heap.high_boundary()), previous);
}

#[test]
fn test_multi_segment_method() {
    let (heap, runtime) = fixture_heap();
    let base = heap.code_base();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();
    let scale = ids().point_scale;

    // Point.scale occupies [64, 268) over segments 1 to 4
    for offset in [64, 127, 128, 200, 255, 256, 267] {
        assert!(heap.contains(base + offset), "offset {}", offset);
        assert_eq!(heap.find_owner(base + offset).unwrap().code_id(), scale);
        assert_eq!(heap.find_start(base + offset), Some(base + 64));
    }
    assert!(!heap.contains(base + 268));
    assert!(heap.find_start(base + 300).is_none());
}

#[test]
fn test_padding_and_unpublished_code_are_outside() {
    let (heap, runtime) = fixture_heap();
    let base = heap.code_base();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();

    assert!(heap.contains(base));
    assert!(heap.contains(base + 35));
    // Fill after Point.norm
    assert!(!heap.contains(base + 36));
    assert!(!heap.contains(base + 63));
    // Shape.area and Circle.area are inside the bounds but not linked
    assert!(!heap.contains(base + 330));
    assert!(heap.find_owner(base + 390).is_none());
    // Outside the code section
    assert!(!heap.contains(base.wrapping_sub(1)));
    assert!(!heap.contains(heap.high_boundary()));
    assert!(!heap.contains(base + (1 << 20)));
}

#[test]
fn test_invalidated_code_stays_contained() {
    let (heap, runtime) = fixture_heap();
    let base = heap.code_base();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();

    heap.invalidate_dependents_of("geom/Point");
    // Frames may still be running the code
    assert!(heap.contains(base + 100));
    assert_eq!(heap.find_start(base + 100), Some(base + 64));
    assert!(heap.find_owner(base + 100).is_none());
    // Point.norm is unaffected
    assert!(heap.find_owner(base + 4).is_some());
}

#[test]
fn test_cache_routes_addresses_to_heaps() {
    init_logging();
    let runtime = FakeRuntime::for_fixture();
    let cache = AotCodeCache::new(AotCacheConfig::default(), EngineConfig::default(), runtime.clone());
    let a = cache.load(fixture_bytes(), "a.aot").unwrap().unwrap();
    let b = cache.load(fixture_bytes(), "b.aot").unwrap().unwrap();
    assert_ne!(a.code_base(), b.code_base());

    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    assert_eq!(cache.load_klass_data(&point), 4);

    let in_b = b.code_base() + 100;
    assert!(cache.contains(in_b));
    assert_eq!(cache.find_heap(in_b).unwrap().library().name(), "b.aot");
    let owner = cache.find_owner(in_b).unwrap();
    assert_eq!(owner.code_id(), ids().point_scale);
    assert_eq!(owner.library_id(), b.library().id());
    assert!(!cache.contains(a.code_base() + 40));
}
