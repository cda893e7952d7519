//! Code slot registry: lookup, iteration and publication

use std::sync::Arc;

use raya_codeheap::{CodeState, LoaderId, PublishResult};

use super::harness::*;

#[test]
fn test_fresh_heap() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();

    for code_id in [ids.point_norm, ids.point_scale, ids.shape_area, ids.circle_area] {
        assert_eq!(heap.state(code_id), Some(CodeState::Unresolved));
        assert!(heap.lookup(code_id).is_none());
    }
    assert_eq!(heap.state(ids.stub), Some(CodeState::Resolved));
    assert_eq!(heap.state(99), None);
    assert!(runtime.installed().is_empty());
}

#[test]
fn test_lookup_skips_stubs() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let shape = runtime.define_class(&shape_shape(), LoaderId::BOOT);
    heap.load_klass_data(&shape).unwrap();

    let area = heap.lookup(ids.shape_area).unwrap();
    assert_eq!(area.code_id(), ids.shape_area);
    assert_eq!(area.class_id(), heap.find_klass("geom/Shape").map(|e| e.class_id));
    assert!(!area.is_stub());
    assert!(heap.lookup(ids.stub).is_none());
}

#[test]
fn test_first_next_include_stubs() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();

    let first = heap.first().unwrap();
    assert_eq!(first.code_id(), ids.stub);
    assert!(first.is_stub());
    assert!(heap.next(ids.stub).is_none());

    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    let shape = runtime.define_class(&shape_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();
    heap.load_klass_data(&shape).unwrap();

    let mut order = Vec::new();
    let mut cursor = heap.first();
    while let Some(method) = cursor {
        order.push(method.code_id());
        cursor = heap.next(method.code_id());
    }
    assert_eq!(order, vec![ids.point_norm, ids.point_scale, ids.shape_area, ids.stub]);
}

#[test]
fn test_for_each_alive_method() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();

    let mut alive = Vec::new();
    heap.for_each_alive_method(|method| alive.push(method.name().to_string()));
    assert_eq!(alive, vec!["geom/Point.norm()D", "geom/Point.scale(I)V"]);

    heap.invalidate_dependents_of("geom/Point");
    let mut alive = Vec::new();
    heap.for_each_alive_method(|method| alive.push(method.code_id()));
    assert_eq!(alive, vec![ids.point_norm]);
}

#[test]
fn test_install_code_reported_once_per_method() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();
    heap.load_klass_data(&point).unwrap();

    assert_eq!(runtime.installed(), vec![ids.point_norm, ids.point_scale]);
}

#[test]
fn test_publish_twice_keeps_first() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();

    let norm = heap.lookup(ids.point_norm).unwrap();
    match heap.publish(Arc::clone(&norm)) {
        PublishResult::AlreadyPublished(existing) => assert!(Arc::ptr_eq(&existing, &norm)),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(heap.statistics().snapshot().methods_published, 2);
    assert_eq!(runtime.installed().len(), 2);
}

#[test]
fn test_publish_after_invalidation_is_refused() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();
    let scale = heap.lookup(ids.point_scale).unwrap();

    heap.invalidate_dependents_of("geom/Point");
    assert!(matches!(heap.publish(scale), PublishResult::Invalidated));
    assert_eq!(heap.state(ids.point_scale), Some(CodeState::Invalidated));
    assert!(heap.lookup(ids.point_scale).is_none());
}

#[test]
fn test_method_geometry() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();

    let scale = heap.lookup(ids.point_scale).unwrap();
    assert_eq!(scale.code_begin(), heap.code_base() + 64);
    assert_eq!(scale.code_end(), scale.code_begin() + 204);
    assert!(scale.entry_point() > scale.code_begin());
    assert!(scale.contains(scale.verified_entry_point()));
    assert_eq!(scale.frame_size(), 16);
    assert_eq!(heap.library().code_id_at(64).unwrap(), ids.point_scale as i32);
}
