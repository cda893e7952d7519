//! Class linkage, the shape gates and GOT resolution

use raya_codeheap::format::BuildConfig;
use raya_codeheap::{CodeState, FieldShape, LoaderId, MetaspaceEntry, ObjectRef, ResolveMiss, Runtime};

use super::harness::*;

#[test]
fn test_load_klass_data_publishes_methods() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);

    assert_eq!(heap.load_klass_data(&point), Ok(2));
    assert_eq!(heap.state(ids.point_norm), Some(CodeState::Resolved));
    assert_eq!(heap.state(ids.point_scale), Some(CodeState::Resolved));
    assert_eq!(heap.state(ids.shape_area), Some(CodeState::Unresolved));

    let norm = heap.lookup(ids.point_norm).unwrap();
    assert_eq!(norm.name().to_string(), "geom/Point.norm()D");
    assert_eq!(norm.holder(), Some(point.klass));
    assert!(norm.method().is_some());

    // Own metaspace slot, metadata and heap-object slots are filled
    let got_index = heap.find_klass("geom/Point").unwrap().record.got_index as usize;
    assert_eq!(heap.metaspace_slot(got_index), Some(point.klass));
    assert_eq!(heap.metadata_slot(0), runtime.metadata_for("geom/Point.norm()D"));
    assert_eq!(heap.oop_slot(0), runtime.object_for("string:origin"));
    assert_eq!(heap.bound_loader(0), Some(LoaderId::BOOT));

    let stats = heap.statistics().snapshot();
    assert_eq!(stats.classes_found, 1);
    assert_eq!(stats.methods_published, 2);

    // Second call finds the binding and nothing left to publish
    assert_eq!(heap.load_klass_data(&point), Ok(0));
    assert_eq!(heap.statistics().snapshot().classes_examined, 1);
}

#[test]
fn test_fingerprint_mismatch_retires_class_code() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let changed = point_shape().with_field(FieldShape::new("z", "I"));
    let point = runtime.define_class(&changed, LoaderId::BOOT);

    assert_eq!(heap.load_klass_data(&point), Err(ResolveMiss::FingerprintMismatch));
    assert_eq!(heap.state(ids.point_norm), Some(CodeState::Invalidated));
    assert_eq!(heap.state(ids.point_scale), Some(CodeState::Invalidated));
    assert_eq!(heap.state(ids.shape_area), Some(CodeState::Unresolved));
    assert!(heap.bound_entry(point.klass).is_none());
    assert_eq!(heap.bound_loader(0), None);

    let stats = heap.statistics().snapshot();
    assert_eq!(stats.fingerprint_misses, 1);
    assert_eq!(stats.methods_invalidated, 2);
    assert_eq!(stats.classes_found, 0);
    // Nothing was executable, so nothing to deoptimize
    assert!(runtime.deoptimized().is_empty());
}

#[test]
fn test_invalidated_code_is_never_published() {
    let (heap, runtime) = fixture_heap();
    let changed = point_shape().with_method("extra", "()V");
    let stale = runtime.define_class(&changed, LoaderId(1));
    assert!(heap.load_klass_data(&stale).is_err());

    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    assert_eq!(heap.load_klass_data(&point), Ok(0));
    assert!(heap.lookup(ids().point_norm).is_none());
    assert!(runtime.installed().is_empty());
}

#[test]
fn test_classloader_mismatch_has_no_side_effects() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let boot = runtime.define_class(&point_shape(), LoaderId::BOOT);
    assert_eq!(heap.load_klass_data(&boot), Ok(2));

    let other = runtime.define_class(&point_shape(), LoaderId(5));
    assert_eq!(heap.load_klass_data(&other), Err(ResolveMiss::ClassloaderMismatch));
    assert_eq!(heap.state(ids.point_norm), Some(CodeState::Resolved));
    assert_eq!(heap.bound_loader(0), Some(LoaderId::BOOT));
    assert!(heap.bound_entry(other.klass).is_none());
    assert_eq!(heap.statistics().snapshot().classloader_misses, 1);
    assert_eq!(heap.statistics().snapshot().methods_invalidated, 0);
}

#[test]
fn test_metaspace_slot_filled_by_another_loader() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let shape7 = runtime.define_class(&shape_shape(), LoaderId(7));
    let circle7 = runtime.define_class(&circle_shape(), LoaderId(7));
    let shape_boot = runtime.define_class(&shape_shape(), LoaderId::BOOT);

    // Circle.area resolves Shape as loader 7 sees it
    assert_eq!(heap.load_klass_data(&circle7), Ok(1));
    let shape_index = heap.find_klass("geom/Shape").unwrap().record.got_index as usize;
    assert_eq!(heap.metaspace_slot(shape_index), Some(shape7.klass));

    assert_eq!(heap.load_klass_data(&shape_boot), Err(ResolveMiss::ClassloaderMismatch));
    assert_eq!(heap.state(ids.shape_area), Some(CodeState::Unresolved));
    assert_eq!(heap.metaspace_slot(shape_index), Some(shape7.klass));
    assert!(heap.bound_entry(shape_boot.klass).is_none());
    assert_eq!(heap.bound_loader(1), None);
    assert_eq!(heap.statistics().snapshot().classloader_misses, 1);

    // The class the slot already holds links fine
    assert_eq!(heap.load_klass_data(&shape7), Ok(1));
    assert_eq!(heap.bound_loader(1), Some(LoaderId(7)));
}

#[test]
fn test_resolve_class_fingerprint_gate() {
    let (heap, runtime) = fixture_heap();
    let changed = point_shape().with_field(FieldShape::new("z", "I"));
    let point = runtime.define_class(&changed, LoaderId::BOOT);

    assert_eq!(heap.resolve_class(&point), Err(ResolveMiss::FingerprintMismatch));
    assert!(heap.bound_entry(point.klass).is_none());
    assert_eq!(heap.bound_loader(0), None);
    let got_index = heap.find_klass("geom/Point").unwrap().record.got_index as usize;
    assert_eq!(heap.metaspace_slot(got_index), None);

    let stats = heap.statistics().snapshot();
    assert_eq!(stats.classes_examined, 1);
    assert_eq!(stats.fingerprint_misses, 1);
    assert_eq!(stats.classes_found, 0);

    // The unchanged class passes the same gate
    let original = runtime.define_class(&point_shape(), LoaderId::BOOT);
    let entry = heap.resolve_class(&original).unwrap();
    assert_eq!(entry.class_id, 0);
    assert_eq!(heap.bound_entry(original.klass), Some(entry));
}

#[test]
fn test_redefined_class_is_rejected() {
    let (heap, runtime) = fixture_heap();
    let mut point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    point.redefined = true;

    assert_eq!(heap.load_klass_data(&point), Err(ResolveMiss::Redefined));
    assert_eq!(heap.state(ids().point_norm), Some(CodeState::Invalidated));
}

#[test]
fn test_assertions_gate() {
    let bytes = fixture_builder(BuildConfig { omit_assertions: true, ..BuildConfig::default() }).0.build();
    let (heap, runtime) = heap_from(bytes, FakeRuntime::for_fixture());

    let mut shape = runtime.define_class(&shape_shape(), LoaderId::BOOT);
    shape.assertions_enabled = true;
    assert_eq!(heap.load_klass_data(&shape), Err(ResolveMiss::AssertionsEnabled));
    assert_eq!(heap.state(ids().shape_area), Some(CodeState::Invalidated));

    // Point's code was compiled without assertions too, but its class has them off
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    assert_eq!(heap.load_klass_data(&point), Ok(2));
}

#[test]
fn test_assertions_ignored_when_kept_in_code() {
    let (heap, runtime) = fixture_heap();
    let mut shape = runtime.define_class(&shape_shape(), LoaderId::BOOT);
    shape.assertions_enabled = true;
    assert_eq!(heap.load_klass_data(&shape), Ok(1));
}

#[test]
fn test_unknown_class() {
    let (heap, runtime) = fixture_heap();
    let mut renamed = runtime.define_class(&point_shape(), LoaderId::BOOT);
    renamed.name = "geom/Unknown".to_string();

    assert_eq!(heap.load_klass_data(&renamed), Err(ResolveMiss::NotFound));
    assert!(heap.find_klass("geom/Unknown").is_none());
    assert_eq!(heap.statistics().snapshot().classes_examined, 1);
    assert_eq!(heap.state(ids().point_norm), Some(CodeState::Unresolved));
}

#[test]
fn test_methods_with_engine_code_are_skipped() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    runtime.set_has_code(point.klass, "norm()D");

    assert_eq!(heap.load_klass_data(&point), Ok(1));
    assert_eq!(heap.state(ids.point_norm), Some(CodeState::Unresolved));
    assert_eq!(heap.state(ids.point_scale), Some(CodeState::Resolved));
    assert_eq!(runtime.installed(), vec![ids.point_scale]);
}

#[test]
fn test_unresolved_reference_leaves_slot_unresolved() {
    let (heap, runtime) = fixture_heap();
    let ids = ids();

    // Circle.area references geom/Shape, which is not loaded yet
    let circle = runtime.define_class(&circle_shape(), LoaderId::BOOT);
    assert_eq!(heap.load_klass_data(&circle), Ok(0));
    assert_eq!(heap.state(ids.circle_area), Some(CodeState::Unresolved));
    assert_eq!(heap.statistics().snapshot().unresolved_references, 1);

    let shape = runtime.define_class(&shape_shape(), LoaderId::BOOT);
    assert_eq!(heap.load_klass_data(&shape), Ok(1));

    // The retry links against the now-filled metaspace slot
    assert_eq!(heap.load_klass_data(&circle), Ok(1));
    let area = heap.lookup(ids.circle_area).unwrap();
    assert_eq!(area.holder(), Some(circle.klass));
    assert_eq!(heap.metadata_slot(area.metadata_got().start), runtime.metadata_for("geom/Circle.area()D"));
}

#[test]
fn test_missing_metadata_is_unresolved() {
    let runtime = FakeRuntime::new();
    for routine in ROUTINES {
        runtime.define_routine(routine);
    }
    runtime.define_object("string:origin");
    let (heap, runtime) = heap_from(fixture_bytes(), runtime);

    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    // scale has no metadata; norm's descriptor is unknown
    assert_eq!(heap.load_klass_data(&point), Ok(1));
    assert_eq!(heap.state(ids().point_norm), Some(CodeState::Unresolved));
    assert_eq!(heap.metadata_slot(0), None);

    runtime.define_metadata("geom/Point.norm()D");
    assert_eq!(heap.load_klass_data(&point), Ok(1));
    assert_eq!(heap.state(ids().point_norm), Some(CodeState::Resolved));
}

#[test]
fn test_missing_runtime_routine_disables_linkage() {
    let (heap, runtime) = fixture_heap();
    runtime.remove_routine("new_instance");

    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    assert_eq!(heap.load_klass_data(&point), Err(ResolveMiss::LinkageDisabled));
    assert!(heap.is_linkage_disabled());
    assert_eq!(heap.runtime_routine_address(0), None);

    // Permanent, even once the routine shows up
    runtime.define_routine("new_instance");
    let shape = runtime.define_class(&shape_shape(), LoaderId::BOOT);
    assert_eq!(heap.load_klass_data(&shape), Err(ResolveMiss::LinkageDisabled));
    assert!(heap.lookup(ids().shape_area).is_none());
}

#[test]
fn test_runtime_routines_linked_once() {
    let (heap, runtime) = fixture_heap();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();

    let unwind = runtime.runtime_routine(ROUTINES[0]);
    assert_eq!(heap.runtime_routine_address(0), unwind);
    assert!(heap.runtime_routine_address(1).is_some());
    assert_eq!(heap.runtime_routine_address(2), None);

    // Relinking does not observe the new address
    runtime.define_routine(ROUTINES[0]);
    let shape = runtime.define_class(&shape_shape(), LoaderId::BOOT);
    heap.load_klass_data(&shape).unwrap();
    assert_eq!(heap.runtime_routine_address(0), unwind);
}

#[test]
fn test_get_klass_from_got() {
    let (heap, runtime) = fixture_heap();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    let shape = runtime.define_class(&shape_shape(), LoaderId::BOOT);
    let shape_index = heap.find_klass("geom/Shape").unwrap().record.got_index as usize;

    assert_eq!(heap.metaspace_slot(shape_index), None);
    assert_eq!(heap.get_klass_from_got("geom/Shape", &point), Some(shape.klass));
    assert_eq!(heap.metaspace_slot(shape_index), Some(shape.klass));
    assert_eq!(heap.get_klass_from_got("geom/Missing", &point), None);

    // Loader of `from` decides the lookup
    let isolated = runtime.define_class(&point_shape(), LoaderId(9));
    let (fresh, _) = heap_from(fixture_bytes(), runtime.clone());
    assert_eq!(fresh.get_klass_from_got("geom/Shape", &isolated), None);
}

#[test]
fn test_oop_slot_resolves_once() {
    let (heap, runtime) = fixture_heap();
    let first = heap.resolve_oop_slot(0).unwrap();
    let second = heap.resolve_oop_slot(0).unwrap();
    assert_eq!(first, second);
    assert_eq!(runtime.object_lookups(), 1);
    assert!(heap.resolve_oop_slot(7).is_err());
}

#[test]
fn test_oops_do_updates_and_clears() {
    let (heap, runtime) = fixture_heap();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();
    let original = heap.oop_slot(0).unwrap();

    let moved = ObjectRef::new(original.raw() + 0x10_000).unwrap();
    let mut seen = Vec::new();
    heap.oops_do(|object| {
        seen.push(object);
        Some(moved)
    });
    assert_eq!(seen, vec![original]);
    assert_eq!(heap.oop_slot(0), Some(moved));

    heap.oops_do(|_| None);
    assert_eq!(heap.oop_slot(0), None);

    // A cleared slot is looked up again on next use
    assert_eq!(heap.resolve_oop_slot(0).ok(), runtime.object_for("string:origin"));
    assert_eq!(runtime.object_lookups(), 2);
}

#[test]
fn test_metadata_walks() {
    let (heap, runtime) = fixture_heap();
    let point = runtime.define_class(&point_shape(), LoaderId::BOOT);
    heap.load_klass_data(&point).unwrap();
    let norm_meta = runtime.metadata_for("geom/Point.norm()D").unwrap();

    let mut metadata = Vec::new();
    heap.metadata_do(|m| metadata.push(m));
    assert_eq!(metadata, vec![norm_meta]);

    let mut entries = Vec::new();
    heap.got_metadata_do(|entry| entries.push(entry));
    assert!(entries.contains(&MetaspaceEntry::Klass(point.klass)));
    assert!(entries.contains(&MetaspaceEntry::Metadata(norm_meta)));
    assert_eq!(entries.len(), 2);
}
