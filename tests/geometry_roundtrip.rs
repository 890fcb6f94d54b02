//! Host mesh in, engine cook, host mesh out, across layouts and multi-part outputs.
use std::sync::Arc;

use meshbridge::api::{
    EffectOutcome, EffectRequest, ErrorKind, GeoCounts, HostValue, MeshData, MeshJson,
    MeshLayout, RuntimeConfig, RuntimeContext, SessionManager, SessionOptions, cook_effect,
};
use meshbridge::core::engine::memory::MemoryEngine;

const LIBRARY: &str = r#"{
    "assets": [
        {"name": "Sop/shift", "passthrough_input": true, "translate_parm": "mfx_offset",
         "parms": [{"name": "mfx_offset", "type": "float", "size": 3}]},
        {"name": "Obj/pair", "kind": "object", "parts": [
            {"points": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]], "vertices": [0,1,2,3], "faces": [4]},
            {"points": [[0,0,1],[1,0,1],[0,1,1]], "vertices": [0,1,2], "faces": [3],
             "uv": [[0,0],[1,0],[0,1]]}]},
        {"name": "Obj/lazy", "kind": "object", "lazy_children": true, "parts": [
            {"points": [[0,0,0],[1,0,0],[0,1,0]], "vertices": [0,1,2], "faces": [3]},
            {"type": "curve", "points": [[0,0,0],[0,0,1]], "vertices": [0,1], "faces": [2]}]},
        {"name": "Sop/box", "parts": [
            {"points": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]], "vertices": [0,1,2,3], "faces": [4]}]},
        {"name": "Dop/sim", "kind": "dynamics"}
    ]
}"#;

fn setup(asset: usize) -> (Arc<MemoryEngine>, RuntimeContext) {
    let engine = Arc::new(MemoryEngine::new());
    engine.install_library("lib.json", LIBRARY);
    let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());
    let mut runtime = RuntimeContext::new(manager.acquire().expect("session"), RuntimeConfig::default());
    runtime.set_library("lib.json").expect("library");
    runtime.select_asset(asset).expect("select");
    runtime.create_node().expect("node");
    (engine, runtime)
}

fn quad(layout: MeshLayout) -> MeshData {
    let json: MeshJson = serde_json::from_str(
        r#"{"points": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]], "vertices": [0,1,2,3], "faces": [4]}"#,
    )
    .expect("json");
    MeshData::from_json(&json, layout).expect("mesh")
}

#[test]
fn quad_survives_a_passthrough_cook_in_both_layouts() {
    for layout in [MeshLayout::Packed, MeshLayout::Interleaved] {
        let (_engine, mut runtime) = setup(0);
        let input = quad(layout);
        let request = EffectRequest {
            input: Some(&input),
            layout,
            ..EffectRequest::default()
        };
        let outcome = cook_effect(&mut runtime, &request).expect("cook");
        let EffectOutcome::Cooked { mesh, counts, .. } = outcome else {
            panic!("expected a cooked mesh");
        };
        assert_eq!(
            counts,
            GeoCounts {
                points: 4,
                vertices: 4,
                faces: 1
            }
        );
        assert_eq!(mesh.to_json(), input.to_json(), "{layout:?}");
    }
}

#[test]
fn parameters_move_the_fed_geometry() {
    let (_engine, mut runtime) = setup(0);
    let input = quad(MeshLayout::Interleaved);
    let request = EffectRequest {
        input: Some(&input),
        parameters: vec![("mfx_offset".to_string(), HostValue::Doubles(vec![1.0, 0.0, 0.5]))],
        layout: MeshLayout::Interleaved,
    };
    let outcome = cook_effect(&mut runtime, &request).expect("cook");
    let mesh = outcome.mesh().expect("cooked").to_json();
    assert_eq!(mesh.points[0], [1.0, 0.0, 0.5]);
    assert_eq!(mesh.points[2], [2.0, 1.0, 0.5]);
}

#[test]
fn parts_from_several_outputs_are_concatenated_with_offsets() {
    let (_engine, mut runtime) = setup(1);
    let outcome = cook_effect(&mut runtime, &EffectRequest::default()).expect("cook");
    let EffectOutcome::Cooked { mesh, counts, .. } = outcome else {
        panic!("expected a cooked mesh");
    };
    assert_eq!((counts.points, counts.vertices, counts.faces), (7, 7, 2));

    let json = mesh.to_json();
    assert_eq!(json.vertices, vec![0, 1, 2, 3, 4, 5, 6]);
    assert_eq!(json.faces, vec![4, 3]);
    assert_eq!(json.points[4], [0.0, 0.0, 1.0]);
    // Only the second part carries uvs; the first part's range stays zeroed.
    assert_eq!(
        json.attributes["uv0"].values,
        vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0]
    );
}

#[test]
fn a_failing_part_keeps_its_reserved_range() {
    let (engine, mut runtime) = setup(1);
    assert!(runtime.cook().expect("cook").is_ready());
    let sops = runtime.fetch_sub_outputs().expect("sops").to_vec();
    let counts = runtime.consolidate_counts().expect("counts");
    engine.fail_on_node("attribute_float_data", sops[0]);

    let mut mesh = MeshData::allocate(counts, MeshLayout::Packed);
    let written = runtime
        .fill_mesh(&mut mesh.as_buffers().expect("buffers"), counts)
        .expect("soft failure");
    assert_eq!(written, counts);
    assert!(runtime.cook_error().is_some());

    let json = mesh.to_json();
    assert_eq!(json.vertices, vec![0, 0, 0, 0, 4, 5, 6]);
    assert_eq!(json.faces, vec![0, 3]);
    assert_eq!(json.points[5], [1.0, 0.0, 1.0]);
}

#[test]
fn lazy_outputs_are_cooked_during_consolidation_and_curves_skipped() {
    let (_engine, mut runtime) = setup(2);
    let outcome = cook_effect(&mut runtime, &EffectRequest::default()).expect("cook");
    let EffectOutcome::Cooked { mesh, counts, .. } = outcome else {
        panic!("expected a cooked mesh");
    };
    assert_eq!((counts.points, counts.vertices, counts.faces), (3, 3, 1));
    assert_eq!(mesh.to_json().faces, vec![3]);
}

#[test]
fn undersized_host_buffers_are_rejected_before_writing() {
    let (_engine, mut runtime) = setup(1);
    runtime.cook().expect("cook");
    runtime.fetch_sub_outputs().expect("sops");
    let counts = runtime.consolidate_counts().expect("counts");
    let short = GeoCounts {
        points: counts.points - 1,
        ..counts
    };
    let mut mesh = MeshData::allocate(short, MeshLayout::Packed);
    let err = runtime
        .fill_mesh(&mut mesh.as_buffers().expect("buffers"), short)
        .expect_err("too small");
    assert_eq!(err.kind(), meshbridge::api::ErrorKind::Contract);
    assert!(mesh.to_json().vertices.iter().all(|&v| v == 0));
}

#[test]
fn generated_quad_needs_no_input() {
    let (_engine, mut runtime) = setup(3);
    assert!(runtime.accepts_input());
    let outcome = cook_effect(&mut runtime, &EffectRequest::default()).expect("cook");
    let EffectOutcome::Cooked { mesh, counts, .. } = outcome else {
        panic!("expected a cooked mesh");
    };
    assert_eq!(
        counts,
        GeoCounts {
            points: 4,
            vertices: 4,
            faces: 1
        }
    );
    let mesh = mesh.to_json();
    assert_eq!(mesh.vertices, vec![0, 1, 2, 3]);
    assert_eq!(mesh.faces, vec![4]);
    assert_eq!(mesh.points[2], [1.0, 1.0, 0.0]);
}

#[test]
fn failed_cook_request_skips_the_frame() {
    let (engine, mut runtime) = setup(3);
    engine.fail_on("cook_node");

    let outcome = runtime.cook().expect("not fatal");
    assert!(!outcome.is_ready());
    let recorded = runtime.cook_error().expect("recorded");
    assert!(recorded.contains("cook_node"), "{recorded}");

    let outcome = cook_effect(&mut runtime, &EffectRequest::default()).expect("not fatal");
    assert!(matches!(outcome, EffectOutcome::Skipped { .. }));
    assert!(runtime.sub_outputs().is_none());
}

#[test]
fn assets_without_geometry_outputs_are_unsupported() {
    let (_engine, mut runtime) = setup(4);
    assert!(runtime.binding().expect("node").input.is_none());
    assert!(runtime.cook().expect("cook").is_ready());

    let err = runtime.fetch_sub_outputs().expect_err("no geometry");
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert!(runtime.sub_outputs().is_none());
    assert!(runtime.cook_error().is_some());

    let err = cook_effect(&mut runtime, &EffectRequest::default()).expect_err("no geometry");
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}
