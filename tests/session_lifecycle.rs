//! Session sharing and node lifecycle through the public runtime API.
use std::sync::Arc;

use meshbridge::api::{ErrorKind, RuntimeConfig, RuntimeContext, SessionManager, SessionOptions};
use meshbridge::core::engine::ResultCode;
use meshbridge::core::engine::memory::MemoryEngine;

const LIBRARY: &str = r#"{
    "assets": [
        {"name": "Sop/box", "parts": [
            {"points": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]], "vertices": [0,1,2,3], "faces": [4]}]},
        {"name": "Obj/pair", "kind": "object", "parts": [
            {"points": [[0,0,0],[1,0,0],[0,1,0]], "vertices": [0,1,2], "faces": [3]},
            {"points": [[0,0,1],[1,0,1],[0,1,1]], "vertices": [0,1,2], "faces": [3]}]}
    ]
}"#;

fn engine() -> Arc<MemoryEngine> {
    let engine = Arc::new(MemoryEngine::new());
    engine.install_library("lib.json", LIBRARY);
    engine
}

fn runtime(manager: &SessionManager) -> RuntimeContext {
    let mut runtime = RuntimeContext::new(manager.acquire().expect("session"), RuntimeConfig::default());
    runtime.set_library("lib.json").expect("library");
    runtime
}

#[test]
fn runtimes_share_one_session_until_the_last_drops() {
    let engine = engine();
    let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());

    let first = runtime(&manager);
    let second = runtime(&manager);
    assert_eq!(first.session().id(), second.session().id());
    assert_eq!(manager.users(), 2);
    assert_eq!(engine.sessions_created(), 1);

    drop(first);
    assert_eq!(engine.sessions_cleaned(), 0);
    drop(second);
    assert_eq!(engine.sessions_cleaned(), 1);
    assert!(!manager.is_active());

    let third = runtime(&manager);
    assert_eq!(engine.sessions_created(), 2);
    assert_eq!(third.asset_count(), 2);
}

#[test]
fn failed_session_start_is_a_session_error() {
    let engine = engine();
    engine.fail_on("create_session");
    let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());

    let err = manager.acquire().expect_err("engine down");
    assert_eq!(err.kind(), ErrorKind::Session);
    assert_eq!(err.engine_code(), Some(ResultCode::Failure));
    assert!(!manager.is_active());
}

#[test]
fn operator_nodes_get_an_input_rig_that_destroy_removes() {
    let engine = engine();
    let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());
    let mut runtime = runtime(&manager);
    runtime.select_asset(0).expect("select");

    let binding = runtime.create_node().expect("node");
    let rig = binding.input.expect("operator has an input rig");
    assert_eq!(engine.node_inputs(binding.node_id), vec![(0, rig.geometry_id)]);
    assert!(runtime.accepts_input());

    runtime.destroy_node().expect("destroy");
    let deleted = engine.deleted_nodes();
    assert!(deleted.contains(&binding.node_id));
    assert!(deleted.contains(&rig.object_id));
    assert!(engine.live_nodes().is_empty());
    assert!(runtime.binding().is_none());
}

#[test]
fn container_nodes_have_no_input_and_expose_display_children() {
    let engine = engine();
    let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());
    let mut runtime = runtime(&manager);
    runtime.select_asset(1).expect("select");

    let binding = runtime.create_node().expect("node");
    assert!(binding.input.is_none());
    assert!(runtime.cook().expect("cook").is_ready());
    assert_eq!(runtime.fetch_sub_outputs().expect("sops").len(), 2);
    runtime.destroy_node().expect("destroy");
    assert!(engine.live_nodes().is_empty());
}

#[test]
fn library_failures_land_in_the_error_slot() {
    let engine = engine();
    let manager = SessionManager::new(engine, SessionOptions::in_process());
    let mut runtime = RuntimeContext::new(manager.acquire().expect("session"), RuntimeConfig::default());

    let err = runtime.set_library("missing.json").expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::Library);
    assert_eq!(err.engine_code(), Some(ResultCode::CantLoadFile));
    let recorded = runtime.cook_error().expect("recorded");
    assert!(recorded.contains("cannot load file"), "{recorded}");
    assert_eq!(runtime.asset_count(), 0);

    let err = runtime.create_node().expect_err("no asset");
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert_ne!(runtime.cook_error(), Some(recorded));
}

#[test]
fn instances_rebind_between_cooks() {
    let engine = engine();
    let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());
    let mut runtime = runtime(&manager);
    runtime.select_asset(0).expect("select");

    let first = runtime.create_node().expect("first");
    let second = runtime.create_node().expect("second");
    assert_ne!(first.node_id, second.node_id);
    assert_eq!(runtime.binding(), Some(second));

    runtime.bind_node(first);
    runtime.fetch_parameters().expect("parms");
    runtime.destroy_node().expect("first gone");
    runtime.bind_node(second);
    runtime.destroy_node().expect("second gone");
    assert!(engine.live_nodes().is_empty());
}

#[test]
fn failed_input_wiring_leaves_no_nodes_behind() {
    for call in ["display_geo_info", "connect_node_input"] {
        let engine = engine();
        let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());
        let mut runtime = runtime(&manager);
        runtime.select_asset(0).expect("select");

        engine.fail_on(call);
        let err = runtime.create_node().expect_err(call);
        assert_eq!(err.kind(), ErrorKind::Node, "{call}");
        assert!(engine.live_nodes().is_empty(), "{call}: {:?}", engine.live_nodes());
        assert!(runtime.binding().is_none());
        let recorded = runtime.cook_error().expect("recorded");
        assert!(recorded.contains(call), "{recorded}");
    }
}

#[test]
fn input_container_goes_even_when_the_main_node_will_not() {
    let engine = engine();
    let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());
    let mut runtime = runtime(&manager);
    runtime.select_asset(0).expect("select");
    let binding = runtime.create_node().expect("node");
    let rig = binding.input.expect("input rig");

    engine.fail_on_node("delete_node", binding.node_id);
    let err = runtime.destroy_node().expect_err("main node stuck");
    assert_eq!(err.kind(), ErrorKind::Node);
    assert_eq!(err.node(), Some(binding.node_id));
    assert!(engine.deleted_nodes().contains(&rig.object_id));
    assert_eq!(engine.live_nodes(), vec![binding.node_id]);
    assert!(runtime.binding().is_none());
}
