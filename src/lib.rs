//! Purpose: Library crate bridging a procedural geometry engine to host mesh effects.
//! Exports: `core` (engine boundary, sessions, marshalling, errors), `api` (runtime
//!          context, meshes, effect pipeline), `abi` (C surface for host plugins).
//! Role: Backs the `meshbridge` CLI, the C ABI and the integration tests.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
//! Invariants: The engine session is shared through `core::session`, never a global.
pub mod abi;
pub mod api;
pub mod core;
pub mod library_paths;
pub mod logging;
pub mod notice;
