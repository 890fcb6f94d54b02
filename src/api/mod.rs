//! Purpose: Define the public Rust API boundary for host integrations.
//! Exports: Runtime context, mesh containers, effect pipeline and the core types they use.
//! Role: Public, additive-only surface used by the CLI, the C ABI and bindings.
//! Invariants: Every engine interaction from this layer goes through `RuntimeContext`.

mod config;
mod effect;
mod mesh;
mod runtime;

pub use crate::core::cook::{CookOutcome, CookState, Readiness};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::marshal::GeoCounts;
pub use crate::core::parm::{HostParamType, HostValue, ParmValues};
pub use crate::core::session::{Session, SessionManager, SessionOptions, Transport};
pub use config::{AttributeMapping, DEFAULT_MAX_PLUGINS, RuntimeConfig};
pub use effect::{
    EffectOutcome, EffectRequest, PluginInfo, cook_effect, describe_parameters,
    discover_plugins,
};
pub use mesh::{AttributeJson, MeshBuffer, MeshData, MeshJson, MeshLayout};
pub use runtime::{
    InputRig, NodeBinding, NodeKind, ParameterDescriptor, RuntimeContext, RuntimeResult,
};
