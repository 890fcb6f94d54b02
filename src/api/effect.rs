//! Purpose: Run the host-facing actions (describe, cook) on top of a runtime context.
//! Exports: `cook_effect`, `describe_parameters`, `discover_plugins`, `EffectRequest`,
//!          `EffectOutcome`, `PluginInfo`.
//! Role: Sequencing only; every engine interaction goes through `RuntimeContext`.
//! Invariants: A cook that is not ready reads no output geometry.
//! Invariants: `describe_parameters` leaves no node behind, even on failure.
#![allow(clippy::result_large_err)]

use std::sync::Arc;

use tracing::{info, info_span, warn};

use super::config::RuntimeConfig;
use super::mesh::{MeshBuffer, MeshData, MeshLayout};
use super::runtime::{ParameterDescriptor, RuntimeContext};
use crate::core::attribute::AttributeType;
use crate::core::cook::{CookState, Readiness};
use crate::core::error::{Error, ErrorKind};
use crate::core::marshal::GeoCounts;
use crate::core::parm::HostValue;
use crate::core::session::Session;

#[derive(Clone, Debug, Default)]
pub struct EffectRequest<'a> {
    pub input: Option<&'a MeshData>,
    /// Host values by parameter name, applied in order.
    pub parameters: Vec<(String, HostValue)>,
    pub layout: MeshLayout,
}

#[derive(Debug)]
pub enum EffectOutcome {
    Cooked {
        mesh: MeshData,
        counts: GeoCounts,
        readiness: Readiness,
        state: CookState,
    },
    Skipped {
        state: CookState,
    },
}

impl EffectOutcome {
    pub fn mesh(&self) -> Option<&MeshData> {
        match self {
            EffectOutcome::Cooked { mesh, .. } => Some(mesh),
            EffectOutcome::Skipped { .. } => None,
        }
    }
}

/// One host cook: feed, commit, parameters, cook, fetch, consolidate, fill.
pub fn cook_effect(
    runtime: &mut RuntimeContext,
    request: &EffectRequest<'_>,
) -> Result<EffectOutcome, Error> {
    if let Some(mesh) = request.input {
        feed(runtime, mesh)?;
    }
    apply_parameters(runtime, &request.parameters)?;

    let outcome = runtime.cook()?;
    if !outcome.is_ready() {
        return Ok(EffectOutcome::Skipped {
            state: outcome.state,
        });
    }

    {
        let _span = info_span!("fetch").entered();
        runtime.fetch_sub_outputs()?;
    }
    let counts = {
        let _span = info_span!("consolidate").entered();
        runtime.consolidate_counts()?
    };

    let _span = info_span!("fill", points = counts.points, vertices = counts.vertices).entered();
    let mut mesh = MeshData::allocate(counts, request.layout);
    runtime.fill_mesh(&mut mesh.as_buffers()?, counts)?;

    let outputs = runtime.config().output_attributes.clone();
    for mapping in outputs {
        if !runtime.has_vertex_attribute(&mapping.engine) {
            continue;
        }
        let mut buffer = MeshBuffer::new(
            AttributeType::Float,
            mapping.components,
            counts.vertices,
            request.layout,
        );
        runtime.fill_vertex_attribute(&mapping.engine, &mut buffer.attribute_mut()?, counts.vertices)?;
        mesh.add_attribute(mapping.host, buffer);
    }

    info!(
        points = counts.points,
        vertices = counts.vertices,
        faces = counts.faces,
        "effect cooked"
    );
    Ok(EffectOutcome::Cooked {
        mesh,
        counts,
        readiness: outcome.readiness(),
        state: outcome.state,
    })
}

fn feed(runtime: &mut RuntimeContext, mesh: &MeshData) -> Result<(), Error> {
    if !runtime.accepts_input() {
        return Ok(());
    }
    let _span = info_span!("feed").entered();
    runtime.feed_input_data(&mesh.as_input()?, mesh.counts())?;

    let inputs = runtime.config().input_attributes.clone();
    let mut fed = false;
    for mapping in inputs {
        let Some(buffer) = mesh.attributes.get(&mapping.host) else {
            continue;
        };
        runtime.feed_vertex_attribute(&mapping.engine, &buffer.attribute()?, mesh.vertices.len())?;
        fed = true;
    }
    if fed {
        let _span = info_span!("commit").entered();
        runtime.commit_geo()?;
    }
    Ok(())
}

fn apply_parameters(
    runtime: &mut RuntimeContext,
    parameters: &[(String, HostValue)],
) -> Result<(), Error> {
    let _span = info_span!("parameters", count = parameters.len()).entered();
    if parameters.is_empty() {
        return Ok(());
    }
    if runtime.parameters().is_none() {
        runtime.fetch_parameters()?;
    }
    for (name, value) in parameters {
        let Some(index) = runtime.parameter_index(name) else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown parameter `{name}`"))
                .with_hint("run `meshbridge describe` to list parameters"));
        };
        match runtime.apply_host_value(index, value) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Unsupported => {
                warn!(parameter = %name, %err, "parameter not applied");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Surfaced parameters of the selected asset, read from a throwaway node.
pub fn describe_parameters(runtime: &mut RuntimeContext) -> Result<Vec<ParameterDescriptor>, Error> {
    let _span = info_span!("describe").entered();
    let previous = runtime.binding();
    runtime.create_node()?;
    let described = runtime
        .fetch_parameters()
        .and_then(|_| runtime.surfaced_parameters());
    let destroyed = runtime.destroy_node();
    if let Some(binding) = previous {
        runtime.bind_node(binding);
    }
    let described = described?;
    destroyed?;
    Ok(described)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PluginInfo {
    pub index: usize,
    pub identifier: String,
}

/// Lists the assets of `library_path`, at most `config.max_plugins` of them.
pub fn discover_plugins(
    session: Arc<Session>,
    config: &RuntimeConfig,
    library_path: &str,
) -> Result<Vec<PluginInfo>, Error> {
    let mut runtime = RuntimeContext::new(session, config.clone());
    runtime.set_library(library_path)?;
    let available = runtime.asset_count();
    if available > config.max_plugins {
        warn!(
            available,
            max = config.max_plugins,
            "library has more assets than plugin slots"
        );
    }
    (0..available.min(config.max_plugins))
        .map(|index| -> Result<PluginInfo, Error> {
            Ok(PluginInfo {
                index,
                identifier: runtime.asset_name(index)?,
            })
        })
        .collect()
}
