//! Purpose: Per-plugin runtime context driving one asset through load, cook and transfer.
//! Exports: `RuntimeContext`, `NodeBinding`, `InputRig`, `NodeKind`, `ParameterDescriptor`.
//! Role: Library & Node Lifecycle, Parameter Bridge, Cook Orchestrator and Output
//!       Consolidator on top of a shared `Session`.
//! Invariants: The context never owns the session; it holds one counted reference.
//! Invariants: Parameter and sub-output tables are replaced wholesale, never appended.
//! Invariants: Every error, fatal or soft, overwrites the last-error slot.
//! Invariants: Stage preconditions are checked and reported as `ErrorKind::Usage`.
#![allow(clippy::result_large_err)]

use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn};

use super::config::RuntimeConfig;
use crate::core::attribute::{Attribute, AttributeMut};
use crate::core::cook::{CookOutcome, CookState, Readiness};
use crate::core::engine::{
    Engine, LibraryId, NodeFlags, NodeId, NodeType, ParmInfo, ParmType, StringHandle,
};
use crate::core::error::{Error, ErrorKind};
use crate::core::marshal::{GeoCounts, Marshaller, MeshBuffers, MeshInput};
use crate::core::parm::{
    HostParamType, HostValue, MAX_PARM_TUPLE, ParmPush, ParmValues, convert_host_value,
    host_param_type, is_surfaced,
};
use crate::core::session::Session;

pub type RuntimeResult<T> = Result<T, Error>;

/// How a node takes part in the lifecycle, decided from its engine type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Leaf geometry operator; needs a synthetic input wired upstream and is its own output.
    Operator,
    /// Object-level container; outputs are its display geometry children.
    Container,
    Unsupported(NodeType),
}

impl NodeKind {
    pub fn of(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Geometry => NodeKind::Operator,
            NodeType::Object => NodeKind::Container,
            other => NodeKind::Unsupported(other),
        }
    }
}

/// Editable input geometry: the container node and its display geometry node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InputRig {
    pub object_id: NodeId,
    pub geometry_id: NodeId,
}

/// The node one host instance drives, plus its input rig when it has one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeBinding {
    pub node_id: NodeId,
    pub input: Option<InputRig>,
}

/// A parameter the host may see and set.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterDescriptor {
    pub index: usize,
    pub name: String,
    pub host_type: HostParamType,
    pub size: usize,
    pub default: Option<ParmValues>,
}

pub struct RuntimeContext {
    session: Arc<Session>,
    config: RuntimeConfig,
    library_path: Option<String>,
    library: Option<LibraryId>,
    asset_names: Vec<StringHandle>,
    current_asset: Option<usize>,
    binding: Option<NodeBinding>,
    parms: Option<Vec<ParmInfo>>,
    sops: Option<Vec<NodeId>>,
    last_error: Option<String>,
}

impl RuntimeContext {
    pub fn new(session: Arc<Session>, config: RuntimeConfig) -> Self {
        Self {
            session,
            config,
            library_path: None,
            library: None,
            asset_names: Vec::new(),
            current_asset: None,
            binding: None,
            parms: None,
            sops: None,
            last_error: None,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn engine(&self) -> &dyn Engine {
        self.session.engine()
    }

    /// Owned copy of the last recorded error text.
    pub fn cook_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    fn record<T>(&mut self, result: RuntimeResult<T>) -> RuntimeResult<T> {
        if let Err(err) = &result {
            error!(kind = ?err.kind(), %err, "runtime operation failed");
            self.last_error = Some(err.to_string());
        }
        result
    }

    fn record_soft(&mut self, skipped: Vec<Error>) {
        if let Some(err) = skipped.last() {
            self.last_error = Some(err.to_string());
        }
    }

    // Library

    pub fn library_path(&self) -> Option<&str> {
        self.library_path.as_deref()
    }

    /// Loads the library at `path`, or clears asset state when `path` is empty.
    ///
    /// The engine cannot unload a library; only the cached asset names are dropped.
    pub fn set_library(&mut self, path: &str) -> RuntimeResult<()> {
        self.asset_names.clear();
        self.library = None;
        self.current_asset = None;
        if path.is_empty() {
            info!("no asset library selected");
            self.library_path = None;
            return Ok(());
        }
        self.library_path = Some(path.to_string());
        let result = self.load_library(path);
        self.record(result)
    }

    fn load_library(&mut self, path: &str) -> RuntimeResult<()> {
        let _span = info_span!("load_library", path).entered();
        let engine = self.session.engine();
        let session = self.session.id();
        let library_error = |err| {
            Error::engine(ErrorKind::Library, err).with_hint(format!("library path: {path}"))
        };
        let library = engine
            .load_asset_library(session, path)
            .map_err(library_error)?;
        let count = engine
            .available_asset_count(session, library)
            .map_err(library_error)?;
        let names = engine
            .available_assets(session, library, count)
            .map_err(library_error)?;
        info!(path, assets = count, "loaded asset library");
        self.library = Some(library);
        self.asset_names = names;
        Ok(())
    }

    pub fn asset_count(&self) -> usize {
        self.asset_names.len()
    }

    pub fn asset_name(&mut self, index: usize) -> RuntimeResult<String> {
        let result = self.resolve_asset_name(index);
        self.record(result)
    }

    fn resolve_asset_name(&self, index: usize) -> RuntimeResult<String> {
        let handle = self.asset_names.get(index).copied().ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!(
                "asset index {index} is out of range ({} assets loaded)",
                self.asset_names.len()
            ))
        })?;
        self.engine()
            .string(self.session.id(), handle)
            .map_err(|err| Error::engine(ErrorKind::Library, err))
    }

    pub fn asset_names(&mut self) -> RuntimeResult<Vec<String>> {
        (0..self.asset_count())
            .map(|index| self.asset_name(index))
            .collect()
    }

    pub fn select_asset(&mut self, index: usize) -> RuntimeResult<()> {
        if index >= self.asset_names.len() {
            let err = Error::new(ErrorKind::Usage).with_message(format!(
                "asset index {index} is out of range ({} assets loaded)",
                self.asset_names.len()
            ));
            return self.record(Err(err));
        }
        self.current_asset = Some(index);
        Ok(())
    }

    pub fn current_asset(&self) -> Option<usize> {
        self.current_asset
    }

    // Nodes

    /// Instantiates the selected asset, wiring a synthetic input under operator assets.
    pub fn create_node(&mut self) -> RuntimeResult<NodeBinding> {
        let result = self.instantiate();
        let binding = self.record(result)?;
        self.bind_node(binding);
        Ok(binding)
    }

    fn instantiate(&self) -> RuntimeResult<NodeBinding> {
        let index = self.current_asset.ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("no asset selected; load a library first")
        })?;
        let name = self.resolve_asset_name(index)?;
        let _span = info_span!("create_node", asset = %name).entered();
        let engine = self.engine();
        let session = self.session.id();
        let node_error = |err| Error::engine(ErrorKind::Node, err);

        let node_id = engine
            .create_node(session, None, &name, false)
            .map_err(node_error)?;
        let node_info = engine
            .node_info(session, node_id)
            .map_err(|err| node_error(err).with_node(node_id))?;

        match NodeKind::of(node_info.node_type) {
            NodeKind::Container | NodeKind::Unsupported(_) => {
                info!(node = node_id.0, node_type = ?node_info.node_type, "created node");
                Ok(NodeBinding {
                    node_id,
                    input: None,
                })
            }
            NodeKind::Operator => {
                engine
                    .delete_node(session, node_id)
                    .map_err(|err| node_error(err).with_node(node_id))?;
                let object_id = engine.create_input_node(session, None).map_err(node_error)?;
                let geometry_id = match engine.display_geo_info(session, object_id) {
                    Ok(info) => info.node_id,
                    Err(err) => {
                        self.discard(&[object_id]);
                        return Err(node_error(err).with_node(object_id));
                    }
                };
                let node_id = match engine.create_node(session, None, &name, false) {
                    Ok(node_id) => node_id,
                    Err(err) => {
                        self.discard(&[object_id]);
                        return Err(node_error(err));
                    }
                };
                if let Err(err) = engine.connect_node_input(session, node_id, 0, geometry_id, 0) {
                    self.discard(&[node_id, object_id]);
                    return Err(node_error(err).with_node(node_id));
                }
                info!(
                    node = node_id.0,
                    input = object_id.0,
                    input_sop = geometry_id.0,
                    "created operator node with input"
                );
                Ok(NodeBinding {
                    node_id,
                    input: Some(InputRig {
                        object_id,
                        geometry_id,
                    }),
                })
            }
        }
    }

    /// Best-effort removal of nodes a failed instantiation left behind.
    fn discard(&self, nodes: &[NodeId]) {
        let session = self.session.id();
        for &node in nodes {
            if let Err(err) = self.engine().delete_node(session, node) {
                warn!(node = node.0, %err, "could not remove partially created node");
            }
        }
    }

    /// Makes `binding` the node later calls act on. Node-scoped tables are dropped.
    pub fn bind_node(&mut self, binding: NodeBinding) {
        if self.binding != Some(binding) {
            self.parms = None;
            self.sops = None;
        }
        self.binding = Some(binding);
    }

    pub fn binding(&self) -> Option<NodeBinding> {
        self.binding
    }

    fn bound(&self) -> RuntimeResult<NodeBinding> {
        self.binding.ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("no node created for this runtime")
        })
    }

    /// Deletes the bound node and its input container.
    pub fn destroy_node(&mut self) -> RuntimeResult<()> {
        let result = self.delete_bound();
        self.binding = None;
        self.parms = None;
        self.sops = None;
        self.record(result)
    }

    fn delete_bound(&self) -> RuntimeResult<()> {
        let binding = self.bound()?;
        let engine = self.engine();
        let session = self.session.id();
        let main = engine
            .delete_node(session, binding.node_id)
            .map_err(|err| Error::engine(ErrorKind::Node, err).with_node(binding.node_id));
        // The input container goes even when the main node could not be deleted.
        let input = match binding.input {
            Some(rig) => engine
                .delete_node(session, rig.object_id)
                .map_err(|err| Error::engine(ErrorKind::Node, err).with_node(rig.object_id)),
            None => Ok(()),
        };
        if let Err(err) = &main {
            warn!(node = binding.node_id.0, %err, "main node not deleted");
        }
        main.and(input)?;
        info!(node = binding.node_id.0, "destroyed node");
        Ok(())
    }

    // Parameters

    /// Replaces the parameter table with the bound node's current descriptors.
    pub fn fetch_parameters(&mut self) -> RuntimeResult<usize> {
        self.parms = None;
        let result = self.query_parameters();
        let parms = self.record(result)?;
        let count = parms.len();
        self.parms = Some(parms);
        Ok(count)
    }

    fn query_parameters(&self) -> RuntimeResult<Vec<ParmInfo>> {
        let binding = self.bound()?;
        let engine = self.engine();
        let session = self.session.id();
        let node = binding.node_id;
        let info = engine
            .node_info(session, node)
            .map_err(|err| Error::engine(ErrorKind::Parameter, err).with_node(node))?;
        if info.parm_count == 0 {
            return Ok(Vec::new());
        }
        engine
            .parameters(session, node, 0, info.parm_count)
            .map_err(|err| Error::engine(ErrorKind::Parameter, err).with_node(node))
    }

    pub fn parameters(&self) -> Option<&[ParmInfo]> {
        self.parms.as_deref()
    }

    fn parm(&self, index: usize) -> RuntimeResult<ParmInfo> {
        let parms = self.parms.as_deref().ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("parameters have not been fetched")
        })?;
        parms.get(index).copied().ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!(
                "parameter index {index} is out of range ({} parameters)",
                parms.len()
            ))
        })
    }

    pub fn parameter_name(&mut self, index: usize) -> RuntimeResult<String> {
        let result = self.resolve_parameter_name(index);
        self.record(result)
    }

    fn resolve_parameter_name(&self, index: usize) -> RuntimeResult<String> {
        let info = self.parm(index)?;
        self.engine()
            .string(self.session.id(), info.name)
            .map_err(|err| Error::engine(ErrorKind::Parameter, err))
    }

    /// Linear scan over the fetched table.
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        let count = self.parms.as_ref().map_or(0, Vec::len);
        (0..count).find(|&index| {
            self.resolve_parameter_name(index)
                .is_ok_and(|candidate| candidate == name)
        })
    }

    pub fn set_float_parm(&mut self, index: usize, values: &[f32]) -> RuntimeResult<()> {
        let result = self.push_float(index, values);
        self.record(result)
    }

    fn push_float(&self, index: usize, values: &[f32]) -> RuntimeResult<()> {
        let info = self.parm(index)?;
        if !info.parm_type.uses_float_storage() {
            return Err(Error::new(ErrorKind::Parameter).with_message(format!(
                "parameter {index} has type {:?}, not float storage",
                info.parm_type
            )));
        }
        let node = self.bound()?.node_id;
        self.engine()
            .set_parm_float_values(self.session.id(), node, values, info.float_values_index)
            .map_err(|err| Error::engine(ErrorKind::Parameter, err).with_node(node))
    }

    pub fn set_int_parm(&mut self, index: usize, values: &[i32]) -> RuntimeResult<()> {
        let result = self.push_int(index, values);
        self.record(result)
    }

    fn push_int(&self, index: usize, values: &[i32]) -> RuntimeResult<()> {
        let info = self.parm(index)?;
        if !info.parm_type.uses_int_storage() {
            return Err(Error::new(ErrorKind::Parameter).with_message(format!(
                "parameter {index} has type {:?}, not integer storage",
                info.parm_type
            )));
        }
        let node = self.bound()?.node_id;
        self.engine()
            .set_parm_int_values(self.session.id(), node, values, info.int_values_index)
            .map_err(|err| Error::engine(ErrorKind::Parameter, err).with_node(node))
    }

    /// Current values of parameter `index`; `None` for types without numeric storage.
    pub fn parameter_default(&mut self, index: usize) -> RuntimeResult<Option<ParmValues>> {
        let result = self.read_parameter(index);
        self.record(result)
    }

    fn read_parameter(&self, index: usize) -> RuntimeResult<Option<ParmValues>> {
        let info = self.parm(index)?;
        let size = info.size.max(1);
        if size > MAX_PARM_TUPLE {
            return Ok(None);
        }
        let node = self.bound()?.node_id;
        let engine = self.engine();
        let session = self.session.id();
        let read_error = |err| Error::engine(ErrorKind::Parameter, err).with_node(node);
        if info.parm_type.uses_float_storage() {
            let mut values = vec![0.0f32; size];
            engine
                .parm_float_values(session, node, &mut values, info.float_values_index)
                .map_err(read_error)?;
            return Ok(Some(ParmValues::Float(values)));
        }
        if info.parm_type.uses_int_storage() {
            let mut values = vec![0i32; size];
            engine
                .parm_int_values(session, node, &mut values, info.int_values_index)
                .map_err(read_error)?;
            return Ok(Some(ParmValues::Int(values)));
        }
        Ok(None)
    }

    /// Parameters carrying the configured prefix and a host-representable type.
    pub fn surfaced_parameters(&mut self) -> RuntimeResult<Vec<ParameterDescriptor>> {
        let count = match &self.parms {
            Some(parms) => parms.len(),
            None => {
                return self.record(Err(Error::new(ErrorKind::Usage)
                    .with_message("parameters have not been fetched")));
            }
        };
        let mut surfaced = Vec::new();
        for index in 0..count {
            let info = match self.parm(index) {
                Ok(info) => info,
                Err(err) => return self.record(Err(err)),
            };
            let name = self.parameter_name(index)?;
            if !is_surfaced(&name, &self.config.parameter_prefix) {
                continue;
            }
            let Some(host_type) = host_param_type(info.parm_type, info.size) else {
                debug!(name = %name, parm_type = ?info.parm_type, size = info.size, "skipping parameter");
                continue;
            };
            let default = match info.parm_type {
                ParmType::String => None,
                _ => self.parameter_default(index)?,
            };
            surfaced.push(ParameterDescriptor {
                index,
                name,
                host_type,
                size: info.size,
                default,
            });
        }
        Ok(surfaced)
    }

    /// Pushes a host-side value into parameter `index`.
    pub fn apply_host_value(&mut self, index: usize, value: &HostValue) -> RuntimeResult<()> {
        let info = match self.parm(index) {
            Ok(info) => info,
            Err(err) => return self.record(Err(err)),
        };
        let push = match convert_host_value(&info, value) {
            Ok(push) => push,
            Err(err) => return self.record(Err(err)),
        };
        match push {
            ParmPush::Float(values) => self.set_float_parm(index, &values),
            ParmPush::Int(values) => self.set_int_parm(index, &values),
        }
    }

    // Cooking

    /// Cooks the bound node and classifies the resulting state.
    ///
    /// A failed cook request or status query counts as still loading, so the frame is
    /// skipped and the error lands in the last-error slot.
    pub fn cook(&mut self) -> RuntimeResult<CookOutcome> {
        self.sops = None;
        let binding = match self.bound() {
            Ok(binding) => binding,
            Err(err) => return self.record(Err(err)),
        };
        let _span = info_span!("cook", node = binding.node_id.0).entered();
        let engine = self.session.engine();
        let session = self.session.id();
        let state = match engine.cook_node(session, binding.node_id) {
            Err(err) => {
                let err = Error::engine(ErrorKind::Node, err).with_node(binding.node_id);
                warn!(%err, "cook request failed, treating cook as not finished");
                self.last_error = Some(err.to_string());
                CookState::Loading
            }
            Ok(()) => self.cook_state(binding.node_id),
        };

        let outcome = CookOutcome { state };
        match outcome.readiness() {
            Readiness::Ready => info!(state = state.raw(), "cook finished"),
            Readiness::ReadyWithWarning => {
                warn!(state = state.raw(), warning = state.warning().unwrap_or_default(), "cook finished degraded")
            }
            Readiness::NotReady => {
                warn!(state = state.raw(), "cook not finished, skipping output")
            }
        }
        Ok(outcome)
    }

    /// A failed status query counts as still loading.
    fn cook_state(&mut self, node: NodeId) -> CookState {
        match self.session.engine().cook_state(self.session.id()) {
            Ok(raw) => CookState::from_raw(raw),
            Err(err) => {
                let err = Error::engine(ErrorKind::Node, err)
                    .with_message("cook state query failed")
                    .with_node(node);
                warn!(%err, "treating cook as not finished");
                self.last_error = Some(err.to_string());
                CookState::Loading
            }
        }
    }

    // Output

    /// Replaces the sub-output list with the geometry nodes the bound node exposes.
    pub fn fetch_sub_outputs(&mut self) -> RuntimeResult<&[NodeId]> {
        self.sops = None;
        let result = self.query_sub_outputs();
        let sops = self.record(result)?;
        debug!(count = sops.len(), "fetched sub-outputs");
        Ok(self.sops.insert(sops).as_slice())
    }

    fn query_sub_outputs(&self) -> RuntimeResult<Vec<NodeId>> {
        let node = self.bound()?.node_id;
        let engine = self.engine();
        let session = self.session.id();
        let node_error = |err| Error::engine(ErrorKind::Node, err).with_node(node);
        let info = engine.node_info(session, node).map_err(node_error)?;
        match NodeKind::of(info.node_type) {
            NodeKind::Operator => Ok(vec![node]),
            NodeKind::Container => {
                let count = engine
                    .compose_child_node_list(
                        session,
                        node,
                        NodeType::Geometry,
                        NodeFlags::DISPLAY,
                        true,
                    )
                    .map_err(node_error)?;
                let children = if count == 0 {
                    Vec::new()
                } else {
                    engine
                        .composed_child_node_list(session, node, count)
                        .map_err(node_error)?
                };
                info!(node = node.0, display_sops = children.len(), "composed sub-outputs");
                Ok(children)
            }
            NodeKind::Unsupported(node_type) => Err(Error::new(ErrorKind::Unsupported)
                .with_message(format!(
                    "only geometry and object assets are supported, this asset is {node_type:?}"
                ))
                .with_node(node)),
        }
    }

    pub fn sub_outputs(&self) -> Option<&[NodeId]> {
        self.sops.as_deref()
    }

    fn require_sops(&self) -> RuntimeResult<Vec<NodeId>> {
        self.sops.clone().ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("sub-outputs have not been fetched")
        })
    }

    /// Sums mesh element counts over every sub-output. Per-item failures are skipped.
    pub fn consolidate_counts(&mut self) -> RuntimeResult<GeoCounts> {
        let sops = match self.require_sops() {
            Ok(sops) => sops,
            Err(err) => return self.record(Err(err)),
        };
        let session = Arc::clone(&self.session);
        let marshaller = Marshaller::new(session.engine(), session.id());
        let mut skipped = Vec::new();
        let counts = marshaller.consolidate(&sops, &mut skipped);
        debug!(points = counts.points, vertices = counts.vertices, faces = counts.faces, "consolidated");
        self.record_soft(skipped);
        Ok(counts)
    }

    pub fn has_vertex_attribute(&self, name: &str) -> bool {
        let Some(sops) = self.sops.as_deref() else {
            return false;
        };
        Marshaller::new(self.engine(), self.session.id()).has_vertex_attribute(sops, name)
    }

    pub fn fill_mesh(
        &mut self,
        target: &mut MeshBuffers<'_>,
        counts: GeoCounts,
    ) -> RuntimeResult<GeoCounts> {
        let sops = match self.require_sops() {
            Ok(sops) => sops,
            Err(err) => return self.record(Err(err)),
        };
        let session = Arc::clone(&self.session);
        let marshaller = Marshaller::new(session.engine(), session.id());
        let mut skipped = Vec::new();
        let result = marshaller.fill_mesh(&sops, target, counts, &mut skipped);
        self.record_soft(skipped);
        self.record(result)
    }

    pub fn fill_vertex_attribute(
        &mut self,
        name: &str,
        dest: &mut AttributeMut<'_>,
        vertex_count: usize,
    ) -> RuntimeResult<()> {
        let sops = match self.require_sops() {
            Ok(sops) => sops,
            Err(err) => return self.record(Err(err)),
        };
        let session = Arc::clone(&self.session);
        let marshaller = Marshaller::new(session.engine(), session.id());
        let mut skipped = Vec::new();
        let result = marshaller.fill_vertex_attribute(&sops, name, dest, vertex_count, &mut skipped);
        self.record_soft(skipped);
        self.record(result)
    }

    // Input

    fn input_sop(&self) -> Option<NodeId> {
        self.binding
            .and_then(|binding| binding.input)
            .map(|rig| rig.geometry_id)
    }

    pub fn accepts_input(&self) -> bool {
        self.input_sop().is_some()
    }

    /// Feeds and commits the host mesh. Without an input rig this does nothing.
    pub fn feed_input_data(&mut self, mesh: &MeshInput<'_>, counts: GeoCounts) -> RuntimeResult<()> {
        let Some(input) = self.input_sop() else {
            return Ok(());
        };
        let _span = info_span!("feed", input = input.0, points = counts.points).entered();
        let result = Marshaller::new(self.engine(), self.session.id()).feed_mesh(input, mesh, counts);
        self.record(result)
    }

    pub fn feed_vertex_attribute(
        &mut self,
        name: &str,
        source: &Attribute<'_>,
        vertex_count: usize,
    ) -> RuntimeResult<()> {
        let Some(input) = self.input_sop() else {
            return Ok(());
        };
        let result = Marshaller::new(self.engine(), self.session.id())
            .feed_vertex_attribute(input, name, source, vertex_count);
        self.record(result)
    }

    /// Re-commits the input geometry after extra attributes were fed.
    pub fn commit_geo(&mut self) -> RuntimeResult<()> {
        let Some(input) = self.input_sop() else {
            return Ok(());
        };
        let result = Marshaller::new(self.engine(), self.session.id()).commit(input);
        self.record(result)
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("session", &self.session.id())
            .field("library_path", &self.library_path)
            .field("assets", &self.asset_names.len())
            .field("binding", &self.binding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeKind, RuntimeContext};
    use crate::api::config::RuntimeConfig;
    use crate::core::engine::memory::MemoryEngine;
    use crate::core::engine::NodeType;
    use crate::core::error::ErrorKind;
    use crate::core::parm::{HostParamType, HostValue, ParmValues};
    use crate::core::session::{SessionManager, SessionOptions};
    use std::sync::Arc;

    const LIBRARY: &str = r#"{
        "assets": [
            {
                "name": "Sop/grid",
                "parms": [
                    {"name": "mfx_size", "type": "float", "size": 2, "default": [1, 2]},
                    {"name": "mfx_rows", "type": "int", "default": [3]},
                    {"name": "mfx_label", "type": "string"},
                    {"name": "mfx_wide", "type": "float", "size": 4},
                    {"name": "internal", "type": "float"}
                ],
                "parts": [{"points": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]], "vertices": [0,1,2,3], "faces": [4]}]
            },
            {"name": "Object/empty", "kind": "object"}
        ]
    }"#;

    fn context() -> (Arc<MemoryEngine>, RuntimeContext) {
        let engine = Arc::new(MemoryEngine::new());
        engine.install_library("lib.json", LIBRARY);
        let manager = SessionManager::new(engine.clone(), SessionOptions::in_process());
        let session = manager.acquire().expect("session");
        let mut runtime = RuntimeContext::new(session, RuntimeConfig::default());
        runtime.set_library("lib.json").expect("library");
        (engine, runtime)
    }

    #[test]
    fn node_kinds() {
        assert_eq!(NodeKind::of(NodeType::Geometry), NodeKind::Operator);
        assert_eq!(NodeKind::of(NodeType::Object), NodeKind::Container);
        assert_eq!(NodeKind::of(NodeType::Vop), NodeKind::Unsupported(NodeType::Vop));
    }

    #[test]
    fn empty_path_clears_assets() {
        let (_engine, mut runtime) = context();
        assert_eq!(runtime.asset_count(), 2);
        runtime.select_asset(1).expect("select");
        runtime.set_library("").expect("clear");
        assert_eq!(runtime.asset_count(), 0);
        assert_eq!(runtime.current_asset(), None);
        assert_eq!(runtime.library_path(), None);
    }

    #[test]
    fn failed_load_leaves_no_assets_and_records_error() {
        let (_engine, mut runtime) = context();
        let err = runtime.set_library("/missing/library.json").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Library);
        assert_eq!(runtime.asset_count(), 0);
        assert!(runtime.cook_error().expect("error").contains("cannot load file"));
    }

    #[test]
    fn operator_assets_get_an_input_rig() {
        let (engine, mut runtime) = context();
        runtime.select_asset(0).expect("select");
        let binding = runtime.create_node().expect("node");
        let rig = binding.input.expect("rig");
        assert_eq!(engine.node_inputs(binding.node_id), vec![(0, rig.geometry_id)]);
        assert!(runtime.accepts_input());
    }

    #[test]
    fn destroy_deletes_the_input_container() {
        let (engine, mut runtime) = context();
        runtime.select_asset(0).expect("select");
        let binding = runtime.create_node().expect("node");
        let rig = binding.input.expect("rig");
        runtime.destroy_node().expect("destroy");
        let deleted = engine.deleted_nodes();
        assert!(deleted.contains(&binding.node_id));
        assert!(deleted.contains(&rig.object_id));
        assert!(deleted.contains(&rig.geometry_id));
        assert!(runtime.binding().is_none());
    }

    #[test]
    fn create_without_selection_is_usage_error() {
        let (_engine, mut runtime) = context();
        let err = runtime.create_node().expect_err("no selection");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(runtime.cook_error().is_some());
    }

    #[test]
    fn parameters_before_fetch_are_rejected() {
        let (_engine, mut runtime) = context();
        runtime.select_asset(0).expect("select");
        runtime.create_node().expect("node");
        let err = runtime.set_float_parm(0, &[1.0]).expect_err("not fetched");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn surfaced_parameters_filter_prefix_and_type() {
        let (_engine, mut runtime) = context();
        runtime.select_asset(0).expect("select");
        runtime.create_node().expect("node");
        assert_eq!(runtime.fetch_parameters().expect("fetch"), 5);
        let surfaced = runtime.surfaced_parameters().expect("surfaced");
        let names: Vec<&str> = surfaced.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["mfx_size", "mfx_rows", "mfx_label"]);
        assert_eq!(surfaced[0].host_type, HostParamType::Double2D);
        assert_eq!(surfaced[0].default, Some(ParmValues::Float(vec![1.0, 2.0])));
        assert_eq!(surfaced[1].default, Some(ParmValues::Int(vec![3])));
        assert_eq!(surfaced[2].default, None);
    }

    #[test]
    fn surfaced_parameter_failures_land_in_the_error_slot() {
        let (engine, mut runtime) = context();
        runtime.select_asset(0).expect("select");
        runtime.create_node().expect("node");

        let err = runtime.surfaced_parameters().expect_err("not fetched");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(runtime.cook_error().is_some());

        runtime.fetch_parameters().expect("fetch");
        runtime.clear_error();
        engine.fail_on("string");
        let err = runtime.surfaced_parameters().expect_err("names unreadable");
        assert_eq!(err.kind(), ErrorKind::Parameter);
        assert_eq!(runtime.cook_error(), Some(err.to_string()));
    }

    #[test]
    fn host_values_land_at_the_value_offset() {
        let (_engine, mut runtime) = context();
        runtime.select_asset(0).expect("select");
        runtime.create_node().expect("node");
        runtime.fetch_parameters().expect("fetch");
        let index = runtime.parameter_index("mfx_size").expect("index");
        runtime
            .apply_host_value(index, &HostValue::Doubles(vec![4.0, 5.0]))
            .expect("apply");
        assert_eq!(
            runtime.parameter_default(index).expect("read"),
            Some(ParmValues::Float(vec![4.0, 5.0]))
        );
        let rows = runtime.parameter_index("mfx_rows").expect("rows");
        let err = runtime.set_float_parm(rows, &[1.0]).expect_err("int parm");
        assert_eq!(err.kind(), ErrorKind::Parameter);

        let label = runtime.parameter_index("mfx_label").expect("label");
        let err = runtime
            .apply_host_value(label, &HostValue::String("hi".into()))
            .expect_err("string");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn failed_status_query_is_not_ready() {
        let (engine, mut runtime) = context();
        runtime.select_asset(0).expect("select");
        runtime.create_node().expect("node");
        engine.fail_on("cook_state");
        let outcome = runtime.cook().expect("cook");
        assert!(!outcome.is_ready());
        assert!(runtime.cook_error().is_some());
    }

    #[test]
    fn empty_container_yields_no_sub_outputs() {
        let (_engine, mut runtime) = context();
        runtime.select_asset(1).expect("select");
        let binding = runtime.create_node().expect("node");
        assert!(binding.input.is_none());
        assert!(runtime.cook().expect("cook").is_ready());
        assert!(runtime.fetch_sub_outputs().expect("sops").is_empty());
        assert_eq!(runtime.consolidate_counts().expect("counts").points, 0);
    }

    #[test]
    fn consolidation_requires_fetched_sub_outputs() {
        let (_engine, mut runtime) = context();
        let err = runtime.consolidate_counts().expect_err("no sops");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
