//! Purpose: In-process reference engine backed by JSON asset libraries.
//! Exports: `MemoryEngine`.
//! Role: Drives the CLI without a native engine and backs every test that needs one.
//! Invariants: All state sits behind one mutex; every call is atomic with respect to others.
//! Invariants: Handles are never reused within one engine instance.
//! Invariants: Input geometry only becomes visible downstream after `commit_geo`.
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;

use super::{
    ATTRIB_POSITION, AttributeInfo, AttributeOwner, AttributeRole, Engine, EngineError,
    EngineResult, GeoInfo, LibraryId, NodeFlags, NodeId, NodeInfo, NodeType, ParmInfo, ParmType,
    PartId, PartInfo, PartType, ResultCode, SessionId, StorageType, StringHandle,
};
use crate::core::session::SessionOptions;

#[derive(Clone, Debug, Deserialize)]
struct LibraryFile {
    assets: Vec<AssetDef>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
enum AssetKind {
    #[default]
    Geometry,
    Object,
    /// Simulation network; instantiable but exposes no geometry.
    Dynamics,
}

#[derive(Clone, Debug, Deserialize)]
struct AssetDef {
    name: String,
    #[serde(default)]
    kind: AssetKind,
    #[serde(default)]
    parms: Vec<ParmDef>,
    #[serde(default)]
    parts: Vec<PartDef>,
    #[serde(default)]
    passthrough_input: bool,
    #[serde(default)]
    translate_parm: Option<String>,
    #[serde(default)]
    cook_state: Option<i32>,
    #[serde(default)]
    lazy_children: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
enum ParmKind {
    Int,
    Float,
    Color,
    String,
    Toggle,
}

impl ParmKind {
    fn parm_type(self) -> ParmType {
        match self {
            ParmKind::Int => ParmType::Int,
            ParmKind::Float => ParmType::Float,
            ParmKind::Color => ParmType::Color,
            ParmKind::String => ParmType::String,
            ParmKind::Toggle => ParmType::Toggle,
        }
    }
}

fn one() -> usize {
    1
}

#[derive(Clone, Debug, Deserialize)]
struct ParmDef {
    name: String,
    #[serde(rename = "type")]
    kind: ParmKind,
    #[serde(default = "one")]
    size: usize,
    #[serde(default)]
    default: Vec<f64>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
enum PartKind {
    #[default]
    Mesh,
    Curve,
    Volume,
}

impl PartKind {
    fn part_type(self) -> PartType {
        match self {
            PartKind::Mesh => PartType::Mesh,
            PartKind::Curve => PartType::Curve,
            PartKind::Volume => PartType::Volume,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct PartDef {
    #[serde(rename = "type", default)]
    kind: PartKind,
    #[serde(default)]
    points: Vec<[f32; 3]>,
    #[serde(default)]
    vertices: Vec<i32>,
    #[serde(default)]
    faces: Vec<i32>,
    #[serde(default)]
    uv: Option<Vec<[f32; 2]>>,
}

#[derive(Clone, Debug)]
struct AttributeData {
    tuple_size: usize,
    role: AttributeRole,
    values: Vec<f32>,
}

#[derive(Clone, Debug)]
struct PartData {
    info: PartInfo,
    vertices: Vec<i32>,
    faces: Vec<i32>,
    attributes: BTreeMap<(i32, String), AttributeData>,
}

impl PartData {
    fn empty(info: PartInfo) -> Self {
        Self {
            info,
            vertices: vec![0; info.vertex_count],
            faces: vec![0; info.face_count],
            attributes: BTreeMap::new(),
        }
    }

    fn from_def(def: &PartDef) -> Self {
        let mut part = Self::empty(PartInfo {
            part_type: def.kind.part_type(),
            point_count: def.points.len(),
            vertex_count: def.vertices.len(),
            face_count: def.faces.len(),
            is_instanced: false,
        });
        part.vertices = def.vertices.clone();
        part.faces = def.faces.clone();
        part.attributes.insert(
            attribute_key(ATTRIB_POSITION, AttributeOwner::Point),
            AttributeData {
                tuple_size: 3,
                role: AttributeRole::Point,
                values: def.points.iter().flatten().copied().collect(),
            },
        );
        if let Some(uv) = &def.uv {
            part.attributes.insert(
                attribute_key("uv", AttributeOwner::Vertex),
                AttributeData {
                    tuple_size: 2,
                    role: AttributeRole::TextureCoord,
                    values: uv.iter().flatten().copied().collect(),
                },
            );
        }
        part
    }

    fn translate(&mut self, offset: [f32; 3]) {
        let key = attribute_key(ATTRIB_POSITION, AttributeOwner::Point);
        if let Some(position) = self.attributes.get_mut(&key) {
            if position.tuple_size == 3 {
                for point in position.values.chunks_exact_mut(3) {
                    for (value, delta) in point.iter_mut().zip(offset) {
                        *value += delta;
                    }
                }
            }
        }
    }

    fn owner_count(&self, owner: AttributeOwner) -> usize {
        match owner {
            AttributeOwner::Point => self.info.point_count,
            AttributeOwner::Vertex => self.info.vertex_count,
            AttributeOwner::Prim => self.info.face_count,
            AttributeOwner::Detail => 1,
        }
    }
}

fn attribute_key(name: &str, owner: AttributeOwner) -> (i32, String) {
    (owner.raw(), name.to_string())
}

#[derive(Debug)]
enum NodeRole {
    /// Instantiated asset.
    Asset(Arc<AssetDef>),
    /// Container owning one editable geometry child.
    InputContainer,
    /// Editable geometry fed through the input calls.
    InputGeometry,
    /// Display child of an object asset, emitting one static part.
    StaticChild { part: PartDef, lazy: bool },
}

#[derive(Debug)]
struct NodeRecord {
    node_type: NodeType,
    role: NodeRole,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    parms: Vec<ParmInfo>,
    float_values: Vec<f32>,
    int_values: Vec<i32>,
    inputs: BTreeMap<usize, NodeId>,
    staged: Vec<PartData>,
    geometry: Vec<PartData>,
    display: bool,
}

impl NodeRecord {
    fn new(node_type: NodeType, role: NodeRole, parent: Option<NodeId>) -> Self {
        Self {
            node_type,
            role,
            parent,
            children: Vec::new(),
            parms: Vec::new(),
            float_values: Vec::new(),
            int_values: Vec::new(),
            inputs: BTreeMap::new(),
            staged: Vec::new(),
            geometry: Vec::new(),
            display: true,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    next_session: i64,
    live_sessions: Vec<SessionId>,
    sessions_created: usize,
    sessions_cleaned: usize,
    peak_live_sessions: usize,
    failures: Vec<(String, Option<NodeId>)>,
    virtual_files: HashMap<String, String>,
    strings: Vec<String>,
    libraries: Vec<Vec<StringHandle>>,
    assets: HashMap<String, Arc<AssetDef>>,
    next_node: i32,
    nodes: BTreeMap<NodeId, NodeRecord>,
    deleted: Vec<NodeId>,
    cook_state: i32,
    composed: HashMap<NodeId, Vec<NodeId>>,
}

/// Reference engine. Cheap to construct; share it behind an `Arc<dyn Engine>`.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers library text under `path` so tests can load it without touching disk.
    pub fn install_library(&self, path: &str, json: &str) {
        self.lock()
            .virtual_files
            .insert(path.to_string(), json.to_string());
    }

    /// Makes every later `call` fail with `ResultCode::Failure`.
    pub fn fail_on(&self, call: &str) {
        self.lock().failures.push((call.to_string(), None));
    }

    /// Makes `call` fail when it targets `node`.
    pub fn fail_on_node(&self, call: &str, node: NodeId) {
        self.lock().failures.push((call.to_string(), Some(node)));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn sessions_created(&self) -> usize {
        self.lock().sessions_created
    }

    pub fn sessions_cleaned(&self) -> usize {
        self.lock().sessions_cleaned
    }

    /// Most sessions that were alive at the same time.
    pub fn peak_live_sessions(&self) -> usize {
        self.lock().peak_live_sessions
    }

    pub fn deleted_nodes(&self) -> Vec<NodeId> {
        self.lock().deleted.clone()
    }

    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.lock().nodes.keys().copied().collect()
    }

    /// Ids of the nodes wired into `node`'s inputs, by input index.
    pub fn node_inputs(&self, node: NodeId) -> Vec<(usize, NodeId)> {
        self.lock()
            .nodes
            .get(&node)
            .map(|record| record.inputs.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(
        &self,
        call: &'static str,
        session: SessionId,
        node: Option<NodeId>,
    ) -> EngineResult<MutexGuard<'_, State>> {
        let state = self.lock();
        state.check_failure(call, node)?;
        if !state.live_sessions.contains(&session) {
            return Err(EngineError::new(call, ResultCode::InvalidSession));
        }
        Ok(state)
    }
}

impl State {
    fn check_failure(&self, call: &'static str, node: Option<NodeId>) -> EngineResult<()> {
        let hit = self.failures.iter().any(|(name, target)| {
            name == call && (target.is_none() || *target == node)
        });
        if hit {
            return Err(EngineError::new(call, ResultCode::Failure));
        }
        Ok(())
    }

    fn intern(&mut self, value: &str) -> StringHandle {
        if let Some(index) = self.strings.iter().position(|s| s == value) {
            return StringHandle(index as i32 + 1);
        }
        self.strings.push(value.to_string());
        StringHandle(self.strings.len() as i32)
    }

    fn node(&self, call: &'static str, node: NodeId) -> EngineResult<&NodeRecord> {
        self.nodes
            .get(&node)
            .ok_or(EngineError::new(call, ResultCode::NodeInvalid))
    }

    fn node_mut(&mut self, call: &'static str, node: NodeId) -> EngineResult<&mut NodeRecord> {
        self.nodes
            .get_mut(&node)
            .ok_or(EngineError::new(call, ResultCode::NodeInvalid))
    }

    fn insert_node(&mut self, record: NodeRecord) -> NodeId {
        self.next_node += 1;
        let id = NodeId(self.next_node);
        if let Some(parent) = record.parent {
            if let Some(parent) = self.nodes.get_mut(&parent) {
                parent.children.push(id);
            }
        }
        self.nodes.insert(id, record);
        id
    }

    fn remove_tree(&mut self, node: NodeId) {
        let Some(record) = self.nodes.remove(&node) else {
            return;
        };
        self.deleted.push(node);
        if let Some(parent) = record.parent.and_then(|id| self.nodes.get_mut(&id)) {
            parent.children.retain(|child| *child != node);
        }
        for record in self.nodes.values_mut() {
            record.inputs.retain(|_, upstream| *upstream != node);
        }
        for child in record.children {
            self.remove_tree(child);
        }
    }

    fn instantiate_parms(&mut self, record: &mut NodeRecord, asset: &AssetDef) {
        for def in &asset.parms {
            let parm_type = def.kind.parm_type();
            let name = self.intern(&def.name);
            let info = ParmInfo {
                name,
                parm_type,
                size: def.size,
                float_values_index: record.float_values.len(),
                int_values_index: record.int_values.len(),
                string_values_index: 0,
            };
            let default = |index: usize| def.default.get(index).copied().unwrap_or(0.0);
            if parm_type.uses_float_storage() {
                record
                    .float_values
                    .extend((0..def.size).map(|i| default(i) as f32));
            } else if parm_type.uses_int_storage() {
                record
                    .int_values
                    .extend((0..def.size).map(|i| default(i) as i32));
            }
            record.parms.push(info);
        }
    }

    fn float_parm(&self, record: &NodeRecord, name: &str) -> Option<[f32; 3]> {
        record.parms.iter().find_map(|info| {
            let matches = self
                .strings
                .get((info.name.0 - 1) as usize)
                .is_some_and(|s| s == name);
            if !matches || !info.parm_type.uses_float_storage() || info.size < 3 {
                return None;
            }
            let values = record
                .float_values
                .get(info.float_values_index..info.float_values_index + 3)?;
            Some([values[0], values[1], values[2]])
        })
    }

    /// Evaluates one node. Returns the cook state the engine reports afterwards.
    fn cook(&mut self, node: NodeId) -> EngineResult<i32> {
        let record = self.node("cook_node", node)?;
        match &record.role {
            NodeRole::Asset(asset) => {
                let asset = Arc::clone(asset);
                let mut parts = Vec::new();
                if asset.passthrough_input {
                    for upstream in record.inputs.values() {
                        if let Some(upstream) = self.nodes.get(upstream) {
                            parts.extend(upstream.geometry.iter().cloned());
                        }
                    }
                }
                parts.extend(asset.parts.iter().map(PartData::from_def));
                if let Some(offset) = asset
                    .translate_parm
                    .as_deref()
                    .and_then(|name| self.float_parm(record, name))
                {
                    for part in &mut parts {
                        part.translate(offset);
                    }
                }
                let children = record.children.clone();
                let node_type = record.node_type;
                let state = asset.cook_state.unwrap_or(0);
                if node_type == NodeType::Geometry {
                    self.node_mut("cook_node", node)?.geometry = parts;
                }
                for child in children {
                    if let Some(child) = self.nodes.get_mut(&child) {
                        if let NodeRole::StaticChild { part, lazy: false } = &child.role {
                            child.geometry = vec![PartData::from_def(part)];
                        }
                    }
                }
                Ok(state)
            }
            NodeRole::StaticChild { part, .. } => {
                let part = PartData::from_def(part);
                self.node_mut("cook_node", node)?.geometry = vec![part];
                Ok(0)
            }
            NodeRole::InputContainer | NodeRole::InputGeometry => Ok(0),
        }
    }

    fn part(&self, call: &'static str, node: NodeId, part: PartId) -> EngineResult<&PartData> {
        let record = self.node(call, node)?;
        usize::try_from(part.0)
            .ok()
            .and_then(|index| record.geometry.get(index))
            .ok_or(EngineError::new(call, ResultCode::InvalidArgument))
    }

    fn staged_part(
        &mut self,
        call: &'static str,
        node: NodeId,
        part: PartId,
    ) -> EngineResult<&mut PartData> {
        let record = self.node_mut(call, node)?;
        if !matches!(record.role, NodeRole::InputGeometry) {
            return Err(EngineError::new(call, ResultCode::InvalidArgument));
        }
        usize::try_from(part.0)
            .ok()
            .and_then(|index| record.staged.get_mut(index))
            .ok_or(EngineError::new(call, ResultCode::InvalidArgument))
    }
}

fn copy_range<T: Copy>(
    call: &'static str,
    source: &[T],
    out: &mut [T],
    start: usize,
) -> EngineResult<()> {
    let end = start + out.len();
    let values = source
        .get(start..end)
        .ok_or(EngineError::new(call, ResultCode::InvalidArgument))?;
    out.copy_from_slice(values);
    Ok(())
}

fn write_range<T: Copy>(
    call: &'static str,
    target: &mut [T],
    values: &[T],
    start: usize,
) -> EngineResult<()> {
    let end = start + values.len();
    let slots = target
        .get_mut(start..end)
        .ok_or(EngineError::new(call, ResultCode::InvalidArgument))?;
    slots.copy_from_slice(values);
    Ok(())
}

impl Engine for MemoryEngine {
    fn create_session(&self, _options: &SessionOptions) -> EngineResult<SessionId> {
        let mut state = self.lock();
        state.check_failure("create_session", None)?;
        state.next_session += 1;
        let id = SessionId(state.next_session);
        state.live_sessions.push(id);
        state.peak_live_sessions = state.peak_live_sessions.max(state.live_sessions.len());
        state.sessions_created += 1;
        Ok(id)
    }

    fn cleanup(&self, session: SessionId) -> EngineResult<()> {
        let mut state = self.enter("cleanup", session, None)?;
        state.live_sessions.retain(|live| *live != session);
        state.sessions_cleaned += 1;
        let nodes: Vec<NodeId> = state.nodes.keys().copied().collect();
        for node in nodes {
            state.remove_tree(node);
        }
        Ok(())
    }

    fn load_asset_library(&self, session: SessionId, path: &str) -> EngineResult<LibraryId> {
        const CALL: &str = "load_asset_library";
        let mut state = self.enter(CALL, session, None)?;
        let text = match state.virtual_files.get(path) {
            Some(text) => text.clone(),
            None => fs::read_to_string(path)
                .map_err(|_| EngineError::new(CALL, ResultCode::CantLoadFile))?,
        };
        let file: LibraryFile = serde_json::from_str(&text)
            .map_err(|_| EngineError::new(CALL, ResultCode::AssetInvalid))?;
        let mut handles = Vec::with_capacity(file.assets.len());
        for asset in file.assets {
            handles.push(state.intern(&asset.name));
            state.assets.insert(asset.name.clone(), Arc::new(asset));
        }
        state.libraries.push(handles);
        Ok(LibraryId(state.libraries.len() as i32 - 1))
    }

    fn available_asset_count(&self, session: SessionId, library: LibraryId) -> EngineResult<usize> {
        const CALL: &str = "available_asset_count";
        let state = self.enter(CALL, session, None)?;
        usize::try_from(library.0)
            .ok()
            .and_then(|index| state.libraries.get(index))
            .map(Vec::len)
            .ok_or(EngineError::new(CALL, ResultCode::InvalidArgument))
    }

    fn available_assets(
        &self,
        session: SessionId,
        library: LibraryId,
        count: usize,
    ) -> EngineResult<Vec<StringHandle>> {
        const CALL: &str = "available_assets";
        let state = self.enter(CALL, session, None)?;
        let handles = usize::try_from(library.0)
            .ok()
            .and_then(|index| state.libraries.get(index))
            .ok_or(EngineError::new(CALL, ResultCode::InvalidArgument))?;
        if count > handles.len() {
            return Err(EngineError::new(CALL, ResultCode::InvalidArgument));
        }
        Ok(handles[..count].to_vec())
    }

    fn string(&self, session: SessionId, handle: StringHandle) -> EngineResult<String> {
        const CALL: &str = "string";
        let state = self.enter(CALL, session, None)?;
        usize::try_from(handle.0 - 1)
            .ok()
            .and_then(|index| state.strings.get(index))
            .cloned()
            .ok_or(EngineError::new(CALL, ResultCode::InvalidArgument))
    }

    fn create_node(
        &self,
        session: SessionId,
        parent: Option<NodeId>,
        operator_name: &str,
        cook_on_creation: bool,
    ) -> EngineResult<NodeId> {
        const CALL: &str = "create_node";
        let mut state = self.enter(CALL, session, parent)?;
        if let Some(parent) = parent {
            state.node(CALL, parent)?;
        }
        let asset = state
            .assets
            .get(operator_name)
            .cloned()
            .ok_or(EngineError::new(CALL, ResultCode::AssetInvalid))?;
        let node_type = match asset.kind {
            AssetKind::Geometry => NodeType::Geometry,
            AssetKind::Object => NodeType::Object,
            AssetKind::Dynamics => NodeType::Dynamics,
        };
        let mut record = NodeRecord::new(node_type, NodeRole::Asset(Arc::clone(&asset)), parent);
        state.instantiate_parms(&mut record, &asset);
        let id = state.insert_node(record);
        if asset.kind == AssetKind::Object {
            for part in &asset.parts {
                let role = NodeRole::StaticChild {
                    part: part.clone(),
                    lazy: asset.lazy_children,
                };
                state.insert_node(NodeRecord::new(NodeType::Geometry, role, Some(id)));
            }
        }
        if cook_on_creation {
            state.cook(id)?;
        }
        Ok(id)
    }

    fn create_input_node(&self, session: SessionId, _name: Option<&str>) -> EngineResult<NodeId> {
        let mut state = self.enter("create_input_node", session, None)?;
        let container = state.insert_node(NodeRecord::new(
            NodeType::Object,
            NodeRole::InputContainer,
            None,
        ));
        state.insert_node(NodeRecord::new(
            NodeType::Geometry,
            NodeRole::InputGeometry,
            Some(container),
        ));
        Ok(container)
    }

    fn delete_node(&self, session: SessionId, node: NodeId) -> EngineResult<()> {
        const CALL: &str = "delete_node";
        let mut state = self.enter(CALL, session, Some(node))?;
        state.node(CALL, node)?;
        state.remove_tree(node);
        Ok(())
    }

    fn node_info(&self, session: SessionId, node: NodeId) -> EngineResult<NodeInfo> {
        const CALL: &str = "node_info";
        let state = self.enter(CALL, session, Some(node))?;
        let record = state.node(CALL, node)?;
        Ok(NodeInfo {
            id: node,
            node_type: record.node_type,
            parm_count: record.parms.len(),
        })
    }

    fn connect_node_input(
        &self,
        session: SessionId,
        node: NodeId,
        input_index: usize,
        upstream: NodeId,
        _output_index: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "connect_node_input";
        let mut state = self.enter(CALL, session, Some(node))?;
        state.node(CALL, upstream)?;
        state.node_mut(CALL, node)?.inputs.insert(input_index, upstream);
        Ok(())
    }

    fn display_geo_info(&self, session: SessionId, node: NodeId) -> EngineResult<GeoInfo> {
        const CALL: &str = "display_geo_info";
        let state = self.enter(CALL, session, Some(node))?;
        let record = state.node(CALL, node)?;
        let target = if record.node_type == NodeType::Geometry {
            node
        } else {
            record
                .children
                .iter()
                .copied()
                .find(|child| state.nodes.get(child).is_some_and(|c| c.display))
                .ok_or(EngineError::new(CALL, ResultCode::InvalidArgument))?
        };
        let part_count = state.node(CALL, target)?.geometry.len();
        Ok(GeoInfo {
            node_id: target,
            name: StringHandle(0),
            part_count,
        })
    }

    fn parameters(
        &self,
        session: SessionId,
        node: NodeId,
        start: usize,
        count: usize,
    ) -> EngineResult<Vec<ParmInfo>> {
        const CALL: &str = "parameters";
        let state = self.enter(CALL, session, Some(node))?;
        let record = state.node(CALL, node)?;
        record
            .parms
            .get(start..start + count)
            .map(<[ParmInfo]>::to_vec)
            .ok_or(EngineError::new(CALL, ResultCode::InvalidArgument))
    }

    fn parm_float_values(
        &self,
        session: SessionId,
        node: NodeId,
        out: &mut [f32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "parm_float_values";
        let state = self.enter(CALL, session, Some(node))?;
        copy_range(CALL, &state.node(CALL, node)?.float_values, out, start)
    }

    fn parm_int_values(
        &self,
        session: SessionId,
        node: NodeId,
        out: &mut [i32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "parm_int_values";
        let state = self.enter(CALL, session, Some(node))?;
        copy_range(CALL, &state.node(CALL, node)?.int_values, out, start)
    }

    fn set_parm_float_values(
        &self,
        session: SessionId,
        node: NodeId,
        values: &[f32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "set_parm_float_values";
        let mut state = self.enter(CALL, session, Some(node))?;
        let record = state.node_mut(CALL, node)?;
        write_range(CALL, &mut record.float_values, values, start)
            .map_err(|_| EngineError::new(CALL, ResultCode::ParmSetFailed))
    }

    fn set_parm_int_values(
        &self,
        session: SessionId,
        node: NodeId,
        values: &[i32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "set_parm_int_values";
        let mut state = self.enter(CALL, session, Some(node))?;
        let record = state.node_mut(CALL, node)?;
        write_range(CALL, &mut record.int_values, values, start)
            .map_err(|_| EngineError::new(CALL, ResultCode::ParmSetFailed))
    }

    fn cook_node(&self, session: SessionId, node: NodeId) -> EngineResult<()> {
        let mut state = self.enter("cook_node", session, Some(node))?;
        let cook_state = state.cook(node)?;
        state.cook_state = cook_state;
        Ok(())
    }

    fn cook_state(&self, session: SessionId) -> EngineResult<i32> {
        let state = self.enter("cook_state", session, None)?;
        Ok(state.cook_state)
    }

    fn compose_child_node_list(
        &self,
        session: SessionId,
        parent: NodeId,
        node_type: NodeType,
        flags: NodeFlags,
        recursive: bool,
    ) -> EngineResult<usize> {
        const CALL: &str = "compose_child_node_list";
        let mut state = self.enter(CALL, session, Some(parent))?;
        let mut pending: Vec<NodeId> = state.node(CALL, parent)?.children.clone();
        let mut found = Vec::new();
        while let Some(child) = pending.pop() {
            let Some(record) = state.nodes.get(&child) else {
                continue;
            };
            let node_flags = if record.display {
                NodeFlags::DISPLAY
            } else {
                NodeFlags::NONE
            };
            if record.node_type == node_type && node_flags.contains(flags) {
                found.push(child);
            }
            if recursive {
                pending.extend(record.children.iter().copied());
            }
        }
        found.sort();
        let count = found.len();
        state.composed.insert(parent, found);
        Ok(count)
    }

    fn composed_child_node_list(
        &self,
        session: SessionId,
        parent: NodeId,
        count: usize,
    ) -> EngineResult<Vec<NodeId>> {
        const CALL: &str = "composed_child_node_list";
        let state = self.enter(CALL, session, Some(parent))?;
        let composed = state
            .composed
            .get(&parent)
            .ok_or(EngineError::new(CALL, ResultCode::InvalidArgument))?;
        if count > composed.len() {
            return Err(EngineError::new(CALL, ResultCode::InvalidArgument));
        }
        Ok(composed[..count].to_vec())
    }

    fn geo_info(&self, session: SessionId, node: NodeId) -> EngineResult<GeoInfo> {
        const CALL: &str = "geo_info";
        let mut state = self.enter(CALL, session, Some(node))?;
        let record = state.node(CALL, node)?;
        if record.node_type != NodeType::Geometry {
            return Err(EngineError::new(CALL, ResultCode::InvalidArgument));
        }
        let part_count = record.geometry.len();
        let name = state.intern(&format!("geo{}", node.0));
        Ok(GeoInfo {
            node_id: node,
            name,
            part_count,
        })
    }

    fn part_info(&self, session: SessionId, node: NodeId, part: PartId) -> EngineResult<PartInfo> {
        const CALL: &str = "part_info";
        let state = self.enter(CALL, session, Some(node))?;
        Ok(state.part(CALL, node, part)?.info)
    }

    fn attribute_info(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        name: &str,
        owner: AttributeOwner,
    ) -> EngineResult<AttributeInfo> {
        const CALL: &str = "attribute_info";
        let state = self.enter(CALL, session, Some(node))?;
        let data = state.part(CALL, node, part)?;
        let info = match data.attributes.get(&attribute_key(name, owner)) {
            Some(attribute) => AttributeInfo {
                exists: true,
                owner,
                storage: StorageType::Float,
                tuple_size: attribute.tuple_size,
                count: data.owner_count(owner),
                role: attribute.role,
            },
            None => AttributeInfo::missing(owner),
        };
        Ok(info)
    }

    fn attribute_float_data(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        name: &str,
        info: &AttributeInfo,
        out: &mut [f32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "attribute_float_data";
        let state = self.enter(CALL, session, Some(node))?;
        let data = state.part(CALL, node, part)?;
        let attribute = data
            .attributes
            .get(&attribute_key(name, info.owner))
            .ok_or(EngineError::new(CALL, ResultCode::InvalidArgument))?;
        if info.tuple_size != attribute.tuple_size || info.tuple_size == 0 {
            return Err(EngineError::new(CALL, ResultCode::InvalidArgument));
        }
        copy_range(CALL, &attribute.values, out, start * attribute.tuple_size)
    }

    fn vertex_list(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        out: &mut [i32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "vertex_list";
        let state = self.enter(CALL, session, Some(node))?;
        copy_range(CALL, &state.part(CALL, node, part)?.vertices, out, start)
    }

    fn face_counts(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        out: &mut [i32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "face_counts";
        let state = self.enter(CALL, session, Some(node))?;
        copy_range(CALL, &state.part(CALL, node, part)?.faces, out, start)
    }

    fn set_part_info(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        info: &PartInfo,
    ) -> EngineResult<()> {
        const CALL: &str = "set_part_info";
        let mut state = self.enter(CALL, session, Some(node))?;
        let record = state.node_mut(CALL, node)?;
        if !matches!(record.role, NodeRole::InputGeometry) || part.0 != 0 {
            return Err(EngineError::new(CALL, ResultCode::InvalidArgument));
        }
        record.staged = vec![PartData::empty(*info)];
        Ok(())
    }

    fn add_attribute(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        name: &str,
        info: &AttributeInfo,
    ) -> EngineResult<()> {
        const CALL: &str = "add_attribute";
        let mut state = self.enter(CALL, session, Some(node))?;
        let data = state.staged_part(CALL, node, part)?;
        if info.storage != StorageType::Float || info.tuple_size == 0 {
            return Err(EngineError::new(CALL, ResultCode::InvalidArgument));
        }
        let count = data.owner_count(info.owner);
        data.attributes.insert(
            attribute_key(name, info.owner),
            AttributeData {
                tuple_size: info.tuple_size,
                role: info.role,
                values: vec![0.0; count * info.tuple_size],
            },
        );
        Ok(())
    }

    fn set_attribute_float_data(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        name: &str,
        info: &AttributeInfo,
        data: &[f32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "set_attribute_float_data";
        let mut state = self.enter(CALL, session, Some(node))?;
        let part = state.staged_part(CALL, node, part)?;
        let attribute = part
            .attributes
            .get_mut(&attribute_key(name, info.owner))
            .ok_or(EngineError::new(CALL, ResultCode::InvalidArgument))?;
        write_range(CALL, &mut attribute.values, data, start * attribute.tuple_size)
    }

    fn set_vertex_list(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        data: &[i32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "set_vertex_list";
        let mut state = self.enter(CALL, session, Some(node))?;
        let part = state.staged_part(CALL, node, part)?;
        write_range(CALL, &mut part.vertices, data, start)
    }

    fn set_face_counts(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        data: &[i32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "set_face_counts";
        let mut state = self.enter(CALL, session, Some(node))?;
        let part = state.staged_part(CALL, node, part)?;
        write_range(CALL, &mut part.faces, data, start)
    }

    fn commit_geo(&self, session: SessionId, node: NodeId) -> EngineResult<()> {
        const CALL: &str = "commit_geo";
        let mut state = self.enter(CALL, session, Some(node))?;
        let record = state.node_mut(CALL, node)?;
        if !matches!(record.role, NodeRole::InputGeometry) {
            return Err(EngineError::new(CALL, ResultCode::InvalidArgument));
        }
        record.geometry = record.staged.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryEngine;
    use crate::core::engine::{
        AttributeInfo, AttributeOwner, AttributeRole, Engine, NodeFlags, NodeType, PartId,
        PartInfo, ResultCode, SessionId,
    };
    use crate::core::session::SessionOptions;

    const LIBRARY: &str = r#"{
        "assets": [
            {
                "name": "Sop/quad",
                "parms": [{"name": "mfx_offset", "type": "float", "size": 3, "default": [0, 0, 1]}],
                "parts": [{"points": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]], "vertices": [0,1,2,3], "faces": [4]}],
                "translate_parm": "mfx_offset",
                "passthrough_input": true
            },
            {
                "name": "Object/pair",
                "kind": "object",
                "lazy_children": true,
                "parts": [
                    {"points": [[0,0,0],[1,0,0],[0,1,0]], "vertices": [0,1,2], "faces": [3]},
                    {"type": "curve", "points": [[0,0,0],[1,1,1]], "vertices": [0,1], "faces": [2]}
                ]
            }
        ]
    }"#;

    fn engine() -> (MemoryEngine, SessionId) {
        let engine = MemoryEngine::new();
        engine.install_library("lib.json", LIBRARY);
        let session = engine
            .create_session(&SessionOptions::in_process())
            .expect("session");
        (engine, session)
    }

    #[test]
    fn library_lists_assets_by_handle() {
        let (engine, session) = engine();
        let library = engine.load_asset_library(session, "lib.json").expect("load");
        let count = engine.available_asset_count(session, library).expect("count");
        let handles = engine.available_assets(session, library, count).expect("assets");
        let names: Vec<String> = handles
            .into_iter()
            .map(|handle| engine.string(session, handle).expect("name"))
            .collect();
        assert_eq!(names, ["Sop/quad", "Object/pair"]);
    }

    #[test]
    fn missing_library_reports_cant_load_file() {
        let (engine, session) = engine();
        let err = engine
            .load_asset_library(session, "/nonexistent/lib.json")
            .expect_err("missing");
        assert_eq!(err.code, ResultCode::CantLoadFile);
    }

    #[test]
    fn geometry_asset_cooks_with_translation() {
        let (engine, session) = engine();
        engine.load_asset_library(session, "lib.json").expect("load");
        let node = engine.create_node(session, None, "Sop/quad", false).expect("node");
        engine.cook_node(session, node).expect("cook");
        let info = engine
            .attribute_info(session, node, PartId(0), "P", AttributeOwner::Point)
            .expect("info");
        let mut points = vec![0.0; 12];
        engine
            .attribute_float_data(session, node, PartId(0), "P", &info, &mut points, 0)
            .expect("points");
        assert_eq!(&points[..3], &[0.0, 0.0, 1.0]);
        assert_eq!(&points[6..9], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn input_geometry_is_visible_after_commit() {
        let (engine, session) = engine();
        let container = engine.create_input_node(session, None).expect("input");
        let geo = engine.display_geo_info(session, container).expect("geo").node_id;
        engine
            .set_part_info(session, geo, PartId(0), &PartInfo::mesh(3, 3, 1))
            .expect("part");
        let info = AttributeInfo::float(AttributeOwner::Point, 3, 3, AttributeRole::Point);
        engine.add_attribute(session, geo, PartId(0), "P", &info).expect("attr");
        engine
            .set_attribute_float_data(session, geo, PartId(0), "P", &info, &[0.0; 9], 0)
            .expect("data");
        assert_eq!(engine.geo_info(session, geo).expect("geo").part_count, 0);
        engine.commit_geo(session, geo).expect("commit");
        assert_eq!(engine.geo_info(session, geo).expect("geo").part_count, 1);
    }

    #[test]
    fn lazy_children_materialize_when_cooked() {
        let (engine, session) = engine();
        engine.load_asset_library(session, "lib.json").expect("load");
        let node = engine.create_node(session, None, "Object/pair", false).expect("node");
        engine.cook_node(session, node).expect("cook");
        let count = engine
            .compose_child_node_list(session, node, NodeType::Geometry, NodeFlags::DISPLAY, true)
            .expect("compose");
        let children = engine.composed_child_node_list(session, node, count).expect("list");
        assert_eq!(children.len(), 2);
        assert_eq!(engine.geo_info(session, children[0]).expect("geo").part_count, 0);
        engine.cook_node(session, children[0]).expect("cook child");
        assert_eq!(engine.geo_info(session, children[0]).expect("geo").part_count, 1);
    }

    #[test]
    fn injected_failures_target_one_node() {
        let (engine, session) = engine();
        engine.load_asset_library(session, "lib.json").expect("load");
        let a = engine.create_node(session, None, "Sop/quad", false).expect("a");
        let b = engine.create_node(session, None, "Sop/quad", false).expect("b");
        engine.fail_on_node("cook_node", a);
        assert_eq!(
            engine.cook_node(session, a).expect_err("a fails").code,
            ResultCode::Failure
        );
        engine.cook_node(session, b).expect("b cooks");
    }

    #[test]
    fn deleting_a_container_removes_its_children() {
        let (engine, session) = engine();
        let container = engine.create_input_node(session, None).expect("input");
        let geo = engine.display_geo_info(session, container).expect("geo").node_id;
        engine.delete_node(session, container).expect("delete");
        assert_eq!(engine.deleted_nodes(), vec![container, geo]);
        assert_eq!(
            engine.node_info(session, geo).expect_err("gone").code,
            ResultCode::NodeInvalid
        );
        assert!(engine.live_nodes().is_empty());
    }

    #[test]
    fn calls_after_cleanup_are_invalid_session() {
        let (engine, session) = engine();
        engine.cleanup(session).expect("cleanup");
        assert_eq!(
            engine.cook_state(session).expect_err("closed").code,
            ResultCode::InvalidSession
        );
    }
}
