//! Purpose: Describe the procedural engine boundary consumed by the bridge.
//! Exports: `Engine`, id newtypes, node/part/attribute/parameter info types, `ResultCode`.
//! Role: Every native call the core makes goes through `Engine`; implementations wrap a
//!       real engine (see `abi` for the C function-table adapter) or the in-process
//!       `memory::MemoryEngine`.
//! Invariants: Calls are synchronous and never run concurrently on one session.
//! Invariants: Bulk data calls read/write contiguous slices; element counts come from the
//!             slice length.
use std::fmt;

use crate::core::session::SessionOptions;

pub mod memory;
mod result;

pub use result::{EngineError, EngineResult, ResultCode};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionId(pub i64);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(pub i32);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PartId(pub i32);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StringHandle(pub i32);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LibraryId(pub i32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator context a node lives in.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeType {
    None,
    Object,
    Geometry,
    Channel,
    Render,
    Shader,
    Composite,
    Vop,
    Dynamics,
    Task,
}

impl NodeType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(NodeType::None),
            1 => Some(NodeType::Object),
            2 => Some(NodeType::Geometry),
            4 => Some(NodeType::Channel),
            8 => Some(NodeType::Render),
            16 => Some(NodeType::Shader),
            32 => Some(NodeType::Composite),
            64 => Some(NodeType::Vop),
            128 => Some(NodeType::Dynamics),
            256 => Some(NodeType::Task),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            NodeType::None => 0,
            NodeType::Object => 1,
            NodeType::Geometry => 2,
            NodeType::Channel => 4,
            NodeType::Render => 8,
            NodeType::Shader => 16,
            NodeType::Composite => 32,
            NodeType::Vop => 64,
            NodeType::Dynamics => 128,
            NodeType::Task => 256,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NodeFlags(pub i32);

impl NodeFlags {
    pub const ANY: NodeFlags = NodeFlags(-1);
    pub const NONE: NodeFlags = NodeFlags(0);
    pub const DISPLAY: NodeFlags = NodeFlags(1);

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 == -1 || (self.0 & other.0) == other.0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub node_type: NodeType,
    pub parm_count: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GeoInfo {
    pub node_id: NodeId,
    pub name: StringHandle,
    pub part_count: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartType {
    Invalid,
    Mesh,
    Curve,
    Volume,
    Instancer,
    Box,
    Sphere,
}

impl PartType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => PartType::Mesh,
            1 => PartType::Curve,
            2 => PartType::Volume,
            3 => PartType::Instancer,
            4 => PartType::Box,
            5 => PartType::Sphere,
            _ => PartType::Invalid,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            PartType::Invalid => -1,
            PartType::Mesh => 0,
            PartType::Curve => 1,
            PartType::Volume => 2,
            PartType::Instancer => 3,
            PartType::Box => 4,
            PartType::Sphere => 5,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PartInfo {
    pub part_type: PartType,
    pub point_count: usize,
    pub vertex_count: usize,
    pub face_count: usize,
    pub is_instanced: bool,
}

impl PartInfo {
    pub fn mesh(point_count: usize, vertex_count: usize, face_count: usize) -> Self {
        Self {
            part_type: PartType::Mesh,
            point_count,
            vertex_count,
            face_count,
            is_instanced: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttributeOwner {
    Vertex,
    Point,
    Prim,
    Detail,
}

impl AttributeOwner {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(AttributeOwner::Vertex),
            1 => Some(AttributeOwner::Point),
            2 => Some(AttributeOwner::Prim),
            3 => Some(AttributeOwner::Detail),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            AttributeOwner::Vertex => 0,
            AttributeOwner::Point => 1,
            AttributeOwner::Prim => 2,
            AttributeOwner::Detail => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageType {
    Invalid,
    Int,
    Int64,
    Float,
    Float64,
    String,
}

impl StorageType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => StorageType::Int,
            1 => StorageType::Int64,
            2 => StorageType::Float,
            3 => StorageType::Float64,
            4 => StorageType::String,
            _ => StorageType::Invalid,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            StorageType::Invalid => -1,
            StorageType::Int => 0,
            StorageType::Int64 => 1,
            StorageType::Float => 2,
            StorageType::Float64 => 3,
            StorageType::String => 4,
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            StorageType::Int | StorageType::Float => 4,
            StorageType::Int64 | StorageType::Float64 => 8,
            StorageType::Invalid | StorageType::String => 0,
        }
    }
}

/// Semantic hint attached to an attribute (position, color, texture coordinate...).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttributeRole {
    None,
    Point,
    Vector,
    Normal,
    Color,
    TextureCoord,
}

impl AttributeRole {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => AttributeRole::Point,
            3 => AttributeRole::Vector,
            4 => AttributeRole::Normal,
            5 => AttributeRole::Color,
            7 => AttributeRole::TextureCoord,
            _ => AttributeRole::None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            AttributeRole::None => 0,
            AttributeRole::Point => 1,
            AttributeRole::Vector => 3,
            AttributeRole::Normal => 4,
            AttributeRole::Color => 5,
            AttributeRole::TextureCoord => 7,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttributeInfo {
    pub exists: bool,
    pub owner: AttributeOwner,
    pub storage: StorageType,
    pub tuple_size: usize,
    pub count: usize,
    pub role: AttributeRole,
}

impl AttributeInfo {
    pub fn missing(owner: AttributeOwner) -> Self {
        Self {
            exists: false,
            owner,
            storage: StorageType::Invalid,
            tuple_size: 0,
            count: 0,
            role: AttributeRole::None,
        }
    }

    pub fn float(owner: AttributeOwner, tuple_size: usize, count: usize, role: AttributeRole) -> Self {
        Self {
            exists: true,
            owner,
            storage: StorageType::Float,
            tuple_size,
            count,
            role,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParmType {
    Int,
    Toggle,
    Button,
    Float,
    Color,
    String,
    Other(i32),
}

impl ParmType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ParmType::Int,
            2 => ParmType::Toggle,
            3 => ParmType::Button,
            4 => ParmType::Float,
            5 => ParmType::Color,
            6 => ParmType::String,
            other => ParmType::Other(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            ParmType::Int => 0,
            ParmType::Toggle => 2,
            ParmType::Button => 3,
            ParmType::Float => 4,
            ParmType::Color => 5,
            ParmType::String => 6,
            ParmType::Other(raw) => raw,
        }
    }

    pub fn uses_float_storage(self) -> bool {
        matches!(self, ParmType::Float | ParmType::Color)
    }

    pub fn uses_int_storage(self) -> bool {
        matches!(self, ParmType::Int | ParmType::Toggle | ParmType::Button)
    }
}

/// Parameter descriptor. Values are addressed through the per-storage value index, not
/// through the parameter's position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParmInfo {
    pub name: StringHandle,
    pub parm_type: ParmType,
    pub size: usize,
    pub float_values_index: usize,
    pub int_values_index: usize,
    pub string_values_index: usize,
}

/// The native engine, addressed through a session id.
pub trait Engine: Send + Sync {
    fn create_session(&self, options: &SessionOptions) -> EngineResult<SessionId>;
    fn cleanup(&self, session: SessionId) -> EngineResult<()>;

    fn load_asset_library(&self, session: SessionId, path: &str) -> EngineResult<LibraryId>;
    fn available_asset_count(&self, session: SessionId, library: LibraryId) -> EngineResult<usize>;
    fn available_assets(
        &self,
        session: SessionId,
        library: LibraryId,
        count: usize,
    ) -> EngineResult<Vec<StringHandle>>;
    fn string(&self, session: SessionId, handle: StringHandle) -> EngineResult<String>;

    fn create_node(
        &self,
        session: SessionId,
        parent: Option<NodeId>,
        operator_name: &str,
        cook_on_creation: bool,
    ) -> EngineResult<NodeId>;
    fn create_input_node(&self, session: SessionId, name: Option<&str>) -> EngineResult<NodeId>;
    fn delete_node(&self, session: SessionId, node: NodeId) -> EngineResult<()>;
    fn node_info(&self, session: SessionId, node: NodeId) -> EngineResult<NodeInfo>;
    fn connect_node_input(
        &self,
        session: SessionId,
        node: NodeId,
        input_index: usize,
        upstream: NodeId,
        output_index: usize,
    ) -> EngineResult<()>;
    fn display_geo_info(&self, session: SessionId, node: NodeId) -> EngineResult<GeoInfo>;

    fn parameters(
        &self,
        session: SessionId,
        node: NodeId,
        start: usize,
        count: usize,
    ) -> EngineResult<Vec<ParmInfo>>;
    fn parm_float_values(
        &self,
        session: SessionId,
        node: NodeId,
        out: &mut [f32],
        start: usize,
    ) -> EngineResult<()>;
    fn parm_int_values(
        &self,
        session: SessionId,
        node: NodeId,
        out: &mut [i32],
        start: usize,
    ) -> EngineResult<()>;
    fn set_parm_float_values(
        &self,
        session: SessionId,
        node: NodeId,
        values: &[f32],
        start: usize,
    ) -> EngineResult<()>;
    fn set_parm_int_values(
        &self,
        session: SessionId,
        node: NodeId,
        values: &[i32],
        start: usize,
    ) -> EngineResult<()>;

    fn cook_node(&self, session: SessionId, node: NodeId) -> EngineResult<()>;
    /// Raw cook-state status code; see `core::cook::CookState`.
    fn cook_state(&self, session: SessionId) -> EngineResult<i32>;

    fn compose_child_node_list(
        &self,
        session: SessionId,
        parent: NodeId,
        node_type: NodeType,
        flags: NodeFlags,
        recursive: bool,
    ) -> EngineResult<usize>;
    fn composed_child_node_list(
        &self,
        session: SessionId,
        parent: NodeId,
        count: usize,
    ) -> EngineResult<Vec<NodeId>>;

    fn geo_info(&self, session: SessionId, node: NodeId) -> EngineResult<GeoInfo>;
    fn part_info(&self, session: SessionId, node: NodeId, part: PartId) -> EngineResult<PartInfo>;
    fn attribute_info(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        name: &str,
        owner: AttributeOwner,
    ) -> EngineResult<AttributeInfo>;
    /// Fills `out` with `out.len() / info.tuple_size` tuples starting at element `start`.
    fn attribute_float_data(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        name: &str,
        info: &AttributeInfo,
        out: &mut [f32],
        start: usize,
    ) -> EngineResult<()>;
    fn vertex_list(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        out: &mut [i32],
        start: usize,
    ) -> EngineResult<()>;
    fn face_counts(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        out: &mut [i32],
        start: usize,
    ) -> EngineResult<()>;

    fn set_part_info(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        info: &PartInfo,
    ) -> EngineResult<()>;
    fn add_attribute(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        name: &str,
        info: &AttributeInfo,
    ) -> EngineResult<()>;
    fn set_attribute_float_data(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        name: &str,
        info: &AttributeInfo,
        data: &[f32],
        start: usize,
    ) -> EngineResult<()>;
    fn set_vertex_list(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        data: &[i32],
        start: usize,
    ) -> EngineResult<()>;
    fn set_face_counts(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        data: &[i32],
        start: usize,
    ) -> EngineResult<()>;
    fn commit_geo(&self, session: SessionId, node: NodeId) -> EngineResult<()>;
}

/// Name of the position attribute on points.
pub const ATTRIB_POSITION: &str = "P";

#[cfg(test)]
mod tests {
    use super::{NodeFlags, NodeType, ParmType, PartType, StorageType};

    #[test]
    fn node_types_round_trip() {
        for raw in [0, 1, 2, 4, 8, 16, 32, 64, 128, 256] {
            let node_type = NodeType::from_raw(raw).expect("known node type");
            assert_eq!(node_type.raw(), raw);
        }
        assert_eq!(NodeType::from_raw(3), None);
    }

    #[test]
    fn unknown_part_types_are_invalid() {
        assert_eq!(PartType::from_raw(0), PartType::Mesh);
        assert_eq!(PartType::from_raw(42), PartType::Invalid);
    }

    #[test]
    fn display_flag_matches_any() {
        assert!(NodeFlags::ANY.contains(NodeFlags::DISPLAY));
        assert!(NodeFlags::DISPLAY.contains(NodeFlags::DISPLAY));
        assert!(!NodeFlags::NONE.contains(NodeFlags::DISPLAY));
    }

    #[test]
    fn storage_classes() {
        assert!(ParmType::Color.uses_float_storage());
        assert!(ParmType::Toggle.uses_int_storage());
        assert!(!ParmType::String.uses_float_storage());
        assert_eq!(StorageType::Float.byte_size(), 4);
        assert_eq!(StorageType::from_raw(9), StorageType::Invalid);
    }
}
