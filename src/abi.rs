//! Purpose: C ABI for host plugins (libmeshbridge).
//! Exports: `mbr_*` engine, session, runtime, error and string functions.
//! Role: Lets a C/C++ effect host drive `RuntimeContext` and plug a native engine in
//!       through `mbr_engine_vtable`.
//! Invariants: Opaque handles; every handle and string handed out has an explicit free.
//! Invariants: Fallible calls return 0 on success and -1 with `*out_err` set on failure.
//! Invariants: Error kinds map 1:1 with `core::error::to_exit_code`.
#![allow(clippy::result_large_err)]
#![allow(non_camel_case_types)]

use std::ffi::{CStr, CString};
use std::ptr;
use std::slice;
use std::sync::Arc;

use libc::{c_char, c_void};

use crate::api::{RuntimeConfig, RuntimeContext};
use crate::core::attribute::{Attribute, AttributeMut, AttributeType};
use crate::core::engine::memory::MemoryEngine;
use crate::core::engine::{
    AttributeInfo, AttributeOwner, AttributeRole, Engine, EngineError, EngineResult, GeoInfo,
    LibraryId, NodeFlags, NodeId, NodeInfo, NodeType, ParmInfo, ParmType, PartId, PartInfo,
    PartType, ResultCode, SessionId, StorageType, StringHandle,
};
use crate::core::error::{Error, ErrorKind, to_exit_code};
use crate::core::marshal::{GeoCounts, MeshBuffers, MeshInput};
use crate::core::session::{
    DEFAULT_PIPE_NAME, DEFAULT_PIPE_TIMEOUT_MS, SessionManager, SessionOptions, Transport,
};

pub const MBR_TRANSPORT_IN_PROCESS: i32 = 0;
pub const MBR_TRANSPORT_NAMED_PIPE: i32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct mbr_session_options {
    pub transport: i32,
    pub pipe_name: *const c_char,
    pub timeout_ms: f32,
    pub auto_close: u8,
    pub use_cooking_thread: u8,
    pub cooking_thread_stack_size: i32,
    pub environment_files: *const c_char,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct mbr_node_info {
    pub id: i32,
    pub node_type: i32,
    pub parm_count: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct mbr_geo_info {
    pub node_id: i32,
    pub name: i32,
    pub part_count: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct mbr_part_info {
    pub part_type: i32,
    pub point_count: i32,
    pub vertex_count: i32,
    pub face_count: i32,
    pub is_instanced: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct mbr_attribute_info {
    pub exists: u8,
    pub owner: i32,
    pub storage: i32,
    pub tuple_size: i32,
    pub count: i32,
    pub role: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct mbr_parm_info {
    pub name: i32,
    pub parm_type: i32,
    pub size: i32,
    pub float_values_index: i32,
    pub int_values_index: i32,
    pub string_values_index: i32,
}

type Ud = *mut c_void;

/// Native engine entry points. Each returns a raw result code (0 is success); a null
/// entry fails with "not initialized". `release` runs once when the engine is freed.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct mbr_engine_vtable {
    pub user_data: Ud,
    pub release: Option<unsafe extern "C" fn(Ud)>,
    pub create_session:
        Option<unsafe extern "C" fn(Ud, *const mbr_session_options, *mut i64) -> i32>,
    pub cleanup: Option<unsafe extern "C" fn(Ud, i64) -> i32>,
    pub load_asset_library: Option<unsafe extern "C" fn(Ud, i64, *const c_char, *mut i32) -> i32>,
    pub available_asset_count: Option<unsafe extern "C" fn(Ud, i64, i32, *mut i32) -> i32>,
    pub available_assets: Option<unsafe extern "C" fn(Ud, i64, i32, *mut i32, i32) -> i32>,
    /// Buffer length of a string handle, terminator included.
    pub string_length: Option<unsafe extern "C" fn(Ud, i64, i32, *mut i32) -> i32>,
    pub string: Option<unsafe extern "C" fn(Ud, i64, i32, *mut c_char, i32) -> i32>,
    /// `parent` is -1 for a top-level node.
    pub create_node:
        Option<unsafe extern "C" fn(Ud, i64, i32, *const c_char, u8, *mut i32) -> i32>,
    pub create_input_node: Option<unsafe extern "C" fn(Ud, i64, *const c_char, *mut i32) -> i32>,
    pub delete_node: Option<unsafe extern "C" fn(Ud, i64, i32) -> i32>,
    pub node_info: Option<unsafe extern "C" fn(Ud, i64, i32, *mut mbr_node_info) -> i32>,
    pub connect_node_input: Option<unsafe extern "C" fn(Ud, i64, i32, i32, i32, i32) -> i32>,
    pub display_geo_info: Option<unsafe extern "C" fn(Ud, i64, i32, *mut mbr_geo_info) -> i32>,
    pub parameters:
        Option<unsafe extern "C" fn(Ud, i64, i32, *mut mbr_parm_info, i32, i32) -> i32>,
    pub parm_float_values: Option<unsafe extern "C" fn(Ud, i64, i32, *mut f32, i32, i32) -> i32>,
    pub parm_int_values: Option<unsafe extern "C" fn(Ud, i64, i32, *mut i32, i32, i32) -> i32>,
    pub set_parm_float_values:
        Option<unsafe extern "C" fn(Ud, i64, i32, *const f32, i32, i32) -> i32>,
    pub set_parm_int_values:
        Option<unsafe extern "C" fn(Ud, i64, i32, *const i32, i32, i32) -> i32>,
    pub cook_node: Option<unsafe extern "C" fn(Ud, i64, i32) -> i32>,
    pub cook_state: Option<unsafe extern "C" fn(Ud, i64, *mut i32) -> i32>,
    pub compose_child_node_list:
        Option<unsafe extern "C" fn(Ud, i64, i32, i32, i32, u8, *mut i32) -> i32>,
    pub composed_child_node_list: Option<unsafe extern "C" fn(Ud, i64, i32, *mut i32, i32) -> i32>,
    pub geo_info: Option<unsafe extern "C" fn(Ud, i64, i32, *mut mbr_geo_info) -> i32>,
    pub part_info: Option<unsafe extern "C" fn(Ud, i64, i32, i32, *mut mbr_part_info) -> i32>,
    pub attribute_info: Option<
        unsafe extern "C" fn(Ud, i64, i32, i32, *const c_char, i32, *mut mbr_attribute_info) -> i32,
    >,
    pub attribute_float_data: Option<
        unsafe extern "C" fn(
            Ud,
            i64,
            i32,
            i32,
            *const c_char,
            *const mbr_attribute_info,
            *mut f32,
            i32,
            i32,
        ) -> i32,
    >,
    pub vertex_list: Option<unsafe extern "C" fn(Ud, i64, i32, i32, *mut i32, i32, i32) -> i32>,
    pub face_counts: Option<unsafe extern "C" fn(Ud, i64, i32, i32, *mut i32, i32, i32) -> i32>,
    pub set_part_info:
        Option<unsafe extern "C" fn(Ud, i64, i32, i32, *const mbr_part_info) -> i32>,
    pub add_attribute: Option<
        unsafe extern "C" fn(Ud, i64, i32, i32, *const c_char, *const mbr_attribute_info) -> i32,
    >,
    pub set_attribute_float_data: Option<
        unsafe extern "C" fn(
            Ud,
            i64,
            i32,
            i32,
            *const c_char,
            *const mbr_attribute_info,
            *const f32,
            i32,
            i32,
        ) -> i32,
    >,
    pub set_vertex_list:
        Option<unsafe extern "C" fn(Ud, i64, i32, i32, *const i32, i32, i32) -> i32>,
    pub set_face_counts:
        Option<unsafe extern "C" fn(Ud, i64, i32, i32, *const i32, i32, i32) -> i32>,
    pub commit_geo: Option<unsafe extern "C" fn(Ud, i64, i32) -> i32>,
}

/// `Engine` over a caller-supplied function table.
pub struct VtableEngine {
    vtable: mbr_engine_vtable,
}

// The host promises the table may be called from any thread, one call at a time per
// session; `SessionManager` and `RuntimeContext` never issue concurrent calls.
unsafe impl Send for VtableEngine {}
unsafe impl Sync for VtableEngine {}

impl VtableEngine {
    pub fn new(vtable: mbr_engine_vtable) -> Self {
        Self { vtable }
    }

    fn user_data(&self) -> Ud {
        self.vtable.user_data
    }
}

impl Drop for VtableEngine {
    fn drop(&mut self) {
        if let Some(release) = self.vtable.release {
            unsafe { release(self.vtable.user_data) };
        }
    }
}

fn entry<F>(call: &'static str, function: Option<F>) -> EngineResult<F> {
    function.ok_or(EngineError::new(call, ResultCode::NotInitialized))
}

fn check(call: &'static str, raw: i32) -> EngineResult<()> {
    let code = ResultCode::from_raw(raw);
    if code.is_success() {
        Ok(())
    } else {
        Err(EngineError::new(call, code))
    }
}

fn invalid(call: &'static str) -> EngineError {
    EngineError::new(call, ResultCode::InvalidArgument)
}

fn count_from_raw(call: &'static str, raw: i32) -> EngineResult<usize> {
    usize::try_from(raw).map_err(|_| invalid(call))
}

fn count_to_raw(call: &'static str, count: usize) -> EngineResult<i32> {
    i32::try_from(count).map_err(|_| invalid(call))
}

fn name_to_c(call: &'static str, name: &str) -> EngineResult<CString> {
    CString::new(name).map_err(|_| invalid(call))
}

fn node_info_from_raw(call: &'static str, raw: mbr_node_info) -> EngineResult<NodeInfo> {
    Ok(NodeInfo {
        id: NodeId(raw.id),
        node_type: NodeType::from_raw(raw.node_type).ok_or(invalid(call))?,
        parm_count: count_from_raw(call, raw.parm_count)?,
    })
}

fn geo_info_from_raw(call: &'static str, raw: mbr_geo_info) -> EngineResult<GeoInfo> {
    Ok(GeoInfo {
        node_id: NodeId(raw.node_id),
        name: StringHandle(raw.name),
        part_count: count_from_raw(call, raw.part_count)?,
    })
}

fn part_info_from_raw(call: &'static str, raw: mbr_part_info) -> EngineResult<PartInfo> {
    Ok(PartInfo {
        part_type: PartType::from_raw(raw.part_type),
        point_count: count_from_raw(call, raw.point_count)?,
        vertex_count: count_from_raw(call, raw.vertex_count)?,
        face_count: count_from_raw(call, raw.face_count)?,
        is_instanced: raw.is_instanced != 0,
    })
}

fn part_info_to_raw(call: &'static str, info: &PartInfo) -> EngineResult<mbr_part_info> {
    Ok(mbr_part_info {
        part_type: info.part_type.raw(),
        point_count: count_to_raw(call, info.point_count)?,
        vertex_count: count_to_raw(call, info.vertex_count)?,
        face_count: count_to_raw(call, info.face_count)?,
        is_instanced: u8::from(info.is_instanced),
    })
}

fn attribute_info_from_raw(
    call: &'static str,
    raw: mbr_attribute_info,
) -> EngineResult<AttributeInfo> {
    Ok(AttributeInfo {
        exists: raw.exists != 0,
        owner: AttributeOwner::from_raw(raw.owner).ok_or(invalid(call))?,
        storage: StorageType::from_raw(raw.storage),
        tuple_size: count_from_raw(call, raw.tuple_size)?,
        count: count_from_raw(call, raw.count)?,
        role: AttributeRole::from_raw(raw.role),
    })
}

fn attribute_info_to_raw(
    call: &'static str,
    info: &AttributeInfo,
) -> EngineResult<mbr_attribute_info> {
    Ok(mbr_attribute_info {
        exists: u8::from(info.exists),
        owner: info.owner.raw(),
        storage: info.storage.raw(),
        tuple_size: count_to_raw(call, info.tuple_size)?,
        count: count_to_raw(call, info.count)?,
        role: info.role.raw(),
    })
}

fn parm_info_from_raw(call: &'static str, raw: mbr_parm_info) -> EngineResult<ParmInfo> {
    Ok(ParmInfo {
        name: StringHandle(raw.name),
        parm_type: ParmType::from_raw(raw.parm_type),
        size: count_from_raw(call, raw.size)?,
        float_values_index: count_from_raw(call, raw.float_values_index)?,
        int_values_index: count_from_raw(call, raw.int_values_index)?,
        string_values_index: count_from_raw(call, raw.string_values_index)?,
    })
}

impl Engine for VtableEngine {
    fn create_session(&self, options: &SessionOptions) -> EngineResult<SessionId> {
        const CALL: &str = "create_session";
        let function = entry(CALL, self.vtable.create_session)?;
        let environment_files = name_to_c(CALL, &options.environment_files)?;
        let (transport, pipe_name, timeout_ms, auto_close) = match &options.transport {
            Transport::InProcess => (MBR_TRANSPORT_IN_PROCESS, None, 0.0, false),
            Transport::NamedPipe {
                pipe_name,
                timeout_ms,
                auto_close,
            } => (
                MBR_TRANSPORT_NAMED_PIPE,
                Some(name_to_c(CALL, pipe_name)?),
                *timeout_ms,
                *auto_close,
            ),
        };
        let raw = mbr_session_options {
            transport,
            pipe_name: pipe_name.as_ref().map_or(ptr::null(), |name| name.as_ptr()),
            timeout_ms,
            auto_close: u8::from(auto_close),
            use_cooking_thread: u8::from(options.use_cooking_thread),
            cooking_thread_stack_size: options.cooking_thread_stack_size,
            environment_files: environment_files.as_ptr(),
        };
        let mut session = 0i64;
        let code = unsafe { function(self.user_data(), &raw, &mut session) };
        // A host that already started the in-process engine keeps its session.
        if transport == MBR_TRANSPORT_IN_PROCESS
            && ResultCode::from_raw(code) == ResultCode::AlreadyInitialized
        {
            return Ok(SessionId(session));
        }
        check(CALL, code)?;
        Ok(SessionId(session))
    }

    fn cleanup(&self, session: SessionId) -> EngineResult<()> {
        let function = entry("cleanup", self.vtable.cleanup)?;
        check("cleanup", unsafe { function(self.user_data(), session.0) })
    }

    fn load_asset_library(&self, session: SessionId, path: &str) -> EngineResult<LibraryId> {
        const CALL: &str = "load_asset_library";
        let function = entry(CALL, self.vtable.load_asset_library)?;
        let path = name_to_c(CALL, path)?;
        let mut library = -1;
        check(CALL, unsafe {
            function(self.user_data(), session.0, path.as_ptr(), &mut library)
        })?;
        Ok(LibraryId(library))
    }

    fn available_asset_count(&self, session: SessionId, library: LibraryId) -> EngineResult<usize> {
        const CALL: &str = "available_asset_count";
        let function = entry(CALL, self.vtable.available_asset_count)?;
        let mut count = 0;
        check(CALL, unsafe {
            function(self.user_data(), session.0, library.0, &mut count)
        })?;
        count_from_raw(CALL, count)
    }

    fn available_assets(
        &self,
        session: SessionId,
        library: LibraryId,
        count: usize,
    ) -> EngineResult<Vec<StringHandle>> {
        const CALL: &str = "available_assets";
        let function = entry(CALL, self.vtable.available_assets)?;
        let mut handles = vec![0i32; count];
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                library.0,
                handles.as_mut_ptr(),
                count_to_raw(CALL, count)?,
            )
        })?;
        Ok(handles.into_iter().map(StringHandle).collect())
    }

    fn string(&self, session: SessionId, handle: StringHandle) -> EngineResult<String> {
        const CALL: &str = "string";
        let length = entry(CALL, self.vtable.string_length)?;
        let function = entry(CALL, self.vtable.string)?;
        let mut len = 0;
        check(CALL, unsafe {
            length(self.user_data(), session.0, handle.0, &mut len)
        })?;
        let len = count_from_raw(CALL, len)?;
        if len == 0 {
            return Ok(String::new());
        }
        let mut buf = vec![0u8; len];
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                handle.0,
                buf.as_mut_ptr().cast::<c_char>(),
                count_to_raw(CALL, len)?,
            )
        })?;
        let text = CStr::from_bytes_until_nul(&buf)
            .map(|text| text.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&buf).into_owned());
        Ok(text)
    }

    fn create_node(
        &self,
        session: SessionId,
        parent: Option<NodeId>,
        operator_name: &str,
        cook_on_creation: bool,
    ) -> EngineResult<NodeId> {
        const CALL: &str = "create_node";
        let function = entry(CALL, self.vtable.create_node)?;
        let name = name_to_c(CALL, operator_name)?;
        let mut node = -1;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                parent.map_or(-1, |parent| parent.0),
                name.as_ptr(),
                u8::from(cook_on_creation),
                &mut node,
            )
        })?;
        Ok(NodeId(node))
    }

    fn create_input_node(&self, session: SessionId, name: Option<&str>) -> EngineResult<NodeId> {
        const CALL: &str = "create_input_node";
        let function = entry(CALL, self.vtable.create_input_node)?;
        let name = name.map(|name| name_to_c(CALL, name)).transpose()?;
        let mut node = -1;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                name.as_ref().map_or(ptr::null(), |name| name.as_ptr()),
                &mut node,
            )
        })?;
        Ok(NodeId(node))
    }

    fn delete_node(&self, session: SessionId, node: NodeId) -> EngineResult<()> {
        let function = entry("delete_node", self.vtable.delete_node)?;
        check("delete_node", unsafe {
            function(self.user_data(), session.0, node.0)
        })
    }

    fn node_info(&self, session: SessionId, node: NodeId) -> EngineResult<NodeInfo> {
        const CALL: &str = "node_info";
        let function = entry(CALL, self.vtable.node_info)?;
        let mut raw = mbr_node_info::default();
        check(CALL, unsafe {
            function(self.user_data(), session.0, node.0, &mut raw)
        })?;
        node_info_from_raw(CALL, raw)
    }

    fn connect_node_input(
        &self,
        session: SessionId,
        node: NodeId,
        input_index: usize,
        upstream: NodeId,
        output_index: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "connect_node_input";
        let function = entry(CALL, self.vtable.connect_node_input)?;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                count_to_raw(CALL, input_index)?,
                upstream.0,
                count_to_raw(CALL, output_index)?,
            )
        })
    }

    fn display_geo_info(&self, session: SessionId, node: NodeId) -> EngineResult<GeoInfo> {
        const CALL: &str = "display_geo_info";
        let function = entry(CALL, self.vtable.display_geo_info)?;
        let mut raw = mbr_geo_info::default();
        check(CALL, unsafe {
            function(self.user_data(), session.0, node.0, &mut raw)
        })?;
        geo_info_from_raw(CALL, raw)
    }

    fn parameters(
        &self,
        session: SessionId,
        node: NodeId,
        start: usize,
        count: usize,
    ) -> EngineResult<Vec<ParmInfo>> {
        const CALL: &str = "parameters";
        let function = entry(CALL, self.vtable.parameters)?;
        let mut raw = vec![mbr_parm_info::default(); count];
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                raw.as_mut_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, count)?,
            )
        })?;
        raw.into_iter()
            .map(|parm| parm_info_from_raw(CALL, parm))
            .collect()
    }

    fn parm_float_values(
        &self,
        session: SessionId,
        node: NodeId,
        out: &mut [f32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "parm_float_values";
        let function = entry(CALL, self.vtable.parm_float_values)?;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                out.as_mut_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, out.len())?,
            )
        })
    }

    fn parm_int_values(
        &self,
        session: SessionId,
        node: NodeId,
        out: &mut [i32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "parm_int_values";
        let function = entry(CALL, self.vtable.parm_int_values)?;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                out.as_mut_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, out.len())?,
            )
        })
    }

    fn set_parm_float_values(
        &self,
        session: SessionId,
        node: NodeId,
        values: &[f32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "set_parm_float_values";
        let function = entry(CALL, self.vtable.set_parm_float_values)?;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                values.as_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, values.len())?,
            )
        })
    }

    fn set_parm_int_values(
        &self,
        session: SessionId,
        node: NodeId,
        values: &[i32],
        start: usize,
    ) -> EngineResult<()> {
        const CALL: &str = "set_parm_int_values";
        let function = entry(CALL, self.vtable.set_parm_int_values)?;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                values.as_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, values.len())?,
            )
        })
    }

    fn cook_node(&self, session: SessionId, node: NodeId) -> EngineResult<()> {
        let function = entry("cook_node", self.vtable.cook_node)?;
        check("cook_node", unsafe {
            function(self.user_data(), session.0, node.0)
        })
    }

    fn cook_state(&self, session: SessionId) -> EngineResult<i32> {
        let function = entry("cook_state", self.vtable.cook_state)?;
        let mut state = 0;
        check("cook_state", unsafe {
            function(self.user_data(), session.0, &mut state)
        })?;
        Ok(state)
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
        let function = entry(CALL, self.vtable.compose_child_node_list)?;
        let mut count = 0;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                parent.0,
                node_type.raw(),
                flags.0,
                u8::from(recursive),
                &mut count,
            )
        })?;
        count_from_raw(CALL, count)
    }

    fn composed_child_node_list(
        &self,
        session: SessionId,
        parent: NodeId,
        count: usize,
    ) -> EngineResult<Vec<NodeId>> {
        const CALL: &str = "composed_child_node_list";
        let function = entry(CALL, self.vtable.composed_child_node_list)?;
        let mut children = vec![-1i32; count];
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                parent.0,
                children.as_mut_ptr(),
                count_to_raw(CALL, count)?,
            )
        })?;
        Ok(children.into_iter().map(NodeId).collect())
    }

    fn geo_info(&self, session: SessionId, node: NodeId) -> EngineResult<GeoInfo> {
        const CALL: &str = "geo_info";
        let function = entry(CALL, self.vtable.geo_info)?;
        let mut raw = mbr_geo_info::default();
        check(CALL, unsafe {
            function(self.user_data(), session.0, node.0, &mut raw)
        })?;
        geo_info_from_raw(CALL, raw)
    }

    fn part_info(&self, session: SessionId, node: NodeId, part: PartId) -> EngineResult<PartInfo> {
        const CALL: &str = "part_info";
        let function = entry(CALL, self.vtable.part_info)?;
        let mut raw = mbr_part_info::default();
        check(CALL, unsafe {
            function(self.user_data(), session.0, node.0, part.0, &mut raw)
        })?;
        part_info_from_raw(CALL, raw)
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
        let function = entry(CALL, self.vtable.attribute_info)?;
        let name = name_to_c(CALL, name)?;
        let mut raw = mbr_attribute_info {
            owner: owner.raw(),
            ..mbr_attribute_info::default()
        };
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                part.0,
                name.as_ptr(),
                owner.raw(),
                &mut raw,
            )
        })?;
        attribute_info_from_raw(CALL, raw)
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
        let function = entry(CALL, self.vtable.attribute_float_data)?;
        let name = name_to_c(CALL, name)?;
        let raw = attribute_info_to_raw(CALL, info)?;
        let tuples = out.len() / info.tuple_size.max(1);
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                part.0,
                name.as_ptr(),
                &raw,
                out.as_mut_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, tuples)?,
            )
        })
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
        let function = entry(CALL, self.vtable.vertex_list)?;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                part.0,
                out.as_mut_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, out.len())?,
            )
        })
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
        let function = entry(CALL, self.vtable.face_counts)?;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                part.0,
                out.as_mut_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, out.len())?,
            )
        })
    }

    fn set_part_info(
        &self,
        session: SessionId,
        node: NodeId,
        part: PartId,
        info: &PartInfo,
    ) -> EngineResult<()> {
        const CALL: &str = "set_part_info";
        let function = entry(CALL, self.vtable.set_part_info)?;
        let raw = part_info_to_raw(CALL, info)?;
        check(CALL, unsafe {
            function(self.user_data(), session.0, node.0, part.0, &raw)
        })
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
        let function = entry(CALL, self.vtable.add_attribute)?;
        let name = name_to_c(CALL, name)?;
        let raw = attribute_info_to_raw(CALL, info)?;
        check(CALL, unsafe {
            function(self.user_data(), session.0, node.0, part.0, name.as_ptr(), &raw)
        })
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
        let function = entry(CALL, self.vtable.set_attribute_float_data)?;
        let name = name_to_c(CALL, name)?;
        let raw = attribute_info_to_raw(CALL, info)?;
        let tuples = data.len() / info.tuple_size.max(1);
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                part.0,
                name.as_ptr(),
                &raw,
                data.as_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, tuples)?,
            )
        })
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
        let function = entry(CALL, self.vtable.set_vertex_list)?;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                part.0,
                data.as_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, data.len())?,
            )
        })
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
        let function = entry(CALL, self.vtable.set_face_counts)?;
        check(CALL, unsafe {
            function(
                self.user_data(),
                session.0,
                node.0,
                part.0,
                data.as_ptr(),
                count_to_raw(CALL, start)?,
                count_to_raw(CALL, data.len())?,
            )
        })
    }

    fn commit_geo(&self, session: SessionId, node: NodeId) -> EngineResult<()> {
        let function = entry("commit_geo", self.vtable.commit_geo)?;
        check("commit_geo", unsafe {
            function(self.user_data(), session.0, node.0)
        })
    }
}

#[repr(C)]
pub struct mbr_engine {
    engine: Arc<dyn Engine>,
}

#[repr(C)]
pub struct mbr_session_manager {
    manager: SessionManager,
}

#[repr(C)]
pub struct mbr_runtime {
    runtime: RuntimeContext,
}

/// Host attribute descriptor; `data` covers `count` elements of `stride` bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct mbr_attribute {
    pub attribute_type: i32,
    pub component_count: i32,
    pub stride: usize,
    pub data: *mut u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct mbr_geo_counts {
    pub points: usize,
    pub vertices: usize,
    pub faces: usize,
}

#[repr(C)]
pub struct mbr_error {
    kind: i32,
    message: *mut c_char,
    hint: *mut c_char,
    engine_code: i32,
    node: i32,
    has_engine_code: u8,
    has_node: u8,
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_engine_new(
    vtable: *const mbr_engine_vtable,
    out_engine: *mut *mut mbr_engine,
    out_err: *mut *mut mbr_error,
) -> i32 {
    if vtable.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("vtable is null"),
        );
    }
    let engine = VtableEngine::new(unsafe { *vtable });
    store(out_engine, "out_engine", mbr_engine { engine: Arc::new(engine) }, out_err)
}

/// Engine backed by in-memory JSON asset libraries, for host-side testing.
#[unsafe(no_mangle)]
pub extern "C" fn mbr_engine_new_memory(
    out_engine: *mut *mut mbr_engine,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
    store(out_engine, "out_engine", mbr_engine { engine }, out_err)
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_engine_free(engine: *mut mbr_engine) {
    if engine.is_null() {
        return;
    }
    unsafe {
        drop(Box::from_raw(engine));
    }
}

/// `options` may be null for the default named-pipe session.
#[unsafe(no_mangle)]
pub extern "C" fn mbr_session_manager_new(
    engine: *mut mbr_engine,
    options: *const mbr_session_options,
    out_manager: *mut *mut mbr_session_manager,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let engine = match borrow(engine, "engine", out_err) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    let options = if options.is_null() {
        SessionOptions::default()
    } else {
        match session_options_from_raw(unsafe { &*options }) {
            Ok(options) => options,
            Err(err) => return fail(out_err, err),
        }
    };
    let manager = SessionManager::new(Arc::clone(&engine.engine), options);
    store(out_manager, "out_manager", mbr_session_manager { manager }, out_err)
}

/// Runtimes created from this manager keep the session alive after it is freed.
#[unsafe(no_mangle)]
pub extern "C" fn mbr_session_manager_free(manager: *mut mbr_session_manager) {
    if manager.is_null() {
        return;
    }
    unsafe {
        drop(Box::from_raw(manager));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_session_manager_users(manager: *const mbr_session_manager) -> usize {
    if manager.is_null() {
        return 0;
    }
    unsafe { &*manager }.manager.users()
}

/// Acquires the shared session and, when `library_path` is non-null, loads it.
#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_new(
    manager: *mut mbr_session_manager,
    library_path: *const c_char,
    out_runtime: *mut *mut mbr_runtime,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let manager = match borrow(manager, "manager", out_err) {
        Ok(manager) => manager,
        Err(code) => return code,
    };
    let session = match manager.manager.acquire() {
        Ok(session) => session,
        Err(err) => return fail(out_err, err),
    };
    let mut runtime = RuntimeContext::new(session, RuntimeConfig::default());
    if !library_path.is_null() {
        let result = parse_str(library_path, "library_path")
            .and_then(|path| runtime.set_library(path));
        if let Err(err) = result {
            return fail(out_err, err);
        }
    }
    store(out_runtime, "out_runtime", mbr_runtime { runtime }, out_err)
}

/// Destroys the bound node, then releases this runtime's session reference.
#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_free(runtime: *mut mbr_runtime) {
    if runtime.is_null() {
        return;
    }
    let mut runtime = unsafe { Box::from_raw(runtime) };
    if runtime.runtime.binding().is_some() {
        let _ = runtime.runtime.destroy_node();
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_set_library(
    runtime: *mut mbr_runtime,
    library_path: *const c_char,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    let path = if library_path.is_null() {
        Ok("")
    } else {
        parse_str(library_path, "library_path")
    };
    finish(
        out_err,
        path.and_then(|path| runtime.runtime.set_library(path)),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_asset_count(runtime: *const mbr_runtime) -> usize {
    if runtime.is_null() {
        return 0;
    }
    unsafe { &*runtime }.runtime.asset_count()
}

/// On success `*out_name` holds a string the caller frees with `mbr_string_free`.
#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_asset_name(
    runtime: *mut mbr_runtime,
    index: usize,
    out_name: *mut *mut c_char,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    match runtime.runtime.asset_name(index) {
        Ok(name) => store_string(out_name, "out_name", &name, out_err),
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_select_asset(
    runtime: *mut mbr_runtime,
    index: usize,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    finish(out_err, runtime.runtime.select_asset(index))
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_create_node(
    runtime: *mut mbr_runtime,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    finish(out_err, runtime.runtime.create_node().map(|_| ()))
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_destroy_node(
    runtime: *mut mbr_runtime,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    finish(out_err, runtime.runtime.destroy_node())
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_fetch_parameters(
    runtime: *mut mbr_runtime,
    out_count: *mut usize,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    match runtime.runtime.fetch_parameters() {
        Ok(count) => store_value(out_count, "out_count", count, out_err),
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_parameter_name(
    runtime: *mut mbr_runtime,
    index: usize,
    out_name: *mut *mut c_char,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    match runtime.runtime.parameter_name(index) {
        Ok(name) => store_string(out_name, "out_name", &name, out_err),
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_set_float_parm(
    runtime: *mut mbr_runtime,
    index: usize,
    values: *const f32,
    len: usize,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    finish(
        out_err,
        parse_slice(values, len, "values")
            .and_then(|values| runtime.runtime.set_float_parm(index, values)),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_set_int_parm(
    runtime: *mut mbr_runtime,
    index: usize,
    values: *const i32,
    len: usize,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    finish(
        out_err,
        parse_slice(values, len, "values")
            .and_then(|values| runtime.runtime.set_int_parm(index, values)),
    )
}

/// `*out_ready` is 1 when output geometry may be read; the raw cook state goes to
/// `*out_state` when it is non-null.
#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_cook(
    runtime: *mut mbr_runtime,
    out_ready: *mut u8,
    out_state: *mut i32,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    let outcome = match runtime.runtime.cook() {
        Ok(outcome) => outcome,
        Err(err) => return fail(out_err, err),
    };
    if !out_state.is_null() {
        unsafe {
            *out_state = outcome.state.raw();
        }
    }
    store_value(out_ready, "out_ready", u8::from(outcome.is_ready()), out_err)
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_fetch_sub_outputs(
    runtime: *mut mbr_runtime,
    out_count: *mut usize,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    match runtime.runtime.fetch_sub_outputs() {
        Ok(sops) => {
            let count = sops.len();
            store_value(out_count, "out_count", count, out_err)
        }
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_consolidate_geo_counts(
    runtime: *mut mbr_runtime,
    out_counts: *mut mbr_geo_counts,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    match runtime.runtime.consolidate_counts() {
        Ok(counts) => store_value(out_counts, "out_counts", counts_to_raw(counts), out_err),
        Err(err) => fail(out_err, err),
    }
}

/// Writes the consolidated mesh into host buffers sized by `counts`.
#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_fill_mesh(
    runtime: *mut mbr_runtime,
    points: mbr_attribute,
    vertices: mbr_attribute,
    faces: mbr_attribute,
    counts: mbr_geo_counts,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    let buffers = attribute_mut_from_raw(&points, counts.points, "points").and_then(|points| {
        Ok(MeshBuffers {
            points,
            vertices: attribute_mut_from_raw(&vertices, counts.vertices, "vertices")?,
            faces: attribute_mut_from_raw(&faces, counts.faces, "faces")?,
        })
    });
    let mut buffers = match buffers {
        Ok(buffers) => buffers,
        Err(err) => return fail(out_err, err),
    };
    finish(
        out_err,
        runtime
            .runtime
            .fill_mesh(&mut buffers, counts_from_raw(counts))
            .map(|_| ()),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_has_vertex_attribute(
    runtime: *const mbr_runtime,
    name: *const c_char,
) -> u8 {
    if runtime.is_null() {
        return 0;
    }
    match parse_str(name, "name") {
        Ok(name) => u8::from(unsafe { &*runtime }.runtime.has_vertex_attribute(name)),
        Err(_) => 0,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_fill_vertex_attribute(
    runtime: *mut mbr_runtime,
    name: *const c_char,
    attribute: mbr_attribute,
    vertex_count: usize,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    let result = parse_str(name, "name").and_then(|name| {
        let mut attribute = attribute_mut_from_raw(&attribute, vertex_count, "attribute")?;
        runtime
            .runtime
            .fill_vertex_attribute(name, &mut attribute, vertex_count)
    });
    finish(out_err, result.map(|_| ()))
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_feed_input_data(
    runtime: *mut mbr_runtime,
    points: mbr_attribute,
    vertices: mbr_attribute,
    faces: mbr_attribute,
    counts: mbr_geo_counts,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    let input = attribute_from_raw(&points, counts.points, "points").and_then(|points| {
        Ok(MeshInput {
            points,
            vertices: attribute_from_raw(&vertices, counts.vertices, "vertices")?,
            faces: attribute_from_raw(&faces, counts.faces, "faces")?,
        })
    });
    finish(
        out_err,
        input.and_then(|input| {
            runtime
                .runtime
                .feed_input_data(&input, counts_from_raw(counts))
        }),
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_feed_vertex_attribute(
    runtime: *mut mbr_runtime,
    name: *const c_char,
    attribute: mbr_attribute,
    vertex_count: usize,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    let result = parse_str(name, "name").and_then(|name| {
        let attribute = attribute_from_raw(&attribute, vertex_count, "attribute")?;
        runtime
            .runtime
            .feed_vertex_attribute(name, &attribute, vertex_count)
    });
    finish(out_err, result)
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_commit_geo(
    runtime: *mut mbr_runtime,
    out_err: *mut *mut mbr_error,
) -> i32 {
    let runtime = match borrow(runtime, "runtime", out_err) {
        Ok(runtime) => runtime,
        Err(code) => return code,
    };
    finish(out_err, runtime.runtime.commit_geo())
}

/// Last recorded error text, or null. Free with `mbr_string_free`.
#[unsafe(no_mangle)]
pub extern "C" fn mbr_runtime_cook_error(runtime: *const mbr_runtime) -> *mut c_char {
    if runtime.is_null() {
        return ptr::null_mut();
    }
    match unsafe { &*runtime }.runtime.cook_error() {
        Some(message) => to_c_string(&message),
        None => ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_string_free(text: *mut c_char) {
    if text.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(text));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mbr_error_free(err: *mut mbr_error) {
    if err.is_null() {
        return;
    }
    unsafe {
        let err = Box::from_raw(err);
        if !err.message.is_null() {
            drop(CString::from_raw(err.message));
        }
        if !err.hint.is_null() {
            drop(CString::from_raw(err.hint));
        }
    }
}

/// Installs the stderr log subscriber once; the filter comes from `MESHBRIDGE_LOG`.
#[unsafe(no_mangle)]
pub extern "C" fn mbr_init_logging() {
    crate::logging::init(None);
}

fn borrow<'a, T>(handle: *mut T, what: &str, out_err: *mut *mut mbr_error) -> Result<&'a mut T, i32> {
    if handle.is_null() {
        return Err(fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message(format!("{what} is null")),
        ));
    }
    unsafe { Ok(&mut *handle) }
}

fn store<T>(out: *mut *mut T, what: &str, value: T, out_err: *mut *mut mbr_error) -> i32 {
    if out.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message(format!("{what} is null")),
        );
    }
    unsafe {
        *out = Box::into_raw(Box::new(value));
    }
    0
}

fn store_value<T>(out: *mut T, what: &str, value: T, out_err: *mut *mut mbr_error) -> i32 {
    if out.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message(format!("{what} is null")),
        );
    }
    unsafe {
        *out = value;
    }
    0
}

fn store_string(
    out: *mut *mut c_char,
    what: &str,
    value: &str,
    out_err: *mut *mut mbr_error,
) -> i32 {
    store_value(out, what, to_c_string(value), out_err)
}

fn finish(out_err: *mut *mut mbr_error, result: Result<(), Error>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => fail(out_err, err),
    }
}

fn parse_str<'a>(input: *const c_char, what: &str) -> Result<&'a str, Error> {
    if input.is_null() {
        return Err(Error::new(ErrorKind::Usage).with_message(format!("{what} is null")));
    }
    unsafe { CStr::from_ptr(input) }
        .to_str()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message(format!("{what} is not valid UTF-8")))
}

fn parse_slice<'a, T>(data: *const T, len: usize, what: &str) -> Result<&'a [T], Error> {
    if len == 0 {
        return Ok(&[]);
    }
    if data.is_null() {
        return Err(Error::new(ErrorKind::Usage).with_message(format!("{what} is null")));
    }
    Ok(unsafe { slice::from_raw_parts(data, len) })
}

fn session_options_from_raw(raw: &mbr_session_options) -> Result<SessionOptions, Error> {
    let transport = match raw.transport {
        MBR_TRANSPORT_IN_PROCESS => Transport::InProcess,
        MBR_TRANSPORT_NAMED_PIPE => Transport::NamedPipe {
            pipe_name: if raw.pipe_name.is_null() {
                DEFAULT_PIPE_NAME.to_string()
            } else {
                parse_str(raw.pipe_name, "pipe_name")?.to_string()
            },
            timeout_ms: if raw.timeout_ms > 0.0 {
                raw.timeout_ms
            } else {
                DEFAULT_PIPE_TIMEOUT_MS
            },
            auto_close: raw.auto_close != 0,
        },
        other => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown transport {other}")));
        }
    };
    let environment_files = if raw.environment_files.is_null() {
        String::new()
    } else {
        parse_str(raw.environment_files, "environment_files")?.to_string()
    };
    Ok(SessionOptions {
        transport,
        use_cooking_thread: raw.use_cooking_thread != 0,
        cooking_thread_stack_size: raw.cooking_thread_stack_size,
        environment_files,
    })
}

fn counts_from_raw(raw: mbr_geo_counts) -> GeoCounts {
    GeoCounts {
        points: raw.points,
        vertices: raw.vertices,
        faces: raw.faces,
    }
}

fn counts_to_raw(counts: GeoCounts) -> mbr_geo_counts {
    mbr_geo_counts {
        points: counts.points,
        vertices: counts.vertices,
        faces: counts.faces,
    }
}

/// Byte span of `count` elements; the last element only needs its packed bytes.
fn span(ty: AttributeType, components: usize, stride: usize, count: usize) -> Result<usize, Error> {
    if count == 0 {
        return Ok(0);
    }
    let packing = ty.byte_size() * components;
    stride
        .checked_mul(count - 1)
        .and_then(|bytes| bytes.checked_add(packing))
        .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("attribute span overflows"))
}

fn describe_raw(raw: &mbr_attribute, what: &str) -> Result<(AttributeType, usize), Error> {
    let ty = AttributeType::from_raw(raw.attribute_type).ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{what}: unknown attribute type {}", raw.attribute_type))
    })?;
    let components = usize::try_from(raw.component_count).map_err(|_| {
        Error::new(ErrorKind::Usage).with_message(format!("{what}: negative component count"))
    })?;
    Ok((ty, components))
}

fn attribute_from_raw<'a>(
    raw: &mbr_attribute,
    count: usize,
    what: &str,
) -> Result<Attribute<'a>, Error> {
    let (ty, components) = describe_raw(raw, what)?;
    let len = span(ty, components, raw.stride, count)?;
    let data = parse_slice(raw.data.cast_const(), len, what)?;
    Attribute::new(ty, components, raw.stride, data)
}

fn attribute_mut_from_raw<'a>(
    raw: &mbr_attribute,
    count: usize,
    what: &str,
) -> Result<AttributeMut<'a>, Error> {
    let (ty, components) = describe_raw(raw, what)?;
    let len = span(ty, components, raw.stride, count)?;
    let data: &'a mut [u8] = if len == 0 {
        &mut []
    } else if raw.data.is_null() {
        return Err(Error::new(ErrorKind::Usage).with_message(format!("{what} is null")));
    } else {
        unsafe { slice::from_raw_parts_mut(raw.data, len) }
    };
    AttributeMut::new(ty, components, raw.stride, data)
}

fn fail(out_err: *mut *mut mbr_error, err: Error) -> i32 {
    if out_err.is_null() {
        return -1;
    }
    let error = Box::new(mbr_error {
        kind: to_exit_code(err.kind()),
        message: to_c_string(&err.to_string()),
        hint: err.hint().map(to_c_string).unwrap_or(ptr::null_mut()),
        engine_code: err.engine_code().map_or(0, ResultCode::raw),
        node: err.node().map_or(-1, |node| node.0),
        has_engine_code: u8::from(err.engine_code().is_some()),
        has_node: u8::from(err.node().is_some()),
    });
    unsafe {
        *out_err = Box::into_raw(error);
    }
    -1
}

fn to_c_string(input: &str) -> *mut c_char {
    CString::new(input)
        .map(|s| s.into_raw())
        .unwrap_or(ptr::null_mut())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBRARY: &str = r#"{"assets": [{"name": "Sop/echo", "passthrough_input": true}]}"#;

    fn memory_runtime() -> (*mut mbr_engine, *mut mbr_session_manager, *mut mbr_runtime) {
        let memory = Arc::new(MemoryEngine::new());
        memory.install_library("echo.json", LIBRARY);
        let engine = Box::into_raw(Box::new(mbr_engine { engine: memory }));
        let mut err = ptr::null_mut();

        let options = mbr_session_options {
            transport: MBR_TRANSPORT_IN_PROCESS,
            pipe_name: ptr::null(),
            timeout_ms: 0.0,
            auto_close: 0,
            use_cooking_thread: 0,
            cooking_thread_stack_size: -1,
            environment_files: ptr::null(),
        };
        let mut manager = ptr::null_mut();
        assert_eq!(mbr_session_manager_new(engine, &options, &mut manager, &mut err), 0);

        let path = CString::new("echo.json").expect("path");
        let mut runtime = ptr::null_mut();
        assert_eq!(mbr_runtime_new(manager, path.as_ptr(), &mut runtime, &mut err), 0);
        (engine, manager, runtime)
    }

    fn packed<T>(ty: AttributeType, components: i32, data: &mut [T]) -> mbr_attribute {
        mbr_attribute {
            attribute_type: ty.raw(),
            component_count: components,
            stride: std::mem::size_of::<T>() * components as usize,
            data: data.as_mut_ptr().cast::<u8>(),
        }
    }

    #[test]
    fn null_handles_report_usage_errors() {
        let mut err = ptr::null_mut();
        assert_eq!(mbr_runtime_create_node(ptr::null_mut(), &mut err), -1);
        let error = unsafe { &*err };
        assert_eq!(error.kind, to_exit_code(ErrorKind::Usage));
        let message = unsafe { CStr::from_ptr(error.message) }.to_str().expect("utf8");
        assert!(message.contains("runtime is null"));
        mbr_error_free(err);

        let mut engine = ptr::null_mut();
        let mut err = ptr::null_mut();
        assert_eq!(mbr_engine_new_memory(&mut engine, &mut err), 0);
        let mut manager: *mut mbr_session_manager = ptr::null_mut();
        assert_eq!(mbr_session_manager_new(engine, ptr::null(), ptr::null_mut(), &mut err), -1);
        assert!(manager.is_null());
        assert_eq!(mbr_session_manager_new(engine, ptr::null(), &mut manager, &mut err), 0);
        assert_eq!(mbr_session_manager_users(manager), 0);
        mbr_error_free(err);
        mbr_session_manager_free(manager);
        mbr_engine_free(engine);
    }

    #[test]
    fn host_round_trip_through_c_surface() {
        let (engine, manager, runtime) = memory_runtime();
        let mut err = ptr::null_mut();
        assert_eq!(mbr_runtime_asset_count(runtime), 1);
        assert_eq!(mbr_runtime_select_asset(runtime, 0, &mut err), 0);
        assert_eq!(mbr_runtime_create_node(runtime, &mut err), 0);

        let mut points = [0.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0];
        let mut vertices = [0i32, 1, 2, 3];
        let mut faces = [4i32];
        let counts = mbr_geo_counts {
            points: 4,
            vertices: 4,
            faces: 1,
        };
        assert_eq!(
            mbr_runtime_feed_input_data(
                runtime,
                packed(AttributeType::Float, 3, &mut points),
                packed(AttributeType::Int, 1, &mut vertices),
                packed(AttributeType::Int, 1, &mut faces),
                counts,
                &mut err,
            ),
            0
        );

        let mut ready = 0u8;
        assert_eq!(mbr_runtime_cook(runtime, &mut ready, ptr::null_mut(), &mut err), 0);
        assert_eq!(ready, 1);
        let mut sops = 0usize;
        assert_eq!(mbr_runtime_fetch_sub_outputs(runtime, &mut sops, &mut err), 0);
        assert_eq!(sops, 1);
        let mut out_counts = mbr_geo_counts::default();
        assert_eq!(
            mbr_runtime_consolidate_geo_counts(runtime, &mut out_counts, &mut err),
            0
        );
        assert_eq!((out_counts.points, out_counts.vertices, out_counts.faces), (4, 4, 1));

        let mut out_points = [0.0f32; 12];
        let mut out_vertices = [0i32; 4];
        let mut out_faces = [0i32; 1];
        assert_eq!(
            mbr_runtime_fill_mesh(
                runtime,
                packed(AttributeType::Float, 3, &mut out_points),
                packed(AttributeType::Int, 1, &mut out_vertices),
                packed(AttributeType::Int, 1, &mut out_faces),
                out_counts,
                &mut err,
            ),
            0
        );
        assert_eq!(out_points, points);
        assert_eq!(out_vertices, [0, 1, 2, 3]);
        assert_eq!(out_faces, [4]);
        assert!(err.is_null());

        assert_eq!(mbr_session_manager_users(manager), 1);
        mbr_runtime_free(runtime);
        assert_eq!(mbr_session_manager_users(manager), 0);
        mbr_session_manager_free(manager);
        mbr_engine_free(engine);
    }

    #[test]
    fn missing_vtable_entries_fail_as_not_initialized() {
        let engine = VtableEngine::new(empty_vtable());
        let err = engine
            .create_session(&SessionOptions::in_process())
            .expect_err("no entry");
        assert_eq!(err.code, ResultCode::NotInitialized);
        assert_eq!(err.call, "create_session");
    }

    unsafe extern "C" fn fake_create_session(
        _user: Ud,
        options: *const mbr_session_options,
        out: *mut i64,
    ) -> i32 {
        let options = unsafe { &*options };
        if options.transport != MBR_TRANSPORT_NAMED_PIPE {
            return ResultCode::InvalidArgument.raw();
        }
        unsafe { *out = 7 };
        0
    }

    unsafe extern "C" fn fake_release(user: Ud) {
        let released = unsafe { &*user.cast::<std::sync::atomic::AtomicBool>() };
        released.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[test]
    fn vtable_passes_options_and_releases_user_data() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let released = Box::new(AtomicBool::new(false));
        let mut err = ptr::null_mut();
        let mut engine = ptr::null_mut();
        let vtable = mbr_engine_vtable {
            user_data: (&*released as *const AtomicBool).cast_mut().cast::<c_void>(),
            release: Some(fake_release),
            create_session: Some(fake_create_session),
            ..empty_vtable()
        };
        assert_eq!(mbr_engine_new(&vtable, &mut engine, &mut err), 0);
        let handle = unsafe { &*engine };
        let session = handle
            .engine
            .create_session(&SessionOptions::default())
            .expect("session");
        assert_eq!(session, SessionId(7));
        let failed = handle
            .engine
            .create_session(&SessionOptions::in_process())
            .expect_err("in-process rejected");
        assert_eq!(failed.code, ResultCode::InvalidArgument);
        mbr_engine_free(engine);
        assert!(released.load(Ordering::SeqCst));
    }

    unsafe extern "C" fn started_create_session(
        _user: Ud,
        _options: *const mbr_session_options,
        out: *mut i64,
    ) -> i32 {
        unsafe { *out = 3 };
        ResultCode::AlreadyInitialized.raw()
    }

    #[test]
    fn already_initialized_in_process_engine_is_reused() {
        let engine = VtableEngine::new(mbr_engine_vtable {
            create_session: Some(started_create_session),
            ..empty_vtable()
        });
        let session = engine
            .create_session(&SessionOptions::in_process())
            .expect("reused");
        assert_eq!(session, SessionId(3));
        let err = engine
            .create_session(&SessionOptions::default())
            .expect_err("pipe session");
        assert_eq!(err.code, ResultCode::AlreadyInitialized);
    }

    fn empty_vtable() -> mbr_engine_vtable {
        mbr_engine_vtable {
            user_data: ptr::null_mut(),
            release: None,
            create_session: None,
            cleanup: None,
            load_asset_library: None,
            available_asset_count: None,
            available_assets: None,
            string_length: None,
            string: None,
            create_node: None,
            create_input_node: None,
            delete_node: None,
            node_info: None,
            connect_node_input: None,
            display_geo_info: None,
            parameters: None,
            parm_float_values: None,
            parm_int_values: None,
            set_parm_float_values: None,
            set_parm_int_values: None,
            cook_node: None,
            cook_state: None,
            compose_child_node_list: None,
            composed_child_node_list: None,
            geo_info: None,
            part_info: None,
            attribute_info: None,
            attribute_float_data: None,
            vertex_list: None,
            face_counts: None,
            set_part_info: None,
            add_attribute: None,
            set_attribute_float_data: None,
            set_vertex_list: None,
            set_face_counts: None,
            commit_geo: None,
        }
    }
}
