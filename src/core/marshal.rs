//! Purpose: Move mesh data between engine parts and host attribute buffers.
//! Exports: `Marshaller`, `MeshPart`, `GeoCounts`, `MeshBuffers`, `MeshInput`.
//! Role: Geometry Output Consolidator walk plus the fill (engine to host) and feed (host to
//!       engine) directions of the Geometry Marshaller.
//! Invariants: Parts are visited in sub-output order, then part order; the running bases
//!             follow that order, so vertex indices in part K are offset by the point total
//!             of every earlier part.
//! Invariants: Only mesh parts are counted or visited.
//! Invariants: Per-part engine failures are soft: logged, collected, and skipped.
//! Invariants: Layout and capacity violations are `ErrorKind::Contract` and stop the call
//!             before any host memory is written.
use std::borrow::Cow;

use tracing::{debug, warn};

use crate::core::attribute::{Attribute, AttributeMut, AttributeType};
use crate::core::engine::{
    ATTRIB_POSITION, AttributeInfo, AttributeOwner, AttributeRole, Engine, EngineError, NodeId,
    PartId, PartInfo, PartType, SessionId, StorageType,
};
use crate::core::error::{Error, ErrorKind};

/// Consolidated element totals across every mesh part.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GeoCounts {
    pub points: usize,
    pub vertices: usize,
    pub faces: usize,
}

impl GeoCounts {
    fn advance(&mut self, info: &PartInfo) {
        self.points += info.point_count;
        self.vertices += info.vertex_count;
        self.faces += info.face_count;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MeshPart {
    pub node: NodeId,
    pub part: PartId,
    pub info: PartInfo,
}

/// Destination buffers for the consolidated output mesh.
#[derive(Debug)]
pub struct MeshBuffers<'a> {
    pub points: AttributeMut<'a>,
    pub vertices: AttributeMut<'a>,
    pub faces: AttributeMut<'a>,
}

/// Host mesh fed into an editable input node.
#[derive(Clone, Copy, Debug)]
pub struct MeshInput<'a> {
    pub points: Attribute<'a>,
    pub vertices: Attribute<'a>,
    pub faces: Attribute<'a>,
}

/// Engine calls for one session, shaped for mesh transfer.
pub struct Marshaller<'e> {
    engine: &'e dyn Engine,
    session: SessionId,
}

impl<'e> Marshaller<'e> {
    pub fn new(engine: &'e dyn Engine, session: SessionId) -> Self {
        Self { engine, session }
    }

    fn soft(&self, err: EngineError, node: NodeId, part: Option<PartId>) -> Error {
        warn!(sop = node.0, part = part.map(|p| p.0), %err, "skipping geometry item");
        Error::engine(ErrorKind::Geometry, err).with_node(node)
    }

    /// Lists the mesh parts of `sops` in processing order.
    ///
    /// With `cook_empty`, a sub-output reporting zero parts is cooked once and queried again.
    pub fn mesh_parts(
        &self,
        sops: &[NodeId],
        cook_empty: bool,
        skipped: &mut Vec<Error>,
    ) -> Vec<MeshPart> {
        let mut parts = Vec::new();
        for &node in sops {
            let mut geo = match self.engine.geo_info(self.session, node) {
                Ok(geo) => geo,
                Err(err) => {
                    skipped.push(self.soft(err, node, None));
                    continue;
                }
            };
            if geo.part_count == 0 && cook_empty {
                if let Err(err) = self.engine.cook_node(self.session, node) {
                    skipped.push(self.soft(err, node, None));
                }
                geo = match self.engine.geo_info(self.session, node) {
                    Ok(geo) => geo,
                    Err(err) => {
                        skipped.push(self.soft(err, node, None));
                        continue;
                    }
                };
            }
            debug!(sop = node.0, parts = geo.part_count, "walking sub-output");

            for index in 0..geo.part_count {
                let part = PartId(index as i32);
                match self.engine.part_info(self.session, node, part) {
                    Ok(info) if info.part_type == PartType::Mesh => {
                        debug!(
                            sop = node.0,
                            part = part.0,
                            points = info.point_count,
                            vertices = info.vertex_count,
                            faces = info.face_count,
                            "mesh part"
                        );
                        parts.push(MeshPart { node, part, info });
                    }
                    Ok(info) => {
                        debug!(sop = node.0, part = part.0, part_type = ?info.part_type, "ignoring non-mesh part");
                    }
                    Err(err) => skipped.push(self.soft(err, node, Some(part))),
                }
            }
        }
        parts
    }

    /// Sums point/vertex/face counts over every mesh part, cooking empty sub-outputs.
    pub fn consolidate(&self, sops: &[NodeId], skipped: &mut Vec<Error>) -> GeoCounts {
        let mut counts = GeoCounts::default();
        for part in self.mesh_parts(sops, true, skipped) {
            counts.advance(&part.info);
        }
        counts
    }

    /// Writes every mesh part into `target` and returns the totals written.
    ///
    /// `counts` is the capacity the host allocated, normally the consolidated totals.
    pub fn fill_mesh(
        &self,
        sops: &[NodeId],
        target: &mut MeshBuffers<'_>,
        counts: GeoCounts,
        skipped: &mut Vec<Error>,
    ) -> Result<GeoCounts, Error> {
        target
            .points
            .require("point", AttributeType::Float, Some(3), counts.points)?;
        target
            .vertices
            .require("vertex", AttributeType::Int, Some(1), counts.vertices)?;
        target
            .faces
            .require("face", AttributeType::Int, Some(1), counts.faces)?;

        let parts = self.mesh_parts(sops, false, skipped);
        let mut planned = GeoCounts::default();
        for part in &parts {
            planned.advance(&part.info);
        }
        if planned.points > counts.points
            || planned.vertices > counts.vertices
            || planned.faces > counts.faces
        {
            return Err(Error::new(ErrorKind::Contract).with_message(format!(
                "engine geometry ({} points, {} vertices, {} faces) exceeds the host allocation \
                 ({} points, {} vertices, {} faces)",
                planned.points,
                planned.vertices,
                planned.faces,
                counts.points,
                counts.vertices,
                counts.faces
            )));
        }

        let mut base = GeoCounts::default();
        for part in &parts {
            if let Err(err) = self.fill_part(part, base, target) {
                if err.kind() == ErrorKind::Contract {
                    return Err(err);
                }
                skipped.push(err);
            }
            base.advance(&part.info);
        }
        Ok(base)
    }

    fn fill_part(
        &self,
        part: &MeshPart,
        base: GeoCounts,
        target: &mut MeshBuffers<'_>,
    ) -> Result<(), Error> {
        let MeshPart { node, part: id, info } = *part;
        let soft = |err: EngineError| self.soft(err, node, Some(id));

        if info.point_count > 0 {
            let position = self
                .engine
                .attribute_info(self.session, node, id, ATTRIB_POSITION, AttributeOwner::Point)
                .map_err(soft)?;
            if !position.exists || position.tuple_size != 3 {
                warn!(sop = node.0, part = id.0, "part has no usable position attribute");
                return Err(Error::new(ErrorKind::Geometry)
                    .with_message(format!("part {id} has no 3-component position attribute"))
                    .with_node(node));
            }
            let mut staged = target.points.stage::<f32>(base.points, info.point_count)?;
            self.engine
                .attribute_float_data(
                    self.session,
                    node,
                    id,
                    ATTRIB_POSITION,
                    &position,
                    staged.as_mut_slice(),
                    0,
                )
                .map_err(soft)?;
            staged.finish();
        }

        if info.vertex_count > 0 {
            let mut indices = vec![0i32; info.vertex_count];
            self.engine
                .vertex_list(self.session, node, id, &mut indices, 0)
                .map_err(soft)?;
            let offset = i32::try_from(base.points).map_err(|_| {
                Error::new(ErrorKind::Contract).with_message("point total exceeds i32 indices")
            })?;
            if let Some(bad) = indices
                .iter()
                .find(|value| !usize::try_from(**value).is_ok_and(|v| v < info.point_count))
            {
                warn!(sop = node.0, part = id.0, index = *bad, points = info.point_count, "vertex index out of range");
                return Err(Error::new(ErrorKind::Geometry)
                    .with_message(format!(
                        "part {id} references point {bad}, it has {} points",
                        info.point_count
                    ))
                    .with_node(node));
            }
            for (index, value) in indices.into_iter().enumerate() {
                let global = offset.checked_add(value).ok_or_else(|| {
                    Error::new(ErrorKind::Contract).with_message("point total exceeds i32 indices")
                })?;
                target.vertices.write_scalar::<i32>(base.vertices + index, global)?;
            }
        }

        if info.face_count > 0 {
            let mut staged = target.faces.stage::<i32>(base.faces, info.face_count)?;
            self.engine
                .face_counts(self.session, node, id, staged.as_mut_slice(), 0)
                .map_err(soft)?;
            staged.finish();
        }
        Ok(())
    }

    /// True when any mesh part of `sops` carries the named vertex attribute.
    pub fn has_vertex_attribute(&self, sops: &[NodeId], name: &str) -> bool {
        let mut skipped = Vec::new();
        self.mesh_parts(sops, false, &mut skipped)
            .into_iter()
            .any(|part| {
                self.engine
                    .attribute_info(self.session, part.node, part.part, name, AttributeOwner::Vertex)
                    .is_ok_and(|info| info.exists)
            })
    }

    /// Copies a named vertex attribute into `dest`. Parts without it leave their range as is.
    pub fn fill_vertex_attribute(
        &self,
        sops: &[NodeId],
        name: &str,
        dest: &mut AttributeMut<'_>,
        vertex_count: usize,
        skipped: &mut Vec<Error>,
    ) -> Result<(), Error> {
        if dest.attribute_type() == AttributeType::Int {
            return Err(Error::new(ErrorKind::Unsupported)
                .with_message(format!("integer vertex attribute `{name}` cannot be filled")));
        }
        dest.require(name, dest.attribute_type(), None, vertex_count)?;

        let mut base = 0usize;
        for part in self.mesh_parts(sops, false, skipped) {
            let count = part.info.vertex_count;
            if base + count > vertex_count {
                return Err(Error::new(ErrorKind::Contract).with_message(format!(
                    "vertex attribute `{name}` holds {vertex_count} elements, engine has more"
                )));
            }
            if let Err(err) = self.fill_vertex_part(&part, name, dest, base) {
                if err.kind() == ErrorKind::Contract {
                    return Err(err);
                }
                skipped.push(err);
            }
            base += count;
        }
        Ok(())
    }

    fn fill_vertex_part(
        &self,
        part: &MeshPart,
        name: &str,
        dest: &mut AttributeMut<'_>,
        base: usize,
    ) -> Result<(), Error> {
        let MeshPart { node, part: id, info } = *part;
        let soft = |err: EngineError| self.soft(err, node, Some(id));
        let attribute = self
            .engine
            .attribute_info(self.session, node, id, name, AttributeOwner::Vertex)
            .map_err(soft)?;
        if !attribute.exists || attribute.tuple_size == 0 || info.vertex_count == 0 {
            debug!(sop = node.0, part = id.0, name, "vertex attribute absent on part");
            return Ok(());
        }

        let components = dest.component_count();
        if dest.attribute_type() == AttributeType::Float && components == attribute.tuple_size {
            let mut staged = dest.stage::<f32>(base, info.vertex_count)?;
            self.engine
                .attribute_float_data(self.session, node, id, name, &attribute, staged.as_mut_slice(), 0)
                .map_err(soft)?;
            staged.finish();
            return Ok(());
        }

        let tuple = attribute.tuple_size;
        let mut values = vec![0f32; info.vertex_count * tuple];
        self.engine
            .attribute_float_data(self.session, node, id, name, &attribute, &mut values, 0)
            .map_err(soft)?;
        let common = components.min(tuple);
        let ty = dest.attribute_type();
        for (index, record) in values.chunks_exact(tuple).enumerate() {
            let slot = dest.element_mut(base + index)?;
            for (component, value) in record.iter().take(common).enumerate() {
                match ty {
                    AttributeType::Float => {
                        slot[component * 4..component * 4 + 4].copy_from_slice(&value.to_ne_bytes())
                    }
                    AttributeType::UByte => slot[component] = float_to_ubyte(*value),
                    AttributeType::Int => {}
                }
            }
        }
        Ok(())
    }

    /// Replaces part 0 of the editable node `input` with the host mesh and commits it.
    pub fn feed_mesh(&self, input: NodeId, mesh: &MeshInput<'_>, counts: GeoCounts) -> Result<(), Error> {
        mesh.points
            .require("point", AttributeType::Float, Some(3), counts.points)?;
        mesh.vertices
            .require("vertex", AttributeType::Int, Some(1), counts.vertices)?;
        mesh.faces
            .require("face", AttributeType::Int, Some(1), counts.faces)?;

        let part = PartId(0);
        let fatal = |err: EngineError| Error::engine(ErrorKind::Geometry, err).with_node(input);

        let info = PartInfo::mesh(counts.points, counts.vertices, counts.faces);
        self.engine
            .set_part_info(self.session, input, part, &info)
            .map_err(fatal)?;

        let position = AttributeInfo::float(
            AttributeOwner::Point,
            mesh.points.component_count(),
            counts.points,
            AttributeRole::Point,
        );
        self.engine
            .add_attribute(self.session, input, part, ATTRIB_POSITION, &position)
            .map_err(fatal)?;

        if counts.points > 0 {
            let points = mesh.points.contiguous::<f32>(counts.points)?;
            debug!(copied = matches!(points, Cow::Owned(_)), "feeding points");
            self.engine
                .set_attribute_float_data(self.session, input, part, ATTRIB_POSITION, &position, &points, 0)
                .map_err(fatal)?;
        }
        if counts.vertices > 0 {
            let vertices = mesh.vertices.contiguous::<i32>(counts.vertices)?;
            self.engine
                .set_vertex_list(self.session, input, part, &vertices, 0)
                .map_err(fatal)?;
        }
        if counts.faces > 0 {
            let faces = mesh.faces.contiguous::<i32>(counts.faces)?;
            self.engine
                .set_face_counts(self.session, input, part, &faces, 0)
                .map_err(fatal)?;
        }

        self.commit(input)
    }

    /// Adds a per-vertex float attribute to part 0 of `input`. Commit separately.
    pub fn feed_vertex_attribute(
        &self,
        input: NodeId,
        name: &str,
        source: &Attribute<'_>,
        vertex_count: usize,
    ) -> Result<(), Error> {
        if vertex_count == 0 {
            return Ok(());
        }
        source.require(name, source.attribute_type(), None, vertex_count)?;
        let values: Cow<'_, [f32]> = match source.attribute_type() {
            AttributeType::Float => source.contiguous::<f32>(vertex_count)?,
            AttributeType::UByte => {
                let bytes = source.contiguous::<u8>(vertex_count)?;
                Cow::Owned(bytes.iter().map(|byte| f32::from(*byte) / 255.0).collect())
            }
            AttributeType::Int => {
                return Err(Error::new(ErrorKind::Unsupported)
                    .with_message(format!("integer vertex attribute `{name}` cannot be fed")));
            }
        };

        let info = AttributeInfo {
            exists: true,
            owner: AttributeOwner::Vertex,
            storage: StorageType::Float,
            tuple_size: source.component_count(),
            count: vertex_count,
            role: role_for(name),
        };
        let fatal = |err: EngineError| Error::engine(ErrorKind::Geometry, err).with_node(input);
        let part = PartId(0);
        self.engine
            .add_attribute(self.session, input, part, name, &info)
            .map_err(fatal)?;
        self.engine
            .set_attribute_float_data(self.session, input, part, name, &info, &values, 0)
            .map_err(fatal)
    }

    pub fn commit(&self, input: NodeId) -> Result<(), Error> {
        self.engine
            .commit_geo(self.session, input)
            .map_err(|err| Error::engine(ErrorKind::Geometry, err).with_node(input))
    }
}

fn role_for(name: &str) -> AttributeRole {
    match name {
        "uv" => AttributeRole::TextureCoord,
        "Cd" => AttributeRole::Color,
        "N" => AttributeRole::Normal,
        _ => AttributeRole::None,
    }
}

fn float_to_ubyte(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}
