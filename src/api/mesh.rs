//! Purpose: Owned host-style mesh with strided attribute buffers and JSON I/O.
//! Exports: `MeshData`, `MeshBuffer`, `MeshLayout`, `MeshJson`.
//! Role: Stand-in for host-allocated meshes in the CLI, the effect pipeline and tests.
//! Invariants: Buffers are backed by `u32` words so float/int views stay 4-byte aligned.
//! Invariants: Interleaved buffers pad every record by one word, so stride > packing.
#![allow(clippy::result_large_err)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::attribute::{Attribute, AttributeMut, AttributeType};
use crate::core::error::{Error, ErrorKind};
use crate::core::marshal::{GeoCounts, MeshBuffers, MeshInput};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MeshLayout {
    #[default]
    Packed,
    Interleaved,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MeshBuffer {
    ty: AttributeType,
    components: usize,
    stride: usize,
    count: usize,
    words: Vec<u32>,
}

impl MeshBuffer {
    pub fn new(ty: AttributeType, components: usize, count: usize, layout: MeshLayout) -> Self {
        let packing = components * ty.byte_size();
        let stride = match layout {
            MeshLayout::Packed => packing,
            MeshLayout::Interleaved => packing.div_ceil(4) * 4 + 4,
        };
        let bytes = count * stride;
        Self {
            ty,
            components,
            stride,
            count,
            words: vec![0; bytes.div_ceil(4)],
        }
    }

    pub fn from_floats(values: &[f32], components: usize, layout: MeshLayout) -> Result<Self, Error> {
        let count = element_count(values.len(), components)?;
        let mut buffer = Self::new(AttributeType::Float, components, count, layout);
        let stride = buffer.stride;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut buffer.words);
        for (index, record) in values.chunks_exact(components).enumerate() {
            let start = index * stride;
            bytes[start..start + components * 4].copy_from_slice(bytemuck::cast_slice(record));
        }
        Ok(buffer)
    }

    pub fn from_ints(values: &[i32], layout: MeshLayout) -> Self {
        let mut buffer = Self::new(AttributeType::Int, 1, values.len(), layout);
        let stride = buffer.stride;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut buffer.words);
        for (index, value) in values.iter().enumerate() {
            let start = index * stride;
            bytes[start..start + 4].copy_from_slice(&value.to_ne_bytes());
        }
        buffer
    }

    pub fn from_bytes(values: &[u8], components: usize, layout: MeshLayout) -> Result<Self, Error> {
        let count = element_count(values.len(), components)?;
        let mut buffer = Self::new(AttributeType::UByte, components, count, layout);
        let stride = buffer.stride;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut buffer.words);
        for (index, record) in values.chunks_exact(components).enumerate() {
            let start = index * stride;
            bytes[start..start + components].copy_from_slice(record);
        }
        Ok(buffer)
    }

    pub fn attribute_type(&self) -> AttributeType {
        self.ty
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn attribute(&self) -> Result<Attribute<'_>, Error> {
        Attribute::new(self.ty, self.components, self.stride, self.bytes())
    }

    pub fn attribute_mut(&mut self) -> Result<AttributeMut<'_>, Error> {
        AttributeMut::new(
            self.ty,
            self.components,
            self.stride,
            bytemuck::cast_slice_mut(&mut self.words),
        )
    }

    /// Components of every element as `f32`, gathered in element order.
    pub fn to_floats(&self) -> Vec<f32> {
        let bytes = self.bytes();
        let mut out = Vec::with_capacity(self.count * self.components);
        for index in 0..self.count {
            let record = &bytes[index * self.stride..];
            for component in 0..self.components {
                let value = match self.ty {
                    AttributeType::Float => f32::from_ne_bytes(word_at(record, component)),
                    AttributeType::Int => i32::from_ne_bytes(word_at(record, component)) as f32,
                    AttributeType::UByte => f32::from(record[component]) / 255.0,
                };
                out.push(value);
            }
        }
        out
    }

    pub fn to_ints(&self) -> Vec<i32> {
        let bytes = self.bytes();
        (0..self.count)
            .map(|index| i32::from_ne_bytes(word_at(&bytes[index * self.stride..], 0)))
            .collect()
    }
}

fn word_at(record: &[u8], component: usize) -> [u8; 4] {
    let mut word = [0u8; 4];
    word.copy_from_slice(&record[component * 4..component * 4 + 4]);
    word
}

fn element_count(len: usize, components: usize) -> Result<usize, Error> {
    if components == 0 || len % components != 0 {
        return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
            "{len} values do not form whole {components}-component elements"
        )));
    }
    Ok(len / components)
}

/// A mesh laid out the way a host hands it to an effect.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshData {
    pub points: MeshBuffer,
    pub vertices: MeshBuffer,
    pub faces: MeshBuffer,
    /// Per-vertex attributes keyed by host name.
    pub attributes: BTreeMap<String, MeshBuffer>,
}

impl MeshData {
    /// Zeroed buffers sized for `counts`.
    pub fn allocate(counts: GeoCounts, layout: MeshLayout) -> Self {
        Self {
            points: MeshBuffer::new(AttributeType::Float, 3, counts.points, layout),
            vertices: MeshBuffer::new(AttributeType::Int, 1, counts.vertices, layout),
            faces: MeshBuffer::new(AttributeType::Int, 1, counts.faces, layout),
            attributes: BTreeMap::new(),
        }
    }

    pub fn counts(&self) -> GeoCounts {
        GeoCounts {
            points: self.points.len(),
            vertices: self.vertices.len(),
            faces: self.faces.len(),
        }
    }

    pub fn add_attribute(&mut self, name: impl Into<String>, buffer: MeshBuffer) {
        self.attributes.insert(name.into(), buffer);
    }

    pub fn as_input(&self) -> Result<MeshInput<'_>, Error> {
        Ok(MeshInput {
            points: self.points.attribute()?,
            vertices: self.vertices.attribute()?,
            faces: self.faces.attribute()?,
        })
    }

    pub fn as_buffers(&mut self) -> Result<MeshBuffers<'_>, Error> {
        Ok(MeshBuffers {
            points: self.points.attribute_mut()?,
            vertices: self.vertices.attribute_mut()?,
            faces: self.faces.attribute_mut()?,
        })
    }

    /// Checks that faces cover the vertex list and vertices address existing points.
    pub fn validate(&self) -> Result<(), Error> {
        let vertex_total: i64 = self.faces.to_ints().iter().map(|&n| i64::from(n)).sum();
        if vertex_total != self.vertices.len() as i64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "face counts sum to {vertex_total}, mesh has {} vertices",
                self.vertices.len()
            )));
        }
        let points = self.points.len();
        if let Some(bad) = self
            .vertices
            .to_ints()
            .into_iter()
            .find(|&index| index < 0 || index as usize >= points)
        {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("vertex index {bad} is outside {points} points")));
        }
        for (name, buffer) in &self.attributes {
            if buffer.len() != self.vertices.len() {
                return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                    "vertex attribute `{name}` has {} elements, mesh has {} vertices",
                    buffer.len(),
                    self.vertices.len()
                )));
            }
        }
        Ok(())
    }

    pub fn from_json(json: &MeshJson, layout: MeshLayout) -> Result<Self, Error> {
        let points: Vec<f32> = json.points.iter().flatten().copied().collect();
        let mut mesh = Self {
            points: MeshBuffer::from_floats(&points, 3, layout)?,
            vertices: MeshBuffer::from_ints(&json.vertices, layout),
            faces: MeshBuffer::from_ints(&json.faces, layout),
            attributes: BTreeMap::new(),
        };
        for (name, attribute) in &json.attributes {
            let ty = AttributeType::from_host_name(&attribute.ty).ok_or_else(|| {
                Error::new(ErrorKind::Corrupt)
                    .with_message(format!("attribute `{name}` has unknown type `{}`", attribute.ty))
            })?;
            let buffer = match ty {
                AttributeType::Float => {
                    let values: Vec<f32> = attribute.values.iter().map(|&v| v as f32).collect();
                    MeshBuffer::from_floats(&values, attribute.components, layout)?
                }
                AttributeType::UByte => {
                    let values: Vec<u8> = attribute
                        .values
                        .iter()
                        .map(|&v| v.round().clamp(0.0, 255.0) as u8)
                        .collect();
                    MeshBuffer::from_bytes(&values, attribute.components, layout)?
                }
                AttributeType::Int => {
                    return Err(Error::new(ErrorKind::Unsupported)
                        .with_message(format!("integer vertex attribute `{name}` is not supported")));
                }
            };
            mesh.attributes.insert(name.clone(), buffer);
        }
        mesh.validate()?;
        Ok(mesh)
    }

    pub fn to_json(&self) -> MeshJson {
        let points = self
            .points
            .to_floats()
            .chunks_exact(3)
            .map(|p| [p[0], p[1], p[2]])
            .collect();
        let attributes = self
            .attributes
            .iter()
            .map(|(name, buffer)| {
                let (ty, values) = match buffer.attribute_type() {
                    AttributeType::UByte => (
                        "ubyte",
                        buffer
                            .to_floats()
                            .into_iter()
                            .map(|v| f64::from((v * 255.0).round()))
                            .collect(),
                    ),
                    _ => ("float", buffer.to_floats().into_iter().map(f64::from).collect()),
                };
                (
                    name.clone(),
                    AttributeJson {
                        ty: ty.to_string(),
                        components: buffer.components(),
                        values,
                    },
                )
            })
            .collect();
        MeshJson {
            points,
            vertices: self.vertices.to_ints(),
            faces: self.faces.to_ints(),
            attributes,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct MeshJson {
    #[serde(default)]
    pub points: Vec<[f32; 3]>,
    #[serde(default)]
    pub vertices: Vec<i32>,
    #[serde(default)]
    pub faces: Vec<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeJson>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AttributeJson {
    #[serde(rename = "type")]
    pub ty: String,
    pub components: usize,
    pub values: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::{MeshBuffer, MeshData, MeshJson, MeshLayout};
    use crate::core::attribute::AttributeType;
    use crate::core::error::ErrorKind;

    fn quad() -> MeshJson {
        serde_json::from_str(
            r#"{"points": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]], "vertices": [0,1,2,3], "faces": [4],
                "attributes": {"color0": {"type": "ubyte", "components": 4, "values": [
                    255,0,0,255, 0,255,0,255, 0,0,255,255, 10,20,30,40]}}}"#,
        )
        .expect("json")
    }

    #[test]
    fn interleaved_buffers_pad_each_record() {
        let buffer = MeshBuffer::new(AttributeType::Float, 3, 2, MeshLayout::Interleaved);
        assert_eq!(buffer.stride(), 16);
        let attr = buffer.attribute().expect("attr");
        assert!(!attr.is_contiguous());
        assert_eq!(attr.len(), 2);
        let bytes = MeshBuffer::new(AttributeType::UByte, 3, 1, MeshLayout::Interleaved);
        assert_eq!(bytes.stride(), 8);
    }

    #[test]
    fn json_survives_both_layouts() {
        let json = quad();
        for layout in [MeshLayout::Packed, MeshLayout::Interleaved] {
            let mesh = MeshData::from_json(&json, layout).expect("mesh");
            assert_eq!(mesh.counts().points, 4);
            assert_eq!(mesh.to_json(), json);
        }
    }

    #[test]
    fn validation_rejects_dangling_indices() {
        let mut json = quad();
        json.vertices[2] = 9;
        let err = MeshData::from_json(&json, MeshLayout::Packed).expect_err("dangling");
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        let mut json = quad();
        json.faces = vec![3];
        let err = MeshData::from_json(&json, MeshLayout::Packed).expect_err("faces");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
