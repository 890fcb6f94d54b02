//! Purpose: Describe host-owned strided buffers and stage them for contiguous engine I/O.
//! Exports: `AttributeType`, `Attribute`, `AttributeMut`, `Staged`.
//! Role: Zero-copy when a host buffer is already tightly packed and aligned; owned scratch
//!       buffer otherwise.
//! Invariants: A descriptor never owns memory; it borrows the host buffer for one call.
//! Invariants: `stride >= component_count * element_size`, checked at construction.
//! Invariants: Every element access is bounds-checked against the borrowed slice.
use std::borrow::Cow;
use std::mem::size_of;

use bytemuck::Pod;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttributeType {
    UByte,
    Int,
    Float,
}

impl AttributeType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(AttributeType::UByte),
            1 => Some(AttributeType::Int),
            2 => Some(AttributeType::Float),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            AttributeType::UByte => 0,
            AttributeType::Int => 1,
            AttributeType::Float => 2,
        }
    }

    pub fn from_host_name(name: &str) -> Option<Self> {
        match name {
            "ubyte" => Some(AttributeType::UByte),
            "int" => Some(AttributeType::Int),
            "float" => Some(AttributeType::Float),
            _ => None,
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            AttributeType::UByte => 1,
            AttributeType::Int => 4,
            AttributeType::Float => 4,
        }
    }
}

fn packing_of(ty: AttributeType, component_count: usize) -> usize {
    component_count * ty.byte_size()
}

fn check_layout(ty: AttributeType, component_count: usize, stride: usize) -> Result<(), Error> {
    let packing = packing_of(ty, component_count);
    if stride < packing {
        return Err(Error::new(ErrorKind::Contract).with_message(format!(
            "stride {stride} is smaller than the packing size {packing} of {component_count} x {ty:?}"
        )));
    }
    Ok(())
}

fn span_len(stride: usize, packing: usize, count: usize) -> usize {
    if count == 0 {
        0
    } else {
        (count - 1) * stride + packing
    }
}

fn elements_in(len: usize, stride: usize, packing: usize) -> usize {
    if packing == 0 || len < packing {
        return 0;
    }
    if stride == 0 {
        return 1;
    }
    (len - packing) / stride + 1
}

fn check_element_type<T: Pod>(ty: AttributeType) -> Result<(), Error> {
    if size_of::<T>() != ty.byte_size() {
        return Err(Error::new(ErrorKind::Contract).with_message(format!(
            "{ty:?} elements cannot be viewed as {}-byte values",
            size_of::<T>()
        )));
    }
    Ok(())
}

/// Read-only view of a host attribute buffer.
#[derive(Clone, Copy, Debug)]
pub struct Attribute<'a> {
    ty: AttributeType,
    component_count: usize,
    stride: usize,
    data: &'a [u8],
}

impl<'a> Attribute<'a> {
    pub fn new(
        ty: AttributeType,
        component_count: usize,
        stride: usize,
        data: &'a [u8],
    ) -> Result<Self, Error> {
        check_layout(ty, component_count, stride)?;
        Ok(Self {
            ty,
            component_count,
            stride,
            data,
        })
    }

    pub fn packed(ty: AttributeType, component_count: usize, data: &'a [u8]) -> Self {
        Self {
            ty,
            component_count,
            stride: packing_of(ty, component_count),
            data,
        }
    }

    pub fn attribute_type(&self) -> AttributeType {
        self.ty
    }

    pub fn component_count(&self) -> usize {
        self.component_count
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Tight size of one element: `component_count * element_size`.
    pub fn packing(&self) -> usize {
        packing_of(self.ty, self.component_count)
    }

    pub fn is_contiguous(&self) -> bool {
        self.stride == self.packing()
    }

    pub fn len(&self) -> usize {
        elements_in(self.data.len(), self.stride, self.packing())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element(&self, index: usize) -> Result<&'a [u8], Error> {
        let start = index * self.stride;
        let end = start + self.packing();
        self.data.get(start..end).ok_or_else(|| {
            Error::new(ErrorKind::Contract)
                .with_message(format!("element {index} is outside the host buffer"))
        })
    }

    /// Checks the element type and packing the engine record expects.
    pub fn require(
        &self,
        what: &str,
        ty: AttributeType,
        component_count: Option<usize>,
        count: usize,
    ) -> Result<(), Error> {
        require_shape(what, self.ty, self.component_count, ty, component_count)?;
        let needed = span_len(self.stride, self.packing(), count);
        if self.data.len() < needed {
            return Err(Error::new(ErrorKind::Contract).with_message(format!(
                "{what} buffer holds {} bytes, {count} elements need {needed}",
                self.data.len()
            )));
        }
        Ok(())
    }

    /// First `count` elements as one contiguous run, borrowed when the host layout allows.
    pub fn contiguous<T: Pod>(&self, count: usize) -> Result<Cow<'a, [T]>, Error> {
        check_element_type::<T>(self.ty)?;
        let packing = self.packing();
        let needed = span_len(self.stride, packing, count);
        if self.data.len() < needed {
            return Err(Error::new(ErrorKind::Contract)
                .with_message(format!("host buffer too small for {count} elements")));
        }
        if self.is_contiguous() {
            let bytes = &self.data[..count * packing];
            if let Ok(values) = bytemuck::try_cast_slice::<u8, T>(bytes) {
                return Ok(Cow::Borrowed(values));
            }
        }

        let mut values = vec![T::zeroed(); count * self.component_count];
        let out = bytemuck::cast_slice_mut::<T, u8>(&mut values);
        for index in 0..count {
            let start = index * self.stride;
            out[index * packing..(index + 1) * packing]
                .copy_from_slice(&self.data[start..start + packing]);
        }
        Ok(Cow::Owned(values))
    }
}

/// Writable view of a host attribute buffer.
#[derive(Debug)]
pub struct AttributeMut<'a> {
    ty: AttributeType,
    component_count: usize,
    stride: usize,
    data: &'a mut [u8],
}

impl<'a> AttributeMut<'a> {
    pub fn new(
        ty: AttributeType,
        component_count: usize,
        stride: usize,
        data: &'a mut [u8],
    ) -> Result<Self, Error> {
        check_layout(ty, component_count, stride)?;
        Ok(Self {
            ty,
            component_count,
            stride,
            data,
        })
    }

    pub fn packed(ty: AttributeType, component_count: usize, data: &'a mut [u8]) -> Self {
        Self {
            ty,
            component_count,
            stride: packing_of(ty, component_count),
            data,
        }
    }

    pub fn attribute_type(&self) -> AttributeType {
        self.ty
    }

    pub fn component_count(&self) -> usize {
        self.component_count
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn packing(&self) -> usize {
        packing_of(self.ty, self.component_count)
    }

    pub fn is_contiguous(&self) -> bool {
        self.stride == self.packing()
    }

    pub fn len(&self) -> usize {
        elements_in(self.data.len(), self.stride, self.packing())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_view(&self) -> Attribute<'_> {
        Attribute {
            ty: self.ty,
            component_count: self.component_count,
            stride: self.stride,
            data: self.data,
        }
    }

    pub fn require(
        &self,
        what: &str,
        ty: AttributeType,
        component_count: Option<usize>,
        count: usize,
    ) -> Result<(), Error> {
        self.as_view().require(what, ty, component_count, count)
    }

    pub fn element_mut(&mut self, index: usize) -> Result<&mut [u8], Error> {
        let start = index * self.stride;
        let end = start + self.packing();
        self.data.get_mut(start..end).ok_or_else(|| {
            Error::new(ErrorKind::Contract)
                .with_message(format!("element {index} is outside the host buffer"))
        })
    }

    /// Writes a single-component element.
    pub fn write_scalar<T: Pod>(&mut self, index: usize, value: T) -> Result<(), Error> {
        check_element_type::<T>(self.ty)?;
        let slot = self.element_mut(index)?;
        slot[..size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Stages `count` elements starting at element `base` for the engine to write into.
    ///
    /// A tightly packed, aligned destination is handed out directly; anything else gets a
    /// scratch buffer that `Staged::finish` scatters back at the host stride.
    pub fn stage<T: Pod>(&mut self, base: usize, count: usize) -> Result<Staged<'_, T>, Error> {
        check_element_type::<T>(self.ty)?;
        let packing = self.packing();
        let start = base * self.stride;
        let end = start + span_len(self.stride, packing, count);
        if end > self.data.len() {
            return Err(Error::new(ErrorKind::Contract).with_message(format!(
                "host buffer has {} elements, {} needed",
                self.len(),
                base + count
            )));
        }

        let region = &mut self.data[start..end];
        if self.stride == packing && bytemuck::try_cast_slice::<u8, T>(region).is_ok() {
            return Ok(Staged {
                inner: StagedInner::Borrowed(bytemuck::cast_slice_mut(region)),
            });
        }
        Ok(Staged {
            inner: StagedInner::Owned {
                buffer: vec![T::zeroed(); count * self.component_count],
                region,
                stride: self.stride,
                packing,
            },
        })
    }
}

fn require_shape(
    what: &str,
    actual_ty: AttributeType,
    actual_components: usize,
    ty: AttributeType,
    component_count: Option<usize>,
) -> Result<(), Error> {
    if actual_ty != ty {
        return Err(Error::new(ErrorKind::Contract)
            .with_message(format!("{what} buffer holds {actual_ty:?}, expected {ty:?}")));
    }
    if let Some(expected) = component_count {
        if actual_components != expected {
            return Err(Error::new(ErrorKind::Contract).with_message(format!(
                "{what} packing is {} bytes, engine records are {} bytes",
                actual_components * actual_ty.byte_size(),
                expected * ty.byte_size()
            )));
        }
    }
    Ok(())
}

/// Contiguous run of engine-side values, borrowed from the host or owned as scratch.
#[derive(Debug)]
pub struct Staged<'b, T: Pod> {
    inner: StagedInner<'b, T>,
}

#[derive(Debug)]
enum StagedInner<'b, T: Pod> {
    Borrowed(&'b mut [T]),
    Owned {
        buffer: Vec<T>,
        region: &'b mut [u8],
        stride: usize,
        packing: usize,
    },
}

impl<'b, T: Pod> Staged<'b, T> {
    pub fn is_borrowed(&self) -> bool {
        matches!(self.inner, StagedInner::Borrowed(_))
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match &mut self.inner {
            StagedInner::Borrowed(values) => &mut values[..],
            StagedInner::Owned { buffer, .. } => &mut buffer[..],
        }
    }

    /// Publishes the staged values to the host buffer. Dropping without finishing
    /// leaves the host buffer untouched on the scratch path.
    pub fn finish(self) {
        if let StagedInner::Owned {
            buffer,
            region,
            stride,
            packing,
        } = self.inner
        {
            let bytes = bytemuck::cast_slice::<T, u8>(&buffer);
            for (index, chunk) in bytes.chunks_exact(packing).enumerate() {
                let start = index * stride;
                region[start..start + packing].copy_from_slice(chunk);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Attribute, AttributeMut, AttributeType};
    use crate::core::error::ErrorKind;
    use std::borrow::Cow;

    fn words_as_bytes(words: &mut [u32]) -> &mut [u8] {
        bytemuck::cast_slice_mut(words)
    }

    #[test]
    fn stride_below_packing_is_rejected() {
        let data = [0u8; 64];
        let err = Attribute::new(AttributeType::Float, 3, 8, &data).expect_err("reject");
        assert_eq!(err.kind(), ErrorKind::Contract);
    }

    #[test]
    fn element_count_accounts_for_trailing_record() {
        let data = [0u8; 16 + 16 + 12];
        let attr = Attribute::new(AttributeType::Float, 3, 16, &data).expect("attr");
        assert_eq!(attr.len(), 3);
        assert!(!attr.is_contiguous());
    }

    #[test]
    fn packed_input_is_borrowed() {
        let mut words = [0u32; 6];
        let values: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        words.copy_from_slice(bytemuck::cast_slice(&values));
        let bytes = words_as_bytes(&mut words);
        let attr = Attribute::packed(AttributeType::Float, 3, bytes);
        let run = attr.contiguous::<f32>(2).expect("run");
        assert!(matches!(run, Cow::Borrowed(_)));
        assert_eq!(&*run, &values);
    }

    #[test]
    fn strided_input_is_gathered() {
        let mut words = [0u32; 8];
        {
            let floats: &mut [f32] = bytemuck::cast_slice_mut(&mut words);
            floats[0] = 0.5;
            floats[1] = 1.5;
            floats[4] = 2.5;
            floats[5] = 3.5;
        }
        let bytes = words_as_bytes(&mut words);
        let attr = Attribute::new(AttributeType::Float, 2, 16, bytes).expect("attr");
        let run = attr.contiguous::<f32>(2).expect("run");
        assert!(matches!(run, Cow::Owned(_)));
        assert_eq!(&*run, &[0.5, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn staging_packed_output_writes_in_place() {
        let mut words = [0u32; 4];
        let bytes = words_as_bytes(&mut words);
        let mut attr = AttributeMut::packed(AttributeType::Int, 1, bytes);
        let mut staged = attr.stage::<i32>(1, 2).expect("stage");
        assert!(staged.is_borrowed());
        staged.as_mut_slice().copy_from_slice(&[7, 8]);
        staged.finish();
        assert_eq!(bytemuck::cast_slice::<u32, i32>(&words), &[0, 7, 8, 0]);
    }

    #[test]
    fn staging_strided_output_scatters_on_finish() {
        let mut words = [0u32; 6];
        let bytes = words_as_bytes(&mut words);
        let mut attr = AttributeMut::new(AttributeType::Int, 1, 8, bytes).expect("attr");
        let mut staged = attr.stage::<i32>(0, 3).expect("stage");
        assert!(!staged.is_borrowed());
        staged.as_mut_slice().copy_from_slice(&[4, 5, 6]);
        staged.finish();
        assert_eq!(bytemuck::cast_slice::<u32, i32>(&words), &[4, 0, 5, 0, 6, 0]);
    }

    #[test]
    fn dropped_scratch_leaves_host_untouched() {
        let mut words = [0u32; 4];
        let bytes = words_as_bytes(&mut words);
        let mut attr = AttributeMut::new(AttributeType::Int, 1, 8, bytes).expect("attr");
        let mut staged = attr.stage::<i32>(0, 2).expect("stage");
        staged.as_mut_slice().copy_from_slice(&[1, 2]);
        drop(staged);
        assert_eq!(words, [0, 0, 0, 0]);
    }

    #[test]
    fn staging_past_the_end_fails() {
        let mut words = [0u32; 3];
        let bytes = words_as_bytes(&mut words);
        let mut attr = AttributeMut::packed(AttributeType::Float, 3, bytes);
        let err = attr.stage::<f32>(1, 1).expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::Contract);
    }

    #[test]
    fn shape_mismatch_is_a_contract_violation() {
        let data = [0u8; 32];
        let attr = Attribute::packed(AttributeType::Float, 2, &data);
        let err = attr
            .require("point", AttributeType::Float, Some(3), 1)
            .expect_err("packing mismatch");
        assert_eq!(err.kind(), ErrorKind::Contract);
        let err = attr
            .require("point", AttributeType::Int, None, 1)
            .expect_err("type mismatch");
        assert_eq!(err.kind(), ErrorKind::Contract);
    }
}
