// Parameter type mapping between engine descriptors and host parameter kinds.
use crate::core::engine::{ParmInfo, ParmType};
use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_PARAMETER_PREFIX: &str = "mfx_";
/// Widest tuple the host protocol carries for one parameter.
pub const MAX_PARM_TUPLE: usize = 4;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HostParamType {
    Double,
    Double2D,
    Double3D,
    Integer,
    Integer2D,
    Integer3D,
    Rgb,
    Rgba,
    String,
}

impl HostParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            HostParamType::Double => "OfxParamTypeDouble",
            HostParamType::Double2D => "OfxParamTypeDouble2D",
            HostParamType::Double3D => "OfxParamTypeDouble3D",
            HostParamType::Integer => "OfxParamTypeInteger",
            HostParamType::Integer2D => "OfxParamTypeInteger2D",
            HostParamType::Integer3D => "OfxParamTypeInteger3D",
            HostParamType::Rgb => "OfxParamTypeRGB",
            HostParamType::Rgba => "OfxParamTypeRGBA",
            HostParamType::String => "OfxParamTypeString",
        }
    }
}

pub fn host_param_type(parm_type: ParmType, size: usize) -> Option<HostParamType> {
    match (parm_type, size) {
        (ParmType::Float, 1) => Some(HostParamType::Double),
        (ParmType::Float, 2) => Some(HostParamType::Double2D),
        (ParmType::Float, 3) => Some(HostParamType::Double3D),
        (ParmType::Int, 1) => Some(HostParamType::Integer),
        (ParmType::Int, 2) => Some(HostParamType::Integer2D),
        (ParmType::Int, 3) => Some(HostParamType::Integer3D),
        (ParmType::Color, 3) => Some(HostParamType::Rgb),
        (ParmType::Color, 4) => Some(HostParamType::Rgba),
        (ParmType::String, _) => Some(HostParamType::String),
        _ => None,
    }
}

pub fn is_surfaced(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix)
}

/// Current values of a parameter as read back from the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum ParmValues {
    Float(Vec<f32>),
    Int(Vec<i32>),
}

/// A value coming from the host side of a parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Doubles(Vec<f64>),
    Integers(Vec<i32>),
    String(String),
}

/// Engine-ready payload for one parameter push.
#[derive(Clone, Debug, PartialEq)]
pub enum ParmPush {
    Float(Vec<f32>),
    Int(Vec<i32>),
}

/// Converts a host value into what the engine stores for `info`.
///
/// A declared size of zero counts as one component. Doubles are narrowed to `f32`.
pub fn convert_host_value(info: &ParmInfo, value: &HostValue) -> Result<ParmPush, Error> {
    let size = match (info.parm_type, info.size) {
        (ParmType::Int | ParmType::Float, 0) => 1,
        (ParmType::Int | ParmType::Float, size @ 1..=3) => size,
        (ParmType::Color, size @ (3 | 4)) => size,
        (parm_type, size) => {
            return Err(Error::new(ErrorKind::Unsupported).with_message(format!(
                "parameters of type {parm_type:?} with size {size} cannot be set from the host"
            )));
        }
    };

    match (info.parm_type, value) {
        (ParmType::Int, HostValue::Integers(values)) => {
            Ok(ParmPush::Int(take_components(values, size)?))
        }
        (ParmType::Float | ParmType::Color, HostValue::Doubles(values)) => {
            let values = take_components(values, size)?;
            Ok(ParmPush::Float(values.into_iter().map(|value| value as f32).collect()))
        }
        (parm_type, value) => Err(Error::new(ErrorKind::Parameter).with_message(format!(
            "host value {} does not fit a {parm_type:?} parameter",
            host_value_kind(value)
        ))),
    }
}

fn take_components<T: Copy>(values: &[T], size: usize) -> Result<Vec<T>, Error> {
    if values.len() < size {
        return Err(Error::new(ErrorKind::Parameter).with_message(format!(
            "parameter expects {size} components, host supplied {}",
            values.len()
        )));
    }
    Ok(values[..size].to_vec())
}

fn host_value_kind(value: &HostValue) -> &'static str {
    match value {
        HostValue::Doubles(_) => "doubles",
        HostValue::Integers(_) => "integers",
        HostValue::String(_) => "string",
    }
}

#[cfg(test)]
mod tests {
    use super::{HostParamType, HostValue, ParmPush, convert_host_value, host_param_type, is_surfaced};
    use crate::core::engine::{ParmInfo, ParmType, StringHandle};
    use crate::core::error::ErrorKind;

    fn info(parm_type: ParmType, size: usize) -> ParmInfo {
        ParmInfo {
            name: StringHandle(1),
            parm_type,
            size,
            float_values_index: 0,
            int_values_index: 0,
            string_values_index: 0,
        }
    }

    #[test]
    fn type_table_matches_host_kinds() {
        let cases = [
            (ParmType::Float, 1, Some(HostParamType::Double)),
            (ParmType::Float, 2, Some(HostParamType::Double2D)),
            (ParmType::Float, 3, Some(HostParamType::Double3D)),
            (ParmType::Float, 4, None),
            (ParmType::Int, 1, Some(HostParamType::Integer)),
            (ParmType::Int, 2, Some(HostParamType::Integer2D)),
            (ParmType::Int, 3, Some(HostParamType::Integer3D)),
            (ParmType::Int, 4, None),
            (ParmType::Color, 3, Some(HostParamType::Rgb)),
            (ParmType::Color, 4, Some(HostParamType::Rgba)),
            (ParmType::Color, 2, None),
            (ParmType::String, 1, Some(HostParamType::String)),
            (ParmType::String, 7, Some(HostParamType::String)),
            (ParmType::Toggle, 1, None),
            (ParmType::Other(12), 1, None),
        ];
        for (parm_type, size, expected) in cases {
            assert_eq!(host_param_type(parm_type, size), expected, "{parm_type:?}/{size}");
        }
        assert_eq!(HostParamType::Rgba.as_str(), "OfxParamTypeRGBA");
    }

    #[test]
    fn prefix_filter() {
        assert!(is_surfaced("mfx_width", "mfx_"));
        assert!(!is_surfaced("width", "mfx_"));
        assert!(!is_surfaced("mf", "mfx_"));
    }

    #[test]
    fn doubles_are_narrowed_to_float() {
        let push = convert_host_value(
            &info(ParmType::Float, 2),
            &HostValue::Doubles(vec![0.25, 1.5, 9.0]),
        )
        .expect("push");
        assert_eq!(push, ParmPush::Float(vec![0.25, 1.5]));
    }

    #[test]
    fn size_zero_counts_as_one() {
        let push = convert_host_value(&info(ParmType::Int, 0), &HostValue::Integers(vec![4]))
            .expect("push");
        assert_eq!(push, ParmPush::Int(vec![4]));
    }

    #[test]
    fn strings_and_wide_tuples_are_unsupported() {
        let err = convert_host_value(
            &info(ParmType::String, 1),
            &HostValue::String("x".to_string()),
        )
        .expect_err("string");
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        let err = convert_host_value(&info(ParmType::Float, 4), &HostValue::Doubles(vec![0.0; 4]))
            .expect_err("float4");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn short_or_mismatched_values_are_parameter_errors() {
        let err = convert_host_value(&info(ParmType::Color, 4), &HostValue::Doubles(vec![1.0; 3]))
            .expect_err("short");
        assert_eq!(err.kind(), ErrorKind::Parameter);

        let err = convert_host_value(&info(ParmType::Int, 1), &HostValue::Doubles(vec![1.0]))
            .expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::Parameter);
    }
}
