//! Typed data carried through slots.
//!
//! Slots are dynamically typed: one graph mixes image volumes, thresholds,
//! and label strings. `Value` is the tagged union for that, `NdValue` the
//! array half of it - a dtype-tagged `ArcArrayD`, so cloning a computed
//! result is cheap (copy-on-write) and requests can be waited on multiple
//! times without deep copies.

use ndarray::{ArcArray, ArrayD, IxDyn, Slice};

use crate::error::GraphError;
use crate::roi::Roi;

/// Dynamic array type alias used throughout the engine.
pub type ArcArrayD<T> = ArcArray<T, IxDyn>;

/// Element type of an [`NdValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    U8,
    U32,
    I64,
    F32,
    F64,
}

impl Dtype {
    /// Size of one element in bytes (for cache budgeting).
    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::U32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::F64 => 8,
        }
    }
}

/// N-dimensional array with a runtime dtype tag.
#[derive(Debug, Clone, PartialEq)]
pub enum NdValue {
    U8(ArcArrayD<u8>),
    U32(ArcArrayD<u32>),
    I64(ArcArrayD<i64>),
    F32(ArcArrayD<f32>),
    F64(ArcArrayD<f64>),
}

/// Apply `$body` to the inner array and re-wrap in the same variant.
macro_rules! map_variant {
    ($self:expr, $arr:ident => $body:expr) => {
        match $self {
            NdValue::U8($arr) => NdValue::U8($body),
            NdValue::U32($arr) => NdValue::U32($body),
            NdValue::I64($arr) => NdValue::I64($body),
            NdValue::F32($arr) => NdValue::F32($body),
            NdValue::F64($arr) => NdValue::F64($body),
        }
    };
}

/// Apply `$body` to the inner array, yielding a plain (non-wrapped) value.
macro_rules! with_array {
    ($self:expr, $arr:ident => $body:expr) => {
        match $self {
            NdValue::U8($arr) => $body,
            NdValue::U32($arr) => $body,
            NdValue::I64($arr) => $body,
            NdValue::F32($arr) => $body,
            NdValue::F64($arr) => $body,
        }
    };
}

impl NdValue {
    /// Zero-filled array of the given dtype and shape. This is how request
    /// machinery pre-allocates the `result` buffer handed to `execute()`.
    pub fn zeros(dtype: Dtype, shape: &[usize]) -> Self {
        let dim = IxDyn(shape);
        match dtype {
            Dtype::U8 => NdValue::U8(ArrayD::zeros(dim).into_shared()),
            Dtype::U32 => NdValue::U32(ArrayD::zeros(dim).into_shared()),
            Dtype::I64 => NdValue::I64(ArrayD::zeros(dim).into_shared()),
            Dtype::F32 => NdValue::F32(ArrayD::zeros(dim).into_shared()),
            Dtype::F64 => NdValue::F64(ArrayD::zeros(dim).into_shared()),
        }
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            NdValue::U8(_) => Dtype::U8,
            NdValue::U32(_) => Dtype::U32,
            NdValue::I64(_) => Dtype::I64,
            NdValue::F32(_) => Dtype::F32,
            NdValue::F64(_) => Dtype::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        with_array!(self, a => a.ndim())
    }

    pub fn len(&self) -> usize {
        with_array!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory footprint of the payload in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len() * self.dtype().size_bytes()
    }

    /// Owned copy of the sub-region addressed by `roi`.
    pub fn slice(&self, roi: &Roi) -> Result<NdValue, GraphError> {
        roi.validate_within(self.shape())
            .map_err(|(roi, shape)| GraphError::RoiOutOfBounds { roi, shape })?;
        Ok(map_variant!(self, a => a
            .slice_each_axis(|ad| {
                Slice::from(roi.start()[ad.axis.index()]..roi.stop()[ad.axis.index()])
            })
            .to_owned()
            .into_shared()))
    }

    /// Write `src` into the sub-region addressed by `roi`. Shapes must
    /// match exactly; dtype disagreement is an error, not a cast.
    pub fn assign_region(&mut self, roi: &Roi, src: &NdValue) -> Result<(), GraphError> {
        if self.dtype() != src.dtype() {
            return Err(GraphError::DtypeMismatch {
                expected: self.dtype(),
                actual: src.dtype(),
            });
        }
        roi.validate_within(self.shape())
            .map_err(|(roi, shape)| GraphError::RoiOutOfBounds { roi, shape })?;

        macro_rules! assign {
            ($dst:expr, $s:expr) => {
                $dst.slice_each_axis_mut(|ad| {
                    Slice::from(roi.start()[ad.axis.index()]..roi.stop()[ad.axis.index()])
                })
                .assign($s)
            };
        }
        match (self, src) {
            (NdValue::U8(dst), NdValue::U8(s)) => assign!(dst, s),
            (NdValue::U32(dst), NdValue::U32(s)) => assign!(dst, s),
            (NdValue::I64(dst), NdValue::I64(s)) => assign!(dst, s),
            (NdValue::F32(dst), NdValue::F32(s)) => assign!(dst, s),
            (NdValue::F64(dst), NdValue::F64(s)) => assign!(dst, s),
            // Dtypes already verified equal above
            _ => {}
        }
        Ok(())
    }

    /// Per-element map through `f64`, preserving the dtype. Integer dtypes
    /// truncate on the way back, matching numpy's same-dtype ufunc output.
    pub fn map_f64<F: Fn(f64) -> f64>(&self, f: F) -> NdValue {
        match self {
            NdValue::U8(a) => NdValue::U8(a.map(|&x| f(x as f64) as u8).into_shared()),
            NdValue::U32(a) => NdValue::U32(a.map(|&x| f(x as f64) as u32).into_shared()),
            NdValue::I64(a) => NdValue::I64(a.map(|&x| f(x as f64) as i64).into_shared()),
            NdValue::F32(a) => NdValue::F32(a.map(|&x| f(x as f64) as f32).into_shared()),
            NdValue::F64(a) => NdValue::F64(a.map(|&x| f(x)).into_shared()),
        }
    }

    pub fn as_u8(&self) -> Option<&ArcArrayD<u8>> {
        match self {
            NdValue::U8(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&ArcArrayD<f32>> {
        match self {
            NdValue::F32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&ArcArrayD<f64>> {
        match self {
            NdValue::F64(a) => Some(a),
            _ => None,
        }
    }
}

impl From<ArrayD<u8>> for NdValue {
    fn from(a: ArrayD<u8>) -> Self {
        NdValue::U8(a.into_shared())
    }
}

impl From<ArrayD<u32>> for NdValue {
    fn from(a: ArrayD<u32>) -> Self {
        NdValue::U32(a.into_shared())
    }
}

impl From<ArrayD<i64>> for NdValue {
    fn from(a: ArrayD<i64>) -> Self {
        NdValue::I64(a.into_shared())
    }
}

impl From<ArrayD<f32>> for NdValue {
    fn from(a: ArrayD<f32>) -> Self {
        NdValue::F32(a.into_shared())
    }
}

impl From<ArrayD<f64>> for NdValue {
    fn from(a: ArrayD<f64>) -> Self {
        NdValue::F64(a.into_shared())
    }
}

/// Generic slot payload: array data or a plain configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Array(NdValue),
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn as_array(&self) -> Option<&NdValue> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn get_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// One-line type tag for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Array(_) => "array",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
        }
    }
}

impl From<NdValue> for Value {
    fn from(a: NdValue) -> Self {
        Value::Array(a)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn ramp_f32(shape: &[usize]) -> NdValue {
        let n: usize = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap().into()
    }

    #[test]
    fn test_zeros_shape_dtype() {
        let v = NdValue::zeros(Dtype::U8, &[4, 3]);
        assert_eq!(v.dtype(), Dtype::U8);
        assert_eq!(v.shape(), &[4, 3]);
        assert_eq!(v.size_bytes(), 12);
    }

    #[test]
    fn test_slice_copies_region() {
        let v = ramp_f32(&[4, 4]);
        let sub = v.slice(&Roi::from_ranges([1..3, 0..2])).unwrap();
        assert_eq!(sub.shape(), &[2, 2]);
        let arr = sub.as_f32().unwrap();
        // Row-major ramp: row 1 starts at 4, row 2 at 8
        assert_eq!(arr[[0, 0]], 4.0);
        assert_eq!(arr[[1, 1]], 9.0);
    }

    #[test]
    fn test_slice_out_of_bounds() {
        let v = ramp_f32(&[4, 4]);
        let err = v.slice(&Roi::from_ranges([0..5, 0..4])).unwrap_err();
        assert!(matches!(err, GraphError::RoiOutOfBounds { .. }));
    }

    #[test]
    fn test_assign_region_roundtrip() {
        let mut dst = NdValue::zeros(Dtype::F32, &[4, 4]);
        let roi = Roi::from_ranges([1..3, 1..3]);
        let src = ramp_f32(&[2, 2]);
        dst.assign_region(&roi, &src).unwrap();
        assert_eq!(dst.slice(&roi).unwrap(), src);
        // Outside the region stays zero
        assert_eq!(dst.as_f32().unwrap()[[0, 0]], 0.0);
    }

    #[test]
    fn test_assign_region_dtype_mismatch() {
        let mut dst = NdValue::zeros(Dtype::F32, &[2, 2]);
        let src = NdValue::zeros(Dtype::U8, &[2, 2]);
        let err = dst.assign_region(&Roi::full(&[2, 2]), &src).unwrap_err();
        assert!(matches!(err, GraphError::DtypeMismatch { .. }));
    }

    #[test]
    fn test_map_preserves_dtype() {
        let v = ramp_f32(&[2, 2]);
        let doubled = v.map_f64(|x| x * 2.0);
        assert_eq!(doubled.dtype(), Dtype::F32);
        assert_eq!(doubled.as_f32().unwrap()[[1, 1]], 6.0);
    }

    #[test]
    fn test_value_getters() {
        assert_eq!(Value::from(3i64).get_int(), Some(3));
        assert_eq!(Value::from(3i64).get_float(), Some(3.0));
        assert_eq!(Value::from("sigma").get_str(), Some("sigma"));
        assert_eq!(Value::from(true).get_bool(), Some(true));
        assert!(Value::from(ramp_f32(&[1])).as_array().is_some());
        assert_eq!(Value::from(1.5f64).kind(), "float");
    }
}
