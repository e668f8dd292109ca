use std::fmt::{self, Display};

use ndarray::{Array1, Array2, ArrayD, Ix1, Ix2, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{GraphErr, Result};

/// The element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    I32,
    String,
}

impl Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "float32",
            DType::I32 => "int32",
            DType::String => "string",
        };

        f.write_str(s)
    }
}

/// The static type of a value flowing through a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorType {
    pub fn new(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn f32(shape: impl Into<Vec<usize>>) -> Self {
        Self::new(DType::F32, shape)
    }

    /// Returns the amount of elements a value of this type holds.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

impl Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.shape.iter().map(usize::to_string).collect();
        write!(f, "{}[{}]", self.dtype, dims.join(", "))
    }
}

/// A named input or output of a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: shape.into(),
        }
    }

    pub fn ty(&self) -> TensorType {
        TensorType::new(self.dtype, self.shape.clone())
    }
}

impl Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.ty())
    }
}

/// A concrete tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorValue {
    F32(ArrayD<f32>),
    I32(ArrayD<i32>),
    String(ArrayD<String>),
}

impl TensorValue {
    /// Creates a float tensor from its row-major values.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `values` - Exactly as many values as `shape` has elements.
    pub fn f32(shape: &[usize], values: Vec<f32>) -> Result<Self> {
        let len = values.len();
        ArrayD::from_shape_vec(IxDyn(shape), values)
            .map(Self::F32)
            .map_err(|_| data_len_err(len, shape))
    }

    pub fn i32(shape: &[usize], values: Vec<i32>) -> Result<Self> {
        let len = values.len();
        ArrayD::from_shape_vec(IxDyn(shape), values)
            .map(Self::I32)
            .map_err(|_| data_len_err(len, shape))
    }

    /// Creates a rank-0 float tensor.
    pub fn scalar(value: f32) -> Self {
        Self::F32(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Creates a `[1]` string tensor, the shape checkpoint paths are passed with.
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(ArrayD::from_elem(IxDyn(&[1]), value.into()))
    }

    pub fn zeros(ty: &TensorType) -> Self {
        let dim = IxDyn(&ty.shape);
        match ty.dtype {
            DType::F32 => Self::F32(ArrayD::zeros(dim)),
            DType::I32 => Self::I32(ArrayD::zeros(dim)),
            DType::String => Self::String(ArrayD::from_elem(dim, String::new())),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::F32(_) => DType::F32,
            TensorValue::I32(_) => DType::I32,
            TensorValue::String(_) => DType::String,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorValue::F32(a) => a.shape(),
            TensorValue::I32(a) => a.shape(),
            TensorValue::String(a) => a.shape(),
        }
    }

    pub fn ty(&self) -> TensorType {
        TensorType::new(self.dtype(), self.shape())
    }

    pub fn as_f32(&self) -> Result<&ArrayD<f32>> {
        match self {
            TensorValue::F32(a) => Ok(a),
            other => Err(dtype_err("tensor", other.dtype(), DType::F32)),
        }
    }

    pub fn into_f32(self) -> Result<ArrayD<f32>> {
        match self {
            TensorValue::F32(a) => Ok(a),
            other => Err(dtype_err("tensor", other.dtype(), DType::F32)),
        }
    }

    pub fn as_i32(&self) -> Result<&ArrayD<i32>> {
        match self {
            TensorValue::I32(a) => Ok(a),
            other => Err(dtype_err("tensor", other.dtype(), DType::I32)),
        }
    }

    pub fn as_strings(&self) -> Result<&ArrayD<String>> {
        match self {
            TensorValue::String(a) => Ok(a),
            other => Err(dtype_err("tensor", other.dtype(), DType::String)),
        }
    }

    pub fn into_array2(self) -> Result<Array2<f32>> {
        let shape = self.shape().to_vec();
        self.into_f32()?
            .into_dimensionality::<Ix2>()
            .map_err(|_| rank_err(shape, 2))
    }

    pub fn into_array1(self) -> Result<Array1<f32>> {
        let shape = self.shape().to_vec();
        self.into_f32()?
            .into_dimensionality::<Ix1>()
            .map_err(|_| rank_err(shape, 1))
    }

    /// Returns the first element of a float tensor, in row-major order.
    pub fn first_f32(&self) -> Result<f32> {
        let a = self.as_f32()?;
        a.iter().next().copied().ok_or_else(|| GraphErr::ShapeMismatch {
            what: "non-empty tensor".into(),
            got: a.shape().to_vec(),
            expected: vec![1],
        })
    }

    /// Checks this value against a declared spec, exact dtype and shape.
    pub fn check(&self, spec: &TensorSpec) -> Result<()> {
        if self.dtype() != spec.dtype {
            return Err(dtype_err(&spec.name, self.dtype(), spec.dtype));
        }

        if self.shape() != spec.shape.as_slice() {
            return Err(GraphErr::ShapeMismatch {
                what: spec.name.clone(),
                got: self.shape().to_vec(),
                expected: spec.shape.clone(),
            });
        }

        Ok(())
    }

    /// Returns a copy of this tensor with the same row-major values and a new shape.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        let got = self.shape().iter().product::<usize>();
        if numel != got {
            return Err(GraphErr::ShapeMismatch {
                what: "reshape".into(),
                got: self.shape().to_vec(),
                expected: shape.to_vec(),
            });
        }

        match self {
            TensorValue::F32(a) => Self::f32(shape, a.iter().copied().collect()),
            TensorValue::I32(a) => Self::i32(shape, a.iter().copied().collect()),
            TensorValue::String(a) => ArrayD::from_shape_vec(IxDyn(shape), a.iter().cloned().collect())
                .map(Self::String)
                .map_err(|_| data_len_err(got, shape)),
        }
    }
}

/// Computes the shape two operands broadcast to, following the usual trailing-axis rules.
///
/// # Returns
/// The broadcast shape, or `None` if the shapes are incompatible.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |shape: &[usize], i: usize| {
        let pad = rank - shape.len();
        if i < pad { 1 } else { shape[i - pad] }
    };

    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

fn data_len_err(len: usize, shape: &[usize]) -> GraphErr {
    GraphErr::ShapeMismatch {
        what: "tensor data".into(),
        got: vec![len],
        expected: shape.to_vec(),
    }
}

fn rank_err(shape: Vec<usize>, rank: usize) -> GraphErr {
    GraphErr::ShapeMismatch {
        what: format!("rank-{rank} tensor"),
        got: shape,
        expected: vec![1; rank],
    }
}

fn dtype_err(what: &str, got: DType, expected: DType) -> GraphErr {
    GraphErr::DTypeMismatch {
        what: what.to_string(),
        got,
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_follows_trailing_axes() {
        assert_eq!(broadcast_shape(&[1, 1], &[1]), Some(vec![1, 1]));
        assert_eq!(broadcast_shape(&[], &[3, 2]), Some(vec![3, 2]));
        assert_eq!(broadcast_shape(&[4, 1], &[3]), Some(vec![4, 3]));
        assert_eq!(broadcast_shape(&[2], &[3]), None);
    }

    #[test]
    fn check_rejects_wrong_shape_and_dtype() {
        let spec = TensorSpec::new("x", DType::F32, [1, 1]);

        let ok = TensorValue::f32(&[1, 1], vec![1.0]).unwrap();
        assert!(ok.check(&spec).is_ok());

        let wide = TensorValue::f32(&[1, 2], vec![1.0, 2.0]).unwrap();
        assert!(matches!(
            wide.check(&spec),
            Err(GraphErr::ShapeMismatch { got, .. }) if got == [1, 2]
        ));

        let ints = TensorValue::i32(&[1, 1], vec![1]).unwrap();
        assert!(matches!(
            ints.check(&spec),
            Err(GraphErr::DTypeMismatch { got: DType::I32, .. })
        ));
    }

    #[test]
    fn reshape_keeps_row_major_order() {
        let t = TensorValue::f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let flat = t.reshape(&[4]).unwrap();
        assert_eq!(flat.into_array1().unwrap().to_vec(), [1.0, 2.0, 3.0, 4.0]);

        assert!(t.reshape(&[3]).is_err());
    }

    #[test]
    fn wrong_data_length_is_a_shape_error() {
        assert!(TensorValue::f32(&[1, 1], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn types_print_like_signatures() {
        let spec = TensorSpec::new("checkpoint_path", DType::String, [1]);
        assert_eq!(spec.to_string(), "checkpoint_path: string[1]");
        assert_eq!(TensorType::f32([1, 1]).to_string(), "float32[1, 1]");
    }
}
