use serde::{Deserialize, Serialize};

use crate::{CheckpointErr, Result};

/// The element types a checkpoint can persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    I32,
}

impl DType {
    /// Returns the size in bytes of a single element.
    pub fn item_size(self) -> usize {
        match self {
            DType::F32 => size_of::<f32>(),
            DType::I32 => size_of::<i32>(),
        }
    }
}

/// The flat values of a persisted tensor, in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::I32(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A tensor as it is stored in a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Creates a new `Tensor`.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The row-major values, exactly `shape.iter().product()` of them.
    ///
    /// # Returns
    /// The tensor or a length mismatch if `data` doesn't fill `shape`.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let item_size = data.dtype().item_size();
        let expected = shape_byte_len(&shape, data.dtype());
        if expected != Some(data.len() * item_size) {
            return Err(CheckpointErr::LengthMismatch {
                what: format!("tensor of shape {shape:?}"),
                got: data.len() * item_size,
                expected: expected.unwrap_or(usize::MAX),
            });
        }

        Ok(Self { shape, data })
    }

    pub fn f32(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        Self::new(shape, TensorData::F32(values))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Returns the amount of bytes this tensor takes in the data file.
    pub fn byte_len(&self) -> usize {
        self.data.len() * self.dtype().item_size()
    }

    pub fn into_parts(self) -> (Vec<usize>, TensorData) {
        (self.shape, self.data)
    }
}

/// Where and how a single tensor is laid out inside the data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub offset: usize,
    pub length: usize,
}

/// The contents of a checkpoint index file.
///
/// Entries are sorted by name and laid out back to back in the data file, in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub entries: Vec<IndexEntry>,
    pub data_len: usize,
}

impl CheckpointRecord {
    /// Returns the names of the recorded tensors in index order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&IndexEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Checks the record is consistent with itself and with a data file of `data_len` bytes.
    ///
    /// # Arguments
    /// * `data_len` - The length of the data file this index is paired with.
    pub fn validate(&self, data_len: usize) -> Result<()> {
        if self.data_len != data_len {
            return Err(CheckpointErr::LengthMismatch {
                what: "data file".into(),
                got: data_len,
                expected: self.data_len,
            });
        }

        let mut cursor = 0;
        let mut prev: Option<&str> = None;

        for entry in &self.entries {
            if prev.is_some_and(|prev| prev >= entry.name.as_str()) {
                return Err(CheckpointErr::CorruptIndex(format!(
                    "entry {} is out of order or duplicated",
                    entry.name
                )));
            }

            if entry.offset != cursor {
                return Err(CheckpointErr::CorruptIndex(format!(
                    "entry {} starts at byte {} but the previous one ends at {cursor}",
                    entry.name, entry.offset
                )));
            }

            let expected = shape_byte_len(&entry.shape, entry.dtype).ok_or_else(|| {
                CheckpointErr::CorruptIndex(format!(
                    "entry {} has a shape {:?} too large to address",
                    entry.name, entry.shape
                ))
            })?;
            if entry.length != expected {
                return Err(CheckpointErr::LengthMismatch {
                    what: entry.name.clone(),
                    got: entry.length,
                    expected,
                });
            }

            cursor = cursor.checked_add(entry.length).ok_or_else(|| {
                CheckpointErr::CorruptIndex(format!(
                    "entry {} ends past the addressable range",
                    entry.name
                ))
            })?;
            prev = Some(&entry.name);
        }

        if cursor != self.data_len {
            return Err(CheckpointErr::LengthMismatch {
                what: "index entries".into(),
                got: cursor,
                expected: self.data_len,
            });
        }

        Ok(())
    }
}

/// Returns the amount of bytes a tensor of `shape` takes, `None` if it overflows.
fn shape_byte_len(shape: &[usize], dtype: DType) -> Option<usize> {
    shape
        .iter()
        .try_fold(1usize, |numel, &dim| numel.checked_mul(dim))?
        .checked_mul(dtype.item_size())
}
