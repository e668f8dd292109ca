mod codec;
mod error;
mod files;
mod record;

pub use codec::{FORMAT_VERSION, decode, encode, select};
pub use error::{CheckpointErr, Result};
pub use files::{data_path, index_path, read, write};
pub use record::{CheckpointRecord, DType, IndexEntry, Tensor, TensorData};
