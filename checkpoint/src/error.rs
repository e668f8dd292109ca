use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

/// The result type used in the entire checkpoint module.
pub type Result<T> = std::result::Result<T, CheckpointErr>;

/// The checkpoint module's error type.
#[derive(Debug)]
pub enum CheckpointErr {
    Io {
        path: PathBuf,
        source: io::Error,
    },
    MissingFile(PathBuf),
    CorruptIndex(String),
    UnsupportedVersion(u32),
    LengthMismatch {
        what: String,
        got: usize,
        expected: usize,
    },
    MissingTensor(String),
    UnexpectedTensor(String),
}

impl Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointErr::Io { path, source } => {
                write!(f, "checkpoint io error on {}: {source}", path.display())
            }
            CheckpointErr::MissingFile(path) => {
                write!(f, "checkpoint file {} does not exist", path.display())
            }
            CheckpointErr::CorruptIndex(msg) => write!(f, "corrupt checkpoint index: {msg}"),
            CheckpointErr::UnsupportedVersion(version) => {
                write!(f, "unsupported checkpoint format version {version}")
            }
            CheckpointErr::LengthMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "checkpoint length mismatch for {what}: got {got} bytes, expected {expected}"
            ),
            CheckpointErr::MissingTensor(name) => {
                write!(f, "tensor {name} is not present in the checkpoint")
            }
            CheckpointErr::UnexpectedTensor(name) => {
                write!(f, "checkpoint holds unexpected tensor {name}")
            }
        }
    }
}

impl Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckpointErr::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CheckpointErr {
    fn from(value: serde_json::Error) -> Self {
        Self::CorruptIndex(value.to_string())
    }
}
