use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use checkpoint::CheckpointErr;

use crate::tensor::DType;

/// The result type used in the entire graph module.
pub type Result<T> = std::result::Result<T, GraphErr>;

/// The graph module's error type.
#[derive(Debug)]
pub enum GraphErr {
    ShapeMismatch {
        what: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    DTypeMismatch {
        what: String,
        got: DType,
        expected: DType,
    },
    UnknownSignature(String),
    MissingInput {
        signature: String,
        input: String,
    },
    UnexpectedInput {
        signature: String,
        input: String,
    },
    InvalidGraph(String),
    NotDifferentiable {
        op: &'static str,
    },
    Artifact(String),
    Checkpoint(CheckpointErr),
    Io(io::Error),
}

impl Display for GraphErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {what}: got {got:?}, expected {expected:?}"
            ),
            GraphErr::DTypeMismatch {
                what,
                got,
                expected,
            } => write!(f, "dtype mismatch for {what}: got {got}, expected {expected}"),
            GraphErr::UnknownSignature(name) => write!(f, "unknown signature {name}"),
            GraphErr::MissingInput { signature, input } => {
                write!(f, "signature {signature} is missing input {input}")
            }
            GraphErr::UnexpectedInput { signature, input } => {
                write!(f, "signature {signature} has no input named {input}")
            }
            GraphErr::InvalidGraph(msg) => write!(f, "invalid graph: {msg}"),
            GraphErr::NotDifferentiable { op } => {
                write!(f, "operator {op} has no gradient rule")
            }
            GraphErr::Artifact(msg) => write!(f, "malformed artifact: {msg}"),
            GraphErr::Checkpoint(e) => write!(f, "{e}"),
            GraphErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for GraphErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GraphErr::Checkpoint(e) => Some(e),
            GraphErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CheckpointErr> for GraphErr {
    fn from(value: CheckpointErr) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<io::Error> for GraphErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
