use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use graph::{GraphErr, ir::OpSet};

/// The result type used in the entire exporter module.
pub type Result<T> = std::result::Result<T, ExportErr>;

/// Errors raised while lowering a traced module into an artifact.
#[derive(Debug)]
pub enum ConvertErr {
    /// A live node uses an operator outside the selected vocabulary.
    UnsupportedOperator {
        signature: String,
        op: &'static str,
        profile: OpSet,
    },
    /// A write has no consumer and would be removed by dead-code elimination.
    DroppedSideEffect {
        signature: String,
        op: &'static str,
    },
    /// A registry signature is missing from the module or was traced with another contract.
    SignatureMismatch {
        signature: String,
        reason: String,
    },
    Graph(GraphErr),
}

impl Display for ConvertErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertErr::UnsupportedOperator {
                signature,
                op,
                profile,
            } => write!(
                f,
                "unsupported operator {op} in signature {signature} for the {profile} profile"
            ),
            ConvertErr::DroppedSideEffect { signature, op } => write!(
                f,
                "{op} in signature {signature} has no consumer and would be dropped"
            ),
            ConvertErr::SignatureMismatch { signature, reason } => {
                write!(f, "signature {signature} does not match the registry: {reason}")
            }
            ConvertErr::Graph(e) => write!(f, "{e}"),
        }
    }
}

impl Error for ConvertErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConvertErr::Graph(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GraphErr> for ConvertErr {
    fn from(value: GraphErr) -> Self {
        Self::Graph(value)
    }
}

/// Errors raised while checking a produced artifact.
#[derive(Debug)]
pub enum VerifyErr {
    SignatureSetMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    SpecMismatch {
        signature: String,
        expected: String,
        got: String,
    },
    NumericAssertion {
        check: &'static str,
        got: f32,
        expected: String,
    },
    Graph(GraphErr),
    Io(io::Error),
}

impl Display for VerifyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyErr::SignatureSetMismatch {
                missing,
                unexpected,
            } => write!(
                f,
                "signature set mismatch: missing {missing:?}, unexpected {unexpected:?}"
            ),
            VerifyErr::SpecMismatch {
                signature,
                expected,
                got,
            } => write!(
                f,
                "signature {signature} reports {got}, expected {expected}"
            ),
            VerifyErr::NumericAssertion {
                check,
                got,
                expected,
            } => write!(f, "{check}: got {got}, expected {expected}"),
            VerifyErr::Graph(e) => write!(f, "{e}"),
            VerifyErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for VerifyErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            VerifyErr::Graph(e) => Some(e),
            VerifyErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GraphErr> for VerifyErr {
    fn from(value: GraphErr) -> Self {
        Self::Graph(value)
    }
}

impl From<io::Error> for VerifyErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// The exporter's error type.
#[derive(Debug)]
pub enum ExportErr {
    InvalidConfig(String),
    Graph(GraphErr),
    Convert(ConvertErr),
    Verify(VerifyErr),
    Io(io::Error),
}

impl Display for ExportErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            ExportErr::Graph(e) => write!(f, "graph error: {e}"),
            ExportErr::Convert(e) => write!(f, "conversion failed: {e}"),
            ExportErr::Verify(e) => write!(f, "verification failed: {e}"),
            ExportErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for ExportErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExportErr::Graph(e) => Some(e),
            ExportErr::Convert(e) => Some(e),
            ExportErr::Verify(e) => Some(e),
            ExportErr::Io(e) => Some(e),
            ExportErr::InvalidConfig(_) => None,
        }
    }
}

impl From<GraphErr> for ExportErr {
    fn from(value: GraphErr) -> Self {
        Self::Graph(value)
    }
}

impl From<ConvertErr> for ExportErr {
    fn from(value: ConvertErr) -> Self {
        Self::Convert(value)
    }
}

impl From<VerifyErr> for ExportErr {
    fn from(value: VerifyErr) -> Self {
        Self::Verify(value)
    }
}

impl From<io::Error> for ExportErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
