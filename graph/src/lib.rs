pub mod artifact;
pub mod autodiff;
pub mod error;
mod exec;
pub mod ir;
pub mod model;
pub mod runtime;
pub mod signature;
pub mod tensor;

pub use artifact::Artifact;
pub use error::{GraphErr, Result};
pub use exec::{VariableStore, execute};
pub use model::LinearModel;
pub use runtime::Runtime;
pub use signature::{Signature, SignatureKind, SignatureRegistry};
