use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};

use crate::{
    GraphErr, Result,
    ir::OpSet,
    tensor::{DType, TensorSpec},
};

/// The entry points a `LinearModel` can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureKind {
    Infer,
    Train,
    GetWeights,
    SetWeights,
    Save,
    Restore,
}

impl SignatureKind {
    pub const ALL: [SignatureKind; 6] = [
        SignatureKind::Infer,
        SignatureKind::Train,
        SignatureKind::GetWeights,
        SignatureKind::SetWeights,
        SignatureKind::Save,
        SignatureKind::Restore,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SignatureKind::Infer => "infer",
            SignatureKind::Train => "train",
            SignatureKind::GetWeights => "get_weights",
            SignatureKind::SetWeights => "set_weights",
            SignatureKind::Save => "save",
            SignatureKind::Restore => "restore",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Returns the smallest operator vocabulary this entry point can be lowered to.
    pub fn required_op_set(self) -> OpSet {
        match self {
            SignatureKind::Save | SignatureKind::Restore => OpSet::Extended,
            _ => OpSet::Builtins,
        }
    }

    /// Returns the full contract of this entry point.
    pub fn signature(self) -> Signature {
        let matrix = |name: &str| TensorSpec::new(name, DType::F32, [1, 1]);
        let vector = |name: &str| TensorSpec::new(name, DType::F32, [1]);
        let path = || TensorSpec::new("checkpoint_path", DType::String, [1]);
        let status = || TensorSpec::new("status", DType::I32, [1]);

        let (inputs, outputs) = match self {
            SignatureKind::Infer => (vec![matrix("x")], vec![matrix("output")]),
            SignatureKind::Train => (vec![matrix("x"), matrix("y")], vec![vector("loss")]),
            SignatureKind::GetWeights => (vec![], vec![matrix("w"), vector("b")]),
            SignatureKind::SetWeights => {
                (vec![matrix("w"), vector("b")], vec![matrix("w"), vector("b")])
            }
            SignatureKind::Save | SignatureKind::Restore => (vec![path()], vec![status()]),
        };

        Signature {
            kind: self,
            inputs,
            outputs,
        }
    }
}

impl Display for SignatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A named entry point with a fixed tensor contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub kind: SignatureKind,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl Signature {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |specs: &[TensorSpec]| {
            specs
                .iter()
                .map(TensorSpec::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };

        write!(
            f,
            "{}({}) -> ({})",
            self.name(),
            list(&self.inputs),
            list(&self.outputs)
        )
    }
}

/// The set of entry points one artifact exposes.
///
/// Immutable once built; the converter lowers exactly these signatures and the verifier checks
/// an artifact against them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRegistry {
    op_set: OpSet,
    signatures: BTreeMap<&'static str, Signature>,
}

impl SignatureRegistry {
    /// The registry restricted to portable operators: `infer`, `train`, `get_weights` and
    /// `set_weights`.
    pub fn builtins() -> Self {
        Self::from_kinds(
            OpSet::Builtins,
            [
                SignatureKind::Infer,
                SignatureKind::Train,
                SignatureKind::GetWeights,
                SignatureKind::SetWeights,
            ],
        )
    }

    /// The registry with checkpoint persistence: `infer`, `train`, `save` and `restore`.
    pub fn extended() -> Self {
        Self::from_kinds(
            OpSet::Extended,
            [
                SignatureKind::Infer,
                SignatureKind::Train,
                SignatureKind::Save,
                SignatureKind::Restore,
            ],
        )
    }

    pub fn for_op_set(op_set: OpSet) -> Self {
        match op_set {
            OpSet::Builtins => Self::builtins(),
            OpSet::Extended => Self::extended(),
        }
    }

    /// Creates a registry out of arbitrary entry points.
    ///
    /// # Returns
    /// The registry, or an error if an entry point needs more than `op_set` offers.
    pub fn custom<I>(op_set: OpSet, kinds: I) -> Result<Self>
    where
        I: IntoIterator<Item = SignatureKind>,
    {
        let registry = Self::from_kinds(op_set, kinds);

        for signature in registry.iter() {
            if !fits(signature.kind.required_op_set(), op_set) {
                return Err(GraphErr::InvalidGraph(format!(
                    "signature {} needs the {} operator set, the registry targets {op_set}",
                    signature.name(),
                    signature.kind.required_op_set()
                )));
            }
        }

        Ok(registry)
    }

    pub fn op_set(&self) -> OpSet {
        self.op_set
    }

    pub fn get(&self, name: &str) -> Option<&Signature> {
        self.signatures.get(name)
    }

    pub fn contains(&self, kind: SignatureKind) -> bool {
        self.signatures.contains_key(kind.name())
    }

    pub fn names(&self) -> BTreeSet<&'static str> {
        self.signatures.keys().copied().collect()
    }

    /// Iterates the signatures in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.signatures.values()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    fn from_kinds<I>(op_set: OpSet, kinds: I) -> Self
    where
        I: IntoIterator<Item = SignatureKind>,
    {
        let signatures = kinds
            .into_iter()
            .map(|kind| (kind.name(), kind.signature()))
            .collect();

        Self { op_set, signatures }
    }
}

fn fits(required: OpSet, available: OpSet) -> bool {
    required == OpSet::Builtins || available == OpSet::Extended
}
