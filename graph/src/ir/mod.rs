mod builder;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};

use crate::{
    GraphErr, Result,
    tensor::{DType, TensorSpec, TensorType, TensorValue},
};

pub use builder::{Effect, FunctionBuilder};

/// The id of a node inside a `Function`, which is also its position in `Function::nodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub usize);

impl Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// The id of a variable, its position in the variable declarations of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub usize);

/// An operator vocabulary a graph can be lowered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpSet {
    /// Portable operators only.
    Builtins,
    /// Builtins plus the checkpoint primitives.
    Extended,
}

impl OpSet {
    /// Returns whether `op` is part of this vocabulary.
    pub fn supports(self, op: &Op) -> bool {
        match self {
            OpSet::Extended => true,
            OpSet::Builtins => !matches!(op, Op::SaveV2 { .. } | Op::RestoreV2 { .. }),
        }
    }
}

impl Display for OpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpSet::Builtins => f.write_str("builtins"),
            OpSet::Extended => f.write_str("extended"),
        }
    }
}

/// A graph operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// The `index`-th signature input.
    Input { index: usize },
    Const(TensorValue),
    ReadVariable(VarId),
    /// Writes its single input into the variable. Has no data output.
    AssignVariable(VarId),
    MatMul,
    Transpose,
    Add,
    Sub,
    Mul,
    Square,
    /// Mean over every element, producing a rank-0 value.
    Mean,
    /// Sums a value down to `shape`, the inverse of a broadcast.
    SumTo { shape: Vec<usize> },
    BroadcastTo { shape: Vec<usize> },
    Reshape { shape: Vec<usize> },
    Identity,
    /// Persists its inputs `[prefix, tensors...]` as a checkpoint. Has no data output.
    SaveV2 { tensor_names: Vec<String> },
    /// Reads tensor `index` of a checkpoint holding exactly `tensor_names`, flattened to
    /// `numel` elements.
    RestoreV2 {
        tensor_names: Vec<String>,
        index: usize,
        dtype: DType,
        numel: usize,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "Input",
            Op::Const(_) => "Const",
            Op::ReadVariable(_) => "ReadVariable",
            Op::AssignVariable(_) => "AssignVariable",
            Op::MatMul => "MatMul",
            Op::Transpose => "Transpose",
            Op::Add => "Add",
            Op::Sub => "Sub",
            Op::Mul => "Mul",
            Op::Square => "Square",
            Op::Mean => "Mean",
            Op::SumTo { .. } => "SumTo",
            Op::BroadcastTo { .. } => "BroadcastTo",
            Op::Reshape { .. } => "Reshape",
            Op::Identity => "Identity",
            Op::SaveV2 { .. } => "SaveV2",
            Op::RestoreV2 { .. } => "RestoreV2",
        }
    }

    /// Returns whether the op changes state outside of its outputs.
    pub fn is_stateful(&self) -> bool {
        matches!(self, Op::AssignVariable(_) | Op::SaveV2 { .. })
    }
}

/// A single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: Op,
    /// Data operands.
    pub inputs: Vec<ValueId>,
    /// Nodes that must run before this one even though none of their data flows into it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub control: Vec<ValueId>,
    /// `None` for effect-only nodes.
    pub ty: Option<TensorType>,
}

/// A traced signature: its contract plus the nodes that implement it, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    /// The node producing each output, parallel to `outputs`.
    pub results: Vec<ValueId>,
    pub nodes: Vec<Node>,
}

impl Function {
    pub fn node(&self, id: ValueId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Counts the nodes of each operator kind.
    pub fn op_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for node in &self.nodes {
            *counts.entry(node.op.name()).or_insert(0) += 1;
        }

        counts
    }

    /// Checks the function is well formed: every operand refers to an earlier node, data operands
    /// carry values, and each result matches its declared output.
    pub fn validate(&self) -> Result<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            for &id in node.inputs.iter().chain(&node.control) {
                if id.0 >= i {
                    return Err(GraphErr::InvalidGraph(format!(
                        "{}: node %{i} ({}) uses {id} before it is defined",
                        self.name,
                        node.op.name()
                    )));
                }
            }

            for &id in &node.inputs {
                if self.nodes[id.0].ty.is_none() {
                    return Err(GraphErr::InvalidGraph(format!(
                        "{}: node %{i} ({}) reads data from effect {id}",
                        self.name,
                        node.op.name()
                    )));
                }
            }
        }

        if self.results.len() != self.outputs.len() {
            return Err(GraphErr::InvalidGraph(format!(
                "{}: {} results for {} declared outputs",
                self.name,
                self.results.len(),
                self.outputs.len()
            )));
        }

        for (spec, id) in self.outputs.iter().zip(&self.results) {
            let ty = self.node(*id).and_then(|node| node.ty.as_ref());
            if ty != Some(&spec.ty()) {
                return Err(GraphErr::InvalidGraph(format!(
                    "{}: output {} is not produced as {}",
                    self.name,
                    spec.name,
                    spec.ty()
                )));
            }
        }

        Ok(())
    }
}

/// A variable and the value it holds when a program is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    pub initial: TensorValue,
}

impl VariableDecl {
    pub fn ty(&self) -> TensorType {
        self.initial.ty()
    }
}

/// A traced model: its variables and one function per signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub variables: Vec<VariableDecl>,
    pub functions: BTreeMap<String, Function>,
}
