use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use checkpoint::{Tensor, TensorData};
use log::debug;
use ndarray::{ArrayD, Axis, Ix2, IxDyn};

use crate::{
    GraphErr, Result,
    ir::{Function, Node, Op, VarId, VariableDecl},
    tensor::{DType, TensorValue, broadcast_shape},
};

/// The current value of every variable of a program.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableStore {
    names: Vec<String>,
    values: Vec<TensorValue>,
}

impl VariableStore {
    /// Creates a new `VariableStore` holding the initial value of each declaration.
    pub fn new(decls: &[VariableDecl]) -> Self {
        Self {
            names: decls.iter().map(|decl| decl.name.clone()).collect(),
            values: decls.iter().map(|decl| decl.initial.clone()).collect(),
        }
    }

    pub fn get(&self, var: VarId) -> Result<&TensorValue> {
        self.values
            .get(var.0)
            .ok_or_else(|| GraphErr::InvalidGraph(format!("unknown variable #{}", var.0)))
    }

    pub fn get_by_name(&self, name: &str) -> Option<&TensorValue> {
        let i = self.names.iter().position(|n| n == name)?;
        self.values.get(i)
    }

    /// Overwrites a variable, the new value must have the type of the old one.
    pub fn set(&mut self, var: VarId, value: TensorValue) -> Result<()> {
        let name = self
            .names
            .get(var.0)
            .ok_or_else(|| GraphErr::InvalidGraph(format!("unknown variable #{}", var.0)))?;

        let current = &self.values[var.0];
        if current.dtype() != value.dtype() {
            return Err(GraphErr::DTypeMismatch {
                what: name.clone(),
                got: value.dtype(),
                expected: current.dtype(),
            });
        }

        if current.shape() != value.shape() {
            return Err(GraphErr::ShapeMismatch {
                what: name.clone(),
                got: value.shape().to_vec(),
                expected: current.shape().to_vec(),
            });
        }

        self.values[var.0] = value;
        Ok(())
    }

    /// Returns the variables as declarations, their current values becoming the initial ones.
    pub fn snapshot(&self) -> Vec<VariableDecl> {
        self.iter()
            .map(|(name, value)| VariableDecl {
                name: name.to_string(),
                initial: value.clone(),
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorValue)> {
        self.names.iter().map(String::as_str).zip(&self.values)
    }
}

/// Runs a function once.
///
/// Variable writes are staged and only committed to `state` if the whole call succeeds, so a
/// failing call leaves every variable untouched. Checkpoint files written before the failure
/// are not rolled back.
///
/// # Arguments
/// * `function` - The function to run.
/// * `state` - The variables the function reads and writes.
/// * `inputs` - One value per declared input, keyed by input name.
///
/// # Returns
/// One value per declared output, keyed by output name.
pub fn execute(
    function: &Function,
    state: &mut VariableStore,
    inputs: &BTreeMap<String, TensorValue>,
) -> Result<BTreeMap<String, TensorValue>> {
    let args = bind_inputs(function, inputs)?;

    debug!(signature = function.name.as_str(); "executing {} node(s)", function.nodes.len());

    let mut frame = Frame {
        args,
        staged: state.clone(),
        checkpoints: BTreeMap::new(),
    };

    let mut values: Vec<Option<TensorValue>> = Vec::with_capacity(function.nodes.len());
    for node in &function.nodes {
        let operands = node
            .inputs
            .iter()
            .map(|id| {
                values
                    .get(id.0)
                    .and_then(Option::as_ref)
                    .ok_or_else(|| GraphErr::InvalidGraph(format!("{id} has no value")))
            })
            .collect::<Result<Vec<_>>>()?;

        let value = frame.eval(node, &operands)?;
        values.push(value);
    }

    let mut outputs = BTreeMap::new();
    for (spec, id) in function.outputs.iter().zip(&function.results) {
        let value = values
            .get(id.0)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or_else(|| GraphErr::InvalidGraph(format!("output {} has no value", spec.name)))?;

        value.check(spec)?;
        outputs.insert(spec.name.clone(), value);
    }

    *state = frame.staged;
    Ok(outputs)
}

/// Orders the caller's inputs by declaration, rejecting unknown, missing and mistyped ones.
fn bind_inputs(function: &Function, inputs: &BTreeMap<String, TensorValue>) -> Result<Vec<TensorValue>> {
    if let Some(name) = inputs
        .keys()
        .find(|name| !function.inputs.iter().any(|spec| &spec.name == *name))
    {
        return Err(GraphErr::UnexpectedInput {
            signature: function.name.clone(),
            input: name.clone(),
        });
    }

    function
        .inputs
        .iter()
        .map(|spec| {
            let value = inputs.get(&spec.name).ok_or_else(|| GraphErr::MissingInput {
                signature: function.name.clone(),
                input: spec.name.clone(),
            })?;

            value.check(spec)?;
            Ok(value.clone())
        })
        .collect()
}

/// The mutable state of a single call.
struct Frame {
    args: Vec<TensorValue>,
    staged: VariableStore,
    /// Checkpoints read during this call, so every tensor of one restore comes from the same
    /// pair of files.
    checkpoints: BTreeMap<PathBuf, BTreeMap<String, Tensor>>,
}

impl Frame {
    /// Evaluates a node.
    ///
    /// # Returns
    /// The node's value, `None` for effect-only nodes.
    fn eval(&mut self, node: &Node, operands: &[&TensorValue]) -> Result<Option<TensorValue>> {
        let value = match &node.op {
            Op::Input { index } => self
                .args
                .get(*index)
                .cloned()
                .ok_or_else(|| GraphErr::InvalidGraph(format!("no input #{index}")))?,
            Op::Const(value) => value.clone(),
            Op::ReadVariable(var) => self.staged.get(*var)?.clone(),
            Op::AssignVariable(var) => {
                let [value] = operands else {
                    return Err(arity_err(node));
                };

                self.staged.set(*var, (*value).clone())?;
                return Ok(None);
            }
            Op::MatMul => {
                let [a, b] = operands else {
                    return Err(arity_err(node));
                };

                TensorValue::F32(matmul(a.as_f32()?, b.as_f32()?)?)
            }
            Op::Transpose => {
                let [a] = operands else {
                    return Err(arity_err(node));
                };

                TensorValue::F32(a.as_f32()?.t().as_standard_layout().into_owned())
            }
            Op::Add | Op::Sub | Op::Mul => {
                let [a, b] = operands else {
                    return Err(arity_err(node));
                };

                elementwise(&node.op, a, b)?
            }
            Op::Square => {
                let [a] = operands else {
                    return Err(arity_err(node));
                };

                TensorValue::F32(a.as_f32()?.mapv(|v| v * v))
            }
            Op::Mean => {
                let [a] = operands else {
                    return Err(arity_err(node));
                };

                let a = a.as_f32()?;
                let mean = a.mean().ok_or_else(|| GraphErr::ShapeMismatch {
                    what: "Mean".into(),
                    got: a.shape().to_vec(),
                    expected: vec![1],
                })?;
                TensorValue::scalar(mean)
            }
            Op::SumTo { shape } => {
                let [a] = operands else {
                    return Err(arity_err(node));
                };

                TensorValue::F32(sum_to(a.as_f32()?, shape)?)
            }
            Op::BroadcastTo { shape } => {
                let [a] = operands else {
                    return Err(arity_err(node));
                };

                broadcast_to(a, shape)?
            }
            Op::Reshape { shape } => {
                let [a] = operands else {
                    return Err(arity_err(node));
                };

                a.reshape(shape)?
            }
            Op::Identity => {
                let [a] = operands else {
                    return Err(arity_err(node));
                };

                (*a).clone()
            }
            Op::SaveV2 { tensor_names } => {
                let [prefix, tensors @ ..] = operands else {
                    return Err(arity_err(node));
                };

                self.save(&prefix_path(prefix)?, tensor_names, tensors)?;
                return Ok(None);
            }
            Op::RestoreV2 {
                tensor_names,
                index,
                dtype,
                numel,
            } => {
                let [prefix] = operands else {
                    return Err(arity_err(node));
                };

                self.restore(&prefix_path(prefix)?, tensor_names, *index, *dtype, *numel)?
            }
        };

        Ok(Some(value))
    }

    fn save(&mut self, prefix: &Path, names: &[String], tensors: &[&TensorValue]) -> Result<()> {
        if names.len() != tensors.len() {
            return Err(GraphErr::InvalidGraph(format!(
                "SaveV2 got {} names for {} tensors",
                names.len(),
                tensors.len()
            )));
        }

        let record = names
            .iter()
            .zip(tensors)
            .map(|(name, value)| Ok((name.clone(), to_checkpoint(name, value)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        checkpoint::write(prefix, &record)?;
        self.checkpoints.remove(prefix);
        Ok(())
    }

    fn restore(
        &mut self,
        prefix: &Path,
        names: &[String],
        index: usize,
        dtype: DType,
        numel: usize,
    ) -> Result<TensorValue> {
        let tensors = match self.checkpoints.get(prefix) {
            Some(tensors) => tensors.clone(),
            None => {
                let tensors = checkpoint::read(prefix)?;
                self.checkpoints.insert(prefix.to_path_buf(), tensors.clone());
                tensors
            }
        };

        let tensor = checkpoint::select(tensors, names)?
            .into_iter()
            .nth(index)
            .ok_or_else(|| GraphErr::InvalidGraph(format!("RestoreV2 has no tensor #{index}")))?;

        let name = &names[index];
        let (_, data) = tensor.into_parts();
        if data.len() != numel {
            return Err(checkpoint::CheckpointErr::LengthMismatch {
                what: format!("tensor {name}"),
                got: data.len(),
                expected: numel,
            }
            .into());
        }

        let value = match data {
            TensorData::F32(values) => TensorValue::f32(&[numel], values)?,
            TensorData::I32(values) => TensorValue::i32(&[numel], values)?,
        };

        if value.dtype() != dtype {
            return Err(GraphErr::DTypeMismatch {
                what: format!("restored tensor {name}"),
                got: value.dtype(),
                expected: dtype,
            });
        }

        Ok(value)
    }
}

fn matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let a2 = a
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| rank_err("MatMul lhs", a.shape()))?;
    let b2 = b
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| rank_err("MatMul rhs", b.shape()))?;

    if a2.ncols() != b2.nrows() {
        return Err(GraphErr::ShapeMismatch {
            what: "MatMul rhs".into(),
            got: b.shape().to_vec(),
            expected: vec![a2.ncols(), b2.ncols()],
        });
    }

    Ok(a2.dot(&b2).into_dyn())
}

fn elementwise(op: &Op, a: &TensorValue, b: &TensorValue) -> Result<TensorValue> {
    if broadcast_shape(a.shape(), b.shape()).is_none() {
        return Err(GraphErr::ShapeMismatch {
            what: format!("{} operands", op.name()),
            got: b.shape().to_vec(),
            expected: a.shape().to_vec(),
        });
    }

    let value = match (a, b) {
        (TensorValue::F32(a), TensorValue::F32(b)) => TensorValue::F32(match op {
            Op::Add => a + b,
            Op::Sub => a - b,
            _ => a * b,
        }),
        (TensorValue::I32(a), TensorValue::I32(b)) => TensorValue::I32(match op {
            Op::Add => a + b,
            Op::Sub => a - b,
            _ => a * b,
        }),
        _ => {
            return Err(GraphErr::DTypeMismatch {
                what: format!("{} operands", op.name()),
                got: b.dtype(),
                expected: a.dtype(),
            });
        }
    };

    Ok(value)
}

/// Sums `a` down to `shape` by adding up the leading axes it lacks and the axes it has at
/// size 1.
fn sum_to(a: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    let mismatch = || GraphErr::ShapeMismatch {
        what: "SumTo".into(),
        got: a.shape().to_vec(),
        expected: shape.to_vec(),
    };

    if a.ndim() < shape.len() {
        return Err(mismatch());
    }

    let mut out = a.clone();
    while out.ndim() > shape.len() {
        out = out.sum_axis(Axis(0));
    }

    for (axis, &dim) in shape.iter().enumerate() {
        if dim == 1 && out.shape()[axis] != 1 {
            out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }

    if out.shape() != shape {
        return Err(mismatch());
    }

    Ok(out)
}

fn broadcast_to(a: &TensorValue, shape: &[usize]) -> Result<TensorValue> {
    let mismatch = || GraphErr::ShapeMismatch {
        what: "BroadcastTo".into(),
        got: a.shape().to_vec(),
        expected: shape.to_vec(),
    };

    let dim = IxDyn(shape);
    let value = match a {
        TensorValue::F32(a) => TensorValue::F32(a.broadcast(dim).ok_or_else(mismatch)?.to_owned()),
        TensorValue::I32(a) => TensorValue::I32(a.broadcast(dim).ok_or_else(mismatch)?.to_owned()),
        TensorValue::String(a) => {
            TensorValue::String(a.broadcast(dim).ok_or_else(mismatch)?.to_owned())
        }
    };

    Ok(value)
}

fn prefix_path(prefix: &TensorValue) -> Result<PathBuf> {
    let path = prefix
        .as_strings()?
        .iter()
        .next()
        .ok_or_else(|| GraphErr::ShapeMismatch {
            what: "checkpoint prefix".into(),
            got: prefix.shape().to_vec(),
            expected: vec![],
        })?;

    Ok(PathBuf::from(path))
}

fn to_checkpoint(name: &str, value: &TensorValue) -> Result<Tensor> {
    let shape = value.shape().to_vec();
    let data = match value {
        TensorValue::F32(a) => TensorData::F32(a.iter().copied().collect()),
        TensorValue::I32(a) => TensorData::I32(a.iter().copied().collect()),
        TensorValue::String(_) => {
            return Err(GraphErr::DTypeMismatch {
                what: format!("checkpoint tensor {name}"),
                got: DType::String,
                expected: DType::F32,
            });
        }
    };

    Ok(Tensor::new(shape, data)?)
}

fn rank_err(what: &str, shape: &[usize]) -> GraphErr {
    GraphErr::ShapeMismatch {
        what: what.to_string(),
        got: shape.to_vec(),
        expected: vec![1, 1],
    }
}

fn arity_err(node: &Node) -> GraphErr {
    GraphErr::InvalidGraph(format!(
        "{} got {} operand(s)",
        node.op.name(),
        node.inputs.len()
    ))
}
