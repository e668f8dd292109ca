//! Reverse-mode differentiation over the graph IR.
//!
//! Gradients are emitted as ordinary nodes into the same function, so the resulting graph only
//! uses operators the converter already knows how to lower.

use std::collections::BTreeMap;

use crate::{
    GraphErr, Result,
    ir::{FunctionBuilder, Node, Op, ValueId},
    tensor::{DType, TensorValue},
};

/// Appends the gradient of `loss` with respect to each value in `wrt`.
///
/// # Arguments
/// * `b` - The builder holding the forward computation.
/// * `loss` - A rank-0 float value.
/// * `wrt` - The values to differentiate with respect to, usually variable reads.
///
/// # Returns
/// One gradient per value in `wrt`, each with the same type as the value. Values `loss` doesn't
/// depend on get a zero gradient.
pub fn gradients(b: &mut FunctionBuilder<'_>, loss: ValueId, wrt: &[ValueId]) -> Result<Vec<ValueId>> {
    let loss_ty = b.ty(loss)?.clone();
    if loss_ty.dtype != DType::F32 {
        return Err(GraphErr::DTypeMismatch {
            what: "loss".into(),
            got: loss_ty.dtype,
            expected: DType::F32,
        });
    }

    if !loss_ty.shape.is_empty() {
        return Err(GraphErr::ShapeMismatch {
            what: "loss".into(),
            got: loss_ty.shape,
            expected: vec![],
        });
    }

    let mut grads: BTreeMap<ValueId, ValueId> = BTreeMap::new();
    let seed = b.constant(TensorValue::scalar(1.0));
    grads.insert(loss, seed);

    for id in (0..=loss.0).rev().map(ValueId) {
        let Some(&upstream) = grads.get(&id) else {
            continue;
        };

        let node = b
            .node(id)
            .cloned()
            .ok_or_else(|| GraphErr::InvalidGraph(format!("{id} is not defined")))?;

        for (input, grad) in backward(b, &node, upstream)? {
            let grad = match grads.get(&input) {
                Some(&acc) => b.add(acc, grad)?,
                None => grad,
            };
            grads.insert(input, grad);
        }
    }

    wrt.iter()
        .map(|&value| match grads.get(&value) {
            Some(&grad) => Ok(grad),
            None => {
                let ty = b.ty(value)?.clone();
                Ok(b.constant(TensorValue::zeros(&ty)))
            }
        })
        .collect()
}

/// Applies the gradient rule of a single node.
///
/// # Returns
/// The contribution to the gradient of each operand.
fn backward(b: &mut FunctionBuilder<'_>, node: &Node, g: ValueId) -> Result<Vec<(ValueId, ValueId)>> {
    let contributions = match &node.op {
        Op::Input { .. } | Op::Const(_) | Op::ReadVariable(_) => vec![],
        Op::Identity => {
            let x = unary(node)?;
            vec![(x, g)]
        }
        Op::Add => {
            let (lhs, rhs) = binary(node)?;
            vec![(lhs, reduce_to(b, g, lhs)?), (rhs, reduce_to(b, g, rhs)?)]
        }
        Op::Sub => {
            let (lhs, rhs) = binary(node)?;
            let minus_one = b.constant(TensorValue::scalar(-1.0));
            let neg = b.mul(g, minus_one)?;
            vec![(lhs, reduce_to(b, g, lhs)?), (rhs, reduce_to(b, neg, rhs)?)]
        }
        Op::Mul => {
            let (lhs, rhs) = binary(node)?;
            let dlhs = b.mul(g, rhs)?;
            let drhs = b.mul(g, lhs)?;
            vec![(lhs, reduce_to(b, dlhs, lhs)?), (rhs, reduce_to(b, drhs, rhs)?)]
        }
        Op::Square => {
            let x = unary(node)?;
            let two = b.constant(TensorValue::scalar(2.0));
            let gx = b.mul(g, x)?;
            vec![(x, b.mul(gx, two)?)]
        }
        Op::Mean => {
            let x = unary(node)?;
            let ty = b.ty(x)?.clone();
            let scale = b.constant(TensorValue::scalar(1.0 / ty.numel() as f32));
            let scaled = b.mul(g, scale)?;
            vec![(x, b.broadcast_to(scaled, &ty.shape)?)]
        }
        Op::MatMul => {
            let (lhs, rhs) = binary(node)?;
            let rhs_t = b.transpose(rhs)?;
            let lhs_t = b.transpose(lhs)?;
            vec![(lhs, b.matmul(g, rhs_t)?), (rhs, b.matmul(lhs_t, g)?)]
        }
        Op::Transpose => {
            let x = unary(node)?;
            vec![(x, b.transpose(g)?)]
        }
        Op::Reshape { .. } => {
            let x = unary(node)?;
            let shape = b.ty(x)?.shape.clone();
            vec![(x, b.reshape(g, &shape)?)]
        }
        Op::BroadcastTo { .. } => {
            let x = unary(node)?;
            vec![(x, reduce_to(b, g, x)?)]
        }
        Op::SumTo { .. } => {
            let x = unary(node)?;
            let shape = b.ty(x)?.shape.clone();
            vec![(x, b.broadcast_to(g, &shape)?)]
        }
        other => return Err(GraphErr::NotDifferentiable { op: other.name() }),
    };

    Ok(contributions)
}

/// Sums a gradient down to the shape of the operand it flows into, undoing a broadcast.
fn reduce_to(b: &mut FunctionBuilder<'_>, grad: ValueId, operand: ValueId) -> Result<ValueId> {
    let target = b.ty(operand)?.shape.clone();
    if b.ty(grad)?.shape == target {
        return Ok(grad);
    }

    b.sum_to(grad, &target)
}

fn unary(node: &Node) -> Result<ValueId> {
    match node.inputs[..] {
        [x] => Ok(x),
        _ => Err(arity_err(node, 1)),
    }
}

fn binary(node: &Node) -> Result<(ValueId, ValueId)> {
    match node.inputs[..] {
        [lhs, rhs] => Ok((lhs, rhs)),
        _ => Err(arity_err(node, 2)),
    }
}

fn arity_err(node: &Node, expected: usize) -> GraphErr {
    GraphErr::InvalidGraph(format!(
        "{} expects {expected} operand(s), got {}",
        node.op.name(),
        node.inputs.len()
    ))
}
