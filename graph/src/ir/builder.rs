use super::{Function, Node, Op, ValueId, VarId, VariableDecl};
use crate::{
    GraphErr, Result,
    signature::Signature,
    tensor::{DType, TensorType, TensorValue, broadcast_shape},
};

/// The handle of a node that only has side effects.
///
/// It can't be used as a data operand, only threaded into a later value as a control
/// dependency with `FunctionBuilder::with_control` or `FunctionBuilder::read_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effect(ValueId);

impl Effect {
    pub fn id(self) -> ValueId {
        self.0
    }
}

/// Builds a `Function` for a signature, inferring the type of every node as it is added.
pub struct FunctionBuilder<'v> {
    signature: Signature,
    variables: &'v [VariableDecl],
    nodes: Vec<Node>,
}

impl<'v> FunctionBuilder<'v> {
    /// Creates a new `FunctionBuilder` with one `Input` node per signature input.
    ///
    /// # Arguments
    /// * `signature` - The contract the built function must satisfy.
    /// * `variables` - The variables the function may read and write.
    pub fn new(signature: &Signature, variables: &'v [VariableDecl]) -> Self {
        let nodes = signature
            .inputs
            .iter()
            .enumerate()
            .map(|(index, spec)| Node {
                op: Op::Input { index },
                inputs: vec![],
                control: vec![],
                ty: Some(spec.ty()),
            })
            .collect();

        Self {
            signature: signature.clone(),
            variables,
            nodes,
        }
    }

    pub fn node(&self, id: ValueId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Returns the type of a data value.
    pub fn ty(&self, id: ValueId) -> Result<&TensorType> {
        let node = self
            .node(id)
            .ok_or_else(|| GraphErr::InvalidGraph(format!("{id} is not defined")))?;

        node.ty.as_ref().ok_or_else(|| {
            GraphErr::InvalidGraph(format!("{id} ({}) has no data output", node.op.name()))
        })
    }

    /// Returns the node of the `index`-th signature input.
    pub fn input(&self, index: usize) -> Result<ValueId> {
        if index >= self.signature.inputs.len() {
            return Err(GraphErr::InvalidGraph(format!(
                "{} has no input #{index}",
                self.signature.name()
            )));
        }

        Ok(ValueId(index))
    }

    /// Looks up a variable by name.
    pub fn variable(&self, name: &str) -> Result<VarId> {
        self.variables
            .iter()
            .position(|var| var.name == name)
            .map(VarId)
            .ok_or_else(|| GraphErr::InvalidGraph(format!("unknown variable {name}")))
    }

    pub fn constant(&mut self, value: TensorValue) -> ValueId {
        let ty = value.ty();
        self.push(Op::Const(value), vec![], Some(ty))
    }

    pub fn read(&mut self, var: VarId) -> Result<ValueId> {
        self.read_after(var, &[])
    }

    /// Reads a variable once every effect in `after` has happened.
    pub fn read_after(&mut self, var: VarId, after: &[Effect]) -> Result<ValueId> {
        let ty = self.var_decl(var)?.ty();
        let id = self.push(Op::ReadVariable(var), vec![], Some(ty));
        self.nodes[id.0].control = after.iter().map(|effect| effect.0).collect();
        Ok(id)
    }

    pub fn assign(&mut self, var: VarId, value: ValueId) -> Result<Effect> {
        let decl = self.var_decl(var)?;
        let (name, expected) = (decl.name.clone(), decl.ty());
        let got = self.ty(value)?;

        if got.dtype != expected.dtype {
            return Err(GraphErr::DTypeMismatch {
                what: format!("assignment to {name}"),
                got: got.dtype,
                expected: expected.dtype,
            });
        }

        if got.shape != expected.shape {
            return Err(GraphErr::ShapeMismatch {
                what: format!("assignment to {name}"),
                got: got.shape.clone(),
                expected: expected.shape,
            });
        }

        let id = self.push(Op::AssignVariable(var), vec![value], None);
        Ok(Effect(id))
    }

    pub fn matmul(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        let ta = self.float(a, "MatMul lhs")?;
        let tb = self.float(b, "MatMul rhs")?;

        match (ta.shape.as_slice(), tb.shape.as_slice()) {
            ([m, k], [k2, n]) if k == k2 => {
                let ty = TensorType::f32([*m, *n]);
                Ok(self.push(Op::MatMul, vec![a, b], Some(ty)))
            }
            _ => Err(GraphErr::ShapeMismatch {
                what: "MatMul rhs".into(),
                got: tb.shape.clone(),
                expected: vec![ta.shape.get(1).copied().unwrap_or(0), 0],
            }),
        }
    }

    pub fn transpose(&mut self, a: ValueId) -> Result<ValueId> {
        let ta = self.float(a, "Transpose")?;
        let &[m, n] = ta.shape.as_slice() else {
            return Err(GraphErr::ShapeMismatch {
                what: "Transpose".into(),
                got: ta.shape.clone(),
                expected: vec![0, 0],
            });
        };

        Ok(self.push(Op::Transpose, vec![a], Some(TensorType::f32([n, m]))))
    }

    pub fn add(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        self.binary(Op::Add, a, b)
    }

    pub fn sub(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        self.binary(Op::Sub, a, b)
    }

    pub fn mul(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        self.binary(Op::Mul, a, b)
    }

    pub fn square(&mut self, a: ValueId) -> Result<ValueId> {
        let ty = self.float(a, "Square")?;
        Ok(self.push(Op::Square, vec![a], Some(ty)))
    }

    pub fn mean(&mut self, a: ValueId) -> Result<ValueId> {
        let ty = self.float(a, "Mean")?;
        if ty.numel() == 0 {
            return Err(GraphErr::ShapeMismatch {
                what: "Mean".into(),
                got: ty.shape,
                expected: vec![1],
            });
        }

        Ok(self.push(Op::Mean, vec![a], Some(TensorType::f32(vec![]))))
    }

    /// Sums `a` down to `shape`; `a` must be a broadcast of `shape`.
    pub fn sum_to(&mut self, a: ValueId, shape: &[usize]) -> Result<ValueId> {
        let ty = self.ty(a)?.clone();
        if broadcast_shape(shape, &ty.shape).as_ref() != Some(&ty.shape) {
            return Err(GraphErr::ShapeMismatch {
                what: "SumTo".into(),
                got: ty.shape,
                expected: shape.to_vec(),
            });
        }

        let op = Op::SumTo {
            shape: shape.to_vec(),
        };
        Ok(self.push(op, vec![a], Some(TensorType::new(ty.dtype, shape))))
    }

    pub fn broadcast_to(&mut self, a: ValueId, shape: &[usize]) -> Result<ValueId> {
        let ty = self.ty(a)?.clone();
        if broadcast_shape(&ty.shape, shape).as_deref() != Some(shape) {
            return Err(GraphErr::ShapeMismatch {
                what: "BroadcastTo".into(),
                got: ty.shape,
                expected: shape.to_vec(),
            });
        }

        let op = Op::BroadcastTo {
            shape: shape.to_vec(),
        };
        Ok(self.push(op, vec![a], Some(TensorType::new(ty.dtype, shape))))
    }

    pub fn reshape(&mut self, a: ValueId, shape: &[usize]) -> Result<ValueId> {
        let ty = self.ty(a)?.clone();
        if ty.numel() != shape.iter().product::<usize>() {
            return Err(GraphErr::ShapeMismatch {
                what: "Reshape".into(),
                got: ty.shape,
                expected: shape.to_vec(),
            });
        }

        let op = Op::Reshape {
            shape: shape.to_vec(),
        };
        Ok(self.push(op, vec![a], Some(TensorType::new(ty.dtype, shape))))
    }

    pub fn identity(&mut self, a: ValueId) -> Result<ValueId> {
        self.with_control(a, &[])
    }

    /// Returns a copy of `value` that is only produced once every effect in `effects` has
    /// happened. This is what keeps otherwise unconsumed writes alive through dead-code
    /// elimination.
    pub fn with_control(&mut self, value: ValueId, effects: &[Effect]) -> Result<ValueId> {
        let ty = self.ty(value)?.clone();
        let id = self.push(Op::Identity, vec![value], Some(ty));
        self.nodes[id.0].control = effects.iter().map(|effect| effect.0).collect();
        Ok(id)
    }

    /// Persists `tensors` under `names` to the checkpoint at `prefix`.
    ///
    /// # Arguments
    /// * `prefix` - A rank-0 string with the checkpoint path prefix.
    /// * `names` - The name each tensor is stored under.
    /// * `tensors` - The values to persist, parallel to `names`.
    pub fn save(&mut self, prefix: ValueId, names: &[&str], tensors: &[ValueId]) -> Result<Effect> {
        self.check_prefix(prefix, "SaveV2")?;
        if names.len() != tensors.len() {
            return Err(GraphErr::InvalidGraph(format!(
                "SaveV2 got {} names for {} tensors",
                names.len(),
                tensors.len()
            )));
        }

        for &tensor in tensors {
            let ty = self.ty(tensor)?;
            if ty.dtype == DType::String {
                return Err(GraphErr::DTypeMismatch {
                    what: "SaveV2 tensor".into(),
                    got: ty.dtype,
                    expected: DType::F32,
                });
            }
        }

        let op = Op::SaveV2 {
            tensor_names: names.iter().map(|name| name.to_string()).collect(),
        };
        let inputs = std::iter::once(prefix).chain(tensors.iter().copied()).collect();
        let id = self.push(op, inputs, None);
        Ok(Effect(id))
    }

    /// Reads one tensor out of the checkpoint at `prefix`, flattened to `numel` elements.
    ///
    /// # Arguments
    /// * `prefix` - A rank-0 string with the checkpoint path prefix.
    /// * `names` - Every tensor name the checkpoint is expected to hold.
    /// * `index` - Which of `names` to read.
    /// * `dtype` - The expected element type.
    /// * `numel` - The expected amount of elements.
    pub fn restore(
        &mut self,
        prefix: ValueId,
        names: &[&str],
        index: usize,
        dtype: DType,
        numel: usize,
    ) -> Result<ValueId> {
        self.check_prefix(prefix, "RestoreV2")?;
        if index >= names.len() || dtype == DType::String {
            return Err(GraphErr::InvalidGraph(format!(
                "RestoreV2 can't read a {dtype} tensor #{index} out of {} names",
                names.len()
            )));
        }

        let op = Op::RestoreV2 {
            tensor_names: names.iter().map(|name| name.to_string()).collect(),
            index,
            dtype,
            numel,
        };
        Ok(self.push(op, vec![prefix], Some(TensorType::new(dtype, [numel]))))
    }

    /// Finishes the function.
    ///
    /// # Arguments
    /// * `results` - The value of each declared output, in declaration order.
    ///
    /// # Returns
    /// The built function, or an error if a result doesn't match its declared output.
    pub fn finish(self, results: Vec<ValueId>) -> Result<Function> {
        if results.len() != self.signature.outputs.len() {
            return Err(GraphErr::InvalidGraph(format!(
                "{} declares {} outputs but {} were given",
                self.signature.name(),
                self.signature.outputs.len(),
                results.len()
            )));
        }

        for (spec, &id) in self.signature.outputs.iter().zip(&results) {
            let got = self.ty(id)?;
            if got.dtype != spec.dtype {
                return Err(GraphErr::DTypeMismatch {
                    what: spec.name.clone(),
                    got: got.dtype,
                    expected: spec.dtype,
                });
            }

            if got.shape != spec.shape {
                return Err(GraphErr::ShapeMismatch {
                    what: spec.name.clone(),
                    got: got.shape.clone(),
                    expected: spec.shape.clone(),
                });
            }
        }

        Ok(Function {
            name: self.signature.name().to_string(),
            inputs: self.signature.inputs,
            outputs: self.signature.outputs,
            results,
            nodes: self.nodes,
        })
    }

    fn push(&mut self, op: Op, inputs: Vec<ValueId>, ty: Option<TensorType>) -> ValueId {
        let id = ValueId(self.nodes.len());
        self.nodes.push(Node {
            op,
            inputs,
            control: vec![],
            ty,
        });

        id
    }

    fn binary(&mut self, op: Op, a: ValueId, b: ValueId) -> Result<ValueId> {
        let what = op.name();
        let ta = self.ty(a)?.clone();
        let tb = self.ty(b)?.clone();

        if ta.dtype == DType::String || ta.dtype != tb.dtype {
            return Err(GraphErr::DTypeMismatch {
                what: format!("{what} operands"),
                got: tb.dtype,
                expected: if ta.dtype == DType::String {
                    DType::F32
                } else {
                    ta.dtype
                },
            });
        }

        let shape = broadcast_shape(&ta.shape, &tb.shape).ok_or_else(|| GraphErr::ShapeMismatch {
            what: format!("{what} operands"),
            got: tb.shape.clone(),
            expected: ta.shape.clone(),
        })?;

        Ok(self.push(op, vec![a, b], Some(TensorType::new(ta.dtype, shape))))
    }

    fn float(&self, id: ValueId, what: &str) -> Result<TensorType> {
        let ty = self.ty(id)?;
        if ty.dtype != DType::F32 {
            return Err(GraphErr::DTypeMismatch {
                what: what.to_string(),
                got: ty.dtype,
                expected: DType::F32,
            });
        }

        Ok(ty.clone())
    }

    fn check_prefix(&self, prefix: ValueId, what: &str) -> Result<()> {
        let ty = self.ty(prefix)?;
        if ty.dtype != DType::String {
            return Err(GraphErr::DTypeMismatch {
                what: format!("{what} prefix"),
                got: ty.dtype,
                expected: DType::String,
            });
        }

        if !ty.shape.is_empty() {
            return Err(GraphErr::ShapeMismatch {
                what: format!("{what} prefix"),
                got: ty.shape.clone(),
                expected: vec![],
            });
        }

        Ok(())
    }

    fn var_decl(&self, var: VarId) -> Result<&VariableDecl> {
        self.variables
            .get(var.0)
            .ok_or_else(|| GraphErr::InvalidGraph(format!("unknown variable #{}", var.0)))
    }
}
