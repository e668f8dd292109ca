use std::collections::BTreeMap;

use log::info;
use ndarray::{Array1, Array2};

use crate::{
    GraphErr, Result,
    autodiff,
    exec::{VariableStore, execute},
    ir::{Function, FunctionBuilder, Module, ValueId, VarId, VariableDecl},
    signature::{SignatureKind, SignatureRegistry},
    tensor::{DType, TensorType, TensorValue},
};

pub const WEIGHT: &str = "weight";
pub const BIAS: &str = "bias";
pub const DEFAULT_LEARNING_RATE: f32 = 0.01;

/// A single-input linear regression unit, `output = x · weight + bias`.
///
/// Every entry point is defined once as a graph. Calls made directly on the model run those
/// graphs against the model's own parameters, the same graphs `trace_registry` hands to the
/// converter.
#[derive(Debug, Clone)]
pub struct LinearModel {
    variables: Vec<VariableDecl>,
    state: VariableStore,
    learning_rate: f32,
    traced: BTreeMap<SignatureKind, Function>,
}

impl Default for LinearModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearModel {
    /// Creates a new `LinearModel` with zeroed parameters and the default learning rate.
    pub fn new() -> Self {
        Self::with_learning_rate(DEFAULT_LEARNING_RATE)
    }

    pub fn with_learning_rate(learning_rate: f32) -> Self {
        let variables = vec![
            VariableDecl {
                name: WEIGHT.into(),
                initial: TensorValue::zeros(&TensorType::f32([1, 1])),
            },
            VariableDecl {
                name: BIAS.into(),
                initial: TensorValue::zeros(&TensorType::f32([1])),
            },
        ];

        Self {
            state: VariableStore::new(&variables),
            variables,
            learning_rate,
            traced: BTreeMap::new(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Returns the parameters with their current values.
    pub fn variables(&self) -> Vec<VariableDecl> {
        self.state.snapshot()
    }

    /// Builds the graph of an entry point.
    ///
    /// # Arguments
    /// * `kind` - The entry point to build.
    ///
    /// # Returns
    /// A function satisfying `kind.signature()`, with every write threaded into its outputs.
    pub fn trace(&self, kind: SignatureKind) -> Result<Function> {
        let signature = kind.signature();
        let mut b = FunctionBuilder::new(&signature, &self.variables);

        let results = match kind {
            SignatureKind::Infer => self.trace_infer(&mut b)?,
            SignatureKind::Train => self.trace_train(&mut b)?,
            SignatureKind::GetWeights => self.trace_get_weights(&mut b)?,
            SignatureKind::SetWeights => self.trace_set_weights(&mut b)?,
            SignatureKind::Save => self.trace_save(&mut b)?,
            SignatureKind::Restore => self.trace_restore(&mut b)?,
        };

        b.finish(results)
    }

    /// Builds every entry point of `registry`.
    ///
    /// # Returns
    /// A module whose variables start at the model's current parameter values.
    pub fn trace_registry(&self, registry: &SignatureRegistry) -> Result<Module> {
        let functions = registry
            .iter()
            .map(|signature| Ok((signature.name().to_string(), self.trace(signature.kind)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        info!(
            "traced {} signature(s): {}",
            functions.len(),
            functions.keys().cloned().collect::<Vec<_>>().join(", ")
        );

        Ok(Module {
            variables: self.variables(),
            functions,
        })
    }

    pub fn infer(&mut self, x: &Array2<f32>) -> Result<Array2<f32>> {
        let mut out = self.call(SignatureKind::Infer, [("x", matrix(x))])?;
        take(&mut out, "output")?.into_array2()
    }

    /// Runs one gradient descent step on a single example.
    ///
    /// # Returns
    /// The loss before the update.
    pub fn train(&mut self, x: &Array2<f32>, y: &Array2<f32>) -> Result<Array1<f32>> {
        let mut out = self.call(SignatureKind::Train, [("x", matrix(x)), ("y", matrix(y))])?;
        take(&mut out, "loss")?.into_array1()
    }

    pub fn get_weights(&mut self) -> Result<(Array2<f32>, Array1<f32>)> {
        let mut out = self.call(SignatureKind::GetWeights, [])?;
        weights(&mut out)
    }

    /// Overwrites both parameters.
    ///
    /// # Returns
    /// The values just written.
    pub fn set_weights(&mut self, w: &Array2<f32>, b: &Array1<f32>) -> Result<(Array2<f32>, Array1<f32>)> {
        let b = TensorValue::F32(b.clone().into_dyn());
        let mut out = self.call(SignatureKind::SetWeights, [("w", matrix(w)), ("b", b)])?;
        weights(&mut out)
    }

    /// Persists both parameters as a checkpoint at `prefix`.
    ///
    /// # Returns
    /// The status code, `0` on success.
    pub fn save(&mut self, prefix: &str) -> Result<i32> {
        let mut out = self.call(SignatureKind::Save, [("checkpoint_path", TensorValue::string(prefix))])?;
        status(&mut out)
    }

    /// Loads both parameters out of the checkpoint at `prefix`. On failure the parameters keep
    /// their current values.
    ///
    /// # Returns
    /// The status code, `0` on success.
    pub fn restore(&mut self, prefix: &str) -> Result<i32> {
        let mut out = self.call(
            SignatureKind::Restore,
            [("checkpoint_path", TensorValue::string(prefix))],
        )?;
        status(&mut out)
    }

    fn call<const N: usize>(
        &mut self,
        kind: SignatureKind,
        inputs: [(&str, TensorValue); N],
    ) -> Result<BTreeMap<String, TensorValue>> {
        if !self.traced.contains_key(&kind) {
            let function = self.trace(kind)?;
            self.traced.insert(kind, function);
        }

        let inputs: BTreeMap<String, TensorValue> = inputs
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();

        let function = &self.traced[&kind];
        execute(function, &mut self.state, &inputs)
    }

    /// Emits `x · weight + bias`.
    ///
    /// # Returns
    /// The prediction along with the parameter reads it was computed from.
    fn forward(&self, b: &mut FunctionBuilder<'_>, x: ValueId) -> Result<(ValueId, ValueId, ValueId)> {
        let (w, bias) = (b.variable(WEIGHT)?, b.variable(BIAS)?);
        let weight = b.read(w)?;
        let bias = b.read(bias)?;
        let xw = b.matmul(x, weight)?;
        let pred = b.add(xw, bias)?;
        Ok((pred, weight, bias))
    }

    fn trace_infer(&self, b: &mut FunctionBuilder<'_>) -> Result<Vec<ValueId>> {
        let x = b.input(0)?;
        let (pred, _, _) = self.forward(b, x)?;
        Ok(vec![pred])
    }

    fn trace_train(&self, b: &mut FunctionBuilder<'_>) -> Result<Vec<ValueId>> {
        let x = b.input(0)?;
        let y = b.input(1)?;
        let (pred, weight, bias) = self.forward(b, x)?;

        let diff = b.sub(pred, y)?;
        let sq = b.square(diff)?;
        let loss = b.mean(sq)?;

        let grads = autodiff::gradients(b, loss, &[weight, bias])?;
        let lr = b.constant(TensorValue::scalar(self.learning_rate));

        let mut writes = Vec::with_capacity(grads.len());
        for ((name, current), grad) in [(WEIGHT, weight), (BIAS, bias)].into_iter().zip(grads) {
            let step = b.mul(grad, lr)?;
            let updated = b.sub(current, step)?;
            let var = b.variable(name)?;
            writes.push(b.assign(var, updated)?);
        }

        let loss = b.reshape(loss, &[1])?;
        Ok(vec![b.with_control(loss, &writes)?])
    }

    fn trace_get_weights(&self, b: &mut FunctionBuilder<'_>) -> Result<Vec<ValueId>> {
        let (w, bias) = (b.variable(WEIGHT)?, b.variable(BIAS)?);
        Ok(vec![b.read(w)?, b.read(bias)?])
    }

    /// The written values are read back after the writes so the writes have a consumer.
    fn trace_set_weights(&self, b: &mut FunctionBuilder<'_>) -> Result<Vec<ValueId>> {
        let vars = [b.variable(WEIGHT)?, b.variable(BIAS)?];

        let mut writes = Vec::with_capacity(vars.len());
        for (index, var) in vars.into_iter().enumerate() {
            let value = b.input(index)?;
            writes.push(b.assign(var, value)?);
        }

        vars.into_iter()
            .map(|var| b.read_after(var, &writes))
            .collect()
    }

    fn trace_save(&self, b: &mut FunctionBuilder<'_>) -> Result<Vec<ValueId>> {
        let path = b.input(0)?;
        let prefix = b.reshape(path, &[])?;

        let names = self.names();
        let mut reads = Vec::with_capacity(names.len());
        for &name in &names {
            let var = b.variable(name)?;
            reads.push(b.read(var)?);
        }

        let saved = b.save(prefix, &names, &reads)?;
        let status = b.constant(ok_status());
        Ok(vec![b.with_control(status, &[saved])?])
    }

    /// Every tensor is read out of the checkpoint before any parameter is written.
    fn trace_restore(&self, b: &mut FunctionBuilder<'_>) -> Result<Vec<ValueId>> {
        let path = b.input(0)?;
        let prefix = b.reshape(path, &[])?;

        let names = self.names();
        let mut restored = Vec::with_capacity(names.len());
        for (index, decl) in self.variables.iter().enumerate() {
            let ty = decl.ty();
            let flat = b.restore(prefix, &names, index, ty.dtype, ty.numel())?;
            restored.push((VarId(index), b.reshape(flat, &ty.shape)?));
        }

        let mut writes = Vec::with_capacity(restored.len());
        for (var, value) in restored {
            writes.push(b.assign(var, value)?);
        }

        let status = b.constant(ok_status());
        Ok(vec![b.with_control(status, &writes)?])
    }

    fn names(&self) -> Vec<&str> {
        self.variables.iter().map(|decl| decl.name.as_str()).collect()
    }
}

fn matrix(x: &Array2<f32>) -> TensorValue {
    TensorValue::F32(x.clone().into_dyn())
}

fn ok_status() -> TensorValue {
    TensorValue::zeros(&TensorType::new(DType::I32, [1]))
}

fn take(out: &mut BTreeMap<String, TensorValue>, name: &str) -> Result<TensorValue> {
    out.remove(name)
        .ok_or_else(|| GraphErr::InvalidGraph(format!("missing output {name}")))
}

fn weights(out: &mut BTreeMap<String, TensorValue>) -> Result<(Array2<f32>, Array1<f32>)> {
    let w = take(out, "w")?.into_array2()?;
    let b = take(out, "b")?.into_array1()?;
    Ok((w, b))
}

fn status(out: &mut BTreeMap<String, TensorValue>) -> Result<i32> {
    let status = take(out, "status")?;
    let code = status.as_i32()?.iter().next().copied();

    code.ok_or_else(|| GraphErr::DTypeMismatch {
        what: "status".into(),
        got: status.dtype(),
        expected: DType::I32,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};

    use super::*;

    fn prefix(dir: &tempfile::TempDir) -> String {
        dir.path().join("model").to_string_lossy().into_owned()
    }

    #[test]
    fn zeroed_model_predicts_zero() {
        let mut model = LinearModel::new();
        let out = model.infer(&arr2(&[[1.0]])).unwrap();
        assert_eq!(out, arr2(&[[0.0]]));
    }

    #[test]
    fn first_step_reports_pre_update_loss() {
        let mut model = LinearModel::new();
        let loss = model.train(&arr2(&[[1.0]]), &arr2(&[[2.0]])).unwrap();
        assert_eq!(loss, arr1(&[4.0]));

        // grad = 2 * (0 - 2) = -4 for both parameters, so one step moves each by 0.04.
        let (w, b) = model.get_weights().unwrap();
        assert!((w[[0, 0]] - 0.04).abs() < 1e-6);
        assert!((b[0] - 0.04).abs() < 1e-6);
    }

    #[test]
    fn repeated_training_converges_monotonically() {
        let mut model = LinearModel::new();
        let (x, y) = (arr2(&[[1.0]]), arr2(&[[2.0]]));

        let mut last_loss = f32::INFINITY;
        let mut last_pred = 0.0;
        for _ in 0..50 {
            let loss = model.train(&x, &y).unwrap()[0];
            assert!(loss <= last_loss);
            last_loss = loss;

            let pred = model.infer(&x).unwrap()[[0, 0]];
            assert!(pred > last_pred && pred < 2.0);
            last_pred = pred;
        }

        assert!(last_pred > 0.5);
    }

    #[test]
    fn custom_learning_rate_changes_the_step() {
        let mut model = LinearModel::with_learning_rate(0.1);
        model.train(&arr2(&[[1.0]]), &arr2(&[[2.0]])).unwrap();

        let (w, _) = model.get_weights().unwrap();
        assert!((w[[0, 0]] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn set_weights_returns_and_keeps_values() {
        let mut model = LinearModel::new();
        let (w, b) = model.set_weights(&arr2(&[[3.0]]), &arr1(&[-1.0])).unwrap();
        assert_eq!((w, b), (arr2(&[[3.0]]), arr1(&[-1.0])));

        let out = model.infer(&arr2(&[[2.0]])).unwrap();
        assert_eq!(out, arr2(&[[5.0]]));
    }

    #[test]
    fn save_then_restore_brings_back_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = prefix(&dir);
        let mut model = LinearModel::new();

        model.set_weights(&arr2(&[[0.75]]), &arr1(&[-0.5])).unwrap();
        assert_eq!(model.save(&path).unwrap(), 0);

        model.set_weights(&arr2(&[[0.0]]), &arr1(&[0.0])).unwrap();
        assert_eq!(model.restore(&path).unwrap(), 0);

        let (w, b) = model.get_weights().unwrap();
        assert_eq!((w, b), (arr2(&[[0.75]]), arr1(&[-0.5])));
    }

    #[test]
    fn failed_restore_keeps_current_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = LinearModel::new();
        model.set_weights(&arr2(&[[1.5]]), &arr1(&[2.5])).unwrap();

        let err = model.restore(&prefix(&dir)).unwrap_err();
        assert!(matches!(err, GraphErr::Checkpoint(_)));

        let (w, b) = model.get_weights().unwrap();
        assert_eq!((w, b), (arr2(&[[1.5]]), arr1(&[2.5])));
    }

    #[test]
    fn wrong_input_shape_does_not_touch_state() {
        let mut model = LinearModel::new();
        model.set_weights(&arr2(&[[1.0]]), &arr1(&[1.0])).unwrap();

        let err = model.train(&arr2(&[[1.0, 2.0]]), &arr2(&[[2.0]])).unwrap_err();
        assert!(matches!(err, GraphErr::ShapeMismatch { .. }));

        let (w, b) = model.get_weights().unwrap();
        assert_eq!((w, b), (arr2(&[[1.0]]), arr1(&[1.0])));
    }

    #[test]
    fn traced_writes_are_threaded_into_outputs() {
        let model = LinearModel::new();
        for kind in [SignatureKind::Train, SignatureKind::SetWeights, SignatureKind::Save, SignatureKind::Restore] {
            let function = model.trace(kind).unwrap();
            function.validate().unwrap();

            let stateful: Vec<usize> = function
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| node.op.is_stateful())
                .map(|(i, _)| i)
                .collect();
            assert!(!stateful.is_empty(), "{kind} has no writes");

            let threaded = function
                .nodes
                .iter()
                .flat_map(|node| &node.control)
                .filter(|id| stateful.contains(&id.0))
                .count();
            assert!(threaded >= stateful.len(), "{kind} leaves a write unthreaded");
        }
    }

    #[test]
    fn registry_module_holds_current_weights() {
        let mut model = LinearModel::new();
        model.set_weights(&arr2(&[[2.0]]), &arr1(&[1.0])).unwrap();

        let module = model.trace_registry(&SignatureRegistry::builtins()).unwrap();
        assert_eq!(module.functions.len(), 4);
        assert_eq!(module.variables[0].name, WEIGHT);
        assert_eq!(module.variables[0].initial.first_f32().unwrap(), 2.0);
    }
}
