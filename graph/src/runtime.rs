use std::{collections::BTreeMap, path::Path};

use log::info;

use crate::{
    Artifact, GraphErr, Result,
    exec::{VariableStore, execute},
    ir::{Function, OpSet},
    tensor::TensorValue,
};

/// Loads an artifact and serves calls to its signatures.
///
/// Calls mutate the loaded variables, so a `Runtime` must not be shared between concurrent
/// callers without serializing their calls.
#[derive(Debug, Clone)]
pub struct Runtime {
    artifact: Artifact,
    state: VariableStore,
}

impl Runtime {
    /// Creates a new `Runtime` with every variable at its recorded initial value.
    pub fn new(artifact: Artifact) -> Result<Self> {
        artifact.validate()?;

        let state = VariableStore::new(&artifact.variables);
        Ok(Self { artifact, state })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let runtime = Self::new(Artifact::read(path)?)?;

        info!(
            "loaded {} with signatures: {}",
            path.display(),
            runtime.signature_names().join(", ")
        );

        Ok(runtime)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::new(Artifact::from_bytes(bytes)?)
    }

    pub fn op_set(&self) -> OpSet {
        self.artifact.op_set
    }

    /// Iterates the exposed signatures in name order.
    pub fn signatures(&self) -> impl Iterator<Item = &Function> {
        self.artifact.signatures.values()
    }

    pub fn signature_names(&self) -> Vec<&str> {
        self.artifact.signatures.keys().map(String::as_str).collect()
    }

    /// Calls a signature.
    ///
    /// # Arguments
    /// * `name` - The signature to call.
    /// * `inputs` - One value per declared input, keyed by input name.
    ///
    /// # Returns
    /// One value per declared output, keyed by output name. On error no variable is modified.
    pub fn invoke(
        &mut self,
        name: &str,
        inputs: &BTreeMap<String, TensorValue>,
    ) -> Result<BTreeMap<String, TensorValue>> {
        let function = self
            .artifact
            .signatures
            .get(name)
            .ok_or_else(|| GraphErr::UnknownSignature(name.to_string()))?;

        execute(function, &mut self.state, inputs)
    }

    /// Returns the current value of a variable.
    pub fn variable(&self, name: &str) -> Option<&TensorValue> {
        self.state.get_by_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LinearModel, SignatureRegistry};

    fn runtime() -> Runtime {
        let module = LinearModel::new()
            .trace_registry(&SignatureRegistry::builtins())
            .unwrap();

        Runtime::new(Artifact::new(OpSet::Builtins, module.variables, module.functions)).unwrap()
    }

    #[test]
    fn unknown_signature_is_rejected() {
        let mut runtime = runtime();
        let err = runtime.invoke("save", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, GraphErr::UnknownSignature(name) if name == "save"));
    }

    #[test]
    fn set_weights_is_visible_to_get_weights() {
        let mut runtime = runtime();
        let inputs = BTreeMap::from([
            ("w".to_string(), TensorValue::f32(&[1, 1], vec![0.5]).unwrap()),
            ("b".to_string(), TensorValue::f32(&[1], vec![-2.0]).unwrap()),
        ]);
        runtime.invoke("set_weights", &inputs).unwrap();

        let out = runtime.invoke("get_weights", &BTreeMap::new()).unwrap();
        assert_eq!(out["w"].first_f32().unwrap(), 0.5);
        assert_eq!(out["b"].first_f32().unwrap(), -2.0);
        assert_eq!(runtime.variable("bias").unwrap().first_f32().unwrap(), -2.0);
    }

    #[test]
    fn exposes_signatures_in_name_order() {
        let runtime = runtime();
        assert_eq!(
            runtime.signature_names(),
            ["get_weights", "infer", "set_weights", "train"]
        );

        let infer = runtime.signatures().find(|f| f.name == "infer").unwrap();
        assert_eq!(infer.inputs[0].to_string(), "x: float32[1, 1]");
    }
}
