use std::collections::BTreeMap;

use graph::{
    Artifact, LinearModel, Runtime, SignatureRegistry,
    ir::OpSet,
    tensor::TensorValue,
};

fn inputs<const N: usize>(pairs: [(&str, TensorValue); N]) -> BTreeMap<String, TensorValue> {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

fn matrix(v: f32) -> TensorValue {
    TensorValue::f32(&[1, 1], vec![v]).unwrap()
}

fn load(registry: &SignatureRegistry, dir: &tempfile::TempDir) -> Runtime {
    let module = LinearModel::new().trace_registry(registry).unwrap();
    let artifact = Artifact::new(registry.op_set(), module.variables, module.functions);

    let path = dir.path().join("model.lra");
    artifact.write(&path).unwrap();
    Runtime::load(&path).unwrap()
}

#[test]
fn loaded_artifact_trains_like_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let mut runtime = load(&SignatureRegistry::builtins(), &dir);
    let mut model = LinearModel::new();

    let example = inputs([("x", matrix(1.0)), ("y", matrix(2.0))]);
    for _ in 0..10 {
        let out = runtime.invoke("train", &example).unwrap();
        let loss = model
            .train(&ndarray::arr2(&[[1.0]]), &ndarray::arr2(&[[2.0]]))
            .unwrap();
        assert_eq!(out["loss"].first_f32().unwrap(), loss[0]);
    }

    let out = runtime.invoke("infer", &inputs([("x", matrix(1.0))])).unwrap();
    let expected = model.infer(&ndarray::arr2(&[[1.0]])).unwrap();
    assert_eq!(out["output"].first_f32().unwrap(), expected[[0, 0]]);
}

#[test]
fn checkpoint_round_trip_through_the_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let mut runtime = load(&SignatureRegistry::extended(), &dir);
    assert_eq!(runtime.op_set(), OpSet::Extended);

    let example = inputs([("x", matrix(1.0)), ("y", matrix(2.0))]);
    for _ in 0..5 {
        runtime.invoke("train", &example).unwrap();
    }

    let prefix = dir.path().join("ckpt").to_string_lossy().into_owned();
    let path = inputs([("checkpoint_path", TensorValue::string(prefix))]);
    let status = runtime.invoke("save", &path).unwrap();
    assert_eq!(status["status"].as_i32().unwrap().iter().next(), Some(&0));

    let saved = runtime.variable("weight").unwrap().clone();
    runtime.invoke("train", &example).unwrap();
    assert_ne!(runtime.variable("weight").unwrap(), &saved);

    runtime.invoke("restore", &path).unwrap();
    assert_eq!(runtime.variable("weight").unwrap(), &saved);
}

#[test]
fn restore_from_missing_checkpoint_keeps_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut runtime = load(&SignatureRegistry::extended(), &dir);

    let example = inputs([("x", matrix(1.0)), ("y", matrix(2.0))]);
    runtime.invoke("train", &example).unwrap();
    let before = runtime.variable("bias").unwrap().clone();

    let missing = dir.path().join("nothing").to_string_lossy().into_owned();
    let path = inputs([("checkpoint_path", TensorValue::string(missing))]);
    assert!(runtime.invoke("restore", &path).is_err());
    assert_eq!(runtime.variable("bias").unwrap(), &before);
}

#[test]
fn calls_with_wrong_shapes_fail_at_the_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let mut runtime = load(&SignatureRegistry::builtins(), &dir);

    let wide = TensorValue::f32(&[1, 2], vec![1.0, 2.0]).unwrap();
    assert!(runtime.invoke("infer", &inputs([("x", wide)])).is_err());
    assert!(runtime.invoke("infer", &inputs([("input", matrix(1.0))])).is_err());
}
