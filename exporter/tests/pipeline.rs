use std::collections::BTreeMap;

use exporter::{ExportConfig, ExportErr, export};
use graph::{Runtime, ir::OpSet, tensor::TensorValue};

fn config(profile: OpSet, dir: &tempfile::TempDir) -> ExportConfig {
    ExportConfig {
        profile,
        output: dir.path().join("out").join("model.lra"),
        checkpoint_dir: Some(dir.path().join("scratch")),
        ..ExportConfig::default()
    }
}

#[test]
fn builtins_export_is_verified_and_loadable() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(OpSet::Builtins, &dir);

    let outcome = export(&config).unwrap();
    let report = outcome.report.unwrap();
    assert!(report.passed(), "{report}");
    assert_eq!(outcome.summary.signatures.len(), 4);

    let mut runtime = Runtime::load(&config.output).unwrap();
    assert_eq!(
        runtime.signature_names(),
        ["get_weights", "infer", "set_weights", "train"]
    );

    let inputs = BTreeMap::from([
        ("w".to_string(), TensorValue::f32(&[1, 1], vec![2.0]).unwrap()),
        ("b".to_string(), TensorValue::f32(&[1], vec![0.5]).unwrap()),
    ]);
    runtime.invoke("set_weights", &inputs).unwrap();

    let out = runtime.invoke("get_weights", &BTreeMap::new()).unwrap();
    assert_eq!(out["w"].first_f32().unwrap(), 2.0);
    assert_eq!(out["b"].first_f32().unwrap(), 0.5);
}

#[test]
fn extended_export_round_trips_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(OpSet::Extended, &dir);

    let outcome = export(&config).unwrap();
    let report = outcome.report.unwrap();
    assert!(report.passed(), "{report}");

    let runtime = Runtime::load(&config.output).unwrap();
    assert_eq!(
        runtime.signature_names(),
        ["infer", "restore", "save", "train"]
    );
    assert!(checkpoint::index_path(&dir.path().join("scratch").join("verify")).exists());
}

#[test]
fn skipping_verification_still_writes_the_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExportConfig {
        verify: false,
        ..config(OpSet::Builtins, &dir)
    };

    let outcome = export(&config).unwrap();
    assert!(outcome.report.is_none());
    assert!(config.output.exists());
}

#[test]
fn invalid_config_stops_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExportConfig {
        learning_rate: 0.0,
        ..config(OpSet::Builtins, &dir)
    };

    assert!(matches!(export(&config), Err(ExportErr::InvalidConfig(_))));
    assert!(!config.output.exists());
}

#[test]
fn custom_learning_rate_reaches_the_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExportConfig {
        learning_rate: 0.1,
        verify: false,
        ..config(OpSet::Builtins, &dir)
    };
    export(&config).unwrap();

    let mut runtime = Runtime::load(&config.output).unwrap();
    let example = BTreeMap::from([
        ("x".to_string(), TensorValue::f32(&[1, 1], vec![1.0]).unwrap()),
        ("y".to_string(), TensorValue::f32(&[1, 1], vec![2.0]).unwrap()),
    ]);
    runtime.invoke("train", &example).unwrap();

    let weight = runtime.variable("weight").unwrap().first_f32().unwrap();
    assert!((weight - 0.4).abs() < 1e-6);
}

#[test]
fn short_smoke_run_still_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("short.lra");
    let json = format!(
        r#"{{ "profile": "builtins", "output": {:?}, "smoke_steps": 5 }}"#,
        output.to_string_lossy()
    );

    let config = ExportConfig::from_json(&json).unwrap();
    let report = export(&config).unwrap().report.unwrap();
    assert!(report.passed(), "{report}");
}
