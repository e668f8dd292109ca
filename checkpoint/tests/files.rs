use std::{collections::BTreeMap, fs};

use checkpoint::{CheckpointErr, Tensor, TensorData};

fn params(w: f32, b: f32) -> BTreeMap<String, Tensor> {
    BTreeMap::from([
        ("weight".to_string(), Tensor::f32(vec![1, 1], vec![w]).unwrap()),
        ("bias".to_string(), Tensor::f32(vec![1], vec![b]).unwrap()),
    ])
}

#[test]
fn write_then_read_restores_tensors() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("ckpt").join("model");

    checkpoint::write(&prefix, &params(0.75, -3.25)).unwrap();

    assert!(checkpoint::index_path(&prefix).exists());
    assert!(checkpoint::data_path(&prefix).exists());

    let restored = checkpoint::read(&prefix).unwrap();
    assert_eq!(restored, params(0.75, -3.25));
    assert_eq!(restored["weight"].shape(), &[1, 1]);
}

#[test]
fn file_names_follow_the_paired_layout() {
    let prefix = std::path::Path::new("/tmp/run/model");

    assert_eq!(
        checkpoint::index_path(prefix).to_str(),
        Some("/tmp/run/model.index")
    );
    assert_eq!(
        checkpoint::data_path(prefix).to_str(),
        Some("/tmp/run/model.data-00000-of-00001")
    );
}

#[test]
fn overwriting_a_checkpoint_replaces_its_values() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("model");

    checkpoint::write(&prefix, &params(1.0, 1.0)).unwrap();
    checkpoint::write(&prefix, &params(2.0, 3.0)).unwrap();

    let restored = checkpoint::read(&prefix).unwrap();
    assert_eq!(restored["weight"].data(), &TensorData::F32(vec![2.0]));
    assert_eq!(restored["bias"].data(), &TensorData::F32(vec![3.0]));
}

#[test]
fn missing_data_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("model");

    checkpoint::write(&prefix, &params(1.0, 2.0)).unwrap();
    fs::remove_file(checkpoint::data_path(&prefix)).unwrap();

    let err = checkpoint::read(&prefix).unwrap_err();
    assert!(matches!(err, CheckpointErr::MissingFile(path) if path == checkpoint::data_path(&prefix)));
}

#[test]
fn missing_checkpoint_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = checkpoint::read(&dir.path().join("nothing")).unwrap_err();
    assert!(matches!(err, CheckpointErr::MissingFile(_)));
}

#[test]
fn data_file_from_another_checkpoint_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let small = dir.path().join("small");
    let big = dir.path().join("big");

    checkpoint::write(&small, &params(1.0, 2.0)).unwrap();
    let mut wide = params(1.0, 2.0);
    wide.insert(
        "extra".to_string(),
        Tensor::f32(vec![4], vec![0.0; 4]).unwrap(),
    );
    checkpoint::write(&big, &wide).unwrap();

    fs::copy(checkpoint::data_path(&big), checkpoint::data_path(&small)).unwrap();

    let err = checkpoint::read(&small).unwrap_err();
    assert!(matches!(err, CheckpointErr::LengthMismatch { .. }));
}
