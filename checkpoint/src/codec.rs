use std::collections::BTreeMap;

use bytemuck::Pod;

use crate::{
    CheckpointErr, Result,
    record::{CheckpointRecord, DType, IndexEntry, Tensor, TensorData},
};

/// The index format version written by `encode`.
pub const FORMAT_VERSION: u32 = 1;

/// Encodes a set of named tensors into an index and a data buffer.
///
/// Tensors are laid out in lexicographic name order, which is the iteration order of the map, so
/// the index and the data always agree.
///
/// # Arguments
/// * `tensors` - The tensors to persist, keyed by name.
///
/// # Returns
/// A tuple with the index bytes and the data bytes.
pub fn encode(tensors: &BTreeMap<String, Tensor>) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut data = Vec::with_capacity(tensors.values().map(Tensor::byte_len).sum());
    let mut entries = Vec::with_capacity(tensors.len());

    for (name, tensor) in tensors {
        let offset = data.len();
        match tensor.data() {
            TensorData::F32(values) => write_le(values, &mut data),
            TensorData::I32(values) => write_le(values, &mut data),
        }

        entries.push(IndexEntry {
            name: name.clone(),
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
            offset,
            length: data.len() - offset,
        });
    }

    let record = CheckpointRecord {
        version: FORMAT_VERSION,
        entries,
        data_len: data.len(),
    };

    let index = serde_json::to_vec_pretty(&record)?;
    Ok((index, data))
}

/// Decodes an index and its data buffer back into named tensors.
///
/// # Arguments
/// * `index` - The bytes of the index file.
/// * `data` - The bytes of the data file.
///
/// # Returns
/// The tensors keyed by name, or an error if the pair is corrupt or inconsistent.
pub fn decode(index: &[u8], data: &[u8]) -> Result<BTreeMap<String, Tensor>> {
    let record: CheckpointRecord = serde_json::from_slice(index)?;
    if record.version != FORMAT_VERSION {
        return Err(CheckpointErr::UnsupportedVersion(record.version));
    }

    record.validate(data.len())?;

    let mut tensors = BTreeMap::new();
    for entry in record.entries {
        let bytes = &data[entry.offset..entry.offset + entry.length];
        let values = match entry.dtype {
            DType::F32 => TensorData::F32(read_le(bytes)),
            DType::I32 => TensorData::I32(read_le(bytes)),
        };

        tensors.insert(entry.name, Tensor::new(entry.shape, values)?);
    }

    Ok(tensors)
}

/// Picks the tensors named by `names` out of a decoded checkpoint.
///
/// The checkpoint must hold exactly the requested names, nothing more and nothing less.
///
/// # Arguments
/// * `tensors` - A decoded checkpoint.
/// * `names` - The requested tensor names.
///
/// # Returns
/// The tensors in the same order as `names`.
pub fn select(mut tensors: BTreeMap<String, Tensor>, names: &[String]) -> Result<Vec<Tensor>> {
    let selected = names
        .iter()
        .map(|name| {
            tensors
                .remove(name)
                .ok_or_else(|| CheckpointErr::MissingTensor(name.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(extra) = tensors.into_keys().next() {
        return Err(CheckpointErr::UnexpectedTensor(extra));
    }

    Ok(selected)
}

fn write_le<T: Pod>(values: &[T], out: &mut Vec<u8>) {
    let start = out.len();
    out.extend_from_slice(bytemuck::cast_slice(values));

    if cfg!(target_endian = "big") {
        for chunk in out[start..].chunks_exact_mut(size_of::<T>()) {
            chunk.reverse();
        }
    }
}

fn read_le<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(size_of::<T>())
        .map(|chunk| {
            if cfg!(target_endian = "big") {
                let mut raw = chunk.to_vec();
                raw.reverse();
                bytemuck::pod_read_unaligned(&raw)
            } else {
                bytemuck::pod_read_unaligned(chunk)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    fn params(w: f32, b: f32) -> BTreeMap<String, Tensor> {
        BTreeMap::from([
            ("weight".to_string(), Tensor::f32(vec![1, 1], vec![w]).unwrap()),
            ("bias".to_string(), Tensor::f32(vec![1], vec![b]).unwrap()),
        ])
    }

    fn bits(tensors: &BTreeMap<String, Tensor>) -> Vec<(String, Vec<usize>, Vec<u32>)> {
        tensors
            .iter()
            .map(|(name, t)| {
                let bits = match t.data() {
                    TensorData::F32(v) => v.iter().map(|x| x.to_bits()).collect(),
                    TensorData::I32(v) => v.iter().map(|x| *x as u32).collect(),
                };
                (name.clone(), t.shape().to_vec(), bits)
            })
            .collect()
    }

    #[test]
    fn entries_are_sorted_and_contiguous() {
        let (index, data) = encode(&params(1.5, -2.0)).unwrap();
        let record: CheckpointRecord = serde_json::from_slice(&index).unwrap();

        let names: Vec<_> = record.names().collect();
        assert_eq!(names, ["bias", "weight"]);
        assert_eq!(record.entries[0].offset, 0);
        assert_eq!(record.entries[1].offset, 4);
        assert_eq!(record.data_len, 8);
        assert_eq!(data.len(), 8);
        assert_eq!(&data[..4], &(-2.0f32).to_le_bytes());
        assert_eq!(&data[4..], &1.5f32.to_le_bytes());
    }

    #[test]
    fn decode_reproduces_exact_bits() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..64 {
            let w: f32 = f32::from_bits(rng.random());
            let b: f32 = f32::from_bits(rng.random());
            let original = params(w, b);

            let (index, data) = encode(&original).unwrap();
            let decoded = decode(&index, &data).unwrap();
            assert_eq!(bits(&decoded), bits(&original));
        }
    }

    #[test]
    fn int_tensors_survive_encoding() {
        let tensors = BTreeMap::from([(
            "steps".to_string(),
            Tensor::new(vec![3], TensorData::I32(vec![-1, 0, i32::MAX])).unwrap(),
        )]);

        let (index, data) = encode(&tensors).unwrap();
        assert_eq!(decode(&index, &data).unwrap(), tensors);
    }

    #[test]
    fn truncated_data_is_rejected() {
        let (index, data) = encode(&params(1.0, 2.0)).unwrap();
        let err = decode(&index, &data[..6]).unwrap_err();
        assert!(matches!(err, CheckpointErr::LengthMismatch { got: 6, expected: 8, .. }));
    }

    #[test]
    fn garbage_index_is_rejected() {
        let (_, data) = encode(&params(1.0, 2.0)).unwrap();
        let err = decode(b"not json", &data).unwrap_err();
        assert!(matches!(err, CheckpointErr::CorruptIndex(_)));
    }

    #[test]
    fn overlapping_entries_are_rejected() {
        let (index, data) = encode(&params(1.0, 2.0)).unwrap();
        let mut record: CheckpointRecord = serde_json::from_slice(&index).unwrap();
        record.entries[1].offset = 0;

        let index = serde_json::to_vec(&record).unwrap();
        let err = decode(&index, &data).unwrap_err();
        assert!(matches!(err, CheckpointErr::CorruptIndex(_)));
    }

    #[test]
    fn overflowing_shape_is_a_corrupt_index() {
        let index = br#"{"version":1,"entries":[{"name":"weight","dtype":"f32","shape":[4611686018427387904,8],"offset":0,"length":0}],"data_len":0}"#;
        let err = decode(index, &[]).unwrap_err();
        assert!(matches!(err, CheckpointErr::CorruptIndex(_)));

        let index = br#"{"version":1,"entries":[{"name":"weight","dtype":"f32","shape":[4611686018427387904],"offset":0,"length":0}],"data_len":0}"#;
        let err = decode(index, &[]).unwrap_err();
        assert!(matches!(err, CheckpointErr::CorruptIndex(_)));
    }

    #[test]
    fn overflowing_shape_is_rejected_on_construction() {
        let err = Tensor::new(vec![usize::MAX, 2], TensorData::F32(vec![])).unwrap_err();
        assert!(matches!(err, CheckpointErr::LengthMismatch { got: 0, .. }));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let (index, data) = encode(&params(1.0, 2.0)).unwrap();
        let mut record: CheckpointRecord = serde_json::from_slice(&index).unwrap();
        record.version = 9;

        let index = serde_json::to_vec(&record).unwrap();
        let err = decode(&index, &data).unwrap_err();
        assert!(matches!(err, CheckpointErr::UnsupportedVersion(9)));
    }

    #[test]
    fn select_requires_the_exact_name_set() {
        let names = ["weight".to_string(), "bias".to_string()];

        let selected = select(params(3.0, 4.0), &names).unwrap();
        assert_eq!(selected[0].data(), &TensorData::F32(vec![3.0]));
        assert_eq!(selected[1].data(), &TensorData::F32(vec![4.0]));

        let err = select(params(3.0, 4.0), &names[..1]).unwrap_err();
        assert!(matches!(err, CheckpointErr::UnexpectedTensor(name) if name == "bias"));

        let mut only_weight = params(3.0, 4.0);
        only_weight.remove("bias");
        let err = select(only_weight, &names).unwrap_err();
        assert!(matches!(err, CheckpointErr::MissingTensor(name) if name == "bias"));
    }
}
