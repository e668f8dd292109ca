use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{CheckpointErr, Result, codec, record::Tensor};

const INDEX_SUFFIX: &str = ".index";
const DATA_SUFFIX: &str = ".data-00000-of-00001";

/// Returns the path of the index file for the checkpoint at `prefix`.
pub fn index_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, INDEX_SUFFIX)
}

/// Returns the path of the data file for the checkpoint at `prefix`.
pub fn data_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, DATA_SUFFIX)
}

/// Persists `tensors` as a checkpoint at `prefix`.
///
/// Both files are first written next to their final location and then renamed into place, data
/// before index, so a reader never sees an index pointing at a partially written data file.
///
/// # Arguments
/// * `prefix` - The path prefix of the checkpoint, the suffixes are appended to it.
/// * `tensors` - The tensors to persist, keyed by name.
pub fn write(prefix: &Path, tensors: &BTreeMap<String, Tensor>) -> Result<()> {
    let (index, data) = codec::encode(tensors)?;

    if let Some(parent) = prefix.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| CheckpointErr::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    write_atomic(&data_path(prefix), &data)?;
    write_atomic(&index_path(prefix), &index)?;

    debug!(
        "wrote checkpoint {}: {} tensor(s), {} data bytes",
        prefix.display(),
        tensors.len(),
        data.len()
    );

    Ok(())
}

/// Reads the checkpoint at `prefix`.
///
/// # Arguments
/// * `prefix` - The path prefix the checkpoint was written with.
///
/// # Returns
/// The tensors keyed by name, or an error if either file is missing or the pair is inconsistent.
pub fn read(prefix: &Path) -> Result<BTreeMap<String, Tensor>> {
    let index = read_file(&index_path(prefix))?;
    let data = read_file(&data_path(prefix))?;
    codec::decode(&index, &data)
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => CheckpointErr::MissingFile(path.to_path_buf()),
        _ => CheckpointErr::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = with_suffix(path, ".tmp");
    let io_err = |source| CheckpointErr::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}
