use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    GraphErr, Result,
    ir::{Function, OpSet, VariableDecl},
};

/// The bytes every artifact file starts with.
pub const MAGIC: &[u8; 4] = b"LRA1";

pub const VERSION: u32 = 1;

/// A compiled, self-contained model: its variables and one lowered function per signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub version: u32,
    pub op_set: OpSet,
    pub variables: Vec<VariableDecl>,
    pub signatures: BTreeMap<String, Function>,
}

impl Artifact {
    pub fn new(
        op_set: OpSet,
        variables: Vec<VariableDecl>,
        signatures: BTreeMap<String, Function>,
    ) -> Self {
        Self {
            version: VERSION,
            op_set,
            variables,
            signatures,
        }
    }

    pub fn signature_names(&self) -> BTreeSet<&str> {
        self.signatures.keys().map(String::as_str).collect()
    }

    /// Checks every function is well formed and only uses operators of `op_set`.
    pub fn validate(&self) -> Result<()> {
        if self.version != VERSION {
            return Err(GraphErr::Artifact(format!(
                "unsupported version {}, expected {VERSION}",
                self.version
            )));
        }

        for (name, function) in &self.signatures {
            if *name != function.name {
                return Err(GraphErr::Artifact(format!(
                    "signature {name} holds function {}",
                    function.name
                )));
            }

            function.validate()?;

            if let Some(node) = function.nodes.iter().find(|n| !self.op_set.supports(&n.op)) {
                return Err(GraphErr::Artifact(format!(
                    "signature {name} uses {} outside the {} operator set",
                    node.op.name(),
                    self.op_set
                )));
            }
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self).map_err(|e| GraphErr::Artifact(e.to_string()))?;

        let mut bytes = Vec::with_capacity(MAGIC.len() + body.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decodes and validates an artifact.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let body = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| GraphErr::Artifact("missing magic bytes".into()))?;

        let artifact: Self =
            serde_json::from_slice(body).map_err(|e| GraphErr::Artifact(e.to_string()))?;

        artifact.validate()?;
        Ok(artifact)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        fs::write(path, &bytes)?;

        debug!("wrote artifact {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}
