use std::{
    env, fs,
    path::{Path, PathBuf},
    process,
};

use graph::{ir::OpSet, model::DEFAULT_LEARNING_RATE};
use serde::{Deserialize, Serialize};

use crate::{error::ExportErr, verifier::DEFAULT_SMOKE_STEPS};

pub const USAGE: &str =
    "usage: exporter <builtins|extended> <output> [--config file.json] [--no-verify]";

/// Everything one export run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub profile: OpSet,
    pub output: PathBuf,
    pub learning_rate: f32,
    pub verify: bool,
    pub smoke_steps: usize,
    /// Where the save/restore check writes its checkpoint, a temporary directory when unset.
    pub checkpoint_dir: Option<PathBuf>,
    pub strict_effects: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            profile: OpSet::Builtins,
            output: PathBuf::from("model.lra"),
            learning_rate: DEFAULT_LEARNING_RATE,
            verify: true,
            smoke_steps: DEFAULT_SMOKE_STEPS,
            checkpoint_dir: None,
            strict_effects: true,
        }
    }
}

impl ExportConfig {
    /// Parses a config out of JSON, missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, ExportErr> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ExportErr::InvalidConfig(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ExportErr> {
        let json = fs::read_to_string(path).map_err(|e| {
            ExportErr::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;

        Self::from_json(&json)
    }

    /// Builds a config out of command line arguments, program name excluded.
    ///
    /// A `--config` file is loaded first and the positional arguments override it.
    pub fn from_args<I>(args: I) -> Result<Self, ExportErr>
    where
        I: IntoIterator<Item = String>,
    {
        let mut positional = Vec::new();
        let mut config_path = None;
        let mut verify = true;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args.next().ok_or_else(|| {
                        ExportErr::InvalidConfig(format!("--config needs a path\n{USAGE}"))
                    })?;
                    config_path = Some(PathBuf::from(path));
                }
                "--no-verify" => verify = false,
                flag if flag.starts_with("--") => {
                    return Err(ExportErr::InvalidConfig(format!(
                        "unknown flag {flag}\n{USAGE}"
                    )));
                }
                _ => positional.push(arg),
            }
        }

        let mut config = match &config_path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        match positional.as_slice() {
            [profile, output] => {
                config.profile = parse_profile(profile)?;
                config.output = PathBuf::from(output);
            }
            [] if config_path.is_some() => {}
            _ => return Err(ExportErr::InvalidConfig(USAGE.into())),
        }

        config.verify &= verify;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ExportErr> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ExportErr::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }

        if self.smoke_steps == 0 {
            return Err(ExportErr::InvalidConfig(
                "smoke_steps must be at least 1".into(),
            ));
        }

        if self.output.as_os_str().is_empty() {
            return Err(ExportErr::InvalidConfig("output must not be empty".into()));
        }

        Ok(())
    }

    /// Returns the directory the verifier writes its checkpoint to.
    pub fn scratch_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join(format!("exporter-verify-{}", process::id())))
    }
}

fn parse_profile(profile: &str) -> Result<OpSet, ExportErr> {
    match profile {
        "builtins" => Ok(OpSet::Builtins),
        "extended" => Ok(OpSet::Extended),
        other => Err(ExportErr::InvalidConfig(format!(
            "unknown profile {other}\n{USAGE}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn positional_arguments_select_profile_and_output() {
        let config = ExportConfig::from_args(args(&["extended", "out/model.lra"])).unwrap();
        assert_eq!(config.profile, OpSet::Extended);
        assert_eq!(config.output, PathBuf::from("out/model.lra"));
        assert!(config.verify);
        assert_eq!(config.learning_rate, 0.01);
    }

    #[test]
    fn no_verify_flag_disables_verification() {
        let config =
            ExportConfig::from_args(args(&["builtins", "m.lra", "--no-verify"])).unwrap();
        assert!(!config.verify);
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(ExportConfig::from_args(args(&["builtins"])).is_err());
        assert!(ExportConfig::from_args(args(&["tflite", "m.lra"])).is_err());
        assert!(ExportConfig::from_args(args(&["builtins", "m.lra", "--fast"])).is_err());
        assert!(ExportConfig::from_args(args(&["builtins", "m.lra", "--config"])).is_err());
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = ExportConfig::from_json(
            r#"{ "profile": "extended", "output": "x.lra", "smoke_steps": 80 }"#,
        )
        .unwrap();

        assert_eq!(config.profile, OpSet::Extended);
        assert_eq!(config.smoke_steps, 80);
        assert!(config.strict_effects);
        assert_eq!(config.checkpoint_dir, None);
    }

    #[test]
    fn json_values_are_validated() {
        assert!(ExportConfig::from_json(r#"{ "learning_rate": -1.0 }"#).is_err());
        assert!(ExportConfig::from_json(r#"{ "profile": "tflite" }"#).is_err());
    }

    #[test]
    fn arguments_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        fs::write(&path, r#"{ "profile": "builtins", "learning_rate": 0.05 }"#).unwrap();

        let path = path.to_string_lossy().into_owned();
        let config =
            ExportConfig::from_args(args(&["extended", "y.lra", "--config", path.as_str()])).unwrap();

        assert_eq!(config.profile, OpSet::Extended);
        assert_eq!(config.output, PathBuf::from("y.lra"));
        assert_eq!(config.learning_rate, 0.05);
    }
}
