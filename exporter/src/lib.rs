pub mod config;
pub mod converter;
pub mod error;
pub mod verifier;

use std::{fs, io, path::Path};

use graph::{LinearModel, SignatureRegistry};
use log::{info, warn};

pub use config::ExportConfig;
pub use converter::{Conversion, ConversionSummary, Converter};
pub use error::{ConvertErr, ExportErr, Result, VerifyErr};
pub use verifier::{VerificationReport, Verifier};

/// What an export run produced.
#[derive(Debug)]
pub struct ExportOutcome {
    pub summary: ConversionSummary,
    /// `None` when verification was disabled.
    pub report: Option<VerificationReport>,
}

/// Traces a fresh model, lowers it to the configured profile, writes the artifact and, unless
/// disabled, verifies the written file.
///
/// # Arguments
/// * `config` - The export configuration.
///
/// # Returns
/// The conversion summary and the verification report. A failed verification is part of the
/// report, only errors that stop the pipeline are returned as `Err`.
pub fn export(config: &ExportConfig) -> Result<ExportOutcome> {
    config.validate()?;

    let registry = SignatureRegistry::for_op_set(config.profile);
    let model = LinearModel::with_learning_rate(config.learning_rate);

    info!("tracing model for the {} profile", config.profile);
    let module = model.trace_registry(&registry)?;

    let Conversion { artifact, summary } = Converter::new(config.profile)
        .strict_effects(config.strict_effects)
        .convert(&module, &registry)?;

    if let Some(parent) = config.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    artifact.write(&config.output)?;
    info!("artifact written to {}", config.output.display());

    if !config.verify {
        return Ok(ExportOutcome {
            summary,
            report: None,
        });
    }

    let written = graph::Artifact::read(&config.output)?;
    let scratch = config.scratch_dir();
    let report = Verifier::new(&scratch)
        .smoke_steps(config.smoke_steps)
        .verify(&written, &registry);

    if config.checkpoint_dir.is_none() {
        if let Err(e) = remove_scratch(&scratch) {
            warn!("could not remove {}: {e}", scratch.display());
        }
    }

    Ok(ExportOutcome {
        summary,
        report: Some(report),
    })
}

/// Removes the verifier's scratch directory, which only exists if a check wrote to it.
fn remove_scratch(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
