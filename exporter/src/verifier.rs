use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    fs,
    path::PathBuf,
};

use graph::{
    Artifact, Runtime, SignatureKind, SignatureRegistry,
    ir::{Function, OpSet},
    tensor::{TensorSpec, TensorValue},
};
use log::{info, warn};

use crate::error::VerifyErr;

pub const DEFAULT_SMOKE_STEPS: usize = 50;

/// Checks a produced artifact against the registry it was built for.
#[derive(Debug, Clone)]
pub struct Verifier {
    smoke_steps: usize,
    scratch_dir: PathBuf,
}

/// The outcome of a single verification check.
#[derive(Debug)]
pub struct Check {
    pub name: &'static str,
    pub outcome: Result<(), VerifyErr>,
}

/// What an artifact exposes and which checks it passed.
#[derive(Debug)]
pub struct VerificationReport {
    pub profile: OpSet,
    /// One line per exposed signature, e.g. `infer(x: float32[1, 1]) -> (output: float32[1, 1])`.
    pub signatures: Vec<String>,
    pub checks: Vec<Check>,
}

impl Verifier {
    /// Creates a new `Verifier`.
    ///
    /// # Arguments
    /// * `scratch_dir` - Where the save/restore check may write its checkpoint.
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            smoke_steps: DEFAULT_SMOKE_STEPS,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn smoke_steps(mut self, steps: usize) -> Self {
        self.smoke_steps = steps;
        self
    }

    /// Runs every check against `artifact`.
    ///
    /// Each check loads the artifact into a fresh runtime, so it sees zeroed parameters.
    ///
    /// # Returns
    /// The report. A failed check is recorded in it, not returned as an error.
    pub fn verify(&self, artifact: &Artifact, registry: &SignatureRegistry) -> VerificationReport {
        let mut checks = vec![
            Check {
                name: "signature_set",
                outcome: signature_set(artifact, registry),
            },
            Check {
                name: "signature_specs",
                outcome: signature_specs(artifact, registry),
            },
            Check {
                name: "infer_zero",
                outcome: self.infer_zero(artifact),
            },
            Check {
                name: "first_step_loss",
                outcome: self.first_step_loss(artifact),
            },
            Check {
                name: "convergence",
                outcome: self.convergence(artifact),
            },
        ];

        if registry.contains(SignatureKind::SetWeights) && registry.contains(SignatureKind::GetWeights) {
            checks.push(Check {
                name: "set_get_weights",
                outcome: self.set_get_weights(artifact),
            });
        }

        if registry.contains(SignatureKind::Save) && registry.contains(SignatureKind::Restore) {
            checks.push(Check {
                name: "save_restore",
                outcome: self.save_restore(artifact),
            });
        }

        let report = VerificationReport {
            profile: artifact.op_set,
            signatures: artifact.signatures.values().map(describe).collect(),
            checks,
        };

        for check in report.failures() {
            if let Err(e) = &check.outcome {
                warn!("check {} failed: {e}", check.name);
            }
        }

        info!(
            "verification {}: {} check(s)",
            if report.passed() { "passed" } else { "failed" },
            report.checks.len()
        );

        report
    }

    fn infer_zero(&self, artifact: &Artifact) -> Result<(), VerifyErr> {
        let mut runtime = Runtime::new(artifact.clone())?;
        let got = infer(&mut runtime, 1.0)?;

        if got != 0.0 {
            return Err(VerifyErr::NumericAssertion {
                check: "infer_zero",
                got,
                expected: "== 0".into(),
            });
        }

        Ok(())
    }

    fn first_step_loss(&self, artifact: &Artifact) -> Result<(), VerifyErr> {
        let mut runtime = Runtime::new(artifact.clone())?;
        let got = train(&mut runtime, 1.0, 2.0)?;

        if got != 4.0 {
            return Err(VerifyErr::NumericAssertion {
                check: "first_step_loss",
                got,
                expected: "== 4".into(),
            });
        }

        Ok(())
    }

    /// Repeated steps on `(1, 2)` must never increase the loss and must move the prediction
    /// strictly towards 2 on every step. A full run must also move it past 0.5.
    fn convergence(&self, artifact: &Artifact) -> Result<(), VerifyErr> {
        let mut runtime = Runtime::new(artifact.clone())?;

        let mut last_loss = f32::INFINITY;
        let mut last_pred = infer(&mut runtime, 1.0)?;
        for _ in 0..self.smoke_steps {
            let loss = train(&mut runtime, 1.0, 2.0)?;
            if !(loss <= last_loss) {
                return Err(VerifyErr::NumericAssertion {
                    check: "convergence",
                    got: loss,
                    expected: format!("loss <= {last_loss}"),
                });
            }

            let pred = infer(&mut runtime, 1.0)?;
            if !(pred > last_pred && pred < 2.0) {
                return Err(VerifyErr::NumericAssertion {
                    check: "convergence",
                    got: pred,
                    expected: format!("prediction in ({last_pred}, 2)"),
                });
            }

            last_loss = loss;
            last_pred = pred;
        }

        if self.smoke_steps >= DEFAULT_SMOKE_STEPS && !(last_pred > 0.5) {
            return Err(VerifyErr::NumericAssertion {
                check: "convergence",
                got: last_pred,
                expected: format!("> 0.5 after {} steps", self.smoke_steps),
            });
        }

        Ok(())
    }

    /// A write through `set_weights` must be visible to `get_weights` and `infer`.
    fn set_get_weights(&self, artifact: &Artifact) -> Result<(), VerifyErr> {
        let mut runtime = Runtime::new(artifact.clone())?;
        let (w, b) = (0.75, -0.25);

        let inputs = BTreeMap::from([
            ("w".to_string(), TensorValue::f32(&[1, 1], vec![w])?),
            ("b".to_string(), TensorValue::f32(&[1], vec![b])?),
        ]);
        let echoed = runtime.invoke("set_weights", &inputs)?;
        let read = runtime.invoke("get_weights", &BTreeMap::new())?;

        for out in [&echoed, &read] {
            expect_output(out, "w", w, "set_get_weights")?;
            expect_output(out, "b", b, "set_get_weights")?;
        }

        let got = infer(&mut runtime, 2.0)?;
        if got != 2.0 * w + b {
            return Err(VerifyErr::NumericAssertion {
                check: "set_get_weights",
                got,
                expected: format!("== {}", 2.0 * w + b),
            });
        }

        Ok(())
    }

    /// A checkpoint saved mid-training must bring the prediction back after further training.
    fn save_restore(&self, artifact: &Artifact) -> Result<(), VerifyErr> {
        fs::create_dir_all(&self.scratch_dir)?;
        let prefix = self.scratch_dir.join("verify");
        let path = BTreeMap::from([(
            "checkpoint_path".to_string(),
            TensorValue::string(prefix.to_string_lossy()),
        )]);

        let mut runtime = Runtime::new(artifact.clone())?;
        for _ in 0..3 {
            train(&mut runtime, 1.0, 2.0)?;
        }

        let saved = infer(&mut runtime, 1.0)?;
        expect_status(runtime.invoke("save", &path)?)?;

        for file in [checkpoint::index_path(&prefix), checkpoint::data_path(&prefix)] {
            if !file.exists() {
                return Err(VerifyErr::Graph(graph::GraphErr::Checkpoint(
                    checkpoint::CheckpointErr::MissingFile(file),
                )));
            }
        }

        for _ in 0..3 {
            train(&mut runtime, 1.0, 2.0)?;
        }

        let moved = infer(&mut runtime, 1.0)?;
        if moved == saved {
            return Err(VerifyErr::NumericAssertion {
                check: "save_restore",
                got: moved,
                expected: format!("!= {saved} after training"),
            });
        }

        expect_status(runtime.invoke("restore", &path)?)?;

        let got = infer(&mut runtime, 1.0)?;
        if got != saved {
            return Err(VerifyErr::NumericAssertion {
                check: "save_restore",
                got,
                expected: format!("== {saved}"),
            });
        }

        Ok(())
    }
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.outcome.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|check| check.outcome.is_err())
    }

    /// Returns the first failed check as an error.
    pub fn ensure_passed(self) -> Result<(), VerifyErr> {
        self.checks
            .into_iter()
            .map(|check| check.outcome)
            .find(Result::is_err)
            .unwrap_or(Ok(()))
    }
}

impl Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "signatures ({}):", self.profile)?;
        for signature in &self.signatures {
            writeln!(f, "  {signature}")?;
        }

        writeln!(f, "checks:")?;
        for check in &self.checks {
            match &check.outcome {
                Ok(()) => writeln!(f, "  {:<16} ok", check.name)?,
                Err(e) => writeln!(f, "  {:<16} FAILED: {e}", check.name)?,
            }
        }

        write!(f, "result: {}", if self.passed() { "passed" } else { "FAILED" })
    }
}

fn signature_set(artifact: &Artifact, registry: &SignatureRegistry) -> Result<(), VerifyErr> {
    let exposed = artifact.signature_names();
    let expected = registry.names();

    let missing: Vec<String> = expected
        .iter()
        .filter(|name| !exposed.contains(**name))
        .map(|name| name.to_string())
        .collect();
    let unexpected: Vec<String> = exposed
        .iter()
        .filter(|name| !expected.contains(**name))
        .map(|name| name.to_string())
        .collect();

    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(VerifyErr::SignatureSetMismatch {
            missing,
            unexpected,
        });
    }

    Ok(())
}

fn signature_specs(artifact: &Artifact, registry: &SignatureRegistry) -> Result<(), VerifyErr> {
    for signature in registry.iter() {
        let Some(function) = artifact.signatures.get(signature.name()) else {
            continue;
        };

        if function.inputs != signature.inputs || function.outputs != signature.outputs {
            return Err(VerifyErr::SpecMismatch {
                signature: signature.name().to_string(),
                expected: signature.to_string(),
                got: describe(function),
            });
        }
    }

    Ok(())
}

/// Renders the contract of a lowered function.
fn describe(function: &Function) -> String {
    let list = |specs: &[TensorSpec]| {
        specs
            .iter()
            .map(TensorSpec::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "{}({}) -> ({})",
        function.name,
        list(&function.inputs),
        list(&function.outputs)
    )
}

fn infer(runtime: &mut Runtime, x: f32) -> Result<f32, VerifyErr> {
    let inputs = BTreeMap::from([("x".to_string(), TensorValue::f32(&[1, 1], vec![x])?)]);
    let out = runtime.invoke("infer", &inputs)?;
    output(&out, "output")
}

fn train(runtime: &mut Runtime, x: f32, y: f32) -> Result<f32, VerifyErr> {
    let inputs = BTreeMap::from([
        ("x".to_string(), TensorValue::f32(&[1, 1], vec![x])?),
        ("y".to_string(), TensorValue::f32(&[1, 1], vec![y])?),
    ]);
    let out = runtime.invoke("train", &inputs)?;
    output(&out, "loss")
}

fn output(out: &BTreeMap<String, TensorValue>, name: &str) -> Result<f32, VerifyErr> {
    let value = out.get(name).ok_or_else(|| {
        VerifyErr::Graph(graph::GraphErr::InvalidGraph(format!("missing output {name}")))
    })?;

    Ok(value.first_f32()?)
}

fn expect_output(
    out: &BTreeMap<String, TensorValue>,
    name: &str,
    expected: f32,
    check: &'static str,
) -> Result<(), VerifyErr> {
    let got = output(out, name)?;
    if got != expected {
        return Err(VerifyErr::NumericAssertion {
            check,
            got,
            expected: format!("{name} == {expected}"),
        });
    }

    Ok(())
}

fn expect_status(out: BTreeMap<String, TensorValue>) -> Result<(), VerifyErr> {
    let status = out.get("status").ok_or_else(|| {
        VerifyErr::Graph(graph::GraphErr::InvalidGraph("missing output status".into()))
    })?;

    let code = status.as_i32()?.iter().next().copied().unwrap_or(-1);
    if code != 0 {
        return Err(VerifyErr::NumericAssertion {
            check: "status",
            got: code as f32,
            expected: "== 0".into(),
        });
    }

    Ok(())
}
