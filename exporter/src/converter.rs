use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use graph::{
    Artifact, SignatureRegistry,
    ir::{Function, Module, Node, OpSet, ValueId},
};
use log::{debug, info, warn};

use crate::error::ConvertErr;

/// Lowers traced modules into artifacts restricted to one operator vocabulary.
#[derive(Debug, Clone)]
pub struct Converter {
    op_set: OpSet,
    strict_effects: bool,
}

/// The result of a successful conversion.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub artifact: Artifact,
    pub summary: ConversionSummary,
}

/// What the conversion did to each signature.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionSummary {
    pub profile: OpSet,
    pub signatures: BTreeMap<String, SignatureSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureSummary {
    pub traced_nodes: usize,
    pub kept_nodes: usize,
    /// Stateful nodes removed because nothing consumed them, only possible in lenient mode.
    pub dropped_effects: usize,
    pub ops: BTreeMap<&'static str, usize>,
}

impl Converter {
    /// Creates a new `Converter` targeting `op_set`, rejecting unconsumed writes.
    pub fn new(op_set: OpSet) -> Self {
        Self {
            op_set,
            strict_effects: true,
        }
    }

    /// Sets whether a write removed by dead-code elimination is an error (`true`) or only a
    /// warning (`false`).
    pub fn strict_effects(mut self, strict: bool) -> Self {
        self.strict_effects = strict;
        self
    }

    /// Lowers every signature of `registry`.
    ///
    /// # Arguments
    /// * `module` - The traced model.
    /// * `registry` - The signatures the artifact must expose.
    ///
    /// # Returns
    /// The artifact and a summary of the lowering, or the first signature that can't be lowered.
    pub fn convert(
        &self,
        module: &Module,
        registry: &SignatureRegistry,
    ) -> Result<Conversion, ConvertErr> {
        info!(
            "converting {} signature(s) to the {} profile",
            registry.len(),
            self.op_set
        );

        let mut signatures = BTreeMap::new();
        let mut summaries = BTreeMap::new();

        for signature in registry.iter() {
            let name = signature.name();
            let function = module.functions.get(name).ok_or_else(|| {
                ConvertErr::SignatureMismatch {
                    signature: name.to_string(),
                    reason: "not traced".into(),
                }
            })?;

            if function.inputs != signature.inputs || function.outputs != signature.outputs {
                return Err(ConvertErr::SignatureMismatch {
                    signature: name.to_string(),
                    reason: format!("traced with a different contract than {signature}"),
                });
            }

            let (lowered, summary) = self.lower(function)?;
            signatures.insert(name.to_string(), lowered);
            summaries.insert(name.to_string(), summary);
        }

        for name in module.functions.keys() {
            if registry.get(name).is_none() {
                debug!("skipping {name}, not part of the registry");
            }
        }

        let artifact = Artifact::new(self.op_set, module.variables.clone(), signatures);
        artifact.validate()?;

        Ok(Conversion {
            artifact,
            summary: ConversionSummary {
                profile: self.op_set,
                signatures: summaries,
            },
        })
    }

    fn lower(&self, function: &Function) -> Result<(Function, SignatureSummary), ConvertErr> {
        function.validate()?;

        let live = liveness(function);
        let mut dropped_effects = 0;

        for (node, _) in function.nodes.iter().zip(&live).filter(|(_, live)| !**live) {
            if !node.op.is_stateful() {
                debug!("{}: removing dead {}", function.name, node.op.name());
                continue;
            }

            if self.strict_effects {
                return Err(ConvertErr::DroppedSideEffect {
                    signature: function.name.clone(),
                    op: node.op.name(),
                });
            }

            warn!(
                "{}: dropping {} with no consumer, its effect is lost",
                function.name,
                node.op.name()
            );
            dropped_effects += 1;
        }

        for (node, _) in function.nodes.iter().zip(&live).filter(|(_, live)| **live) {
            if !self.op_set.supports(&node.op) {
                return Err(ConvertErr::UnsupportedOperator {
                    signature: function.name.clone(),
                    op: node.op.name(),
                    profile: self.op_set,
                });
            }
        }

        let lowered = compact(function, &live);
        debug!(
            "{}: kept {} of {} node(s)",
            function.name,
            lowered.nodes.len(),
            function.nodes.len()
        );

        let summary = SignatureSummary {
            traced_nodes: function.nodes.len(),
            kept_nodes: lowered.nodes.len(),
            dropped_effects,
            ops: lowered.op_counts(),
        };

        Ok((lowered, summary))
    }
}

/// Marks every node the results depend on through data or control edges.
fn liveness(function: &Function) -> Vec<bool> {
    let mut live = vec![false; function.nodes.len()];
    let mut stack: Vec<ValueId> = function.results.clone();

    while let Some(id) = stack.pop() {
        if live[id.0] {
            continue;
        }

        live[id.0] = true;
        let node = &function.nodes[id.0];
        stack.extend(node.inputs.iter().chain(&node.control).copied());
    }

    live
}

/// Keeps the live nodes, in their original order, and renumbers every reference to them.
fn compact(function: &Function, live: &[bool]) -> Function {
    let mut remap = vec![None; function.nodes.len()];
    let mut nodes = Vec::with_capacity(live.iter().filter(|l| **l).count());

    for (i, node) in function.nodes.iter().enumerate() {
        if !live[i] {
            continue;
        }

        let renumber = |ids: &[ValueId]| -> Vec<ValueId> {
            ids.iter().filter_map(|id| remap[id.0]).collect()
        };

        let inputs = renumber(&node.inputs);
        let control = renumber(&node.control);

        remap[i] = Some(ValueId(nodes.len()));
        nodes.push(Node {
            op: node.op.clone(),
            inputs,
            control,
            ty: node.ty.clone(),
        });
    }

    Function {
        name: function.name.clone(),
        inputs: function.inputs.clone(),
        outputs: function.outputs.clone(),
        results: function.results.iter().filter_map(|id| remap[id.0]).collect(),
        nodes,
    }
}

impl Display for ConversionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "profile: {}", self.profile)?;
        for (name, summary) in &self.signatures {
            let ops: Vec<String> = summary
                .ops
                .iter()
                .map(|(op, count)| format!("{op}x{count}"))
                .collect();

            writeln!(
                f,
                "  {name}: {}/{} node(s) kept [{}]",
                summary.kept_nodes,
                summary.traced_nodes,
                ops.join(", ")
            )?;

            if summary.dropped_effects > 0 {
                writeln!(f, "    {} effect(s) dropped", summary.dropped_effects)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use graph::{
        LinearModel, SignatureKind,
        ir::{FunctionBuilder, Op, VarId},
    };

    use super::*;

    fn module(registry: &SignatureRegistry) -> Module {
        LinearModel::new().trace_registry(registry).unwrap()
    }

    /// A `set_weights` whose writes nothing depends on.
    fn unthreaded_set_weights(variables: &[graph::ir::VariableDecl]) -> Function {
        let signature = SignatureKind::SetWeights.signature();
        let mut b = FunctionBuilder::new(&signature, variables);
        let w = b.input(0).unwrap();
        let bias = b.input(1).unwrap();
        b.assign(VarId(0), w).unwrap();
        b.assign(VarId(1), bias).unwrap();
        b.finish(vec![w, bias]).unwrap()
    }

    #[test]
    fn builtins_profile_converts_without_losing_writes() {
        let registry = SignatureRegistry::builtins();
        let conversion = Converter::new(OpSet::Builtins)
            .convert(&module(&registry), &registry)
            .unwrap();

        let names: Vec<_> = conversion.artifact.signature_names().into_iter().collect();
        assert_eq!(names, ["get_weights", "infer", "set_weights", "train"]);

        let set = &conversion.summary.signatures["set_weights"];
        assert_eq!(set.ops.get("AssignVariable"), Some(&2));

        let train = &conversion.summary.signatures["train"];
        assert_eq!(train.ops.get("AssignVariable"), Some(&2));
        assert_eq!(train.dropped_effects, 0);
    }

    #[test]
    fn extended_graph_needs_the_extended_profile() {
        let registry = SignatureRegistry::extended();
        let err = Converter::new(OpSet::Builtins)
            .convert(&module(&registry), &registry)
            .unwrap_err();

        assert!(matches!(
            err,
            ConvertErr::UnsupportedOperator { op, profile: OpSet::Builtins, .. }
                if op == "RestoreV2" || op == "SaveV2"
        ));

        let conversion = Converter::new(OpSet::Extended)
            .convert(&module(&registry), &registry)
            .unwrap();
        assert_eq!(conversion.summary.signatures["save"].ops.get("SaveV2"), Some(&1));
        assert_eq!(
            conversion.summary.signatures["restore"].ops.get("RestoreV2"),
            Some(&2)
        );
    }

    #[test]
    fn unthreaded_writes_are_rejected_in_strict_mode() {
        let registry = SignatureRegistry::builtins();
        let mut module = module(&registry);
        let unthreaded = unthreaded_set_weights(&module.variables);
        module.functions.insert("set_weights".into(), unthreaded);

        let err = Converter::new(OpSet::Builtins)
            .convert(&module, &registry)
            .unwrap_err();
        assert!(matches!(
            err,
            ConvertErr::DroppedSideEffect { signature, op: "AssignVariable" } if signature == "set_weights"
        ));
    }

    #[test]
    fn lenient_mode_drops_unthreaded_writes() {
        let registry = SignatureRegistry::builtins();
        let mut module = module(&registry);
        let unthreaded = unthreaded_set_weights(&module.variables);
        module.functions.insert("set_weights".into(), unthreaded);

        let conversion = Converter::new(OpSet::Builtins)
            .strict_effects(false)
            .convert(&module, &registry)
            .unwrap();

        let lowered = &conversion.artifact.signatures["set_weights"];
        assert!(lowered.nodes.iter().all(|n| !matches!(n.op, Op::AssignVariable(_))));
        assert_eq!(conversion.summary.signatures["set_weights"].dropped_effects, 2);
    }

    #[test]
    fn dead_pure_nodes_are_removed_and_ids_renumbered() {
        let registry = SignatureRegistry::builtins();
        let module = module(&registry);
        let signature = SignatureKind::Infer.signature();

        let mut b = FunctionBuilder::new(&signature, &module.variables);
        let x = b.input(0).unwrap();
        let unused = b.square(x).unwrap();
        b.mean(unused).unwrap();
        let out = b.identity(x).unwrap();
        let function = b.finish(vec![out]).unwrap();

        let live = liveness(&function);
        assert_eq!(live, [true, false, false, true]);

        let lowered = compact(&function, &live);
        assert_eq!(lowered.nodes.len(), 2);
        assert_eq!(lowered.results, [ValueId(1)]);
        assert_eq!(lowered.nodes[1].inputs, [ValueId(0)]);
        lowered.validate().unwrap();
    }

    #[test]
    fn contracts_are_checked_against_the_registry() {
        let registry = SignatureRegistry::builtins();
        let mut module = module(&registry);
        module.functions.remove("get_weights");

        let err = Converter::new(OpSet::Builtins)
            .convert(&module, &registry)
            .unwrap_err();
        assert!(matches!(err, ConvertErr::SignatureMismatch { signature, .. } if signature == "get_weights"));
    }
}
