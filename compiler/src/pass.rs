// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the analysis passes, their dependency edges, and the artifacts
// they produce. Used by the pipeline runner to compute minimal pass subsets
// for `--stop-after` and for sub-program analysis.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    SelectCandidates,
    ProbeUnary,
    Propagate,
    RemoveUnused,
    FlagRecompile,
    Checkpoints,
    ConstantOps,
}

/// Machine-readable artifact identifiers. Each maps to a field of the
/// pipeline state or to an in-place change of the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Candidates,       // CandidateSet
    ShapePreserving,  // BTreeSet<FunctionKey>
    Annotations,      // node sizes + CallStats
    FunctionTable,    // pruned table + removed keys
    RecompileFlags,   // Function::recompile_once
    CheckpointEdits,  // Vec<CheckpointEdit>
    ConstantRewrites, // Vec<ConstantRewrite>
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about an analysis pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics, logs and `--stop-after`.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::SelectCandidates => PassDescriptor {
            name: "select_candidates",
            inputs: &[],
            outputs: &[ArtifactId::Candidates],
            invariants: "candidates are reachable, called once or with equivalent arguments",
        },
        PassId::ProbeUnary => PassDescriptor {
            name: "probe_unary",
            inputs: &[PassId::SelectCandidates],
            outputs: &[ArtifactId::ShapePreserving],
            invariants: "probed bodies carry no synthetic sizes",
        },
        PassId::Propagate => PassDescriptor {
            name: "propagate",
            inputs: &[PassId::SelectCandidates, PassId::ProbeUnary],
            outputs: &[ArtifactId::Annotations],
            invariants: "every visited node is exact or Unknown per field",
        },
        PassId::RemoveUnused => PassDescriptor {
            name: "remove_unused",
            inputs: &[PassId::Propagate],
            outputs: &[ArtifactId::FunctionTable],
            invariants: "function table holds only reachable functions",
        },
        PassId::FlagRecompile => PassDescriptor {
            name: "flag_recompile",
            inputs: &[PassId::RemoveUnused],
            outputs: &[ArtifactId::RecompileFlags],
            invariants: "functions containing loops are recompiled on entry",
        },
        PassId::Checkpoints => PassDescriptor {
            name: "checkpoints",
            inputs: &[PassId::Propagate],
            outputs: &[ArtifactId::CheckpointEdits],
            invariants: "no checkpoint removed whose value is read later",
        },
        PassId::ConstantOps => PassDescriptor {
            name: "constant_ops",
            inputs: &[PassId::Checkpoints],
            outputs: &[ArtifactId::ConstantRewrites],
            invariants: "only non-outer X * ones rewritten, graph edges stay symmetric",
        },
    }
}

impl PassId {
    pub fn name(self) -> &'static str {
        descriptor(self).name
    }

    /// Look a pass up by its descriptor name.
    pub fn from_name(name: &str) -> Option<PassId> {
        ALL_PASSES.into_iter().find(|p| p.name() == name)
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in execution order.
pub const ALL_PASSES: [PassId; 7] = [
    PassId::SelectCandidates,
    PassId::ProbeUnary,
    PassId::Propagate,
    PassId::RemoveUnused,
    PassId::FlagRecompile,
    PassId::Checkpoints,
    PassId::ConstantOps,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_checkpoints_skips_function_table_passes() {
        let passes = required_passes(PassId::Checkpoints);
        assert_eq!(
            passes,
            vec![
                PassId::SelectCandidates,
                PassId::ProbeUnary,
                PassId::Propagate,
                PassId::Checkpoints
            ]
        );
        assert!(!passes.contains(&PassId::RemoveUnused));
        assert!(!passes.contains(&PassId::FlagRecompile));
    }

    #[test]
    fn required_passes_select_is_minimal() {
        assert_eq!(
            required_passes(PassId::SelectCandidates),
            vec![PassId::SelectCandidates]
        );
    }

    #[test]
    fn names_round_trip() {
        for pass in ALL_PASSES {
            assert_eq!(PassId::from_name(pass.name()), Some(pass));
        }
        assert_eq!(PassId::from_name("parse"), None);
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            assert!(
                !desc.outputs.is_empty(),
                "pass {:?} has no outputs declared",
                pass
            );
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            for dep in desc.inputs {
                // Dependency must come before this pass in topological order
                let dep_passes = required_passes(*pass);
                let dep_pos = dep_passes.iter().position(|p| p == dep);
                let self_pos = dep_passes.iter().position(|p| p == pass);
                assert!(
                    dep_pos.unwrap() < self_pos.unwrap(),
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }
}
