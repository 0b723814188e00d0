// unary.rs — Detection of shape-preserving unary functions
//
// A function pruned from the candidate set can still give its call sites an
// exact output shape when it maps a matrix to a matrix of the same shape.
// The body is analyzed once against a synthetic non-square input; functions
// whose output comes back with the same dimensions are recorded.
//
// Preconditions: candidate selection has run; `keys` holds non-candidates.
// Postconditions: node sizes of probed bodies carry no fact derived from
//   the synthetic input (a reset pass with an Unknown input follows).
// Failure modes: size inference failures inside probed bodies.
// Side effects: rewrites node sizes in probed bodies.

use std::collections::BTreeSet;

use tracing::debug;

use crate::candidates::CandidateSet;
use crate::config::IpaConfig;
use crate::dag::{DataKind, OpGraph, SizeInfo};
use crate::diag::IpaError;
use crate::id::FunctionKey;
use crate::program::{Function, FunctionTable};
use crate::propagate::Propagator;
use crate::rules::SizeRefresh;
use crate::varmap::VarMap;

/// Synthetic input shape; non-square so transposes are caught.
pub const PROBE_ROWS: u64 = 7777;
pub const PROBE_COLS: u64 = 3333;

/// Probe each of `keys` and return the shape-preserving ones.
pub fn probe_unary_functions<'k>(
    graph: &mut OpGraph,
    functions: &FunctionTable,
    rules: &dyn SizeRefresh,
    config: &IpaConfig,
    keys: impl IntoIterator<Item = &'k FunctionKey>,
) -> Result<BTreeSet<FunctionKey>, IpaError> {
    let mut preserving = BTreeSet::new();
    for key in keys {
        let function = functions.lookup(key)?;
        if probe(graph, functions, rules, config, function)? {
            debug!(function = %key, "shape-preserving unary function");
            preserving.insert(key.clone());
        }
    }
    Ok(preserving)
}

/// Whether `function` is unary over matrices.
pub fn is_unary_matrix_function(function: &Function) -> bool {
    !function.is_external()
        && function.inputs.len() == 1
        && function.inputs[0].data_kind == DataKind::Matrix
        && function.outputs.len() == 1
        && function.outputs[0].data_kind == DataKind::Matrix
}

fn probe(
    graph: &mut OpGraph,
    functions: &FunctionTable,
    rules: &dyn SizeRefresh,
    config: &IpaConfig,
    function: &Function,
) -> Result<bool, IpaError> {
    let Some(blocks) = function.blocks() else {
        return Ok(false);
    };
    if !is_unary_matrix_function(function) {
        return Ok(false);
    }
    let (input, output) = (&function.inputs[0].name, &function.outputs[0].name);

    // Nested calls inside the body resolve to Unknown outputs.
    let candidates = CandidateSet::default();
    let shape_preserving = BTreeSet::new();
    let mut prop = Propagator::new(graph, functions, rules, &candidates, &shape_preserving, config);

    let mut vars = VarMap::new();
    vars.set_matrix(input.as_str(), SizeInfo::dims(PROBE_ROWS, PROBE_COLS));
    prop.propagate_blocks(blocks, &mut vars)?;
    let preserved = vars
        .matrix(output)
        .is_some_and(|out| out.rows == Some(PROBE_ROWS) && out.cols == Some(PROBE_COLS));

    let mut reset = VarMap::new();
    reset.set_matrix(input.as_str(), SizeInfo::UNKNOWN);
    prop.propagate_blocks(blocks, &mut reset)?;

    Ok(preserved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;
    use crate::dag::{AggDirection, AggOp, BinaryOp, UnaryOp};
    use crate::id::NodeId;
    use crate::program::{Program, DEFAULT_NAMESPACE};
    use crate::rules::StandardRules;

    fn key(name: &str) -> FunctionKey {
        FunctionKey::new(DEFAULT_NAMESPACE, name)
    }

    fn unary(
        b: &mut ProgramBuilder,
        name: &str,
        body: impl FnOnce(&mut ProgramBuilder, NodeId) -> NodeId,
    ) {
        b.function(
            key(name),
            &[("A", DataKind::Matrix)],
            &[("B", DataKind::Matrix)],
            |b| {
                let a = b.read("A");
                let out = body(b, a);
                let w = b.write("B", out);
                vec![ProgramBuilder::generic(vec![w])]
            },
        );
    }

    fn probe_all(b: ProgramBuilder) -> (BTreeSet<FunctionKey>, Program) {
        let mut program = b.finish();
        let keys = program.functions.keys();
        let set = probe_unary_functions(
            &mut program.graph,
            &program.functions,
            &StandardRules,
            &IpaConfig::default(),
            &keys,
        )
        .unwrap();
        (set, program)
    }

    #[test]
    fn elementwise_body_preserves_shape() {
        let mut b = ProgramBuilder::new();
        unary(&mut b, "scale", |b, a| {
            let two = b.lit(2);
            b.binary(BinaryOp::Mult, a, two)
        });
        unary(&mut b, "flip", |b, a| b.transpose(a));
        unary(&mut b, "rowsums", |b, a| b.agg(AggOp::Sum, AggDirection::Row, a));
        let (set, _) = probe_all(b);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![key("scale")]);
    }

    #[test]
    fn probe_leaves_no_synthetic_sizes_behind() {
        let mut b = ProgramBuilder::new();
        unary(&mut b, "abs", |b, a| b.unary(UnaryOp::Abs, a));
        let (set, program) = probe_all(b);
        assert!(set.contains(&key("abs")));
        for op in program.graph.iter() {
            assert_ne!(op.size.rows, Some(PROBE_ROWS), "{} kept probe rows", op.id);
        }
    }

    #[test]
    fn non_unary_signatures_are_skipped() {
        let mut b = ProgramBuilder::new();
        b.function(
            key("pair"),
            &[("A", DataKind::Matrix), ("k", DataKind::Scalar)],
            &[("B", DataKind::Matrix)],
            |b| {
                let a = b.read("A");
                let w = b.write("B", a);
                vec![ProgramBuilder::generic(vec![w])]
            },
        );
        b.external_function(
            key("ext"),
            &[("A", DataKind::Matrix)],
            &[("B", DataKind::Matrix)],
            "order",
        );
        let (set, _) = probe_all(b);
        assert!(set.is_empty());
    }
}
