// propagate.rs — Control-flow aware size propagation across blocks
//
// Threads one `VarMap` through a block tree. Generic blocks refresh their
// operation graph bottom-up and publish the sizes of written variables;
// conditionals run both branches on copies and reconcile; loops run the
// body once, reconcile against the pre-loop state and run one more pass
// when anything changed. Function-call nodes are handed to the call handler
// (call.rs) after the surrounding graph has been refreshed.
//
// Preconditions: program validated; candidate set and shape-preserving
//   set computed for the same program.
// Postconditions: every visited node carries exact-or-Unknown sizes; `vars`
//   holds the state after the block list.
// Failure modes: size inference failure (wrapped per node), calls to unknown
//   functions, call arity mismatches.
// Side effects: rewrites node sizes in the graph.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use serde::Serialize;
use tracing::trace;

use crate::candidates::CandidateSet;
use crate::config::IpaConfig;
use crate::dag::{DataKind, OpGraph, OpKind, SizeInfo, VisitSet};
use crate::diag::IpaError;
use crate::id::{FunctionKey, NodeId};
use crate::program::{Block, FunctionTable};
use crate::rules::{scalar_value, SizeRefresh};
use crate::varmap::{VarMap, VarValue};

/// How function-call nodes were resolved during a propagation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    /// Callee bodies analyzed with bound arguments.
    pub analyzed: usize,
    /// Outputs taken from the input shape of a shape-preserving function.
    pub shape_preserving: usize,
    /// Outputs inferred from the external routine table.
    pub external: usize,
    /// Outputs set to Unknown (non-candidates, recursion, unknown routines).
    pub unknown: usize,
}

pub struct Propagator<'p> {
    pub(crate) graph: &'p mut OpGraph,
    pub(crate) functions: &'p FunctionTable,
    pub(crate) rules: &'p dyn SizeRefresh,
    pub(crate) candidates: &'p CandidateSet,
    pub(crate) shape_preserving: &'p BTreeSet<FunctionKey>,
    pub(crate) config: &'p IpaConfig,
    /// Functions currently being analyzed; a key never appears twice.
    pub(crate) stack: Vec<FunctionKey>,
    pub(crate) stats: CallStats,
    visit: VisitSet,
    /// Variables updated per block, keyed by address. Blocks are borrowed
    /// for `'p`, so an address names one block for the propagator's life.
    updated: HashMap<*const Block, Rc<BTreeSet<String>>>,
}

impl<'p> Propagator<'p> {
    pub fn new(
        graph: &'p mut OpGraph,
        functions: &'p FunctionTable,
        rules: &'p dyn SizeRefresh,
        candidates: &'p CandidateSet,
        shape_preserving: &'p BTreeSet<FunctionKey>,
        config: &'p IpaConfig,
    ) -> Self {
        let visit = VisitSet::for_graph(graph);
        Propagator {
            graph,
            functions,
            rules,
            candidates,
            shape_preserving,
            config,
            stack: Vec::new(),
            stats: CallStats::default(),
            visit,
            updated: HashMap::new(),
        }
    }

    pub fn stats(&self) -> CallStats {
        self.stats
    }

    /// Propagate through a block list in order. Also used for function
    /// bodies, with the map prepared by the caller.
    pub fn propagate_blocks(&mut self, blocks: &'p [Block], vars: &mut VarMap) -> Result<(), IpaError> {
        for block in blocks {
            self.propagate_block(block, vars)?;
        }
        Ok(())
    }

    pub fn propagate_block(&mut self, block: &'p Block, vars: &mut VarMap) -> Result<(), IpaError> {
        let updated = self.variables_updated(block);
        match block {
            Block::Generic { roots, .. } => {
                trace!(roots = roots.len(), "generic block");
                vars.remove_scalars(updated.iter());
                self.refresh_dag(roots, vars)?;
                self.extract_outputs(roots, vars);
                self.visit.clear();
                let order = self.graph.post_order(roots, &mut self.visit);
                for id in order {
                    if matches!(self.graph[id].kind, OpKind::Call(_)) {
                        self.handle_call(id, vars)?;
                    }
                }
            }
            Block::If {
                predicate,
                if_body,
                else_body,
                ..
            } => {
                trace!(updated = updated.len(), "if block");
                self.refresh_dag(&[*predicate], vars)?;
                let old = vars.clone();
                let mut else_vars = vars.clone();
                self.propagate_blocks(if_body, vars)?;
                self.propagate_blocks(else_body, &mut else_vars)?;
                *vars = reconcile_branches(&old, vars, &else_vars, &updated);
            }
            Block::While { body, .. } | Block::For { body, .. } => {
                trace!(updated = updated.len(), "loop block");
                let predicates = block.predicates();
                self.refresh_dag(&predicates, vars)?;
                vars.remove_scalars(updated.iter());
                let old = vars.clone();
                self.propagate_blocks(body, vars)?;
                // Any field change reruns, nnz included, not only dimensions.
                if reconcile_loop(&old, vars, &updated) {
                    self.refresh_dag(&predicates, vars)?;
                    self.propagate_blocks(body, vars)?;
                    // The exit state must hold for zero, one or many
                    // iterations, so the second pass is checked again.
                    reconcile_loop(&old, vars, &updated);
                }
                vars.remove_scalars(updated.iter());
            }
        }
        Ok(())
    }

    fn variables_updated(&mut self, block: &'p Block) -> Rc<BTreeSet<String>> {
        let graph = &*self.graph;
        let names = self
            .updated
            .entry(block as *const Block)
            .or_insert_with(|| Rc::new(block.variables_updated(graph)));
        Rc::clone(names)
    }

    /// Refresh every node reachable from `roots`, children first.
    pub(crate) fn refresh_dag(&mut self, roots: &[NodeId], vars: &VarMap) -> Result<(), IpaError> {
        self.visit.clear();
        let order = self.graph.post_order(roots, &mut self.visit);
        for id in order {
            let size = self.refresh_node(id, vars)?;
            self.graph[id].size = size;
        }
        Ok(())
    }

    fn refresh_node(&self, id: NodeId, vars: &VarMap) -> Result<SizeInfo, IpaError> {
        let op = &self.graph[id];
        if let OpKind::Read { name } = &op.kind {
            return Ok(match (op.data_kind, vars.get(name)) {
                (DataKind::Scalar, _) => SizeInfo::SCALAR,
                (_, Some(VarValue::Matrix(size))) => *size,
                _ => op.size,
            });
        }
        self.rules
            .refresh(&*self.graph, id, vars)
            .map_err(|source| IpaError::SizeInference { node: id, source })
    }

    /// Publish the sizes of variable writes among `roots`.
    fn extract_outputs(&self, roots: &[NodeId], vars: &mut VarMap) {
        for &root in roots {
            let op = &self.graph[root];
            let OpKind::Write { name } = &op.kind else {
                continue;
            };
            match op.data_kind {
                DataKind::Matrix | DataKind::Frame => vars.set_matrix(name.as_str(), op.size),
                DataKind::Scalar => {
                    let value = op
                        .inputs
                        .first()
                        .and_then(|input| scalar_value(&*self.graph, *input, vars));
                    if let Some(value) = value {
                        vars.set_scalar(name.as_str(), Some(value));
                    }
                }
                DataKind::Unknown => {}
            }
        }
    }
}

/// Merge the states after the two branches of a conditional. Only the
/// variables updated inside the conditional can differ.
fn reconcile_branches(
    old: &VarMap,
    if_vars: &VarMap,
    else_vars: &VarMap,
    updated: &BTreeSet<String>,
) -> VarMap {
    let mut merged = old.clone();
    for name in updated {
        let value = match (if_vars.get(name), else_vars.get(name)) {
            (Some(a), Some(b)) => Some(a.reconcile(b)),
            (Some(one), None) | (None, Some(one)) => Some(match old.get(name) {
                Some(prev) => prev.reconcile(one),
                None => one.unknown_like(),
            }),
            (None, None) => None,
        };
        match value {
            Some(value) => merged.insert(name.as_str(), value),
            None => {
                merged.remove(name);
            }
        }
    }
    merged.purge_unknown_scalars();
    merged
}

/// Reconcile matrix variables updated in a loop body against their
/// pre-loop state, field by field. Returns whether any field changed.
fn reconcile_loop(old: &VarMap, vars: &mut VarMap, updated: &BTreeSet<String>) -> bool {
    let mut changed = false;
    for name in updated {
        let (Some(before), Some(after)) = (old.matrix(name), vars.matrix(name)) else {
            continue;
        };
        if before != after {
            vars.set_matrix(name.as_str(), before.reconcile(&after));
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;
    use crate::dag::{BinaryOp, ScalarValue};
    use crate::rules::StandardRules;

    fn run(program: &mut crate::program::Program) -> VarMap {
        let candidates = CandidateSet::default();
        let shape = BTreeSet::new();
        let config = IpaConfig::default();
        let mut vars = VarMap::new();
        let mut prop = Propagator::new(
            &mut program.graph,
            &program.functions,
            &StandardRules,
            &candidates,
            &shape,
            &config,
        );
        prop.propagate_blocks(&program.blocks, &mut vars).unwrap();
        vars
    }

    #[test]
    fn generic_block_publishes_writes_and_refreshes_reads() {
        let mut b = ProgramBuilder::new();
        let x = b.matrix(6, 2, Some(1.0));
        let w = b.write("X", x);
        b.push(ProgramBuilder::generic(vec![w]));
        // Build the read before the write is known so it starts Unknown.
        let mut program = b.finish();
        let r = program
            .graph
            .add(OpKind::Read { name: "X".into() }, DataKind::Matrix, vec![]);
        let t = program.graph.add(OpKind::Transpose, DataKind::Matrix, vec![r]);
        let w2 = program
            .graph
            .add(OpKind::Write { name: "Y".into() }, DataKind::Matrix, vec![t]);
        program.blocks.push(ProgramBuilder::generic(vec![w2]));

        let vars = run(&mut program);
        assert_eq!(vars.matrix("X"), Some(SizeInfo::exact(6, 2, 12)));
        assert_eq!(vars.matrix("Y"), Some(SizeInfo::exact(2, 6, 12)));
        assert_eq!(program.graph[r].size, SizeInfo::exact(6, 2, 12));
    }

    #[test]
    fn scalar_constants_flow_into_generators() {
        let mut b = ProgramBuilder::new();
        let n = b.lit(5);
        let wn = b.write("n", n);
        b.push(ProgramBuilder::generic(vec![wn]));
        let mut program = b.finish();
        let rn = program
            .graph
            .add(OpKind::Read { name: "n".into() }, DataKind::Scalar, vec![]);
        let one = program.graph.add(
            OpKind::Literal(ScalarValue::Int(1)),
            DataKind::Scalar,
            vec![],
        );
        let gen = program.graph.add(
            OpKind::DataGen {
                method: crate::dag::DataGenMethod::Rand,
                value: None,
            },
            DataKind::Matrix,
            vec![rn, one],
        );
        let w = program
            .graph
            .add(OpKind::Write { name: "V".into() }, DataKind::Matrix, vec![gen]);
        program.blocks.push(ProgramBuilder::generic(vec![w]));

        let vars = run(&mut program);
        assert_eq!(vars.constant("n"), Some(&ScalarValue::Int(5)));
        assert_eq!(vars.matrix("V"), Some(SizeInfo::dims(5, 1)));
    }

    #[test]
    fn loop_growing_variable_loses_changed_fields_only() {
        // X = rand(10, 3); while(p) { X = rbind(X, X) }
        let mut b = ProgramBuilder::new();
        let x = b.matrix(10, 3, None);
        let w = b.write("X", x);
        b.push(ProgramBuilder::generic(vec![w]));
        let p = b.lit(true);
        let r1 = b.read("X");
        let r2 = b.read("X");
        let grow = b.binary(BinaryOp::Rbind, r1, r2);
        let wg = b.write("X", grow);
        b.push(Block::While {
            predicate: p,
            body: vec![ProgramBuilder::generic(vec![wg])],
        });
        let mut program = b.finish();

        let vars = run(&mut program);
        assert_eq!(vars.matrix("X"), Some(SizeInfo::new(None, Some(3), None)));
    }

    #[test]
    fn updated_sets_are_computed_once_per_block() {
        // X = rand(10, 3); while(p) { X = rbind(X, X) }, propagated twice.
        let mut b = ProgramBuilder::new();
        let x = b.matrix(10, 3, None);
        let w = b.write("X", x);
        b.push(ProgramBuilder::generic(vec![w]));
        let p = b.lit(true);
        let r1 = b.read("X");
        let r2 = b.read("X");
        let grow = b.binary(BinaryOp::Rbind, r1, r2);
        let wg = b.write("X", grow);
        b.push(Block::While {
            predicate: p,
            body: vec![ProgramBuilder::generic(vec![wg])],
        });
        let mut program = b.finish();

        let candidates = CandidateSet::default();
        let shape = BTreeSet::new();
        let config = IpaConfig::default();
        let mut prop = Propagator::new(
            &mut program.graph,
            &program.functions,
            &StandardRules,
            &candidates,
            &shape,
            &config,
        );
        for _ in 0..2 {
            prop.propagate_blocks(&program.blocks, &mut VarMap::new()).unwrap();
        }
        // Main generic, the loop and its body block.
        assert_eq!(prop.updated.len(), 3);
        let loop_block = &program.blocks[1];
        let names = &prop.updated[&(loop_block as *const Block)];
        assert_eq!(names.iter().collect::<Vec<_>>(), vec!["X"]);
    }

    #[test]
    fn branch_merge_is_field_wise() {
        // if (p) X = rand(4, 4) else X = rand(4, 7)
        let mut b = ProgramBuilder::new();
        let p = b.lit(true);
        let a = b.matrix(4, 4, None);
        let wa = b.write("X", a);
        let c = b.matrix(4, 7, None);
        let wc = b.write("X", c);
        b.push(Block::If {
            predicate: p,
            if_body: vec![ProgramBuilder::generic(vec![wa])],
            else_body: vec![ProgramBuilder::generic(vec![wc])],
            predicate_requires_recompile: false,
        });
        let mut program = b.finish();

        let vars = run(&mut program);
        assert_eq!(vars.matrix("X"), Some(SizeInfo::new(Some(4), None, None)));
    }

    #[test]
    fn conflicting_scalar_constants_are_purged() {
        let mut b = ProgramBuilder::new();
        let p = b.lit(true);
        let one = b.lit(1);
        let w1 = b.write("k", one);
        let two = b.lit(2);
        let w2 = b.write("k", two);
        b.push(Block::If {
            predicate: p,
            if_body: vec![ProgramBuilder::generic(vec![w1])],
            else_body: vec![ProgramBuilder::generic(vec![w2])],
            predicate_requires_recompile: false,
        });
        let mut program = b.finish();

        let vars = run(&mut program);
        assert!(!vars.contains("k"));
    }

    #[test]
    fn refresh_failure_names_the_node() {
        let mut b = ProgramBuilder::new();
        let bad = b.other("broken", DataKind::Matrix, vec![]);
        let w = b.write("X", bad);
        b.push(ProgramBuilder::generic(vec![w]));
        let mut program = b.finish();

        let failing = |graph: &OpGraph, node: NodeId, _: &VarMap| -> Result<SizeInfo, crate::rules::RefreshError> {
            if matches!(graph[node].kind, OpKind::Other { .. }) {
                Err(crate::rules::RefreshError::Unsupported("broken".into()))
            } else {
                Ok(graph[node].size)
            }
        };
        let candidates = CandidateSet::default();
        let shape = BTreeSet::new();
        let config = IpaConfig::default();
        let mut prop = Propagator::new(
            &mut program.graph,
            &program.functions,
            &failing,
            &candidates,
            &shape,
            &config,
        );
        let err = prop
            .propagate_blocks(&program.blocks, &mut VarMap::new())
            .unwrap_err();
        assert!(matches!(err, IpaError::SizeInference { node, .. } if node == bad));
    }
}
