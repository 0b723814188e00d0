// const_ops.rs — Constant-operand elimination for multiplications by ones
//
// Tracks variables bound to an all-ones matrix generator along the
// top-level block sequence. A later elementwise `X * ones` has its second
// operand replaced by the literal 1, which downstream simplification then
// removes. Outer products are left alone: there the operand shapes the
// result.
//
// Preconditions: propagation has run.
// Postconditions: rewritten multiplications keep their size annotation.
// Side effects: adds literal nodes to the arena and rewires edges.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::dag::{
    BinaryOp, DataGenMethod, DataKind, OpGraph, OpKind, ScalarValue, SizeInfo, VisitSet,
};
use crate::id::NodeId;
use crate::program::{Block, Program};

/// One multiplication whose ones operand was replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstantRewrite {
    /// The multiplication node.
    pub node: NodeId,
    /// The all-ones variable that was read.
    pub variable: String,
    /// The literal now in its place.
    pub literal: NodeId,
}

/// Rewrite multiplications by tracked all-ones matrices.
pub fn remove_constant_binary_ops(program: &mut Program) -> Vec<ConstantRewrite> {
    let Program { graph, blocks, .. } = program;
    let mut ones: BTreeSet<String> = BTreeSet::new();
    let mut rewrites = Vec::new();
    let mut visit = VisitSet::for_graph(graph);

    for block in blocks.iter() {
        for var in block.variables_updated(graph) {
            ones.remove(&var);
        }
        if !ones.is_empty() {
            rewrite_block(graph, block, &ones, &mut visit, &mut rewrites);
        }
        if let Block::Generic { roots, .. } = block {
            collect_ones(graph, roots, &mut ones);
        }
    }
    rewrites
}

/// Record writes whose input is a generator of constant 1.
fn collect_ones(graph: &OpGraph, roots: &[NodeId], ones: &mut BTreeSet<String>) {
    for &root in roots {
        let OpKind::Write { name } = &graph[root].kind else {
            continue;
        };
        let Some(&input) = graph[root].inputs.first() else {
            continue;
        };
        if matches!(
            graph[input].kind,
            OpKind::DataGen {
                method: DataGenMethod::Rand,
                value: Some(v),
            } if v == 1.0
        ) {
            ones.insert(name.clone());
        }
    }
}

fn rewrite_block(
    graph: &mut OpGraph,
    block: &Block,
    ones: &BTreeSet<String>,
    visit: &mut VisitSet,
    rewrites: &mut Vec<ConstantRewrite>,
) {
    match block {
        Block::Generic { roots, .. } => {
            visit.clear();
            for id in graph.post_order(roots, visit) {
                rewrite_node(graph, id, ones, rewrites);
            }
        }
        _ => {
            for body in block.bodies() {
                for child in body {
                    rewrite_block(graph, child, ones, visit, rewrites);
                }
            }
        }
    }
}

fn rewrite_node(
    graph: &mut OpGraph,
    id: NodeId,
    ones: &BTreeSet<String>,
    rewrites: &mut Vec<ConstantRewrite>,
) {
    let op = &graph[id];
    if !matches!(
        op.kind,
        OpKind::Binary {
            op: BinaryOp::Mult,
            outer: false
        }
    ) {
        return;
    }
    let (Some(&left), Some(&right)) = (op.inputs.first(), op.inputs.get(1)) else {
        return;
    };
    if graph[left].data_kind != DataKind::Matrix {
        return;
    }
    let OpKind::Read { name } = &graph[right].kind else {
        return;
    };
    if !ones.contains(name) {
        return;
    }
    let variable = name.clone();

    let literal = graph.add(OpKind::Literal(ScalarValue::Int(1)), DataKind::Scalar, vec![]);
    graph[literal].size = SizeInfo::SCALAR;
    graph.replace_input(id, 1, literal);
    debug!(node = %id, variable = %variable, "replaced ones operand with literal");
    rewrites.push(ConstantRewrite {
        node: id,
        variable,
        literal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;

    /// `ones = matrix(1, 10, 10); X = rand(10, 10)`
    fn ones_then(b: &mut ProgramBuilder) {
        let ones = b.matrix(10, 10, Some(1.0));
        let w = b.write("ones", ones);
        b.push(ProgramBuilder::generic(vec![w]));
        let x = b.matrix(10, 10, None);
        let wx = b.write("X", x);
        b.push(ProgramBuilder::generic(vec![wx]));
    }

    #[test]
    fn multiply_by_ones_is_rewritten() {
        let mut b = ProgramBuilder::new();
        ones_then(&mut b);
        let x = b.read("X");
        let o = b.read("ones");
        let m = b.binary(BinaryOp::Mult, x, o);
        let w = b.write("Y", m);
        b.push(ProgramBuilder::generic(vec![w]));
        let mut program = b.finish();

        let rewrites = remove_constant_binary_ops(&mut program);
        assert_eq!(rewrites.len(), 1);
        let lit = rewrites[0].literal;
        assert_eq!(program.graph[m].inputs, vec![x, lit]);
        assert!(program.graph[o].parents.is_empty());
        assert_eq!(program.graph[lit].parents, vec![m]);
        assert!(program.validate().is_ok());
    }

    #[test]
    fn reassignment_stops_tracking() {
        let mut b = ProgramBuilder::new();
        ones_then(&mut b);
        let other = b.matrix(10, 10, Some(2.0));
        let w2 = b.write("ones", other);
        b.push(ProgramBuilder::generic(vec![w2]));
        let x = b.read("X");
        let o = b.read("ones");
        let m = b.binary(BinaryOp::Mult, x, o);
        let w = b.write("Y", m);
        b.push(ProgramBuilder::generic(vec![w]));
        let mut program = b.finish();

        assert!(remove_constant_binary_ops(&mut program).is_empty());
        assert_eq!(program.graph[m].inputs, vec![x, o]);
    }

    #[test]
    fn outer_and_swapped_operands_are_kept() {
        let mut b = ProgramBuilder::new();
        ones_then(&mut b);
        let x = b.read("X");
        let o = b.read("ones");
        let outer = b.outer(BinaryOp::Mult, x, o);
        let o2 = b.read("ones");
        let x2 = b.read("X");
        let swapped = b.binary(BinaryOp::Mult, o2, x2);
        let w1 = b.write("A", outer);
        let w2 = b.write("B", swapped);
        b.push(ProgramBuilder::generic(vec![w1, w2]));
        let mut program = b.finish();

        // `ones * X` has the ones matrix first; only the second operand is
        // checked.
        assert!(remove_constant_binary_ops(&mut program).is_empty());
    }

    #[test]
    fn rewrites_reach_into_loop_bodies() {
        let mut b = ProgramBuilder::new();
        ones_then(&mut b);
        let p = b.lit(true);
        let x = b.read("X");
        let o = b.read("ones");
        let m = b.binary(BinaryOp::Mult, x, o);
        let w = b.write("Y", m);
        b.push(Block::While {
            predicate: p,
            body: vec![ProgramBuilder::generic(vec![w])],
        });
        let mut program = b.finish();

        let rewrites = remove_constant_binary_ops(&mut program);
        assert_eq!(rewrites.len(), 1);
        assert_eq!(rewrites[0].node, m);
        assert_eq!(rewrites[0].variable, "ones");
    }
}
