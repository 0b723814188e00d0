// rules.rs — Per-operation size inference (collaborator interface)
//
// The propagation engine refreshes every node bottom-up through the
// `SizeRefresh` callback. `StandardRules` covers the built-in operation
// kinds with exact formulas only: whenever a result cannot be derived
// exactly from the inputs, the corresponding field is Unknown.
//
// Preconditions: inputs of `node` have already been refreshed.
// Postconditions: returned statistics are exact or Unknown, never bounds.
// Failure modes: missing inputs, negative literal dimensions, overflow.
// Side effects: none.

use thiserror::Error;

use crate::dag::{
    AggDirection, BinaryOp, DataGenMethod, DataKind, Op, OpGraph, OpKind, ScalarValue, SizeInfo,
    UnaryOp,
};
use crate::id::NodeId;
use crate::varmap::VarMap;

/// Failure reported by a size-inference rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("expected {expected} inputs, found {found}")]
    MissingInput { expected: usize, found: usize },

    #[error("unsupported operation {0}")]
    Unsupported(String),

    #[error("invalid dimension {0}")]
    InvalidDimension(String),

    #[error("dimension overflow")]
    Overflow,
}

/// Recompute a node's statistics from its (already refreshed) inputs.
pub trait SizeRefresh {
    fn refresh(&self, graph: &OpGraph, node: NodeId, vars: &VarMap)
        -> Result<SizeInfo, RefreshError>;
}

impl<F> SizeRefresh for F
where
    F: Fn(&OpGraph, NodeId, &VarMap) -> Result<SizeInfo, RefreshError>,
{
    fn refresh(
        &self,
        graph: &OpGraph,
        node: NodeId,
        vars: &VarMap,
    ) -> Result<SizeInfo, RefreshError> {
        self(graph, node, vars)
    }
}

/// Compile-time value of a scalar-producing node: literals, reads of
/// variables bound to constants, and `nrow`/`ncol` of matrices with known
/// dimensions.
pub fn scalar_value(graph: &OpGraph, id: NodeId, vars: &VarMap) -> Option<ScalarValue> {
    let op = &graph[id];
    match &op.kind {
        OpKind::Literal(v) => Some(v.clone()),
        OpKind::Read { name } if op.data_kind == DataKind::Scalar => vars.constant(name).cloned(),
        OpKind::Unary { op: UnaryOp::Nrow } => {
            let rows = graph[*op.inputs.first()?].size.rows?;
            i64::try_from(rows).ok().map(ScalarValue::Int)
        }
        OpKind::Unary { op: UnaryOp::Ncol } => {
            let cols = graph[*op.inputs.first()?].size.cols?;
            i64::try_from(cols).ok().map(ScalarValue::Int)
        }
        _ => None,
    }
}

/// Exact size formulas for the built-in operation kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRules;

impl SizeRefresh for StandardRules {
    fn refresh(
        &self,
        graph: &OpGraph,
        node: NodeId,
        vars: &VarMap,
    ) -> Result<SizeInfo, RefreshError> {
        let op = &graph[node];
        if op.data_kind == DataKind::Scalar && !matches!(op.kind, OpKind::Call(_)) {
            // Inputs are still checked so malformed scalar ops are reported.
            check_arity(op)?;
            return Ok(SizeInfo::SCALAR);
        }
        match &op.kind {
            OpKind::Literal(_) => Ok(SizeInfo::SCALAR),
            OpKind::Read { .. }
            | OpKind::PersistentRead { .. }
            | OpKind::Call(_)
            | OpKind::Other { .. } => Ok(op.size),
            OpKind::Write { .. } | OpKind::PersistentWrite { .. } => Ok(input(graph, op, 0)?.size),
            OpKind::DataGen {
                method: DataGenMethod::Rand,
                value,
            } => rand_size(graph, op, *value, vars),
            OpKind::DataGen {
                method: DataGenMethod::Seq,
                ..
            } => seq_size(graph, op, vars),
            OpKind::Binary { op: bop, outer } => binary_size(graph, op, *bop, *outer),
            OpKind::Unary { op: uop } => unary_size(graph, op, *uop),
            OpKind::Aggregate { direction, .. } => {
                let x = input(graph, op, 0)?.size;
                Ok(match direction {
                    AggDirection::Full => SizeInfo::SCALAR,
                    AggDirection::Row => SizeInfo::new(x.rows, Some(1), None),
                    AggDirection::Col => SizeInfo::new(Some(1), x.cols, None),
                })
            }
            OpKind::MatMult => {
                let (l, r) = (input(graph, op, 0)?.size, input(graph, op, 1)?.size);
                Ok(SizeInfo::new(l.rows, r.cols, None))
            }
            OpKind::Transpose => {
                let x = input(graph, op, 0)?.size;
                Ok(SizeInfo::new(x.cols, x.rows, x.nnz))
            }
        }
    }
}

fn input<'g>(graph: &'g OpGraph, op: &Op, pos: usize) -> Result<&'g Op, RefreshError> {
    op.inputs
        .get(pos)
        .map(|id| &graph[*id])
        .ok_or(RefreshError::MissingInput {
            expected: pos + 1,
            found: op.inputs.len(),
        })
}

fn check_arity(op: &Op) -> Result<(), RefreshError> {
    let expected = match &op.kind {
        OpKind::Write { .. }
        | OpKind::PersistentWrite { .. }
        | OpKind::Unary { .. }
        | OpKind::Aggregate { .. }
        | OpKind::Transpose => 1,
        OpKind::Binary { .. } | OpKind::MatMult => 2,
        _ => 0,
    };
    if op.inputs.len() < expected {
        return Err(RefreshError::MissingInput {
            expected,
            found: op.inputs.len(),
        });
    }
    Ok(())
}

/// Dimension argument of a data generator. Negative constants are errors;
/// non-constant arguments are Unknown.
fn dim_arg(graph: &OpGraph, id: NodeId, vars: &VarMap) -> Result<Option<u64>, RefreshError> {
    match scalar_value(graph, id, vars) {
        None => Ok(None),
        Some(v) => match v.as_u64() {
            Some(n) => Ok(Some(n)),
            None if v.as_f64().is_some_and(|f| f < 0.0) => {
                Err(RefreshError::InvalidDimension(v.to_string()))
            }
            None => Ok(None),
        },
    }
}

fn rand_size(
    graph: &OpGraph,
    op: &Op,
    value: Option<f64>,
    vars: &VarMap,
) -> Result<SizeInfo, RefreshError> {
    let rows = dim_arg(graph, input(graph, op, 0)?.id, vars)?;
    let cols = dim_arg(graph, input(graph, op, 1)?.id, vars)?;
    let nnz = match (rows, cols, value) {
        (_, _, Some(v)) if v == 0.0 => Some(0),
        (Some(r), Some(c), Some(_)) => Some(r.checked_mul(c).ok_or(RefreshError::Overflow)?),
        _ => None,
    };
    Ok(SizeInfo::new(rows, cols, nnz))
}

fn seq_size(graph: &OpGraph, op: &Op, vars: &VarMap) -> Result<SizeInfo, RefreshError> {
    let from = scalar_value(graph, input(graph, op, 0)?.id, vars).and_then(|v| v.as_f64());
    let to = scalar_value(graph, input(graph, op, 1)?.id, vars).and_then(|v| v.as_f64());
    let incr = match op.inputs.get(2) {
        Some(id) => scalar_value(graph, *id, vars).and_then(|v| v.as_f64()),
        None => from.zip(to).map(|(f, t)| if f <= t { 1.0 } else { -1.0 }),
    };
    let rows = match (from, to, incr) {
        (Some(f), Some(t), Some(i)) if i != 0.0 => {
            let steps = ((t - f) / i).floor();
            // Rejects NaN and infinite bounds as well as counts past u64.
            if !(0.0..u64::MAX as f64).contains(&steps) {
                return Err(RefreshError::InvalidDimension(format!(
                    "seq({}, {}, {})",
                    f, t, i
                )));
            }
            Some((steps as u64).checked_add(1).ok_or(RefreshError::Overflow)?)
        }
        _ => None,
    };
    Ok(SizeInfo::new(rows, Some(1), None))
}

fn binary_size(
    graph: &OpGraph,
    op: &Op,
    bop: BinaryOp,
    outer: bool,
) -> Result<SizeInfo, RefreshError> {
    let (l, r) = (input(graph, op, 0)?, input(graph, op, 1)?);
    let (ls, rs) = (l.size, r.size);
    let sum = |a: Option<u64>, b: Option<u64>| -> Result<Option<u64>, RefreshError> {
        match (a, b) {
            (Some(a), Some(b)) => a.checked_add(b).map(Some).ok_or(RefreshError::Overflow),
            _ => Ok(None),
        }
    };
    match bop {
        BinaryOp::Cbind => Ok(SizeInfo::new(
            ls.rows.or(rs.rows),
            sum(ls.cols, rs.cols)?,
            sum(ls.nnz, rs.nnz)?,
        )),
        BinaryOp::Rbind => Ok(SizeInfo::new(
            sum(ls.rows, rs.rows)?,
            ls.cols.or(rs.cols),
            sum(ls.nnz, rs.nnz)?,
        )),
        _ if outer => Ok(SizeInfo::new(ls.rows, rs.cols, None)),
        _ => {
            // Matrix-vector operations broadcast the right-hand side, so the
            // left matrix operand determines the output shape.
            let shape = if l.data_kind.is_matrix_like() { ls } else { rs };
            Ok(shape.without_nnz())
        }
    }
}

fn unary_size(graph: &OpGraph, op: &Op, uop: UnaryOp) -> Result<SizeInfo, RefreshError> {
    let x = input(graph, op, 0)?;
    Ok(match uop {
        UnaryOp::CastAsMatrix if x.data_kind == DataKind::Scalar => SizeInfo::dims(1, 1),
        UnaryOp::CastAsMatrix | UnaryOp::CastAsFrame => x.size.without_nnz(),
        // abs(0) = 0 and sqrt(0) = 0, non-zeros stay non-zero
        UnaryOp::Abs | UnaryOp::Sqrt => x.size,
        UnaryOp::CastAsScalar | UnaryOp::Nrow | UnaryOp::Ncol => SizeInfo::SCALAR,
        UnaryOp::Not | UnaryOp::Exp | UnaryOp::Log | UnaryOp::Round => x.size.without_nnz(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(g: &mut OpGraph, v: i64) -> NodeId {
        g.add(OpKind::Literal(ScalarValue::Int(v)), DataKind::Scalar, vec![])
    }

    fn refresh_all(g: &mut OpGraph, vars: &VarMap) {
        for idx in 0..g.len() {
            let id = NodeId(idx as u32);
            let size = StandardRules.refresh(g, id, vars).unwrap();
            g[id].size = size;
        }
    }

    fn rand(g: &mut OpGraph, rows: NodeId, cols: NodeId, value: Option<f64>) -> NodeId {
        g.add(
            OpKind::DataGen {
                method: DataGenMethod::Rand,
                value,
            },
            DataKind::Matrix,
            vec![rows, cols],
        )
    }

    #[test]
    fn constant_rand_has_exact_nnz() {
        let mut g = OpGraph::new();
        let (r, c) = (lit(&mut g, 10), lit(&mut g, 4));
        let ones = rand(&mut g, r, c, Some(1.0));
        let zeros = rand(&mut g, r, c, Some(0.0));
        let random = rand(&mut g, r, c, None);
        refresh_all(&mut g, &VarMap::new());
        assert_eq!(g[ones].size, SizeInfo::exact(10, 4, 40));
        assert_eq!(g[zeros].size, SizeInfo::exact(10, 4, 0));
        assert_eq!(g[random].size, SizeInfo::dims(10, 4));
    }

    #[test]
    fn rand_dims_from_constant_scalar_variable() {
        let mut g = OpGraph::new();
        let n = g.add(OpKind::Read { name: "n".into() }, DataKind::Scalar, vec![]);
        let c = lit(&mut g, 1);
        let x = rand(&mut g, n, c, None);
        let mut vars = VarMap::new();
        vars.set_scalar("n", Some(ScalarValue::Int(7)));
        refresh_all(&mut g, &vars);
        assert_eq!(g[x].size, SizeInfo::dims(7, 1));

        refresh_all(&mut g, &VarMap::new());
        assert_eq!(g[x].size, SizeInfo::new(None, Some(1), None));
    }

    #[test]
    fn negative_dimension_is_an_error() {
        let mut g = OpGraph::new();
        let (r, c) = (lit(&mut g, -1), lit(&mut g, 4));
        let x = rand(&mut g, r, c, None);
        assert_eq!(
            StandardRules.refresh(&g, x, &VarMap::new()),
            Err(RefreshError::InvalidDimension("-1".into()))
        );
    }

    #[test]
    fn seq_length() {
        let mut g = OpGraph::new();
        let (from, to, by) = (lit(&mut g, 1), lit(&mut g, 10), lit(&mut g, 2));
        let s = g.add(
            OpKind::DataGen {
                method: DataGenMethod::Seq,
                value: None,
            },
            DataKind::Matrix,
            vec![from, to, by],
        );
        refresh_all(&mut g, &VarMap::new());
        assert_eq!(g[s].size, SizeInfo::dims(5, 1));
    }

    fn seq_of(g: &mut OpGraph, from: f64, to: f64) -> NodeId {
        let f = g.add(OpKind::Literal(ScalarValue::Double(from)), DataKind::Scalar, vec![]);
        let t = g.add(OpKind::Literal(ScalarValue::Double(to)), DataKind::Scalar, vec![]);
        g.add(
            OpKind::DataGen {
                method: DataGenMethod::Seq,
                value: None,
            },
            DataKind::Matrix,
            vec![f, t],
        )
    }

    #[test]
    fn seq_with_unbounded_length_is_rejected() {
        let mut g = OpGraph::new();
        let huge = seq_of(&mut g, 0.0, 1e20);
        let infinite = seq_of(&mut g, 0.0, f64::INFINITY);
        let nan = seq_of(&mut g, 0.0, f64::NAN);
        for s in [huge, infinite, nan] {
            assert!(matches!(
                StandardRules.refresh(&g, s, &VarMap::new()),
                Err(RefreshError::InvalidDimension(_))
            ));
        }
    }

    #[test]
    fn builder_survives_unbounded_seq() {
        let mut b = crate::builder::ProgramBuilder::new();
        let from = b.lit(0.0);
        let to = b.lit(f64::INFINITY);
        let s = b.seq(from, to, None);
        let program = b.finish();
        assert_eq!(program.graph[s].size.rows, None);
    }

    #[test]
    fn matmult_transpose_and_binds() {
        let mut g = OpGraph::new();
        let (a, b, c) = (lit(&mut g, 10), lit(&mut g, 3), lit(&mut g, 5));
        let x = rand(&mut g, a, b, Some(2.0));
        let y = rand(&mut g, b, c, None);
        let xy = g.add(OpKind::MatMult, DataKind::Matrix, vec![x, y]);
        let xt = g.add(OpKind::Transpose, DataKind::Matrix, vec![x]);
        let xx = g.add(
            OpKind::Binary {
                op: BinaryOp::Cbind,
                outer: false,
            },
            DataKind::Matrix,
            vec![x, x],
        );
        refresh_all(&mut g, &VarMap::new());
        assert_eq!(g[xy].size, SizeInfo::dims(10, 5));
        assert_eq!(g[xt].size, SizeInfo::exact(3, 10, 30));
        assert_eq!(g[xx].size, SizeInfo::exact(10, 6, 60));
    }

    #[test]
    fn elementwise_follows_matrix_operand() {
        let mut g = OpGraph::new();
        let (a, b) = (lit(&mut g, 4), lit(&mut g, 6));
        let x = rand(&mut g, a, b, Some(1.0));
        let two = lit(&mut g, 2);
        let scaled = g.add(
            OpKind::Binary {
                op: BinaryOp::Mult,
                outer: false,
            },
            DataKind::Matrix,
            vec![two, x],
        );
        refresh_all(&mut g, &VarMap::new());
        assert_eq!(g[scaled].size, SizeInfo::dims(4, 6));
    }

    #[test]
    fn nrow_feeds_dimensions() {
        let mut g = OpGraph::new();
        let (a, b) = (lit(&mut g, 4), lit(&mut g, 6));
        let x = rand(&mut g, a, b, None);
        let n = g.add(OpKind::Unary { op: UnaryOp::Nrow }, DataKind::Scalar, vec![x]);
        let one = lit(&mut g, 1);
        let v = rand(&mut g, n, one, Some(0.0));
        refresh_all(&mut g, &VarMap::new());
        assert_eq!(g[v].size, SizeInfo::exact(4, 1, 0));
    }

    #[test]
    fn missing_input_reported() {
        let mut g = OpGraph::new();
        let x = g.add(OpKind::MatMult, DataKind::Matrix, vec![]);
        assert_eq!(
            StandardRules.refresh(&g, x, &VarMap::new()),
            Err(RefreshError::MissingInput {
                expected: 1,
                found: 0
            })
        );
    }

    #[test]
    fn closures_are_collaborators() {
        let rule = |_: &OpGraph, _: NodeId, _: &VarMap| -> Result<SizeInfo, RefreshError> {
            Ok(SizeInfo::dims(1, 1))
        };
        let g = {
            let mut g = OpGraph::new();
            g.add(OpKind::Other { opcode: "x".into() }, DataKind::Matrix, vec![]);
            g
        };
        assert_eq!(
            rule.refresh(&g, NodeId(0), &VarMap::new()),
            Ok(SizeInfo::dims(1, 1))
        );
    }
}
