// udf.rs — Output shapes of known external routines
//
// External functions have no analyzable body. For a small set of native
// routines the output shapes follow from the call's arguments; every other
// routine yields Unknown outputs.

use crate::dag::{OpGraph, OpKind, SizeInfo};
use crate::id::NodeId;

/// Native routines with known output-shape formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routine {
    /// Sorting: same shape and nnz as the input.
    Order,
    /// NaN replacement: same shape as the input.
    DeNan,
    /// -Inf replacement: same shape as the input.
    DeNegInfinity,
    /// Eigen decomposition: eigenvalues (n x 1) and eigenvectors (n x n).
    Eigen,
    /// Solves `A x = b`; `x` has as many rows as `b`.
    LinearSolver,
    /// Matrix read with dimensions passed as arguments 1 and 2.
    DynamicReadMatrix,
    DynamicReadMatrixRc,
}

impl Routine {
    pub fn from_implementation(name: &str) -> Option<Routine> {
        Some(match name {
            "order" => Routine::Order,
            "de_nan" => Routine::DeNan,
            "de_neg_infinity" => Routine::DeNegInfinity,
            "eigen" => Routine::Eigen,
            "linear_solver" => Routine::LinearSolver,
            "dynamic_read_matrix" => Routine::DynamicReadMatrix,
            "dynamic_read_matrix_rc" => Routine::DynamicReadMatrixRc,
            _ => return None,
        })
    }

    /// Sizes of the leading outputs, in declaration order. Outputs beyond
    /// the returned list, and arguments that are missing, are Unknown.
    pub fn output_sizes(self, graph: &OpGraph, args: &[NodeId]) -> Vec<SizeInfo> {
        let arg = |i: usize| {
            args.get(i)
                .map(|id| graph[*id].size)
                .unwrap_or(SizeInfo::UNKNOWN)
        };
        match self {
            Routine::Order => vec![arg(0)],
            Routine::DeNan | Routine::DeNegInfinity => vec![arg(0).without_nnz()],
            Routine::Eigen => {
                let rows = arg(0).rows;
                vec![
                    SizeInfo::new(rows, Some(1), None),
                    SizeInfo::new(rows, rows, None),
                ]
            }
            Routine::LinearSolver => vec![SizeInfo::new(arg(1).rows, Some(1), None)],
            Routine::DynamicReadMatrix | Routine::DynamicReadMatrixRc => {
                let literal = |i: usize| match args.get(i).map(|id| &graph[*id].kind) {
                    Some(OpKind::Literal(v)) => v.as_u64(),
                    _ => None,
                };
                match (literal(1), literal(2)) {
                    (Some(rows), Some(cols)) => vec![SizeInfo::dims(rows, cols)],
                    _ => vec![SizeInfo::UNKNOWN],
                }
            }
        }
    }
}
