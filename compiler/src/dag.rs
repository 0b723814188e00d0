// dag.rs — Operation graph arena
//
// All operation nodes of a program (main blocks and function bodies) live in
// one `OpGraph` arena addressed by `NodeId`. Child links (`inputs`) and
// back-references (`parents`) are index lists and must stay symmetric; the
// front-end establishes this and `validate` checks it once at entry.
//
// Traversal state is never stored on nodes. Every walk takes a `VisitSet`
// owned and reset by its caller.
//
// Preconditions: none.
// Postconditions: `add` and `replace_input` preserve parent/child symmetry.
// Failure modes: `validate` reports dangling or asymmetric references.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::diag::IpaError;
use crate::id::NodeId;

/// Sparsity below which a matrix is assumed to be stored in sparse format.
const SPARSE_THRESHOLD: f64 = 0.4;

// ── Values and statistics ───────────────────────────────────────────────────

/// Data type of an operation's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Scalar,
    Matrix,
    Frame,
    /// Multi-output function calls have no single result type.
    Unknown,
}

impl DataKind {
    /// Matrices and frames carry dimension statistics.
    pub fn is_matrix_like(self) -> bool {
        matches!(self, DataKind::Matrix | DataKind::Frame)
    }
}

/// A compile-time scalar constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarValue {
    Int(i64),
    Double(f64),
    Bool(bool),
    Str(String),
}

impl ScalarValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int(v) => Some(*v as f64),
            ScalarValue::Double(v) => Some(*v),
            ScalarValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ScalarValue::Str(_) => None,
        }
    }

    /// Integral value, if this constant denotes a non-negative whole number.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ScalarValue::Int(v) => u64::try_from(*v).ok(),
            ScalarValue::Double(v) if *v >= 0.0 && v.fract() == 0.0 && *v <= u64::MAX as f64 => {
                Some(*v as u64)
            }
            _ => None,
        }
    }

    /// Value equality across numeric representations (`1` equals `1.0`).
    pub fn equal_value(&self, other: &ScalarValue) -> bool {
        match (self, other) {
            (ScalarValue::Str(a), ScalarValue::Str(b)) => a == b,
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => a == b,
            (ScalarValue::Int(a), ScalarValue::Int(b)) => a == b,
            (ScalarValue::Str(_), _) | (_, ScalarValue::Str(_)) => false,
            (ScalarValue::Bool(_), _) | (_, ScalarValue::Bool(_)) => false,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Int(v) => write!(f, "{}", v),
            ScalarValue::Double(v) => write!(f, "{:?}", v),
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Size statistics of an operation or variable. Each field is either an
/// exact value or `None` (Unknown); there are no bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SizeInfo {
    pub rows: Option<u64>,
    pub cols: Option<u64>,
    pub nnz: Option<u64>,
}

impl SizeInfo {
    pub const UNKNOWN: SizeInfo = SizeInfo {
        rows: None,
        cols: None,
        nnz: None,
    };

    /// Scalars are annotated as 0 x 0.
    pub const SCALAR: SizeInfo = SizeInfo {
        rows: Some(0),
        cols: Some(0),
        nnz: None,
    };

    pub fn new(rows: Option<u64>, cols: Option<u64>, nnz: Option<u64>) -> Self {
        SizeInfo { rows, cols, nnz }
    }

    /// Known dimensions, unknown non-zeros.
    pub fn dims(rows: u64, cols: u64) -> Self {
        SizeInfo {
            rows: Some(rows),
            cols: Some(cols),
            nnz: None,
        }
    }

    pub fn exact(rows: u64, cols: u64, nnz: u64) -> Self {
        SizeInfo {
            rows: Some(rows),
            cols: Some(cols),
            nnz: Some(nnz),
        }
    }

    pub fn dims_known(&self) -> bool {
        self.rows.is_some() && self.cols.is_some()
    }

    pub fn without_nnz(self) -> Self {
        SizeInfo { nnz: None, ..self }
    }

    /// Field-wise reconciliation: a field survives only if both sides agree.
    pub fn reconcile(&self, other: &SizeInfo) -> SizeInfo {
        fn keep(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            if a == b {
                a
            } else {
                None
            }
        }
        SizeInfo {
            rows: keep(self.rows, other.rows),
            cols: keep(self.cols, other.cols),
            nnz: keep(self.nnz, other.nnz),
        }
    }

    /// Estimated in-memory footprint in bytes, using the exact sparsity when
    /// nnz is known and dense otherwise. `None` when dimensions are unknown.
    pub fn estimated_bytes(&self) -> Option<f64> {
        let rows = self.rows? as f64;
        let cols = self.cols? as f64;
        let cells = rows * cols;
        let sparsity = match self.nnz {
            Some(nnz) if cells > 0.0 => nnz as f64 / cells,
            _ => 1.0,
        };
        if sparsity < SPARSE_THRESHOLD {
            // values + column indexes, plus row pointers
            Some(cells * sparsity * 12.0 + (rows + 1.0) * 8.0)
        } else {
            Some(cells * 8.0)
        }
    }
}

impl fmt::Display for SizeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field(v: Option<u64>) -> String {
            v.map_or_else(|| "?".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "{}x{} nnz={}",
            field(self.rows),
            field(self.cols),
            field(self.nnz)
        )
    }
}

// ── Operation kinds ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Plus,
    Minus,
    Mult,
    Div,
    Pow,
    Min,
    Max,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
    And,
    Or,
    Cbind,
    Rbind,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Mult => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Cbind => "cbind",
            BinaryOp::Rbind => "rbind",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    CastAsMatrix,
    CastAsFrame,
    CastAsScalar,
    Nrow,
    Ncol,
    Not,
    Abs,
    Exp,
    Log,
    Sqrt,
    Round,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::CastAsMatrix => "cast_as_matrix",
            UnaryOp::CastAsFrame => "cast_as_frame",
            UnaryOp::CastAsScalar => "cast_as_scalar",
            UnaryOp::Nrow => "nrow",
            UnaryOp::Ncol => "ncol",
            UnaryOp::Not => "!",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Round => "round",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggOp {
    Sum,
    Min,
    Max,
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggDirection {
    Full,
    Row,
    Col,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataGenMethod {
    /// Inputs: rows, cols. A constant `value` fills the matrix with one value.
    Rand,
    /// Inputs: from, to, increment.
    Seq,
}

/// A call site of a user-defined or external function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub namespace: String,
    pub name: String,
    /// Caller-side variable names bound to the callee's outputs, in order.
    pub outputs: Vec<String>,
}

/// What an operation computes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Literal(ScalarValue),
    /// Read of a named variable from the enclosing scope.
    Read { name: String },
    /// Binding of the single input to a named variable.
    Write { name: String },
    PersistentRead { path: String },
    PersistentWrite { path: String },
    Call(FunctionCall),
    DataGen {
        method: DataGenMethod,
        value: Option<f64>,
    },
    Binary { op: BinaryOp, outer: bool },
    Unary { op: UnaryOp },
    Aggregate { op: AggOp, direction: AggDirection },
    MatMult,
    Transpose,
    /// Operation kind unknown to this crate; sized by the collaborator only.
    Other { opcode: String },
}

impl OpKind {
    /// Variable name for reads and writes.
    pub fn variable(&self) -> Option<&str> {
        match self {
            OpKind::Read { name } | OpKind::Write { name } => Some(name),
            _ => None,
        }
    }

    pub fn is_read_of(&self, var: &str) -> bool {
        matches!(self, OpKind::Read { name } if name == var)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, OpKind::Write { .. })
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Literal(v) => write!(f, "lit {}", v),
            OpKind::Read { name } => write!(f, "read {}", name),
            OpKind::Write { name } => write!(f, "write {}", name),
            OpKind::PersistentRead { path } => write!(f, "pread {}", path),
            OpKind::PersistentWrite { path } => write!(f, "pwrite {}", path),
            OpKind::Call(call) => write!(
                f,
                "call {}::{} -> [{}]",
                call.namespace,
                call.name,
                call.outputs.join(", ")
            ),
            OpKind::DataGen { method, value } => {
                let name = match method {
                    DataGenMethod::Rand => "rand",
                    DataGenMethod::Seq => "seq",
                };
                match value {
                    Some(v) => write!(f, "{}({:?})", name, v),
                    None => write!(f, "{}", name),
                }
            }
            OpKind::Binary { op, outer } => {
                if *outer {
                    write!(f, "b({} outer)", op.symbol())
                } else {
                    write!(f, "b({})", op.symbol())
                }
            }
            OpKind::Unary { op } => write!(f, "u({})", op.name()),
            OpKind::Aggregate { op, direction } => {
                write!(f, "ua({:?}, {:?})", op, direction)
            }
            OpKind::MatMult => write!(f, "ba(%*%)"),
            OpKind::Transpose => write!(f, "r(t)"),
            OpKind::Other { opcode } => write!(f, "{}", opcode),
        }
    }
}

// ── Nodes and arena ─────────────────────────────────────────────────────────

/// One operation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub id: NodeId,
    pub kind: OpKind,
    pub data_kind: DataKind,
    pub inputs: Vec<NodeId>,
    pub parents: Vec<NodeId>,
    pub size: SizeInfo,
    #[serde(default)]
    pub requires_checkpoint: bool,
}

/// Arena of all operation nodes of a program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpGraph {
    nodes: Vec<Op>,
}

impl OpGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Op> {
        self.nodes.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Op> {
        self.nodes.iter()
    }

    /// Append a node and register it as parent of each of its inputs.
    pub fn add(&mut self, kind: OpKind, data_kind: DataKind, inputs: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for input in &inputs {
            if let Some(child) = self.nodes.get_mut(input.index()) {
                child.parents.push(id);
            }
        }
        let size = if data_kind == DataKind::Scalar {
            SizeInfo::SCALAR
        } else {
            SizeInfo::UNKNOWN
        };
        self.nodes.push(Op {
            id,
            kind,
            data_kind,
            inputs,
            parents: Vec::new(),
            size,
            requires_checkpoint: false,
        });
        id
    }

    /// Rewire input `pos` of `parent` to `new_child`, updating both
    /// back-reference lists. Out-of-range positions are ignored.
    pub fn replace_input(&mut self, parent: NodeId, pos: usize, new_child: NodeId) {
        let Some(old_child) = self.nodes[parent.index()].inputs.get(pos).copied() else {
            return;
        };
        let old_parents = &mut self.nodes[old_child.index()].parents;
        if let Some(idx) = old_parents.iter().position(|p| *p == parent) {
            old_parents.remove(idx);
        }
        self.nodes[parent.index()].inputs[pos] = new_child;
        self.nodes[new_child.index()].parents.push(parent);
    }

    /// Check ids, reference ranges and parent/child symmetry (as multisets,
    /// so `X * X` lists its input twice and `X` lists the product twice).
    pub fn validate(&self) -> Result<(), IpaError> {
        for (idx, op) in self.nodes.iter().enumerate() {
            if op.id.index() != idx {
                return Err(IpaError::Malformed(format!(
                    "node at arena slot {} carries id {}",
                    idx, op.id
                )));
            }
            for &child in op.inputs.iter().chain(op.parents.iter()) {
                if child.index() >= self.nodes.len() {
                    return Err(IpaError::DanglingNode {
                        referrer: op.id,
                        missing: child,
                    });
                }
            }
        }
        for op in &self.nodes {
            let mut child_counts: HashMap<NodeId, usize> = HashMap::new();
            for &child in &op.inputs {
                *child_counts.entry(child).or_default() += 1;
            }
            for (child, count) in child_counts {
                let back = self.nodes[child.index()]
                    .parents
                    .iter()
                    .filter(|p| **p == op.id)
                    .count();
                if back != count {
                    return Err(IpaError::AsymmetricEdge {
                        parent: op.id,
                        child,
                    });
                }
            }
            for &parent in &op.parents {
                if !self.nodes[parent.index()].inputs.contains(&op.id) {
                    return Err(IpaError::AsymmetricEdge {
                        parent,
                        child: op.id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Children-first order of all nodes reachable from `roots` that are not
    /// yet in `visit`. Every returned node is inserted into `visit`.
    pub fn post_order(&self, roots: &[NodeId], visit: &mut VisitSet) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack: Vec<(NodeId, usize)> = Vec::new();
        for &root in roots {
            if !visit.insert(root) {
                continue;
            }
            stack.push((root, 0));
            while let Some((id, next)) = stack.pop() {
                let inputs = &self.nodes[id.index()].inputs;
                if next < inputs.len() {
                    stack.push((id, next + 1));
                    let child = inputs[next];
                    if visit.insert(child) {
                        stack.push((child, 0));
                    }
                } else {
                    order.push(id);
                }
            }
        }
        order
    }
}

impl Index<NodeId> for OpGraph {
    type Output = Op;

    fn index(&self, id: NodeId) -> &Op {
        &self.nodes[id.index()]
    }
}

impl IndexMut<NodeId> for OpGraph {
    fn index_mut(&mut self, id: NodeId) -> &mut Op {
        &mut self.nodes[id.index()]
    }
}

// ── Visitation ──────────────────────────────────────────────────────────────

/// Per-traversal visited marks, one bit per arena slot. Grows on demand
/// when a pass appends nodes during a walk.
#[derive(Debug, Clone, Default)]
pub struct VisitSet {
    words: Vec<u64>,
}

impl VisitSet {
    pub fn new(capacity: usize) -> Self {
        VisitSet {
            words: vec![0; capacity.div_ceil(64)],
        }
    }

    /// Sized to the given graph.
    pub fn for_graph(graph: &OpGraph) -> Self {
        Self::new(graph.len())
    }

    /// Mark `id`; returns `true` if it was not marked before.
    pub fn insert(&mut self, id: NodeId) -> bool {
        let (word, bit) = (id.index() / 64, id.index() % 64);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    pub fn contains(&self, id: NodeId) -> bool {
        let (word, bit) = (id.index() / 64, id.index() % 64);
        self.words
            .get(word)
            .is_some_and(|w| w & (1u64 << bit) != 0)
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(graph: &mut OpGraph, v: i64) -> NodeId {
        graph.add(OpKind::Literal(ScalarValue::Int(v)), DataKind::Scalar, vec![])
    }

    #[test]
    fn add_registers_parents() {
        let mut g = OpGraph::new();
        let a = lit(&mut g, 1);
        let b = g.add(
            OpKind::Binary {
                op: BinaryOp::Plus,
                outer: false,
            },
            DataKind::Scalar,
            vec![a, a],
        );
        assert_eq!(g[a].parents, vec![b, b]);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn replace_input_keeps_symmetry() {
        let mut g = OpGraph::new();
        let x = g.add(
            OpKind::Read { name: "X".into() },
            DataKind::Matrix,
            vec![],
        );
        let ones = g.add(
            OpKind::Read {
                name: "ones".into(),
            },
            DataKind::Matrix,
            vec![],
        );
        let mult = g.add(
            OpKind::Binary {
                op: BinaryOp::Mult,
                outer: false,
            },
            DataKind::Matrix,
            vec![x, ones],
        );
        let one = lit(&mut g, 1);
        g.replace_input(mult, 1, one);
        assert_eq!(g[mult].inputs, vec![x, one]);
        assert!(g[ones].parents.is_empty());
        assert_eq!(g[one].parents, vec![mult]);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn validate_detects_asymmetry() {
        let mut g = OpGraph::new();
        let a = lit(&mut g, 1);
        let b = g.add(
            OpKind::Unary { op: UnaryOp::Abs },
            DataKind::Scalar,
            vec![a],
        );
        g[a].parents.clear();
        match g.validate() {
            Err(IpaError::AsymmetricEdge { parent, child }) => {
                assert_eq!(parent, b);
                assert_eq!(child, a);
            }
            other => panic!("expected asymmetric edge, got {:?}", other),
        }
    }

    #[test]
    fn validate_detects_dangling_input() {
        let mut g = OpGraph::new();
        let a = lit(&mut g, 1);
        g[a].inputs.push(NodeId(42));
        assert!(matches!(
            g.validate(),
            Err(IpaError::DanglingNode { missing: NodeId(42), .. })
        ));
    }

    #[test]
    fn post_order_visits_shared_nodes_once() {
        let mut g = OpGraph::new();
        let a = lit(&mut g, 1);
        let b = g.add(
            OpKind::Unary { op: UnaryOp::Abs },
            DataKind::Scalar,
            vec![a],
        );
        let c = g.add(
            OpKind::Binary {
                op: BinaryOp::Plus,
                outer: false,
            },
            DataKind::Scalar,
            vec![a, b],
        );
        let mut visit = VisitSet::for_graph(&g);
        assert_eq!(g.post_order(&[c, b], &mut visit), vec![a, b, c]);
        // Without a reset nothing is visited again.
        assert!(g.post_order(&[c], &mut visit).is_empty());
        visit.clear();
        assert_eq!(g.post_order(&[b], &mut visit), vec![a, b]);
    }

    #[test]
    fn visit_set_grows_on_demand() {
        let mut visit = VisitSet::new(2);
        assert!(visit.insert(NodeId(130)));
        assert!(!visit.insert(NodeId(130)));
        assert!(visit.contains(NodeId(130)));
        assert!(!visit.contains(NodeId(1000)));
        assert_eq!(visit.count(), 1);
    }

    #[test]
    fn scalar_equal_value_across_numeric_types() {
        assert!(ScalarValue::Int(1).equal_value(&ScalarValue::Double(1.0)));
        assert!(!ScalarValue::Int(1).equal_value(&ScalarValue::Str("1".into())));
        assert!(ScalarValue::Str("a".into()).equal_value(&ScalarValue::Str("a".into())));
        assert!(!ScalarValue::Bool(true).equal_value(&ScalarValue::Int(1)));
    }

    #[test]
    fn size_reconcile_is_field_wise() {
        let a = SizeInfo::exact(10, 5, 20);
        let b = SizeInfo::exact(10, 6, 20);
        assert_eq!(a.reconcile(&b), SizeInfo::new(Some(10), None, Some(20)));
    }

    #[test]
    fn footprint_prefers_sparse_estimate() {
        let dense = SizeInfo::dims(100, 100);
        let sparse = SizeInfo::exact(100, 100, 10);
        assert!(sparse.estimated_bytes().unwrap() < dense.estimated_bytes().unwrap());
        assert_eq!(SizeInfo::UNKNOWN.estimated_bytes(), None);
    }
}
