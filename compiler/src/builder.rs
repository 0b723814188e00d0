// builder.rs — In-process program construction
//
// `ProgramBuilder` plays the role of the front-end for tests, benches and
// demos: it allocates nodes in the shared arena, keeps parent/child links
// symmetric, and annotates each new node with the sizes the front-end would
// know at parse time (standard size rules over the variables written so
// far in the current scope).

use crate::dag::{
    AggDirection, AggOp, BinaryOp, DataGenMethod, DataKind, FunctionCall, OpKind, ScalarValue,
    SizeInfo, UnaryOp,
};
use crate::id::{FunctionKey, NodeId};
use crate::program::{Block, Function, FunctionBody, Param, Program};
use crate::rules::{scalar_value, SizeRefresh, StandardRules};
use crate::varmap::VarMap;

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Double(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Str(v.to_string())
    }
}

#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
    scope: VarMap,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, kind: OpKind, data_kind: DataKind, inputs: Vec<NodeId>) -> NodeId {
        let id = self.program.graph.add(kind, data_kind, inputs);
        // Front-end sizes are best effort; an inference failure leaves the
        // node Unknown and surfaces again during propagation.
        if let Ok(size) = StandardRules.refresh(&self.program.graph, id, &self.scope) {
            self.program.graph[id].size = size;
        }
        id
    }

    // ── Operations ──────────────────────────────────────────────────────────

    pub fn lit(&mut self, value: impl Into<ScalarValue>) -> NodeId {
        self.node(OpKind::Literal(value.into()), DataKind::Scalar, vec![])
    }

    /// Read of a variable; the data kind follows the binding in scope and
    /// defaults to matrix.
    pub fn read(&mut self, name: &str) -> NodeId {
        let (data_kind, size) = match self.scope.get(name) {
            Some(v) if v.matrix().is_none() => (DataKind::Scalar, SizeInfo::SCALAR),
            Some(v) => (DataKind::Matrix, v.matrix().unwrap_or_default()),
            None => (DataKind::Matrix, SizeInfo::UNKNOWN),
        };
        let id = self.node(OpKind::Read { name: name.into() }, data_kind, vec![]);
        self.program.graph[id].size = size;
        id
    }

    pub fn write(&mut self, name: &str, input: NodeId) -> NodeId {
        let data_kind = self.program.graph[input].data_kind;
        let id = self.node(OpKind::Write { name: name.into() }, data_kind, vec![input]);
        if data_kind == DataKind::Scalar {
            let value = scalar_value(&self.program.graph, input, &self.scope);
            self.scope.set_scalar(name, value);
        } else {
            self.scope.set_matrix(name, self.program.graph[id].size);
        }
        id
    }

    /// Matrix generator; `value` is the constant fill value, if any.
    pub fn rand(&mut self, rows: NodeId, cols: NodeId, value: Option<f64>) -> NodeId {
        self.node(
            OpKind::DataGen {
                method: DataGenMethod::Rand,
                value,
            },
            DataKind::Matrix,
            vec![rows, cols],
        )
    }

    /// `rand` with literal dimensions.
    pub fn matrix(&mut self, rows: i64, cols: i64, value: Option<f64>) -> NodeId {
        let (r, c) = (self.lit(rows), self.lit(cols));
        self.rand(r, c, value)
    }

    pub fn seq(&mut self, from: NodeId, to: NodeId, incr: Option<NodeId>) -> NodeId {
        let mut inputs = vec![from, to];
        inputs.extend(incr);
        self.node(
            OpKind::DataGen {
                method: DataGenMethod::Seq,
                value: None,
            },
            DataKind::Matrix,
            inputs,
        )
    }

    pub fn binary(&mut self, op: BinaryOp, l: NodeId, r: NodeId) -> NodeId {
        self.binary_op(op, false, l, r)
    }

    pub fn outer(&mut self, op: BinaryOp, l: NodeId, r: NodeId) -> NodeId {
        self.binary_op(op, true, l, r)
    }

    fn binary_op(&mut self, op: BinaryOp, outer: bool, l: NodeId, r: NodeId) -> NodeId {
        let graph = &self.program.graph;
        let data_kind = if graph[l].data_kind == DataKind::Scalar
            && graph[r].data_kind == DataKind::Scalar
        {
            DataKind::Scalar
        } else {
            DataKind::Matrix
        };
        self.node(OpKind::Binary { op, outer }, data_kind, vec![l, r])
    }

    pub fn unary(&mut self, op: UnaryOp, x: NodeId) -> NodeId {
        let data_kind = match op {
            UnaryOp::CastAsScalar | UnaryOp::Nrow | UnaryOp::Ncol => DataKind::Scalar,
            UnaryOp::CastAsMatrix => DataKind::Matrix,
            UnaryOp::CastAsFrame => DataKind::Frame,
            _ => self.program.graph[x].data_kind,
        };
        self.node(OpKind::Unary { op }, data_kind, vec![x])
    }

    pub fn agg(&mut self, op: AggOp, direction: AggDirection, x: NodeId) -> NodeId {
        let data_kind = if direction == AggDirection::Full {
            DataKind::Scalar
        } else {
            DataKind::Matrix
        };
        self.node(OpKind::Aggregate { op, direction }, data_kind, vec![x])
    }

    pub fn matmult(&mut self, l: NodeId, r: NodeId) -> NodeId {
        self.node(OpKind::MatMult, DataKind::Matrix, vec![l, r])
    }

    pub fn transpose(&mut self, x: NodeId) -> NodeId {
        self.node(OpKind::Transpose, DataKind::Matrix, vec![x])
    }

    /// Persistent read with the size recorded in the file's metadata.
    pub fn pread(&mut self, path: &str, data_kind: DataKind, size: SizeInfo) -> NodeId {
        let id = self.node(
            OpKind::PersistentRead { path: path.into() },
            data_kind,
            vec![],
        );
        self.program.graph[id].size = size;
        id
    }

    pub fn pwrite(&mut self, path: &str, input: NodeId) -> NodeId {
        let data_kind = self.program.graph[input].data_kind;
        self.node(
            OpKind::PersistentWrite { path: path.into() },
            data_kind,
            vec![input],
        )
    }

    /// Function call binding the callee's outputs to `outputs`. Calls belong
    /// in their own generic block.
    pub fn call(&mut self, key: &FunctionKey, args: Vec<NodeId>, outputs: &[&str]) -> NodeId {
        let data_kind = match self.program.functions.get(key) {
            Some(f) if f.outputs.len() == 1 => f.outputs[0].data_kind,
            None if outputs.len() == 1 => DataKind::Matrix,
            _ => DataKind::Unknown,
        };
        let id = self.node(
            OpKind::Call(FunctionCall {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
            }),
            data_kind,
            args,
        );
        let kinds: Vec<DataKind> = match self.program.functions.get(key) {
            Some(f) => f.outputs.iter().map(|p| p.data_kind).collect(),
            None => vec![DataKind::Matrix; outputs.len()],
        };
        for (name, kind) in outputs.iter().zip(kinds) {
            if kind == DataKind::Scalar {
                self.scope.set_scalar(*name, None);
            } else {
                self.scope.set_matrix(*name, SizeInfo::UNKNOWN);
            }
        }
        id
    }

    pub fn other(&mut self, opcode: &str, data_kind: DataKind, inputs: Vec<NodeId>) -> NodeId {
        self.node(
            OpKind::Other {
                opcode: opcode.into(),
            },
            data_kind,
            inputs,
        )
    }

    /// Flag `id` as requiring a checkpoint.
    pub fn checkpoint(&mut self, id: NodeId) -> NodeId {
        self.program.graph[id].requires_checkpoint = true;
        id
    }

    // ── Blocks and functions ────────────────────────────────────────────────

    pub fn generic(roots: Vec<NodeId>) -> Block {
        Block::Generic {
            roots,
            requires_recompile: false,
        }
    }

    /// Append a block to the main program.
    pub fn push(&mut self, block: Block) -> &mut Self {
        self.program.blocks.push(block);
        self
    }

    /// Define a script function. `body` builds the block list in a fresh
    /// scope where the formal inputs are bound with unknown sizes.
    pub fn function(
        &mut self,
        key: FunctionKey,
        inputs: &[(&str, DataKind)],
        outputs: &[(&str, DataKind)],
        body: impl FnOnce(&mut ProgramBuilder) -> Vec<Block>,
    ) -> &mut Self {
        let mut scope = VarMap::new();
        for (name, kind) in inputs {
            if *kind == DataKind::Scalar {
                scope.set_scalar(*name, None);
            } else {
                scope.set_matrix(*name, SizeInfo::UNKNOWN);
            }
        }
        let outer = std::mem::replace(&mut self.scope, scope);
        let blocks = body(self);
        self.scope = outer;
        self.program.functions.insert(
            key,
            Function {
                inputs: params(inputs),
                outputs: params(outputs),
                body: FunctionBody::Dml { blocks },
                recompile_once: false,
            },
        );
        self
    }

    pub fn external_function(
        &mut self,
        key: FunctionKey,
        inputs: &[(&str, DataKind)],
        outputs: &[(&str, DataKind)],
        implementation: &str,
    ) -> &mut Self {
        self.program.functions.insert(
            key,
            Function {
                inputs: params(inputs),
                outputs: params(outputs),
                body: FunctionBody::External {
                    implementation: implementation.into(),
                },
                recompile_once: false,
            },
        );
        self
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn finish(self) -> Program {
        self.program
    }
}

fn params(list: &[(&str, DataKind)]) -> Vec<Param> {
    list.iter().map(|(n, k)| Param::new(*n, *k)).collect()
}
