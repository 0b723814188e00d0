// program.rs — Block tree, function table and program container
//
// A program is one operation-graph arena plus a tree of blocks that refer
// into it: the main block list and one block list per user-defined
// function. Blocks never own nodes; generic blocks list their graph roots,
// control-flow blocks list their predicate roots.
//
// Preconditions: none.
// Postconditions: `validate` guarantees every block reference and every
//   graph edge is in range and symmetric.
// Failure modes: `validate` reports the first structural defect.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dag::{DataKind, OpGraph, OpKind, VisitSet};
use crate::diag::IpaError;
use crate::id::{FunctionKey, NodeId};

/// Namespace of functions declared in the main script.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace of compiler-generated helpers; never analyzed as candidates.
pub const INTERNAL_NAMESPACE: &str = "internal";

// ── Blocks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "block", rename_all = "snake_case")]
pub enum Block {
    /// Straight-line code: a list of operation-graph roots.
    Generic {
        roots: Vec<NodeId>,
        /// Front-end verdict that this block's plan depends on unknown sizes.
        #[serde(default)]
        requires_recompile: bool,
    },
    If {
        predicate: NodeId,
        if_body: Vec<Block>,
        #[serde(default)]
        else_body: Vec<Block>,
        #[serde(default)]
        predicate_requires_recompile: bool,
    },
    While {
        predicate: NodeId,
        body: Vec<Block>,
    },
    /// `for` and `parfor` loops.
    For {
        from: NodeId,
        to: NodeId,
        #[serde(default)]
        increment: Option<NodeId>,
        body: Vec<Block>,
        #[serde(default)]
        parallel: bool,
    },
}

impl Block {
    /// Predicate roots of a control-flow block, in evaluation order.
    pub fn predicates(&self) -> Vec<NodeId> {
        match self {
            Block::Generic { .. } => Vec::new(),
            Block::If { predicate, .. } | Block::While { predicate, .. } => vec![*predicate],
            Block::For {
                from,
                to,
                increment,
                ..
            } => {
                let mut preds = vec![*from, *to];
                preds.extend(increment.iter().copied());
                preds
            }
        }
    }

    /// Nested block lists (if-body and else-body for conditionals).
    pub fn bodies(&self) -> Vec<&[Block]> {
        match self {
            Block::Generic { .. } => Vec::new(),
            Block::If {
                if_body, else_body, ..
            } => vec![if_body.as_slice(), else_body.as_slice()],
            Block::While { body, .. } | Block::For { body, .. } => vec![body.as_slice()],
        }
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, Block::Generic { .. })
    }

    /// Variables bound anywhere inside this block: variable writes and
    /// function-call outputs.
    pub fn variables_updated(&self, graph: &OpGraph) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let mut visit = VisitSet::for_graph(graph);
        self.collect_vars(graph, &mut visit, &mut names, &|kind| match kind {
            OpKind::Write { name } => vec![name.as_str()],
            OpKind::Call(call) => call.outputs.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        });
        names
    }

    /// Variables read anywhere inside this block, predicates included.
    pub fn variables_read(&self, graph: &OpGraph) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let mut visit = VisitSet::for_graph(graph);
        self.collect_vars(graph, &mut visit, &mut names, &|kind| match kind {
            OpKind::Read { name } => vec![name.as_str()],
            _ => Vec::new(),
        });
        names
    }

    fn collect_vars<'g>(
        &self,
        graph: &'g OpGraph,
        visit: &mut VisitSet,
        names: &mut BTreeSet<String>,
        pick: &dyn Fn(&'g OpKind) -> Vec<&'g str>,
    ) {
        let mut roots = self.predicates();
        if let Block::Generic { roots: r, .. } = self {
            roots.extend(r.iter().copied());
        }
        for id in graph.post_order(&roots, visit) {
            names.extend(pick(&graph[id].kind).into_iter().map(str::to_string));
        }
        for body in self.bodies() {
            for block in body {
                block.collect_vars(graph, visit, names, pick);
            }
        }
    }
}

// ── Functions ───────────────────────────────────────────────────────────────

/// Formal parameter of a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub data_kind: DataKind,
}

impl Param {
    pub fn new(name: impl Into<String>, data_kind: DataKind) -> Self {
        Param {
            name: name.into(),
            data_kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FunctionBody {
    /// Script-defined body.
    Dml { blocks: Vec<Block> },
    /// Native routine, identified by implementation name.
    External { implementation: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub inputs: Vec<Param>,
    pub outputs: Vec<Param>,
    pub body: FunctionBody,
    /// Recompile the whole body once on entry instead of per block.
    #[serde(default)]
    pub recompile_once: bool,
}

impl Function {
    /// Script body, or `None` for external routines.
    pub fn blocks(&self) -> Option<&[Block]> {
        match &self.body {
            FunctionBody::Dml { blocks } => Some(blocks.as_slice()),
            FunctionBody::External { .. } => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.body, FunctionBody::External { .. })
    }
}

/// namespace → name → function, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionTable {
    namespaces: BTreeMap<String, BTreeMap<String, Function>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &FunctionKey) -> Option<&Function> {
        self.namespaces.get(&key.namespace)?.get(&key.name)
    }

    pub fn get_mut(&mut self, key: &FunctionKey) -> Option<&mut Function> {
        self.namespaces.get_mut(&key.namespace)?.get_mut(&key.name)
    }

    /// Like `get`, but a miss is a structural error.
    pub fn lookup(&self, key: &FunctionKey) -> Result<&Function, IpaError> {
        self.get(key)
            .ok_or_else(|| IpaError::UnknownFunction(key.clone()))
    }

    pub fn insert(&mut self, key: FunctionKey, function: Function) -> Option<Function> {
        self.namespaces
            .entry(key.namespace)
            .or_default()
            .insert(key.name, function)
    }

    /// Remove a function; a namespace left empty is removed as well.
    pub fn remove(&mut self, key: &FunctionKey) -> Option<Function> {
        let names = self.namespaces.get_mut(&key.namespace)?;
        let removed = names.remove(&key.name);
        if names.is_empty() {
            self.namespaces.remove(&key.namespace);
        }
        removed
    }

    pub fn keys(&self) -> Vec<FunctionKey> {
        self.iter().map(|(key, _)| key).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FunctionKey, &Function)> {
        self.namespaces.iter().flat_map(|(ns, names)| {
            names
                .iter()
                .map(move |(name, f)| (FunctionKey::new(ns.as_str(), name.as_str()), f))
        })
    }

    pub fn len(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Program ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub graph: OpGraph,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub functions: FunctionTable,
}

impl Program {
    /// Structural check performed once before any pass runs.
    pub fn validate(&self) -> Result<(), IpaError> {
        self.graph.validate()?;
        let in_range = |id: NodeId| -> Result<(), IpaError> {
            if self.graph.get(id).is_none() {
                return Err(IpaError::Malformed(format!(
                    "block references {}, which is outside the graph",
                    id
                )));
            }
            Ok(())
        };
        let mut pending: Vec<&Block> = self.blocks.iter().collect();
        for (_, f) in self.functions.iter() {
            pending.extend(f.blocks().into_iter().flatten());
        }
        while let Some(block) = pending.pop() {
            for id in block.predicates() {
                in_range(id)?;
            }
            if let Block::Generic { roots, .. } = block {
                for &id in roots {
                    in_range(id)?;
                }
            }
            for body in block.bodies() {
                pending.extend(body.iter());
            }
        }
        Ok(())
    }
}

// ── Annotated dump ──────────────────────────────────────────────────────────

struct Indent(usize);

impl fmt::Display for Indent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:width$}", "", width = self.0 * 2)
    }
}

fn fmt_nodes(
    f: &mut fmt::Formatter<'_>,
    graph: &OpGraph,
    roots: &[NodeId],
    depth: usize,
) -> fmt::Result {
    let mut visit = VisitSet::for_graph(graph);
    for id in graph.post_order(roots, &mut visit) {
        let op = &graph[id];
        write!(f, "{}{} {}", Indent(depth), id, op.kind)?;
        if !op.inputs.is_empty() {
            let inputs: Vec<String> = op.inputs.iter().map(NodeId::to_string).collect();
            write!(f, " ({})", inputs.join(", "))?;
        }
        match op.data_kind {
            DataKind::Scalar => write!(f, " : scalar")?,
            DataKind::Matrix => write!(f, " : matrix[{}]", op.size)?,
            DataKind::Frame => write!(f, " : frame[{}]", op.size)?,
            DataKind::Unknown => {}
        }
        if op.requires_checkpoint {
            write!(f, " [chkpt]")?;
        }
        writeln!(f)?;
    }
    Ok(())
}

fn fmt_blocks(
    f: &mut fmt::Formatter<'_>,
    graph: &OpGraph,
    blocks: &[Block],
    depth: usize,
) -> fmt::Result {
    for block in blocks {
        match block {
            Block::Generic {
                roots,
                requires_recompile,
            } => {
                let flag = if *requires_recompile { " [recompile]" } else { "" };
                writeln!(f, "{}generic{}", Indent(depth), flag)?;
                fmt_nodes(f, graph, roots, depth + 1)?;
            }
            Block::If {
                predicate,
                if_body,
                else_body,
                ..
            } => {
                writeln!(f, "{}if", Indent(depth))?;
                fmt_nodes(f, graph, &[*predicate], depth + 2)?;
                writeln!(f, "{}then", Indent(depth + 1))?;
                fmt_blocks(f, graph, if_body, depth + 2)?;
                if !else_body.is_empty() {
                    writeln!(f, "{}else", Indent(depth + 1))?;
                    fmt_blocks(f, graph, else_body, depth + 2)?;
                }
            }
            Block::While { predicate, body } => {
                writeln!(f, "{}while", Indent(depth))?;
                fmt_nodes(f, graph, &[*predicate], depth + 2)?;
                writeln!(f, "{}do", Indent(depth + 1))?;
                fmt_blocks(f, graph, body, depth + 2)?;
            }
            Block::For { body, parallel, .. } => {
                let kw = if *parallel { "parfor" } else { "for" };
                writeln!(f, "{}{}", Indent(depth), kw)?;
                fmt_nodes(f, graph, &block.predicates(), depth + 2)?;
                writeln!(f, "{}do", Indent(depth + 1))?;
                fmt_blocks(f, graph, body, depth + 2)?;
            }
        }
    }
    Ok(())
}

fn fmt_params(params: &[Param]) -> String {
    params
        .iter()
        .map(|p| format!("{}: {}", p.name, format!("{:?}", p.data_kind).to_lowercase()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "main")?;
        fmt_blocks(f, &self.graph, &self.blocks, 1)?;
        for (key, function) in self.functions.iter() {
            write!(
                f,
                "function {}({}) -> ({})",
                key,
                fmt_params(&function.inputs),
                fmt_params(&function.outputs)
            )?;
            if function.recompile_once {
                write!(f, " [recompile_once]")?;
            }
            match &function.body {
                FunctionBody::External { implementation } => {
                    writeln!(f, " external {:?}", implementation)?;
                }
                FunctionBody::Dml { blocks } => {
                    writeln!(f)?;
                    fmt_blocks(f, &self.graph, blocks, 1)?;
                }
            }
        }
        Ok(())
    }
}
