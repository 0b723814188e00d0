// dot.rs — Graphviz DOT output for annotated programs
//
// Renders the operation graph with one cluster per top-level block and per
// script function; control-flow blocks nest as sub-clusters. Node labels
// carry the size annotation so propagation results can be inspected.
//
// Preconditions: `program` passes `Program::validate`.
// Postconditions: returns a valid DOT string; every reachable node appears
//   exactly once, in the first cluster that reaches it.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::dag::{DataKind, OpGraph, OpKind, VisitSet};
use crate::id::NodeId;
use crate::program::{Block, FunctionBody, Program};

/// Emit the program as a Graphviz DOT string.
pub fn emit_dot(program: &Program) -> String {
    let mut w = DotWriter {
        graph: &program.graph,
        visit: VisitSet::for_graph(&program.graph),
        buf: String::new(),
        clusters: 0,
    };
    writeln!(w.buf, "digraph ipa {{").unwrap();
    writeln!(w.buf, "    rankdir=TB;").unwrap();
    writeln!(w.buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(w.buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    for (i, block) in program.blocks.iter().enumerate() {
        writeln!(w.buf).unwrap();
        w.block(block, &format!("main[{i}]"), "    ");
    }

    for (key, function) in program.functions.iter() {
        writeln!(w.buf).unwrap();
        let label = if function.recompile_once {
            format!("function {key} (recompile once)")
        } else {
            format!("function {key}")
        };
        match &function.body {
            FunctionBody::External { implementation } => {
                let id = format!("ext_{}", sanitize(&key.to_string()));
                writeln!(
                    w.buf,
                    "    {id} [shape=component, label=\"{}\\n{}\"];",
                    escape(&label),
                    escape(implementation)
                )
                .unwrap();
            }
            FunctionBody::Dml { blocks } => {
                let cluster = w.open_cluster(&label, "rounded", "gray50", "    ");
                for block in blocks {
                    w.block(block, "", &cluster);
                }
                writeln!(w.buf, "    }}").unwrap();
            }
        }
    }

    // Edges after all clusters so cross-cluster inputs resolve.
    writeln!(w.buf).unwrap();
    for op in program.graph.iter() {
        if !w.visit.contains(op.id) {
            continue;
        }
        for &input in &op.inputs {
            writeln!(w.buf, "    {} -> {};", input, op.id).unwrap();
        }
    }

    writeln!(w.buf, "}}").unwrap();
    w.buf
}

struct DotWriter<'g> {
    graph: &'g OpGraph,
    visit: VisitSet,
    buf: String,
    clusters: usize,
}

impl DotWriter<'_> {
    /// Open a cluster and return the indent for its contents.
    fn open_cluster(&mut self, label: &str, style: &str, color: &str, indent: &str) -> String {
        let n = self.clusters;
        self.clusters += 1;
        writeln!(self.buf, "{indent}subgraph cluster_{n} {{").unwrap();
        writeln!(self.buf, "{indent}    label=\"{}\";", escape(label)).unwrap();
        writeln!(self.buf, "{indent}    style={style};").unwrap();
        writeln!(self.buf, "{indent}    color={color};").unwrap();
        format!("{indent}    ")
    }

    fn block(&mut self, block: &Block, prefix: &str, indent: &str) {
        let label = match block {
            Block::Generic { .. } => "generic",
            Block::If { .. } => "if",
            Block::While { .. } => "while",
            Block::For { parallel: true, .. } => "parfor",
            Block::For { .. } => "for",
        };
        let label = if prefix.is_empty() {
            label.to_string()
        } else {
            format!("{prefix} {label}")
        };
        let (style, color) = if block.is_generic() {
            ("dashed", "gray70")
        } else {
            ("rounded", "gray30")
        };
        let inner = self.open_cluster(&label, style, color, indent);

        match block {
            Block::Generic { roots, .. } => self.nodes(roots, &inner),
            Block::If {
                if_body, else_body, ..
            } => {
                self.nodes(&block.predicates(), &inner);
                for child in if_body {
                    self.block(child, "then", &inner);
                }
                for child in else_body {
                    self.block(child, "else", &inner);
                }
            }
            Block::While { body, .. } | Block::For { body, .. } => {
                self.nodes(&block.predicates(), &inner);
                for child in body {
                    self.block(child, "", &inner);
                }
            }
        }
        writeln!(self.buf, "{indent}}}").unwrap();
    }

    fn nodes(&mut self, roots: &[NodeId], indent: &str) {
        let graph = self.graph;
        for id in graph.post_order(roots, &mut self.visit) {
            writeln!(self.buf, "{indent}{id} [{}];", node_attrs(graph, id)).unwrap();
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Sanitize a name to valid DOT identifier characters.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Return DOT attributes for a node: shape by operation, size in the label.
fn node_attrs(graph: &OpGraph, id: NodeId) -> String {
    let op = &graph[id];
    let (shape, color) = match op.kind {
        OpKind::Literal(_) => ("plaintext", "white"),
        OpKind::Read { .. } | OpKind::Write { .. } => ("ellipse", "lightyellow"),
        OpKind::PersistentRead { .. } | OpKind::PersistentWrite { .. } => {
            ("cylinder", "lightsalmon")
        }
        OpKind::Call(_) => ("box3d", "lightgreen"),
        _ => ("box", "lightblue"),
    };
    let mut label = format!("{id}: {}", escape(&op.kind.to_string()));
    if op.data_kind.is_matrix_like() {
        write!(label, "\\n[{}]", op.size).unwrap();
    } else if op.data_kind == DataKind::Scalar && !matches!(op.kind, OpKind::Literal(_)) {
        label.push_str("\\nscalar");
    }
    let border = if op.requires_checkpoint {
        ", peripheries=2"
    } else {
        ""
    };
    format!("shape={shape}, style=filled, fillcolor={color}{border}, label=\"{label}\"")
}

// ── Tests ───────────────────────────────────────────────────────────────────
