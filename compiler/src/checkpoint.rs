// checkpoint.rs — Checkpoint placement over the top-level block sequence
//
// Three scans, in order:
//   1. removal: a checkpointed variable that is overwritten unconditionally
//      and checkpointed again, without being read in between, loses its
//      first checkpoint;
//   2. relocation: a checkpoint whose variable is next updated through a
//      single-consumer read chain moves onto the new producer;
//   3. read-write: in a program made of one generic block, a persistent
//      read consumed only by a persistent write or an aggregate needs no
//      checkpoint.
//
// Only the top-level sequence is scanned: it executes unconditionally.
// Candidates updated inside a conditional or loop are dropped.
//
// Preconditions: propagation has run; checkpoint flags set by the front-end.
// Postconditions: no checkpoint is removed whose value is read later.
// Side effects: toggles `requires_checkpoint` on nodes.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::dag::{OpGraph, OpKind, UnaryOp, VisitSet};
use crate::id::NodeId;
use crate::program::{Block, Program};

/// One change made by checkpoint placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "edit", rename_all = "snake_case")]
pub enum CheckpointEdit {
    /// Checkpoint on `node` (bound to `variable`) cleared.
    Removed { node: NodeId, variable: String },
    /// Checkpoint moved from `from` to the new producer `to`.
    Moved {
        from: NodeId,
        to: NodeId,
        variable: String,
    },
    /// Checkpoint on a persistent read consumed only by a write or aggregate.
    ReadWrite { node: NodeId },
}

/// Run all three scans.
pub fn place_checkpoints(program: &mut Program) -> Vec<CheckpointEdit> {
    let mut edits = remove_before_update(program);
    edits.extend(move_after_update(program));
    edits.extend(remove_read_write(program));
    edits
}

/// Scan 1.
pub fn remove_before_update(program: &mut Program) -> Vec<CheckpointEdit> {
    let Program { graph, blocks, .. } = program;
    let mut visit = VisitSet::for_graph(graph);
    let mut pending: BTreeMap<String, NodeId> = BTreeMap::new();
    let mut edits = Vec::new();

    for block in blocks.iter() {
        let found = {
            let g: &OpGraph = graph;
            prune_pending(g, block, &mut pending, &mut visit);
            if let Block::Generic { roots, .. } = block {
                let updated = block.variables_updated(g);
                pending.retain(|var, _| {
                    !updated.contains(var) || overwrite_keeps_candidate(g, roots, var, &mut visit)
                });
            }
            collect_checkpoints(g, block, &mut visit)
        };

        for (var, node) in found {
            if let Some(old) = pending.insert(var.clone(), node) {
                if old != node && graph[old].requires_checkpoint {
                    graph[old].requires_checkpoint = false;
                    debug!(variable = %var, node = %old, "removed checkpoint before update");
                    edits.push(CheckpointEdit::Removed {
                        node: old,
                        variable: var,
                    });
                }
            }
        }
    }
    edits
}

/// Scan 2.
pub fn move_after_update(program: &mut Program) -> Vec<CheckpointEdit> {
    let Program { graph, blocks, .. } = program;
    let mut visit = VisitSet::for_graph(graph);
    let mut pending: BTreeMap<String, NodeId> = BTreeMap::new();
    let mut edits = Vec::new();

    for block in blocks.iter() {
        prune_pending(graph, block, &mut pending, &mut visit);
        if let Block::Generic { roots, .. } = block {
            let updated = block.variables_updated(graph);
            let vars: Vec<String> = pending
                .keys()
                .filter(|v| updated.contains(*v))
                .cloned()
                .collect();
            for var in vars {
                visit.clear();
                for &root in roots {
                    if !writes_var(graph, root, &var) {
                        continue;
                    }
                    let Some(&old) = pending.get(&var) else {
                        break;
                    };
                    let producer = graph[root].inputs.first().copied();
                    let simple = has_simple_read_chain(graph, root, &var, &mut visit);
                    match producer {
                        Some(to) if simple => {
                            graph[old].requires_checkpoint = false;
                            graph[to].requires_checkpoint = true;
                            pending.insert(var.clone(), to);
                            debug!(variable = %var, from = %old, to = %to, "moved checkpoint after update");
                            edits.push(CheckpointEdit::Moved {
                                from: old,
                                to,
                                variable: var.clone(),
                            });
                        }
                        _ => {
                            pending.remove(&var);
                        }
                    }
                }
            }
        }

        for (var, node) in collect_checkpoints(graph, block, &mut visit) {
            pending.insert(var, node);
        }
    }
    edits
}

/// Scan 3.
pub fn remove_read_write(program: &mut Program) -> Vec<CheckpointEdit> {
    let Program { graph, blocks, .. } = program;
    let [Block::Generic { roots, .. }] = blocks.as_slice() else {
        return Vec::new();
    };
    let g: &OpGraph = graph;
    let mut visit = VisitSet::for_graph(g);
    let targets: Vec<NodeId> = g
        .post_order(roots, &mut visit)
        .into_iter()
        .filter_map(|id| read_write_target(g, id))
        .collect();

    let mut edits = Vec::new();
    for node in targets {
        if !graph[node].requires_checkpoint {
            continue;
        }
        graph[node].requires_checkpoint = false;
        debug!(node = %node, "removed checkpoint on persistent read");
        edits.push(CheckpointEdit::ReadWrite { node });
    }
    edits
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Persistent read under `id` whose checkpoint is unnecessary, if `id` is a
/// persistent write or aggregate consuming it directly or through a cast.
fn read_write_target(graph: &OpGraph, id: NodeId) -> Option<NodeId> {
    let op = &graph[id];
    if !matches!(
        op.kind,
        OpKind::PersistentWrite { .. } | OpKind::Aggregate { .. }
    ) {
        return None;
    }
    let c0 = *op.inputs.first()?;
    if is_lone_checkpointed_pread(graph, c0) {
        return Some(c0);
    }
    let child = &graph[c0];
    let is_cast = matches!(
        child.kind,
        OpKind::Unary {
            op: UnaryOp::CastAsFrame | UnaryOp::CastAsMatrix
        }
    );
    if is_cast && child.parents.len() == 1 {
        let c1 = *child.inputs.first()?;
        if is_lone_checkpointed_pread(graph, c1) {
            return Some(c1);
        }
    }
    None
}

fn writes_var(graph: &OpGraph, id: NodeId, var: &str) -> bool {
    matches!(&graph[id].kind, OpKind::Write { name } if name == var)
}

/// An unconditional update keeps a pending checkpoint candidate when it
/// never reads the old value, or reads it only through simple read chains.
fn overwrite_keeps_candidate(
    graph: &OpGraph,
    roots: &[NodeId],
    var: &str,
    visit: &mut VisitSet,
) -> bool {
    visit.clear();
    let simple = roots
        .iter()
        .filter(|r| writes_var(graph, **r, var))
        .all(|w| has_simple_read_chain(graph, *w, var, visit));
    if simple {
        return true;
    }
    visit.clear();
    !contains_read(graph, roots, var, visit)
}

fn is_lone_checkpointed_pread(graph: &OpGraph, id: NodeId) -> bool {
    let op = &graph[id];
    op.requires_checkpoint
        && op.parents.len() == 1
        && matches!(op.kind, OpKind::PersistentRead { .. })
}

/// Drop pending candidates that `block` reads without updating, and, for
/// control-flow blocks, candidates it updates.
fn prune_pending(
    graph: &OpGraph,
    block: &Block,
    pending: &mut BTreeMap<String, NodeId>,
    visit: &mut VisitSet,
) {
    if pending.is_empty() {
        return;
    }
    let read = block.variables_read(graph);
    let updated = block.variables_updated(graph);
    pending.retain(|var, _| {
        if read.contains(var) && !updated.contains(var) {
            // Reads that only feed nrow/ncol leave the value untouched.
            let Block::Generic { roots, .. } = block else {
                return false;
            };
            visit.clear();
            return !contains_read(graph, roots, var, visit);
        }
        true
    });
    if !block.is_generic() {
        pending.retain(|var, _| !updated.contains(var));
    }
}

/// Checkpointed nodes bound directly to a variable write, keyed by variable.
fn collect_checkpoints(
    graph: &OpGraph,
    block: &Block,
    visit: &mut VisitSet,
) -> Vec<(String, NodeId)> {
    let Block::Generic { roots, .. } = block else {
        return Vec::new();
    };
    visit.clear();
    let mut found = Vec::new();
    for id in graph.post_order(roots, visit) {
        let op = &graph[id];
        if !op.requires_checkpoint || op.parents.len() != 1 {
            continue;
        }
        if let OpKind::Write { name } = &graph[op.parents[0]].kind {
            found.push((name.clone(), id));
        }
    }
    found
}

/// Whether any read of `var` reachable from `roots` feeds something other
/// than `nrow`/`ncol`.
fn contains_read(graph: &OpGraph, roots: &[NodeId], var: &str, visit: &mut VisitSet) -> bool {
    graph.post_order(roots, visit).into_iter().any(|id| {
        let op = &graph[id];
        op.kind.is_read_of(var)
            && !op.parents.iter().all(|p| {
                matches!(
                    graph[*p].kind,
                    OpKind::Unary {
                        op: UnaryOp::Nrow | UnaryOp::Ncol
                    }
                )
            })
    })
}

/// Whether `root` reaches a read of `var` along a path whose nodes (the
/// read included) each have at most one consumer. Side inputs are
/// unconstrained. Nodes already in `visit` count as not reaching.
fn has_simple_read_chain(graph: &OpGraph, root: NodeId, var: &str, visit: &mut VisitSet) -> bool {
    if visit.contains(root) {
        return false;
    }
    let op = &graph[root];
    let single = op.parents.len() <= 1;
    let mut found = op.kind.is_read_of(var) && single;
    for &child in &op.inputs {
        if has_simple_read_chain(graph, child, var, visit) {
            found |= single;
        }
    }
    visit.insert(root);
    found
}
