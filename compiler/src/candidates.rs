// candidates.rs — Selection of functions safe for exact size propagation
//
// One walk over every generic block of the program, following each function
// into its body on first sighting. A function stays a candidate when it is
// called once, or when every further call passes arguments equivalent to
// the first call (same known dimensions and nnz, same literal values).
//
// Preconditions: graph edges validated; node sizes carry the front-end
//   annotation.
// Postconditions: `all_keys` holds every reachable non-internal function,
//   candidates are a subset of it.
// Failure modes: a call to a function missing from the table.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::IpaConfig;
use crate::dag::{OpGraph, OpKind, VisitSet};
use crate::diag::IpaError;
use crate::id::{FunctionKey, NodeId};
use crate::program::{Block, FunctionTable, Program, INTERNAL_NAMESPACE};

/// Result of candidate selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateSet {
    /// Surviving candidates.
    candidates: BTreeSet<FunctionKey>,
    /// Equivalence-adjusted call counts before pruning, one entry per
    /// reachable function.
    counts: BTreeMap<FunctionKey, usize>,
    /// Every sighting of a call node, equivalent or not.
    call_sites: BTreeMap<FunctionKey, usize>,
    /// Argument nodes of the first recorded call whose nnz is known.
    safe_nnz: BTreeMap<FunctionKey, BTreeSet<NodeId>>,
}

impl CandidateSet {
    /// Select over the whole main program. Nothing is selected when the
    /// program defines no functions.
    pub fn select(program: &Program, config: &IpaConfig) -> Result<Self, IpaError> {
        if program.functions.is_empty() {
            return Ok(CandidateSet::default());
        }
        Self::select_blocks(&program.graph, &program.functions, &program.blocks, config)
    }

    /// Select over an arbitrary block list (a sub-program).
    pub fn select_blocks(
        graph: &OpGraph,
        functions: &FunctionTable,
        blocks: &[Block],
        config: &IpaConfig,
    ) -> Result<Self, IpaError> {
        let mut walk = Selector {
            graph,
            functions,
            config,
            visit: VisitSet::for_graph(graph),
            counts: BTreeMap::new(),
            call_sites: BTreeMap::new(),
            first_calls: BTreeMap::new(),
        };
        walk.blocks(blocks)?;

        for (key, count) in &walk.counts {
            debug!(function = %key, count, "statistic propagation candidate");
        }
        let candidates: BTreeSet<FunctionKey> = walk
            .counts
            .iter()
            .filter(|(_, count)| **count <= 1)
            .map(|(key, _)| key.clone())
            .collect();
        for key in walk.counts.keys().filter(|k| !candidates.contains(*k)) {
            debug!(function = %key, "pruned: inconsistent call sites");
        }

        let safe_nnz: BTreeMap<FunctionKey, BTreeSet<NodeId>> = walk
            .first_calls
            .iter()
            .map(|(key, call)| {
                let safe: BTreeSet<NodeId> = graph[*call]
                    .inputs
                    .iter()
                    .copied()
                    .filter(|arg| graph[*arg].size.nnz.is_some())
                    .collect();
                (key.clone(), safe)
            })
            .collect();

        Ok(CandidateSet {
            candidates,
            counts: walk.counts,
            call_sites: walk.call_sites,
            safe_nnz,
        })
    }

    pub fn is_candidate(&self, key: &FunctionKey) -> bool {
        self.candidates.contains(key)
    }

    pub fn candidates(&self) -> impl Iterator<Item = &FunctionKey> {
        self.candidates.iter()
    }

    /// Every function reached by the walk, candidate or not.
    pub fn all_keys(&self) -> impl Iterator<Item = &FunctionKey> {
        self.counts.keys()
    }

    pub fn contains_key(&self, key: &FunctionKey) -> bool {
        self.counts.contains_key(key)
    }

    /// Reachable functions that were pruned.
    pub fn pruned(&self) -> impl Iterator<Item = &FunctionKey> {
        self.counts
            .keys()
            .filter(move |k| !self.candidates.contains(*k))
    }

    /// Number of call nodes seen for `key`.
    pub fn call_sites(&self, key: &FunctionKey) -> usize {
        self.call_sites.get(key).copied().unwrap_or(0)
    }

    pub fn safe_nnz(&self, key: &FunctionKey) -> Option<&BTreeSet<NodeId>> {
        self.safe_nnz.get(key)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

struct Selector<'a> {
    graph: &'a OpGraph,
    functions: &'a FunctionTable,
    config: &'a IpaConfig,
    visit: VisitSet,
    counts: BTreeMap<FunctionKey, usize>,
    call_sites: BTreeMap<FunctionKey, usize>,
    first_calls: BTreeMap<FunctionKey, NodeId>,
}

impl Selector<'_> {
    fn blocks(&mut self, blocks: &[Block]) -> Result<(), IpaError> {
        for block in blocks {
            match block {
                Block::Generic { roots, .. } => {
                    let graph = self.graph;
                    let order = graph.post_order(roots, &mut self.visit);
                    for id in order {
                        self.node(id)?;
                    }
                }
                _ => {
                    for body in block.bodies() {
                        self.blocks(body)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn node(&mut self, id: NodeId) -> Result<(), IpaError> {
        let (graph, functions) = (self.graph, self.functions);
        let OpKind::Call(call) = &graph[id].kind else {
            return Ok(());
        };
        if call.namespace == INTERNAL_NAMESPACE {
            return Ok(());
        }
        let key = FunctionKey::new(call.namespace.as_str(), call.name.as_str());
        *self.call_sites.entry(key.clone()).or_default() += 1;

        match self.first_calls.get(&key) {
            Some(&first) => {
                let consistent =
                    self.config.allow_multiple_function_calls && self.equivalent(first, id);
                if !consistent {
                    *self.counts.entry(key).or_default() += 1;
                }
            }
            None => {
                self.counts.insert(key.clone(), 1);
                self.first_calls.insert(key.clone(), id);
                let function = functions.lookup(&key)?;
                if let Some(body) = function.blocks() {
                    self.blocks(body)?;
                }
            }
        }
        Ok(())
    }

    /// Argument-wise equivalence of two calls to the same function.
    fn equivalent(&self, first: NodeId, other: NodeId) -> bool {
        let (a, b) = (&self.graph[first], &self.graph[other]);
        a.inputs.len() == b.inputs.len()
            && a.inputs.iter().zip(&b.inputs).all(|(x, y)| {
                let (x, y) = (&self.graph[*x], &self.graph[*y]);
                let sizes = x.size.dims_known() && y.size.dims_known() && x.size == y.size;
                let literals = match (&x.kind, &y.kind) {
                    (OpKind::Literal(l), OpKind::Literal(r)) => l.equal_value(r),
                    (OpKind::Literal(_), _) => false,
                    _ => true,
                };
                sizes && literals
            })
    }
}
