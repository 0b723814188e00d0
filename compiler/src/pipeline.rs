// pipeline.rs — Analysis state and pass orchestration
//
// Holds all pass artifacts next to the program under analysis and runs the
// minimal set of passes for a given terminal PassId. Passes already
// completed on the state are skipped, so running every terminal in order
// runs each pass exactly once.
//
// Preconditions: the program has been validated.
// Postconditions: artifacts for all required passes are populated.
// Failure modes: any pass failing with an `IpaError`; the pass is named in
//   the returned `PipelineError`.
// Side effects: rewrites the program in place; calls `on_pass_complete`
//   after each pass.

use std::collections::BTreeSet;
use std::slice;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::candidates::CandidateSet;
use crate::checkpoint::{place_checkpoints, CheckpointEdit};
use crate::config::IpaConfig;
use crate::const_ops::{remove_constant_binary_ops, ConstantRewrite};
use crate::diag::IpaError;
use crate::id::FunctionKey;
use crate::pass::{descriptor, required_passes, PassId, ALL_PASSES};
use crate::program::Program;
use crate::propagate::{CallStats, Propagator};
use crate::prune::remove_unused_functions;
use crate::recompile::flag_recompile_once;
use crate::rules::SizeRefresh;
use crate::unary::probe_unary_functions;
use crate::varmap::VarMap;

// ── Artifact storage ───────────────────────────────────────────────────────

/// Wall-clock time spent in one pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassTiming {
    pub pass: &'static str,
    pub elapsed_ms: f64,
}

/// The program under analysis plus every pass artifact.
pub struct AnalysisState<'a> {
    pub program: &'a mut Program,
    pub config: &'a IpaConfig,
    pub candidates: CandidateSet,
    pub shape_preserving: BTreeSet<FunctionKey>,
    pub call_stats: CallStats,
    pub removed_functions: Vec<FunctionKey>,
    pub recompile_once: Vec<FunctionKey>,
    pub checkpoint_edits: Vec<CheckpointEdit>,
    pub constant_rewrites: Vec<ConstantRewrite>,
    pub timings: Vec<PassTiming>,
    completed: Vec<PassId>,
}

impl<'a> AnalysisState<'a> {
    pub fn new(program: &'a mut Program, config: &'a IpaConfig) -> Self {
        AnalysisState {
            program,
            config,
            candidates: CandidateSet::default(),
            shape_preserving: BTreeSet::new(),
            call_stats: CallStats::default(),
            removed_functions: Vec::new(),
            recompile_once: Vec::new(),
            checkpoint_edits: Vec::new(),
            constant_rewrites: Vec::new(),
            timings: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn is_complete(&self, pass: PassId) -> bool {
        self.completed.contains(&pass)
    }
}

// ── Fingerprint ────────────────────────────────────────────────────────────

/// SHA-256 of the program's canonical compact JSON.
pub fn program_fingerprint(program: &Program) -> Result<[u8; 32], IpaError> {
    use sha2::{Digest, Sha256};

    let canonical = serde_json::to_string(program)
        .map_err(|e| IpaError::Malformed(format!("program does not serialize: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    Ok(hash)
}

/// Hex string of a fingerprint (64 characters).
pub fn fingerprint_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed in a pass.
#[derive(Debug, thiserror::Error)]
#[error("{} failed: {source}", .failing_pass.name())]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
    #[source]
    pub source: IpaError,
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → record timing → on_pass_complete(callback).
/// Passes disabled in the configuration complete with empty artifacts.
pub fn run_passes(
    state: &mut AnalysisState<'_>,
    terminal: PassId,
    rules: &dyn SizeRefresh,
    mut on_pass_complete: impl FnMut(PassId, Duration),
) -> Result<(), PipelineError> {
    for pass_id in required_passes(terminal) {
        if state.is_complete(pass_id) {
            continue;
        }
        let t = Instant::now();
        run_pass(state, pass_id, rules).map_err(|source| PipelineError {
            failing_pass: pass_id,
            source,
        })?;
        let elapsed = t.elapsed();
        state.completed.push(pass_id);
        state.timings.push(PassTiming {
            pass: descriptor(pass_id).name,
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        });
        info!(
            pass = descriptor(pass_id).name,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "pass complete"
        );
        on_pass_complete(pass_id, elapsed);
    }
    Ok(())
}

fn run_pass(state: &mut AnalysisState<'_>, pass_id: PassId, rules: &dyn SizeRefresh) -> Result<(), IpaError> {
    let config = state.config;
    match pass_id {
        PassId::SelectCandidates => {
            state.candidates = CandidateSet::select(state.program, config)?;
            info!(
                candidates = state.candidates.len(),
                reachable = state.candidates.all_keys().count(),
                "candidate selection"
            );
        }
        PassId::ProbeUnary => {
            let pruned: Vec<FunctionKey> = state.candidates.pruned().cloned().collect();
            if config.unary_dims_preserving_funs && !pruned.is_empty() {
                let Program {
                    graph, functions, ..
                } = &mut *state.program;
                state.shape_preserving =
                    probe_unary_functions(graph, functions, rules, config, &pruned)?;
            }
        }
        PassId::Propagate => {
            if !state.candidates.is_empty() || config.intra_procedural {
                let Program {
                    graph,
                    blocks,
                    functions,
                } = &mut *state.program;
                let mut prop = Propagator::new(
                    graph,
                    functions,
                    rules,
                    &state.candidates,
                    &state.shape_preserving,
                    config,
                );
                prop.propagate_blocks(blocks, &mut VarMap::new())?;
                state.call_stats = prop.stats();
                info!(
                    analyzed = state.call_stats.analyzed,
                    unknown = state.call_stats.unknown,
                    "propagation"
                );
            } else {
                debug!("propagation skipped: no candidates");
            }
        }
        PassId::RemoveUnused => {
            if config.remove_unused_functions {
                state.removed_functions =
                    remove_unused_functions(&mut state.program.functions, state.candidates.all_keys());
            }
        }
        PassId::FlagRecompile => {
            if config.flag_function_recompile_once {
                state.recompile_once = flag_recompile_once(&mut state.program.functions);
            }
        }
        PassId::Checkpoints => {
            if config.remove_unnecessary_checkpoints {
                state.checkpoint_edits = place_checkpoints(state.program);
            }
        }
        PassId::ConstantOps => {
            if config.remove_constant_binary_ops {
                state.constant_rewrites = remove_constant_binary_ops(state.program);
            }
        }
    }
    Ok(())
}

// ── Entry points ───────────────────────────────────────────────────────────

/// Summary of one full analysis run.
#[derive(Debug, Clone, Serialize)]
pub struct IpaReport {
    pub candidates: Vec<String>,
    pub shape_preserving: Vec<String>,
    pub removed_functions: Vec<String>,
    pub recompile_once: Vec<String>,
    pub checkpoint_edits: Vec<CheckpointEdit>,
    pub constant_rewrites: Vec<ConstantRewrite>,
    pub call_stats: CallStats,
    pub timings: Vec<PassTiming>,
    pub fingerprint_before: String,
    pub fingerprint_after: String,
}

impl IpaReport {
    /// Whether the analysis changed the program.
    pub fn changed(&self) -> bool {
        self.fingerprint_before != self.fingerprint_after
    }

    fn from_state(state: &AnalysisState<'_>, before: &[u8; 32]) -> Result<Self, IpaError> {
        fn names<'k>(keys: impl IntoIterator<Item = &'k FunctionKey>) -> Vec<String> {
            keys.into_iter().map(FunctionKey::to_string).collect()
        }
        Ok(IpaReport {
            candidates: names(state.candidates.candidates()),
            shape_preserving: names(&state.shape_preserving),
            removed_functions: names(&state.removed_functions),
            recompile_once: names(&state.recompile_once),
            checkpoint_edits: state.checkpoint_edits.clone(),
            constant_rewrites: state.constant_rewrites.clone(),
            call_stats: state.call_stats,
            timings: state.timings.clone(),
            fingerprint_before: fingerprint_hex(before),
            fingerprint_after: fingerprint_hex(&program_fingerprint(&*state.program)?),
        })
    }
}

/// Run every pass over `program`.
pub fn analyze_program(
    program: &mut Program,
    config: &IpaConfig,
    rules: &dyn SizeRefresh,
) -> Result<IpaReport, IpaError> {
    analyze_program_through(program, config, rules, PassId::ConstantOps)
}

/// Run every pass up to and including `stop_after`, in execution order.
pub fn analyze_program_through(
    program: &mut Program,
    config: &IpaConfig,
    rules: &dyn SizeRefresh,
    stop_after: PassId,
) -> Result<IpaReport, IpaError> {
    program.validate()?;
    let before = program_fingerprint(program)?;
    let mut state = AnalysisState::new(program, config);
    for terminal in ALL_PASSES {
        run_passes(&mut state, terminal, rules, |_, _| {}).map_err(|e| e.source)?;
        if terminal == stop_after {
            break;
        }
    }
    IpaReport::from_state(&state, &before)
}

/// Candidate selection and propagation over one top-level block, as used
/// for dynamic recompilation. Returns the surviving candidates.
pub fn analyze_sub_program(
    program: &mut Program,
    block_index: usize,
    config: &IpaConfig,
    rules: &dyn SizeRefresh,
) -> Result<BTreeSet<FunctionKey>, IpaError> {
    program.validate()?;
    let Program {
        graph,
        blocks,
        functions,
    } = program;
    let block = blocks.get(block_index).ok_or_else(|| {
        IpaError::Malformed(format!(
            "block index {} out of range ({} top-level blocks)",
            block_index,
            blocks.len()
        ))
    })?;
    let candidates =
        CandidateSet::select_blocks(graph, functions, slice::from_ref(block), config)?;
    if !candidates.is_empty() {
        let shape_preserving = BTreeSet::new();
        let mut prop = Propagator::new(
            graph,
            functions,
            rules,
            &candidates,
            &shape_preserving,
            config,
        );
        prop.propagate_block(block, &mut VarMap::new())?;
    }
    Ok(candidates.candidates().cloned().collect())
}

// ── Tests ──────────────────────────────────────────────────────────────────
