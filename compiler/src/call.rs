// call.rs — Inter-procedural handling of function-call nodes
//
// Invoked by the propagator for every call node of a refreshed generic
// block. Candidate callees not already on the call stack are analyzed with
// a fresh variable map bound from the call's arguments; their outputs are
// merged back into the caller's map. Other callees get their outputs from
// the shape-preserving shortcut, the external routine table, or Unknown.
//
// Preconditions: the caller's graph around the call node is refreshed.
// Postconditions: every output variable of the call is rebound in `vars`
//   (or dropped, for scalars without a known value).
// Failure modes: unknown callee, argument count mismatch, output list
//   longer than the callee's declaration, and any failure while analyzing
//   the callee body.
// Side effects: annotates the callee body's nodes; pushes and pops the
//   call stack.

use tracing::debug;

use crate::config::OutputMerge;
use crate::dag::{DataKind, OpKind, SizeInfo};
use crate::diag::IpaError;
use crate::id::{FunctionKey, NodeId};
use crate::program::{Function, FunctionBody, Param};
use crate::propagate::Propagator;
use crate::udf::Routine;
use crate::varmap::VarMap;

impl Propagator<'_> {
    pub(crate) fn handle_call(&mut self, id: NodeId, vars: &mut VarMap) -> Result<(), IpaError> {
        let op = &self.graph[id];
        let OpKind::Call(call) = &op.kind else {
            return Ok(());
        };
        let key = FunctionKey::new(call.namespace.as_str(), call.name.as_str());
        let outputs = call.outputs.clone();
        let args = op.inputs.clone();

        let functions = self.functions;
        let function = functions.lookup(&key)?;
        if args.len() != function.inputs.len() {
            return Err(IpaError::ArityMismatch {
                key,
                node: id,
                expected: function.inputs.len(),
                found: args.len(),
            });
        }
        if outputs.len() > function.outputs.len() {
            return Err(IpaError::Malformed(format!(
                "call to {} at {} binds {} outputs, function declares {}",
                key,
                id,
                outputs.len(),
                function.outputs.len()
            )));
        }

        match &function.body {
            FunctionBody::Dml { blocks } => {
                if self.candidates.is_candidate(&key) && !self.stack.contains(&key) {
                    debug!(function = %key, call = %id, "propagating into function");
                    let mut callee_vars = self.bind_arguments(&key, function, &args, vars);
                    self.stack.push(key);
                    let result = self.propagate_blocks(blocks, &mut callee_vars);
                    self.stack.pop();
                    result?;
                    self.merge_outputs(function, &outputs, &callee_vars, vars);
                    self.stats.analyzed += 1;
                } else if self.shape_preserving.contains(&key) {
                    debug!(function = %key, call = %id, "shape-preserving call");
                    let input = args
                        .first()
                        .map(|arg| self.graph[*arg].size)
                        .unwrap_or(SizeInfo::UNKNOWN);
                    if let Some(name) = outputs.first() {
                        vars.set_matrix(name.as_str(), input.without_nnz());
                    }
                    self.stats.shape_preserving += 1;
                } else {
                    debug!(function = %key, call = %id, "outputs unknown");
                    unknown_outputs(&function.outputs, &outputs, vars);
                    self.stats.unknown += 1;
                }
            }
            FunctionBody::External { implementation } => {
                let routine = Routine::from_implementation(implementation)
                    .filter(|_| self.config.propagate_known_udf_stats);
                match routine {
                    Some(routine) => {
                        let sizes = routine.output_sizes(&*self.graph, &args);
                        for (i, (param, name)) in
                            function.outputs.iter().zip(&outputs).enumerate()
                        {
                            if param.data_kind.is_matrix_like() {
                                let size = sizes.get(i).copied().unwrap_or(SizeInfo::UNKNOWN);
                                vars.set_matrix(name.as_str(), size);
                            } else {
                                vars.remove(name);
                            }
                        }
                        self.stats.external += 1;
                    }
                    None => {
                        debug!(function = %key, implementation = %implementation, "unknown external routine");
                        unknown_outputs(&function.outputs, &outputs, vars);
                        self.stats.unknown += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Build the callee's initial map from the call's arguments.
    fn bind_arguments(
        &self,
        key: &FunctionKey,
        function: &Function,
        args: &[NodeId],
        caller: &VarMap,
    ) -> VarMap {
        let mut callee = VarMap::new();
        let safe_nnz = self.candidates.safe_nnz(key);
        // Forwarding a variable is only sound when no other call site could
        // observe a different value.
        let forward_vars =
            self.config.propagate_scalar_vars_into_fun && self.candidates.call_sites(key) == 1;
        for (param, &arg) in function.inputs.iter().zip(args) {
            let op = &self.graph[arg];
            match op.data_kind {
                DataKind::Matrix | DataKind::Frame => {
                    let nnz = if safe_nnz.is_some_and(|s| s.contains(&arg)) {
                        op.size.nnz
                    } else {
                        None
                    };
                    callee.set_matrix(
                        param.name.as_str(),
                        SizeInfo::new(op.size.rows, op.size.cols, nnz),
                    );
                }
                DataKind::Scalar => match &op.kind {
                    OpKind::Literal(value) => {
                        callee.set_scalar(param.name.as_str(), Some(value.clone()))
                    }
                    OpKind::Read { name } if forward_vars => {
                        if let Some(value) = caller.constant(name) {
                            callee.set_scalar(param.name.as_str(), Some(value.clone()));
                        }
                    }
                    _ => {}
                },
                DataKind::Unknown => {}
            }
        }
        callee
    }

    /// Copy the callee's output facts into the caller's map.
    fn merge_outputs(
        &self,
        function: &Function,
        outputs: &[String],
        callee: &VarMap,
        caller: &mut VarMap,
    ) {
        for (param, name) in function.outputs.iter().zip(outputs) {
            match param.data_kind {
                DataKind::Matrix | DataKind::Frame => {
                    let Some(incoming) = callee.matrix(&param.name) else {
                        caller.set_matrix(name.as_str(), SizeInfo::UNKNOWN);
                        continue;
                    };
                    let keep_existing = match (self.config.call_output_merge, caller.matrix(name)) {
                        (OutputMerge::KeepLarger, Some(existing)) => {
                            match (
                                existing.estimated_bytes(),
                                incoming.without_nnz().estimated_bytes(),
                            ) {
                                (Some(old), Some(new)) => old >= new,
                                _ => false,
                            }
                        }
                        _ => false,
                    };
                    if !keep_existing {
                        caller.set_matrix(name.as_str(), incoming);
                    }
                }
                DataKind::Scalar => match callee.constant(&param.name) {
                    Some(value) => caller.set_scalar(name.as_str(), Some(value.clone())),
                    None => {
                        caller.remove(name);
                    }
                },
                DataKind::Unknown => {}
            }
        }
    }
}

/// Bind every matrix output to Unknown and drop scalar outputs.
fn unknown_outputs(params: &[Param], outputs: &[String], vars: &mut VarMap) {
    for (param, name) in params.iter().zip(outputs) {
        if param.data_kind.is_matrix_like() {
            vars.set_matrix(name.as_str(), SizeInfo::UNKNOWN);
        } else {
            vars.remove(name);
        }
    }
}
