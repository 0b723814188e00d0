// config.rs — Feature switches for the analysis passes

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::diag::IpaError;

/// How a callee's output fact is merged into an existing caller binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMerge {
    /// The callee's fact replaces the caller's binding.
    #[default]
    Overwrite,
    /// Keep whichever fact has the larger estimated footprint.
    KeepLarger,
}

/// Pass toggles. Every switch defaults to enabled; a missing field in a
/// configuration file keeps its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpaConfig {
    /// Propagate through the main program even without candidate functions.
    pub intra_procedural: bool,
    /// Use the fixed output-shape table for external routines.
    pub propagate_known_udf_stats: bool,
    /// Keep functions with several equivalent call sites as candidates.
    pub allow_multiple_function_calls: bool,
    pub remove_unused_functions: bool,
    pub flag_function_recompile_once: bool,
    pub remove_unnecessary_checkpoints: bool,
    pub remove_constant_binary_ops: bool,
    /// Forward constant scalar variables into single-call functions.
    pub propagate_scalar_vars_into_fun: bool,
    pub unary_dims_preserving_funs: bool,
    pub call_output_merge: OutputMerge,
}

impl Default for IpaConfig {
    fn default() -> Self {
        IpaConfig {
            intra_procedural: true,
            propagate_known_udf_stats: true,
            allow_multiple_function_calls: true,
            remove_unused_functions: true,
            flag_function_recompile_once: true,
            remove_unnecessary_checkpoints: true,
            remove_constant_binary_ops: true,
            propagate_scalar_vars_into_fun: true,
            unary_dims_preserving_funs: true,
            call_output_merge: OutputMerge::Overwrite,
        }
    }
}

impl IpaConfig {
    pub fn from_json(text: &str) -> Result<Self, IpaError> {
        serde_json::from_str(text).map_err(|e| IpaError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, IpaError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IpaError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }
}
