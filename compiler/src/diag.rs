// diag.rs — Error model for the size propagation passes
//
// Structural problems in the input program and failures reported by the
// size-inference collaborator abort the whole analysis. Lookup misses,
// inconsistent call arguments and recursion are not errors; they degrade
// facts to Unknown inside the passes and never reach this module.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use thiserror::Error;

use crate::id::{FunctionKey, NodeId};
use crate::rules::RefreshError;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // E01xx: program structure
    pub const E0101: DiagCode = DiagCode("E0101"); // unknown function
    pub const E0102: DiagCode = DiagCode("E0102"); // arity mismatch
    pub const E0103: DiagCode = DiagCode("E0103"); // dangling node reference
    pub const E0104: DiagCode = DiagCode("E0104"); // asymmetric parent/child link
    pub const E0105: DiagCode = DiagCode("E0105"); // malformed block or call node

    // E02xx: analysis
    pub const E0201: DiagCode = DiagCode("E0201"); // size inference failed

    // E03xx: configuration
    pub const E0301: DiagCode = DiagCode("E0301"); // invalid configuration
}

// ── Error type ───────────────────────────────────────────────────────────

/// Fatal analysis failure. There is no partial-result mode: any of these
/// aborts the pass that raised it.
#[derive(Debug, Error)]
pub enum IpaError {
    #[error("function {0} is not defined")]
    UnknownFunction(FunctionKey),

    #[error("call to {key} at {node} passes {found} arguments, expected {expected}")]
    ArityMismatch {
        key: FunctionKey,
        node: NodeId,
        expected: usize,
        found: usize,
    },

    #[error("{referrer} references {missing}, which is outside the graph")]
    DanglingNode { referrer: NodeId, missing: NodeId },

    #[error("{parent} lists {child} as input but {child} does not list {parent} as parent")]
    AsymmetricEdge { parent: NodeId, child: NodeId },

    #[error("malformed program: {0}")]
    Malformed(String),

    #[error("failed to update statistics of {node}")]
    SizeInference {
        node: NodeId,
        #[source]
        source: RefreshError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IpaError {
    /// Stable code for display and test matching.
    pub fn code(&self) -> DiagCode {
        match self {
            IpaError::UnknownFunction(_) => codes::E0101,
            IpaError::ArityMismatch { .. } => codes::E0102,
            IpaError::DanglingNode { .. } => codes::E0103,
            IpaError::AsymmetricEdge { .. } => codes::E0104,
            IpaError::Malformed(_) => codes::E0105,
            IpaError::SizeInference { .. } => codes::E0201,
            IpaError::Config(_) => codes::E0301,
        }
    }

    /// `error[CODE]: message` followed by the source chain, one cause per line.
    pub fn render(&self) -> String {
        let mut out = format!("error[{}]: {}", self.code(), self);
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str(&format!("\n  caused by: {}", cause));
            source = cause.source();
        }
        out
    }
}
