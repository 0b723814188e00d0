// ipa — Inter-procedural size and sparsity analysis
//
// Library root. Program model first, then the analysis passes in the order
// the pipeline runs them.

pub mod builder;
pub mod call;
pub mod candidates;
pub mod checkpoint;
pub mod config;
pub mod const_ops;
pub mod dag;
pub mod diag;
pub mod dot;
pub mod id;
pub mod pass;
pub mod pipeline;
pub mod program;
pub mod propagate;
pub mod prune;
pub mod recompile;
pub mod rules;
pub mod udf;
pub mod unary;
pub mod varmap;
