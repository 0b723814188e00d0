// id.rs — Stable identifiers shared by all analysis passes
//
// Operation nodes live in a single arena per program and are addressed by
// `NodeId`. Functions are addressed by `FunctionKey` (namespace + name),
// which is also the unit of candidate selection and recursion guarding.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of an operation node in the program's `OpGraph` arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Fully qualified function name, rendered as `namespace::name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionKey {
    pub namespace: String,
    pub name: String,
}

impl FunctionKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        FunctionKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_key_display() {
        let key = FunctionKey::new("default", "scale");
        assert_eq!(key.to_string(), "default::scale");
    }

    #[test]
    fn node_ids_order_by_allocation() {
        assert!(NodeId(3) < NodeId(7));
        assert_eq!(NodeId(7).index(), 7);
        assert_eq!(NodeId(7).to_string(), "n7");
    }
}
