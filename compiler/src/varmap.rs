// varmap.rs — Abstract variable state threaded through propagation
//
// A `VarMap` binds variable names to abstract values: matrix statistics or
// scalar constants. The top-level map lives for the whole propagation pass;
// each function invocation gets its own map. Branch points clone the map
// (copy-on-branch) and merge the copies back at block boundaries.

use std::collections::BTreeMap;
use std::fmt;

use crate::dag::{ScalarValue, SizeInfo};

/// Abstract value of one variable.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    /// Matrix or frame statistics.
    Matrix(SizeInfo),
    /// Scalar with a known constant value, or Unknown.
    Scalar(Option<ScalarValue>),
}

impl VarValue {
    pub fn matrix(&self) -> Option<SizeInfo> {
        match self {
            VarValue::Matrix(size) => Some(*size),
            VarValue::Scalar(_) => None,
        }
    }

    pub fn constant(&self) -> Option<&ScalarValue> {
        match self {
            VarValue::Scalar(Some(v)) => Some(v),
            _ => None,
        }
    }

    /// Unknown value of the same kind.
    pub fn unknown_like(&self) -> VarValue {
        match self {
            VarValue::Matrix(_) => VarValue::Matrix(SizeInfo::UNKNOWN),
            VarValue::Scalar(_) => VarValue::Scalar(None),
        }
    }

    /// Keep only the facts both values agree on. Matrix fields merge
    /// independently; values of different kinds merge to Unknown.
    pub fn reconcile(&self, other: &VarValue) -> VarValue {
        match (self, other) {
            (VarValue::Matrix(a), VarValue::Matrix(b)) => VarValue::Matrix(a.reconcile(b)),
            (VarValue::Scalar(Some(a)), VarValue::Scalar(Some(b))) if a.equal_value(b) => {
                VarValue::Scalar(Some(a.clone()))
            }
            (VarValue::Scalar(_), VarValue::Scalar(_)) => VarValue::Scalar(None),
            (_, other) => other.unknown_like(),
        }
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Matrix(size) => write!(f, "matrix[{}]", size),
            VarValue::Scalar(Some(v)) => write!(f, "scalar {}", v),
            VarValue::Scalar(None) => write!(f, "scalar ?"),
        }
    }
}

/// Variable name → abstract value, ordered for deterministic iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarMap {
    vars: BTreeMap<String, VarValue>,
}

impl VarMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.vars.get(name)
    }

    pub fn matrix(&self, name: &str) -> Option<SizeInfo> {
        self.vars.get(name).and_then(VarValue::matrix)
    }

    pub fn constant(&self, name: &str) -> Option<&ScalarValue> {
        self.vars.get(name).and_then(VarValue::constant)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: VarValue) {
        self.vars.insert(name.into(), value);
    }

    pub fn set_matrix(&mut self, name: impl Into<String>, size: SizeInfo) {
        self.insert(name, VarValue::Matrix(size));
    }

    pub fn set_scalar(&mut self, name: impl Into<String>, value: Option<ScalarValue>) {
        self.insert(name, VarValue::Scalar(value));
    }

    pub fn remove(&mut self, name: &str) -> Option<VarValue> {
        self.vars.remove(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VarValue)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Drop scalar bindings of the given variables. Matrix bindings stay.
    pub fn remove_scalars<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            if matches!(self.vars.get(name), Some(VarValue::Scalar(_))) {
                self.vars.remove(name);
            }
        }
    }

    /// Drop scalar bindings whose value is Unknown.
    pub fn purge_unknown_scalars(&mut self) {
        self.vars
            .retain(|_, value| !matches!(value, VarValue::Scalar(None)));
    }
}

impl fmt::Display for VarMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.vars {
            writeln!(f, "{} = {}", name, value)?;
        }
        Ok(())
    }
}
