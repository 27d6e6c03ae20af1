//! Hyperparameter values, parameter sets, and search grids.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ModelError;

/// A single hyperparameter value as written in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl ParamValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Bool(b) => serde_json::Value::from(*b),
            ParamValue::Int(i) => serde_json::Value::from(*i),
            ParamValue::Float(x) => serde_json::Value::from(*x),
            ParamValue::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

/// One concrete assignment of hyperparameters.  Ordered by name so logging
/// and serialisation are stable.
pub type ParamSet = BTreeMap<String, ParamValue>;

/// Read a positive integer parameter, falling back to `default` when absent.
pub fn get_usize(params: &ParamSet, name: &str, default: usize) -> Result<usize, ModelError> {
    match params.get(name) {
        None => Ok(default),
        Some(ParamValue::Int(i)) if *i > 0 => Ok(*i as usize),
        Some(other) => Err(ModelError::InvalidParam {
            name: name.to_string(),
            reason: format!("expected a positive integer, got {}", other),
        }),
    }
}

/// Read a text parameter restricted to `allowed`, falling back to `default`.
pub fn get_choice<'a>(
    params: &ParamSet,
    name: &str,
    allowed: &[&'a str],
    default: &'a str,
) -> Result<&'a str, ModelError> {
    match params.get(name) {
        None => Ok(default),
        Some(ParamValue::Text(s)) => allowed.iter().copied().find(|a| *a == s.as_str()).ok_or_else(|| {
            ModelError::InvalidParam {
                name: name.to_string(),
                reason: format!("'{}' is not one of {:?}", s, allowed),
            }
        }),
        Some(other) => Err(ModelError::InvalidParam {
            name: name.to_string(),
            reason: format!("expected one of {:?}, got {}", allowed, other),
        }),
    }
}

// ---------------------------------------------------------------------------
// ParamGrid
// ---------------------------------------------------------------------------

/// Candidate values per hyperparameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamGrid(pub BTreeMap<String, Vec<ParamValue>>);

impl ParamGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, values: Vec<ParamValue>) -> Self {
        self.0.insert(name.into(), values);
        self
    }

    /// Number of points in the grid (1 for an empty grid).
    pub fn size(&self) -> usize {
        self.0.values().map(Vec::len).product()
    }

    /// Every point of the grid in iteration order: parameter names ascending,
    /// the last name varying fastest.  An empty grid yields one empty set.
    pub fn combinations(&self) -> Vec<ParamSet> {
        let mut out = vec![ParamSet::new()];
        for (name, values) in &self.0 {
            let mut next = Vec::with_capacity(out.len() * values.len());
            for partial in &out {
                for value in values {
                    let mut set = partial.clone();
                    set.insert(name.clone(), value.clone());
                    next.push(set);
                }
            }
            out = next;
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
