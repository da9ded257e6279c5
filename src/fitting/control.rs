/// LCModel control file (`$LCMODL` namelist)
///
/// Values are written as LCModel expects them: booleans as `T`/`F`,
/// strings in single quotes, tuples comma-separated.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Tuple(Vec<f64>),
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Bool(b) => write!(f, "{}", if *b { "T" } else { "F" }),
            ControlValue::Int(v) => write!(f, "{}", v),
            ControlValue::Float(v) => write!(f, "{}", v),
            ControlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            ControlValue::Tuple(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

impl From<bool> for ControlValue {
    fn from(v: bool) -> Self {
        ControlValue::Bool(v)
    }
}

impl From<i64> for ControlValue {
    fn from(v: i64) -> Self {
        ControlValue::Int(v)
    }
}

impl From<usize> for ControlValue {
    fn from(v: usize) -> Self {
        ControlValue::Int(v as i64)
    }
}

impl From<f64> for ControlValue {
    fn from(v: f64) -> Self {
        ControlValue::Float(v)
    }
}

impl From<&str> for ControlValue {
    fn from(v: &str) -> Self {
        ControlValue::Text(v.to_string())
    }
}

impl From<String> for ControlValue {
    fn from(v: String) -> Self {
        ControlValue::Text(v)
    }
}

/// Ordered key/value entries of one control file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlFile {
    entries: Vec<(String, ControlValue)>,
}

impl ControlFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing an earlier value in place
    pub fn set(&mut self, key: &str, value: impl Into<ControlValue>) -> &mut Self {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&ControlValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::from(" $LCMODL\n");
        for (key, value) in &self.entries {
            out.push_str(&format!(" {}= {}\n", key, value));
        }
        out.push_str(" $END\n");
        out
    }
}
