/// Named, typed, bounded step parameters
///
/// Values are validated on every set; nothing is ever clamped silently.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Unknown parameter '{0}'")]
    NotFound(String),
    #[error("Parameter '{idname}' = {value} outside [{min}, {max}]")]
    OutOfBounds {
        idname: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Parameter '{idname}' expects a {expected} value")]
    TypeMismatch { idname: String, expected: String },
    #[error("Parameter '{idname}': '{value}' is not one of {options:?}")]
    InvalidChoice {
        idname: String,
        value: String,
        options: Vec<String>,
    },
    #[error("Parameter '{idname}' expects {expected} components, got {got}")]
    WrongLength {
        idname: String,
        expected: usize,
        got: usize,
    },
}

/// A parameter value. Serialized untagged so graph files stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Vector(Vec<f64>),
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterValue::Integer(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::Text(v) => write!(f, "{}", v),
            ParameterValue::Vector(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

/// Type tag plus bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    Integer { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Text,
    Choice { options: Vec<String> },
    Vector { len: usize, min: f64, max: f64 },
}

impl ParameterKind {
    fn type_name(&self) -> &'static str {
        match self {
            ParameterKind::Integer { .. } => "integer",
            ParameterKind::Float { .. } => "float",
            ParameterKind::Text => "string",
            ParameterKind::Choice { .. } => "choice",
            ParameterKind::Vector { .. } => "vector",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepParameter {
    pub idname: String,
    pub label: String,
    pub kind: ParameterKind,
    value: ParameterValue,
    default: ParameterValue,
}

impl StepParameter {
    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    pub fn default_value(&self) -> &ParameterValue {
        &self.default
    }

    /// Validate and coerce `value` against this parameter's kind.
    /// Integers are accepted for float parameters.
    fn check(&self, value: ParameterValue) -> Result<ParameterValue, ParameterError> {
        let mismatch = || ParameterError::TypeMismatch {
            idname: self.idname.clone(),
            expected: self.kind.type_name().to_string(),
        };
        match (&self.kind, value) {
            (ParameterKind::Integer { min, max }, ParameterValue::Integer(v)) => {
                if v < *min || v > *max {
                    return Err(ParameterError::OutOfBounds {
                        idname: self.idname.clone(),
                        value: v as f64,
                        min: *min as f64,
                        max: *max as f64,
                    });
                }
                Ok(ParameterValue::Integer(v))
            }
            (ParameterKind::Float { min, max }, ParameterValue::Integer(v)) => {
                self.check_float(v as f64, *min, *max)
            }
            (ParameterKind::Float { min, max }, ParameterValue::Float(v)) => {
                self.check_float(v, *min, *max)
            }
            (ParameterKind::Text, ParameterValue::Text(v)) => Ok(ParameterValue::Text(v)),
            (ParameterKind::Choice { options }, ParameterValue::Text(v)) => {
                if options.iter().any(|o| o == &v) {
                    Ok(ParameterValue::Text(v))
                } else {
                    Err(ParameterError::InvalidChoice {
                        idname: self.idname.clone(),
                        value: v,
                        options: options.clone(),
                    })
                }
            }
            (ParameterKind::Vector { len, min, max }, ParameterValue::Vector(v)) => {
                if v.len() != *len {
                    return Err(ParameterError::WrongLength {
                        idname: self.idname.clone(),
                        expected: *len,
                        got: v.len(),
                    });
                }
                if let Some(bad) = v.iter().find(|x| !(**x >= *min && **x <= *max)) {
                    return Err(ParameterError::OutOfBounds {
                        idname: self.idname.clone(),
                        value: *bad,
                        min: *min,
                        max: *max,
                    });
                }
                Ok(ParameterValue::Vector(v))
            }
            _ => Err(mismatch()),
        }
    }

    fn check_float(&self, v: f64, min: f64, max: f64) -> Result<ParameterValue, ParameterError> {
        if !(v >= min && v <= max) {
            return Err(ParameterError::OutOfBounds {
                idname: self.idname.clone(),
                value: v,
                min,
                max,
            });
        }
        Ok(ParameterValue::Float(v))
    }
}

/// Ordered parameter collection owned by a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    params: Vec<StepParameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, idname: &str, label: &str, kind: ParameterKind, default: ParameterValue) -> Self {
        self.params.push(StepParameter {
            idname: idname.to_string(),
            label: label.to_string(),
            kind,
            value: default.clone(),
            default,
        });
        self
    }

    pub fn integer(self, idname: &str, label: &str, default: i64, min: i64, max: i64) -> Self {
        self.push(
            idname,
            label,
            ParameterKind::Integer { min, max },
            ParameterValue::Integer(default),
        )
    }

    pub fn float(self, idname: &str, label: &str, default: f64, min: f64, max: f64) -> Self {
        self.push(
            idname,
            label,
            ParameterKind::Float { min, max },
            ParameterValue::Float(default),
        )
    }

    pub fn text(self, idname: &str, label: &str, default: &str) -> Self {
        self.push(
            idname,
            label,
            ParameterKind::Text,
            ParameterValue::Text(default.to_string()),
        )
    }

    pub fn choice(self, idname: &str, label: &str, default: &str, options: &[&str]) -> Self {
        self.push(
            idname,
            label,
            ParameterKind::Choice {
                options: options.iter().map(|o| o.to_string()).collect(),
            },
            ParameterValue::Text(default.to_string()),
        )
    }

    pub fn vector(self, idname: &str, label: &str, default: &[f64], min: f64, max: f64) -> Self {
        self.push(
            idname,
            label,
            ParameterKind::Vector {
                len: default.len(),
                min,
                max,
            },
            ParameterValue::Vector(default.to_vec()),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepParameter> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn find(&self, idname: &str) -> Result<&StepParameter, ParameterError> {
        self.params
            .iter()
            .find(|p| p.idname == idname)
            .ok_or_else(|| ParameterError::NotFound(idname.to_string()))
    }

    pub fn get(&self, idname: &str) -> Result<&ParameterValue, ParameterError> {
        self.find(idname).map(|p| &p.value)
    }

    pub fn set(&mut self, idname: &str, value: ParameterValue) -> Result<(), ParameterError> {
        let param = self
            .params
            .iter_mut()
            .find(|p| p.idname == idname)
            .ok_or_else(|| ParameterError::NotFound(idname.to_string()))?;
        param.value = param.check(value)?;
        Ok(())
    }

    /// Restore every parameter to its default
    pub fn reset(&mut self) {
        for p in self.params.iter_mut() {
            p.value = p.default.clone();
        }
    }

    // ---------------------------------------------------------------------
    //  Typed getters
    // ---------------------------------------------------------------------

    pub fn get_int(&self, idname: &str) -> Result<i64, ParameterError> {
        match self.get(idname)? {
            ParameterValue::Integer(v) => Ok(*v),
            _ => Err(self.mismatch(idname, "integer")),
        }
    }

    /// Non-negative integer parameter as a count
    pub fn get_usize(&self, idname: &str) -> Result<usize, ParameterError> {
        let v = self.get_int(idname)?;
        usize::try_from(v).map_err(|_| ParameterError::OutOfBounds {
            idname: idname.to_string(),
            value: v as f64,
            min: 0.0,
            max: f64::MAX,
        })
    }

    pub fn get_float(&self, idname: &str) -> Result<f64, ParameterError> {
        match self.get(idname)? {
            ParameterValue::Float(v) => Ok(*v),
            ParameterValue::Integer(v) => Ok(*v as f64),
            _ => Err(self.mismatch(idname, "float")),
        }
    }

    pub fn get_text(&self, idname: &str) -> Result<&str, ParameterError> {
        match self.get(idname)? {
            ParameterValue::Text(v) => Ok(v),
            _ => Err(self.mismatch(idname, "string")),
        }
    }

    pub fn get_vector(&self, idname: &str) -> Result<&[f64], ParameterError> {
        match self.get(idname)? {
            ParameterValue::Vector(v) => Ok(v),
            _ => Err(self.mismatch(idname, "vector")),
        }
    }

    /// Two-component vector as a (low, high) range
    pub fn get_range(&self, idname: &str) -> Result<(f64, f64), ParameterError> {
        let v = self.get_vector(idname)?;
        match v {
            [a, b] => Ok((*a, *b)),
            _ => Err(ParameterError::WrongLength {
                idname: idname.to_string(),
                expected: 2,
                got: v.len(),
            }),
        }
    }

    fn mismatch(&self, idname: &str, expected: &str) -> ParameterError {
        ParameterError::TypeMismatch {
            idname: idname.to_string(),
            expected: expected.to_string(),
        }
    }

    /// `idname=value` pairs for logs
    pub fn summary(&self) -> String {
        self.params
            .iter()
            .map(|p| format!("{}={}", p.idname, p.value))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
