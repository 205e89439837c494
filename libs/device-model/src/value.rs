//! Runtime parameter values

use crate::error::{ModelError, Result};
use crate::logical::LogicalParameter;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A decoded parameter value.
///
/// Enumerations travel as their option index, actions as booleans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Boolean(bool),
    Integer(i32),
    Float(f64),
    String(String),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Boolean(_) => "boolean",
            ParamValue::Integer(_) => "integer",
            ParamValue::Float(_) => "float",
            ParamValue::String(_) => "string",
        }
    }

    /// Integer view. Floats round, booleans become 0/1, strings parse or yield 0.
    pub fn as_i32(&self) -> i32 {
        match self {
            ParamValue::Boolean(b) => i32::from(*b),
            ParamValue::Integer(i) => *i,
            ParamValue::Float(f) => f.round() as i32,
            ParamValue::String(s) => common::hex::parse_number(s)
                .map(|v| v as i32)
                .unwrap_or(0),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Boolean(b) => f64::from(u8::from(*b)),
            ParamValue::Integer(i) => f64::from(*i),
            ParamValue::Float(f) => *f,
            ParamValue::String(s) => s.trim().parse().unwrap_or(0.0),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            ParamValue::Boolean(b) => *b,
            ParamValue::Integer(i) => *i != 0,
            ParamValue::Float(f) => *f != 0.0,
            ParamValue::String(s) => s == "true" || s == "1",
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            ParamValue::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Parse text into the value type a logical parameter expects.
    ///
    /// Enumerations accept an option id or a numeric index.
    pub fn parse_for(logical: &LogicalParameter, text: &str) -> Result<ParamValue> {
        let text = text.trim();
        let invalid = || ModelError::InvalidNumber(text.to_string());
        match logical {
            LogicalParameter::Integer(_) => common::hex::parse_number(text)
                .and_then(|v| i32::try_from(v).ok())
                .map(ParamValue::Integer)
                .ok_or_else(invalid),
            LogicalParameter::Float(_) => text
                .parse::<f64>()
                .map(ParamValue::Float)
                .map_err(|_| invalid()),
            LogicalParameter::Boolean(_) | LogicalParameter::Action(_) => {
                match text.to_ascii_lowercase().as_str() {
                    "true" | "1" | "on" => Ok(ParamValue::Boolean(true)),
                    "false" | "0" | "off" => Ok(ParamValue::Boolean(false)),
                    _ => Err(ModelError::type_mismatch("value", "boolean", text)),
                }
            },
            LogicalParameter::Enum(e) => {
                if let Some(index) = e.index_of(text) {
                    return Ok(ParamValue::Integer(index));
                }
                common::hex::parse_number(text)
                    .and_then(|v| i32::try_from(v).ok())
                    .map(ParamValue::Integer)
                    .ok_or_else(|| ModelError::type_mismatch("value", "enum option", text))
            },
            LogicalParameter::String(_) => Ok(ParamValue::String(text.to_string())),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Boolean(b) => write!(f, "{}", b),
            ParamValue::Integer(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Boolean(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Integer(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}
