//! Logical (application-facing) value contracts

use crate::value::ParamValue;
use tracing::warn;

/// Named value that bypasses range clamping (e.g. "NOT_USED" = 0xFF)
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialValue<T> {
    pub id: String,
    pub value: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegerLogical {
    pub min: i32,
    pub max: i32,
    pub default: i32,
    pub unit: String,
    pub special_values: Vec<SpecialValue<i32>>,
    pub enforce: Option<i32>,
}

impl Default for IntegerLogical {
    fn default() -> Self {
        Self {
            min: i32::MIN,
            max: i32::MAX,
            default: 0,
            unit: String::new(),
            special_values: Vec::new(),
            enforce: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatLogical {
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub unit: String,
    pub special_values: Vec<SpecialValue<f64>>,
    pub enforce: Option<f64>,
}

impl Default for FloatLogical {
    fn default() -> Self {
        Self {
            min: f64::MIN,
            max: f64::MAX,
            default: 0.0,
            unit: String::new(),
            special_values: Vec::new(),
            enforce: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BooleanLogical {
    pub default: bool,
    pub unit: String,
    pub enforce: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumOption {
    /// Empty for gap-filling placeholder options
    pub id: String,
    pub index: i32,
    pub default: bool,
}

impl EnumOption {
    pub fn new(id: impl Into<String>, index: i32, default: bool) -> Self {
        Self {
            id: id.into(),
            index,
            default,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnumLogical {
    pub options: Vec<EnumOption>,
    pub min: i32,
    pub max: i32,
    pub default: i32,
    pub unit: String,
    pub enforce: Option<i32>,
}

impl EnumLogical {
    /// Build from options in document order.
    ///
    /// Options are stored by index; an explicit index past the end pads the
    /// gap with unnamed placeholders, one that is already taken moves to the
    /// end.
    pub fn from_options(declared: Vec<EnumOption>) -> Self {
        let mut options: Vec<EnumOption> = Vec::with_capacity(declared.len());
        let mut default = 0;
        for option in declared {
            let next = options.len() as i32;
            if option.index < next {
                warn!(
                    "Enum option \"{}\": index {} is already taken, using {}",
                    option.id, option.index, next
                );
            }
            let index = option.index.max(next);
            while (options.len() as i32) < index {
                let pad = options.len() as i32;
                options.push(EnumOption::new("", pad, false));
            }
            if option.default {
                default = index;
            }
            options.push(EnumOption {
                index,
                ..option
            });
        }
        let max = options.len().saturating_sub(1) as i32;
        Self {
            options,
            min: 0,
            max,
            default,
            unit: String::new(),
            enforce: None,
        }
    }

    pub fn index_of(&self, id: &str) -> Option<i32> {
        self.options
            .iter()
            .find(|o| !o.id.is_empty() && o.id == id)
            .map(|o| o.index)
    }

    pub fn option_id(&self, index: i32) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.index == index)
            .map(|o| o.id.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringLogical {
    pub default: String,
    pub unit: String,
    pub enforce: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionLogical {
    pub default: bool,
    pub unit: String,
    pub enforce: Option<bool>,
}

/// Value contract of a parameter, one variant per logical type
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalParameter {
    Integer(IntegerLogical),
    Float(FloatLogical),
    Boolean(BooleanLogical),
    Enum(EnumLogical),
    String(StringLogical),
    Action(ActionLogical),
}

impl Default for LogicalParameter {
    fn default() -> Self {
        LogicalParameter::Integer(IntegerLogical::default())
    }
}

impl LogicalParameter {
    pub fn type_name(&self) -> &'static str {
        match self {
            LogicalParameter::Integer(_) => "integer",
            LogicalParameter::Float(_) => "float",
            LogicalParameter::Boolean(_) => "boolean",
            LogicalParameter::Enum(_) => "option",
            LogicalParameter::String(_) => "string",
            LogicalParameter::Action(_) => "action",
        }
    }

    pub fn unit(&self) -> &str {
        match self {
            LogicalParameter::Integer(l) => &l.unit,
            LogicalParameter::Float(l) => &l.unit,
            LogicalParameter::Boolean(l) => &l.unit,
            LogicalParameter::Enum(l) => &l.unit,
            LogicalParameter::String(l) => &l.unit,
            LogicalParameter::Action(l) => &l.unit,
        }
    }

    pub fn default_value(&self) -> ParamValue {
        match self {
            LogicalParameter::Integer(l) => ParamValue::Integer(l.default),
            LogicalParameter::Float(l) => ParamValue::Float(l.default),
            LogicalParameter::Boolean(l) => ParamValue::Boolean(l.default),
            LogicalParameter::Enum(l) => ParamValue::Integer(l.default),
            LogicalParameter::String(l) => ParamValue::String(l.default.clone()),
            LogicalParameter::Action(l) => ParamValue::Boolean(l.default),
        }
    }

    pub fn enforce_value(&self) -> Option<ParamValue> {
        match self {
            LogicalParameter::Integer(l) => l.enforce.map(ParamValue::Integer),
            LogicalParameter::Float(l) => l.enforce.map(ParamValue::Float),
            LogicalParameter::Boolean(l) => l.enforce.map(ParamValue::Boolean),
            LogicalParameter::Enum(l) => l.enforce.map(ParamValue::Integer),
            LogicalParameter::String(l) => l.enforce.clone().map(ParamValue::String),
            LogicalParameter::Action(l) => l.enforce.map(ParamValue::Boolean),
        }
    }

    pub fn set_enforce(&mut self, value: ParamValue) {
        match self {
            LogicalParameter::Integer(l) => l.enforce = Some(value.as_i32()),
            LogicalParameter::Float(l) => l.enforce = Some(value.as_f64()),
            LogicalParameter::Boolean(l) => l.enforce = Some(value.as_bool()),
            LogicalParameter::Enum(l) => l.enforce = Some(value.as_i32()),
            LogicalParameter::String(l) => l.enforce = Some(value.as_string()),
            LogicalParameter::Action(l) => l.enforce = Some(value.as_bool()),
        }
    }

    pub fn set_default(&mut self, value: ParamValue) {
        match self {
            LogicalParameter::Integer(l) => l.default = value.as_i32(),
            LogicalParameter::Float(l) => l.default = value.as_f64(),
            LogicalParameter::Boolean(l) => l.default = value.as_bool(),
            LogicalParameter::Enum(l) => l.default = value.as_i32(),
            LogicalParameter::String(l) => l.default = value.as_string(),
            LogicalParameter::Action(l) => l.default = value.as_bool(),
        }
    }

    /// Whether `value` is one of the named special values
    pub fn is_special(&self, value: &ParamValue) -> bool {
        match self {
            LogicalParameter::Integer(l) => {
                let v = value.as_i32();
                l.special_values.iter().any(|s| s.value == v)
            },
            LogicalParameter::Float(l) => {
                let v = value.as_f64();
                l.special_values.iter().any(|s| s.value == v)
            },
            _ => false,
        }
    }

    /// Reshape a decoded value into this logical type
    pub fn coerce(&self, value: ParamValue) -> ParamValue {
        match self {
            LogicalParameter::Integer(_) | LogicalParameter::Enum(_) => match value {
                ParamValue::Integer(_) => value,
                other => ParamValue::Integer(other.as_i32()),
            },
            LogicalParameter::Float(_) => ParamValue::Float(value.as_f64()),
            LogicalParameter::Boolean(_) | LogicalParameter::Action(_) => {
                ParamValue::Boolean(value.as_bool())
            },
            LogicalParameter::String(_) => match value {
                ParamValue::String(_) => value,
                other => ParamValue::String(other.to_string()),
            },
        }
    }

    /// Clamp a numeric value into `[min, max]`.
    ///
    /// The default and special values pass through. The upper bound only
    /// applies when the default itself is within it.
    pub fn clamp(&self, value: ParamValue) -> ParamValue {
        match self {
            LogicalParameter::Integer(l) => {
                let v = value.as_i32();
                if v == l.default || self.is_special(&value) {
                    return ParamValue::Integer(v);
                }
                let v = if v > l.max && l.default <= l.max { l.max } else { v };
                ParamValue::Integer(v.max(l.min))
            },
            LogicalParameter::Float(l) => {
                let v = value.as_f64();
                if v == l.default || self.is_special(&value) {
                    return ParamValue::Float(v);
                }
                let v = if v > l.max && l.default <= l.max { l.max } else { v };
                ParamValue::Float(v.max(l.min))
            },
            LogicalParameter::Enum(l) => ParamValue::Integer(value.as_i32().clamp(l.min, l.max)),
            _ => value,
        }
    }
}
