//! Value conversion stages between raw integers and logical values
//!
//! A parameter carries an ordered list of stages. Decoding runs them in
//! declared order, encoding runs their inverses in reverse order.

use crate::value::ParamValue;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Factors of the legacy 3+5 bit time encoding, indexed by the top three bits
const CONFIGTIME_FACTORS: [f64; 8] = [0.1, 1.0, 5.0, 10.0, 60.0, 300.0, 600.0, 3600.0];
/// Largest value each legacy factor can express, in the same order
const CONFIGTIME_LIMITS: [f64; 7] = [3.1, 31.0, 155.0, 310.0, 1860.0, 9300.0, 18600.0];

/// One conversion stage
#[derive(Debug, Clone, PartialEq)]
pub enum Conversion {
    /// `value = raw / factor - offset`
    FloatIntegerScale { factor: f64, offset: f64 },
    /// Decode multiplies by `div` then divides by `mul` (zero disables a step)
    IntegerIntegerScale { div: i32, mul: i32 },
    /// Table lookup; unmapped values pass through
    IntegerIntegerMap {
        from_device: BTreeMap<i32, i32>,
        to_device: BTreeMap<i32, i32>,
    },
    BooleanInteger {
        threshold: i32,
        true_value: i32,
        false_value: i32,
        invert: bool,
    },
    /// Factor index in the high bits, magnitude in the low `value_bits`.
    /// With no factors the legacy 3+5 bit layout applies.
    FloatConfigTime { factors: Vec<f64>, value_bits: u32 },
    IntegerTinyFloat {
        mantissa_start: u32,
        mantissa_size: u32,
        exponent_start: u32,
        exponent_size: u32,
    },
    StringUnsignedInteger,
    /// Control instruction; flips `parameter` instead of transforming a value
    Toggle { parameter: String, on: i32, off: i32 },
}

impl Conversion {
    pub fn tiny_float() -> Self {
        Conversion::IntegerTinyFloat {
            mantissa_start: 5,
            mantissa_size: 11,
            exponent_start: 0,
            exponent_size: 5,
        }
    }

    pub fn boolean_integer() -> Self {
        Conversion::BooleanInteger {
            threshold: 0,
            true_value: 0,
            false_value: 0,
            invert: false,
        }
    }

    /// Raw (device side) to logical
    pub fn forward(&self, value: ParamValue) -> ParamValue {
        match self {
            Conversion::FloatIntegerScale { factor, offset } => {
                ParamValue::Float(f64::from(value.as_i32()) / factor - offset)
            },
            Conversion::IntegerIntegerScale { div, mul } => {
                let mut v = value.as_i32();
                if *div > 0 {
                    v = v.wrapping_mul(*div);
                }
                if *mul > 0 {
                    v /= mul;
                }
                ParamValue::Integer(v)
            },
            Conversion::IntegerIntegerMap { from_device, .. } => {
                let v = value.as_i32();
                ParamValue::Integer(from_device.get(&v).copied().unwrap_or(v))
            },
            Conversion::BooleanInteger {
                threshold,
                true_value,
                false_value,
                invert,
            } => {
                let raw = value.as_i32();
                let b = if *true_value == 0 && *false_value == 0 {
                    raw > *threshold
                } else if raw == *false_value {
                    false
                } else {
                    raw == *true_value || raw > *threshold
                };
                ParamValue::Boolean(b != *invert)
            },
            Conversion::FloatConfigTime {
                factors,
                value_bits,
            } => {
                let raw = value.as_i32() as u32;
                if factors.is_empty() || *value_bits == 0 {
                    let raw = raw & 0xFF;
                    let factor = CONFIGTIME_FACTORS[(raw >> 5) as usize];
                    return ParamValue::Float(f64::from(raw & 0x1F) * factor);
                }
                let index = raw.checked_shr(*value_bits).unwrap_or(0) as usize;
                let factor = factors
                    .get(index)
                    .or_else(|| factors.last())
                    .copied()
                    .unwrap_or(1.0);
                let magnitude = raw & low_mask(*value_bits);
                ParamValue::Float(f64::from(magnitude) * factor)
            },
            Conversion::IntegerTinyFloat {
                mantissa_start,
                mantissa_size,
                exponent_start,
                exponent_size,
            } => {
                let raw = value.as_i32() as u32;
                let mantissa = if *mantissa_size == 0 {
                    1
                } else {
                    raw.checked_shr(*mantissa_start).unwrap_or(0) & low_mask(*mantissa_size)
                };
                let exponent = if *exponent_size == 0 {
                    0
                } else {
                    raw.checked_shr(*exponent_start).unwrap_or(0) & low_mask(*exponent_size)
                };
                let v = i64::from(mantissa) << exponent.min(40);
                ParamValue::Integer(v.min(i64::from(i32::MAX)) as i32)
            },
            Conversion::StringUnsignedInteger => {
                ParamValue::String((value.as_i32() as u32).to_string())
            },
            Conversion::Toggle { .. } => value,
        }
    }

    /// Logical to raw (device side)
    pub fn inverse(&self, value: ParamValue) -> ParamValue {
        match self {
            Conversion::FloatIntegerScale { factor, offset } => {
                ParamValue::Integer(((value.as_f64() + offset) * factor).round() as i32)
            },
            Conversion::IntegerIntegerScale { div, mul } => {
                let mut v = value.as_i32();
                if *mul > 0 {
                    v = v.wrapping_mul(*mul);
                }
                if *div > 0 {
                    v /= div;
                }
                ParamValue::Integer(v)
            },
            Conversion::IntegerIntegerMap { to_device, .. } => {
                let v = value.as_i32();
                ParamValue::Integer(to_device.get(&v).copied().unwrap_or(v))
            },
            Conversion::BooleanInteger {
                true_value,
                false_value,
                invert,
                ..
            } => {
                let b = value.as_bool() != *invert;
                let raw = if *true_value == 0 && *false_value == 0 {
                    i32::from(b)
                } else if b {
                    *true_value
                } else {
                    *false_value
                };
                ParamValue::Integer(raw)
            },
            Conversion::FloatConfigTime {
                factors,
                value_bits,
            } => {
                let v = value.as_f64().max(0.0);
                if factors.is_empty() || *value_bits == 0 {
                    let index = CONFIGTIME_LIMITS
                        .iter()
                        .position(|limit| v <= *limit)
                        .unwrap_or(CONFIGTIME_LIMITS.len());
                    let magnitude = (v / CONFIGTIME_FACTORS[index]).round().min(31.0) as i32;
                    return ParamValue::Integer((((index as i32) << 5) | magnitude) & 0xFF);
                }
                let max_magnitude = f64::from(low_mask(*value_bits));
                let index = factors
                    .iter()
                    .position(|f| v / f <= max_magnitude)
                    .unwrap_or(factors.len() - 1);
                let magnitude = (v / factors[index]).round().min(max_magnitude) as u32;
                let raw = (index as u32).checked_shl(*value_bits).unwrap_or(0) | magnitude;
                ParamValue::Integer(raw as i32)
            },
            Conversion::IntegerTinyFloat {
                mantissa_start,
                mantissa_size,
                exponent_start,
                exponent_size,
            } => {
                let max_mantissa = i64::from(low_mask(*mantissa_size));
                let max_exponent = i64::from(low_mask(*exponent_size));
                let mut mantissa = i64::from(value.as_i32()).max(0);
                let mut exponent = 0i64;
                if max_mantissa > 0 {
                    while mantissa >= max_mantissa {
                        mantissa >>= 1;
                        exponent += 1;
                    }
                }
                let mantissa = mantissa.min(max_mantissa) as u32;
                let exponent = exponent.min(max_exponent) as u32;
                trace!(mantissa, exponent, "tinyfloat encode");
                let raw = mantissa.checked_shl(*mantissa_start).unwrap_or(0)
                    | exponent.checked_shl(*exponent_start).unwrap_or(0);
                ParamValue::Integer(raw as i32)
            },
            Conversion::StringUnsignedInteger => {
                let text = value.as_string();
                match text.trim().parse::<u32>() {
                    Ok(v) => ParamValue::Integer(v as i32),
                    Err(_) => {
                        warn!("Cannot convert \"{}\" to an unsigned integer", text);
                        ParamValue::Integer(0)
                    },
                }
            },
            Conversion::Toggle { .. } => value,
        }
    }

    pub fn is_toggle(&self) -> bool {
        matches!(self, Conversion::Toggle { .. })
    }
}

fn low_mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Run a chain in declared order (raw to logical)
pub fn apply_forward(chain: &[Conversion], raw: ParamValue) -> ParamValue {
    chain.iter().fold(raw, |v, stage| stage.forward(v))
}

/// Run a chain in reverse order (logical to raw)
pub fn apply_inverse(chain: &[Conversion], value: ParamValue) -> ParamValue {
    chain.iter().rev().fold(value, |v, stage| stage.inverse(v))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_scale() {
        let c = Conversion::FloatIntegerScale {
            factor: 2.0,
            offset: 0.5,
        };
        assert_eq!(c.forward(ParamValue::Integer(45)), ParamValue::Float(22.0));
        assert_eq!(c.inverse(ParamValue::Float(22.0)), ParamValue::Integer(45));
    }

    #[test]
    fn test_integer_scale_direction() {
        let c = Conversion::IntegerIntegerScale { div: 10, mul: 0 };
        assert_eq!(c.forward(ParamValue::Integer(3)), ParamValue::Integer(30));
        assert_eq!(c.inverse(ParamValue::Integer(30)), ParamValue::Integer(3));
    }

    #[test]
    fn test_map_passes_unmapped_through() {
        let c = Conversion::IntegerIntegerMap {
            from_device: BTreeMap::from([(0xC8, 1)]),
            to_device: BTreeMap::from([(1, 0xC8)]),
        };
        assert_eq!(c.forward(ParamValue::Integer(0xC8)), ParamValue::Integer(1));
        assert_eq!(c.forward(ParamValue::Integer(7)), ParamValue::Integer(7));
        assert_eq!(c.inverse(ParamValue::Integer(1)), ParamValue::Integer(0xC8));
    }

    #[test]
    fn test_boolean_threshold() {
        let c = Conversion::BooleanInteger {
            threshold: 100,
            true_value: 200,
            false_value: 0,
            invert: false,
        };
        assert_eq!(c.forward(ParamValue::Integer(0)), ParamValue::Boolean(false));
        assert_eq!(c.forward(ParamValue::Integer(150)), ParamValue::Boolean(true));
        assert_eq!(c.forward(ParamValue::Integer(50)), ParamValue::Boolean(false));
        assert_eq!(c.inverse(ParamValue::Boolean(true)), ParamValue::Integer(200));

        let plain = Conversion::boolean_integer();
        assert_eq!(plain.inverse(ParamValue::Boolean(true)), ParamValue::Integer(1));
        assert_eq!(plain.forward(ParamValue::Integer(1)), ParamValue::Boolean(true));

        let inverted = Conversion::BooleanInteger {
            threshold: 0,
            true_value: 0,
            false_value: 0,
            invert: true,
        };
        assert_eq!(inverted.forward(ParamValue::Integer(1)), ParamValue::Boolean(false));
        assert_eq!(inverted.inverse(ParamValue::Boolean(false)), ParamValue::Integer(1));
    }

    #[test]
    fn test_legacy_configtime() {
        let c = Conversion::FloatConfigTime {
            factors: Vec::new(),
            value_bits: 0,
        };
        // 120 s -> factor 5 (index 2), magnitude 24
        let raw = c.inverse(ParamValue::Float(120.0));
        assert_eq!(raw, ParamValue::Integer((2 << 5) | 24));
        assert_eq!(c.forward(raw), ParamValue::Float(120.0));
        assert_eq!(c.inverse(ParamValue::Float(-4.0)), ParamValue::Integer(0));
    }

    #[test]
    fn test_windowed_configtime() {
        let c = Conversion::FloatConfigTime {
            factors: vec![0.1, 60.0],
            value_bits: 14,
        };
        let raw = c.inverse(ParamValue::Float(30.0)).as_i32();
        assert_eq!(raw, 300);
        let raw = c.inverse(ParamValue::Float(7200.0)).as_i32();
        assert_eq!(raw, (1 << 14) | 120);
        assert_eq!(c.forward(ParamValue::Integer(raw)), ParamValue::Float(7200.0));
    }

    #[test]
    fn test_tiny_float_large_value() {
        let c = Conversion::tiny_float();
        let raw = c.inverse(ParamValue::Integer(300_000)).as_i32();
        assert_eq!(raw, (1171 << 5) | 8);
        assert_eq!(c.forward(ParamValue::Integer(raw)), ParamValue::Integer(299_776));
    }

    #[test]
    fn test_full_width_fields_do_not_overflow() {
        let c = Conversion::FloatConfigTime {
            factors: vec![1.0, 60.0],
            value_bits: 32,
        };
        assert_eq!(c.inverse(ParamValue::Float(5.0)), ParamValue::Integer(5));
        assert_eq!(c.forward(ParamValue::Integer(5)), ParamValue::Float(5.0));

        let c = Conversion::IntegerTinyFloat {
            mantissa_start: 32,
            mantissa_size: 11,
            exponent_start: 0,
            exponent_size: 5,
        };
        // the mantissa sits outside the word and reads as zero
        assert_eq!(c.forward(ParamValue::Integer(5)), ParamValue::Integer(0));
        assert_eq!(c.inverse(ParamValue::Integer(5)), ParamValue::Integer(0));
    }

    #[test]
    fn test_string_unsigned() {
        let c = Conversion::StringUnsignedInteger;
        assert_eq!(c.forward(ParamValue::Integer(42)), ParamValue::String("42".into()));
        assert_eq!(c.inverse(ParamValue::String("42".into())), ParamValue::Integer(42));
    }

    #[test]
    fn test_chain_order() {
        let chain = vec![
            Conversion::IntegerIntegerScale { div: 0, mul: 2 },
            Conversion::FloatIntegerScale {
                factor: 10.0,
                offset: 0.0,
            },
        ];
        // raw 40 -> 20 -> 2.0
        assert_eq!(apply_forward(&chain, ParamValue::Integer(40)), ParamValue::Float(2.0));
        assert_eq!(apply_inverse(&chain, ParamValue::Float(2.0)), ParamValue::Integer(40));
    }
}
