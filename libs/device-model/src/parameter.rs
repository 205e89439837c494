//! Parameter descriptor and its byte codec

use crate::bits::{self, BitAddress, BitSize};
use crate::conversion::{self, Conversion};
use crate::error::{ModelError, Result};
use crate::logical::LogicalParameter;
use crate::physical::{Endian, PhysicalKind, PhysicalParameter};
use crate::value::ParamValue;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiFlags {
    pub visible: bool,
    pub internal: bool,
    pub transform: bool,
    pub service: bool,
    pub sticky: bool,
    pub invisible: bool,
}

impl Default for UiFlags {
    fn default() -> Self {
        Self {
            visible: true,
            internal: false,
            transform: false,
            service: false,
            sticky: false,
            invisible: false,
        }
    }
}

impl UiFlags {
    pub fn none() -> Self {
        Self {
            visible: false,
            ..Self::default()
        }
    }

    /// Whether the parameter is reported in paramset reads
    pub fn is_reported(&self) -> bool {
        self.visible || self.service || self.internal || self.transform
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operations {
    pub read: bool,
    pub write: bool,
    pub event: bool,
}

impl Default for Operations {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            event: true,
        }
    }
}

/// Comparison used by type matchers and constant frame fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CondOp {
    #[default]
    Equal,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
}

impl CondOp {
    pub fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "e" | "eq" => CondOp::Equal,
            "g" => CondOp::Greater,
            "l" => CondOp::Less,
            "ge" => CondOp::GreaterEqual,
            "le" => CondOp::LessEqual,
            _ => return None,
        })
    }
}

/// One addressable named unit: logical contract, placement and conversions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameter {
    pub id: String,
    pub ui_flags: UiFlags,
    pub operations: Operations,
    pub signed: bool,
    pub hidden: bool,
    pub control: String,
    pub loopback: bool,
    pub omit_if: Option<i32>,

    // Frame field and type matcher attributes
    pub index: BitAddress,
    pub size: BitSize,
    pub const_value: Option<i32>,
    pub cond_op: CondOp,
    pub param: String,
    pub additional_param: String,
    pub field_kind: PhysicalKind,

    pub logical: LogicalParameter,
    pub physical: PhysicalParameter,
    pub conversions: Vec<Conversion>,
}

impl Parameter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Evaluate `cond_op` against `const_value`
    pub fn check_condition(&self, value: i64) -> bool {
        let constant = i64::from(self.const_value.unwrap_or(-1));
        match self.cond_op {
            CondOp::Equal => value == constant,
            CondOp::Greater => value > constant,
            CondOp::Less => value < constant,
            CondOp::GreaterEqual => value >= constant,
            CondOp::LessEqual => value <= constant,
        }
    }

    /// The toggle instruction attached to this parameter, if any
    pub fn toggle(&self) -> Option<&Conversion> {
        self.conversions.iter().find(|c| c.is_toggle())
    }

    fn normalize_endian(&self, data: &[u8]) -> Vec<u8> {
        if self.physical.endian != Endian::Little {
            return data.to_vec();
        }
        let mut bytes = data.to_vec();
        let width = self.physical.size.whole_bytes();
        if bytes.len() < width {
            bytes.resize(width, 0);
        }
        bytes.reverse();
        bytes
    }

    /// Decode raw bytes into a logical value.
    ///
    /// `is_event` only matters for actions, which are true when the bytes
    /// come from an event occurrence.
    pub fn decode(&self, data: &[u8], is_event: bool) -> Result<ParamValue> {
        let data = self.normalize_endian(data);
        let plain = self.conversions.is_empty();

        match &self.logical {
            LogicalParameter::Action(_) => return Ok(ParamValue::Boolean(is_event)),
            LogicalParameter::String(_) if plain => return Ok(ParamValue::String(c_string(&data))),
            _ if data.is_empty() && self.physical.kind != PhysicalKind::String => {
                return Err(ModelError::EmptyBuffer(self.id.clone()));
            },
            LogicalParameter::Enum(_) if plain => {
                return Ok(ParamValue::Integer(self.raw_integer(&data)?))
            },
            LogicalParameter::Boolean(_) if plain => {
                return Ok(ParamValue::Boolean(self.raw_integer(&data)? != 0))
            },
            _ => {},
        }

        let raw = if self.physical.kind == PhysicalKind::String {
            ParamValue::String(c_string(&data))
        } else {
            let mut raw = i64::from(self.raw_integer(&data)?);
            if self.signed {
                raw = self.sign_extend(&data, raw);
            }
            ParamValue::Integer(raw as i32)
        };
        let value = conversion::apply_forward(&self.conversions, raw);
        trace!(parameter = %self.id, %value, "decoded");
        Ok(self.logical.coerce(value))
    }

    fn raw_integer(&self, data: &[u8]) -> Result<i32> {
        if data.len() > 4 {
            return Err(ModelError::SizeMismatch {
                parameter: self.id.clone(),
                reason: format!("{} bytes do not fit an integer", data.len()),
            });
        }
        Ok(bits::read_be(data) as i32)
    }

    fn sign_extend(&self, data: &[u8], raw: i64) -> i64 {
        let size = self.physical.size;
        let Some(byte_index) = data.len().checked_sub(size.whole_bytes()) else {
            return raw;
        };
        let sign_bit = if size.bits == 0 { 7 } else { size.bits - 1 };
        if data[byte_index] & (1 << sign_bit) != 0 {
            raw - (1i64 << (u64::from(size.bytes) * 8 + u64::from(size.bits)))
        } else {
            raw
        }
    }

    /// Encode a logical value into big-endian raw bytes
    pub fn encode(&self, value: &ParamValue) -> Result<Vec<u8>> {
        self.check_type(value)?;
        let plain = self.conversions.is_empty();
        let size = self.physical.size;

        let bytes = match &self.logical {
            LogicalParameter::Enum(e) if plain => {
                bits::to_be_minimal(value.as_i32().clamp(e.min, e.max))
            },
            LogicalParameter::Action(_) => vec![u8::from(value.as_bool())],
            LogicalParameter::String(_) if plain => {
                let mut bytes = value.as_string().into_bytes();
                if self.physical.size_defined && bytes.len() < size.bytes as usize {
                    bytes.resize(size.bytes as usize, 0);
                }
                bytes
            },
            _ => {
                let clamped = self.logical.clamp(value.clone());
                let raw = if plain {
                    ParamValue::Integer(clamped.as_i32())
                } else {
                    conversion::apply_inverse(&self.conversions, clamped)
                };
                match raw {
                    ParamValue::String(s) if self.physical.kind == PhysicalKind::String => {
                        s.into_bytes()
                    },
                    other => bits::to_be_minimal(self.mask_to_size(other.as_i32())),
                }
            },
        };

        if self.physical.endian == Endian::Little {
            let mut bytes = bytes;
            let width = size.whole_bytes();
            while bytes.len() < width {
                bytes.insert(0, 0);
            }
            bytes.reverse();
            return Ok(bytes);
        }
        Ok(bytes)
    }

    fn mask_to_size(&self, raw: i32) -> i32 {
        if self.physical.kind == PhysicalKind::String || !self.physical.size_defined {
            return raw;
        }
        let size = self.physical.size;
        let (bytes, bits) = if size.bytes >= 4 {
            (4, 0)
        } else if size.is_zero() {
            // a zero size is a whole byte
            (1, 0)
        } else {
            (size.bytes, u32::from(size.bits))
        };
        let shift = (4 - bytes) * 8 - bits;
        let mask = u32::MAX.checked_shr(shift).unwrap_or(0);
        ((raw as u32) & mask) as i32
    }

    fn check_type(&self, value: &ParamValue) -> Result<()> {
        let ok = match (&self.logical, value) {
            (LogicalParameter::String(_), _) => true,
            (_, ParamValue::String(_)) => self.conversions.iter().any(|c| {
                matches!(c, Conversion::StringUnsignedInteger)
            }),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ModelError::type_mismatch(
                &self.id,
                self.logical.type_name(),
                value.type_name(),
            ))
        }
    }

    /// Shift a sub-byte raw value to its bit offset so it can be OR-merged
    /// with sibling fields, then front-pad to the declared whole bytes.
    pub fn adjust_bit_position(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() > 4 || data.is_empty() || self.physical.kind == PhysicalKind::String {
            return Ok(data.to_vec());
        }
        let index = self.physical.index;
        let size = self.physical.size;
        let mut data = data.to_vec();
        if index.bit != 0 || size.bytes == 0 {
            if size.total_bits() > 8 {
                return Err(ModelError::PartialByteTooWide(format!(
                    "{}: index {} size {}",
                    self.id, index, size
                )));
            }
            let last = data[data.len() - 1];
            data = vec![(u16::from(last) << index.bit) as u8];
        }
        while data.len() < size.bytes as usize {
            data.insert(0, 0);
        }
        Ok(data)
    }
}

/// Bytes up to the first NUL as text
fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::logical::{FloatLogical, IntegerLogical, StringLogical};

    fn integer(size: BitSize, signed: bool) -> Parameter {
        let mut p = Parameter::new("VALUE");
        p.signed = signed;
        p.physical.kind = PhysicalKind::Integer;
        p.physical.size = size;
        p.physical.size_defined = true;
        p.logical = LogicalParameter::Integer(IntegerLogical {
            min: -1000,
            max: 1000,
            ..Default::default()
        });
        p
    }

    #[test]
    fn test_signed_decode() {
        let p = integer(BitSize::new(1, 0), true);
        assert_eq!(p.decode(&[0xFE], false).unwrap(), ParamValue::Integer(-2));
        let p = integer(BitSize::new(0, 4), true);
        assert_eq!(p.decode(&[0x0F], false).unwrap(), ParamValue::Integer(-1));
        let p = integer(BitSize::new(1, 0), false);
        assert_eq!(p.decode(&[0xFE], false).unwrap(), ParamValue::Integer(254));
    }

    #[test]
    fn test_negative_encode_is_masked() {
        let p = integer(BitSize::new(1, 0), true);
        assert_eq!(p.encode(&ParamValue::Integer(-2)).unwrap(), vec![0xFE]);
        assert_eq!(p.decode(&[0xFE], false).unwrap(), ParamValue::Integer(-2));
    }

    #[test]
    fn test_zero_size_encodes_a_whole_byte() {
        let p = integer(BitSize::new(0, 0), false);
        assert_eq!(p.encode(&ParamValue::Integer(200)).unwrap(), vec![0xC8]);
        assert_eq!(p.encode(&ParamValue::Integer(0x1C8)).unwrap(), vec![0xC8]);
    }

    #[test]
    fn test_codec_faults() {
        let p = integer(BitSize::new(1, 0), false);
        assert!(matches!(p.decode(&[], false), Err(ModelError::EmptyBuffer(_))));
        assert!(matches!(
            p.decode(&[1, 2, 3, 4, 5], false),
            Err(ModelError::SizeMismatch { .. })
        ));
        assert!(matches!(
            p.encode(&ParamValue::String("x".into())),
            Err(ModelError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_string_padding_and_trim() {
        let mut p = Parameter::new("NAME");
        p.logical = LogicalParameter::String(StringLogical::default());
        p.physical.kind = PhysicalKind::String;
        p.physical.size = BitSize::new(6, 0);
        p.physical.size_defined = true;
        let bytes = p.encode(&ParamValue::String("hall".into())).unwrap();
        assert_eq!(bytes, b"hall\0\0".to_vec());
        assert_eq!(p.decode(&bytes, false).unwrap(), ParamValue::String("hall".into()));
        assert_eq!(p.decode(&[0, 65], false).unwrap(), ParamValue::String(String::new()));
    }

    #[test]
    fn test_little_endian() {
        let mut p = integer(BitSize::new(2, 0), false);
        p.physical.endian = Endian::Little;
        let bytes = p.encode(&ParamValue::Integer(0x0102)).unwrap();
        assert_eq!(bytes, vec![0x02, 0x01]);
        assert_eq!(p.decode(&bytes, false).unwrap(), ParamValue::Integer(0x0102));
    }

    #[test]
    fn test_float_scale_encode() {
        let mut p = integer(BitSize::new(2, 0), false);
        p.logical = LogicalParameter::Float(FloatLogical {
            min: 0.0,
            max: 100.0,
            ..Default::default()
        });
        p.conversions = vec![Conversion::FloatIntegerScale {
            factor: 10.0,
            offset: 0.0,
        }];
        assert_eq!(p.encode(&ParamValue::Float(21.5)).unwrap(), vec![0xD7]);
        assert_eq!(p.decode(&[0x00, 0xD7], false).unwrap(), ParamValue::Float(21.5));
        // above max with an in-range default is clamped
        assert_eq!(p.encode(&ParamValue::Float(150.0)).unwrap(), vec![0x03, 0xE8]);
    }

    #[test]
    fn test_adjust_bit_position() {
        let mut p = integer(BitSize::new(0, 3), false);
        p.physical.index = BitAddress::new(4, 3);
        assert_eq!(p.adjust_bit_position(&[0b101]).unwrap(), vec![0b0010_1000]);

        p.physical.size = BitSize::new(1, 2);
        assert!(p.adjust_bit_position(&[1]).is_err());
    }

    #[test]
    fn test_check_condition() {
        let mut p = Parameter::new("FIRMWARE");
        p.const_value = Some(0x0303);
        p.cond_op = CondOp::GreaterEqual;
        assert!(p.check_condition(0x0303));
        assert!(p.check_condition(0x0400));
        assert!(!p.check_condition(0x0302));
    }
}
