//! Bit-level placement of parameter values
//!
//! Descriptor documents write positions as decimals where the fractional
//! digit is a bit (`5.2` = byte 5, bit 2) and sizes the same way (`0.4` =
//! four bits, `1.4` = one byte plus four bits). Those literals are parsed
//! here into [`BitAddress`] / [`BitSize`] and never travel further as floats.
//!
//! Field layout rules shared by frame payloads and configuration storage:
//! - A field of at most 8 bits, or any field with a non-zero bit offset, lives
//!   in one byte at `bit..bit+size` (counting from the LSB) and may spill its
//!   high bits into the low bits of the following byte.
//! - Wider fields start on a byte boundary and are big-endian. When the size
//!   carries extra bits (`1.4`), the first byte only holds that many low bits.

use crate::error::{ModelError, Result};
use std::fmt;

/// Masks indexed by bit count. Index 0 stands for a whole byte.
pub const BITMASK: [u8; 9] = [0xFF, 0x01, 0x03, 0x07, 0x0F, 0x1F, 0x3F, 0x7F, 0xFF];

/// Split a descriptor decimal (`"5.2"`) into its integer part and the single
/// fractional digit, rounding like the document format expects.
fn split_decimal(text: &str) -> Result<(u32, u32)> {
    let value: f64 = text
        .trim()
        .parse()
        .map_err(|_| ModelError::InvalidNumber(text.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ModelError::InvalidNumber(text.to_string()));
    }
    let whole = value.floor() as u32;
    let digit = ((value * 10.0).round() as u64 % 10) as u32;
    Ok((whole, digit))
}

/// Byte/bit position of a field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitAddress {
    pub byte: u32,
    pub bit: u8,
}

impl BitAddress {
    pub const fn new(byte: u32, bit: u8) -> Self {
        Self { byte, bit }
    }

    /// Build from an absolute bit offset
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            byte: (bits / 8) as u32,
            bit: (bits % 8) as u8,
        }
    }

    /// Parse `"5.2"`, `"16"` or a hex byte address such as `"0x0C"`.
    ///
    /// A bit digit of 8 or 9 rolls over into the next byte.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
            let byte = common::hex::parse_number(trimmed)
                .filter(|v| *v >= 0 && *v <= i64::from(u32::MAX))
                .ok_or_else(|| ModelError::InvalidNumber(text.to_string()))?;
            return Ok(Self::new(byte as u32, 0));
        }
        let (byte, bit) = split_decimal(trimmed)?;
        Ok(Self::from_bits(u64::from(byte) * 8 + u64::from(bit)))
    }

    pub const fn total_bits(&self) -> u64 {
        self.byte as u64 * 8 + self.bit as u64
    }

    /// Move forward by `bits` (negative moves back, saturating at zero)
    pub fn offset_bits(&self, bits: i64) -> Self {
        let total = (self.total_bits() as i64 + bits).max(0);
        Self::from_bits(total as u64)
    }
}

impl fmt::Display for BitAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.byte, self.bit)
    }
}

/// Width of a field in whole bytes plus extra bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BitSize {
    pub bytes: u32,
    pub bits: u8,
}

impl BitSize {
    pub const ZERO: BitSize = BitSize { bytes: 0, bits: 0 };
    pub const ONE_BYTE: BitSize = BitSize { bytes: 1, bits: 0 };

    pub const fn new(bytes: u32, bits: u8) -> Self {
        Self { bytes, bits }
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self {
            bytes: (bits / 8) as u32,
            bits: (bits % 8) as u8,
        }
    }

    /// Parse `"0.4"`, `"2.0"` or `"1.4"`
    pub fn parse(text: &str) -> Result<Self> {
        let (bytes, bits) = split_decimal(text)?;
        Ok(Self::from_bits(u64::from(bytes) * 8 + u64::from(bits)))
    }

    pub const fn total_bits(&self) -> u64 {
        self.bytes as u64 * 8 + self.bits as u64
    }

    pub const fn is_zero(&self) -> bool {
        self.bytes == 0 && self.bits == 0
    }

    /// Number of bytes needed to hold the value (at least one)
    pub fn whole_bytes(&self) -> usize {
        let bytes = self.bytes as usize + usize::from(self.bits > 0);
        bytes.max(1)
    }
}

impl fmt::Display for BitSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bytes, self.bits)
    }
}

/// Bit width of a single-byte field. A zero size stands for the whole byte.
fn partial_bits(size: BitSize) -> usize {
    match size.total_bits() {
        0 => 8,
        bits => bits.min(8) as usize,
    }
}

/// Whether a field is packed into a single (possibly shared) byte
pub fn is_partial(address: BitAddress, size: BitSize) -> Result<bool> {
    if address.bit != 0 && size.total_bits() > 8 {
        return Err(ModelError::PartialByteTooWide(format!(
            "index {} size {}",
            address, size
        )));
    }
    Ok(size.total_bits() <= 8 || address.bit != 0)
}

/// Number of consecutive bytes a field touches, starting at `address.byte`
pub fn field_span(address: BitAddress, size: BitSize) -> Result<usize> {
    if is_partial(address, size)? {
        let end = usize::from(address.bit) + partial_bits(size);
        Ok(if end > 8 { 2 } else { 1 })
    } else {
        Ok(size.whole_bytes())
    }
}

/// Read a field as right-aligned big-endian bytes.
///
/// Bytes beyond the end of `data` read as zero. `mask` further restricts the
/// result of byte-aligned fields of at most four bytes.
pub fn read_field(
    data: &[u8],
    address: BitAddress,
    size: BitSize,
    mask: Option<u32>,
) -> Result<Vec<u8>> {
    let at = |i: usize| data.get(i).copied().unwrap_or(0);
    let start = address.byte as usize;

    if is_partial(address, size)? {
        let bits = partial_bits(size);
        let bit = usize::from(address.bit);
        let mut value = (u16::from(at(start)) >> bit) as u8;
        if bit + bits > 8 {
            let missing = bit + bits - 8;
            let next = at(start + 1) & BITMASK[missing];
            value |= next << (bits - missing);
        }
        return Ok(vec![value & BITMASK[bits]]);
    }

    let bytes = size.whole_bytes();
    let mut result = Vec::with_capacity(bytes);
    for i in 0..bytes {
        let mut current = at(start + i);
        if i == 0 {
            current &= BITMASK[usize::from(size.bits)];
        }
        if let Some(mask) = mask {
            if bytes <= 4 {
                current &= (mask >> ((bytes - i - 1) * 8)) as u8;
            }
        }
        result.push(current);
    }
    Ok(result)
}

/// Write right-aligned big-endian `value` into a field, leaving every bit
/// outside the field untouched. `data` grows with zeros as needed.
///
/// A source shorter than the field is zero-padded in front.
pub fn write_field(
    data: &mut Vec<u8>,
    address: BitAddress,
    size: BitSize,
    value: &[u8],
) -> Result<()> {
    let start = address.byte as usize;
    let span = field_span(address, size)?;
    if data.len() < start + span {
        data.resize(start + span, 0);
    }

    if is_partial(address, size)? {
        let bits = partial_bits(size);
        let bit = usize::from(address.bit);
        let source = value.last().copied().unwrap_or(0) & BITMASK[bits];

        let clear = (u16::from(BITMASK[bits]) << bit) as u8;
        let byte = &mut data[start];
        *byte &= !clear;
        *byte |= (u16::from(source) << bit) as u8;

        if bit + bits > 8 {
            let missing = bit + bits - 8;
            let next = &mut data[start + 1];
            *next &= !BITMASK[missing];
            *next |= source >> (bits - missing);
        }
        return Ok(());
    }

    let bytes = size.whole_bytes();
    let first_mask = BITMASK[usize::from(size.bits)];
    if value.len() >= bytes {
        let source = &value[value.len() - bytes..];
        data[start] = (data[start] & !first_mask) | (source[0] & first_mask);
        data[start + 1..start + bytes].copy_from_slice(&source[1..]);
    } else {
        let missing = bytes - value.len();
        data[start] &= !first_mask;
        for b in &mut data[start + 1..start + missing] {
            *b = 0;
        }
        for (i, b) in value.iter().enumerate() {
            let target = start + missing + i;
            data[target] = if target == start { b & first_mask } else { *b };
        }
    }
    Ok(())
}

/// Big-endian unsigned value of up to four bytes
pub fn read_be(data: &[u8]) -> u32 {
    data.iter()
        .rev()
        .take(4)
        .rev()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

/// Shortest big-endian representation; zero is one byte, negatives four.
pub fn to_be_minimal(value: i32) -> Vec<u8> {
    if value < 0 {
        return value.to_be_bytes().to_vec();
    }
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(3).take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}
