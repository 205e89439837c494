//! Hex helpers for bus dumps and description attributes

use std::fmt::Write;

/// Encode bytes to uppercase hex string
/// Example: [0x12, 0x34, 0xAB] -> "1234AB"
pub fn encode_upper(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        // Writing to String buffer is infallible - no need for expect
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Parse an integer that may carry a `0x` prefix.
///
/// Leading `-` is honored for both forms. Returns `None` for anything
/// that is not a complete number.
pub fn parse_number(input: &str) -> Option<i64> {
    let s = input.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_encode_upper_basic() {
        assert_eq!(encode_upper(&[0x12, 0x34, 0xAB]), "1234AB");
    }

    #[test]
    fn test_encode_upper_empty() {
        assert_eq!(encode_upper(&[]), "");
    }

    #[test]
    fn test_parse_number_forms() {
        assert_eq!(parse_number("0x10"), Some(16));
        assert_eq!(parse_number("0XfF"), Some(255));
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number(" -7 "), Some(-7));
        assert_eq!(parse_number("-0x2"), Some(-2));
    }

    #[test]
    fn test_parse_number_rejects_garbage() {
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("0x"), None);
        assert_eq!(parse_number("12ab"), None);
    }
}
