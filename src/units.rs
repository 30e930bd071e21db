//! Fixed-point conversion between decimal strings and on-chain integers
//!
//! The derivative contract stores prices and amounts as integers scaled by
//! 10^18. Conversion never rounds: a decimal that cannot be represented
//! exactly at 18 fractional digits is rejected.

use crate::error::InputError;

use ethers::types::U256;
use serde::{Serialize, Serializer};
use std::fmt;

/// Fractional digits used by the contract for prices and amounts
pub const DECIMALS: u32 = 18;

/// An on-chain 18-decimal fixed-point value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct FixedPoint(U256);

impl FixedPoint {
    pub const fn from_raw(raw: U256) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Parse a decimal string, failing on precision loss
    pub fn parse(field: &'static str, value: &str) -> Result<Self, InputError> {
        parse_fixed(field, value).map(Self)
    }

    /// Parse a decimal string that must be strictly positive
    pub fn parse_positive(field: &'static str, value: &str) -> Result<Self, InputError> {
        let parsed = Self::parse(field, value)?;
        if parsed.is_zero() {
            return Err(InputError::NonPositiveAmount { field });
        }
        Ok(parsed)
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_fixed(self.0))
    }
}

impl Serialize for FixedPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Convert a decimal string into its 18-decimal integer representation
pub fn parse_fixed(field: &'static str, value: &str) -> Result<U256, InputError> {
    let malformed = || InputError::MalformedNumber {
        field,
        value: value.to_string(),
    };

    let trimmed = value.trim();
    if let Some(rest) = trimmed.strip_prefix('-') {
        // A well-formed negative number is a sign problem, not a syntax one
        return if is_decimal_literal(rest) {
            Err(InputError::NonPositiveAmount { field })
        } else {
            Err(malformed())
        };
    }
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if !is_decimal_literal(trimmed) {
        return Err(malformed());
    }

    let (int_part, frac_part) = match trimmed.split_once('.') {
        Some((i, f)) => (i, f),
        None => (trimmed, ""),
    };

    // Trailing zeros carry no precision, so only significant digits count
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.len() > DECIMALS as usize {
        return Err(InputError::PrecisionLoss {
            field,
            max: DECIMALS,
        });
    }

    let mut digits = String::with_capacity(int_part.len() + DECIMALS as usize);
    digits.push_str(int_part);
    digits.push_str(frac_part);
    for _ in frac_part.len()..DECIMALS as usize {
        digits.push('0');
    }
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::zero());
    }

    U256::from_dec_str(digits).map_err(|_| InputError::Overflow { field })
}

/// Render an 18-decimal integer as a decimal string ("2000.0", "0.5")
pub fn format_fixed(raw: U256) -> String {
    let digits = raw.to_string();
    let scale = DECIMALS as usize;
    let padded = if digits.len() <= scale {
        format!("{}{}", "0".repeat(scale + 1 - digits.len()), digits)
    } else {
        digits
    };

    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.is_empty() {
        format!("{}.0", int_part)
    } else {
        format!("{}.{}", int_part, frac_part)
    }
}

fn is_decimal_literal(s: &str) -> bool {
    let mut seen_dot = false;
    let mut seen_digit = false;
    for c in s.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }
    seen_digit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wei(s: &str) -> U256 {
        U256::from_dec_str(s).unwrap()
    }

    #[test]
    fn test_parse_whole_and_fractional() {
        assert_eq!(parse_fixed("x", "2000").unwrap(), wei("2000000000000000000000"));
        assert_eq!(parse_fixed("x", "2000.00").unwrap(), wei("2000000000000000000000"));
        assert_eq!(parse_fixed("x", "0.5").unwrap(), wei("500000000000000000"));
        assert_eq!(parse_fixed("x", ".25").unwrap(), wei("250000000000000000"));
        assert_eq!(parse_fixed("x", "1.").unwrap(), wei("1000000000000000000"));
        assert_eq!(parse_fixed("x", "0.000000000000000001").unwrap(), U256::one());
    }

    #[test]
    fn test_parse_rejects_precision_loss() {
        let err = parse_fixed("amount", "0.0000000000000000001").unwrap_err();
        assert_eq!(err, InputError::PrecisionLoss { field: "amount", max: 18 });

        let err = parse_fixed("amount", "1.1234567890123456789").unwrap_err();
        assert!(matches!(err, InputError::PrecisionLoss { .. }));
    }

    #[test]
    fn test_parse_accepts_insignificant_trailing_zeros() {
        assert_eq!(
            parse_fixed("x", "1.000000000000000000000").unwrap(),
            wei("1000000000000000000")
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", ".", "abc", "1.2.3", "1e18", "12,5", " - "] {
            assert!(
                matches!(parse_fixed("x", bad), Err(InputError::MalformedNumber { .. })),
                "{bad:?} should be malformed"
            );
        }
        assert_eq!(
            parse_fixed("x", "-3").unwrap_err(),
            InputError::NonPositiveAmount { field: "x" }
        );
    }

    #[test]
    fn test_parse_overflow() {
        let huge = "9".repeat(80);
        assert_eq!(
            parse_fixed("x", &huge).unwrap_err(),
            InputError::Overflow { field: "x" }
        );
    }

    #[test]
    fn test_parse_positive_rejects_zero() {
        assert_eq!(
            FixedPoint::parse_positive("strike price", "0.000").unwrap_err(),
            InputError::NonPositiveAmount { field: "strike price" }
        );
    }

    #[test]
    fn test_format() {
        assert_eq!(format_fixed(wei("2000000000000000000000")), "2000.0");
        assert_eq!(format_fixed(wei("500000000000000000")), "0.5");
        assert_eq!(format_fixed(U256::one()), "0.000000000000000001");
        assert_eq!(format_fixed(U256::zero()), "0.0");
    }

    #[test]
    fn test_decimal_survives_conversion() {
        for input in ["2000.0", "500.0", "0.123456789012345678", "42.5", "7.000000000000000001"] {
            let raw = parse_fixed("x", input).unwrap();
            assert_eq!(format_fixed(raw), input);
        }
    }
}
