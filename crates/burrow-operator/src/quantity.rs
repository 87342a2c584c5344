//! Kubernetes resource quantity arithmetic
//!
//! `Quantity` is an opaque string on the wire ("10Gi", "500M", "1.5Ti"). The
//! persistence scaler and the warnings condition need to order quantities
//! exactly, so they are parsed into [`Capacity`], an integer count of
//! nano-units. Comparison is therefore semantic: `1Gi == 1024Mi`.

use crate::error::{OperatorError, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::fmt;

/// Nano-units per whole unit
const NANOS_PER_UNIT: u128 = 1_000_000_000;

/// Fractional digits that can be represented exactly
const MAX_FRACTION_DIGITS: usize = 9;

/// An exactly comparable, non-negative resource amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Capacity {
    nanos: u128,
}

impl Capacity {
    /// No storage at all
    pub const ZERO: Capacity = Capacity { nanos: 0 };

    /// Parse a Kubernetes quantity
    pub fn from_quantity(quantity: &Quantity) -> Result<Self> {
        Self::parse(&quantity.0)
    }

    /// Parse a quantity string such as `10Gi`, `0.5Ti`, `1e3` or `250m`
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let invalid = |reason: &str| OperatorError::InvalidQuantity {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("quantity is empty"));
        }

        let unsigned = match trimmed.as_bytes()[0] {
            b'-' => return Err(invalid("negative quantities are not allowed")),
            b'+' => &trimmed[1..],
            _ => trimmed,
        };

        let number_len = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_len);

        let mantissa = parse_mantissa(number).map_err(invalid)?;
        let scale = parse_suffix(suffix).ok_or_else(|| invalid("unknown suffix"))?;

        let nanos = match scale {
            Scale::Multiply(factor) => mantissa
                .checked_mul(factor)
                .ok_or_else(|| invalid("quantity is too large"))?,
            Scale::Divide(divisor) => mantissa / divisor,
        };

        Ok(Self { nanos })
    }

    /// Whether this is an empty (ephemeral) capacity
    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.nanos / NANOS_PER_UNIT;
        let frac = self.nanos % NANOS_PER_UNIT;
        if frac == 0 {
            write!(f, "{}", whole)
        } else {
            let digits = format!("{:09}", frac);
            write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
        }
    }
}

/// How a suffix scales the nano-unit mantissa
enum Scale {
    Multiply(u128),
    Divide(u128),
}

/// Parse `123` or `1.5` into nano-units
fn parse_mantissa(number: &str) -> std::result::Result<u128, &'static str> {
    if number.is_empty() {
        return Err("missing numeric value");
    }

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };

    if frac_part.contains('.') {
        return Err("more than one decimal point");
    }
    if int_part.is_empty() && frac_part.is_empty() {
        return Err("missing numeric value");
    }
    if frac_part.len() > MAX_FRACTION_DIGITS {
        return Err("too many fractional digits");
    }

    let int_value: u128 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| "invalid integer part")?
    };

    let frac_value: u128 = if frac_part.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac_part, width = MAX_FRACTION_DIGITS);
        padded.parse().map_err(|_| "invalid fractional part")?
    };

    int_value
        .checked_mul(NANOS_PER_UNIT)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or("quantity is too large")
}

fn parse_suffix(suffix: &str) -> Option<Scale> {
    let binary = |power: u32| Some(Scale::Multiply(1u128 << (10 * power)));
    let decimal = |power: u32| Some(Scale::Multiply(10u128.pow(3 * power)));

    match suffix {
        "" => Some(Scale::Multiply(1)),
        "n" => Some(Scale::Divide(1_000_000_000)),
        "u" => Some(Scale::Divide(1_000_000)),
        "m" => Some(Scale::Divide(1_000)),
        "k" => decimal(1),
        "M" => decimal(2),
        "G" => decimal(3),
        "T" => decimal(4),
        "P" => decimal(5),
        "E" => decimal(6),
        "Ki" => binary(1),
        "Mi" => binary(2),
        "Gi" => binary(3),
        "Ti" => binary(4),
        "Pi" => binary(5),
        "Ei" => binary(6),
        _ => parse_exponent(suffix),
    }
}

/// Decimal exponent notation (`e3`, `E-2`)
fn parse_exponent(suffix: &str) -> Option<Scale> {
    let rest = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?;
    let exponent: i32 = rest.parse().ok()?;
    if exponent.unsigned_abs() > 18 {
        return None;
    }
    let factor = 10u128.pow(exponent.unsigned_abs());
    if exponent >= 0 {
        Some(Scale::Multiply(factor))
    } else {
        Some(Scale::Divide(factor))
    }
}

/// Semantic equality of two optional quantities; unparseable values are
/// compared verbatim.
pub fn quantities_equal(a: Option<&Quantity>, b: Option<&Quantity>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => match (Capacity::from_quantity(a), Capacity::from_quantity(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => a.0.trim() == b.0.trim(),
        },
        _ => false,
    }
}
