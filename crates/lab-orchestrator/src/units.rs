//! CPU and memory quantity normalization.
//!
//! Quantities are parsed as exact decimals and converted to integer millicores and
//! mebibytes. Fractions round up so a value can never slip under a ceiling through
//! truncation.
//!
//! User input and cluster quantities follow different rules: a bare memory number
//! typed by a user is MiB, one read back from the API server is bytes.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const MIB: u128 = 1024 * 1024;

/// Binary and decimal memory suffixes with their byte multipliers. Longest first so
/// `Mi` wins over `M`.
const MEMORY_SUFFIXES: &[(&str, u128)] = &[
    ("Ki", 1024),
    ("Mi", MIB),
    ("Gi", 1024 * MIB),
    ("Ti", 1024 * 1024 * MIB),
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
];

/// An exact non-negative decimal: `digits / 10^scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Decimal {
    digits: u128,
    scale: u32,
}

impl Decimal {
    fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || raw.len() > 30 {
            return None;
        }
        let (whole, fraction) = match raw.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (raw, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
            return None;
        }
        let joined = format!("{whole}{fraction}");
        let digits = joined.parse::<u128>().ok()?;
        Some(Self {
            digits,
            scale: u32::try_from(fraction.len()).ok()?,
        })
    }

    /// `ceil(self * multiplier / divisor)`.
    fn scaled_ceil(self, multiplier: u128, divisor: u128) -> Option<u128> {
        let denominator = 10u128.checked_pow(self.scale)?.checked_mul(divisor)?;
        let numerator = self.digits.checked_mul(multiplier)?;
        Some(numerator.div_ceil(denominator))
    }
}

fn invalid(kind: &str, raw: &str) -> Error {
    Error::Validation(format!("invalid {kind} quantity '{raw}'"))
}

/// Parse a CPU quantity (`500m`, `1`, `0.25`) into millicores.
pub fn cpu_to_millicores(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    let (number, multiplier) = match trimmed.strip_suffix('m') {
        Some(number) => (number, 1),
        None => (trimmed, 1000),
    };
    Decimal::parse(number)
        .and_then(|d| d.scaled_ceil(multiplier, 1))
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| invalid("cpu", raw))
}

/// Parse a memory quantity (`256Mi`, `1Gi`, `512`) into mebibytes. A bare number is
/// already MiB.
pub fn memory_to_mebibytes(raw: &str) -> Result<u64> {
    memory_to_bytes(raw)
        .map(|bytes| bytes.div_ceil(MIB))
        .and_then(|mib| u64::try_from(mib).map_err(|_| invalid("memory", raw)))
}

fn memory_to_bytes(raw: &str) -> Result<u128> {
    let trimmed = raw.trim();
    let (number, multiplier) = MEMORY_SUFFIXES
        .iter()
        .find_map(|(suffix, multiplier)| {
            trimmed
                .strip_suffix(suffix)
                .map(|number| (number, *multiplier))
        })
        .unwrap_or((trimmed, MIB));
    Decimal::parse(number)
        .and_then(|d| d.scaled_ceil(multiplier, 1))
        .ok_or_else(|| invalid("memory", raw))
}

/// Parse a plain count (`10`, `5`) as found in quota `pods` entries.
pub fn count(raw: &str) -> Result<u64> {
    Decimal::parse(raw.trim())
        .and_then(|d| d.scaled_ceil(1, 1))
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| invalid("count", raw))
}

/// The CPU operand with the larger value; `a` on ties.
pub fn max_cpu<'a>(a: &'a str, b: &'a str) -> Result<&'a str> {
    Ok(if cpu_to_millicores(b)? > cpu_to_millicores(a)? {
        b
    } else {
        a
    })
}

/// The memory operand with the larger value; `a` on ties. Compares exact bytes.
pub fn max_memory<'a>(a: &'a str, b: &'a str) -> Result<&'a str> {
    Ok(if memory_to_bytes(b)? > memory_to_bytes(a)? {
        b
    } else {
        a
    })
}

/// Canonical millicore form written into manifests.
pub fn normalize_cpu(raw: &str) -> Result<String> {
    Ok(format!("{}m", cpu_to_millicores(raw)?))
}

/// Canonical MiB form written into manifests. The cluster reads a bare number as
/// bytes, so user input never reaches a manifest unsuffixed.
pub fn normalize_memory(raw: &str) -> Result<String> {
    Ok(format!("{}Mi", memory_to_mebibytes(raw)?))
}

/// Decimal and binary suffixes of cluster quantities, as `(multiplier, divisor)`
/// of the base unit.
const QUANTITY_SUFFIXES: &[(&str, u128, u128)] = &[
    ("Ki", 1 << 10, 1),
    ("Mi", 1 << 20, 1),
    ("Gi", 1 << 30, 1),
    ("Ti", 1 << 40, 1),
    ("Pi", 1 << 50, 1),
    ("Ei", 1 << 60, 1),
    ("n", 1, 1_000_000_000),
    ("u", 1, 1_000_000),
    ("m", 1, 1_000),
    ("k", 1_000, 1),
    ("M", 1_000_000, 1),
    ("G", 1_000_000_000, 1),
    ("T", 1_000_000_000_000, 1),
    ("P", 1_000_000_000_000_000, 1),
    ("E", 1_000_000_000_000_000_000, 1),
];

const MAX_QUANTITY_EXPONENT: u32 = 30;

/// A quantity as stored by the API server: the exact ratio
/// `numerator / denominator` of base units (cores, bytes, objects). Unlike user
/// input, a bare number is in base units and `e`/`E` exponents are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClusterQuantity {
    numerator: u128,
    denominator: u128,
}

impl ClusterQuantity {
    fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, rest) = trimmed.split_at(split);
        let decimal = Decimal::parse(number)?;

        let mut numerator = decimal.digits;
        let mut denominator = 10u128.checked_pow(decimal.scale)?;

        let (exponent, suffix) = split_exponent(rest)?;
        let power = 10u128.checked_pow(exponent.unsigned_abs())?;
        if exponent >= 0 {
            numerator = numerator.checked_mul(power)?;
        } else {
            denominator = denominator.checked_mul(power)?;
        }

        if !suffix.is_empty() {
            let (_, multiplier, divisor) = QUANTITY_SUFFIXES.iter().find(|(s, _, _)| *s == suffix)?;
            numerator = numerator.checked_mul(*multiplier)?;
            denominator = denominator.checked_mul(*divisor)?;
        }
        Some(Self {
            numerator,
            denominator,
        })
    }

    /// `ceil(self * multiplier / divisor)` as `u64`.
    fn ceil_in(self, multiplier: u128, divisor: u128) -> Option<u64> {
        let numerator = self.numerator.checked_mul(multiplier)?;
        let denominator = self.denominator.checked_mul(divisor)?;
        u64::try_from(numerator.div_ceil(denominator)).ok()
    }
}

/// Split `e3`, `E-2`, `e3m` into exponent and trailing suffix. A lone `E` is the
/// exa suffix, not an exponent.
fn split_exponent(rest: &str) -> Option<(i32, &str)> {
    let Some(tail) = rest.strip_prefix(['e', 'E']) else {
        return Some((0, rest));
    };
    let (negative, digits) = match tail.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, tail.strip_prefix('+').unwrap_or(tail)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return Some((0, rest));
    }
    let magnitude: u32 = digits[..end].parse().ok()?;
    if magnitude > MAX_QUANTITY_EXPONENT {
        return None;
    }
    let exponent = i32::try_from(magnitude).ok()?;
    Some((if negative { -exponent } else { exponent }, &digits[end..]))
}

#[must_use]
pub fn quantity_millicores(quantity: &Quantity) -> Option<u64> {
    ClusterQuantity::parse(&quantity.0).and_then(|q| q.ceil_in(1000, 1))
}

#[must_use]
pub fn quantity_mebibytes(quantity: &Quantity) -> Option<u64> {
    ClusterQuantity::parse(&quantity.0).and_then(|q| q.ceil_in(1, MIB))
}

#[must_use]
pub fn quantity_count(quantity: &Quantity) -> Option<u64> {
    ClusterQuantity::parse(&quantity.0).and_then(|q| q.ceil_in(1, 1))
}
