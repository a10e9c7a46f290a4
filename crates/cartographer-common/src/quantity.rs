//! Kubernetes resource quantity utilities
//!
//! Quantities are compared by value rather than by spelling: the API server
//! normalises `1000m` to `1` and `1024Mi` to `1Gi` on write, so a textual
//! comparison would report drift on every reconcile.

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// A map of resource names (`cpu`, `memory`, `storage`, ...) to quantities.
pub type ResourceList = BTreeMap<String, Quantity>;

const NANOS: i128 = 1_000_000_000;

enum Scale {
    /// Power of two applied to the mantissa
    Binary(u32),
    /// Power of ten applied to the mantissa
    Decimal(i32),
}

fn scale_for(suffix: &str) -> Option<Scale> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "Ki" => Scale::Binary(10),
        "Mi" => Scale::Binary(20),
        "Gi" => Scale::Binary(30),
        "Ti" => Scale::Binary(40),
        "Pi" => Scale::Binary(50),
        "Ei" => Scale::Binary(60),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?
                .parse::<i32>()
                .ok()
                .filter(|e| e.abs() <= 30)?;
            Scale::Decimal(exponent)
        }
    };

    Some(scale)
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

/// Parse a quantity string into nano-units.
///
/// Supports formats: "500m", "1", "2.5", "1Gi", "512Mi", "10G", "1e3", "250n".
/// Returns `None` for anything that is not a valid quantity.
///
/// # Examples
/// ```
/// use cartographer_common::quantity::parse_quantity;
/// assert_eq!(parse_quantity("1"), parse_quantity("1000m"));
/// assert_eq!(parse_quantity("1Gi"), parse_quantity("1024Mi"));
/// assert_eq!(parse_quantity("lots"), None);
/// ```
pub fn parse_quantity(value: &str) -> Option<i128> {
    let value = value.trim();

    let (negative, rest) = match value.as_bytes().first()? {
        b'-' => (true, &value[1..]),
        b'+' => (false, &value[1..]),
        _ => (false, value),
    };

    let number_end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let (number, suffix) = rest.split_at(number_end);

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if fraction.contains('.') || (whole.is_empty() && fraction.is_empty()) {
        return None;
    }

    let mantissa: i128 = format!("{whole}{fraction}").parse().ok()?;
    let fraction_digits = u32::try_from(fraction.len()).ok()?;

    let nanos = match scale_for(suffix)? {
        Scale::Binary(shift) => {
            let scaled = mantissa.checked_mul(1i128 << shift)?.checked_mul(NANOS)?;
            ceil_div(scaled, pow10(fraction_digits)?)?
        }
        Scale::Decimal(exp) => {
            let exp = exp + 9 - i32::try_from(fraction_digits).ok()?;
            if exp >= 0 {
                mantissa.checked_mul(pow10(exp.unsigned_abs())?)?
            } else {
                ceil_div(mantissa, pow10(exp.unsigned_abs())?)?
            }
        }
    };

    Some(if negative { -nanos } else { nanos })
}

/// Sub-nano remainders round up to the next nano.
fn ceil_div(value: i128, divisor: i128) -> Option<i128> {
    value.checked_add(divisor - 1).map(|v| v / divisor)
}

/// Compare two quantities by value.
///
/// Falls back to an exact (trimmed) string comparison when either side
/// does not parse.
pub fn quantities_equal(left: &Quantity, right: &Quantity) -> bool {
    match (parse_quantity(&left.0), parse_quantity(&right.0)) {
        (Some(l), Some(r)) => l == r,
        _ => left.0.trim() == right.0.trim(),
    }
}

/// Whether a quantity is absent, empty, or zero-valued.
pub fn is_zero(quantity: Option<&Quantity>) -> bool {
    match quantity {
        None => true,
        Some(q) if q.0.trim().is_empty() => true,
        Some(q) => parse_quantity(&q.0) == Some(0),
    }
}

/// Compare two resource lists by value.
///
/// Lists are equal only when they carry the same resource names and every
/// name maps to equal quantities. An absent list equals an empty one.
pub fn resource_lists_equal(left: Option<&ResourceList>, right: Option<&ResourceList>) -> bool {
    let empty = ResourceList::new();
    let left = left.unwrap_or(&empty);
    let right = right.unwrap_or(&empty);

    left.len() == right.len()
        && left.iter().all(|(name, quantity)| {
            right
                .get(name)
                .is_some_and(|other| quantities_equal(quantity, other))
        })
}

/// Compare the requests and limits of two resource requirement blocks.
pub fn requirements_equal(
    left: Option<&ResourceRequirements>,
    right: Option<&ResourceRequirements>,
) -> bool {
    let default = ResourceRequirements::default();
    let left = left.unwrap_or(&default);
    let right = right.unwrap_or(&default);

    resource_lists_equal(left.requests.as_ref(), right.requests.as_ref())
        && resource_lists_equal(left.limits.as_ref(), right.limits.as_ref())
}

/// Build a resource list with `cpu` and `memory` entries.
pub fn cpu_memory(cpu: &str, memory: &str) -> ResourceList {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}
