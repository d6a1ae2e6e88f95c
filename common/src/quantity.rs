//! Storage quantities ("10Gi", "500M", "1.5Ti") compared by their byte value.
use crate::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

fn multiplier(suffix: &str) -> Option<u128> {
    Some(match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => {
            let exp = suffix.strip_prefix(['e', 'E'])?.parse::<u32>().ok()?;
            10u128.checked_pow(exp)?
        }
    })
}

/// Number of bytes a storage quantity stands for, rounded up.
pub fn parse_bytes(value: &str) -> Result<u128> {
    let invalid = || Error::InvalidQuantity(value.to_string());
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }
    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    let int = if int_part.is_empty() { 0 } else { int_part.parse::<u128>().map_err(|_| invalid())? };

    // milli-bytes only make sense for rounding, they are rounded up to a whole byte
    let (mult, divisor) = if suffix == "m" { (1, 1000) } else { (multiplier(suffix).ok_or_else(invalid)?, 1) };

    let mut total = int.checked_mul(mult).ok_or_else(invalid)?;
    if !frac_part.is_empty() {
        let frac = frac_part.parse::<u128>().map_err(|_| invalid())?;
        let scale = 10u128
            .checked_pow(u32::try_from(frac_part.len()).map_err(|_| invalid())?)
            .ok_or_else(invalid)?;
        let frac_bytes = frac.checked_mul(mult).ok_or_else(invalid)?.div_ceil(scale);
        total = total.checked_add(frac_bytes).ok_or_else(invalid)?;
    }
    Ok(total.div_ceil(divisor))
}

pub fn quantity_bytes(q: &Quantity) -> Result<u128> {
    parse_bytes(&q.0)
}
