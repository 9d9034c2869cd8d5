// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Parsing of Kubernetes resource quantities and Linux cpuset lines.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::migration_errors::MigrationError;

/// Highest CPU id accepted in a cpuset line.
const MAX_CPU_ID: u32 = 50_000;

/// Binary suffixes, longest first so `Ki` wins over `k`.
const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 8] = [
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
];

fn invalid(value: &str, reason: &str) -> MigrationError {
    MigrationError::InvalidQuantity {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a quantity string (`"1Gi"`, `"500m"`, `"2"`, `"1e3"`) into base units.
///
/// # Errors
///
/// Returns [`MigrationError::InvalidQuantity`] when the string is empty, negative,
/// or not a number followed by a known suffix.
pub fn parse_quantity(value: &str) -> Result<f64, MigrationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(value, "empty quantity"));
    }

    let (number, multiplier) = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|(suffix, multiplier)| {
            trimmed
                .strip_suffix(suffix)
                .map(|number| (number, *multiplier))
        })
        .or_else(|| trimmed.strip_suffix('E').map(|number| (number, 1e18)))
        .unwrap_or((trimmed, 1.0));

    let parsed: f64 = number
        .parse()
        .map_err(|_| invalid(value, "not a number"))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(invalid(value, "must be a finite, non-negative number"));
    }

    Ok(parsed * multiplier)
}

/// Whether a quantity is zero.
///
/// # Errors
///
/// Returns an error if the quantity cannot be parsed.
pub fn quantity_is_zero(quantity: &Quantity) -> Result<bool, MigrationError> {
    Ok(parse_quantity(&quantity.0)? == 0.0)
}

/// A memory quantity in bytes, rounded up.
///
/// # Errors
///
/// Returns an error if the quantity cannot be parsed.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn quantity_to_bytes(quantity: &Quantity) -> Result<u64, MigrationError> {
    let value = parse_quantity(&quantity.0)?;
    if value > u64::MAX as f64 {
        return Err(invalid(&quantity.0, "does not fit into 64 bits"));
    }
    Ok(value.ceil() as u64)
}

/// Parse a cpuset line such as `"0-3,7,9-10"` into a sorted list of CPU ids.
///
/// # Errors
///
/// Returns [`MigrationError::InvalidCpuSet`] for malformed ranges, reversed
/// ranges, or ids above the supported maximum.
pub fn parse_cpu_set(line: &str) -> Result<Vec<u32>, MigrationError> {
    let bad = |reason: &str| MigrationError::InvalidCpuSet {
        value: line.to_string(),
        reason: reason.to_string(),
    };

    let mut cpus = Vec::new();
    for part in line.trim().split(',').filter(|part| !part.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((start, end)) => (start, end),
            None => (part, part),
        };
        let start: u32 = start.trim().parse().map_err(|_| bad("not a number"))?;
        let end: u32 = end.trim().parse().map_err(|_| bad("not a number"))?;
        if start > end {
            return Err(bad("range start is greater than its end"));
        }
        if end > MAX_CPU_ID {
            return Err(bad("cpu id out of range"));
        }
        cpus.extend(start..=end);
    }

    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}
