use std::time::Duration;

use crate::{Error, Result};

/// Parses a user-facing duration string into milliseconds.
///
/// Accepted forms are a decimal integer followed by exactly one of the
/// units `ms`, `s`, `m` or `h`. A bare number is rejected so that config
/// authors never have to guess the implied unit.
pub fn parse_duration_ms(raw: &str) -> Result<u64> {
    let (digits, scale) = if let Some(stripped) = raw.strip_suffix("ms") {
        (stripped, 1)
    } else if let Some(stripped) = raw.strip_suffix('s') {
        (stripped, 1_000)
    } else if let Some(stripped) = raw.strip_suffix('m') {
        (stripped, 60_000)
    } else if let Some(stripped) = raw.strip_suffix('h') {
        (stripped, 3_600_000)
    } else {
        return Err(invalid(raw));
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(raw));
    }

    let amount: u64 = digits.parse().map_err(|_| invalid(raw))?;
    Ok(amount.saturating_mul(scale))
}

/// Same grammar as [`parse_duration_ms`], returned as a [`Duration`].
pub fn parse_duration(raw: &str) -> Result<Duration> {
    parse_duration_ms(raw).map(Duration::from_millis)
}

fn invalid(raw: &str) -> Error {
    Error::InvalidConfig(format!(
        "invalid duration '{raw}' (expected <number>ms|s|m|h)"
    ))
}
