//! # Duration Parsing
//!
//! Handles parsing and validating Kubernetes duration strings used for
//! `refreshInterval`.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+[smhd])+$").expect("duration regex is valid"));

static COMPONENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<number>\d+)(?P<unit>[smhd])").expect("duration component regex is valid")
});

/// Parse Kubernetes duration string into `std::time::Duration`
/// Supports single units ("30s", "5m", "1h", "1d") and compounds ("1h30m", "2m30s")
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    let interval_lower = duration_trimmed.to_lowercase();

    if !DURATION_REGEX.is_match(&interval_lower) {
        return Err(anyhow::anyhow!(
            "Invalid duration format '{}'. Expected format: <number><unit>[<number><unit>...] (e.g., '15s', '1m', '1h30m')",
            duration_trimmed
        ));
    }

    let mut seconds: u64 = 0;
    for captures in COMPONENT_REGEX.captures_iter(&interval_lower) {
        let number: u64 = captures["number"].parse().map_err(|e| {
            anyhow::anyhow!(
                "Invalid duration number '{}' in '{}': {}",
                &captures["number"],
                duration_trimmed,
                e
            )
        })?;

        let multiplier = match &captures["unit"] {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            unit => {
                return Err(anyhow::anyhow!(
                    "Invalid unit '{}' in duration '{}'. Expected: s, m, h, or d",
                    unit,
                    duration_trimmed
                ));
            }
        };

        seconds = number
            .checked_mul(multiplier)
            .and_then(|component| seconds.checked_add(component))
            .ok_or_else(|| anyhow::anyhow!("Duration '{}' is too large", duration_trimmed))?;
    }

    if seconds == 0 {
        return Err(anyhow::anyhow!(
            "Duration must be greater than 0, got '{}'",
            duration_trimmed
        ));
    }

    Ok(Duration::from_secs(seconds))
}

/// Parse a duration and enforce a lower bound
///
/// # Arguments
/// * `interval` - The duration string to validate
/// * `field_name` - The name of the field being validated (for error messages)
/// * `min_seconds` - Minimum duration in seconds
pub fn parse_bounded_duration(interval: &str, field_name: &str, min_seconds: u64) -> Result<Duration> {
    let duration = parse_kubernetes_duration(interval)
        .map_err(|e| anyhow::anyhow!("Invalid {field_name}: {e}"))?;

    if duration.as_secs() < min_seconds {
        return Err(anyhow::anyhow!(
            "{field_name} '{}' must be at least {} seconds (got {} seconds)",
            interval.trim(),
            min_seconds,
            duration.as_secs()
        ));
    }

    Ok(duration)
}
