//! Compact duration strings used for worktree expiry (`30s`, `15m`, `12h`, `7d`, `2w`).

use std::time::Duration;

use crate::error::ConfigError;

/// Parse `<n><unit>` where unit is one of `s`, `m`, `h`, `d`, `w`.
pub fn parse_ttl(spec: &str) -> Result<Duration, ConfigError> {
    let trimmed = spec.trim();
    let invalid = || ConfigError::InvalidDuration(spec.to_string());
    let unit = trimmed.chars().last().ok_or_else(invalid)?;
    let digits = &trimmed[..trimmed.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let seconds_per_unit = match unit.to_ascii_lowercase() {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        'w' => 7 * 24 * 60 * 60,
        _ => return Err(invalid()),
    };
    amount
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Render a duration in the form git accepts for `worktree prune --expire`.
pub fn git_expire_arg(ttl: Duration) -> String {
    format!("{}.seconds.ago", ttl.as_secs())
}
