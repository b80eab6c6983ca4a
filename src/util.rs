//! Small shared helpers: duration parsing, byte formatting, cancellable sleeps.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
#[error("invalid ISO-8601 duration: {0}")]
pub struct DurationParseError(pub String);

/// Parse an ISO-8601 duration of the `PnDTnHnMnS` family.
///
/// Only the D/H/M/S components are supported; that covers everything the
/// upstream metadata API produces for video durations.
pub fn parse_iso8601_duration(input: &str) -> Result<Duration, DurationParseError> {
    let err = || DurationParseError(input.to_string());

    let rest = input.strip_prefix('P').ok_or_else(err)?;
    if rest.is_empty() {
        return Err(err());
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut secs: u64 = 0;
    let mut num = String::new();

    for ch in date_part.chars() {
        if ch.is_ascii_digit() {
            num.push(ch);
        } else {
            let value: u64 = num.parse().map_err(|_| err())?;
            num.clear();
            match ch {
                'D' => secs += value * 86_400,
                _ => return Err(err()),
            }
        }
    }
    if !num.is_empty() {
        return Err(err());
    }

    for ch in time_part.chars() {
        if ch.is_ascii_digit() {
            num.push(ch);
        } else {
            let value: u64 = num.parse().map_err(|_| err())?;
            num.clear();
            match ch {
                'H' => secs += value * 3_600,
                'M' => secs += value * 60,
                'S' => secs += value,
                _ => return Err(err()),
            }
        }
    }
    if !num.is_empty() {
        return Err(err());
    }

    Ok(Duration::from_secs(secs))
}

/// Format a byte count with binary prefixes, e.g. `1.4 GiB`.
pub fn ibytes(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if n < 1024 {
        return format!("{} B", n);
    }

    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Sleep for `dur` unless the token fires first. Returns `true` if the full
/// duration elapsed, `false` if the sleep was cut short by cancellation.
pub async fn sleep_cancellable(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(dur) => true,
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Truncate a string to at most `n` characters, appending `...` if cut.
pub fn truncate_chars(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        return s.to_string();
    }
    let cut: String = s.chars().take(n.saturating_sub(3)).collect();
    format!("{}...", cut)
}
