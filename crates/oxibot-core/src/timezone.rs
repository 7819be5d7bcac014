//! IANA timezone extraction and validation for the Context Builder and
//! the Heartbeat Service's daily-cap reset.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Strings that mean "the user hasn't filled this in yet" — never a real
/// timezone even if they happen to parse.
const PLACEHOLDER_SENTINELS: &[&str] = &[
    "(your timezone here)",
    "your timezone here",
    "tbd",
    "unknown",
    "",
];

/// Scan free-form workspace-profile text for a `Timezone: <iana-id>` (or
/// `timezone: <iana-id>`) line and return the id if it is a real,
/// non-placeholder IANA timezone.
pub fn extract_user_timezone(profile_content: &str) -> Option<String> {
    for line in profile_content.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();
        if let Some(rest) = lower.strip_prefix("timezone:") {
            let candidate = trimmed[trimmed.len() - rest.trim_start().len()..].trim();
            return validate_iana(candidate);
        }
    }
    None
}

/// Validate a candidate IANA timezone id; placeholders and unknown ids
/// map to `None`, valid ids are returned unchanged (round-trip).
pub fn validate_iana(candidate: &str) -> Option<String> {
    let lowered = candidate.trim().to_lowercase();
    if PLACEHOLDER_SENTINELS.contains(&lowered.as_str()) {
        return None;
    }
    Tz::from_str(candidate.trim()).ok().map(|_| candidate.trim().to_string())
}

/// Render `instant` in the given IANA timezone, or fall back to UTC.
pub fn format_local(instant: DateTime<Utc>, iana_tz: Option<&str>) -> String {
    match iana_tz.and_then(|tz| Tz::from_str(tz).ok()) {
        Some(tz) => instant
            .with_timezone(&tz)
            .format("%Y-%m-%d %H:%M:%S %Z")
            .to_string(),
        None => instant.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    }
}

/// Calendar date string (`YYYY-MM-DD`) of `instant` in the given IANA
/// timezone — used by the Heartbeat Service's daily send cap.
pub fn local_date(instant: DateTime<Utc>, iana_tz: Option<&str>) -> String {
    match iana_tz.and_then(|tz| Tz::from_str(tz).ok()) {
        Some(tz) => instant.with_timezone(&tz).format("%Y-%m-%d").to_string(),
        None => instant.format("%Y-%m-%d").to_string(),
    }
}
