//! Correction-signal detection — a small pattern matcher that flags inbound
//! content likely to contain a fact the user is actively correcting, so the
//! Memory Extractor can bypass its idle debounce and distill right away.

use regex::Regex;
use std::sync::OnceLock;

/// Patterns that suggest the user is correcting something the agent
/// believes (a name, a preference, a prior assumption).
const CORRECTION_PATTERNS: &[&str] = &[
    r"(?i)\bactually,?\b",
    r"(?i)\bno,?\s+(?:my|i'?m|it'?s|that'?s)\b",
    r"(?i)\bthat'?s wrong\b",
    r"(?i)\bthat'?s not (?:right|correct|true)\b",
    r"(?i)\bi meant\b",
    r"(?i)\bto correct (?:you|that|myself)\b",
    r"(?i)\blet me correct\b",
];

fn compiled_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| CORRECTION_PATTERNS.iter().map(|p| Regex::new(p).unwrap()).collect())
        .as_slice()
}

/// Whether `text` contains a correction signal warranting urgent
/// extraction instead of waiting for the idle timer.
pub fn contains_correction_signal(text: &str) -> bool {
    compiled_patterns().iter().any(|re| re.is_match(text))
}
