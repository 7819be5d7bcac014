//! Chain-of-Verification — a post-response hallucination guard.
//!
//! Cheap structural gate first (regex over the response text); only when
//! the gate trips do we spend a second LLM call cross-checking the
//! response's claims against what tools actually returned.

use regex::Regex;

use oxibot_core::types::{Message, ToolResultRecord};
use oxibot_providers::traits::{LlmProvider, LlmRequestConfig};

/// Action-verb patterns that imply a tool effect took place.
const ACTION_VERB_PATTERNS: &[&str] = &[
    r"(?i)\bi(?:'ve| have)? (?:wrote|written)\b",
    r"(?i)\bi(?:'ve| have)? updated\b",
    r"(?i)\bi(?:'ve| have)? edited\b",
    r"(?i)\bi(?:'ve| have)? installed\b",
    r"(?i)\bi(?:'ve| have)? scheduled\b",
];

/// Kinds of tool result a given action claim needs backing by.
enum ClaimKind {
    Write,
    Exec,
    Schedule,
}

fn classify(pattern_index: usize) -> ClaimKind {
    match pattern_index {
        0 | 1 | 2 => ClaimKind::Write,
        3 => ClaimKind::Exec,
        _ => ClaimKind::Schedule,
    }
}

/// Minimum response length (with no web-search-class tool invoked) that
/// triggers full verification even without an action-verb match.
const LONG_UNVERIFIED_THRESHOLD: usize = 50;

/// Returns true if `text` or the absence of corroborating tools warrants
/// a full verification pass.
fn needs_full_verification(text: &str, tool_results: &[ToolResultRecord]) -> bool {
    let action_regexes: Vec<Regex> = ACTION_VERB_PATTERNS
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

    for (i, re) in action_regexes.iter().enumerate() {
        if re.is_match(text) {
            let backed = match classify(i) {
                ClaimKind::Write => tool_results
                    .iter()
                    .any(|r| matches!(r.tool_name.as_str(), "write_file" | "edit_file")),
                ClaimKind::Exec => tool_results.iter().any(|r| r.tool_name == "exec"),
                ClaimKind::Schedule => tool_results
                    .iter()
                    .any(|r| r.tool_name.contains("cron") || r.tool_name.contains("schedule")),
            };
            if !backed {
                return true;
            }
        }
    }

    let has_search = tool_results
        .iter()
        .any(|r| r.tool_name == "web_search" || r.tool_name == "web_fetch");
    text.len() >= LONG_UNVERIFIED_THRESHOLD && !has_search
}

/// Run Chain-of-Verification on a finished turn's response text.
///
/// Returns `Some(corrected_text)` if verification produced a replacement,
/// `None` if the response passed unchanged or verification itself failed
/// (failure is swallowed — the caller keeps the original text either way).
pub async fn verify(
    provider: &dyn LlmProvider,
    model: &str,
    request_config: &LlmRequestConfig,
    response_text: &str,
    tool_results: &[ToolResultRecord],
) -> Option<String> {
    if !needs_full_verification(response_text, tool_results) {
        return None;
    }

    let evidence = if tool_results.is_empty() {
        "No tool calls were made during this turn.".to_string()
    } else {
        tool_results
            .iter()
            .map(|r| format!("- {} -> {}", r.tool_name, truncate(&r.content, 300)))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let check_prompt = format!(
        "You are a fact-checking pass over an assistant's draft reply. \
         Tool evidence observed this turn:\n{evidence}\n\n\
         Draft reply:\n{response_text}\n\n\
         Does the draft assert any action or real-world fact not backed by \
         the tool evidence above? If everything is backed or the reply \
         makes no such claims, reply with exactly `OK`. Otherwise reply with \
         a corrected version of the draft that removes or hedges the \
         unverified claims."
    );

    let messages = vec![Message::user(check_prompt)];
    let response = provider.chat(&messages, None, model, request_config).await;

    let content = response.content?;
    let trimmed = content.trim();
    if trimmed.eq_ignore_ascii_case("ok") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}
