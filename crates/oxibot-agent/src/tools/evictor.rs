//! Result Evictor — spills oversized tool results to disk so they never
//! blow out the context window, while still letting the model retrieve
//! the full content on demand.
//!
//! A result over `MAX_INLINE_CHARS` is written to
//! `<workspace>/scratch/.tool-results/<uuid>.txt` and the model sees a
//! head/tail preview plus the file path it can `read_file` for the rest.

use std::path::{Path, PathBuf};

/// Results at or under this length are returned inline, untouched.
pub const MAX_INLINE_CHARS: usize = 4000;

/// How many leading/trailing characters to keep in the preview.
const PREVIEW_HEAD_CHARS: usize = 1500;
const PREVIEW_TAIL_CHARS: usize = 500;

/// Spills oversized tool output to `<workspace>/scratch/.tool-results/`.
pub struct ResultEvictor {
    scratch_dir: PathBuf,
}

impl ResultEvictor {
    /// Create an evictor rooted at `workspace`, clearing any results left
    /// over from a previous run.
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        let scratch_dir = workspace.as_ref().join("scratch").join(".tool-results");
        let _ = std::fs::create_dir_all(&scratch_dir);
        if let Ok(entries) = std::fs::read_dir(&scratch_dir) {
            for entry in entries.flatten() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Self { scratch_dir }
    }

    /// Pass `content` through, spilling to disk and returning a preview
    /// string if it exceeds `MAX_INLINE_CHARS`.
    pub fn evict(&self, content: &str) -> String {
        if content.chars().count() <= MAX_INLINE_CHARS {
            return content.to_string();
        }

        let id = uuid::Uuid::new_v4();
        let rel_path = format!("scratch/.tool-results/{id}.txt");
        let path = self.scratch_dir.join(format!("{id}.txt"));
        if std::fs::write(&path, content).is_err() {
            // Disk write failed — fall back to a plain truncation so the
            // model still gets something usable.
            return truncate_preview(content);
        }

        let chars: Vec<char> = content.chars().collect();
        let head: String = chars.iter().take(PREVIEW_HEAD_CHARS).collect();
        let tail: String = chars
            .iter()
            .skip(chars.len().saturating_sub(PREVIEW_TAIL_CHARS))
            .collect();

        format!(
            "[Result truncated: {total} characters, {omitted} omitted]\n\n\
             === HEAD ===\n{head}\n\n\
             === TAIL ===\n{tail}\n\n\
             [Full content: {rel_path} — use read_file to access]",
            total = chars.len(),
            omitted = chars.len() - PREVIEW_HEAD_CHARS - PREVIEW_TAIL_CHARS,
        )
    }

    /// Recognize a spilled-result pointer (as produced by [`evict`]) inside
    /// a tool result string, returning just the pointer line so history
    /// persists the pointer instead of the full head/tail preview.
    ///
    /// [`evict`]: ResultEvictor::evict
    pub fn collapse_to_pointer(content: &str) -> &str {
        match content.find("\n\n[Full content: ") {
            Some(idx) => &content[idx + 2..],
            None => content,
        }
    }
}

fn truncate_preview(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    let head: String = chars.iter().take(PREVIEW_HEAD_CHARS).collect();
    format!("{head}\n\n... [truncated, {} characters total] ...", chars.len())
}
