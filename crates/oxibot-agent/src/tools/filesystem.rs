//! Filesystem tools: `read_file`, `write_file`, `edit_file`, `list_dir`.
//!
//! Every path goes through [`resolve_path`], which expands `~`, resolves
//! it to a canonical form, and — when the agent is confined to a
//! workspace — rejects anything that escapes it. This is also how the
//! model reaches the result evictor's spill files: they live under
//! `<workspace>/scratch/.tool-results/`, inside the same confinement.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::base::{require_string, Tool};

// ─────────────────────────────────────────────
// Shared path helper
// ─────────────────────────────────────────────

fn expand_home(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = home_dir() {
            return home.join(path.trim_start_matches("~/").trim_start_matches('~'));
        }
    }
    PathBuf::from(path)
}

/// Canonicalize `path` if it exists; otherwise canonicalize its parent
/// (if that exists) and re-attach the file name, so a not-yet-created
/// file still resolves against the real directory tree.
fn canonicalize_best_effort(path: PathBuf) -> PathBuf {
    if path.exists() {
        return path.canonicalize().unwrap_or(path);
    }
    let Some(parent) = path.parent().filter(|p| p.exists()) else {
        return path;
    };
    let Some(name) = path.file_name() else {
        return path;
    };
    parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf()).join(name)
}

fn enforce_allowed_dir(resolved: &Path, allowed_dir: &Path) -> anyhow::Result<()> {
    let allowed_canon = if allowed_dir.exists() {
        allowed_dir.canonicalize().unwrap_or_else(|_| allowed_dir.to_path_buf())
    } else {
        allowed_dir.to_path_buf()
    };
    if resolved.starts_with(&allowed_canon) {
        Ok(())
    } else {
        anyhow::bail!(
            "Access denied: path '{}' is outside allowed directory '{}'",
            resolved.display(),
            allowed_canon.display()
        )
    }
}

/// Resolve a user-supplied path, optionally restricting it to `allowed_dir`.
///
/// Returns `Err` if the resolved path is outside the allowed directory.
fn resolve_path(path: &str, allowed_dir: Option<&Path>) -> anyhow::Result<PathBuf> {
    let resolved = canonicalize_best_effort(expand_home(path));
    if let Some(allowed) = allowed_dir {
        enforce_allowed_dir(&resolved, allowed)?;
    }
    Ok(resolved)
}

/// Best-effort home directory (avoids pulling in the `dirs` crate).
fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()
        .map(PathBuf::from)
}

// ─────────────────────────────────────────────
// ReadFileTool
// ─────────────────────────────────────────────

/// Reads and returns the entire content of a file.
pub struct ReadFileTool {
    allowed_dir: Option<PathBuf>,
}

impl ReadFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path. Returns the full text content."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let path_str = require_string(&params, "path")?;
        let path = resolve_path(&path_str, self.allowed_dir.as_deref())?;

        if !path.exists() {
            anyhow::bail!("File not found: {}", path.display());
        }
        if !path.is_file() {
            anyhow::bail!("Not a file: {}", path.display());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        Ok(content)
    }
}

// ─────────────────────────────────────────────
// WriteFileTool
// ─────────────────────────────────────────────

/// Creates or overwrites a file with the given content.
pub struct WriteFileTool {
    allowed_dir: Option<PathBuf>,
}

impl WriteFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it if it doesn't exist or overwriting if it does. \
         Parent directories are created automatically."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path for the file"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let path_str = require_string(&params, "path")?;
        let content = require_string(&params, "content")?;
        let path = resolve_path(&path_str, self.allowed_dir.as_deref())?;

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| anyhow::anyhow!("Failed to create directory {}: {e}", parent.display()))?;
            }
        }

        let bytes = content.as_bytes().len();
        std::fs::write(&path, &content)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;
        Ok(format!("Successfully wrote {bytes} bytes to {}", path.display()))
    }
}

// ─────────────────────────────────────────────
// EditFileTool
// ─────────────────────────────────────────────

/// Replaces a text snippet within a file (single occurrence).
pub struct EditFileTool {
    allowed_dir: Option<PathBuf>,
}

impl EditFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing the first occurrence of `old_text` with `new_text`. \
         Include enough context in `old_text` to uniquely identify the replacement site."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to find (include surrounding context for uniqueness)"
                },
                "new_text": {
                    "type": "string",
                    "description": "Text to replace old_text with"
                }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let path_str = require_string(&params, "path")?;
        let old_text = require_string(&params, "old_text")?;
        let new_text = require_string(&params, "new_text")?;
        let path = resolve_path(&path_str, self.allowed_dir.as_deref())?;

        if !path.is_file() {
            anyhow::bail!("File not found: {}", path.display());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;

        let (updated, warning) = replace_first_occurrence(&content, &old_text, &new_text)
            .ok_or_else(|| anyhow::anyhow!("old_text not found in {}", path.display()))?;

        std::fs::write(&path, &updated)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;

        Ok(format!("{warning}Successfully edited {}", path.display()))
    }
}

/// Replace the first occurrence of `old_text` in `content`, returning the
/// updated text and a warning prefix if more than one occurrence existed.
/// `None` if `old_text` doesn't appear at all.
fn replace_first_occurrence(content: &str, old_text: &str, new_text: &str) -> Option<(String, String)> {
    let count = content.matches(old_text).count();
    if count == 0 {
        return None;
    }

    let warning = if count > 1 {
        format!("Warning: old_text appears {count} times; only the first occurrence was replaced. ")
    } else {
        String::new()
    };

    Some((content.replacen(old_text, new_text, 1), warning))
}

// ─────────────────────────────────────────────
// ListDirTool
// ─────────────────────────────────────────────

/// Lists the contents of a directory.
pub struct ListDirTool {
    allowed_dir: Option<PathBuf>,
}

impl ListDirTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the contents of a directory. Returns file and folder names with type indicators."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the directory to list"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let path_str = require_string(&params, "path")?;
        let path = resolve_path(&path_str, self.allowed_dir.as_deref())?;

        if !path.is_dir() {
            anyhow::bail!("Not a directory: {}", path.display());
        }

        let mut dir_entries: Vec<_> = std::fs::read_dir(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read directory {}: {e}", path.display()))?
            .filter_map(|e| e.ok())
            .collect();
        dir_entries.sort_by_key(|e| e.file_name());

        let entries: Vec<String> = dir_entries.iter().map(describe_entry).collect();

        if entries.is_empty() {
            Ok("(empty directory)".into())
        } else {
            Ok(entries.join("\n"))
        }
    }
}

/// Render one directory entry as `"📁 name"` or `"📄 name"`.
fn describe_entry(entry: &std::fs::DirEntry) -> String {
    let name = entry.file_name().to_string_lossy().to_string();
    let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
    let icon = if is_dir { "📁" } else { "📄" };
    format!("{icon} {name}")
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────


