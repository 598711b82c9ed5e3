use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

// ─── Project directory slugging ───────────────────────────────────────────

/// Derive a directory-safe slug from a project name.
///
/// Lowercase, diacritics stripped via NFD, every other non-alphanumeric run
/// collapsed to a single `-`, leading/trailing `-` trimmed. Empty input
/// falls back to `"project"`. Idempotent.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.nfd() {
        if is_combining_mark(c) {
            continue;
        }
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed.to_string()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
