//! Mapping between document names and file names.
//!
//! Names are escaped so any string maps to one portable file name:
//! characters outside a conservative whitelist become `%<hex>;`.
//!
//! ```text
//! "notes 1.pdf"  ──► doc-notes 1.pdf.json
//! "a/b"          ──► doc-a%2f;b.json
//! ```

use std::path::Path;

const PREFIX: &str = "doc-";

/// Extension of current-format document files.
pub const CURRENT_EXT: &str = "json";

/// Extension of legacy-format document files.
pub const LEGACY_EXT: &str = "save";

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || " _()+,.-=^~".contains(c)
}

/// Escape a document name for use in a file name.
pub fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if is_safe(c) {
            out.push(c);
        } else {
            out.push_str(&format!("%{:x};", c as u32));
        }
    }
    out
}

/// Reverse [`escape`]. Returns `None` for text `escape` never produces,
/// including escapes of safe characters and non-lowercase hex, so each
/// name has exactly one file.
pub fn unescape(escaped: &str) -> Option<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        let end = tail.find(';')?;
        let code = u32::from_str_radix(&tail[..end], 16).ok()?;
        out.push(char::from_u32(code)?);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    (escape(&out) == escaped).then_some(out)
}

/// File name of a document in the current format.
pub fn file_name(name: &str) -> String {
    format!("{PREFIX}{}.{CURRENT_EXT}", escape(name))
}

/// File name of a document in the legacy format.
pub fn legacy_file_name(name: &str) -> String {
    format!("{PREFIX}{}.{LEGACY_EXT}", escape(name))
}

/// Recover the document name from a path with the given extension.
pub fn document_name(path: &Path, ext: &str) -> Option<String> {
    if path.extension()?.to_str()? != ext {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    unescape(stem.strip_prefix(PREFIX)?)
}
