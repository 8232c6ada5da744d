// Document names: extraction from websocket request paths and validation of
// names accepted by the file-copy endpoint.

use std::sync::OnceLock;

use regex::Regex;

/// Maximum accepted document name length in bytes.
pub const MAX_NAME_BYTES: usize = 512;

fn file_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_\-\.]+$").expect("file name pattern is valid"))
}

/// Derive a document name from a request path.
///
/// The name is everything after the leading `/`, up to an optional query
/// string. No percent-decoding is applied, so the name matches what the
/// client put in its websocket URL byte for byte.
pub fn doc_name_from_path(path: &str) -> Option<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let name = trimmed.split('?').next().unwrap_or_default();
    if name.is_empty() || name.len() > MAX_NAME_BYTES {
        return None;
    }
    Some(name)
}

/// Whether `name` is a plain file name (`[a-zA-Z0-9_-.]+`).
pub fn is_valid_file_name(name: &str) -> bool {
    name.len() <= MAX_NAME_BYTES && file_name_pattern().is_match(name)
}

/// The extension used to pick default content: the second `.`-separated
/// component, so `abc.cpp` yields `cpp` and `abc.cpp.bak` also yields `cpp`.
pub fn default_content_extension(name: &str) -> Option<&str> {
    if !name.contains('.') {
        return None;
    }
    name.split('.').nth(1).filter(|ext| !ext.is_empty())
}
