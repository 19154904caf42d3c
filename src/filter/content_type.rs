//! Content types derived from entry names. Bytes are never sniffed.

use super::glob::basename;

const FALLBACK: &str = "application/octet-stream";

const BY_EXTENSION: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("log", "text/plain"),
    ("md", "text/markdown"),
    ("csv", "text/csv"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("mjs", "text/javascript"),
    ("xml", "application/xml"),
    ("json", "application/json"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("toml", "application/toml"),
    ("pdf", "application/pdf"),
    ("wasm", "application/wasm"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
];

/// Lower-cased extension of the final path component, without the dot
pub fn extension_of(name: &str) -> Option<String> {
    let base = basename(name);
    let (stem, ext) = base.rsplit_once('.')?;
    // `.bashrc` is a hidden file, not an extension
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Content type implied by the entry name
pub fn content_type_for(name: &str) -> &'static str {
    extension_of(name)
        .and_then(|ext| {
            BY_EXTENSION
                .iter()
                .find(|(known, _)| *known == ext)
                .map(|(_, ty)| *ty)
        })
        .unwrap_or(FALLBACK)
}

/// Whether `content_type` is admitted by `allowed`, which may end in `/*`
pub fn content_type_allowed(allowed: &str, content_type: &str) -> bool {
    if allowed == "*/*" {
        return true;
    }
    match allowed.strip_suffix("/*") {
        Some(major) => content_type
            .split_once('/')
            .is_some_and(|(m, _)| m.eq_ignore_ascii_case(major)),
        None => allowed.eq_ignore_ascii_case(content_type),
    }
}
