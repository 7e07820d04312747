//! File extension inference for downloads.
//!
//! Remote links rarely state the file type cleanly, so the extension is
//! inferred through a fixed chain: the URL's suffix, then known-format tokens
//! in the link label, then the Content-Disposition filename, then the
//! Content-Type MIME mapping, then the requested extension, and finally
//! `bin`.

/// Longest plausible extension in a URL suffix.
const MAX_URL_EXTENSION_LEN: usize = 7;

/// Format tokens recognized in link labels, lowercase.
const KNOWN_EXTENSIONS: [&str; 29] = [
    "epub3", "epub2", "epub", "pdf", "mobi", "azw3", "azw1", "azw", "kf8", "kfx", "pdb", "prc",
    "tpz", "txt", "rtf", "html", "htm", "djvu", "fb2", "lit", "m4b", "mp3", "aac", "flac", "ogg",
    "wav", "cbr", "cbz", "cbt",
];

/// Extensions treated as "download whatever formats exist".
#[must_use]
pub fn is_wildcard(requested: &str) -> bool {
    matches!(requested.trim().to_lowercase().as_str(), "" | "all" | "*" | "any")
}

/// Extracts an extension from a URL's final path segment.
#[must_use]
pub fn from_url(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > MAX_URL_EXTENSION_LEN {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Finds a known format token in a link label such as `EPUB (512.0 kB)`.
#[must_use]
pub fn from_label(label: &str) -> Option<String> {
    let lower = label.to_lowercase();
    for token in KNOWN_EXTENSIONS {
        let found = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word == token);
        if found {
            return Some(token.to_string());
        }
    }
    None
}

/// Extracts the filename from a Content-Disposition header value.
#[must_use]
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let (_, rest) = header.split_once("filename=")?;
    let name = rest.split(';').next().unwrap_or(rest).trim().trim_matches('"');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Extracts an extension from a Content-Disposition header value.
#[must_use]
pub fn from_disposition(header: &str) -> Option<String> {
    let name = filename_from_disposition(header)?;
    from_url(&name)
}

/// Maps a Content-Type to an extension.
#[must_use]
pub fn from_content_type(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next().unwrap_or("").trim().to_lowercase();
    let ext = match mime.as_str() {
        "application/epub+zip" | "application/epub" => "epub",
        "application/pdf" => "pdf",
        "application/x-mobipocket-ebook" => "mobi",
        "application/vnd.amazon.ebook" => "azw3",
        "application/x-cbr" => "cbr",
        "application/x-cbz" => "cbz",
        "text/plain" => "txt",
        "text/html" => "html",
        "application/rtf" => "rtf",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/x-m4b" => "m4b",
        _ => return None,
    };
    Some(ext.to_string())
}

/// Resolves the extension for a downloaded file through the inference chain.
#[must_use]
pub fn resolve(
    href: &str,
    label: &str,
    content_disposition: Option<&str>,
    content_type: Option<&str>,
    requested: &str,
) -> String {
    if let Some(ext) = from_url(href) {
        return ext;
    }
    if let Some(ext) = from_label(label) {
        return ext;
    }
    if let Some(ext) = content_disposition.and_then(from_disposition) {
        return ext;
    }
    if let Some(ext) = content_type.and_then(from_content_type) {
        return ext;
    }
    if !is_wildcard(requested) {
        return requested.trim().to_lowercase();
    }
    "bin".to_string()
}
