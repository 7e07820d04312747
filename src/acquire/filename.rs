//! Output filename derivation.
//!
//! Download links scraped from catalog pages often carry machine noise in
//! their labels (`href_..._panel_book_details_label_Title`). The noise prefix
//! is stripped, "Title - Author" / "Title by Author" labels are split, and
//! the pieces are sanitized into a filesystem-safe
//! `<title>[_<author>].<ext>` name, falling back to the book uuid when no
//! title survives.

/// Marker terminating scraped link-label noise.
const NOISE_MARKERS: [&str; 3] = ["panel_book_details_label_", "label_", "label:"];

/// Strips scraped-markup noise prefixes from a label.
#[must_use]
pub fn strip_noise(label: &str) -> String {
    let mut text = label.trim();
    for marker in NOISE_MARKERS {
        if let Some(idx) = text.find(marker) {
            // Only treat it as noise when it prefixes the text; a title that
            // merely mentions "label" stays intact.
            let leading = &text[..idx];
            if leading.is_empty() || leading.starts_with("href_") {
                text = &text[idx + marker.len()..];
                break;
            }
        }
    }
    text.trim().to_string()
}

/// Splits a `Title - Author` or `Title by Author` label.
#[must_use]
pub fn split_title_author(label: &str) -> Option<(String, String)> {
    for separator in [" - ", " by "] {
        if let Some((title, author)) = label.split_once(separator) {
            let title = title.trim();
            let author = author.trim();
            if !title.is_empty() && !author.is_empty() {
                return Some((title.to_string(), author.to_string()));
            }
        }
    }
    None
}

/// Sanitizes one filename component: anything outside `[A-Za-z0-9-_.]`
/// becomes `_`, runs collapse, and edges are trimmed.
#[must_use]
pub fn sanitize_component(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_fill = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') {
            out.push(c);
            last_was_fill = false;
        } else if !last_was_fill {
            out.push('_');
            last_was_fill = true;
        }
    }
    out.trim_matches(['_', '.']).to_string()
}

/// Derives the output filename for a download.
///
/// The link label is preferred (after noise stripping and title/author
/// splitting), then the catalog title with the first author, then the uuid.
#[must_use]
pub fn derive(
    uuid: &str,
    title: &str,
    authors: &[String],
    link_label: &str,
    extension: &str,
) -> String {
    let cleaned = strip_noise(link_label);
    let (label_title, label_author) = match split_title_author(&cleaned) {
        Some((t, a)) => (t, Some(a)),
        None => (cleaned, None),
    };

    // A label beats the catalog title only when it names both title and
    // author. Bare format labels ("EPUB (512.0 kB)") and action labels
    // ("Download") are not titles.
    let title_part = {
        let from_catalog = sanitize_component(title);
        let from_label = sanitize_component(&label_title);
        let label_usable = !from_label.is_empty()
            && super::extension::from_label(&label_title).is_none()
            && (label_author.is_some() || from_catalog.is_empty());
        if label_usable { from_label } else { from_catalog }
    };

    let author_part = label_author
        .as_deref()
        .or_else(|| authors.first().map(String::as_str))
        .map(sanitize_component)
        .filter(|a| !a.is_empty());

    let stem = if title_part.is_empty() {
        sanitize_component(uuid)
    } else {
        match author_part {
            Some(author) => format!("{title_part}_{author}"),
            None => title_part,
        }
    };
    format!("{stem}.{extension}")
}
