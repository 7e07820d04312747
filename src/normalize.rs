//! Text normalization: transliteration, language tagging.
//!
//! Remote catalogs carry metadata in arbitrary scripts and with unreliable
//! language tags. Text fields are transliterated to a stable ASCII-safe
//! representation before persistence, and books with no declared language get
//! one classified from their description or title, accepted only above a
//! confidence floor.

use deunicode::deunicode;

/// Minimum classifier confidence to accept an inferred language.
const LANGUAGE_CONFIDENCE_FLOOR: f64 = 0.85;

/// Transliterates text to an ASCII-safe representation.
///
/// Unmappable characters are dropped rather than replaced with markers, so
/// repeated normalization is stable.
#[must_use]
pub fn transliterate(text: &str) -> String {
    deunicode(text)
}

/// Classifies the language of free text, returning an ISO 639-2/B code.
///
/// Returns `None` when detection fails or confidence is below 0.85; callers
/// leave the language empty in that case rather than guessing.
#[must_use]
pub fn classify_language(text: &str) -> Option<String> {
    let info = whatlang::detect(text)?;
    if info.confidence() < LANGUAGE_CONFIDENCE_FLOOR {
        return None;
    }
    Some(to_bibliographic(info.lang().code()))
}

/// Normalizes a declared language tag to an ISO 639-2/B code.
///
/// Accepts two-letter (ISO 639-1) and three-letter tags, with or without a
/// region subtag (`en-US`). Unknown tags pass through lowercased so nothing
/// is silently discarded.
#[must_use]
pub fn iso639_2(tag: &str) -> Option<String> {
    let primary = tag.split(['-', '_']).next().unwrap_or("").trim();
    if primary.is_empty() {
        return None;
    }
    let lower = primary.to_ascii_lowercase();
    match lower.len() {
        2 => Some(two_letter_to_bibliographic(&lower)),
        3 => Some(to_bibliographic(&lower)),
        _ => None,
    }
}

/// Maps ISO 639-3/-2T codes to their 639-2/B bibliographic variant.
///
/// Most codes are identical in both families; only the historic bibliographic
/// set differs.
fn to_bibliographic(code: &str) -> String {
    let mapped = match code {
        "sqi" => "alb",
        "hye" => "arm",
        "eus" => "baq",
        "mya" => "bur",
        "zho" | "cmn" => "chi",
        "ces" => "cze",
        "nld" => "dut",
        "fra" => "fre",
        "kat" => "geo",
        "deu" => "ger",
        "ell" => "gre",
        "isl" => "ice",
        "mkd" => "mac",
        "msa" => "may",
        "fas" | "pes" => "per",
        "ron" => "rum",
        "slk" => "slo",
        "bod" => "tib",
        "cym" => "wel",
        other => other,
    };
    mapped.to_string()
}

/// Maps common ISO 639-1 two-letter tags to ISO 639-2/B.
fn two_letter_to_bibliographic(code: &str) -> String {
    let mapped = match code {
        "ar" => "ara",
        "bg" => "bul",
        "ca" => "cat",
        "cs" => "cze",
        "da" => "dan",
        "de" => "ger",
        "el" => "gre",
        "en" => "eng",
        "es" => "spa",
        "fa" => "per",
        "fi" => "fin",
        "fr" => "fre",
        "he" => "heb",
        "hi" => "hin",
        "hu" => "hun",
        "id" => "ind",
        "it" => "ita",
        "ja" => "jpn",
        "ko" => "kor",
        "nl" => "dut",
        "no" => "nor",
        "pl" => "pol",
        "pt" => "por",
        "ro" => "rum",
        "ru" => "rus",
        "sk" => "slo",
        "sq" => "alb",
        "sv" => "swe",
        "th" => "tha",
        "tr" => "tur",
        "uk" => "ukr",
        "vi" => "vie",
        "zh" => "chi",
        other => other,
    };
    mapped.to_string()
}
