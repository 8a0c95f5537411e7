//! Candidate-name extraction from logo filenames and scraped labels.

use once_cell::sync::Lazy;
use regex::Regex;

static EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(png|jpe?g|webp|svg|gif|avif|ico|bmp)$").expect("valid regex"));

static PREFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // scraper dumps: imgi_38_, img-12-, logo_004_
        r"(?i)^(imgi|img|image|logo)[_-]\d+[_-]+",
        r"^\d+[_-]+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static SUFFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\s*\(\d+\)$",
        r"(?i)[-_ ]?\d{2,4}x\d{2,4}$",
        r"(?i)@\dx$",
        r"(?i)[-_ ]+(reviews?|logos?|icon|small|medium|large|thumb(nail)?|scaled|min|copy)$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_]+").expect("valid regex"));

static TRAILING_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s+(broker\s+)?(review|logo)s?$").expect("valid regex")
});

fn strip_repeatedly(mut value: String, patterns: &[Regex]) -> String {
    loop {
        let before = value.len();
        for pattern in patterns {
            value = pattern.replace(&value, "").into_owned();
        }
        if value.len() == before {
            return value;
        }
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// Derives a candidate broker name from a raw filename or scraped label.
///
/// Returns an empty string when nothing survives stripping; callers treat that
/// as unmatched.
pub fn extract_candidate_name(raw: &str) -> String {
    let file_name = raw
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(raw)
        .trim();
    let stem = EXTENSION.replace(file_name, "").into_owned();
    let stem = strip_repeatedly(stem, &PREFIXES);
    let stem = strip_repeatedly(stem.trim().to_string(), &SUFFIXES);
    let spaced = SEPARATORS.replace_all(&stem, " ");

    collapse_whitespace(&spaced)
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

/// URL-safe key derived from a display name.
pub fn slugify(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Normalizes a stored display name without changing its casing.
pub fn clean_display_name(name: &str) -> String {
    let collapsed = collapse_whitespace(name);
    let stripped = TRAILING_MARKER.replace(&collapsed, "");
    let stripped = stripped.trim();
    if stripped.is_empty() {
        collapsed
    } else {
        stripped.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scraper_dump_filenames_reduce_to_broker_names() {
        assert_eq!(extract_candidate_name("imgi_38_fxtm-review.png"), "Fxtm");
        assert_eq!(extract_candidate_name("logos/ic-markets-logo.webp"), "Ic Markets");
        assert_eq!(extract_candidate_name("012_admiral_markets-150x150.jpg"), "Admiral Markets");
        assert_eq!(extract_candidate_name("Pepperstone (1).jpeg"), "Pepperstone");
        assert_eq!(extract_candidate_name("oanda@2x.png"), "Oanda");
        assert_eq!(extract_candidate_name("C:\\dump\\xm-group_small.PNG"), "Xm Group");
    }

    #[test]
    fn scraped_labels_lose_review_markers() {
        assert_eq!(extract_candidate_name("Pepperstone Review"), "Pepperstone");
        assert_eq!(extract_candidate_name("  IG   markets  "), "Ig Markets");
    }

    #[test]
    fn nothing_left_after_stripping_is_empty() {
        assert_eq!(extract_candidate_name("imgi_12_.png"), "");
        assert_eq!(extract_candidate_name("   "), "");
        assert_eq!(extract_candidate_name(".png"), "");
    }

    #[test]
    fn names_without_separators_keep_embedded_digits() {
        assert_eq!(extract_candidate_name("plus500.svg"), "Plus500");
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("IG Markets"), "ig-markets");
        assert_eq!(slugify("  Admiral  Markets (UK) "), "admiral-markets-uk");
        assert_eq!(slugify("FP-Markets"), "fp-markets");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn display_names_keep_casing() {
        assert_eq!(clean_display_name("  OANDA   Review "), "OANDA");
        assert_eq!(clean_display_name("IG Broker Review"), "IG");
        assert_eq!(clean_display_name("XM  Group"), "XM Group");
        assert_eq!(clean_display_name("Review"), "Review");
    }
}
