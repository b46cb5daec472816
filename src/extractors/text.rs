//! Text normalization helpers shared by the field and price extractors

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));
static NUMBER_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d(?:[\d\s.,]*\d)?").expect("static regex"));
static RATING_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:[.,]\d+)?").expect("static regex"));
static RUBLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)₽|руб").expect("static regex"));

/// Leading characters that make a number negative (or a discount)
pub const MINUS_SIGNS: &[char] = &['\u{2212}', '-', '\u{2013}', '\u{2014}'];

const THIN_SPACE: char = '\u{2009}';

/// Trim and collapse internal whitespace
pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

fn suspicious_chars(text: &str) -> usize {
    text.chars().filter(|c| matches!(c, 'Ð' | 'Ñ')).count()
}

/// Undo UTF-8 text that was decoded as Latin-1 ("ÐÐ¸Ð½Ð¸" → "Мини").
/// The repaired text is kept only when it has fewer `Ð`/`Ñ` characters.
pub fn repair_mojibake(text: &str) -> Cow<'_, str> {
    let before = suspicious_chars(text);
    if before == 0 {
        return Cow::Borrowed(text);
    }

    let mut bytes = Vec::with_capacity(text.len());
    for c in text.chars() {
        let code = c as u32;
        if code > 0xFF {
            return Cow::Borrowed(text);
        }
        bytes.push(code as u8);
    }

    match String::from_utf8(bytes) {
        Ok(repaired) if suspicious_chars(&repaired) < before => Cow::Owned(repaired),
        _ => Cow::Borrowed(text),
    }
}

/// Whitespace-collapsed, mojibake-repaired text
pub fn clean_text(text: &str) -> String {
    let collapsed = collapse_whitespace(text);
    repair_mojibake(&collapsed).into_owned()
}

/// Protocol-relative URLs become https
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    match url.strip_prefix("//") {
        Some(rest) => format!("https://{}", rest),
        None => url.to_string(),
    }
}

/// Host of a URL without a leading `www.`
pub fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(&normalize_url(url)).ok()?;
    let host = parsed.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

pub fn count_digits(text: &str) -> usize {
    text.chars().filter(|c| c.is_ascii_digit()).count()
}

/// Store a rating as written when it is a plain number in [0, 5]
pub fn parse_rating(text: &str) -> Option<String> {
    let text = text.trim();
    if text.contains('%') || text.starts_with(MINUS_SIGNS) {
        return None;
    }
    let token = RATING_TOKEN.find(text)?.as_str();
    let value: f64 = token.replace(',', ".").parse().ok()?;
    if (0.0..=5.0).contains(&value) {
        Some(token.to_string())
    } else {
        None
    }
}

/// Locale-aware numeric value of the first number in `text`.
///
/// Spaces (including NBSP and thin space) group thousands. A `,` or `.`
/// followed by one or two trailing digits is the decimal separator, any
/// other `,`/`.` groups thousands.
pub fn parse_price(text: &str) -> Option<f64> {
    let run: String = NUMBER_RUN
        .find(text)?
        .as_str()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let normalized = match run.rfind(['.', ',']) {
        Some(pos) if (1..=2).contains(&(run.len() - pos - 1)) => {
            let (int, frac) = run.split_at(pos);
            let int: String = int.chars().filter(char::is_ascii_digit).collect();
            format!("{}.{}", int, &frac[1..])
        }
        _ => run.chars().filter(char::is_ascii_digit).collect(),
    };
    normalized.parse().ok()
}

/// Thin-space grouped price: `12999` → `12 999`, `1299.5` → `1 299,50`
pub fn format_price(value: f64) -> String {
    let cents = (value * 100.0).round() as u64;
    let int = (cents / 100).to_string();
    let frac = cents % 100;

    let mut grouped = String::new();
    if int.len() > 3 {
        for (i, c) in int.chars().enumerate() {
            if i > 0 && (int.len() - i) % 3 == 0 {
                grouped.push(THIN_SPACE);
            }
            grouped.push(c);
        }
    } else {
        grouped.push_str(&int);
    }

    if frac > 0 {
        grouped.push_str(&format!(",{:02}", frac));
    }
    grouped
}

/// Currency symbol mentioned in the text
pub fn detect_currency(text: &str) -> Option<&'static str> {
    if RUBLE.is_match(text) {
        Some("₽")
    } else if text.contains('$') {
        Some("$")
    } else if text.contains('€') {
        Some("€")
    } else {
        None
    }
}
