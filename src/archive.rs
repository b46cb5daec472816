//! MHTML archive reader
//!
//! Recovers the first `text/html` part of a `multipart/related` archive, or
//! passes plain HTML through. Parts are found by walking a cursor from one
//! boundary occurrence to the next, so the archive is never split into an
//! array of parts.

use std::borrow::Cow;

use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::error::ParseError;

/// Header region searched for the boundary token
const BOUNDARY_SEARCH_LEN: usize = 2000;

static CONTENT_TYPE_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)Content-Type:\s*multipart/related[^;\r\n]*;\s*boundary=["']?([^"'\r\n;]+)["']?"#)
        .expect("static regex")
});
static QUOTED_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)boundary=["']?([^"'\r\n;]+)["']?"#).expect("static regex"));
static BARE_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)boundary=([^\s"';]+)"#).expect("static regex"));
static DOCTYPE_DOCUMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<!DOCTYPE[^>]*>.*</html>").expect("static regex"));
static HTML_DOCUMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<html[\s>].*</html>").expect("static regex"));
static PART_CONTENT_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Content-Type:\s*([^;\r\n]+)").expect("static regex"));
static TRANSFER_ENCODING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Content-Transfer-Encoding:\s*([^\r\n]+)").expect("static regex"));
static HEADER_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r?\n\r?\n").expect("static regex"));

/// Declared `Content-Transfer-Encoding` of the recovered part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    QuotedPrintable,
    Base64,
    /// 7bit, 8bit, binary or absent
    Identity,
}

impl TransferEncoding {
    fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "quoted-printable" => TransferEncoding::QuotedPrintable,
            "base64" => TransferEncoding::Base64,
            _ => TransferEncoding::Identity,
        }
    }
}

/// How the HTML was recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveSource {
    /// Input was already an HTML document
    Plain,
    /// Decoded from a multipart part
    Part(TransferEncoding),
    /// Found by scanning the raw text for a document signature
    Signature,
}

/// HTML recovered from the input
#[derive(Debug, Clone)]
pub struct RecoveredHtml<'a> {
    pub html: Cow<'a, str>,
    pub source: ArchiveSource,
    pub parts_scanned: usize,
}

/// Multipart scanner with an optional cooperative yield hook
#[derive(Debug, Clone, Copy)]
pub struct ArchiveReader {
    yield_every: usize,
}

impl Default for ArchiveReader {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ArchiveReader {
    /// `yield_every` of 0 disables the yield hook
    pub fn new(yield_every: usize) -> Self {
        Self { yield_every }
    }

    /// Recover the HTML document, calling `on_yield(parts_scanned)` every
    /// `yield_every` parts
    pub fn read<'a>(
        &self,
        input: &'a str,
        on_yield: &mut dyn FnMut(usize),
    ) -> Result<RecoveredHtml<'a>, ParseError> {
        if is_markup(input) {
            debug!(len = input.len(), "input is plain HTML");
            return Ok(RecoveredHtml {
                html: Cow::Borrowed(input),
                source: ArchiveSource::Plain,
                parts_scanned: 0,
            });
        }

        let Some(boundary) = find_boundary(input) else {
            debug!("no multipart boundary, scanning for an HTML signature");
            return find_signature(input)
                .map(|html| RecoveredHtml {
                    html: Cow::Borrowed(html),
                    source: ArchiveSource::Signature,
                    parts_scanned: 0,
                })
                .ok_or(ParseError::NoHtmlFound);
        };

        let dashed = format!("--{}", boundary);
        let separator = if input.contains(&dashed) {
            dashed.as_str()
        } else {
            boundary
        };

        let mut cursor = 0;
        let mut parts_scanned = 0;
        while cursor < input.len() {
            let Some(offset) = input[cursor..].find(separator) else {
                break;
            };
            let part_start = cursor + offset + separator.len();
            let part_end = input[part_start..]
                .find(separator)
                .map(|next| part_start + next)
                .unwrap_or(input.len());

            let part = &input[part_start..part_end];
            parts_scanned += 1;

            if part.contains("text/html") {
                if let Some((html, encoding)) = decode_html_part(part) {
                    info!(parts_scanned, html_len = html.len(), "HTML part decoded");
                    return Ok(RecoveredHtml {
                        html: Cow::Owned(html),
                        source: ArchiveSource::Part(encoding),
                        parts_scanned,
                    });
                }
            }

            if self.yield_every > 0 && parts_scanned % self.yield_every == 0 {
                on_yield(parts_scanned);
            }
            cursor = part_end;
        }

        debug!(parts_scanned, "no text/html part, scanning for an HTML signature");
        find_signature(input)
            .map(|html| RecoveredHtml {
                html: Cow::Borrowed(html),
                source: ArchiveSource::Signature,
                parts_scanned,
            })
            .ok_or(ParseError::NoHtmlFound)
    }
}

/// MHTML opens with MIME headers, a saved page opens with a tag
fn is_markup(input: &str) -> bool {
    input.trim_start_matches('\u{feff}').trim_start().starts_with('<')
}

fn find_boundary(input: &str) -> Option<&str> {
    let header = prefix_chars(input, BOUNDARY_SEARCH_LEN);
    [&*CONTENT_TYPE_BOUNDARY, &*QUOTED_BOUNDARY, &*BARE_BOUNDARY]
        .iter()
        .find_map(|re| re.captures(header).and_then(|caps| caps.get(1)))
        .map(|m| m.as_str().trim())
        .filter(|b| !b.is_empty())
}

fn find_signature(input: &str) -> Option<&str> {
    DOCTYPE_DOCUMENT
        .find(input)
        .or_else(|| HTML_DOCUMENT.find(input))
        .map(|m| m.as_str())
}

fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn decode_html_part(part: &str) -> Option<(String, TransferEncoding)> {
    let content_type = PART_CONTENT_TYPE.captures(part)?.get(1)?.as_str();
    if !content_type.trim().to_ascii_lowercase().contains("text/html") {
        return None;
    }

    let body_start = HEADER_END.find(part)?.end();
    let body = strip_envelope(&part[body_start..]);

    let encoding = TRANSFER_ENCODING
        .captures(&part[..body_start])
        .and_then(|caps| caps.get(1))
        .map(|m| TransferEncoding::from_header(m.as_str()))
        .unwrap_or(TransferEncoding::Identity);

    let decoded = match encoding {
        TransferEncoding::QuotedPrintable => decode_quoted_printable(body),
        TransferEncoding::Base64 => decode_base64(body),
        TransferEncoding::Identity => body.to_string(),
    };

    if decoded.trim().is_empty() {
        None
    } else {
        Some((decoded, encoding))
    }
}

/// Drop the line break that precedes the next boundary, and the `--` of a
/// boundary written without its dashed prefix
fn strip_envelope(body: &str) -> &str {
    let body = body.strip_suffix("--").unwrap_or(body);
    body.strip_suffix("\r\n")
        .or_else(|| body.strip_suffix('\n'))
        .unwrap_or(body)
}

/// Strip soft line breaks and decode `=XX` escapes, then read the bytes as UTF-8
pub fn decode_quoted_printable(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'=' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match (bytes.get(i + 1), bytes.get(i + 2)) {
            (Some(b'\r'), Some(b'\n')) => i += 3,
            (Some(b'\n'), _) => i += 2,
            (Some(&hi), Some(&lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                out.push((hex_value(hi) << 4) | hex_value(lo));
                i += 3;
            }
            _ => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

/// Standard base64 with embedded whitespace; undecodable input is returned as is
pub fn decode_base64(input: &str) -> String {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    match base64::engine::general_purpose::STANDARD.decode(compact.as_bytes()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!("base64 part did not decode: {}", e);
            input.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_html(input: &str) -> Result<Cow<'_, str>, ParseError> {
        ArchiveReader::default()
            .read(input, &mut |_| {})
            .map(|recovered| recovered.html)
    }

    const HTML: &str = "<!DOCTYPE html><html><head><title>Поиск</title></head><body><div class=\"EShopItem\">Цена: 1 299 ₽ = скидка</div></body></html>";

    fn encode_quoted_printable(input: &str) -> String {
        let mut out = String::new();
        let mut line_len = 0;
        for &b in input.as_bytes() {
            let chunk = if b == b'=' || !(0x20..0x7f).contains(&b) {
                format!("={:02X}", b)
            } else {
                (b as char).to_string()
            };
            if line_len + chunk.len() > 75 {
                out.push_str("=\r\n");
                line_len = 0;
            }
            line_len += chunk.len();
            out.push_str(&chunk);
        }
        out
    }

    fn wrap(body: &str, encoding: &str) -> String {
        format!(
            "From: <Saved by Blink>\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/related;\r\n\ttype=\"text/html\";\r\n\tboundary=\"----MultipartBoundary--abc123----\"\r\n\r\n\
             ------MultipartBoundary--abc123----\r\n\
             Content-Type: text/css\r\n\
             Content-Location: https://example.com/style.css\r\n\r\n\
             .a{{color:red}}\r\n\
             ------MultipartBoundary--abc123----\r\n\
             Content-Type: text/html\r\n\
             Content-Transfer-Encoding: {}\r\n\
             Content-Location: https://example.com/\r\n\r\n\
             {}\r\n\
             ------MultipartBoundary--abc123------\r\n",
            encoding, body
        )
    }

    #[test]
    fn test_quoted_printable_round_trip() {
        let archive = wrap(&encode_quoted_printable(HTML), "quoted-printable");
        let recovered = ArchiveReader::default().read(&archive, &mut |_| {}).unwrap();
        assert_eq!(recovered.html, HTML);
        assert_eq!(
            recovered.source,
            ArchiveSource::Part(TransferEncoding::QuotedPrintable)
        );
        assert_eq!(recovered.parts_scanned, 2);
    }

    #[test]
    fn test_base64_round_trip() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(HTML.as_bytes());
        let wrapped: Vec<String> = encoded
            .as_bytes()
            .chunks(76)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        let archive = wrap(&wrapped.join("\r\n"), "base64");
        assert_eq!(extract_html(&archive).unwrap(), HTML);
    }

    #[test]
    fn test_plain_html_passthrough() {
        let recovered = ArchiveReader::default().read(HTML, &mut |_| {}).unwrap();
        assert_eq!(recovered.html, HTML);
        assert_eq!(recovered.source, ArchiveSource::Plain);

        let unclosed = "\n<div class=\"EShopItem\"><span>Товар</span></div>\n";
        assert_eq!(extract_html(unclosed).unwrap(), unclosed);

        let mentions_boundary = "<html><body><pre>boundary=abc</pre></body></html>";
        assert_eq!(extract_html(mentions_boundary).unwrap(), mentions_boundary);
    }

    #[test]
    fn test_part_keeps_document_whitespace() {
        let html = "<!DOCTYPE html>\n<html><body>x</body></html>\n";
        assert_eq!(extract_html(&wrap(html, "8bit")).unwrap(), html);

        let encoded = base64::engine::general_purpose::STANDARD.encode("<html><body>x</body></html>\n");
        assert_eq!(
            extract_html(&wrap(&encoded, "base64")).unwrap(),
            "<html><body>x</body></html>\n"
        );
    }

    #[test]
    fn test_no_html_is_fatal() {
        let err = extract_html("just some text without markup").unwrap_err();
        assert_eq!(err, ParseError::NoHtmlFound);
    }

    #[test]
    fn test_multipart_without_html_part_falls_back_to_signature() {
        let archive = "Content-Type: multipart/related; boundary=XYZ\r\n\r\n\
                       --XYZ\r\nContent-Type: image/png\r\n\r\nabc\r\n\
                       --XYZ\r\nContent-Type: text/plain\r\n\r\n<html><body>x</body></html>\r\n--XYZ--";
        let recovered = ArchiveReader::default().read(archive, &mut |_| {}).unwrap();
        assert_eq!(recovered.html, "<html><body>x</body></html>");
        assert_eq!(recovered.source, ArchiveSource::Signature);
    }

    #[test]
    fn test_yield_hook_called_every_n_parts() {
        let mut archive = String::from("Content-Type: multipart/related; boundary=B\r\n\r\n");
        for i in 0..7 {
            archive.push_str(&format!("--B\r\nContent-Type: image/png\r\n\r\nimg{}\r\n", i));
        }
        archive.push_str("--B\r\nContent-Type: text/html\r\n\r\n<html><body>ok</body></html>\r\n--B--");

        let mut yields = Vec::new();
        let recovered = ArchiveReader::new(3)
            .read(&archive, &mut |n| yields.push(n))
            .unwrap();
        assert_eq!(recovered.html, "<html><body>ok</body></html>");
        assert_eq!(recovered.parts_scanned, 8);
        assert_eq!(yields, vec![3, 6]);
    }

    #[test]
    fn test_quoted_printable_soft_breaks() {
        assert_eq!(decode_quoted_printable("a=\r\nb=3Dc=\nd"), "ab=cd");
        assert_eq!(decode_quoted_printable("=D0=9C=D0=B8"), "Ми");
        assert_eq!(decode_quoted_printable("x=zz"), "x=zz");
    }
}
