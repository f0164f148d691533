//! Article extraction from captured HTML responses.
//!
//! A narrow heuristic: find a title, collect the first few text blocks, and
//! hash the visible text so re-captured pages can be deduplicated.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use tapwire_storage::NewArticle;

/// Upper bound on the excerpt length, in characters.
pub const MAX_EXCERPT_CHARS: usize = 500;

/// Upper bound on the title length, in characters.
pub const MAX_TITLE_CHARS: usize = 500;

/// Number of text blocks joined into an excerpt.
const EXCERPT_BLOCKS: usize = 5;

/// A fallback `<h1>` must be at least this long to count as a title.
const MIN_HEADING_CHARS: usize = 10;

/// Decompressed bodies are cut here.
const MAX_DECODED_BYTES: usize = 8 * 1024 * 1024;

static HTML_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<\s*(!doctype\s+html|html|head|body|title|p|div|h1|article)\b").unwrap()
});
static COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static SCRIPTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").unwrap());
static STYLES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").unwrap());
static NOSCRIPTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<noscript\b[^>]*>.*?</noscript\s*>").unwrap());
static TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title\s*>").unwrap());
static H1: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<h1\b[^>]*>(.*?)</h1\s*>").unwrap());
static BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:p|h[1-6]|li|blockquote|pre)\b[^>]*>(.*?)</(?:p|h[1-6]|li|blockquote|pre)\s*>")
        .unwrap()
});
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static ENTITIES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Outcome of running extraction over one body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// An article candidate ready to be stored.
    Article(NewArticle),
    /// Readable HTML, but nothing that looks like an article title.
    NoArticle,
    /// The body could not be read as HTML.
    Failed(String),
}

impl Extraction {
    /// Returns the candidate, if any.
    pub fn article(self) -> Option<NewArticle> {
        match self {
            Extraction::Article(article) => Some(article),
            _ => None,
        }
    }
}

/// Extracts an article candidate from a captured response body.
///
/// `content_encoding` is the response `Content-Encoding` header; gzip and
/// deflate bodies are decoded first, tolerating truncation.
pub fn extract_article(url: &str, content_encoding: Option<&str>, body: &[u8]) -> Extraction {
    let decoded = match decode_body(content_encoding, body) {
        Ok(decoded) => decoded,
        Err(reason) => return Extraction::Failed(reason),
    };

    let html = match decode_text(&decoded) {
        Ok(html) => html,
        Err(reason) => return Extraction::Failed(reason),
    };

    if !HTML_MARKER.is_match(&html) {
        return Extraction::Failed("not HTML".into());
    }

    let cleaned = strip_invisible(&html);

    let Some(title) = find_title(&cleaned) else {
        return Extraction::NoArticle;
    };

    Extraction::Article(NewArticle {
        url: url.to_string(),
        title,
        content_excerpt: excerpt(&cleaned),
        content_hash: content_hash(&cleaned),
    })
}

fn decode_body(content_encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>, String> {
    let encoding = content_encoding
        .map(|e| e.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match encoding.as_str() {
        "" | "identity" => Ok(body.to_vec()),
        "gzip" | "x-gzip" => read_tolerant(GzDecoder::new(body)),
        "deflate" => read_tolerant(ZlibDecoder::new(body))
            .or_else(|_| read_tolerant(DeflateDecoder::new(body))),
        other => Err(format!("unsupported content encoding: {other}")),
    }
}

/// Reads as much as decodes cleanly; a cut-off stream keeps its prefix.
fn read_tolerant(mut reader: impl Read) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(out),
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                if out.len() >= MAX_DECODED_BYTES {
                    out.truncate(MAX_DECODED_BYTES);
                    return Ok(out);
                }
            }
            Err(e) if out.is_empty() => return Err(format!("undecodable body: {e}")),
            Err(_) => return Ok(out),
        }
    }
}

fn decode_text(bytes: &[u8]) -> Result<String, String> {
    if bytes.is_empty() {
        return Err("empty body".into());
    }

    let head = &bytes[..bytes.len().min(1024)];
    if head.contains(&0) {
        return Err("binary body".into());
    }

    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(text.to_string()),
        Err(_) => {
            // Latin-1 pages and bodies cut mid-character are still usable.
            let text = String::from_utf8_lossy(bytes);
            let replaced = text.chars().filter(|&c| c == char::REPLACEMENT_CHARACTER).count();
            if replaced * 10 > text.chars().count() {
                Err("undecodable text".into())
            } else {
                Ok(text.into_owned())
            }
        }
    }
}

fn strip_invisible(html: &str) -> String {
    let html = COMMENTS.replace_all(html, " ");
    let html = SCRIPTS.replace_all(&html, " ");
    let html = STYLES.replace_all(&html, " ");
    NOSCRIPTS.replace_all(&html, " ").into_owned()
}

fn find_title(html: &str) -> Option<String> {
    if let Some(caps) = TITLE.captures(html) {
        let title = clean_text(&caps[1]);
        if !title.is_empty() {
            return Some(truncate_chars(&title, MAX_TITLE_CHARS));
        }
    }

    H1.captures_iter(html)
        .map(|caps| clean_text(&caps[1]))
        .find(|heading| heading.chars().count() >= MIN_HEADING_CHARS)
        .map(|heading| truncate_chars(&heading, MAX_TITLE_CHARS))
}

fn excerpt(html: &str) -> String {
    let text = BLOCKS
        .captures_iter(html)
        .map(|caps| clean_text(&caps[1]))
        .filter(|block| !block.is_empty())
        .take(EXCERPT_BLOCKS)
        .collect::<Vec<_>>()
        .join(" ");

    truncate_chars(&text, MAX_EXCERPT_CHARS)
}

fn content_hash(html: &str) -> String {
    hex::encode(Sha256::digest(clean_text(html).as_bytes()))
}

/// Strips tags, decodes entities and collapses whitespace.
fn clean_text(fragment: &str) -> String {
    let text = TAGS.replace_all(fragment, " ");
    let text = decode_entities(&text);
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

fn decode_entities(text: &str) -> String {
    ENTITIES
        .replace_all(text, |caps: &Captures<'_>| {
            let entity = &caps[1];
            let decoded = if let Some(hex) = entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse().ok().and_then(char::from_u32)
            } else {
                named_entity(entity)
            };

            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "ldquo" => '\u{201C}',
        "rdquo" => '\u{201D}',
        "hellip" => '\u{2026}',
        "copy" => '\u{00A9}',
        _ => return None,
    })
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
