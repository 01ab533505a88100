//! # CSS resource loading detection
//!
//! Finds `url(` calls in inline styles and stylesheets and renames them to
//! `proton-url(`, which is valid CSS that loads nothing.
//!
//! Detection runs on a decoded copy of the value, each escape family
//! decoded in a single pass. Escape families that are decoded before
//! matching:
//!
//! - HTML entities, decimal (`&#117;`) and hex (`&#x75;`), with or
//!   without the trailing semicolon and with leading zeros, and the named
//!   entities listed in [`NAMED_ENTITIES`] (attribute values only);
//! - Unicode escapes `\u0075`;
//! - hex escapes `\x75`;
//! - CSS hex escapes `\75`, optionally followed by one whitespace;
//! - backslash-letter escapes `u\rl`.
//!
//! Whitespace between `url` and `(` is tolerated. Anything else, for
//! example `image-set()` with bare strings or `@import "x.css"`, is not
//! covered.

use std::borrow::Cow;
use std::ops::Range;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::constants::NEUTRALIZED_PREFIX;

/// Where a piece of CSS was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleSource {
    /// A `style="..."` attribute value, still entity-encoded.
    Attribute,
    /// The text of a `<style>` element.
    Stylesheet,
}

/// Named entities decoded before matching.
const NAMED_ENTITIES: &[(&str, char)] = &[
    ("amp", '&'),
    ("lt", '<'),
    ("gt", '>'),
    ("quot", '"'),
    ("apos", '\''),
    ("lpar", '('),
    ("rpar", ')'),
    ("bsol", '\\'),
    ("colon", ':'),
    ("sol", '/'),
    ("semi", ';'),
    ("comma", ','),
    ("period", '.'),
    ("excl", '!'),
    ("num", '#'),
    ("lbrack", '['),
    ("rbrack", ']'),
    ("lowbar", '_'),
    ("hyphen", '-'),
    ("tab", '\t'),
    ("newline", '\n'),
    ("nbsp", '\u{a0}'),
];

static ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(?:#[xX]0*([0-9a-fA-F]{1,6})|#0*([0-9]{1,7})|([a-zA-Z]{2,8}));?").unwrap()
});
static CSS_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\\(?:[uU]\{?([0-9a-fA-F]{4})\}?|[xX]([0-9a-fA-F]{2})|([0-9a-fA-F]{1,6})[ \t\n\r\x0C]?|([^0-9a-fA-F\r\n\x0C]))",
    )
    .unwrap()
});
static URL_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)url\s*\(").unwrap());
static NEUTRALIZED_URL_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)proton-url\(").unwrap());

/// Rewrites every loadable `url(` call in `value`.
///
/// Returns the input untouched when nothing loadable was found. Otherwise
/// only the source text spelling each call is replaced by `proton-url(`,
/// everything around it stays as written.
pub fn neutralize_style(value: &str, source: StyleSource) -> Cow<'_, str> {
    let decoded = decode(value, source);
    let calls = url_calls(&decoded.text);
    if calls.is_empty() {
        return Cow::Borrowed(value);
    }

    let mut rewritten = String::with_capacity(value.len() + calls.len() * NEUTRALIZED_PREFIX.len());
    let mut last = 0;
    for call in calls {
        let span = decoded.source_of(call);
        rewritten.push_str(value.get(last..span.start).unwrap_or_default());
        rewritten.push_str(NEUTRALIZED_PREFIX);
        rewritten.push_str("url(");
        last = span.end;
    }
    rewritten.push_str(value.get(last..).unwrap_or_default());

    debug_assert!(
        !loads_resources(&rewritten, source),
        "still loadable after rewrite: {rewritten}"
    );
    Cow::Owned(rewritten)
}

/// Whether `value` contains a `url(` call that would load something.
pub fn loads_resources(value: &str, source: StyleSource) -> bool {
    !url_calls(&decode(value, source).text).is_empty()
}

/// Turns neutralized `proton-url(` calls back into `url(`.
pub fn restore_style(value: &str) -> Cow<'_, str> {
    NEUTRALIZED_URL_CALL.replace_all(value, "url(")
}

fn url_calls(decoded: &str) -> Vec<Range<usize>> {
    URL_CALL
        .find_iter(decoded)
        .filter(|m| !is_neutralized(decoded, m.start()))
        .map(|m| m.range())
        .collect()
}

fn is_neutralized(decoded: &str, start: usize) -> bool {
    start
        .checked_sub(NEUTRALIZED_PREFIX.len())
        .and_then(|prefix_start| decoded.get(prefix_start..start))
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case(NEUTRALIZED_PREFIX))
}

/// Decoded text that remembers, for every byte, the bytes of the source it
/// was decoded from.
#[derive(Debug)]
struct Decoded {
    text: String,
    sources: Vec<Range<usize>>,
}

impl Decoded {
    fn new(value: &str) -> Self {
        Decoded {
            text: value.to_string(),
            sources: (0..value.len()).map(|i| i..i + 1).collect(),
        }
    }

    /// Decodes every match of `pattern` in a single left-to-right pass, so
    /// the output of one escape never takes part in another. Matches
    /// `decode` returns `None` for are kept as they are.
    fn replace(self, pattern: &Regex, decode: impl Fn(&Captures) -> Option<String>) -> Self {
        let mut text = String::with_capacity(self.text.len());
        let mut sources = Vec::with_capacity(self.sources.len());
        let mut last = 0;
        for caps in pattern.captures_iter(&self.text) {
            let Some(m) = caps.get(0) else {
                continue;
            };
            let Some(replacement) = decode(&caps) else {
                continue;
            };
            text.push_str(self.text.get(last..m.start()).unwrap_or_default());
            sources.extend_from_slice(self.sources.get(last..m.start()).unwrap_or_default());
            let source = self.source_of(m.range());
            sources.extend(std::iter::repeat(source).take(replacement.len()));
            text.push_str(&replacement);
            last = m.end();
        }
        text.push_str(self.text.get(last..).unwrap_or_default());
        sources.extend_from_slice(self.sources.get(last..).unwrap_or_default());
        Decoded { text, sources }
    }

    /// The source bytes the non-empty `range` of the text was decoded from.
    fn source_of(&self, range: Range<usize>) -> Range<usize> {
        let start = self.sources.get(range.start).map_or(0, |s| s.start);
        let end = range
            .end
            .checked_sub(1)
            .and_then(|last| self.sources.get(last))
            .map_or(start, |s| s.end);
        start..end
    }
}

fn decode(value: &str, source: StyleSource) -> Decoded {
    let decoded = Decoded::new(value);
    let decoded = match source {
        StyleSource::Attribute => decoded.replace(&ENTITY, decode_entity),
        StyleSource::Stylesheet => decoded,
    };
    decoded.replace(&CSS_ESCAPE, decode_escape)
}

fn decode_entity(caps: &Captures) -> Option<String> {
    if let Some(hex) = caps.get(1) {
        return Some(codepoint(hex.as_str(), 16).to_string());
    }
    if let Some(decimal) = caps.get(2) {
        return Some(codepoint(decimal.as_str(), 10).to_string());
    }
    let name = caps.get(3)?.as_str();
    NAMED_ENTITIES
        .iter()
        .find(|(entity, _)| entity.eq_ignore_ascii_case(name))
        .map(|(_, c)| c.to_string())
}

fn decode_escape(caps: &Captures) -> Option<String> {
    if let Some(digits) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) {
        return Some(codepoint(digits.as_str(), 16).to_string());
    }
    caps.get(4).map(|escaped| escaped.as_str().to_string())
}

fn codepoint(digits: &str, radix: u32) -> char {
    u32::from_str_radix(digits, radix)
        .ok()
        .and_then(char::from_u32)
        .filter(|c| *c != '\0')
        .unwrap_or(char::REPLACEMENT_CHARACTER)
}
