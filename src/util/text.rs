use std::borrow::Cow;

use quick_xml::escape::resolve_html5_entity;
use quick_xml::events::Event;
use quick_xml::Reader;

/// Tags that separate blocks of text. Their opening and closing forms both
/// become a line break in the plain-text output.
const BLOCK_TAGS: [&str; 3] = ["br", "p", "div"];

/// Upper bound on strip passes for text whose decoded content keeps forming
/// new markup (escaped tags nested inside escaped tags).
const MAX_PASSES: usize = 16;

/// Longest HTML5 named entity is 31 characters.
const MAX_ENTITY_LEN: usize = 32;

/// Converts an item description into normalized plain text.
///
/// A `<` opens a tag only when followed by a letter, `/`, `!` or `?`, so
/// text like `1 < 2 and 3 > 1` is never mistaken for markup. Input with at
/// least one tag is tokenized; text nodes are kept with entities resolved
/// and block tags (`br`, `p`, `div`, either form, any case) become a single
/// line break. The result, or the raw input when there was no markup, then
/// has its whitespace normalized:
///
/// - `\r\n` and lone `\r` become `\n`
/// - runs of spaces and tabs become a single space
/// - spaces and tabs touching a line break are removed
/// - blank lines are collapsed
/// - leading and trailing whitespace is trimmed
///
/// Decoded text that itself forms tags (`&lt;b&gt;`, CDATA holding markup)
/// is stripped again until nothing changes, so applying the function to its
/// own output returns that output unchanged.
///
/// # Examples
///
/// ```
/// use feedkeep::util::clean_description;
///
/// assert_eq!(clean_description("<p>Hello</p><p>world</p>"), "Hello\nworld");
/// assert_eq!(clean_description("  Hello    world  "), "Hello world");
/// assert_eq!(clean_description("if 1 < 2 and 3 > 1 then"), "if 1 < 2 and 3 > 1 then");
/// assert_eq!(clean_description(""), "");
/// ```
pub fn clean_description(input: &str) -> String {
    let mut text = sanitize_once(input);
    for _ in 1..MAX_PASSES {
        let next = sanitize_once(&text);
        if next == text {
            break;
        }
        text = next;
    }
    text
}

fn sanitize_once(input: &str) -> String {
    if has_tag(input) {
        normalize_whitespace(&strip_markup(input))
    } else {
        normalize_whitespace(input)
    }
}

/// Whether the character after a `<` makes it the start of a tag.
fn opens_tag(next: Option<char>) -> bool {
    next.is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'))
}

fn has_tag(s: &str) -> bool {
    s.match_indices('<')
        .any(|(idx, _)| opens_tag(s[idx + 1..].chars().next()))
}

/// Rewrites every `<` that does not open a tag as `&lt;` so the tokenizer
/// reads it as text.
fn escape_bare_lt(input: &str) -> Cow<'_, str> {
    let mut out = String::new();
    let mut copied = 0;
    for (idx, _) in input.match_indices('<') {
        if !opens_tag(input[idx + 1..].chars().next()) {
            out.push_str(&input[copied..idx]);
            out.push_str("&lt;");
            copied = idx + 1;
        }
    }
    if copied == 0 {
        return Cow::Borrowed(input);
    }
    out.push_str(&input[copied..]);
    Cow::Owned(out)
}

/// Resolves character references and HTML5 named entities. An `&` that does
/// not start a known reference, as in "AT&T", is kept as written.
fn decode_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let resolved = after
            .find(';')
            .filter(|&end| end > 0 && end <= MAX_ENTITY_LEN)
            .and_then(|end| resolve_reference(&after[..end]).map(|text| (text, end)));
        match resolved {
            Some((text, end)) => {
                out.push_str(&text);
                rest = &after[end + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn resolve_reference(name: &str) -> Option<Cow<'static, str>> {
    let Some(number) = name.strip_prefix('#') else {
        return resolve_html5_entity(name).map(Cow::Borrowed);
    };
    let code = match number.strip_prefix(['x', 'X']) {
        Some(hex) if hex.bytes().all(|b| b.is_ascii_hexdigit()) => u32::from_str_radix(hex, 16).ok()?,
        Some(_) => return None,
        None if number.bytes().all(|b| b.is_ascii_digit()) => number.parse().ok()?,
        None => return None,
    };
    char::from_u32(code)
        .filter(|&c| c != '\0')
        .map(|c| Cow::Owned(c.to_string()))
}

fn is_block_tag(name: &[u8]) -> bool {
    BLOCK_TAGS
        .iter()
        .any(|tag| tag.as_bytes().eq_ignore_ascii_case(name))
}

/// Accumulates text nodes and block separators.
///
/// Adjacent text nodes are joined by a single space, block boundaries by a
/// single newline; consecutive boundaries never stack.
#[derive(Default)]
struct PlainText {
    buf: String,
    last_was_break: bool,
}

impl PlainText {
    fn push_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.last_was_break && !self.buf.is_empty() {
            self.buf.push(' ');
        }
        self.buf.push_str(text);
        self.last_was_break = false;
    }

    fn push_break(&mut self) {
        if !self.last_was_break {
            self.buf.push('\n');
            self.last_was_break = true;
        }
    }

    fn finish(self) -> String {
        self.buf
    }
}

/// Walks the markup token stream with quick-xml configured for HTML-ish
/// input (unmatched and unclosed tags tolerated). Bare `<` is escaped first
/// so comparisons survive as text.
///
/// Markup quick-xml cannot tokenize at all falls back to
/// [`strip_tags_lenient`].
fn strip_markup(input: &str) -> String {
    let escaped = escape_bare_lt(input);
    let mut reader = Reader::from_str(&escaped);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;
    config.check_comments = false;

    let mut out = PlainText::default();

    loop {
        match reader.read_event() {
            Ok(Event::Text(t)) => out.push_text(&decode_entities(&String::from_utf8_lossy(&t))),
            Ok(Event::CData(c)) => out.push_text(&String::from_utf8_lossy(&c)),
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if is_block_tag(e.local_name().as_ref()) {
                    out.push_break();
                }
            }
            Ok(Event::End(e)) => {
                if is_block_tag(e.local_name().as_ref()) {
                    out.push_break();
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Description markup not tokenizable, stripping leniently");
                return strip_tags_lenient(input);
            }
        }
    }

    out.finish()
}

/// Character-level tag stripper for markup the tokenizer rejects.
///
/// A `<` only opens a tag when followed by a letter, `/`, `!` or `?`;
/// otherwise it is literal text, as in `1 < 2`. Unterminated tags are
/// dropped.
fn strip_tags_lenient(input: &str) -> String {
    let mut out = PlainText::default();
    let mut text = String::new();
    let mut chars = input.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if ch != '<' || !opens_tag(chars.peek().map(|&(_, next)| next)) {
            text.push(ch);
            continue;
        }

        out.push_text(&decode_entities(&text));
        text.clear();

        let rest = &input[idx + 1..];
        let Some(tag_len) = rest.find('>') else {
            break;
        };
        let tag = &rest[..tag_len];
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        if is_block_tag(name.as_bytes()) {
            out.push_break();
        }

        // Skip past the closing `>`
        while let Some(&(pos, _)) = chars.peek() {
            if pos > idx + tag_len + 1 {
                break;
            }
            chars.next();
        }
    }

    out.push_text(&decode_entities(&text));
    out.finish()
}

/// Normalizes line breaks and horizontal whitespace, then trims.
fn normalize_whitespace(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");

    let lines: Vec<String> = unified
        .split('\n')
        .map(collapse_horizontal)
        .filter(|line| !line.is_empty())
        .collect();

    lines.join("\n").trim().to_string()
}

/// Collapses runs of spaces/tabs to one space and drops them at both ends.
fn collapse_horizontal(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut pending_space = false;

    for ch in line.chars() {
        if ch == ' ' || ch == '\t' {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }

    out
}
