use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::util::{clean_description, parse_pub_date};

/// Maximum element nesting accepted inside an RSS document.
const MAX_DEPTH: usize = 64;

/// Errors that make a feed document unusable as a whole.
///
/// Individual items with unreadable dates are not errors; they are skipped
/// and counted in [`ParsedFeed::skipped`].
#[derive(Debug, Error)]
pub enum ParseError {
    /// The bytes are not well-formed XML.
    #[error("Malformed XML: {0}")]
    Xml(String),
    /// Well-formed XML whose root element is not `<rss>`.
    #[error("Not an RSS document (root element <{0}>)")]
    NotRss(String),
    /// An `<rss>` root without a `<channel>`.
    #[error("RSS document has no <channel>")]
    MissingChannel,
    /// Nesting deeper than [`MAX_DEPTH`].
    #[error("Element nesting exceeds maximum of {0} levels")]
    TooDeep(usize),
}

/// Channel metadata and the items that survived normalization.
///
/// The feed id is not assigned here; it is derived from the subscription URL
/// when the feed is persisted.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<ParsedItem>,
    /// Items dropped because their publication date could not be read.
    pub skipped: usize,
}

/// A single normalized `<item>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: String,
    pub category: String,
    pub comments: String,
    pub source: String,
    pub pub_date: DateTime<Utc>,
}

/// Raw, un-normalized item fields as they appear in the document.
#[derive(Debug, Default)]
struct RawItem {
    title: String,
    link: String,
    description: String,
    author: String,
    categories: Vec<String>,
    comments: String,
    source: String,
    pub_date: String,
}

impl RawItem {
    fn set(&mut self, field: &str, value: String) {
        match field {
            "title" => self.title = value,
            "link" => keep_first_nonempty(&mut self.link, value),
            "description" => self.description = value,
            "author" => self.author = value,
            "category" => self.categories.push(value),
            "comments" => self.comments = value,
            "source" => self.source = value,
            "pubDate" => self.pub_date = value,
            _ => {}
        }
    }

    /// Normalizes the item, or `None` when its date is unreadable.
    fn normalize(self) -> Option<ParsedItem> {
        let pub_date = match parse_pub_date(&self.pub_date) {
            Ok(date) => date,
            Err(e) => {
                tracing::warn!(
                    link = %self.link.trim(),
                    error = %e,
                    "Skipping item with unparseable publication date"
                );
                return None;
            }
        };

        let category = self
            .categories
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        Some(ParsedItem {
            title: self.title.trim().to_string(),
            link: self.link.trim().to_string(),
            description: clean_description(&self.description),
            author: self.author.trim().to_string(),
            category,
            comments: self.comments.trim().to_string(),
            source: self.source.trim().to_string(),
            pub_date,
        })
    }
}

fn keep_first_nonempty(slot: &mut String, value: String) {
    if slot.trim().is_empty() {
        *slot = value;
    }
}

/// Where the reader currently is in the RSS tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Document,
    Rss,
    Channel,
    Item,
    /// Inside an element this parser does not care about
    Other,
}

/// Text of a field element being collected, including nested markup.
struct Capture {
    field: String,
    /// Stack depth at which the field element was opened
    depth: usize,
    text: String,
}

/// Decodes an RSS 2.0 document into a [`ParsedFeed`].
///
/// Only direct children of `<channel>` and `<item>` are read; everything else
/// (images, enclosures, extension namespaces) is ignored. Element names are
/// matched exactly, so prefixed extensions such as `<dc:creator>` or
/// `<atom:link>` never shadow the plain RSS fields.
///
/// Each item runs through the date normalizer and the text sanitizer. Items
/// whose publication date cannot be read are logged and skipped; the rest of
/// the document is unaffected.
///
/// # Errors
///
/// - [`ParseError::Xml`] for malformed XML
/// - [`ParseError::NotRss`] when the root element is not `<rss>`
/// - [`ParseError::MissingChannel`] when there is no `<channel>`
///
/// # Security
///
/// quick-xml 0.37 never expands `<!ENTITY>` declarations. A reference to a
/// custom entity inside a captured field fails to unescape and the document
/// is rejected with [`ParseError::Xml`].
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let mut reader = Reader::from_reader(bytes);

    let mut feed = ParsedFeed::default();
    let mut saw_channel = false;
    let mut scopes: Vec<Scope> = Vec::new();
    let mut item: Option<RawItem> = None;
    let mut capture: Option<Capture> = None;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::Xml(e.to_string()))?;

        match event {
            Event::Start(e) => {
                if scopes.len() >= MAX_DEPTH {
                    return Err(ParseError::TooDeep(MAX_DEPTH));
                }
                let name = element_name(&e);

                if let Some(cap) = capture.as_mut() {
                    cap.text.push('<');
                    cap.text.push_str(&name);
                    cap.text.push('>');
                    scopes.push(Scope::Other);
                    continue;
                }

                let parent = scopes.last().copied().unwrap_or(Scope::Document);
                let scope = match (parent, name.as_str()) {
                    (Scope::Document, "rss") => Scope::Rss,
                    (Scope::Document, other) => return Err(ParseError::NotRss(other.to_string())),
                    (Scope::Rss, "channel") if !saw_channel => {
                        saw_channel = true;
                        Scope::Channel
                    }
                    (Scope::Channel, "item") => {
                        item = Some(RawItem::default());
                        Scope::Item
                    }
                    (Scope::Channel, field) | (Scope::Item, field) if is_text_field(parent, field) => {
                        capture = Some(Capture {
                            field: field.to_string(),
                            depth: scopes.len(),
                            text: String::new(),
                        });
                        Scope::Other
                    }
                    _ => Scope::Other,
                };
                scopes.push(scope);
            }
            Event::Empty(e) => {
                if let Some(cap) = capture.as_mut() {
                    cap.text.push('<');
                    cap.text.push_str(&element_name(&e));
                    cap.text.push_str("/>");
                } else if scopes.is_empty() {
                    let name = element_name(&e);
                    if name != "rss" {
                        return Err(ParseError::NotRss(name));
                    }
                    return Err(ParseError::MissingChannel);
                }
            }
            Event::Text(t) => {
                if let Some(cap) = capture.as_mut() {
                    let text = t.unescape().map_err(|e| ParseError::Xml(e.to_string()))?;
                    cap.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(cap) = capture.as_mut() {
                    cap.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(e) => {
                let closed = scopes.pop();

                if let Some(cap) = capture.as_mut() {
                    if scopes.len() > cap.depth {
                        cap.text.push_str("</");
                        cap.text.push_str(&String::from_utf8_lossy(e.name().as_ref()));
                        cap.text.push('>');
                        continue;
                    }
                }

                if let Some(cap) = capture.take() {
                    match (scopes.last(), item.as_mut()) {
                        (Some(Scope::Item), Some(raw)) => raw.set(&cap.field, cap.text),
                        (Some(Scope::Channel), _) => set_channel_field(&mut feed, &cap.field, cap.text),
                        _ => {}
                    }
                    continue;
                }

                if closed == Some(Scope::Item) {
                    match item.take().and_then(RawItem::normalize) {
                        Some(parsed) => feed.items.push(parsed),
                        None => feed.skipped += 1,
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_channel {
        return Err(ParseError::MissingChannel);
    }
    if !scopes.is_empty() {
        return Err(ParseError::Xml("unexpected end of document".to_string()));
    }

    feed.title = feed.title.trim().to_string();
    feed.link = feed.link.trim().to_string();
    feed.description = clean_description(&feed.description);

    Ok(feed)
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn is_text_field(scope: Scope, name: &str) -> bool {
    match scope {
        Scope::Channel => matches!(name, "title" | "link" | "description"),
        Scope::Item => matches!(
            name,
            "title" | "link" | "description" | "author" | "category" | "comments" | "source" | "pubDate"
        ),
        _ => false,
    }
}

fn set_channel_field(feed: &mut ParsedFeed, field: &str, value: String) {
    match field {
        "title" => feed.title = value,
        "link" => keep_first_nonempty(&mut feed.link, value),
        "description" => feed.description = value,
        _ => {}
    }
}
