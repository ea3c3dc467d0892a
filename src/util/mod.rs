//! Normalization helpers shared by ingestion and search.
//!
//! - **Text**: markup stripping and whitespace normalization for descriptions
//! - **Identity**: content-addressed ids for feeds and items
//! - **Dates**: tolerant publication-date parsing into UTC instants
//! - **URL validation**: scheme and SSRF checks on feed URLs
//!
//! # Examples
//!
//! ```
//! use feedkeep::util::{clean_description, parse_pub_date, url_to_id};
//!
//! let id = url_to_id("https://example.com/post/1");
//! assert_eq!(id.len(), 64);
//!
//! let text = clean_description("<p>Hello</p><p>world</p>");
//! assert_eq!(text, "Hello\nworld");
//!
//! assert!(parse_pub_date("Mon, 02 Jan 2006 15:04:05 GMT").is_ok());
//! ```

mod date;
mod identity;
mod text;
mod url_validator;

pub use date::{end_of_day, parse_calendar_date, parse_pub_date, start_of_day, DateParseError};
pub use identity::{url_to_id, ID_LEN};
pub use text::clean_description;
pub use url_validator::{validate_feed_url, UrlValidationError};
