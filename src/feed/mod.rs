//! Feed retrieval and RSS decoding.
//!
//! - `parser` turns an RSS 2.0 document into channel metadata plus
//!   normalized items (sanitized descriptions, UTC publication dates)
//! - `fetcher` retrieves documents over HTTP with a timeout, a size cap
//!   and cooperative cancellation
//!
//! Identity is not assigned here. Feed and item ids are derived from their
//! URLs when the ingestion layer persists them.
//!
//! # Example
//!
//! ```no_run
//! use feedkeep::feed::FeedFetcher;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = FeedFetcher::new(Duration::from_secs(30), 10 * 1024 * 1024, "feedkeep", false)?;
//! let feed = fetcher
//!     .fetch("https://example.com/rss.xml", &CancellationToken::new())
//!     .await?;
//! println!("{} items", feed.items.len());
//! # Ok(())
//! # }
//! ```

mod fetcher;
mod parser;

pub use fetcher::{FeedFetcher, FetchError, DEFAULT_MAX_FEED_SIZE, DEFAULT_TIMEOUT};
pub use parser::{parse_feed, ParseError, ParsedFeed, ParsedItem};

use thiserror::Error;

/// Failure to obtain a usable feed document.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}
