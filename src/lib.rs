//! RSS ingestion, normalization, deduplication and search.
//!
//! Feeds are fetched and decoded by [`feed`], persisted through a
//! [`storage::FeedStore`] backend, and orchestrated by [`ingest::Ingestor`].
//! Feed and item ids are SHA-256 digests of their URLs, so re-ingesting the
//! same document never duplicates anything and never resets read state.
//!
//! # Example
//!
//! ```no_run
//! use feedkeep::config::Config;
//! use feedkeep::storage::SearchSpec;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::default();
//! let ingestor = config.ingestor(config.open_store().await?)?;
//!
//! let cancel = CancellationToken::new();
//! ingestor.add_feed("https://example.com/rss.xml", &cancel).await?;
//! ingestor.refresh_all(&cancel).await?;
//!
//! let page = ingestor.search_items(&SearchSpec::default()).await?;
//! println!("{} unread", page.total);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod feed;
pub mod ingest;
pub mod storage;
pub mod util;
