//! Ingestion coordinator: adding feeds, refreshing them, and read-state
//! mutations, on top of a [`FeedStore`].
//!
//! The coordinator never holds a lock across a network call. The store is
//! the only shared mutable resource and serializes conflicting writes
//! itself; conflict-ignore item inserts make concurrent ingestion of the
//! same feed safe.

mod refresh;

pub use refresh::{FeedRefresh, RefreshOutcome, RefreshReport};

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::feed::{FeedError, FeedFetcher};
use crate::storage::{Feed, FeedStore, Item, SaveReport, SearchPage, SearchSpec, StoreError};
use crate::util::{validate_feed_url, UrlValidationError};

/// Failure of a coordinator operation.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    InvalidUrl(#[from] UrlValidationError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// True when the requested feed or item does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IngestError::Store(e) if e.is_not_found())
    }
}

/// Result of [`Ingestor::add_feed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddFeedReport {
    pub feed_id: String,
    /// False when the URL was already subscribed and nothing was fetched
    pub created: bool,
    pub items: SaveReport,
    /// Source items dropped for an unparseable publication date
    pub skipped_items: usize,
}

/// Orchestrates fetch, normalization and persistence.
///
/// Cloning is cheap; clones share the store and HTTP client.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn FeedStore>,
    fetcher: FeedFetcher,
    subject: Option<String>,
    allow_private_hosts: bool,
    min_refresh_interval: Duration,
    refresh_concurrency: usize,
}

impl Ingestor {
    /// A coordinator with the permissive defaults: public hosts only, no
    /// refresh interval gate, sequential refresh.
    pub fn new(store: Arc<dyn FeedStore>, fetcher: FeedFetcher) -> Self {
        Self {
            store,
            fetcher,
            subject: None,
            allow_private_hosts: false,
            min_refresh_interval: Duration::ZERO,
            refresh_concurrency: 1,
        }
    }

    /// Permits feed URLs on loopback and private networks.
    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    /// Feeds fetched more recently than `interval` are skipped by
    /// [`Ingestor::refresh_all`].
    pub fn min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Maximum number of feeds refreshed at once. Zero is treated as one.
    pub fn refresh_concurrency(mut self, concurrency: usize) -> Self {
        self.refresh_concurrency = concurrency.max(1);
        self
    }

    /// A view of this coordinator acting for `subject`: feeds it adds are
    /// subscribed for that subject, listings and refreshes cover only its
    /// subscriptions, and read state is its own. Shares the store and client.
    pub fn for_subject(&self, subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            ..self.clone()
        }
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn store(&self) -> &Arc<dyn FeedStore> {
        &self.store
    }

    /// Subscribes to the feed at `url` and stores its current items.
    ///
    /// Adding a URL that is already stored returns the existing id without
    /// any network I/O, subscribing the current subject if there is one.
    /// Items already stored (from any feed) are left untouched. Item
    /// persistence failures, down to the whole batch, are reported in
    /// [`AddFeedReport::items`] rather than raised; the next refresh stores
    /// what was missed.
    ///
    /// # Errors
    ///
    /// - [`IngestError::InvalidUrl`] if `url` is not an acceptable feed URL
    /// - [`IngestError::Feed`] if retrieval or decoding fails
    /// - [`IngestError::Store`] if the feed record cannot be written
    pub async fn add_feed(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<AddFeedReport, IngestError> {
        if let Some(existing) = self.store.get_feed_by_url(url).await? {
            if self.subject.is_some() {
                self.store.save_feed(&existing, self.subject()).await?;
            }
            tracing::debug!(feed = %url, id = %existing.id, "Feed already stored");
            return Ok(AddFeedReport {
                feed_id: existing.id,
                created: false,
                items: SaveReport::default(),
                skipped_items: 0,
            });
        }

        validate_feed_url(url, self.allow_private_hosts)?;

        let parsed = self.fetcher.fetch(url, cancel).await?;
        let feed = Feed::from_parsed(url, &parsed, now());
        let feed_id = self.store.save_feed(&feed, self.subject()).await?;

        let items: Vec<Item> = parsed
            .items
            .into_iter()
            .map(|item| Item::from_parsed(&feed_id, item))
            .collect();
        let report = match self.store.save_items(&feed_id, &items).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(feed = %url, error = %e, "Failed to save feed items, next refresh will retry");
                SaveReport::all_failed(&items, &e.to_string())
            }
        };

        tracing::info!(
            feed = %url,
            id = %feed_id,
            inserted = report.inserted,
            ignored = report.ignored,
            failed = report.failed.len(),
            skipped = parsed.skipped,
            "Feed added"
        );

        Ok(AddFeedReport {
            feed_id,
            created: true,
            items: report,
            skipped_items: parsed.skipped,
        })
    }

    /// Sets the read status of one item, for the current subject only when
    /// there is one.
    ///
    /// # Errors
    ///
    /// [`IngestError::is_not_found`] holds if no item has that id.
    pub async fn mark_item_read(&self, id: &str, read: bool) -> Result<Item, IngestError> {
        let mut item = self.store.get_item(id, self.subject()).await?;
        item.is_read = read;
        self.store.update_item(&item, self.subject()).await?;
        Ok(item)
    }

    pub async fn get_feed(&self, id: &str) -> Result<Feed, IngestError> {
        Ok(self.store.get_feed(id).await?)
    }

    pub async fn get_item(&self, id: &str) -> Result<Item, IngestError> {
        Ok(self.store.get_item(id, self.subject()).await?)
    }

    pub async fn list_feeds(&self) -> Result<Vec<Feed>, IngestError> {
        Ok(self.store.list_feeds(self.subject()).await?)
    }

    pub async fn update_feed(&self, feed: &Feed) -> Result<(), IngestError> {
        Ok(self.store.update_feed(feed).await?)
    }

    /// Removes the feed and its items, or with a subject only unsubscribes
    /// it. Unknown ids are a no-op.
    pub async fn delete_feed(&self, id: &str) -> Result<(), IngestError> {
        Ok(self.store.delete_feed(id, self.subject()).await?)
    }

    /// Never fails for "no matches"; an empty page has `total == 0`.
    ///
    /// The current subject, if any, replaces the one in `spec`.
    pub async fn search_items(&self, spec: &SearchSpec) -> Result<SearchPage, IngestError> {
        match &self.subject {
            Some(subject) if spec.subject.as_ref() != Some(subject) => {
                let scoped = SearchSpec {
                    subject: Some(subject.clone()),
                    ..spec.clone()
                };
                Ok(self.store.search_items(&scoped).await?)
            }
            _ => Ok(self.store.search_items(spec).await?),
        }
    }

    /// Deletes every feed and item.
    pub async fn nuke(&self) -> Result<(), IngestError> {
        self.store.nuke().await?;
        tracing::info!("All feeds and items deleted");
        Ok(())
    }
}

/// Current instant at whole-second precision, matching stored timestamps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}
