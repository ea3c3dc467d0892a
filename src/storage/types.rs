use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feed::{ParsedFeed, ParsedItem};
use crate::util::url_to_id;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by a [`FeedStore`](super::FeedStore) implementation.
///
/// Duplicate feeds and items are never errors; inserts on an existing id
/// are silent no-ops.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// Another process holds the store
    #[error("The feed store is locked by another process. Close it and try again.")]
    Locked,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migration(String),

    #[error("Store file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True for [`StoreError::FeedNotFound`] and [`StoreError::ItemNotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::FeedNotFound(_) | StoreError::ItemNotFound(_))
    }

    /// Maps lock contention to [`StoreError::Locked`], everything else to
    /// [`StoreError::Database`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return StoreError::Locked;
        }
        StoreError::Database(err)
    }
}

pub(crate) fn is_lock_message(message: &str) -> bool {
    // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Records
// ============================================================================

/// A subscribed feed.
///
/// `id` is [`url_to_id`] of `url` and never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub last_fetch: DateTime<Utc>,
}

impl Feed {
    /// A new feed record for `url` built from freshly fetched metadata.
    pub fn from_parsed(url: &str, parsed: &ParsedFeed, fetched_at: DateTime<Utc>) -> Self {
        Self {
            id: url_to_id(url),
            url: url.to_string(),
            title: parsed.title.clone(),
            description: parsed.description.clone(),
            last_fetch: fetched_at,
        }
    }
}

/// A single published entry, deduplicated globally by link.
///
/// `id` is [`url_to_id`] of `link`. `feed_id` names the feed that first
/// delivered the item; it is a plain reference, not ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: String,
    pub category: String,
    pub comments: String,
    pub source: String,
    pub pub_date: DateTime<Utc>,
    pub is_read: bool,
}

impl Item {
    /// Assigns identity and ownership to a parsed item. New items are unread.
    pub fn from_parsed(feed_id: &str, parsed: ParsedItem) -> Self {
        Self {
            id: url_to_id(&parsed.link),
            feed_id: feed_id.to_string(),
            title: parsed.title,
            link: parsed.link,
            description: parsed.description,
            author: parsed.author,
            category: parsed.category,
            comments: parsed.comments,
            source: parsed.source,
            pub_date: parsed.pub_date,
            is_read: false,
        }
    }
}

/// Outcome of a batch of conflict-ignore item inserts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReport {
    /// Items written for the first time
    pub inserted: usize,
    /// Items whose id already existed (from any feed)
    pub ignored: usize,
    /// Items that could not be written; the rest of the batch still was
    pub failed: Vec<ItemFailure>,
}

impl SaveReport {
    pub fn total(&self) -> usize {
        self.inserted + self.ignored + self.failed.len()
    }

    /// A report for a batch that could not be written at all.
    pub fn all_failed(items: &[Item], error: &str) -> Self {
        Self {
            failed: items
                .iter()
                .map(|item| ItemFailure {
                    item_id: item.id.clone(),
                    link: item.link.clone(),
                    error: error.to_string(),
                })
                .collect(),
            ..Self::default()
        }
    }
}

/// A single item that failed to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub link: String,
    pub error: String,
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub id: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub last_fetch: i64,
}

impl FeedRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            url: self.url,
            title: self.title,
            description: self.description,
            last_fetch: from_unix(self.last_fetch),
        }
    }
}

/// Internal row type for item queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemRow {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: String,
    pub category: String,
    pub comments: String,
    pub source: String,
    pub pub_date: i64,
    pub is_read: bool,
}

impl ItemRow {
    pub(crate) fn into_item(self) -> Item {
        Item {
            id: self.id,
            feed_id: self.feed_id,
            title: self.title,
            link: self.link,
            description: self.description,
            author: self.author,
            category: self.category,
            comments: self.comments,
            source: self.source,
            pub_date: from_unix(self.pub_date),
            is_read: self.is_read,
        }
    }
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
