use async_trait::async_trait;

use super::search::{SearchPage, SearchSpec};
use super::types::{Feed, Item, SaveReport, StoreError};

/// Durable storage for feeds and items.
///
/// Implementations serialize conflicting writes themselves; callers hold no
/// locks. Inserts are conflict-ignore: writing a feed or item whose id
/// already exists leaves the stored record untouched and is not an error.
///
/// Feeds and items are shared records. Calls taking a `subject` scope what
/// that caller sees: `None` is the unscoped view (every feed, the shared
/// read flag), `Some` limits feeds to the subject's subscriptions and reads
/// and writes the subject's own read marks. A [`SearchSpec`] carries its
/// subject itself.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Fails with [`StoreError::FeedNotFound`] if absent.
    async fn get_feed(&self, id: &str) -> Result<Feed, StoreError>;

    /// Absence is `Ok(None)`, not an error.
    async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError>;

    /// Every feed, or only those `subject` subscribes to. Ordered by title,
    /// then id.
    async fn list_feeds(&self, subject: Option<&str>) -> Result<Vec<Feed>, StoreError>;

    /// Inserts the feed's metadata unless its id is already stored, and
    /// returns the id either way. An empty id is filled in from the URL.
    /// With a subject, also subscribes it to the feed.
    async fn save_feed(&self, feed: &Feed, subject: Option<&str>) -> Result<String, StoreError>;

    /// Overwrites url, title, description and last-fetch time.
    /// Fails with [`StoreError::FeedNotFound`] if absent.
    async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError>;

    /// Without a subject, removes the feed, every item whose `feed_id` names
    /// it, and all subscriptions to it. With a subject, only that subject's
    /// subscription is dropped. Unknown ids are a no-op either way.
    async fn delete_feed(&self, id: &str, subject: Option<&str>) -> Result<(), StoreError>;

    /// Inserts each item under `feed_id`, in order, ignoring ids that already
    /// exist. A failure on one item is recorded in the report and does not
    /// stop the rest.
    async fn save_items(&self, feed_id: &str, items: &[Item]) -> Result<SaveReport, StoreError>;

    /// The item with `is_read` as seen by `subject`.
    /// Fails with [`StoreError::ItemNotFound`] if absent.
    async fn get_item(&self, id: &str, subject: Option<&str>) -> Result<Item, StoreError>;

    /// Persists the item's read status, shared or for `subject` only.
    /// Content fields are immutable once stored.
    /// Fails with [`StoreError::ItemNotFound`] if absent.
    async fn update_item(&self, item: &Item, subject: Option<&str>) -> Result<(), StoreError>;

    async fn search_items(&self, spec: &SearchSpec) -> Result<SearchPage, StoreError>;

    /// Deletes every feed, item, subscription and read mark.
    async fn nuke(&self) -> Result<(), StoreError>;
}
