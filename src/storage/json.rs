use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::search::{self, SearchPage, SearchSpec};
use super::store::FeedStore;
use super::types::{Feed, Item, SaveReport, StoreError};
use crate::util::url_to_id;

/// On-disk layout of the JSON store.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileData {
    feeds: BTreeMap<String, Feed>,
    items: BTreeMap<String, Item>,
    /// Item id to the feeds, other than its owner, that also delivered it
    deliveries: BTreeMap<String, BTreeSet<String>>,
    /// Subject to subscribed feed ids
    subscriptions: BTreeMap<String, BTreeSet<String>>,
    /// Subject to ids of items it has read
    reads: BTreeMap<String, BTreeSet<String>>,
}

impl FileData {
    fn subscribed(&self, subject: &str, feed_id: &str) -> bool {
        self.subscriptions
            .get(subject)
            .is_some_and(|feeds| feeds.contains(feed_id))
    }

    fn visible_to(&self, subject: &str, item: &Item) -> bool {
        self.subscribed(subject, &item.feed_id)
            || self
                .deliveries
                .get(&item.id)
                .is_some_and(|feeds| feeds.iter().any(|feed_id| self.subscribed(subject, feed_id)))
    }

    /// `item` with `is_read` taken from the subject's marks, or as stored.
    fn as_seen_by(&self, subject: Option<&str>, item: &Item) -> Item {
        let mut item = item.clone();
        if let Some(subject) = subject {
            item.is_read = self.reads.get(subject).is_some_and(|read| read.contains(&item.id));
        }
        item
    }
}

/// Flat-file [`FeedStore`] keeping everything in one JSON document.
///
/// Every write is a read-modify-write cycle under an exclusive lock,
/// finished by writing a temp file, syncing it and renaming it over the
/// target. Readers never observe a partial file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JsonFileStore {
    /// Opens the store at `path`, creating an empty document if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if an existing file is not a
    /// valid store document, [`StoreError::Io`] if it cannot be read or
    /// created.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            lock: RwLock::new(()),
        };

        let _guard = store.lock.write().await;
        match tokio::fs::metadata(&store.path).await {
            Ok(_) => {
                // Fail early on a corrupt document
                store.load().await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                store.persist(&FileData::default()).await?;
                tracing::debug!(path = %store.path.display(), "Created JSON feed store");
            }
            Err(e) => return Err(StoreError::Io(e)),
        }
        drop(_guard);

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<FileData, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileData::default()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(FileData::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Writes `data` to a fresh temp file beside the target, syncs it, and
    /// renames it into place.
    async fn persist(&self, data: &FileData) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(data)?;
        let temp_path = temp_path_for(&self.path);

        let result = write_and_rename(&temp_path, &self.path, &content).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        result.map_err(StoreError::Io)
    }

    async fn read<T>(&self, f: impl FnOnce(&FileData) -> T) -> Result<T, StoreError> {
        let _guard = self.lock.read().await;
        let data = self.load().await?;
        Ok(f(&data))
    }

    /// Runs `f` on the current document and persists the result if `f`
    /// succeeds. The write lock is held for the whole cycle.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut FileData) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let _guard = self.lock.write().await;
        let mut data = self.load().await?;
        let out = f(&mut data)?;
        self.persist(&data).await?;
        Ok(out)
    }
}

/// A temp path next to `target`, unique per call.
fn temp_path_for(target: &Path) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    target.with_extension(format!("tmp.{:016x}.{}", nanos, seq))
}

async fn write_and_rename(temp_path: &Path, target: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true) // Fails if the path exists (no symlink following)
        .open(temp_path)
        .await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    // On Windows, rename fails if destination exists
    #[cfg(windows)]
    if tokio::fs::try_exists(target).await.unwrap_or(false) {
        tokio::fs::remove_file(target).await?;
    }

    tokio::fs::rename(temp_path, target).await
}

#[async_trait]
impl FeedStore for JsonFileStore {
    async fn get_feed(&self, id: &str) -> Result<Feed, StoreError> {
        self.read(|data| data.feeds.get(id).cloned())
            .await?
            .ok_or_else(|| StoreError::FeedNotFound(id.to_string()))
    }

    async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        self.read(|data| data.feeds.values().find(|f| f.url == url).cloned())
            .await
    }

    async fn list_feeds(&self, subject: Option<&str>) -> Result<Vec<Feed>, StoreError> {
        let mut feeds = self
            .read(|data| {
                data.feeds
                    .values()
                    .filter(|feed| subject.map_or(true, |subject| data.subscribed(subject, &feed.id)))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await?;
        feeds.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        Ok(feeds)
    }

    async fn save_feed(&self, feed: &Feed, subject: Option<&str>) -> Result<String, StoreError> {
        let mut feed = feed.clone();
        if feed.id.is_empty() {
            feed.id = url_to_id(&feed.url);
        }
        let subject = subject.map(str::to_string);

        self.mutate(move |data| {
            let id = match data.feeds.values().find(|f| f.url == feed.url) {
                Some(existing) => existing.id.clone(),
                None => {
                    let id = feed.id.clone();
                    data.feeds.entry(id.clone()).or_insert(feed);
                    id
                }
            };
            if let Some(subject) = subject {
                data.subscriptions.entry(subject).or_default().insert(id.clone());
            }
            Ok(id)
        })
        .await
    }

    async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        let feed = feed.clone();
        self.mutate(move |data| match data.feeds.get_mut(&feed.id) {
            Some(stored) => {
                *stored = feed;
                Ok(())
            }
            None => Err(StoreError::FeedNotFound(feed.id)),
        })
        .await
    }

    async fn delete_feed(&self, id: &str, subject: Option<&str>) -> Result<(), StoreError> {
        let id = id.to_string();

        if let Some(subject) = subject {
            let subject = subject.to_string();
            return self
                .mutate(move |data| {
                    if let Some(feeds) = data.subscriptions.get_mut(&subject) {
                        feeds.remove(&id);
                    }
                    Ok(())
                })
                .await;
        }

        let removed = self
            .mutate(move |data| {
                data.feeds.remove(&id);
                let gone: BTreeSet<String> = data
                    .items
                    .values()
                    .filter(|item| item.feed_id == id)
                    .map(|item| item.id.clone())
                    .collect();
                data.items.retain(|item_id, _| !gone.contains(item_id));

                data.deliveries.retain(|item_id, feeds| {
                    feeds.remove(&id);
                    !feeds.is_empty() && !gone.contains(item_id)
                });
                for feeds in data.subscriptions.values_mut() {
                    feeds.remove(&id);
                }
                for read in data.reads.values_mut() {
                    read.retain(|item_id| !gone.contains(item_id));
                }
                Ok(gone.len())
            })
            .await?;
        tracing::debug!(items = removed, "Deleted feed");
        Ok(())
    }

    async fn save_items(&self, feed_id: &str, items: &[Item]) -> Result<SaveReport, StoreError> {
        if items.is_empty() {
            return Ok(SaveReport::default());
        }

        let feed_id = feed_id.to_string();
        let items = items.to_vec();
        self.mutate(move |data| {
            let mut report = SaveReport::default();
            for mut item in items {
                if let Some(stored) = data.items.get(&item.id) {
                    if stored.feed_id != feed_id {
                        data.deliveries
                            .entry(item.id.clone())
                            .or_default()
                            .insert(feed_id.clone());
                    }
                    report.ignored += 1;
                    continue;
                }
                item.feed_id = feed_id.clone();
                data.items.insert(item.id.clone(), item);
                report.inserted += 1;
            }
            Ok(report)
        })
        .await
    }

    async fn get_item(&self, id: &str, subject: Option<&str>) -> Result<Item, StoreError> {
        self.read(|data| data.items.get(id).map(|item| data.as_seen_by(subject, item)))
            .await?
            .ok_or_else(|| StoreError::ItemNotFound(id.to_string()))
    }

    async fn update_item(&self, item: &Item, subject: Option<&str>) -> Result<(), StoreError> {
        let id = item.id.clone();
        let is_read = item.is_read;
        let subject = subject.map(str::to_string);
        self.mutate(move |data| {
            let Some(stored) = data.items.get_mut(&id) else {
                return Err(StoreError::ItemNotFound(id));
            };
            match subject {
                None => stored.is_read = is_read,
                Some(subject) => {
                    let read = data.reads.entry(subject).or_default();
                    if is_read {
                        read.insert(id);
                    } else {
                        read.remove(&id);
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn search_items(&self, spec: &SearchSpec) -> Result<SearchPage, StoreError> {
        self.read(|data| match spec.subject.as_deref() {
            None => search::search_items(data.items.values(), spec),
            Some(subject) => {
                let scoped: Vec<Item> = data
                    .items
                    .values()
                    .filter(|item| data.visible_to(subject, item))
                    .map(|item| data.as_seen_by(Some(subject), item))
                    .collect();
                search::search_items(&scoped, spec)
            }
        })
        .await
    }

    async fn nuke(&self) -> Result<(), StoreError> {
        self.mutate(|data| {
            *data = FileData::default();
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn test_feed(url: &str) -> Feed {
        Feed {
            id: url_to_id(url),
            url: url.to_string(),
            title: format!("Feed at {url}"),
            description: String::new(),
            last_fetch: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    fn test_item(feed_id: &str, link: &str, secs: i64) -> Item {
        Item {
            id: url_to_id(link),
            feed_id: feed_id.to_string(),
            title: format!("Post {link}"),
            link: link.to_string(),
            description: "Body".into(),
            author: String::new(),
            category: String::new(),
            comments: String::new(),
            source: String::new(),
            pub_date: DateTime::from_timestamp(secs, 0).unwrap(),
            is_read: false,
        }
    }

    async fn test_store(dir: &tempfile::TempDir) -> JsonFileStore {
        JsonFileStore::open(dir.path().join("feeds.json")).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;

        assert!(store.path().exists());
        assert!(store.list_feeds(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeds.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_empty_file_treated_as_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeds.json");
        std::fs::write(&path, "\n").unwrap();

        let store = JsonFileStore::open(&path).await.unwrap();
        assert!(store.list_feeds(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_feed_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let mut feed = test_feed("https://example.com/rss");

        assert_eq!(store.save_feed(&feed, None).await.unwrap(), feed.id);
        assert_eq!(store.save_feed(&feed, None).await.unwrap(), feed.id);
        assert_eq!(store.list_feeds(None).await.unwrap().len(), 1);
        assert_eq!(store.get_feed_by_url(&feed.url).await.unwrap(), Some(feed.clone()));
        assert_eq!(store.get_feed_by_url("https://other.example.com").await.unwrap(), None);

        feed.title = "Renamed".into();
        store.update_feed(&feed).await.unwrap();
        assert_eq!(store.get_feed(&feed.id).await.unwrap().title, "Renamed");

        let ghost = test_feed("https://ghost.example.com/rss");
        assert!(store.update_feed(&ghost).await.unwrap_err().is_not_found());
        assert!(store.get_feed(&ghost.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_items_dedupe_and_keep_read_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let a = test_feed("https://a.example.com/rss");
        let b = test_feed("https://b.example.com/rss");
        store.save_feed(&a, None).await.unwrap();
        store.save_feed(&b, None).await.unwrap();

        let first = test_item(&a.id, "https://x.com/1", 100);
        store.save_items(&a.id, &[first.clone()]).await.unwrap();

        let mut read = store.get_item(&first.id, None).await.unwrap();
        read.is_read = true;
        store.update_item(&read, None).await.unwrap();

        let report = store
            .save_items(&b.id, &[test_item(&b.id, "https://x.com/1", 100), test_item(&b.id, "https://x.com/2", 200)])
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.ignored, 1);

        let stored = store.get_item(&first.id, None).await.unwrap();
        assert!(stored.is_read);
        assert_eq!(stored.feed_id, a.id);
    }

    #[tokio::test]
    async fn test_delete_feed_and_nuke() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let a = test_feed("https://a.example.com/rss");
        let b = test_feed("https://b.example.com/rss");
        store.save_feed(&a, None).await.unwrap();
        store.save_feed(&b, None).await.unwrap();
        store.save_items(&a.id, &[test_item(&a.id, "https://x.com/1", 1)]).await.unwrap();
        store.save_items(&b.id, &[test_item(&b.id, "https://x.com/2", 2)]).await.unwrap();

        store.delete_feed(&a.id, None).await.unwrap();
        assert!(store.get_item(&url_to_id("https://x.com/1"), None).await.unwrap_err().is_not_found());
        assert!(store.get_item(&url_to_id("https://x.com/2"), None).await.is_ok());

        store.nuke().await.unwrap();
        assert!(store.list_feeds(None).await.unwrap().is_empty());
        let all = SearchSpec {
            unread_only: false,
            ..SearchSpec::default()
        };
        assert_eq!(store.search_items(&all).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let feed = test_feed("https://example.com/rss");
        let item = test_item(&feed.id, "https://x.com/1", 1);
        {
            let store = test_store(&dir).await;
            store.save_feed(&feed, None).await.unwrap();
            store.save_items(&feed.id, &[item.clone()]).await.unwrap();
        }

        let reopened = test_store(&dir).await;
        assert_eq!(reopened.get_feed(&feed.id).await.unwrap(), feed);
        assert_eq!(reopened.get_item(&item.id, None).await.unwrap(), item);
    }

    #[tokio::test]
    async fn test_concurrent_writers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(test_store(&dir).await);
        let feed = test_feed("https://example.com/rss");
        store.save_feed(&feed, None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let feed_id = feed.id.clone();
            handles.push(tokio::spawn(async move {
                let item = test_item(&feed_id, &format!("https://x.com/{i}"), i);
                store.save_items(&feed_id, &[item]).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let all = SearchSpec {
            unread_only: false,
            limit: 100,
            ..SearchSpec::default()
        };
        assert_eq!(store.search_items(&all).await.unwrap().total, 16);

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name() != "feeds.json")
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    }
}
