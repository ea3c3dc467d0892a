//! Integration tests for per-subject subscriptions and read state, across
//! both store backends.
//!
//! Two feeds share one item: `a` stores it first, `b` delivers it again
//! later. Alice subscribes to `a`, Bob to `b`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use feedkeep::storage::{Feed, FeedStore, Item, JsonFileStore, SearchSpec, SqliteStore};
use feedkeep::util::url_to_id;
use pretty_assertions::assert_eq;

const FEED_A: &str = "https://a.example.com/rss";
const FEED_B: &str = "https://b.example.com/rss";
const SHARED: &str = "https://news.example.com/shared";

fn feed(url: &str) -> Feed {
    Feed {
        id: url_to_id(url),
        url: url.to_string(),
        title: format!("Feed {url}"),
        description: String::new(),
        last_fetch: DateTime::<Utc>::UNIX_EPOCH,
    }
}

fn item(feed_url: &str, link: &str, day: u32) -> Item {
    Item {
        id: url_to_id(link),
        feed_id: url_to_id(feed_url),
        title: format!("Post {link}"),
        link: link.to_string(),
        description: String::new(),
        author: String::new(),
        category: String::new(),
        comments: String::new(),
        source: String::new(),
        pub_date: DateTime::parse_from_rfc3339(&format!("2024-01-{day:02}T12:00:00Z"))
            .unwrap()
            .with_timezone(&Utc),
        is_read: false,
    }
}

struct Stores {
    stores: Vec<(&'static str, Arc<dyn FeedStore>)>,
    _dir: tempfile::TempDir,
}

async fn seeded_stores() -> Stores {
    let dir = tempfile::tempdir().unwrap();
    let sqlite: Arc<dyn FeedStore> = Arc::new(SqliteStore::open(":memory:").await.unwrap());
    let json: Arc<dyn FeedStore> =
        Arc::new(JsonFileStore::open(dir.path().join("feeds.json")).await.unwrap());

    for store in [&sqlite, &json] {
        let a = store.save_feed(&feed(FEED_A), Some("alice")).await.unwrap();
        let b = store.save_feed(&feed(FEED_B), Some("bob")).await.unwrap();
        store
            .save_items(&a, &[item(FEED_A, "https://a.example.com/1", 1), item(FEED_A, SHARED, 2)])
            .await
            .unwrap();
        let report = store
            .save_items(&b, &[item(FEED_B, SHARED, 2), item(FEED_B, "https://b.example.com/1", 3)])
            .await
            .unwrap();
        assert_eq!((report.inserted, report.ignored), (1, 1));
    }

    Stores {
        stores: vec![("sqlite", sqlite), ("json", json)],
        _dir: dir,
    }
}

fn search(subject: Option<&str>, unread_only: bool) -> SearchSpec {
    SearchSpec {
        subject: subject.map(str::to_string),
        unread_only,
        ..SearchSpec::default()
    }
}

async fn links(store: &Arc<dyn FeedStore>, spec: &SearchSpec) -> Vec<String> {
    let page = store.search_items(spec).await.unwrap();
    assert_eq!(page.total as usize, page.items.len());
    page.items.into_iter().map(|i| i.link).collect()
}

fn ids(feeds: &[Feed]) -> Vec<&str> {
    feeds.iter().map(|f| f.id.as_str()).collect()
}

#[tokio::test]
async fn test_feed_listing_follows_subscriptions() {
    let seeded = seeded_stores().await;
    let (a, b) = (url_to_id(FEED_A), url_to_id(FEED_B));

    for (name, store) in &seeded.stores {
        assert_eq!(ids(&store.list_feeds(Some("alice")).await.unwrap()), vec![a.as_str()], "{name}");
        assert_eq!(ids(&store.list_feeds(Some("bob")).await.unwrap()), vec![b.as_str()], "{name}");
        assert!(store.list_feeds(Some("carol")).await.unwrap().is_empty(), "{name}");
        assert_eq!(store.list_feeds(None).await.unwrap().len(), 2, "{name}");
    }
}

#[tokio::test]
async fn test_shared_item_visible_through_either_feed() {
    let seeded = seeded_stores().await;

    for (name, store) in &seeded.stores {
        assert_eq!(
            links(store, &search(Some("alice"), false)).await,
            vec![SHARED, "https://a.example.com/1"],
            "{name}"
        );
        assert_eq!(
            links(store, &search(Some("bob"), false)).await,
            vec!["https://b.example.com/1", SHARED],
            "{name}"
        );
        assert!(links(store, &search(Some("carol"), false)).await.is_empty(), "{name}");
        assert_eq!(links(store, &search(None, false)).await.len(), 3, "{name}");

        // Ownership stays with the first feed
        let shared = store.get_item(&url_to_id(SHARED), Some("bob")).await.unwrap();
        assert_eq!(shared.feed_id, url_to_id(FEED_A), "{name}");
    }
}

#[tokio::test]
async fn test_read_marks_are_per_subject() {
    let seeded = seeded_stores().await;
    let shared = url_to_id(SHARED);

    for (name, store) in &seeded.stores {
        let mut seen = store.get_item(&shared, Some("alice")).await.unwrap();
        assert!(!seen.is_read, "{name}");
        seen.is_read = true;
        store.update_item(&seen, Some("alice")).await.unwrap();

        assert!(store.get_item(&shared, Some("alice")).await.unwrap().is_read, "{name}");
        assert!(!store.get_item(&shared, Some("bob")).await.unwrap().is_read, "{name}");
        assert!(!store.get_item(&shared, None).await.unwrap().is_read, "{name}");

        assert_eq!(
            links(store, &search(Some("alice"), true)).await,
            vec!["https://a.example.com/1"],
            "{name}"
        );
        assert_eq!(
            links(store, &search(Some("bob"), true)).await,
            vec!["https://b.example.com/1", SHARED],
            "{name}"
        );
        assert_eq!(links(store, &search(None, true)).await.len(), 3, "{name}");

        seen.is_read = false;
        store.update_item(&seen, Some("alice")).await.unwrap();
        assert!(!store.get_item(&shared, Some("alice")).await.unwrap().is_read, "{name}");
    }
}

#[tokio::test]
async fn test_shared_read_flag_does_not_leak_into_subjects() {
    let seeded = seeded_stores().await;
    let shared = url_to_id(SHARED);

    for (name, store) in &seeded.stores {
        let mut item = store.get_item(&shared, None).await.unwrap();
        item.is_read = true;
        store.update_item(&item, None).await.unwrap();

        assert!(store.get_item(&shared, None).await.unwrap().is_read, "{name}");
        assert!(!store.get_item(&shared, Some("alice")).await.unwrap().is_read, "{name}");
    }
}

#[tokio::test]
async fn test_subject_mark_on_missing_item_is_not_found() {
    let seeded = seeded_stores().await;

    for (name, store) in &seeded.stores {
        let mut ghost = item(FEED_A, "https://a.example.com/ghost", 4);
        ghost.is_read = true;
        let err = store.update_item(&ghost, Some("alice")).await.unwrap_err();
        assert!(err.is_not_found(), "{name}");
    }
}

#[tokio::test]
async fn test_unsubscribe_keeps_shared_records() {
    let seeded = seeded_stores().await;
    let b = url_to_id(FEED_B);

    for (name, store) in &seeded.stores {
        store.delete_feed(&b, Some("bob")).await.unwrap();

        assert!(store.list_feeds(Some("bob")).await.unwrap().is_empty(), "{name}");
        assert!(links(store, &search(Some("bob"), false)).await.is_empty(), "{name}");
        assert_eq!(store.get_feed(&b).await.unwrap().url, FEED_B, "{name}");
        assert_eq!(links(store, &search(None, false)).await.len(), 3, "{name}");

        // Resubscribing is a plain insert
        store.save_feed(&feed(FEED_B), Some("bob")).await.unwrap();
        assert_eq!(links(store, &search(Some("bob"), false)).await.len(), 2, "{name}");
    }
}

#[tokio::test]
async fn test_global_delete_removes_subscriptions() {
    let seeded = seeded_stores().await;
    let a = url_to_id(FEED_A);

    for (name, store) in &seeded.stores {
        store.delete_feed(&a, None).await.unwrap();

        assert!(store.list_feeds(Some("alice")).await.unwrap().is_empty(), "{name}");
        assert!(store.get_item(&url_to_id(SHARED), None).await.unwrap_err().is_not_found(), "{name}");
        assert_eq!(
            links(store, &search(Some("bob"), false)).await,
            vec!["https://b.example.com/1"],
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_nuke_clears_subscriptions() {
    let seeded = seeded_stores().await;

    for (name, store) in &seeded.stores {
        store.nuke().await.unwrap();
        store.save_feed(&feed(FEED_A), None).await.unwrap();
        assert!(store.list_feeds(Some("alice")).await.unwrap().is_empty(), "{name}");
    }
}
