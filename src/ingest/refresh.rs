use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{now, IngestError, Ingestor};
use crate::storage::{Feed, Item, SaveReport};
use crate::util::validate_feed_url;

/// What happened to one feed during [`Ingestor::refresh_all`].
#[derive(Debug)]
pub enum RefreshOutcome {
    /// Fetched too recently for the configured interval
    Skipped,
    /// The refresh was cancelled before this feed was attempted
    Cancelled,
    /// Metadata updated and items saved
    Refreshed(SaveReport),
    Failed(IngestError),
}

#[derive(Debug)]
pub struct FeedRefresh {
    pub feed_id: String,
    pub url: String,
    pub outcome: RefreshOutcome,
}

/// Per-feed outcomes of a refresh pass, in completion order.
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub outcomes: Vec<FeedRefresh>,
}

impl RefreshReport {
    pub fn refreshed(&self) -> usize {
        self.count(|o| matches!(o, RefreshOutcome::Refreshed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RefreshOutcome::Skipped | RefreshOutcome::Cancelled))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RefreshOutcome::Failed(_)))
    }

    /// New items across all refreshed feeds.
    pub fn inserted(&self) -> usize {
        self.outcomes
            .iter()
            .map(|r| match &r.outcome {
                RefreshOutcome::Refreshed(report) => report.inserted,
                _ => 0,
            })
            .sum()
    }

    fn count(&self, pred: impl Fn(&RefreshOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|r| pred(&r.outcome)).count()
    }
}

impl Ingestor {
    /// Re-fetches every subscribed feed that is due: all stored feeds, or the
    /// current subject's subscriptions.
    ///
    /// A feed's last-fetch time is advanced and persisted before its network
    /// request, so a failing feed still waits out the interval. One feed's
    /// failure never stops the others; failures are collected in the report.
    ///
    /// # Errors
    ///
    /// Only listing the feeds can fail the whole pass.
    pub async fn refresh_all(&self, cancel: &CancellationToken) -> Result<RefreshReport, IngestError> {
        let feeds = self.store.list_feeds(self.subject()).await?;
        if feeds.is_empty() {
            return Ok(RefreshReport::default());
        }

        let outcomes: Vec<FeedRefresh> = stream::iter(feeds)
            .map(|feed| self.refresh_feed(feed, cancel))
            .buffer_unordered(self.refresh_concurrency)
            .collect()
            .await;
        let report = RefreshReport { outcomes };

        tracing::info!(
            refreshed = report.refreshed(),
            skipped = report.skipped(),
            failed = report.failed(),
            inserted = report.inserted(),
            "Refresh complete"
        );
        Ok(report)
    }

    async fn refresh_feed(&self, feed: Feed, cancel: &CancellationToken) -> FeedRefresh {
        let feed_id = feed.id.clone();
        let url = feed.url.clone();

        let outcome = if cancel.is_cancelled() {
            RefreshOutcome::Cancelled
        } else if !is_due(feed.last_fetch, self.min_refresh_interval, now()) {
            tracing::debug!(feed = %url, last_fetch = %feed.last_fetch, "Feed not due for refresh");
            RefreshOutcome::Skipped
        } else {
            match self.refresh_due_feed(feed, cancel).await {
                Ok(report) => RefreshOutcome::Refreshed(report),
                Err(e) => {
                    tracing::warn!(feed = %url, error = %e, "Feed refresh failed");
                    RefreshOutcome::Failed(e)
                }
            }
        };

        FeedRefresh {
            feed_id,
            url,
            outcome,
        }
    }

    async fn refresh_due_feed(
        &self,
        mut feed: Feed,
        cancel: &CancellationToken,
    ) -> Result<SaveReport, IngestError> {
        // Stored URLs may predate the current host policy
        validate_feed_url(&feed.url, self.allow_private_hosts)?;

        feed.last_fetch = now();
        self.store.update_feed(&feed).await?;

        let parsed = self.fetcher.fetch(&feed.url, cancel).await?;

        feed.title = parsed.title.clone();
        feed.description = parsed.description.clone();
        self.store.update_feed(&feed).await?;

        let items: Vec<Item> = parsed
            .items
            .into_iter()
            .map(|item| Item::from_parsed(&feed.id, item))
            .collect();
        let report = self.store.save_items(&feed.id, &items).await?;

        tracing::debug!(
            feed = %feed.url,
            inserted = report.inserted,
            ignored = report.ignored,
            failed = report.failed.len(),
            "Feed refreshed"
        );
        Ok(report)
    }
}

/// A feed is due unless `last_fetch + interval` lies strictly after `now`.
fn is_due(last_fetch: DateTime<Utc>, interval: Duration, now: DateTime<Utc>) -> bool {
    let Ok(interval) = TimeDelta::from_std(interval) else {
        return false;
    };
    match last_fetch.checked_add_signed(interval) {
        Some(next) => next <= now,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{rss, serve, test_ingestor};
    use super::*;
    use crate::feed::{FeedError, FeedFetcher, FetchError};
    use crate::storage::{JsonFileStore, SqliteStore};
    use crate::storage::FeedStore;
    use crate::util::url_to_id;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DATE: &str = "Mon, 02 Jan 2006 15:04:05 GMT";

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_is_due_zero_interval_always_due() {
        assert!(is_due(at(100), Duration::ZERO, at(100)));
        assert!(!is_due(at(100), Duration::ZERO, at(50)));
    }

    #[test]
    fn test_is_due_boundary_is_inclusive() {
        let hour = Duration::from_secs(3600);
        assert!(!is_due(at(0), hour, at(3599)));
        assert!(is_due(at(0), hour, at(3600)));
        assert!(is_due(at(0), hour, at(7200)));
    }

    #[test]
    fn test_is_due_huge_interval_never_due() {
        assert!(!is_due(at(0), Duration::MAX, at(i32::MAX as i64)));
    }

    #[tokio::test]
    async fn test_refresh_with_no_feeds() {
        let ingestor = test_ingestor().await;
        let report = ingestor.refresh_all(&CancellationToken::new()).await.unwrap();
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_preserves_read_state() {
        let server = serve("/rss", rss(&[("https://x.com/1", DATE), ("https://x.com/2", DATE)])).await;
        let ingestor = test_ingestor().await;
        ingestor
            .add_feed(&format!("{}/rss", server.uri()), &CancellationToken::new())
            .await
            .unwrap();
        let id = url_to_id("https://x.com/1");
        ingestor.mark_item_read(&id, true).await.unwrap();

        let report = ingestor.refresh_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.refreshed(), 1);
        match &report.outcomes[0].outcome {
            RefreshOutcome::Refreshed(save) => {
                assert_eq!(save.inserted, 0);
                assert_eq!(save.ignored, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(ingestor.get_item(&id).await.unwrap().is_read);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_new_items_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[("https://x.com/1", DATE)])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        let updated = rss(&[("https://x.com/1", DATE), ("https://x.com/2", DATE)])
            .replace("<title>Test Feed</title>", "<title>Renamed Feed</title>");
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(ResponseTemplate::new(200).set_body_string(updated))
            .mount(&server)
            .await;
        let ingestor = test_ingestor().await;
        let added = ingestor
            .add_feed(&format!("{}/rss", server.uri()), &CancellationToken::new())
            .await
            .unwrap();

        let report = ingestor.refresh_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.inserted(), 1);
        assert_eq!(ingestor.get_feed(&added.feed_id).await.unwrap().title, "Renamed Feed");
        let item = ingestor.get_item(&url_to_id("https://x.com/2")).await.unwrap();
        assert_eq!(item.feed_id, added.feed_id);
    }

    #[tokio::test]
    async fn test_refresh_continues_after_failure() {
        let good = serve("/rss", rss(&[("https://x.com/1", DATE)])).await;
        let flaky = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[])))
            .up_to_n_times(1)
            .mount(&flaky)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&flaky)
            .await;

        let ingestor = test_ingestor().await;
        let cancel = CancellationToken::new();
        ingestor.add_feed(&format!("{}/rss", good.uri()), &cancel).await.unwrap();
        let flaky_id = ingestor
            .add_feed(&format!("{}/rss", flaky.uri()), &cancel)
            .await
            .unwrap()
            .feed_id;

        // Backdate so the failed refresh visibly advances last_fetch
        let mut feed = ingestor.get_feed(&flaky_id).await.unwrap();
        feed.last_fetch = at(1_000);
        ingestor.update_feed(&feed).await.unwrap();

        let report = ingestor.refresh_all(&cancel).await.unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.refreshed(), 1);
        assert_eq!(report.failed(), 1);
        let failed = report
            .outcomes
            .iter()
            .find(|r| r.feed_id == flaky_id)
            .unwrap();
        assert!(matches!(
            failed.outcome,
            RefreshOutcome::Failed(IngestError::Feed(FeedError::Fetch(FetchError::HttpStatus(500))))
        ));
        assert!(ingestor.get_feed(&flaky_id).await.unwrap().last_fetch > at(1_000));
    }

    #[tokio::test]
    async fn test_refresh_interval_gate_skips_recent_feeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[])))
            .expect(1)
            .mount(&server)
            .await;
        let ingestor = test_ingestor()
            .await
            .min_refresh_interval(Duration::from_secs(60 * 60));
        ingestor
            .add_feed(&format!("{}/rss", server.uri()), &CancellationToken::new())
            .await
            .unwrap();

        let report = ingestor.refresh_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.skipped(), 1);
        assert!(matches!(report.outcomes[0].outcome, RefreshOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_covers_every_feed() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("feeds.json")).await.unwrap();
        let fetcher = FeedFetcher::new(Duration::from_secs(5), 1024 * 1024, "feedkeep-test", true).unwrap();
        let ingestor = Ingestor::new(Arc::new(store), fetcher)
            .allow_private_hosts(true)
            .refresh_concurrency(4);
        let cancel = CancellationToken::new();
        let mut servers = Vec::new();
        for i in 0..6 {
            let link = format!("https://x.com/{i}");
            let server = serve("/rss", rss(&[(link.as_str(), DATE)])).await;
            ingestor.add_feed(&format!("{}/rss", server.uri()), &cancel).await.unwrap();
            servers.push(server);
        }

        let report = ingestor.refresh_all(&cancel).await.unwrap();

        assert_eq!(report.outcomes.len(), 6);
        assert_eq!(report.refreshed(), 6);
    }

    #[tokio::test]
    async fn test_refresh_revalidates_stored_url() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let fetcher = FeedFetcher::new(Duration::from_secs(5), 1024 * 1024, "feedkeep-test", false).unwrap();
        let ingestor = Ingestor::new(store.clone(), fetcher);
        let url = "http://127.0.0.1:9/rss";
        let feed = Feed {
            id: url_to_id(url),
            url: url.to_string(),
            title: "Imported".into(),
            description: String::new(),
            last_fetch: at(1_000),
        };
        store.save_feed(&feed, None).await.unwrap();

        let report = ingestor.refresh_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.failed(), 1);
        assert!(matches!(
            report.outcomes[0].outcome,
            RefreshOutcome::Failed(IngestError::InvalidUrl(_))
        ));
        // Refused before anything was written
        assert_eq!(ingestor.get_feed(&feed.id).await.unwrap().last_fetch, at(1_000));
    }

    #[tokio::test]
    async fn test_subject_refresh_covers_only_its_subscriptions() {
        let mine = serve("/rss", rss(&[("https://x.com/mine", DATE)])).await;
        let theirs = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[])))
            .expect(1)
            .mount(&theirs)
            .await;
        let ingestor = test_ingestor().await;
        let cancel = CancellationToken::new();
        let alice = ingestor.for_subject("alice");
        let bob = ingestor.for_subject("bob");
        alice.add_feed(&format!("{}/rss", mine.uri()), &cancel).await.unwrap();
        bob.add_feed(&format!("{}/rss", theirs.uri()), &cancel).await.unwrap();

        let report = alice.refresh_all(&cancel).await.unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].url, format!("{}/rss", mine.uri()));
    }

    #[tokio::test]
    async fn test_cancelled_refresh_attempts_nothing() {
        let server = serve("/rss", rss(&[])).await;
        let ingestor = test_ingestor().await;
        ingestor
            .add_feed(&format!("{}/rss", server.uri()), &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = ingestor.refresh_all(&cancel).await.unwrap();

        assert!(matches!(report.outcomes[0].outcome, RefreshOutcome::Cancelled));
        assert_eq!(report.refreshed(), 0);
    }
}
