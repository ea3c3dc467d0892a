use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    QueryBuilder, Sqlite, SqliteConnection, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::search::{SearchPage, SearchSpec};
use super::store::FeedStore;
use super::types::{is_lock_message, Feed, FeedRow, Item, ItemFailure, ItemRow, SaveReport, StoreError};
use crate::util::url_to_id;

// ============================================================================
// SqliteStore
// ============================================================================

/// Relational [`FeedStore`] on SQLite.
///
/// Primary keys on `feeds.id` and `items.id` are the only concurrency
/// control: conflicting inserts become no-ops, metadata updates are
/// last-write-wins.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and runs migrations.
    ///
    /// `":memory:"` opens a private in-memory database shared by the pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process holds the database,
    /// [`StoreError::Migration`] if the schema cannot be created.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: wait up to 5 seconds for a competing writer
        // before failing with SQLITE_BUSY. Set per connection via pragma().
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StoreError::from_sqlx)?;

        let store = Self { pool };
        store.migrate().await.map_err(|e| {
            if is_lock_message(&e.to_string()) {
                StoreError::Locked
            } else {
                StoreError::Migration(e.to_string())
            }
        })?;

        tracing::debug!(path = %path, "Opened SQLite feed store");
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates tables and indexes atomically. Idempotent.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                last_fetch INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // feed_id is a soft reference with no FOREIGN KEY; delete_feed removes
        // the owned items explicitly.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                feed_id TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                link TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                comments TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL DEFAULT '',
                pub_date INTEGER NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Feeds other than the owner that also delivered an item
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deliveries (
                item_id TEXT NOT NULL,
                feed_id TEXT NOT NULL,
                PRIMARY KEY (item_id, feed_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                subject TEXT NOT NULL,
                feed_id TEXT NOT NULL,
                PRIMARY KEY (subject, feed_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // A row marks the item read for that subject
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS item_reads (
                subject TEXT NOT NULL,
                item_id TEXT NOT NULL,
                PRIMARY KEY (subject, item_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_feed ON items(feed_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_pub_date ON items(pub_date, id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_unread ON items(is_read, pub_date)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_deliveries_feed ON deliveries(feed_id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl FeedStore for SqliteStore {
    async fn get_feed(&self, id: &str) -> Result<Feed, StoreError> {
        let row: Option<FeedRow> =
            sqlx::query_as("SELECT id, url, title, description, last_fetch FROM feeds WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;

        row.map(FeedRow::into_feed)
            .ok_or_else(|| StoreError::FeedNotFound(id.to_string()))
    }

    async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        let row: Option<FeedRow> =
            sqlx::query_as("SELECT id, url, title, description, last_fetch FROM feeds WHERE url = ?")
                .bind(url)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;

        Ok(row.map(FeedRow::into_feed))
    }

    async fn list_feeds(&self, subject: Option<&str>) -> Result<Vec<Feed>, StoreError> {
        let rows: Vec<FeedRow> = match subject {
            None => {
                sqlx::query_as("SELECT id, url, title, description, last_fetch FROM feeds ORDER BY title, id")
                    .fetch_all(&self.pool)
                    .await
            }
            Some(subject) => {
                sqlx::query_as(
                    r#"
                    SELECT f.id, f.url, f.title, f.description, f.last_fetch
                    FROM feeds f
                    JOIN subscriptions s ON s.feed_id = f.id
                    WHERE s.subject = ?
                    ORDER BY f.title, f.id
                "#,
                )
                .bind(subject)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(StoreError::from_sqlx)?;

        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    async fn save_feed(&self, feed: &Feed, subject: Option<&str>) -> Result<String, StoreError> {
        let id = if feed.id.is_empty() {
            url_to_id(&feed.url)
        } else {
            feed.id.clone()
        };

        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        let result = sqlx::query(
            r#"
            INSERT INTO feeds (id, url, title, description, last_fetch)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
        "#,
        )
        .bind(&id)
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.description)
        .bind(feed.last_fetch.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        let id = if result.rows_affected() > 0 {
            id
        } else {
            // Already present, possibly under the same URL with another id
            let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM feeds WHERE url = ?")
                .bind(&feed.url)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
            existing.map(|(id,)| id).unwrap_or(id)
        };

        if let Some(subject) = subject {
            sqlx::query("INSERT INTO subscriptions (subject, feed_id) VALUES (?, ?) ON CONFLICT DO NOTHING")
                .bind(subject)
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
        }

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(id)
    }

    async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE feeds SET url = ?, title = ?, description = ?, last_fetch = ? WHERE id = ?",
        )
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.description)
        .bind(feed.last_fetch.timestamp())
        .bind(&feed.id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(feed.id.clone()));
        }
        Ok(())
    }

    async fn delete_feed(&self, id: &str, subject: Option<&str>) -> Result<(), StoreError> {
        if let Some(subject) = subject {
            sqlx::query("DELETE FROM subscriptions WHERE subject = ? AND feed_id = ?")
                .bind(subject)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;
            tracing::debug!(feed_id = %id, subject = %subject, "Unsubscribed from feed");
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        sqlx::query("DELETE FROM item_reads WHERE item_id IN (SELECT id FROM items WHERE feed_id = ?)")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;
        sqlx::query(
            "DELETE FROM deliveries WHERE feed_id = ? OR item_id IN (SELECT id FROM items WHERE feed_id = ?)",
        )
        .bind(id)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;
        let items = sqlx::query("DELETE FROM items WHERE feed_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;
        sqlx::query("DELETE FROM subscriptions WHERE feed_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;
        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;

        tx.commit().await.map_err(StoreError::from_sqlx)?;

        tracing::debug!(feed_id = %id, items = items.rows_affected(), "Deleted feed");
        Ok(())
    }

    async fn save_items(&self, feed_id: &str, items: &[Item]) -> Result<SaveReport, StoreError> {
        let mut report = SaveReport::default();
        if items.is_empty() {
            return Ok(report);
        }

        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        // One statement per item so a bad row only costs itself; SQLite rolls
        // back the failed statement, not the transaction.
        for item in items {
            let insert = sqlx::query(
                r#"
                INSERT INTO items (id, feed_id, title, link, description, author,
                                   category, comments, source, pub_date, is_read)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
            "#,
            )
            .bind(&item.id)
            .bind(feed_id)
            .bind(&item.title)
            .bind(&item.link)
            .bind(&item.description)
            .bind(&item.author)
            .bind(&item.category)
            .bind(&item.comments)
            .bind(&item.source)
            .bind(item.pub_date.timestamp())
            .bind(item.is_read)
            .execute(&mut *tx)
            .await;

            let inserted = match insert {
                Ok(done) if done.rows_affected() > 0 => Ok(true),
                Ok(_) => record_delivery(&mut *tx, &item.id, feed_id).await.map(|()| false),
                Err(e) => Err(e),
            };

            match inserted {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.ignored += 1,
                Err(e) => {
                    tracing::warn!(feed_id = %feed_id, link = %item.link, error = %e, "Failed to save item");
                    report.failed.push(ItemFailure {
                        item_id: item.id.clone(),
                        link: item.link.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(report)
    }

    async fn get_item(&self, id: &str, subject: Option<&str>) -> Result<Item, StoreError> {
        let mut query = select_items(subject);
        query.push(" WHERE id = ").push_bind(id.to_string());

        let row: Option<ItemRow> = query
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        row.map(ItemRow::into_item)
            .ok_or_else(|| StoreError::ItemNotFound(id.to_string()))
    }

    async fn update_item(&self, item: &Item, subject: Option<&str>) -> Result<(), StoreError> {
        let Some(subject) = subject else {
            let result = sqlx::query("UPDATE items SET is_read = ? WHERE id = ?")
                .bind(item.is_read)
                .bind(&item.id)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::ItemNotFound(item.id.clone()));
            }
            return Ok(());
        };

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM items WHERE id = ?")
            .bind(&item.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        if exists.is_none() {
            return Err(StoreError::ItemNotFound(item.id.clone()));
        }

        let statement = if item.is_read {
            "INSERT INTO item_reads (subject, item_id) VALUES (?, ?) ON CONFLICT DO NOTHING"
        } else {
            "DELETE FROM item_reads WHERE subject = ? AND item_id = ?"
        };
        sqlx::query(statement)
            .bind(subject)
            .bind(&item.id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    async fn search_items(&self, spec: &SearchSpec) -> Result<SearchPage, StoreError> {
        let mut count_query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM items");
        push_filters(&mut count_query, spec);
        let (total,): (i64,) = count_query
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        let mut page_query = select_items(spec.subject.as_deref());
        push_filters(&mut page_query, spec);
        page_query
            .push(" ORDER BY pub_date ")
            .push(spec.sort.as_str().to_uppercase())
            .push(", id ASC LIMIT ")
            .push_bind(spec.effective_limit())
            .push(" OFFSET ")
            .push_bind(spec.effective_offset());

        let rows: Vec<ItemRow> = page_query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        Ok(SearchPage {
            items: rows.into_iter().map(ItemRow::into_item).collect(),
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn nuke(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;
        for table in ["item_reads", "subscriptions", "deliveries", "items", "feeds"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
        }
        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(())
    }
}

/// Notes that `feed_id` delivered an item some other feed already stored.
async fn record_delivery(conn: &mut SqliteConnection, item_id: &str, feed_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO deliveries (item_id, feed_id)
        SELECT id, ? FROM items WHERE id = ? AND feed_id <> ?
        ON CONFLICT DO NOTHING
    "#,
    )
    .bind(feed_id)
    .bind(item_id)
    .bind(feed_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// `SELECT` of every item column; `is_read` comes from `subject`'s marks
/// when a subject is given.
fn select_items(subject: Option<&str>) -> QueryBuilder<'static, Sqlite> {
    let mut query = QueryBuilder::new(
        "SELECT id, feed_id, title, link, description, author, category, comments, source, pub_date, ",
    );
    match subject {
        Some(subject) => {
            query
                .push("EXISTS (SELECT 1 FROM item_reads r WHERE r.item_id = items.id AND r.subject = ")
                .push_bind(subject.to_string())
                .push(") AS is_read");
        }
        None => {
            query.push("is_read");
        }
    }
    query.push(" FROM items");
    query
}

/// Appends the `WHERE` clause for `spec` (everything but ordering and paging).
fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, spec: &SearchSpec) {
    builder.push(" WHERE 1 = 1");

    if let Some(subject) = &spec.subject {
        // Owned by, or also delivered by, a subscribed feed
        builder
            .push(" AND EXISTS (SELECT 1 FROM subscriptions s WHERE s.subject = ")
            .push_bind(subject.clone())
            .push(
                " AND (s.feed_id = items.feed_id \
                 OR s.feed_id IN (SELECT d.feed_id FROM deliveries d WHERE d.item_id = items.id)))",
            );
    }
    if spec.unread_only {
        match &spec.subject {
            Some(subject) => {
                builder
                    .push(" AND NOT EXISTS (SELECT 1 FROM item_reads r WHERE r.item_id = items.id AND r.subject = ")
                    .push_bind(subject.clone())
                    .push(")");
            }
            None => {
                builder.push(" AND is_read = 0");
            }
        }
    }
    if let Some(from) = spec.from {
        builder.push(" AND pub_date >= ").push_bind(ceil_secs(from));
    }
    if let Some(to) = spec.to {
        builder.push(" AND pub_date <= ").push_bind(to.timestamp());
    }
    if !spec.query.is_empty() {
        let pattern = format!("%{}%", escape_like(&spec.query));
        let mut any = builder.separated(" OR ");
        any.push_unseparated(" AND (");
        for column in ["title", "description", "author", "category"] {
            any.push(format!("{column} LIKE "));
            any.push_bind_unseparated(pattern.clone());
            any.push_unseparated(" ESCAPE '\\'");
        }
        any.push_unseparated(")");
    }
}

/// Stored dates are whole seconds; a fractional lower bound rounds up.
fn ceil_secs(instant: DateTime<Utc>) -> i64 {
    if instant.timestamp_subsec_nanos() > 0 {
        instant.timestamp() + 1
    } else {
        instant.timestamp()
    }
}

/// Escapes `LIKE` wildcards so the query is matched literally.
fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
