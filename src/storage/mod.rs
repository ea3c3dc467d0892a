//! Persistent storage for feeds and items.
//!
//! Two interchangeable backends implement [`FeedStore`]:
//!
//! - [`SqliteStore`]: a SQLite database via sqlx, with search pushed into SQL.
//! - [`JsonFileStore`]: a single JSON document rewritten atomically on every
//!   change, searched in memory.
//!
//! Both return identical results for the same [`SearchSpec`].

mod json;
mod search;
mod sqlite;
mod store;
mod types;

pub use json::JsonFileStore;
pub use search::{
    search_items, InvalidSearchParam, SearchPage, SearchParams, SearchSpec, SortOrder,
    DEFAULT_LIMIT, MAX_LIMIT,
};
pub use sqlite::SqliteStore;
pub use store::FeedStore;
pub use types::{Feed, Item, ItemFailure, SaveReport, StoreError};
