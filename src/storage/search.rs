use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::convert::Infallible;
use std::str::FromStr;
use thiserror::Error;

use super::types::Item;
use crate::util::{end_of_day, parse_calendar_date, start_of_day};

// ============================================================================
// Limits
// ============================================================================

pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;

// ============================================================================
// Query Specification
// ============================================================================

/// Ordering of search results by publication date.
///
/// Equal dates are always ordered by item id ascending, whatever the direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// `"asc"` selects ascending order; anything else is descending.
impl FromStr for SortOrder {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s == "asc" { SortOrder::Asc } else { SortOrder::Desc })
    }
}

/// A multi-predicate item query. All predicates are ANDed.
///
/// `limit` and `offset` are stored as given and clamped when the query runs
/// (see [`effective_limit`](Self::effective_limit) and
/// [`effective_offset`](Self::effective_offset)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpec {
    /// Case-insensitive substring matched against title, description, author
    /// and category. Empty matches everything.
    ///
    /// Case folding covers ASCII letters only, the same as SQLite's `LIKE`:
    /// `rust` finds `RUST`, but `über` does not find `Über`.
    pub query: String,
    /// Only return items not yet marked read
    pub unread_only: bool,
    /// Restricts results to items delivered by feeds this subject subscribes
    /// to, with `is_read` and the unread filter using the subject's marks.
    /// Applied by the stores; [`search_items`] expects items already scoped.
    pub subject: Option<String>,
    /// Inclusive lower bound on `pub_date`
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `pub_date`
    pub to: Option<DateTime<Utc>>,
    pub sort: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

impl Default for SearchSpec {
    fn default() -> Self {
        Self {
            query: String::new(),
            unread_only: true,
            subject: None,
            from: None,
            to: None,
            sort: SortOrder::Desc,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl SearchSpec {
    /// `limit` clamped to `1..=100`.
    pub fn effective_limit(&self) -> i64 {
        self.limit.clamp(1, MAX_LIMIT)
    }

    /// `offset` clamped to `>= 0`.
    pub fn effective_offset(&self) -> i64 {
        self.offset.max(0)
    }

    /// Whether `item` satisfies every predicate (pagination aside).
    ///
    /// Text matching folds ASCII case only, the same way SQLite's `LIKE` does,
    /// so both stores agree on what matches.
    pub fn matches(&self, item: &Item) -> bool {
        if self.unread_only && item.is_read {
            return false;
        }
        if self.from.is_some_and(|from| item.pub_date < from) {
            return false;
        }
        if self.to.is_some_and(|to| item.pub_date > to) {
            return false;
        }
        if self.query.is_empty() {
            return true;
        }

        let needle = self.query.to_ascii_lowercase();
        [&item.title, &item.description, &item.author, &item.category]
            .iter()
            .any(|field| field.to_ascii_lowercase().contains(&needle))
    }

    /// Result ordering: `pub_date` in the requested direction, then id ascending.
    pub fn compare(&self, a: &Item, b: &Item) -> Ordering {
        let by_date = match self.sort {
            SortOrder::Asc => a.pub_date.cmp(&b.pub_date),
            SortOrder::Desc => b.pub_date.cmp(&a.pub_date),
        };
        by_date.then_with(|| a.id.cmp(&b.id))
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    pub items: Vec<Item>,
    /// Number of matches ignoring `limit` and `offset`
    pub total: u64,
}

/// Evaluates `spec` over an in-memory item set.
///
/// Filters, sorts, counts the full filtered set, then slices out the page.
pub fn search_items<'a, I>(items: I, spec: &SearchSpec) -> SearchPage
where
    I: IntoIterator<Item = &'a Item>,
{
    let mut matched: Vec<&Item> = items.into_iter().filter(|item| spec.matches(item)).collect();
    matched.sort_by(|a, b| spec.compare(a, b));

    let total = matched.len() as u64;
    let offset = usize::try_from(spec.effective_offset()).unwrap_or(usize::MAX);
    let limit = usize::try_from(spec.effective_limit()).unwrap_or(1);

    SearchPage {
        items: matched.into_iter().skip(offset).take(limit).cloned().collect(),
        total,
    }
}

// ============================================================================
// Textual Parameters
// ============================================================================

/// A search parameter that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {name}: {value:?}")]
pub struct InvalidSearchParam {
    pub name: &'static str,
    pub value: String,
}

/// Raw textual search parameters, as they arrive from a query string or CLI.
///
/// Absent and empty values take the defaults: unread only, no date bounds,
/// descending order, limit 10, offset 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub query: Option<String>,
    /// `"0"` disables the unread-only filter
    pub unread: Option<String>,
    pub subject: Option<String>,
    /// `YYYY-MM-DD`, from the start of that day
    pub from: Option<String>,
    /// `YYYY-MM-DD`, through the end of that day
    pub to: Option<String>,
    pub sort: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl SearchParams {
    /// Converts to a [`SearchSpec`] with defaults applied and numbers clamped.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSearchParam`] for an unreadable date or a
    /// non-integer limit/offset.
    pub fn into_spec(self) -> Result<SearchSpec, InvalidSearchParam> {
        let mut spec = SearchSpec {
            query: self.query.unwrap_or_default(),
            subject: self.subject.filter(|s| !s.is_empty()),
            ..SearchSpec::default()
        };

        if self.unread.as_deref() == Some("0") {
            spec.unread_only = false;
        }
        if let Some(from) = non_empty(&self.from) {
            let date = parse_calendar_date(from).map_err(|_| invalid("from date", from))?;
            spec.from = Some(start_of_day(date));
        }
        if let Some(to) = non_empty(&self.to) {
            let date = parse_calendar_date(to).map_err(|_| invalid("to date", to))?;
            spec.to = Some(end_of_day(date));
        }
        if let Some(sort) = non_empty(&self.sort) {
            // Infallible
            spec.sort = sort.parse().unwrap_or_default();
        }
        if let Some(limit) = non_empty(&self.limit) {
            let limit: i64 = limit.trim().parse().map_err(|_| invalid("limit", limit))?;
            spec.limit = limit.clamp(1, MAX_LIMIT);
        }
        if let Some(offset) = non_empty(&self.offset) {
            let offset: i64 = offset.trim().parse().map_err(|_| invalid("offset", offset))?;
            spec.offset = offset.max(0);
        }

        Ok(spec)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn invalid(name: &'static str, value: &str) -> InvalidSearchParam {
    InvalidSearchParam {
        name,
        value: value.to_string(),
    }
}
