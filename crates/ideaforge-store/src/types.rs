//! Request shapes shared by row stores, the executor and the read cache.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single row as returned by the store: a JSON object.
pub type Row = Value;

/// Column-equality filters.
///
/// Backed by a sorted map so that two filter sets with the same constraints
/// encode identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filters(BTreeMap<String, Value>);

impl Filters {
    /// An empty filter set (matches every row).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter set with a single `id = value` constraint.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().eq("id", id.into())
    }

    /// Add a `column = value` constraint.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Whether `row` satisfies every constraint.
    pub fn matches(&self, row: &Row) -> bool {
        self.0
            .iter()
            .all(|(column, expected)| row.get(column).unwrap_or(&Value::Null) == expected)
    }
}

/// Result ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.ascending { "asc" } else { "desc" };
        write!(f, "{}.{}", self.column, dir)
    }
}

/// Options for a row-set read.
///
/// `select`, `order` and `limit` shape the request and are part of the cache
/// key. `cache_ttl` and `force` only steer the read cache.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Column projection, e.g. `"id,title,votes"`. `None` selects everything.
    pub select: Option<String>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
    /// Overrides the cache's default lifetime for this read.
    pub cache_ttl: Option<Duration>,
    /// Skip the cache and the in-flight ledger and always hit the store.
    pub force: bool,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.select = Some(columns.into());
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Options for an upsert.
#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    /// Column(s) that identify an existing row. Defaults to `id`.
    pub on_conflict: Option<String>,
    /// Leave an existing row untouched instead of merging into it.
    pub ignore_duplicates: bool,
}

impl UpsertOptions {
    pub fn on_conflict(column: impl Into<String>) -> Self {
        Self {
            on_conflict: Some(column.into()),
            ignore_duplicates: false,
        }
    }

    pub(crate) fn conflict_column(&self) -> &str {
        self.on_conflict.as_deref().unwrap_or("id")
    }
}

/// Which kind of row-store call an attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    FetchSingle,
    Insert,
    Update,
    Delete,
    Upsert,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::FetchSingle => "fetch_single",
            Stage::Insert => "insert",
            Stage::Update => "update",
            Stage::Delete => "delete",
            Stage::Upsert => "upsert",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read the `id` column of a row as a string.
pub fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filters_are_order_independent() {
        let a = Filters::new().eq("idea_id", "i1").eq("user_id", "u1");
        let b = Filters::new().eq("user_id", "u1").eq("idea_id", "i1");
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn filters_match_rows() {
        let row = json!({"id": "c1", "idea_id": "i1", "parent_comment_id": null});
        assert!(Filters::new().eq("idea_id", "i1").matches(&row));
        assert!(Filters::new().eq("parent_comment_id", Value::Null).matches(&row));
        assert!(!Filters::new().eq("idea_id", "i2").matches(&row));
        assert!(Filters::new().matches(&row));
    }

    #[test]
    fn order_display() {
        assert_eq!(Order::desc("created_at").to_string(), "created_at.desc");
        assert_eq!(Order::asc("votes").to_string(), "votes.asc");
    }
}
