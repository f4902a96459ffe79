//! The row-store interface consumed by the data-access layer.

use async_trait::async_trait;

use crate::{FetchOptions, Filters, Row, StoreError, UpsertOptions};

/// A remote relational store addressed by table name and column-equality
/// filters.
///
/// Implementations perform exactly one network call per method and never
/// retry; retries, timeouts and caching live in [`crate::DataAccess`].
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Select rows matching `filters`, shaped by `options.select`,
    /// `options.order` and `options.limit`.
    async fn fetch(
        &self,
        table: &str,
        filters: &Filters,
        options: &FetchOptions,
    ) -> Result<Vec<Row>, StoreError>;

    /// Select at most one row matching `filters`.
    async fn fetch_single(&self, table: &str, filters: &Filters)
    -> Result<Option<Row>, StoreError>;

    /// Insert a row and return it as stored.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError>;

    /// Merge `updates` into the row with the given id. `None` if no such row.
    async fn update(&self, table: &str, id: &str, updates: Row)
    -> Result<Option<Row>, StoreError>;

    /// Delete every row matching `filters`.
    async fn delete(&self, table: &str, filters: &Filters) -> Result<(), StoreError>;

    /// Insert a row, or merge into the existing row that matches on the
    /// conflict column.
    async fn upsert(
        &self,
        table: &str,
        row: Row,
        options: &UpsertOptions,
    ) -> Result<Row, StoreError>;
}
