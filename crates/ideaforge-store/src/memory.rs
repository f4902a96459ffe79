//! In-memory row store for tests and offline experiments.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::{FetchOptions, Filters, Row, RowStore, StoreError, UpsertOptions, row_id};

/// A [`RowStore`] backed by in-process tables.
///
/// Supports injected failures (returned, in order, before any real work) and
/// artificial latency so that overlapping requests can be observed.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    tables: DashMap<String, Vec<Row>>,
    failures: Mutex<VecDeque<StoreError>>,
    table_failures: Mutex<HashMap<String, VecDeque<StoreError>>>,
    write_failures: Mutex<HashMap<String, VecDeque<StoreError>>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed a table with rows.
    pub fn with_rows(self, table: &str, rows: impl IntoIterator<Item = Row>) -> Self {
        self.tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
        self
    }

    /// Make the next call fail with `err`. Failures queue up.
    pub fn fail_next(&self, err: StoreError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
    }

    /// Make the next call that touches `table` fail with `err`.
    pub fn fail_on(&self, table: &str, err: StoreError) {
        self.table_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .push_back(err);
    }

    /// Make the next insert, update, upsert or delete on `table` fail with
    /// `err`. Reads pass through.
    pub fn fail_write_on(&self, table: &str, err: StoreError) {
        self.write_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .push_back(err);
    }

    /// Drop every injected failure that has not fired yet.
    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.table_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.write_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Make the next `n` calls fail with `err`.
    pub fn fail_times(&self, n: usize, err: StoreError) {
        for _ in 0..n {
            self.fail_next(err.clone());
        }
    }

    /// Total number of calls made, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .get(table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    async fn begin_call(&self, table: &str, write: bool) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .or_else(|| {
                self.table_failures
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get_mut(table)
                    .and_then(VecDeque::pop_front)
            })
            .or_else(|| {
                if !write {
                    return None;
                }
                self.write_failures
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get_mut(table)
                    .and_then(VecDeque::pop_front)
            });
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn project(row: &Row, select: Option<&str>) -> Row {
    let Some(select) = select.filter(|s| s.trim() != "*") else {
        return row.clone();
    };
    let mut out = Map::new();
    for column in select.split(',').map(str::trim) {
        if let Some(value) = row.get(column) {
            out.insert(column.to_string(), value.clone());
        }
    }
    Value::Object(out)
}

fn merge(target: &mut Row, updates: &Row) {
    if let (Some(target), Some(updates)) = (target.as_object_mut(), updates.as_object()) {
        for (column, value) in updates {
            target.insert(column.clone(), value.clone());
        }
    }
}

fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(std::cmp::Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => std::cmp::Ordering::Equal,
        (Value::Null, _) => std::cmp::Ordering::Less,
        (_, Value::Null) => std::cmp::Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn fetch(
        &self,
        table: &str,
        filters: &Filters,
        options: &FetchOptions,
    ) -> Result<Vec<Row>, StoreError> {
        self.begin_call(table, false).await?;

        let mut rows: Vec<Row> = self
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filters.matches(r)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = &options.order {
            rows.sort_by(|a, b| {
                let ord = compare(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                );
                if order.ascending { ord } else { ord.reverse() }
            });
        }
        if let Some(limit) = options.limit {
            rows.truncate(limit);
        }

        Ok(rows
            .iter()
            .map(|r| project(r, options.select.as_deref()))
            .collect())
    }

    async fn fetch_single(
        &self,
        table: &str,
        filters: &Filters,
    ) -> Result<Option<Row>, StoreError> {
        self.begin_call(table, false).await?;

        Ok(self
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| filters.matches(r)).cloned()))
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, StoreError> {
        self.begin_call(table, true).await?;

        let Some(fields) = row.as_object_mut() else {
            return Err(StoreError::InvalidResponse(
                "rows must be JSON objects".to_string(),
            ));
        };
        if !fields.contains_key("id") {
            fields.insert(
                "id".to_string(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }

        let mut rows = self.tables.entry(table.to_string()).or_default();
        let id = row_id(&row).map(str::to_string);
        if rows.iter().any(|r| row_id(r).map(str::to_string) == id) {
            return Err(StoreError::Conflict {
                code: Some("23505".to_string()),
                message: format!(
                    "duplicate key value violates unique constraint \"{}_pkey\"",
                    table
                ),
            });
        }
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        updates: Row,
    ) -> Result<Option<Row>, StoreError> {
        self.begin_call(table, true).await?;

        let Some(mut rows) = self.tables.get_mut(table) else {
            return Ok(None);
        };
        Ok(rows
            .iter_mut()
            .find(|r| row_id(r) == Some(id))
            .map(|row| {
                merge(row, &updates);
                row.clone()
            }))
    }

    async fn delete(&self, table: &str, filters: &Filters) -> Result<(), StoreError> {
        self.begin_call(table, true).await?;

        if let Some(mut rows) = self.tables.get_mut(table) {
            rows.retain(|r| !filters.matches(r));
        }
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        mut row: Row,
        options: &UpsertOptions,
    ) -> Result<Row, StoreError> {
        self.begin_call(table, true).await?;

        let column = options.conflict_column().to_string();
        if column == "id" && row.get("id").is_none() {
            if let Some(fields) = row.as_object_mut() {
                fields.insert(
                    "id".to_string(),
                    Value::String(uuid::Uuid::new_v4().to_string()),
                );
            }
        }
        let key = row.get(&column).cloned().unwrap_or(Value::Null);

        let mut rows = self.tables.entry(table.to_string()).or_default();
        if let Some(existing) = rows
            .iter_mut()
            .find(|r| r.get(&column).unwrap_or(&Value::Null) == &key)
        {
            if !options.ignore_duplicates {
                merge(existing, &row);
            }
            return Ok(existing.clone());
        }
        rows.push(row.clone());
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Order;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn fetch_filters_orders_and_limits() {
        let store = MemoryRowStore::new().with_rows(
            "ideas",
            [
                json!({"id": "a", "author_id": "u1", "votes": 3}),
                json!({"id": "b", "author_id": "u2", "votes": 9}),
                json!({"id": "c", "author_id": "u1", "votes": 7}),
            ],
        );

        let rows = store
            .fetch(
                "ideas",
                &Filters::new().eq("author_id", "u1"),
                &FetchOptions::new()
                    .order(Order::desc("votes"))
                    .select("id,votes")
                    .limit(5),
            )
            .await
            .unwrap();

        assert_eq!(
            rows,
            vec![json!({"id": "c", "votes": 7}), json!({"id": "a", "votes": 3})]
        );
    }

    #[tokio::test]
    async fn insert_assigns_id_and_rejects_duplicates() {
        let store = MemoryRowStore::new();
        let row = store.insert("ideas", json!({"title": "t"})).await.unwrap();
        let id = row_id(&row).unwrap().to_string();

        let err = store
            .insert("ideas", json!({"id": id, "title": "again"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.rows("ideas").len(), 1);
    }

    #[tokio::test]
    async fn update_merges_and_upsert_respects_conflict_column() {
        let store = MemoryRowStore::new()
            .with_rows("ideas", [json!({"id": "a", "votes": 1, "forks": 0})]);

        let updated = store
            .update("ideas", "a", json!({"votes": 2}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated, json!({"id": "a", "votes": 2, "forks": 0}));
        assert!(store.update("ideas", "zz", json!({})).await.unwrap().is_none());

        let options = UpsertOptions::on_conflict("id");
        store
            .upsert("ideas", json!({"id": "a", "forks": 1}), &options)
            .await
            .unwrap();
        store
            .upsert("ideas", json!({"id": "b", "votes": 0}), &options)
            .await
            .unwrap();
        assert_eq!(
            store.rows("ideas"),
            vec![
                json!({"id": "a", "votes": 2, "forks": 1}),
                json!({"id": "b", "votes": 0})
            ]
        );
    }

    #[tokio::test]
    async fn injected_failures_come_first() {
        let store = MemoryRowStore::new();
        store.fail_times(2, StoreError::Aborted("signal".into()));

        assert!(store.delete("ideas", &Filters::new()).await.is_err());
        assert!(store.delete("ideas", &Filters::new()).await.is_err());
        assert!(store.delete("ideas", &Filters::new()).await.is_ok());
        assert_eq!(store.call_count(), 3);
    }

    #[tokio::test]
    async fn table_failures_wait_for_their_table() {
        let store = MemoryRowStore::new();
        store.fail_on("notifications", StoreError::Aborted("signal".into()));

        assert!(store.insert("ideas", json!({"id": "a"})).await.is_ok());
        assert!(store.insert("notifications", json!({"id": "n"})).await.is_err());
        assert!(store.insert("notifications", json!({"id": "n"})).await.is_ok());
    }

    #[tokio::test]
    async fn write_failures_let_reads_through() {
        let store = MemoryRowStore::new().with_rows("ideas", [json!({"id": "a", "votes": 1})]);
        store.fail_write_on("ideas", StoreError::Aborted("signal".into()));

        assert!(store.fetch_single("ideas", &Filters::by_id("a")).await.is_ok());
        assert!(store.update("ideas", "a", json!({"votes": 2})).await.is_err());
        assert_eq!(store.rows("ideas"), vec![json!({"id": "a", "votes": 1})]);
        assert!(store.update("ideas", "a", json!({"votes": 2})).await.is_ok());

        store.fail_write_on("ideas", StoreError::Aborted("signal".into()));
        store.clear_failures();
        assert!(store.update("ideas", "a", json!({"votes": 3})).await.is_ok());
    }
}
