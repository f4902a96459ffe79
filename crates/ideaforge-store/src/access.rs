//! The data-access facade: every row-store call goes through the executor,
//! reads go through the cache.

use std::sync::Arc;

use tracing::debug;

use crate::{
    CacheConfig, CacheKey, CacheStats, Diagnostics, ErrorRecord, ExecutorConfig, FetchOptions,
    Filters, ReadCache, RequestExecutor, Row, RowStore, Stage, StoreError, UpsertOptions,
};

/// Builder for [`DataAccess`].
pub struct DataAccessBuilder {
    store: Arc<dyn RowStore>,
    executor: ExecutorConfig,
    cache: CacheConfig,
    diagnostics: Option<Arc<Diagnostics>>,
}

impl DataAccessBuilder {
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Share a diagnostics channel with other components.
    pub fn diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn build(self) -> DataAccess {
        let diagnostics = self
            .diagnostics
            .unwrap_or_else(|| Arc::new(Diagnostics::new()));
        DataAccess {
            store: self.store,
            executor: Arc::new(RequestExecutor::new(self.executor, Arc::clone(&diagnostics))),
            cache: ReadCache::new(self.cache),
            diagnostics,
        }
    }
}

/// Resilient, cached access to a [`RowStore`].
///
/// The `try_*` methods return structured errors. The plain methods follow the
/// soft-failure contract: an empty collection, `None` or `false` on any
/// failure, with details left in [`DataAccess::last_error`].
pub struct DataAccess {
    store: Arc<dyn RowStore>,
    executor: Arc<RequestExecutor>,
    cache: ReadCache,
    diagnostics: Arc<Diagnostics>,
}

impl DataAccess {
    /// Wrap `store` with default executor and cache settings.
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn builder(store: Arc<dyn RowStore>) -> DataAccessBuilder {
        DataAccessBuilder {
            store,
            executor: ExecutorConfig::default(),
            cache: CacheConfig::default(),
            diagnostics: None,
        }
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop cached reads for `table`.
    pub fn invalidate(&self, table: &str) {
        self.cache.invalidate_table(table);
    }

    /// Most recent failure not yet cleared by a success on the same stage
    /// and table.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.diagnostics.last_error()
    }

    // =========================================================================
    // Structured API
    // =========================================================================

    pub async fn try_fetch_rows(
        &self,
        table: &str,
        filters: &Filters,
        options: &FetchOptions,
    ) -> Result<Vec<Row>, StoreError> {
        let key = CacheKey::rows(table, filters, options);

        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let owned_table = table.to_string();
        let owned_filters = filters.clone();
        let owned_options = options.clone();
        let fetch = async move {
            executor
                .execute(Stage::Fetch, &owned_table, || {
                    store.fetch(&owned_table, &owned_filters, &owned_options)
                })
                .await
        };

        let rows = self
            .cache
            .read(key, options.cache_ttl, options.force, fetch)
            .await?;
        Ok(rows.as_ref().clone())
    }

    pub async fn try_fetch_single(
        &self,
        table: &str,
        filters: &Filters,
        force: bool,
    ) -> Result<Option<Row>, StoreError> {
        let key = CacheKey::single(table, filters);

        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let owned_table = table.to_string();
        let owned_filters = filters.clone();
        let fetch = async move {
            let row = executor
                .execute(Stage::FetchSingle, &owned_table, || {
                    store.fetch_single(&owned_table, &owned_filters)
                })
                .await?;
            Ok::<Vec<Row>, StoreError>(row.into_iter().collect())
        };

        let rows = self.cache.read(key, None, force, fetch).await?;
        Ok(rows.first().cloned())
    }

    pub async fn try_insert_row(&self, table: &str, row: Row) -> Result<Row, StoreError> {
        let inserted = self
            .executor
            .execute(Stage::Insert, table, || self.store.insert(table, row.clone()))
            .await?;
        self.cache.invalidate_table(table);
        Ok(inserted)
    }

    pub async fn try_update_row(
        &self,
        table: &str,
        id: &str,
        updates: Row,
    ) -> Result<Option<Row>, StoreError> {
        let updated = self
            .executor
            .execute(Stage::Update, table, || {
                self.store.update(table, id, updates.clone())
            })
            .await?;
        self.cache.invalidate_table(table);
        Ok(updated)
    }

    pub async fn try_delete_rows(&self, table: &str, filters: &Filters) -> Result<(), StoreError> {
        self.executor
            .execute(Stage::Delete, table, || self.store.delete(table, filters))
            .await?;
        self.cache.invalidate_table(table);
        Ok(())
    }

    pub async fn try_upsert_row(
        &self,
        table: &str,
        row: Row,
        options: &UpsertOptions,
    ) -> Result<Row, StoreError> {
        let upserted = self
            .executor
            .execute(Stage::Upsert, table, || {
                self.store.upsert(table, row.clone(), options)
            })
            .await?;
        self.cache.invalidate_table(table);
        Ok(upserted)
    }

    // =========================================================================
    // Soft-failure API
    // =========================================================================

    /// Rows matching `filters`, or an empty list if the read failed.
    pub async fn fetch_rows(&self, table: &str, filters: &Filters, options: &FetchOptions) -> Vec<Row> {
        self.try_fetch_rows(table, filters, options)
            .await
            .unwrap_or_else(|e| soft_failure(Stage::Fetch, table, e))
    }

    pub async fn fetch_single(&self, table: &str, filters: &Filters) -> Option<Row> {
        self.try_fetch_single(table, filters, false)
            .await
            .unwrap_or_else(|e| soft_failure(Stage::FetchSingle, table, e))
    }

    pub async fn insert_row(&self, table: &str, row: Row) -> Option<Row> {
        self.try_insert_row(table, row)
            .await
            .map(Some)
            .unwrap_or_else(|e| soft_failure(Stage::Insert, table, e))
    }

    pub async fn update_row(&self, table: &str, id: &str, updates: Row) -> Option<Row> {
        self.try_update_row(table, id, updates)
            .await
            .unwrap_or_else(|e| soft_failure(Stage::Update, table, e))
    }

    pub async fn delete_rows(&self, table: &str, filters: &Filters) -> bool {
        self.try_delete_rows(table, filters)
            .await
            .map(|()| true)
            .unwrap_or_else(|e| {
                soft_failure::<()>(Stage::Delete, table, e);
                false
            })
    }

    pub async fn upsert_row(&self, table: &str, row: Row, options: &UpsertOptions) -> Option<Row> {
        self.try_upsert_row(table, row, options)
            .await
            .map(Some)
            .unwrap_or_else(|e| soft_failure(Stage::Upsert, table, e))
    }
}

/// Swallow an error into the empty value of `T`. The executor has already
/// recorded and logged it.
fn soft_failure<T: Default>(stage: Stage, table: &str, err: StoreError) -> T {
    debug!(%stage, table, error = %err, "row store unavailable, returning empty result");
    T::default()
}
