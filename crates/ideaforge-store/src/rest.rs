//! PostgREST-style HTTP row store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{FetchOptions, Filters, Row, RowStore, StoreError, UpsertOptions};

/// Error body returned by the REST gateway.
#[derive(Debug, Default, Deserialize)]
struct RemoteErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<Value>,
    #[serde(default)]
    hint: Option<Value>,
}

fn text_of(value: Option<Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    }
}

/// Client for a PostgREST-compatible endpoint (`{base}/rest/v1/{table}`).
pub struct RestRowStore {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Arc<RwLock<Option<String>>>,
}

impl RestRowStore {
    /// Create a client for `base_url`, authenticating with `api_key`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, StoreError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Act on behalf of a signed-in user instead of the anonymous key.
    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self
            .access_token
            .read()
            .await
            .clone()
            .unwrap_or_else(|| self.api_key.clone());
        request
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    /// Map an unsuccessful response to a [`StoreError`].
    async fn error_from(response: Response) -> StoreError {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return StoreError::RateLimited { retry_after_secs };
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return StoreError::InvalidResponse(format!(
                    "request failed ({}): failed to read response: {}",
                    status, e
                ));
            }
        };
        let body: RemoteErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let message = body.message.unwrap_or_else(|| {
            if text.is_empty() {
                status.to_string()
            } else {
                text.clone()
            }
        });

        match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                StoreError::Aborted(format!("{} ({})", message, status))
            }
            StatusCode::CONFLICT => StoreError::Conflict {
                code: body.code,
                message,
            },
            _ => StoreError::Remote {
                status: status.as_u16(),
                code: body.code,
                message,
                details: text_of(body.details),
                hint: text_of(body.hint),
            },
        }
    }

    async fn rows_from(response: Response) -> Result<Vec<Row>, StoreError> {
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&text)? {
            Value::Array(rows) => Ok(rows),
            row @ Value::Object(_) => Ok(vec![row]),
            other => Err(StoreError::InvalidResponse(format!(
                "expected rows, got {}",
                other
            ))),
        }
    }

    fn first_row(rows: Vec<Row>, what: &str) -> Result<Row, StoreError> {
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidResponse(format!("{} returned no row", what)))
    }
}

/// Encode equality filters as `column=eq.value` query parameters.
fn filter_params(filters: &Filters) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|(column, value)| {
            let param = match value {
                Value::Null => "is.null".to_string(),
                Value::String(s) => format!("eq.{}", s),
                other => format!("eq.{}", other),
            };
            (column.clone(), param)
        })
        .collect()
}

#[async_trait]
impl RowStore for RestRowStore {
    async fn fetch(
        &self,
        table: &str,
        filters: &Filters,
        options: &FetchOptions,
    ) -> Result<Vec<Row>, StoreError> {
        let mut query = filter_params(filters);
        query.push((
            "select".to_string(),
            options.select.clone().unwrap_or_else(|| "*".to_string()),
        ));
        if let Some(order) = &options.order {
            query.push(("order".to_string(), order.to_string()));
        }
        if let Some(limit) = options.limit {
            query.push(("limit".to_string(), limit.to_string()));
        }

        debug!(table, ?query, "fetching rows");
        let request = self.http.get(self.table_url(table)).query(&query);
        let response = self.authorize(request).await.send().await?;
        Self::rows_from(response).await
    }

    async fn fetch_single(
        &self,
        table: &str,
        filters: &Filters,
    ) -> Result<Option<Row>, StoreError> {
        let mut query = filter_params(filters);
        query.push(("select".to_string(), "*".to_string()));
        query.push(("limit".to_string(), "1".to_string()));

        let request = self.http.get(self.table_url(table)).query(&query);
        let response = self.authorize(request).await.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Self::rows_from(response).await?.into_iter().next())
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
        let request = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&row);
        let response = self.authorize(request).await.send().await?;
        Self::first_row(Self::rows_from(response).await?, "insert")
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        updates: Row,
    ) -> Result<Option<Row>, StoreError> {
        let request = self
            .http
            .patch(self.table_url(table))
            .query(&filter_params(&Filters::by_id(id)))
            .header("Prefer", "return=representation")
            .json(&updates);
        let response = self.authorize(request).await.send().await?;
        Ok(Self::rows_from(response).await?.into_iter().next())
    }

    async fn delete(&self, table: &str, filters: &Filters) -> Result<(), StoreError> {
        let request = self
            .http
            .delete(self.table_url(table))
            .query(&filter_params(filters));
        let response = self.authorize(request).await.send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        row: Row,
        options: &UpsertOptions,
    ) -> Result<Row, StoreError> {
        let resolution = if options.ignore_duplicates {
            "resolution=ignore-duplicates"
        } else {
            "resolution=merge-duplicates"
        };
        let request = self
            .http
            .post(self.table_url(table))
            .query(&[("on_conflict", options.conflict_column())])
            .header("Prefer", format!("{},return=representation", resolution))
            .json(&row);
        let response = self.authorize(request).await.send().await?;
        let rows = Self::rows_from(response).await?;
        // Ignored duplicates come back empty; echo the submitted row.
        Ok(rows.into_iter().next().unwrap_or(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Order;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> RestRowStore {
        RestRowStore::new(server.uri(), "anon-key").unwrap()
    }

    #[test]
    fn filter_params_encoding() {
        let params = filter_params(
            &Filters::new()
                .eq("idea_id", "i1")
                .eq("votes", 3)
                .eq("parent_comment_id", Value::Null),
        );
        assert_eq!(
            params,
            vec![
                ("idea_id".to_string(), "eq.i1".to_string()),
                ("parent_comment_id".to_string(), "is.null".to_string()),
                ("votes".to_string(), "eq.3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn fetch_sends_filters_order_and_limit() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/ideas"))
            .and(query_param("author_id", "eq.u1"))
            .and(query_param("order", "created_at.desc"))
            .and(query_param("limit", "10"))
            .and(query_param("select", "*"))
            .and(header("apikey", "anon-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "i1", "title": "Solar co-op"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let rows = store(&server)
            .fetch(
                "ideas",
                &Filters::new().eq("author_id", "u1"),
                &FetchOptions::new().order(Order::desc("created_at")).limit(10),
            )
            .await
            .unwrap();

        assert_eq!(rows, vec![json!({"id": "i1", "title": "Solar co-op"})]);
    }

    #[tokio::test]
    async fn fetch_single_returns_none_for_empty_result() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/ideas"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let row = store(&server)
            .fetch_single("ideas", &Filters::by_id("missing"))
            .await
            .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn insert_returns_stored_row() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/comments"))
            .and(header("Prefer", "return=representation"))
            .and(body_json(json!({"text": "nice"})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!([{"id": "c1", "text": "nice", "votes": 0}])),
            )
            .mount(&server)
            .await;

        let row = store(&server)
            .insert("comments", json!({"text": "nice"}))
            .await
            .unwrap();
        assert_eq!(row["id"], "c1");
    }

    #[tokio::test]
    async fn remote_error_body_is_preserved() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/ideas"))
            .and(query_param("id", "eq.i1"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "code": "42501",
                "message": "new row violates row-level security policy",
                "details": null,
                "hint": "check the ideas policy"
            })))
            .mount(&server)
            .await;

        let err = store(&server)
            .update("ideas", "i1", json!({"votes": 4}))
            .await
            .unwrap_err();

        match err {
            StoreError::Remote {
                status,
                code,
                details,
                hint,
                ..
            } => {
                assert_eq!(status, 403);
                assert_eq!(code.as_deref(), Some("42501"));
                assert!(details.is_none());
                assert_eq!(hint.as_deref(), Some("check the ideas policy"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflict_and_gateway_timeout_are_classified() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/fork_requests"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "code": "23505",
                "message": "duplicate key value violates unique constraint"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/ideas"))
            .respond_with(ResponseTemplate::new(504))
            .mount(&server)
            .await;

        let store = store(&server);
        let conflict = store
            .insert("fork_requests", json!({"id": "k1"}))
            .await
            .unwrap_err();
        assert!(matches!(conflict, StoreError::Conflict { .. }));
        assert!(!conflict.is_abort_like());

        let timeout = store
            .fetch("ideas", &Filters::new(), &FetchOptions::new())
            .await
            .unwrap_err();
        assert!(timeout.is_abort_like());
    }

    #[tokio::test]
    async fn access_token_replaces_anon_bearer() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/rest/v1/idea_votes"))
            .and(query_param("user_id", "eq.u1"))
            .and(header("Authorization", "Bearer user-jwt"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = store(&server);
        store.set_access_token(Some("user-jwt".to_string())).await;
        store
            .delete("idea_votes", &Filters::new().eq("user_id", "u1"))
            .await
            .unwrap();
    }
}
