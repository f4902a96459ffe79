//! Timeout, classification and bounded retry around single row-store calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::{Diagnostics, Stage, StoreError};

/// Tuning for [`RequestExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Total attempts for abort-like failures, including the first.
    pub max_attempts: u32,
    /// Delay before retry `n` is `base_delay * n`.
    pub base_delay: Duration,
    /// Minimum gap between two warnings for the same (stage, table).
    pub log_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(12),
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            log_interval: Duration::from_secs(30),
        }
    }
}

/// Runs row-store calls under a timeout, retrying abort-like failures with
/// linear backoff and reporting every attempt to [`Diagnostics`].
#[derive(Debug)]
pub struct RequestExecutor {
    config: ExecutorConfig,
    diagnostics: Arc<Diagnostics>,
    /// Last time an abort warning was emitted, keyed by `stage:table`.
    last_warned: DashMap<String, Instant>,
}

impl RequestExecutor {
    pub fn new(config: ExecutorConfig, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            config,
            diagnostics,
            last_warned: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Execute `op`, calling it again for each retry.
    ///
    /// Hard failures return after the first attempt. Abort-like failures are
    /// retried until `max_attempts` attempts have been made.
    pub async fn execute<T, F, Fut>(
        &self,
        stage: Stage,
        table: &str,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(self.config.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    after_ms: self.config.timeout.as_millis() as u64,
                }),
            };

            let err = match result {
                Ok(value) => {
                    self.diagnostics.record_success(stage, table);
                    return Ok(value);
                }
                Err(err) => err,
            };

            self.diagnostics.record_failure(stage, table, &err);

            if !err.is_abort_like() {
                error!(
                    %stage,
                    table,
                    code = err.code().unwrap_or_default(),
                    message = %err,
                    details = err.details().unwrap_or_default(),
                    hint = err.hint().unwrap_or_default(),
                    "row store request failed"
                );
                return Err(err);
            }

            if attempt >= max_attempts {
                self.warn_exhausted(stage, table, attempt, &err);
                return Err(err);
            }

            let delay = self.config.base_delay * attempt;
            debug!(
                %stage,
                table,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "abort-like failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Warn about an exhausted abort storm, at most once per key per
    /// `log_interval`.
    fn warn_exhausted(&self, stage: Stage, table: &str, attempts: u32, err: &StoreError) {
        let key = format!("{}:{}", stage, table);
        let now = Instant::now();

        let should_log = match self.last_warned.get(&key) {
            Some(last) => now.duration_since(*last) >= self.config.log_interval,
            None => true,
        };

        if should_log {
            self.last_warned.insert(key, now);
            warn!(%stage, table, attempts, error = %err, "row store request aborted, giving up");
        }
    }
}
