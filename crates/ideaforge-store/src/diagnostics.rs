//! Error channel for support tooling.
//!
//! Keeps the most recent failure per (stage, table) plus a bounded history
//! of failures. An instance is injected into the executor and the
//! [`crate::DataAccess`] facade; there is no process-wide slot.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::{Stage, StoreError};

/// Default number of failures kept in the history ring.
pub const DEFAULT_HISTORY_CAPACITY: usize = 64;

/// Diagnostic snapshot of one failing row-store attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    pub table: String,
    pub code: Option<String>,
    pub message: String,
    pub details: Option<String>,
    pub hint: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Recording order, used to pick the newest record across slots.
    #[serde(skip)]
    seq: u64,
}

impl ErrorRecord {
    fn new(stage: Stage, table: &str, err: &StoreError, seq: u64) -> Self {
        Self {
            stage,
            table: table.to_string(),
            code: err.code().map(str::to_string),
            message: err.to_string(),
            details: err.details().map(str::to_string),
            hint: err.hint().map(str::to_string),
            timestamp: Utc::now(),
            seq,
        }
    }
}

/// Last-error slots and failure history.
#[derive(Debug)]
pub struct Diagnostics {
    slots: DashMap<(Stage, String), ErrorRecord>,
    history: Mutex<VecDeque<ErrorRecord>>,
    capacity: usize,
    seq: AtomicU64,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel that keeps at most `capacity` historical failures.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Record a failed attempt, overwriting the slot for (stage, table).
    pub fn record_failure(&self, stage: Stage, table: &str, err: &StoreError) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let record = ErrorRecord::new(stage, table, err, seq);

        self.slots.insert((stage, table.to_string()), record.clone());

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Record a successful attempt: clears the slot for (stage, table).
    pub fn record_success(&self, stage: Stage, table: &str) {
        self.slots.remove(&(stage, table.to_string()));
    }

    /// The newest failure that has not since been cleared by a success on
    /// the same stage and table.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.slots
            .iter()
            .max_by_key(|entry| entry.value().seq)
            .map(|entry| entry.value().clone())
    }

    /// The outstanding failure for one (stage, table), if any.
    pub fn last_error_for(&self, stage: Stage, table: &str) -> Option<ErrorRecord> {
        self.slots
            .get(&(stage, table.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Up to `n` historical failures, newest first. History is not cleared by
    /// later successes.
    pub fn recent(&self, n: usize) -> Vec<ErrorRecord> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(n).cloned().collect()
    }

    /// Drop every slot and the history.
    pub fn reset(&self) {
        self.slots.clear();
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> StoreError {
        StoreError::Timeout { after_ms: 10 }
    }

    fn denied() -> StoreError {
        StoreError::Remote {
            status: 403,
            code: Some("42501".into()),
            message: "permission denied for table ideas".into(),
            details: Some("rls".into()),
            hint: Some("sign in".into()),
        }
    }

    #[test]
    fn success_clears_matching_slot_only() {
        let diag = Diagnostics::new();
        diag.record_failure(Stage::Fetch, "ideas", &timeout());
        diag.record_failure(Stage::Insert, "comments", &denied());

        diag.record_success(Stage::Fetch, "ideas");
        assert!(diag.last_error_for(Stage::Fetch, "ideas").is_none());

        let last = diag.last_error().unwrap();
        assert_eq!(last.stage, Stage::Insert);
        assert_eq!(last.table, "comments");
        assert_eq!(last.code.as_deref(), Some("42501"));
        assert_eq!(last.details.as_deref(), Some("rls"));
        assert_eq!(last.hint.as_deref(), Some("sign in"));

        diag.record_success(Stage::Insert, "comments");
        assert!(diag.last_error().is_none());
    }

    #[test]
    fn success_on_other_table_keeps_failure() {
        let diag = Diagnostics::new();
        diag.record_failure(Stage::Fetch, "ideas", &timeout());
        diag.record_success(Stage::Fetch, "comments");
        diag.record_success(Stage::Update, "ideas");

        assert_eq!(diag.last_error().unwrap().table, "ideas");
    }

    #[test]
    fn last_error_is_newest_across_slots() {
        let diag = Diagnostics::new();
        diag.record_failure(Stage::Fetch, "ideas", &timeout());
        diag.record_failure(Stage::Update, "profiles", &denied());
        diag.record_failure(Stage::Fetch, "ideas", &timeout());

        let last = diag.last_error().unwrap();
        assert_eq!(last.stage, Stage::Fetch);
        assert_eq!(last.table, "ideas");
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let diag = Diagnostics::with_capacity(2);
        diag.record_failure(Stage::Fetch, "a", &timeout());
        diag.record_failure(Stage::Fetch, "b", &timeout());
        diag.record_failure(Stage::Fetch, "c", &timeout());
        diag.record_success(Stage::Fetch, "c");

        let recent: Vec<_> = diag.recent(10).into_iter().map(|r| r.table).collect();
        assert_eq!(recent, vec!["c".to_string(), "b".to_string()]);
    }
}
