//! Resilient, cached access to ideaforge's remote row store.
//!
//! This crate wraps a table-oriented remote store with the machinery the
//! rest of ideaforge relies on for fast, consistent-feeling reads and writes.
//!
//! ## Features
//!
//! - **Row stores**: the [`RowStore`] trait, a PostgREST-style HTTP client
//!   ([`RestRowStore`]) and an in-memory fake ([`MemoryRowStore`])
//! - **Executor**: per-call timeout, abort classification and bounded linear
//!   retry ([`RequestExecutor`])
//! - **Read cache**: short-lived cache with in-flight request coalescing
//!   ([`ReadCache`])
//! - **Diagnostics**: last-error slots per stage and table plus a bounded
//!   failure history ([`Diagnostics`])
//! - **Facade**: [`DataAccess`] ties the above together

mod access;
pub mod cache;
pub mod diagnostics;
mod error;
pub mod executor;
mod memory;
mod rest;
mod row_store;
mod types;

pub use access::{DataAccess, DataAccessBuilder};
pub use cache::{CacheConfig, CacheKey, CacheStats, DEFAULT_CACHE_TTL, ReadCache};
pub use diagnostics::{Diagnostics, ErrorRecord};
pub use error::StoreError;
pub use executor::{ExecutorConfig, RequestExecutor};
pub use memory::MemoryRowStore;
pub use rest::RestRowStore;
pub use row_store::RowStore;
pub use types::*;
