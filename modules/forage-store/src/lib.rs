//! Keyed JSON document repository.
//!
//! Every document lives under `(collection, id)` and carries `id`, `created_at`
//! and `updated_at` fields that the store owns. Nothing here knows about venues,
//! strategies or budgets; domain crates wrap collections with `Collection<T>`.

pub mod cache;
pub mod collection;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use cache::{cache_key, Cache, InvalidationRules, MemoryCache};
pub use collection::Collection;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use query::{Direction, Filter, FilterOp, OrderBy, Query};
pub use store::{ApplyFn, BatchOp, BatchOutcome, DocumentStore};
