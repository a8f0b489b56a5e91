//! Persistence layer for the ratchet saga orchestrator.
//!
//! Two stores live here: the KV/TTL state store (executions, locks,
//! confirmations, heartbeats, DLQ, fingerprints) behind the [`StateStore`]
//! trait with Redis and in-memory backends, and the relational
//! transactional outbox (sqlx/PostgreSQL).

pub mod backend;
pub mod config;
pub mod executions;
pub mod keys;
pub mod models;
pub mod outbox;
pub mod pool;
pub mod store;

pub use backend::memory::MemoryStore;
pub use backend::redis::RedisStore;
pub use executions::ExecutionRepository;
pub use store::{StateStore, StoreError};
