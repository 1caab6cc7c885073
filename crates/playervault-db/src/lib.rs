//! Storage layer for `PlayerVault`: a pooled `PostgreSQL` record store and
//! the codec that turns player records into rows and back.
//!
//! # Architecture
//!
//! ```text
//! TaskBridge worker
//!     |
//!     +-- RecordBackend::Postgres --> RecordStore --> ConnectionPool (sqlx PgPool)
//!     |                                   |
//!     |                                   +-- codec + SecretSealer (encode/seal)
//!     |
//!     +-- RecordBackend::Memory ----> MemoryStore (same contract, no database)
//! ```
//!
//! # Modules
//!
//! - [`pool`] -- bounded connection pool and leases
//! - [`record_store`] -- versioned load/save/purge against `PostgreSQL`
//! - [`memory_store`] -- in-process store with the same contract
//! - [`backend`] -- dispatch between the two
//! - [`codec`] -- base64, SHA-256 fingerprints, identity bytes
//! - [`sealing`] -- AES-256-GCM sealing of secret fields
//! - [`error`] -- shared error types

pub mod backend;
pub mod codec;
pub mod error;
pub mod memory_store;
pub mod pool;
pub mod record_store;
pub mod sealing;

pub use backend::RecordBackend;
pub use codec::CodecError;
pub use error::{DbError, StoreError};
pub use memory_store::MemoryStore;
pub use pool::{ConnectionPool, Lease, PoolConfig, PoolStatus};
pub use record_store::{Ack, RecordStore};
pub use sealing::SecretSealer;
