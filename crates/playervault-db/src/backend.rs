//! Storage backend selection.
//!
//! The task bridge works against [`RecordBackend`] so that the same worker
//! code runs against `PostgreSQL` in production and the in-memory store in
//! tests and offline development.

use playervault_types::{PlayerId, PlayerRecord};

use crate::error::DbError;
use crate::memory_store::MemoryStore;
use crate::pool::PoolStatus;
use crate::record_store::{Ack, RecordStore};

/// A record store implementation.
#[derive(Debug, Clone)]
pub enum RecordBackend {
    /// Pooled `PostgreSQL` store.
    Postgres(RecordStore),
    /// In-process store.
    Memory(MemoryStore),
}

impl RecordBackend {
    /// Create the table if absent.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store is unreachable or DDL fails.
    pub async fn create_schema_if_absent(&self) -> Result<(), DbError> {
        match self {
            Self::Postgres(store) => store.create_schema_if_absent().await,
            Self::Memory(store) => store.create_schema_if_absent().await,
        }
    }

    /// Load a record.
    ///
    /// # Errors
    ///
    /// See [`RecordStore::load`].
    pub async fn load(&self, id: PlayerId) -> Result<Option<PlayerRecord>, DbError> {
        match self {
            Self::Postgres(store) => store.load(id).await,
            Self::Memory(store) => store.load(id).await,
        }
    }

    /// Save a record with optimistic concurrency.
    ///
    /// # Errors
    ///
    /// See [`RecordStore::save`].
    pub async fn save(&self, record: &PlayerRecord) -> Result<Ack, DbError> {
        match self {
            Self::Postgres(store) => store.save(record).await,
            Self::Memory(store) => store.save(record).await,
        }
    }

    /// Delete a record.
    ///
    /// # Errors
    ///
    /// See [`RecordStore::purge`].
    pub async fn purge(&self, id: PlayerId) -> Result<bool, DbError> {
        match self {
            Self::Postgres(store) => store.purge(id).await,
            Self::Memory(store) => store.purge(id).await,
        }
    }

    /// Number of stored records.
    ///
    /// # Errors
    ///
    /// See [`RecordStore::count`].
    pub async fn count(&self) -> Result<u64, DbError> {
        match self {
            Self::Postgres(store) => store.count().await,
            Self::Memory(store) => store.count().await,
        }
    }

    /// Check that a connection can be leased.
    ///
    /// # Errors
    ///
    /// Returns a transient [`DbError`] if the store is unreachable.
    pub async fn probe(&self) -> Result<(), DbError> {
        match self {
            Self::Postgres(store) => store.pool().probe().await,
            Self::Memory(store) => store.acquire(std::time::Duration::from_secs(1)).await.map(drop),
        }
    }

    /// Pool occupancy, if the backend has a real pool.
    pub fn pool_status(&self) -> Option<PoolStatus> {
        match self {
            Self::Postgres(store) => Some(store.pool().status()),
            Self::Memory(_) => None,
        }
    }

    /// Close the pool. Later operations fail.
    pub async fn close(&self) {
        match self {
            Self::Postgres(store) => store.pool().close().await,
            Self::Memory(store) => store.close(),
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Postgres(store) => store.pool().is_closed(),
            Self::Memory(store) => store.is_closed(),
        }
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }
}

impl From<RecordStore> for RecordBackend {
    fn from(store: RecordStore) -> Self {
        Self::Postgres(store)
    }
}

impl From<MemoryStore> for RecordBackend {
    fn from(store: MemoryStore) -> Self {
        Self::Memory(store)
    }
}
