//! In-process record store with the same contract as [`RecordStore`].
//!
//! Rows are kept in their encoded form (fingerprint, JSON attributes,
//! sealed secrets) so the codec path is exercised exactly as it is against
//! `PostgreSQL`. A semaphore stands in for the connection pool: every
//! operation holds one permit for its duration and fails with
//! [`DbError::PoolExhausted`] if none frees up within the acquire timeout.
//!
//! The store can be switched offline to simulate an unreachable database,
//! and given an artificial per-operation latency to keep tasks in flight.
//!
//! [`RecordStore`]: crate::record_store::RecordStore

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use playervault_types::{PlayerId, PlayerRecord};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::error::DbError;
use crate::record_store::{Ack, PlayerRow, decode_row, encode_record, schema_to_db, version_to_db};
use crate::sealing::SecretSealer;

/// Default number of simulated connections.
const DEFAULT_CAPACITY: usize = 4;

/// Default simulated acquire timeout in milliseconds.
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 1_000;

/// Shared state behind a [`MemoryStore`] handle.
#[derive(Debug)]
struct Inner {
    rows: Mutex<BTreeMap<PlayerId, PlayerRow>>,
    connections: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
    latency: Duration,
    offline: AtomicBool,
    operations: AtomicU64,
}

/// In-memory record store. Clones share the same rows.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    sealer: SecretSealer,
    schema_version: u32,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(sealer: SecretSealer, schema_version: u32) -> Self {
        Self::with_limits(
            sealer,
            schema_version,
            DEFAULT_CAPACITY,
            Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
            Duration::ZERO,
        )
    }

    /// Create an empty store with explicit simulated pool limits and
    /// per-operation latency.
    pub fn with_limits(
        sealer: SecretSealer,
        schema_version: u32,
        capacity: usize,
        acquire_timeout: Duration,
        latency: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                rows: Mutex::new(BTreeMap::new()),
                connections: Arc::new(Semaphore::new(capacity)),
                capacity,
                acquire_timeout,
                latency,
                offline: AtomicBool::new(false),
                operations: AtomicU64::new(0),
            }),
            sealer,
            schema_version,
        }
    }

    /// Another handle on the same rows with different read/write settings,
    /// as a restarted process with a new key or schema would see them.
    pub fn reopen(&self, sealer: SecretSealer, schema_version: u32) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            sealer,
            schema_version,
        }
    }

    /// Simulate the database going away or coming back.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::Release);
    }

    /// Number of operations that reached the store (including failures).
    pub fn operations(&self) -> u64 {
        self.inner.operations.load(Ordering::Acquire)
    }

    /// Simulated connections currently leased.
    pub fn leased(&self) -> usize {
        self.inner
            .capacity
            .saturating_sub(self.inner.connections.available_permits())
    }

    /// Hold a simulated connection until the permit is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::PoolExhausted`] on timeout or
    /// [`DbError::Connection`] while offline.
    pub async fn acquire(&self, timeout: Duration) -> Result<OwnedSemaphorePermit, DbError> {
        self.inner.operations.fetch_add(1, Ordering::AcqRel);
        if self.inner.offline.load(Ordering::Acquire) {
            return Err(DbError::Connection(String::from("memory store is offline")));
        }
        let permit = tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.connections).acquire_owned(),
        )
        .await
        .map_err(|_elapsed| {
            DbError::PoolExhausted(format!(
                "no connection available within {}ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| DbError::Connection(e.to_string()))?;

        if !self.inner.latency.is_zero() {
            tokio::time::sleep(self.inner.latency).await;
        }
        Ok(permit)
    }

    /// No-op; the table always exists. Still leases a connection so that
    /// startup fails the same way when the store is unreachable.
    ///
    /// # Errors
    ///
    /// Returns a transient error while offline or saturated.
    pub async fn create_schema_if_absent(&self) -> Result<(), DbError> {
        let _permit = self.acquire(self.inner.acquire_timeout).await?;
        Ok(())
    }

    /// See [`RecordStore::load`](crate::record_store::RecordStore::load).
    ///
    /// # Errors
    ///
    /// Same as the `PostgreSQL` store.
    pub async fn load(&self, id: PlayerId) -> Result<Option<PlayerRecord>, DbError> {
        let _permit = self.acquire(self.inner.acquire_timeout).await?;
        let row = self.inner.rows.lock().await.get(&id).cloned();
        row.map(|row| decode_row(row, &self.sealer, self.schema_version))
            .transpose()
    }

    /// See [`RecordStore::save`](crate::record_store::RecordStore::save).
    ///
    /// # Errors
    ///
    /// Same as the `PostgreSQL` store.
    pub async fn save(&self, record: &PlayerRecord) -> Result<Ack, DbError> {
        let id = record.id();
        let encoded = encode_record(record, &self.sealer)?;
        let _permit = self.acquire(self.inner.acquire_timeout).await?;
        let mut rows = self.inner.rows.lock().await;

        let stored = rows.get(&id).map(|row| {
            (
                u64::try_from(row.version).unwrap_or(0),
                u32::try_from(row.schema_version).unwrap_or(0),
            )
        });

        let next = match stored {
            None if record.version == 0 => 1,
            Some((version, schema)) if version == record.version => {
                if schema > record.schema_version {
                    return Err(DbError::SchemaMismatch {
                        player: id,
                        stored: schema,
                        offered: record.schema_version,
                    });
                }
                version
                    .checked_add(1)
                    .ok_or_else(|| DbError::Database(format!("version overflow for {id}")))?
            }
            other => {
                return Err(DbError::Conflict {
                    player: id,
                    expected: record.version,
                    actual: other.map(|(version, _)| version),
                });
            }
        };

        rows.insert(
            id,
            PlayerRow {
                identity_key: id.into_inner(),
                key_fingerprint: encoded.fingerprint,
                version: version_to_db(next),
                schema_version: schema_to_db(record.schema_version),
                attributes: encoded.attributes,
                sealed_fields: encoded.sealed_fields,
                updated_at: record.updated_at,
            },
        );
        drop(rows);

        tracing::debug!(player = %id, version = next, "Saved player record (memory)");
        Ok(Ack { version: next })
    }

    /// See [`RecordStore::purge`](crate::record_store::RecordStore::purge).
    ///
    /// # Errors
    ///
    /// Returns a transient error while offline or saturated.
    pub async fn purge(&self, id: PlayerId) -> Result<bool, DbError> {
        let _permit = self.acquire(self.inner.acquire_timeout).await?;
        Ok(self.inner.rows.lock().await.remove(&id).is_some())
    }

    /// Number of stored records.
    ///
    /// # Errors
    ///
    /// Returns a transient error while offline or saturated.
    pub async fn count(&self) -> Result<u64, DbError> {
        let _permit = self.acquire(self.inner.acquire_timeout).await?;
        let len = self.inner.rows.lock().await.len();
        Ok(u64::try_from(len).unwrap_or(u64::MAX))
    }

    /// Stored version of a record without decoding it, for assertions.
    pub async fn stored_version(&self, id: PlayerId) -> Option<u64> {
        self.inner
            .rows
            .lock()
            .await
            .get(&id)
            .and_then(|row| u64::try_from(row.version).ok())
    }

    /// Close the simulated pool; later acquires fail.
    pub fn close(&self) {
        self.inner.connections.close();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.connections.is_closed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(SecretSealer::plaintext(), 1)
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        assert!(store().load(PlayerId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_increments_version() {
        let store = store();
        let record = PlayerRecord::new(PlayerId::new(), 1)
            .with_attribute("balance", serde_json::json!(10))
            .with_secret("pin", b"1234".to_vec());

        let ack = store.save(&record).await.unwrap();
        assert_eq!(ack.version, 1);

        let loaded = store.load(record.id()).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.attribute("balance"), Some(&serde_json::json!(10)));
        assert_eq!(loaded.secret("pin"), Some(&b"1234"[..]));

        let ack = store.save(&loaded).await.unwrap();
        assert_eq!(ack.version, 2);
        assert_eq!(store.stored_version(record.id()).await, Some(2));
    }

    #[tokio::test]
    async fn stale_save_conflicts() {
        let store = store();
        let record = PlayerRecord::new(PlayerId::new(), 1);
        store.save(&record).await.unwrap();
        let stored = record.clone().with_version(1);
        store.save(&stored).await.unwrap();

        let err = store.save(&stored).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::Conflict { expected: 1, actual: Some(2), .. }
        ));

        let err = store.save(&record).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict { expected: 0, .. }));
    }

    #[tokio::test]
    async fn concurrent_stale_saves_yield_one_winner() {
        let store = store();
        let base = PlayerRecord::new(PlayerId::new(), 1);
        store.save(&base).await.unwrap();
        let stale = base.with_version(1);

        let attempts = (0..8).map(|_| {
            let store = store.clone();
            let record = stale.clone();
            tokio::spawn(async move { store.save(&record).await })
        });
        let results = futures::future::join_all(attempts).await;

        let mut winners = 0;
        let mut conflicts = 0;
        for result in results {
            match result.unwrap() {
                Ok(ack) => {
                    assert_eq!(ack.version, 2);
                    winners += 1;
                }
                Err(e) => {
                    assert!(e.is_conflict());
                    conflicts += 1;
                }
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn schema_version_cannot_go_backwards() {
        let sealer = SecretSealer::plaintext();
        let newer = MemoryStore::new(sealer.clone(), 3);
        let record = PlayerRecord::new(PlayerId::new(), 3);
        newer.save(&record).await.unwrap();

        let mut downgraded = record.with_version(1);
        downgraded.schema_version = 2;
        let err = newer.save(&downgraded).await.unwrap_err();
        assert!(matches!(err, DbError::SchemaMismatch { stored: 3, offered: 2, .. }));
    }

    #[tokio::test]
    async fn offline_store_fails_transiently() {
        let store = store();
        store.set_offline(true);
        let err = store.load(PlayerId::new()).await.unwrap_err();
        assert!(err.is_transient());
        store.set_offline(false);
        assert!(store.load(PlayerId::new()).await.is_ok());
    }

    #[tokio::test]
    async fn saturated_pool_reports_exhaustion() {
        let store = MemoryStore::with_limits(
            SecretSealer::plaintext(),
            1,
            2,
            Duration::from_millis(100),
            Duration::ZERO,
        );
        let _a = store.acquire(Duration::from_millis(100)).await.unwrap();
        let _b = store.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(store.leased(), 2);

        let started = std::time::Instant::now();
        let err = store.acquire(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted(_)));
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn purge_removes_row() {
        let store = store();
        let record = PlayerRecord::new(PlayerId::new(), 1);
        store.save(&record).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.purge(record.id()).await.unwrap());
        assert!(!store.purge(record.id()).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
