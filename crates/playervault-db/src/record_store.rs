//! Player record persistence in `PostgreSQL`.
//!
//! One versioned table keyed by identity key. Each operation leases exactly
//! one connection for its duration; the lease is released on every exit
//! path because it is dropped with the operation's stack frame.
//!
//! # Schema
//!
//! | Column | Type | Notes |
//! |--------|------|-------|
//! | `identity_key` | `UUID` | primary key |
//! | `key_fingerprint` | `TEXT` | hex SHA-256 of the key, unique |
//! | `version` | `BIGINT` | optimistic concurrency stamp |
//! | `schema_version` | `INTEGER` | only increases |
//! | `attributes` | `JSONB` | opaque attribute set |
//! | `sealed_fields` | `TEXT` | JSON object of sealed secrets |
//! | `updated_at` | `TIMESTAMPTZ` | last modification |
//!
//! # Optimistic concurrency
//!
//! A record with version `0` is inserted; any existing row makes the insert
//! a conflict. Otherwise the update only matches the row whose stored
//! version equals the caller's, and bumps it by one. Concurrent writers
//! based on the same version serialize on the row lock and all but the
//! first match zero rows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use playervault_types::{AttributeMap, PlayerId, PlayerRecord, SecretMap};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::codec;
use crate::error::DbError;
use crate::pool::ConnectionPool;
use crate::sealing::SecretSealer;

/// Confirmation of a successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// The version stamp now stored.
    pub version: u64,
}

/// Table creation, then additive column patches for tables created by
/// older builds.
const SCHEMA_STATEMENTS: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS player_records (
        identity_key    UUID PRIMARY KEY,
        key_fingerprint TEXT NOT NULL UNIQUE,
        version         BIGINT NOT NULL,
        schema_version  INTEGER NOT NULL
    )",
    r"ALTER TABLE player_records ADD COLUMN IF NOT EXISTS attributes JSONB NOT NULL DEFAULT '{}'::jsonb",
    r"ALTER TABLE player_records ADD COLUMN IF NOT EXISTS sealed_fields TEXT NOT NULL DEFAULT '{}'",
    r"ALTER TABLE player_records ADD COLUMN IF NOT EXISTS updated_at TIMESTAMPTZ NOT NULL DEFAULT now()",
];

/// A record encoded for storage.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EncodedRecord {
    pub fingerprint: String,
    pub attributes: serde_json::Value,
    pub sealed_fields: String,
}

/// Encode attributes and seal secrets.
pub(crate) fn encode_record(
    record: &PlayerRecord,
    sealer: &SecretSealer,
) -> Result<EncodedRecord, DbError> {
    let attributes = serde_json::to_value(&record.attributes)?;
    let sealed: BTreeMap<&str, String> = record
        .secrets
        .iter()
        .map(|(name, value)| sealer.seal(value).map(|text| (name.as_str(), text)))
        .collect::<Result<_, _>>()?;
    Ok(EncodedRecord {
        fingerprint: codec::fingerprint(record.id()),
        attributes,
        sealed_fields: serde_json::to_string(&sealed)?,
    })
}

/// Stored columns before decoding.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct PlayerRow {
    pub identity_key: Uuid,
    pub key_fingerprint: String,
    pub version: i64,
    pub schema_version: i32,
    pub attributes: serde_json::Value,
    pub sealed_fields: String,
    pub updated_at: DateTime<Utc>,
}

/// Decode a stored row back into a record.
///
/// Rejects rows written by a newer schema than `supported_schema`, rows
/// whose fingerprint does not match their key, and undecodable fields.
pub(crate) fn decode_row(
    row: PlayerRow,
    sealer: &SecretSealer,
    supported_schema: u32,
) -> Result<PlayerRecord, DbError> {
    let id = PlayerId(row.identity_key);

    let schema_version = u32::try_from(row.schema_version)
        .map_err(|e| DbError::Decode(format!("negative schema version for {id}: {e}")))?;
    if schema_version > supported_schema {
        return Err(DbError::SchemaMismatch {
            player: id,
            stored: schema_version,
            offered: supported_schema,
        });
    }

    let version = u64::try_from(row.version)
        .map_err(|e| DbError::Decode(format!("negative version for {id}: {e}")))?;

    if row.key_fingerprint != codec::fingerprint(id) {
        return Err(DbError::Decode(format!("fingerprint mismatch for {id}")));
    }

    let attributes: AttributeMap = serde_json::from_value(row.attributes)
        .map_err(|e| DbError::Decode(format!("malformed attributes for {id}: {e}")))?;
    let sealed: BTreeMap<String, String> = serde_json::from_str(&row.sealed_fields)
        .map_err(|e| DbError::Decode(format!("malformed sealed fields for {id}: {e}")))?;
    let secrets: SecretMap = sealed
        .into_iter()
        .map(|(name, text)| sealer.open(&text).map(|bytes| (name, bytes)))
        .collect::<Result<_, _>>()?;

    Ok(PlayerRecord::from_parts(
        id,
        version,
        schema_version,
        attributes,
        secrets,
        row.updated_at,
    ))
}

/// Convert a schema version for binding.
pub(crate) fn schema_to_db(schema_version: u32) -> i32 {
    i32::try_from(schema_version).unwrap_or(i32::MAX)
}

/// Convert a version stamp for binding.
pub(crate) fn version_to_db(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

/// CRUD operations on the `player_records` table.
#[derive(Clone, Debug)]
pub struct RecordStore {
    pool: ConnectionPool,
    sealer: SecretSealer,
    schema_version: u32,
}

impl RecordStore {
    /// Create a store over a connected pool.
    ///
    /// `schema_version` is the newest record schema this build understands.
    pub const fn new(pool: ConnectionPool, sealer: SecretSealer, schema_version: u32) -> Self {
        Self {
            pool,
            sealer,
            schema_version,
        }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Create the table if missing and add any columns older builds lacked.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if a lease cannot be obtained or DDL fails.
    pub async fn create_schema_if_absent(&self) -> Result<(), DbError> {
        let mut lease = self.pool.acquire_default().await?;
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(lease.connection()).await?;
        }
        tracing::info!(schema_version = self.schema_version, "player_records schema ready");
        Ok(())
    }

    /// Load a record. `Ok(None)` means the player has no stored state.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the database is unreachable, or
    /// [`DbError::Decode`] / [`DbError::SchemaMismatch`] if the row cannot
    /// be used.
    pub async fn load(&self, id: PlayerId) -> Result<Option<PlayerRecord>, DbError> {
        let mut lease = self.pool.acquire_default().await?;
        let row = sqlx::query_as::<_, PlayerRow>(
            r"SELECT identity_key, key_fingerprint, version, schema_version, attributes, sealed_fields, updated_at
              FROM player_records
              WHERE identity_key = $1",
        )
        .bind(id.into_inner())
        .fetch_optional(lease.connection())
        .await?;
        lease.release();

        row.map(|row| decode_row(row, &self.sealer, self.schema_version))
            .transpose()
    }

    /// Save a record with optimistic concurrency.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] if the stored version is not the one
    /// the record was based on, [`DbError::SchemaMismatch`] if the record
    /// would lower the stored schema version, or a transient error.
    pub async fn save(&self, record: &PlayerRecord) -> Result<Ack, DbError> {
        let id = record.id();
        let encoded = encode_record(record, &self.sealer)?;
        let mut lease = self.pool.acquire_default().await?;
        let conn = lease.connection();

        if record.version == 0 {
            let result = sqlx::query(
                r"INSERT INTO player_records (identity_key, key_fingerprint, version, schema_version, attributes, sealed_fields, updated_at)
                  VALUES ($1, $2, 1, $3, $4, $5, $6)
                  ON CONFLICT (identity_key) DO NOTHING",
            )
            .bind(id.into_inner())
            .bind(&encoded.fingerprint)
            .bind(schema_to_db(record.schema_version))
            .bind(&encoded.attributes)
            .bind(&encoded.sealed_fields)
            .bind(record.updated_at)
            .execute(&mut *conn)
            .await?;

            if result.rows_affected() == 0 {
                let stored = stored_stamp(conn, id).await?;
                return Err(DbError::Conflict {
                    player: id,
                    expected: 0,
                    actual: stored.map(|(version, _)| version),
                });
            }
            tracing::debug!(player = %id, version = 1, "Inserted player record");
            return Ok(Ack { version: 1 });
        }

        let result = sqlx::query(
            r"UPDATE player_records
              SET version = version + 1,
                  schema_version = $3,
                  attributes = $4,
                  sealed_fields = $5,
                  updated_at = $6
              WHERE identity_key = $1 AND version = $2 AND schema_version <= $3",
        )
        .bind(id.into_inner())
        .bind(version_to_db(record.version))
        .bind(schema_to_db(record.schema_version))
        .bind(&encoded.attributes)
        .bind(&encoded.sealed_fields)
        .bind(record.updated_at)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            let stored = stored_stamp(conn, id).await?;
            return Err(match stored {
                Some((version, schema)) if version == record.version => DbError::SchemaMismatch {
                    player: id,
                    stored: schema,
                    offered: record.schema_version,
                },
                other => DbError::Conflict {
                    player: id,
                    expected: record.version,
                    actual: other.map(|(version, _)| version),
                },
            });
        }

        let version = record
            .version
            .checked_add(1)
            .ok_or_else(|| DbError::Database(format!("version overflow for {id}")))?;
        tracing::debug!(player = %id, version, "Updated player record");
        Ok(Ack { version })
    }

    /// Administrative purge. Returns whether a row was deleted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    pub async fn purge(&self, id: PlayerId) -> Result<bool, DbError> {
        let mut lease = self.pool.acquire_default().await?;
        let result = sqlx::query("DELETE FROM player_records WHERE identity_key = $1")
            .bind(id.into_inner())
            .execute(lease.connection())
            .await?;
        let deleted = result.rows_affected() > 0;
        tracing::info!(player = %id, deleted, "Purged player record");
        Ok(deleted)
    }

    /// Number of stored records.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn count(&self) -> Result<u64, DbError> {
        let mut lease = self.pool.acquire_default().await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM player_records")
            .fetch_one(lease.connection())
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Read the stored `(version, schema_version)` for conflict reporting.
async fn stored_stamp(
    conn: &mut PgConnection,
    id: PlayerId,
) -> Result<Option<(u64, u32)>, DbError> {
    let row: Option<(i64, i32)> = sqlx::query_as(
        "SELECT version, schema_version FROM player_records WHERE identity_key = $1",
    )
    .bind(id.into_inner())
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|(version, schema)| {
        (
            u64::try_from(version).unwrap_or(0),
            u32::try_from(schema).unwrap_or(0),
        )
    }))
}
