//! The persisted player record.
//!
//! A [`PlayerRecord`] is an immutable-by-convention value snapshot: the
//! cache and the bridge share it behind an `Arc`, and every change produces
//! a new record rather than mutating a shared one.
//!
//! The attribute schema is deliberately opaque. Game code decides which keys
//! exist (`balance`, `kills`, `home`), the persistence layer only guarantees
//! they round-trip. Secrets are kept apart from attributes because they are
//! sealed before storage and never written in clear to logs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::PlayerId;

/// Opaque attribute set stored as a JSON object.
pub type AttributeMap = BTreeMap<String, serde_json::Value>;

/// Opaque secret set. Values are raw bytes before sealing.
pub type SecretMap = BTreeMap<String, Vec<u8>>;

/// A player's persisted state.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    id: PlayerId,
    /// Optimistic concurrency stamp. `0` means the record has never been
    /// persisted; every successful save increments it by one.
    pub version: u64,
    /// Schema version the record was written under. Only ever increases.
    pub schema_version: u32,
    /// Mutable attributes.
    pub attributes: AttributeMap,
    /// Secret fields, sealed by the codec layer before storage.
    pub secrets: SecretMap,
    /// Wall-clock time of the last modification.
    pub updated_at: DateTime<Utc>,
}

impl PlayerRecord {
    /// Default-construct a record for a player that has no stored state yet.
    pub fn new(id: PlayerId, schema_version: u32) -> Self {
        Self {
            id,
            version: 0,
            schema_version,
            attributes: AttributeMap::new(),
            secrets: SecretMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Rebuild a record from stored parts.
    pub const fn from_parts(
        id: PlayerId,
        version: u64,
        schema_version: u32,
        attributes: AttributeMap,
        secrets: SecretMap,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            version,
            schema_version,
            attributes,
            secrets,
            updated_at,
        }
    }

    /// The identity key. There is no setter.
    pub const fn id(&self) -> PlayerId {
        self.id
    }

    /// Whether this record has been saved at least once.
    pub const fn is_persisted(&self) -> bool {
        self.version > 0
    }

    /// Look up an attribute.
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    /// Set an attribute and bump the modification time.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
        self.touch();
    }

    /// Remove an attribute, returning its previous value.
    pub fn remove_attribute(&mut self, key: &str) -> Option<serde_json::Value> {
        let previous = self.attributes.remove(key);
        if previous.is_some() {
            self.touch();
        }
        previous
    }

    /// Builder form of [`set_attribute`](Self::set_attribute).
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.set_attribute(key, value);
        self
    }

    /// Look up a secret.
    pub fn secret(&self, key: &str) -> Option<&[u8]> {
        self.secrets.get(key).map(Vec::as_slice)
    }

    /// Set a secret and bump the modification time.
    pub fn set_secret(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.secrets.insert(key.into(), value.into());
        self.touch();
    }

    /// Builder form of [`set_secret`](Self::set_secret).
    #[must_use]
    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.set_secret(key, value);
        self
    }

    /// Raise the schema version. Lower values are ignored.
    pub fn upgrade_schema(&mut self, schema_version: u32) {
        self.schema_version = self.schema_version.max(schema_version);
    }

    /// Return a copy stamped with a new version, as confirmed by the store.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Update the modification timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl core::fmt::Debug for PlayerRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Secret values never reach logs, only their names.
        f.debug_struct("PlayerRecord")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("schema_version", &self.schema_version)
            .field("attributes", &self.attributes)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_unpersisted() {
        let record = PlayerRecord::new(PlayerId::new(), 1);
        assert_eq!(record.version, 0);
        assert!(!record.is_persisted());
        assert!(record.attributes.is_empty());
        assert!(record.secrets.is_empty());
    }

    #[test]
    fn attributes_and_secrets() {
        let mut record = PlayerRecord::new(PlayerId::new(), 1)
            .with_attribute("balance", serde_json::json!(250))
            .with_secret("totp", b"JBSWY3DPEHPK3PXP".to_vec());

        assert_eq!(record.attribute("balance"), Some(&serde_json::json!(250)));
        assert_eq!(record.secret("totp"), Some(&b"JBSWY3DPEHPK3PXP"[..]));

        assert_eq!(record.remove_attribute("balance"), Some(serde_json::json!(250)));
        assert!(record.attribute("balance").is_none());
        assert!(record.remove_attribute("balance").is_none());
    }

    #[test]
    fn schema_version_never_decreases() {
        let mut record = PlayerRecord::new(PlayerId::new(), 3);
        record.upgrade_schema(2);
        assert_eq!(record.schema_version, 3);
        record.upgrade_schema(5);
        assert_eq!(record.schema_version, 5);
    }

    #[test]
    fn debug_output_redacts_secret_values() {
        let record =
            PlayerRecord::new(PlayerId::new(), 1).with_secret("totp", b"hunter2".to_vec());
        let rendered = format!("{record:?}");
        assert!(rendered.contains("totp"));
        assert!(!rendered.contains("104, 117"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn with_version_keeps_identity() {
        let record = PlayerRecord::new(PlayerId::new(), 1);
        let id = record.id();
        let stamped = record.with_version(7);
        assert_eq!(stamped.id(), id);
        assert_eq!(stamped.version, 7);
    }
}
