//! In-memory player cache with write-behind persistence.
//!
//! Owned by the simulation thread; nothing here blocks or touches the
//! database. Entries are immutable [`Arc`] snapshots: every write builds a
//! new entry with a fresh revision, so a snapshot handed to a save task can
//! never change underneath it.
//!
//! A dirty entry becomes clean only when the store acknowledges a save of
//! that exact revision. If the player changed again while the save was in
//! flight, the acknowledgement only moves the entry's version stamp forward
//! and it stays dirty for the next flush. At most one save per player is in
//! flight at any time.

use std::collections::HashMap;
use std::sync::Arc;

use playervault_db::Ack;
use playervault_types::{PlayerId, PlayerRecord};

use crate::bridge::{TaskBridge, TaskHandle};
use crate::error::BridgeError;

/// A cached record snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    record: Arc<PlayerRecord>,
    dirty: bool,
    revision: u64,
}

impl CacheEntry {
    /// The cached record.
    pub fn record(&self) -> &PlayerRecord {
        &self.record
    }

    /// A shared handle to the record, as sent to save tasks.
    pub fn snapshot(&self) -> Arc<PlayerRecord> {
        Arc::clone(&self.record)
    }

    /// Whether the entry has changes not yet confirmed by the store.
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Monotonic revision, bumped on every local write.
    pub const fn revision(&self) -> u64 {
        self.revision
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlightSave {
    task: u64,
    revision: u64,
}

/// Player identity to last-known record.
#[derive(Debug, Default)]
pub struct PlayerCache {
    entries: HashMap<PlayerId, Arc<CacheEntry>>,
    in_flight: HashMap<PlayerId, InFlightSave>,
    next_revision: u64,
}

impl PlayerCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached entry, or `None` on a miss.
    pub fn get(&self, id: PlayerId) -> Option<Arc<CacheEntry>> {
        self.entries.get(&id).cloned()
    }

    /// Whether the player is cached.
    pub fn contains(&self, id: PlayerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of cached players.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install a record the store has confirmed, as a clean entry.
    pub fn put(&mut self, record: PlayerRecord) -> Arc<CacheEntry> {
        self.install(Arc::new(record), false)
    }

    /// Mark an entry dirty without changing it. Returns `false` on a miss.
    pub fn mark_dirty(&mut self, id: PlayerId) -> bool {
        let Some(current) = self.entries.get(&id) else {
            return false;
        };
        let record = current.snapshot();
        self.install(record, true);
        true
    }

    /// Apply a write from the simulation thread.
    ///
    /// `f` edits a copy of the record; the result replaces the entry and is
    /// marked dirty. Identity and version stamp are owned by the store and
    /// any change `f` makes to the version is discarded, as is any attempt
    /// to lower the schema version. Returns `None` on a miss.
    pub fn update<F>(&mut self, id: PlayerId, f: F) -> Option<Arc<CacheEntry>>
    where
        F: FnOnce(&mut PlayerRecord),
    {
        let current = self.entries.get(&id)?;
        let previous = current.record();
        let (version, schema_version) = (previous.version, previous.schema_version);

        let mut record = previous.clone();
        f(&mut record);
        record.version = version;
        record.schema_version = record.schema_version.max(schema_version);
        record.touch();

        Some(self.install(Arc::new(record), true))
    }

    /// Enqueue a save of the player's entry if it is dirty and no save for
    /// it is already in flight. Returns `None` when nothing was enqueued.
    pub fn flush(
        &mut self,
        id: PlayerId,
        bridge: &TaskBridge,
    ) -> Option<Result<TaskHandle, BridgeError>> {
        if self.in_flight.contains_key(&id) {
            return None;
        }
        let entry = self.entries.get(&id).filter(|entry| entry.dirty)?;
        let revision = entry.revision;
        let result = bridge.enqueue_save(entry.snapshot());
        if let Ok(handle) = &result {
            self.in_flight.insert(
                id,
                InFlightSave {
                    task: handle.id(),
                    revision,
                },
            );
            tracing::debug!(player = %id, revision, task = handle.id(), "Flush enqueued");
        }
        Some(result)
    }

    /// Flush every dirty entry. Entries with a save already in flight are
    /// skipped; they are picked up by a later flush.
    pub fn flush_all(
        &mut self,
        bridge: &TaskBridge,
    ) -> Vec<(PlayerId, Result<TaskHandle, BridgeError>)> {
        self.dirty_ids()
            .into_iter()
            .filter_map(|id| self.flush(id, bridge).map(|result| (id, result)))
            .collect()
    }

    /// Whether a save for the player is in flight.
    pub fn has_flush_in_flight(&self, id: PlayerId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Forget the in-flight save `task` for `id`, returning the revision it
    /// carried. `None` if `task` is not the tracked save.
    pub fn settle_flush(&mut self, id: PlayerId, task: u64) -> Option<u64> {
        match self.in_flight.get(&id).copied() {
            Some(save) if save.task == task => {
                let revision = save.revision;
                self.in_flight.remove(&id);
                Some(revision)
            }
            _ => None,
        }
    }

    /// Apply a save acknowledgement for `revision`.
    ///
    /// The entry adopts the acknowledged version stamp. It becomes clean
    /// only if it is still at `revision`. Returns whether it is now clean.
    pub fn confirm_flush(&mut self, id: PlayerId, revision: u64, ack: Ack) -> bool {
        let Some(current) = self.entries.get(&id) else {
            return false;
        };
        let unchanged = current.revision == revision;
        let record = current.record().clone().with_version(ack.version);
        let entry = Arc::new(CacheEntry {
            record: Arc::new(record),
            dirty: current.dirty && !unchanged,
            revision: current.revision,
        });
        let clean = !entry.dirty;
        self.entries.insert(id, entry);
        clean
    }

    /// Move the entry's version stamp to `version` (after a conflict
    /// reload), keeping its contents and leaving it dirty.
    pub fn rebase(&mut self, id: PlayerId, version: u64) -> bool {
        let Some(current) = self.entries.get(&id) else {
            return false;
        };
        let record = current.record().clone().with_version(version);
        let entry = Arc::new(CacheEntry {
            record: Arc::new(record),
            dirty: true,
            revision: current.revision,
        });
        self.entries.insert(id, entry);
        true
    }

    /// Remove a player from the cache.
    pub fn evict(&mut self, id: PlayerId) -> Option<Arc<CacheEntry>> {
        self.in_flight.remove(&id);
        self.entries.remove(&id)
    }

    /// Players with unconfirmed changes, in a stable order.
    pub fn dirty_ids(&self) -> Vec<PlayerId> {
        let mut ids: Vec<PlayerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn install(&mut self, record: Arc<PlayerRecord>, dirty: bool) -> Arc<CacheEntry> {
        self.next_revision = self.next_revision.saturating_add(1);
        let entry = Arc::new(CacheEntry {
            record,
            dirty,
            revision: self.next_revision,
        });
        self.entries.insert(entry.record.id(), Arc::clone(&entry));
        entry
    }
}
