//! Plugin lifecycle: the hooks the host game server calls.
//!
//! ```text
//! Uninitialized --on_enable--> Running --on_disable--> Draining --> Stopped
//! ```
//!
//! Every hook runs on the simulation thread and returns without waiting on
//! the database, except `on_enable` and `on_disable`, which the host
//! expects to block. Results of background work are applied to the cache
//! only inside [`PersistencePlugin::poll`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use playervault_db::{ConnectionPool, DbError, MemoryStore, RecordBackend, RecordStore};
use playervault_types::{PlayerId, PlayerRecord};
use serde::Serialize;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::bridge::{
    Completion, TaskBridge, TaskHandle, TaskKind, TaskOutcome, TaskOutput, TaskRequest,
    build_runtime,
};
use crate::cache::{CacheEntry, PlayerCache};
use crate::config::{BridgeConfig, PersistenceConfig, StorageTarget};
use crate::error::PluginError;

/// How often `on_disable` re-checks the cache while settling final saves.
const SETTLE_INTERVAL: Duration = Duration::from_millis(5);

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PluginState {
    /// Constructed, not yet enabled.
    Uninitialized,
    /// Accepting hooks.
    Running,
    /// Shutting down; only the final flush is enqueued.
    Draining,
    /// Shut down. The pool and workers are gone.
    Stopped,
}

/// Something `poll` applied to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PollEvent {
    /// A session-start load finished and the player is now cached.
    Loaded {
        /// The player.
        player: PlayerId,
        /// `false` if a default record was created.
        found: bool,
    },
    /// A load failed. The player stays uncached; transient failures are
    /// retried in the background while the player is online.
    LoadFailed {
        /// The player.
        player: PlayerId,
        /// Whether the store was unreachable (as opposed to unreadable data).
        transient: bool,
    },
    /// A reload after a conflict moved the cached version stamp.
    Reloaded {
        /// The player.
        player: PlayerId,
        /// The stored version adopted.
        version: u64,
    },
    /// A save was acknowledged.
    Saved {
        /// The player.
        player: PlayerId,
        /// Version now stored.
        version: u64,
        /// Whether the cached entry is now clean.
        clean: bool,
    },
    /// A save failed; the entry stays dirty.
    SaveFailed {
        /// The player.
        player: PlayerId,
        /// Whether the failure was a version conflict (a reload follows).
        conflict: bool,
    },
    /// A purge finished.
    Purged {
        /// The player.
        player: PlayerId,
        /// Whether a row existed.
        deleted: bool,
    },
    /// A purge failed.
    PurgeFailed {
        /// The player.
        player: PlayerId,
    },
    /// A departed player's final save was confirmed and the entry dropped.
    Evicted {
        /// The player.
        player: PlayerId,
    },
    /// A task was cancelled before it ran.
    Cancelled {
        /// The player.
        player: PlayerId,
        /// What was cancelled.
        kind: TaskKind,
    },
}

/// Summary of an `on_disable` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Saves enqueued during shutdown.
    pub flushed: usize,
    /// Completions applied during shutdown.
    pub completed: usize,
    /// Saves that failed during shutdown.
    pub failed: usize,
    /// Players whose changes were not persisted.
    pub still_dirty: Vec<PlayerId>,
    /// Whether the shutdown deadline passed with work outstanding.
    pub timed_out: bool,
}

/// Point-in-time view for host diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    /// Lifecycle state.
    pub state: PluginState,
    /// Backend name, once enabled.
    pub backend: Option<String>,
    /// Cached players.
    pub cached: usize,
    /// Cached players with unconfirmed changes.
    pub dirty: usize,
    /// Tasks not yet delivered.
    pub in_flight: usize,
    /// Session-start loads outstanding.
    pub loading: usize,
    /// Online players waiting to retry a failed load.
    pub load_retries: usize,
}

/// Backoff for an online player whose load failed transiently.
#[derive(Debug, Clone, Copy)]
struct LoadRetry {
    failures: u32,
    due: Instant,
}

/// The persistence plugin as seen by the host.
#[derive(Debug)]
pub struct PersistencePlugin {
    state: PluginState,
    schema_version: u32,
    shutdown_timeout: Duration,
    retry_policy: BridgeConfig,
    bridge: Option<TaskBridge>,
    cache: PlayerCache,
    loading: HashMap<PlayerId, TaskHandle>,
    load_retries: HashMap<PlayerId, LoadRetry>,
    reloading: HashSet<PlayerId>,
    departing: HashSet<PlayerId>,
    unavailable: HashSet<PlayerId>,
}

impl Default for PersistencePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistencePlugin {
    /// A plugin waiting for `on_enable`.
    pub fn new() -> Self {
        Self {
            state: PluginState::Uninitialized,
            schema_version: 1,
            shutdown_timeout: Duration::from_secs(10),
            retry_policy: BridgeConfig::default(),
            bridge: None,
            cache: PlayerCache::new(),
            loading: HashMap::new(),
            load_retries: HashMap::new(),
            reloading: HashSet::new(),
            departing: HashSet::new(),
            unavailable: HashSet::new(),
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> PluginState {
        self.state
    }

    // -----------------------------------------------------------------------
    // Enable / Disable
    // -----------------------------------------------------------------------

    /// Start workers, connect the pool, and ensure the schema exists.
    ///
    /// Any failure is fatal: the plugin stays `Uninitialized` and nothing
    /// is left running.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the plugin is not `Uninitialized`, the
    /// runtime cannot start, or the database is unreachable.
    pub fn on_enable(&mut self, config: &PersistenceConfig) -> Result<(), PluginError> {
        self.require(PluginState::Uninitialized)?;
        let runtime = build_runtime(config.bridge.workers)?;
        let backend = match &config.storage {
            StorageTarget::Postgres(pool_config) => {
                let pool = runtime.block_on(ConnectionPool::connect(pool_config))?;
                RecordBackend::from(RecordStore::new(
                    pool,
                    config.sealer.clone(),
                    config.schema_version,
                ))
            }
            StorageTarget::Memory => RecordBackend::from(MemoryStore::new(
                config.sealer.clone(),
                config.schema_version,
            )),
        };
        self.start(runtime, backend, config)
    }

    /// Like [`on_enable`](Self::on_enable) but with a prebuilt backend.
    ///
    /// # Errors
    ///
    /// See [`on_enable`](Self::on_enable).
    pub fn on_enable_with_backend(
        &mut self,
        config: &PersistenceConfig,
        backend: RecordBackend,
    ) -> Result<(), PluginError> {
        self.require(PluginState::Uninitialized)?;
        let runtime = build_runtime(config.bridge.workers)?;
        self.start(runtime, backend, config)
    }

    fn start(
        &mut self,
        runtime: Runtime,
        backend: RecordBackend,
        config: &PersistenceConfig,
    ) -> Result<(), PluginError> {
        let ready = runtime.block_on(async {
            backend.probe().await?;
            backend.create_schema_if_absent().await
        });
        if let Err(e) = ready {
            runtime.block_on(backend.close());
            warn!(backend = backend.name(), error = %e, "Persistence failed to start");
            return Err(e.into());
        }

        self.schema_version = config.schema_version;
        self.shutdown_timeout = config.shutdown_timeout;
        self.retry_policy = config.bridge.clone();
        self.bridge = Some(TaskBridge::start(runtime, backend, &config.bridge));
        self.state = PluginState::Running;
        info!(
            schema_version = config.schema_version,
            encrypting = config.sealer.is_encrypting(),
            "Persistence enabled"
        );
        Ok(())
    }

    /// Flush everything, wait for outstanding work up to the shutdown
    /// timeout, then close the pool and stop the workers.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidState`] unless the plugin is running.
    pub fn on_disable(&mut self) -> Result<ShutdownReport, PluginError> {
        self.require(PluginState::Running)?;
        self.state = PluginState::Draining;
        let Some(mut bridge) = self.bridge.take() else {
            self.state = PluginState::Stopped;
            return Err(PluginError::InvalidState(PluginState::Stopped));
        };

        let deadline = Instant::now()
            .checked_add(self.shutdown_timeout)
            .unwrap_or_else(Instant::now);
        info!(
            dirty = self.cache.dirty_ids().len(),
            in_flight = bridge.in_flight(),
            timeout_ms = u64::try_from(self.shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
            "Disabling persistence"
        );

        let mut report = ShutdownReport::default();
        let mut given_up: HashSet<PlayerId> = HashSet::new();

        // Entries changed while an earlier save was in flight need another
        // save once that one is acknowledged, so settle until clean.
        loop {
            for id in self.cache.dirty_ids() {
                if given_up.contains(&id) {
                    continue;
                }
                match self.cache.flush(id, &bridge) {
                    Some(Ok(_)) => report.flushed = report.flushed.saturating_add(1),
                    Some(Err(e)) => {
                        warn!(player = %id, error = %e, "Final flush refused");
                        given_up.insert(id);
                    }
                    None => {}
                }
            }

            for event in self.apply_all(&mut bridge) {
                report.completed = report.completed.saturating_add(1);
                if let PollEvent::SaveFailed { player, conflict } = event {
                    report.failed = report.failed.saturating_add(1);
                    if !conflict {
                        given_up.insert(player);
                    }
                }
            }

            let pending = self
                .cache
                .dirty_ids()
                .into_iter()
                .any(|id| !given_up.contains(&id));
            if !pending || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(SETTLE_INTERVAL);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(e) = bridge.drain(remaining) {
            warn!(error = %e, "Shutdown deadline passed with work outstanding");
            report.timed_out = true;
        }
        for event in self.apply_all(&mut bridge) {
            report.completed = report.completed.saturating_add(1);
            if matches!(event, PollEvent::SaveFailed { .. }) {
                report.failed = report.failed.saturating_add(1);
            }
        }

        bridge.close_backend(remaining.max(SETTLE_INTERVAL));
        bridge.shutdown(remaining.max(SETTLE_INTERVAL));

        report.still_dirty = self.cache.dirty_ids();
        if !report.still_dirty.is_empty() {
            warn!(
                players = report.still_dirty.len(),
                "Shut down with unpersisted changes"
            );
        }
        self.loading.clear();
        self.load_retries.clear();
        self.state = PluginState::Stopped;
        info!(
            flushed = report.flushed,
            completed = report.completed,
            failed = report.failed,
            "Persistence disabled"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Gameplay hooks
    // -----------------------------------------------------------------------

    /// A player joined. On a cache miss a load is queued; the record is
    /// installed by a later [`poll`](Self::poll). Returns the load handle,
    /// or `None` if the player is already cached.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if not running or the bridge refuses work.
    pub fn on_session_start(&mut self, id: PlayerId) -> Result<Option<TaskHandle>, PluginError> {
        self.require(PluginState::Running)?;
        self.departing.remove(&id);
        if self.cache.contains(id) {
            return Ok(None);
        }
        if let Some(handle) = self.loading.get(&id) {
            return Ok(Some(handle.clone()));
        }

        self.unavailable.remove(&id);
        let handle = self.running_bridge()?.enqueue_load(id)?;
        self.loading.insert(id, handle.clone());
        Ok(Some(handle))
    }

    /// A player left. A dirty entry is flushed and evicted once the save
    /// is confirmed; a clean entry is evicted immediately.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidState`] if not running.
    pub fn on_session_end(&mut self, id: PlayerId) -> Result<(), PluginError> {
        self.require(PluginState::Running)?;
        if let Some(handle) = self.loading.remove(&id) {
            handle.cancel();
        }
        self.load_retries.remove(&id);
        self.unavailable.remove(&id);

        let Some(entry) = self.cache.get(id) else {
            return Ok(());
        };
        if !entry.is_dirty() && !self.cache.has_flush_in_flight(id) {
            self.cache.evict(id);
            debug!(player = %id, "Evicted clean entry at session end");
            return Ok(());
        }

        self.departing.insert(id);
        let Some(bridge) = self.bridge.as_ref() else {
            return Err(PluginError::InvalidState(self.state));
        };
        if let Some(Err(e)) = self.cache.flush(id, bridge) {
            warn!(player = %id, error = %e, "Logout flush refused; retrying at next checkpoint");
        }
        Ok(())
    }

    /// Flush every dirty entry. Returns the number of saves enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidState`] if not running.
    pub fn checkpoint(&mut self) -> Result<usize, PluginError> {
        self.require(PluginState::Running)?;
        let Some(bridge) = self.bridge.as_ref() else {
            return Err(PluginError::InvalidState(self.state));
        };
        let mut enqueued: usize = 0;
        for (id, result) in self.cache.flush_all(bridge) {
            match result {
                Ok(_) => enqueued = enqueued.saturating_add(1),
                Err(e) => warn!(player = %id, error = %e, "Checkpoint flush refused"),
            }
        }
        debug!(enqueued, "Checkpoint");
        Ok(enqueued)
    }

    /// The poll point: apply every finished task to the cache, then
    /// re-enqueue loads whose retry backoff has elapsed.
    pub fn poll(&mut self) -> Vec<PollEvent> {
        let Some(mut bridge) = self.bridge.take() else {
            return Vec::new();
        };
        let events = self.apply_all(&mut bridge);
        self.retry_due_loads(&bridge);
        self.bridge = Some(bridge);
        events
    }

    /// Cached entry for the player. Never blocks; `None` is a miss.
    pub fn get(&self, id: PlayerId) -> Option<Arc<CacheEntry>> {
        self.cache.get(id)
    }

    /// Apply a write to the player's cached record.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotLoaded`] on a miss,
    /// [`PluginError::Unavailable`] if the stored record could not be read,
    /// or [`PluginError::InvalidState`] if not running.
    pub fn update<F>(&mut self, id: PlayerId, f: F) -> Result<Arc<CacheEntry>, PluginError>
    where
        F: FnOnce(&mut PlayerRecord),
    {
        self.require(PluginState::Running)?;
        if self.unavailable.contains(&id) {
            return Err(PluginError::Unavailable(id));
        }
        self.cache.update(id, f).ok_or(PluginError::NotLoaded(id))
    }

    /// Administrative purge: drop the player from the cache and delete the
    /// stored record. Runs after any save already queued for the player.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if not running or the bridge refuses work.
    pub fn purge(&mut self, id: PlayerId) -> Result<TaskHandle, PluginError> {
        self.require(PluginState::Running)?;
        if let Some(handle) = self.loading.remove(&id) {
            handle.cancel();
        }
        self.load_retries.remove(&id);
        self.cache.evict(id);
        self.departing.remove(&id);
        self.reloading.remove(&id);
        self.unavailable.remove(&id);
        let handle = self.running_bridge()?.enqueue_purge(id)?;
        info!(player = %id, "Purge queued");
        Ok(handle)
    }

    /// Diagnostics snapshot.
    pub fn status(&self) -> PluginStatus {
        PluginStatus {
            state: self.state,
            backend: self.bridge.as_ref().map(|b| b.backend().name().to_owned()),
            cached: self.cache.len(),
            dirty: self.cache.dirty_ids().len(),
            in_flight: self.bridge.as_ref().map_or(0, TaskBridge::in_flight),
            loading: self.loading.len(),
            load_retries: self.load_retries.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Completion handling
    // -----------------------------------------------------------------------

    fn apply_all(&mut self, bridge: &mut TaskBridge) -> Vec<PollEvent> {
        let mut events = Vec::new();
        for completion in bridge.poll_completions() {
            self.apply(completion, bridge, &mut events);
        }
        events
    }

    fn apply(&mut self, completion: Completion, bridge: &TaskBridge, events: &mut Vec<PollEvent>) {
        let player = completion.request.player();
        let task = completion.handle.id();

        match (&completion.request, &*completion.outcome) {
            (request, TaskOutcome::Cancelled) => {
                if request.kind() == TaskKind::Save {
                    self.cache.settle_flush(player, task);
                }
                events.push(PollEvent::Cancelled {
                    player,
                    kind: request.kind(),
                });
            }
            (TaskRequest::Load(_), TaskOutcome::Completed(TaskOutput::Loaded(found))) => {
                self.apply_load(player, task, found.as_ref(), bridge, events);
            }
            (TaskRequest::Load(_), TaskOutcome::Failed(e)) => {
                self.apply_load_failure(player, task, e, events);
            }
            (TaskRequest::Save(_), TaskOutcome::Completed(TaskOutput::Saved(ack))) => {
                let Some(revision) = self.cache.settle_flush(player, task) else {
                    debug!(player = %player, task, "Ack for an evicted entry");
                    return;
                };
                let clean = self.cache.confirm_flush(player, revision, *ack);
                events.push(PollEvent::Saved {
                    player,
                    version: ack.version,
                    clean,
                });
                if self.departing.contains(&player) {
                    if clean {
                        self.cache.evict(player);
                        self.departing.remove(&player);
                        events.push(PollEvent::Evicted { player });
                    } else if let Some(Err(e)) = self.cache.flush(player, bridge) {
                        warn!(player = %player, error = %e, "Follow-up logout flush refused");
                    }
                }
            }
            (TaskRequest::Save(_), TaskOutcome::Failed(e)) => {
                self.cache.settle_flush(player, task);
                let conflict = e.is_conflict();
                if conflict {
                    warn!(
                        player = %player,
                        error = %e,
                        "Save conflicted; reloading stored version"
                    );
                    if self.reloading.insert(player) {
                        if let Err(e) = bridge.enqueue_load(player) {
                            self.reloading.remove(&player);
                            warn!(player = %player, error = %e, "Reload refused");
                        }
                    }
                } else {
                    warn!(
                        player = %player,
                        error = %e,
                        attempts = completion.attempts,
                        "Save failed; entry stays dirty"
                    );
                }
                events.push(PollEvent::SaveFailed { player, conflict });
            }
            (TaskRequest::Purge(_), TaskOutcome::Completed(TaskOutput::Purged(deleted))) => {
                events.push(PollEvent::Purged {
                    player,
                    deleted: *deleted,
                });
            }
            (TaskRequest::Purge(_), TaskOutcome::Failed(e)) => {
                warn!(player = %player, error = %e, "Purge failed");
                events.push(PollEvent::PurgeFailed { player });
            }
            (request, TaskOutcome::Completed(output)) => {
                warn!(player = %player, kind = ?request.kind(), ?output, "Mismatched task output");
            }
        }
    }

    fn apply_load(
        &mut self,
        player: PlayerId,
        task: u64,
        found: Option<&PlayerRecord>,
        bridge: &TaskBridge,
        events: &mut Vec<PollEvent>,
    ) {
        if self.reloading.remove(&player) && self.cache.contains(player) {
            let version = found.map_or(0, |record| record.version);
            self.cache.rebase(player, version);
            events.push(PollEvent::Reloaded { player, version });
            if self.departing.contains(&player) {
                if let Some(Err(e)) = self.cache.flush(player, bridge) {
                    warn!(player = %player, error = %e, "Flush after reload refused");
                }
            }
            return;
        }

        if !self.is_current_load(player, task) {
            debug!(player = %player, task, "Discarding stale load");
            return;
        }
        self.loading.remove(&player);
        self.load_retries.remove(&player);

        let record = found
            .cloned()
            .unwrap_or_else(|| PlayerRecord::new(player, self.schema_version));
        self.cache.put(record);
        events.push(PollEvent::Loaded {
            player,
            found: found.is_some(),
        });
    }

    fn apply_load_failure(
        &mut self,
        player: PlayerId,
        task: u64,
        error: &DbError,
        events: &mut Vec<PollEvent>,
    ) {
        if self.reloading.remove(&player) {
            warn!(player = %player, error = %error, "Reload after conflict failed");
            return;
        }
        if !self.is_current_load(player, task) {
            return;
        }
        self.loading.remove(&player);

        let transient = error.is_transient();
        if transient {
            let failures = self
                .load_retries
                .get(&player)
                .map_or(1, |retry| retry.failures.saturating_add(1));
            let delay = self.retry_policy.retry_delay(failures.saturating_sub(1));
            let due = Instant::now().checked_add(delay).unwrap_or_else(Instant::now);
            self.load_retries.insert(player, LoadRetry { failures, due });
            warn!(
                player = %player,
                error = %error,
                failures,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Load failed; retrying in background"
            );
        } else {
            self.load_retries.remove(&player);
            warn!(
                player = %player,
                error = %error,
                "Stored record unreadable; player marked unavailable"
            );
            self.unavailable.insert(player);
        }
        events.push(PollEvent::LoadFailed { player, transient });
    }

    fn retry_due_loads(&mut self, bridge: &TaskBridge) {
        let now = Instant::now();
        let due: Vec<PlayerId> = self
            .load_retries
            .iter()
            .filter(|(id, retry)| retry.due <= now && !self.loading.contains_key(*id))
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            if self.cache.contains(id) {
                self.load_retries.remove(&id);
                continue;
            }
            match bridge.enqueue_load(id) {
                Ok(handle) => {
                    debug!(player = %id, task = handle.id(), "Retrying load");
                    self.loading.insert(id, handle);
                }
                Err(e) => warn!(player = %id, error = %e, "Load retry refused"),
            }
        }
    }

    fn is_current_load(&self, player: PlayerId, task: u64) -> bool {
        self.loading
            .get(&player)
            .is_some_and(|handle| handle.id() == task)
    }

    fn running_bridge(&self) -> Result<&TaskBridge, PluginError> {
        self.bridge
            .as_ref()
            .ok_or(PluginError::InvalidState(self.state))
    }

    const fn require(&self, expected: PluginState) -> Result<(), PluginError> {
        if matches!(
            (self.state, expected),
            (PluginState::Uninitialized, PluginState::Uninitialized)
                | (PluginState::Running, PluginState::Running)
        ) {
            Ok(())
        } else {
            Err(PluginError::InvalidState(self.state))
        }
    }
}

impl Drop for PersistencePlugin {
    fn drop(&mut self) {
        if self.state == PluginState::Running {
            let dirty = self.cache.dirty_ids().len();
            warn!(dirty, "Persistence dropped without on_disable; unflushed changes are lost");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use playervault_db::SecretSealer;
    use serde_json::json;

    use super::*;
    use crate::config::BridgeConfig;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> PersistenceConfig {
        PersistenceConfig {
            bridge: BridgeConfig {
                workers: 2,
                lanes: 4,
                max_retries: 0,
                retry_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            },
            shutdown_timeout: WAIT,
            ..PersistenceConfig::in_memory()
        }
    }

    fn enabled(store: &MemoryStore) -> PersistencePlugin {
        let mut plugin = PersistencePlugin::new();
        plugin
            .on_enable_with_backend(&config(), RecordBackend::from(store.clone()))
            .unwrap();
        plugin
    }

    fn seed(store: &MemoryStore, record: &PlayerRecord) -> u64 {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(store.save(record)).unwrap().version
    }

    fn stored_version(store: &MemoryStore, id: PlayerId) -> Option<u64> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(store.stored_version(id))
    }

    fn poll_until<F>(plugin: &mut PersistencePlugin, mut done: F) -> Vec<PollEvent>
    where
        F: FnMut(&PersistencePlugin, &[PollEvent]) -> bool,
    {
        let deadline = Instant::now().checked_add(WAIT).unwrap();
        let mut events = Vec::new();
        loop {
            events.extend(plugin.poll());
            if done(plugin, &events) {
                return events;
            }
            assert!(Instant::now() < deadline, "timed out; events so far: {events:?}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn join(plugin: &mut PersistencePlugin, id: PlayerId) {
        plugin.on_session_start(id).unwrap();
        poll_until(plugin, |p, _| p.get(id).is_some());
    }

    #[test]
    fn lifecycle_state_machine() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        let mut plugin = PersistencePlugin::new();
        assert_eq!(plugin.state(), PluginState::Uninitialized);
        assert!(matches!(
            plugin.on_session_start(PlayerId::new()),
            Err(PluginError::InvalidState(PluginState::Uninitialized))
        ));
        assert!(plugin.on_disable().is_err());

        plugin
            .on_enable_with_backend(&config(), RecordBackend::from(store.clone()))
            .unwrap();
        assert_eq!(plugin.state(), PluginState::Running);
        assert_eq!(plugin.status().backend.as_deref(), Some("memory"));
        assert!(plugin.on_enable(&config()).is_err());

        let report = plugin.on_disable().unwrap();
        assert_eq!(report, ShutdownReport::default());
        assert_eq!(plugin.state(), PluginState::Stopped);
        assert!(store.is_closed());

        assert!(plugin.on_disable().is_err());
        assert!(plugin.checkpoint().is_err());
        assert!(plugin.poll().is_empty());
    }

    #[test]
    fn enable_fails_when_store_is_unreachable() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        store.set_offline(true);
        let mut plugin = PersistencePlugin::new();
        let err = plugin
            .on_enable_with_backend(&config(), RecordBackend::from(store))
            .unwrap_err();
        assert!(matches!(err, PluginError::Store(ref e) if e.is_transient()));
        assert_eq!(plugin.state(), PluginState::Uninitialized);
    }

    #[test]
    fn in_memory_enable_from_config() {
        let mut plugin = PersistencePlugin::new();
        plugin.on_enable(&config()).unwrap();
        let id = PlayerId::new();
        join(&mut plugin, id);
        plugin.update(id, |r| r.set_attribute("hp", json!(20))).unwrap();
        let report = plugin.on_disable().unwrap();
        assert_eq!(report.flushed, 1);
        assert!(report.still_dirty.is_empty());
    }

    #[test]
    fn new_player_gets_default_record() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        let mut plugin = enabled(&store);
        let id = PlayerId::new();

        let handle = plugin.on_session_start(id).unwrap().unwrap();
        assert!(plugin.get(id).is_none(), "miss until the poll point");
        assert_eq!(plugin.on_session_start(id).unwrap().unwrap().id(), handle.id());

        let events = poll_until(&mut plugin, |p, _| p.get(id).is_some());
        assert!(events.contains(&PollEvent::Loaded { player: id, found: false }));
        let entry = plugin.get(id).unwrap();
        assert_eq!(entry.record().version, 0);
        assert!(!entry.is_dirty());

        assert!(plugin.on_session_start(id).unwrap().is_none());
        plugin.on_disable().unwrap();
    }

    #[test]
    fn returning_player_gets_stored_record() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        let record = PlayerRecord::new(PlayerId::new(), 1).with_attribute("coins", json!(40));
        seed(&store, &record);

        let mut plugin = enabled(&store);
        join(&mut plugin, record.id());
        let entry = plugin.get(record.id()).unwrap();
        assert_eq!(entry.record().version, 1);
        assert_eq!(entry.record().attribute("coins"), Some(&json!(40)));
        plugin.on_disable().unwrap();
    }

    #[test]
    fn checkpoint_persists_dirty_entries() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        let mut plugin = enabled(&store);
        let id = PlayerId::new();
        join(&mut plugin, id);

        plugin.update(id, |r| r.set_attribute("xp", json!(10))).unwrap();
        assert!(plugin.get(id).unwrap().is_dirty());
        assert_eq!(plugin.checkpoint().unwrap(), 1);

        let events = poll_until(&mut plugin, |p, _| !p.get(id).unwrap().is_dirty());
        assert!(events.contains(&PollEvent::Saved { player: id, version: 1, clean: true }));
        assert_eq!(plugin.get(id).unwrap().record().version, 1);
        assert_eq!(plugin.checkpoint().unwrap(), 0);
        plugin.on_disable().unwrap();
        assert_eq!(stored_version(&store, id), Some(1));
    }

    #[test]
    fn session_end_flushes_then_evicts() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        let mut plugin = enabled(&store);
        let dirty = PlayerId::new();
        let clean = PlayerId::new();
        join(&mut plugin, dirty);
        join(&mut plugin, clean);

        plugin.update(dirty, |r| r.set_attribute("pos", json!([1, 2]))).unwrap();
        plugin.on_session_end(clean).unwrap();
        assert!(plugin.get(clean).is_none());

        plugin.on_session_end(dirty).unwrap();
        assert!(plugin.get(dirty).is_some(), "kept until the save is confirmed");
        let events = poll_until(&mut plugin, |p, _| p.get(dirty).is_none());
        assert!(events.contains(&PollEvent::Evicted { player: dirty }));
        plugin.on_disable().unwrap();
        assert_eq!(stored_version(&store, dirty), Some(1));
        assert_eq!(stored_version(&store, clean), None);
    }

    #[test]
    fn conflict_reloads_and_rebases() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        let mut plugin = enabled(&store);
        let id = PlayerId::new();
        join(&mut plugin, id);

        // Another writer gets there first.
        seed(&store, &PlayerRecord::new(id, 1).with_attribute("by", json!("other")));

        plugin.update(id, |r| r.set_attribute("by", json!("us"))).unwrap();
        plugin.checkpoint().unwrap();
        let events = poll_until(&mut plugin, |_, events| {
            events.iter().any(|e| matches!(e, PollEvent::Reloaded { .. }))
        });
        assert!(events.contains(&PollEvent::SaveFailed { player: id, conflict: true }));
        assert!(events.contains(&PollEvent::Reloaded { player: id, version: 1 }));

        let entry = plugin.get(id).unwrap();
        assert!(entry.is_dirty());
        assert_eq!(entry.record().version, 1);
        assert_eq!(entry.record().attribute("by"), Some(&json!("us")));

        plugin.checkpoint().unwrap();
        poll_until(&mut plugin, |p, _| !p.get(id).unwrap().is_dirty());
        assert_eq!(plugin.get(id).unwrap().record().version, 2);
        plugin.on_disable().unwrap();
    }

    #[test]
    fn unreadable_record_is_unavailable_not_defaulted() {
        let keyed = MemoryStore::new(SecretSealer::with_key(&[5u8; 32]).unwrap(), 1);
        let record = PlayerRecord::new(PlayerId::new(), 1).with_secret("pin", b"0000".to_vec());
        seed(&keyed, &record);

        let keyless = keyed.reopen(SecretSealer::plaintext(), 1);
        let mut plugin = enabled(&keyless);
        let id = record.id();
        plugin.on_session_start(id).unwrap();
        let events = poll_until(&mut plugin, |_, events| !events.is_empty());

        assert_eq!(events, vec![PollEvent::LoadFailed { player: id, transient: false }]);
        assert!(plugin.get(id).is_none());
        assert!(matches!(
            plugin.update(id, |_| {}),
            Err(PluginError::Unavailable(p)) if p == id
        ));
        plugin.on_disable().unwrap();
    }

    #[test]
    fn transient_load_failure_is_retried_in_background() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        let mut plugin = enabled(&store);
        let id = PlayerId::new();

        store.set_offline(true);
        plugin.on_session_start(id).unwrap();
        let events = poll_until(&mut plugin, |_, events| !events.is_empty());
        assert_eq!(events, vec![PollEvent::LoadFailed { player: id, transient: true }]);
        assert!(matches!(
            plugin.update(id, |_| {}),
            Err(PluginError::NotLoaded(p)) if p == id
        ));
        assert_eq!(plugin.status().load_retries, 1);

        store.set_offline(false);
        let events = poll_until(&mut plugin, |p, _| p.get(id).is_some());
        assert!(events.contains(&PollEvent::Loaded { player: id, found: false }));
        assert_eq!(plugin.status().load_retries, 0);

        plugin.update(id, |r| r.set_attribute("hp", json!(5))).unwrap();
        plugin.on_disable().unwrap();
        assert_eq!(stored_version(&store, id), Some(1));
    }

    #[test]
    fn load_retry_stops_when_player_leaves() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        let mut plugin = enabled(&store);
        let id = PlayerId::new();

        store.set_offline(true);
        plugin.on_session_start(id).unwrap();
        poll_until(&mut plugin, |_, events| !events.is_empty());
        plugin.on_session_end(id).unwrap();
        assert_eq!(plugin.status().load_retries, 0);

        store.set_offline(false);
        let operations = store.operations();
        for _ in 0..20 {
            assert!(plugin.poll().is_empty());
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.operations(), operations);
        assert!(plugin.get(id).is_none());
        plugin.on_disable().unwrap();
    }

    #[test]
    fn timed_out_wait_still_delivers_at_poll() {
        let store = MemoryStore::with_limits(
            SecretSealer::plaintext(),
            1,
            8,
            Duration::from_secs(1),
            Duration::from_millis(150),
        );
        let mut plugin = enabled(&store);
        let id = PlayerId::new();

        let handle = plugin.on_session_start(id).unwrap().unwrap();
        assert!(handle.wait(Duration::from_millis(10)).is_none());
        assert!(!handle.state().is_terminal());
        assert!(plugin.get(id).is_none());

        let events = poll_until(&mut plugin, |p, _| p.get(id).is_some());
        assert!(events.contains(&PollEvent::Loaded { player: id, found: false }));
        assert!(handle.try_outcome().is_some());
        plugin.on_disable().unwrap();
    }

    #[test]
    fn failed_save_keeps_entry_dirty_until_store_returns() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        let mut plugin = enabled(&store);
        let id = PlayerId::new();
        join(&mut plugin, id);

        store.set_offline(true);
        plugin.update(id, |r| r.set_attribute("gold", json!(3))).unwrap();
        plugin.checkpoint().unwrap();
        let events = poll_until(&mut plugin, |_, events| !events.is_empty());
        assert_eq!(events, vec![PollEvent::SaveFailed { player: id, conflict: false }]);
        assert!(plugin.get(id).unwrap().is_dirty());

        store.set_offline(false);
        plugin.checkpoint().unwrap();
        poll_until(&mut plugin, |p, _| !p.get(id).unwrap().is_dirty());
        plugin.on_disable().unwrap();
        assert_eq!(stored_version(&store, id), Some(1));
    }

    #[test]
    fn purge_deletes_and_evicts() {
        let store = MemoryStore::new(SecretSealer::plaintext(), 1);
        let record = PlayerRecord::new(PlayerId::new(), 1);
        seed(&store, &record);
        let mut plugin = enabled(&store);
        join(&mut plugin, record.id());

        plugin.purge(record.id()).unwrap();
        assert!(plugin.get(record.id()).is_none());
        let events = poll_until(&mut plugin, |_, events| !events.is_empty());
        assert_eq!(events, vec![PollEvent::Purged { player: record.id(), deleted: true }]);
        plugin.on_disable().unwrap();
        assert_eq!(stored_version(&store, record.id()), None);
    }

    #[test]
    fn disable_persists_dirty_and_in_flight_work_before_closing() {
        let store = MemoryStore::with_limits(
            SecretSealer::plaintext(),
            1,
            8,
            Duration::from_secs(1),
            Duration::from_millis(30),
        );
        let mut plugin = enabled(&store);
        let players: Vec<PlayerId> = (0..8).map(|_| PlayerId::new()).collect();
        for id in &players {
            plugin.on_session_start(*id).unwrap();
        }
        poll_until(&mut plugin, |p, _| players.iter().all(|id| p.get(*id).is_some()));

        let (in_flight, dirty) = players.split_at(3);
        for id in in_flight {
            plugin.update(*id, |r| r.set_attribute("stage", json!(1))).unwrap();
        }
        assert_eq!(plugin.checkpoint().unwrap(), 3);
        for id in dirty {
            plugin.update(*id, |r| r.set_attribute("stage", json!(1))).unwrap();
        }
        // Changed again while its first save is still in flight.
        let changed_twice = *in_flight.first().unwrap();
        plugin.update(changed_twice, |r| r.set_attribute("stage", json!(2))).unwrap();
        assert_eq!(plugin.status().dirty, 8);

        let report = plugin.on_disable().unwrap();
        assert!(report.still_dirty.is_empty(), "{report:?}");
        assert!(!report.timed_out);
        assert_eq!(report.failed, 0);
        assert!(store.is_closed());

        for id in &players {
            let expected = if *id == changed_twice { 2 } else { 1 };
            assert_eq!(stored_version(&store, *id), Some(expected), "player {id}");
        }
    }
}
