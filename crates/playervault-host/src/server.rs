//! A simulated game server that drives the persistence plugin.
//!
//! Each tick players may join or leave, every online player earns a
//! little progress, and the plugin is polled. A checkpoint runs every
//! `checkpoint_every` ticks.

use std::time::Duration;

use playervault_core::{PersistencePlugin, PluginError, PollEvent};
use playervault_types::PlayerId;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::HostError;

/// Chance per tick that a player joins.
const JOIN_CHANCE: f64 = 0.35;

/// Chance per tick that an online player leaves.
const LEAVE_CHANCE: f64 = 0.05;

/// Chance that a joining player is a returning one.
const RETURN_CHANCE: f64 = 0.5;

/// Harness settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Ticks to simulate before disabling the plugin.
    pub ticks: u64,
    /// Wall-clock time per tick.
    pub tick_interval: Duration,
    /// Ticks between checkpoints.
    pub checkpoint_every: u64,
    /// Cap on concurrently online players.
    pub max_online: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            ticks: 200,
            tick_interval: Duration::from_millis(50),
            checkpoint_every: 20,
            max_online: 16,
        }
    }
}

impl HarnessConfig {
    /// Read `PLAYERVAULT_HARNESS_*` overrides, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Harness`] if a value does not parse or is zero.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, HostError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let interval_ms = u64::try_from(defaults.tick_interval.as_millis()).unwrap_or(u64::MAX);
        Ok(Self {
            ticks: positive(&lookup, "PLAYERVAULT_HARNESS_TICKS", defaults.ticks)?,
            tick_interval: Duration::from_millis(positive(
                &lookup,
                "PLAYERVAULT_HARNESS_TICK_MS",
                interval_ms,
            )?),
            checkpoint_every: positive(
                &lookup,
                "PLAYERVAULT_HARNESS_CHECKPOINT_EVERY",
                defaults.checkpoint_every,
            )?,
            max_online: usize::try_from(positive(
                &lookup,
                "PLAYERVAULT_HARNESS_MAX_ONLINE",
                u64::try_from(defaults.max_online).unwrap_or(u64::MAX),
            )?)
            .unwrap_or(usize::MAX),
        })
    }
}

fn positive<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, HostError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(HostError::Harness {
            name,
            message: String::from("must be at least 1"),
        }),
        Ok(value) => Ok(value),
        Err(e) => Err(HostError::Harness {
            name,
            message: e.to_string(),
        }),
    }
}

/// Counters reported when the run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HarnessStats {
    /// Ticks simulated.
    pub ticks: u64,
    /// Session starts issued.
    pub joins: u64,
    /// Session ends issued.
    pub leaves: u64,
    /// Updates applied to cached records.
    pub updates: u64,
    /// Updates skipped because the record was not cached yet.
    pub skipped_updates: u64,
    /// Saves acknowledged.
    pub saves: u64,
    /// Loads and saves that failed.
    pub failures: u64,
}

/// The simulated server.
#[derive(Debug)]
pub struct SimulatedServer {
    config: HarnessConfig,
    online: Vec<PlayerId>,
    offline: Vec<PlayerId>,
    stats: HarnessStats,
}

impl SimulatedServer {
    /// A server with no players yet.
    pub const fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            online: Vec::new(),
            offline: Vec::new(),
            stats: HarnessStats {
                ticks: 0,
                joins: 0,
                leaves: 0,
                updates: 0,
                skipped_updates: 0,
                saves: 0,
                failures: 0,
            },
        }
    }

    /// Counters so far.
    pub const fn stats(&self) -> HarnessStats {
        self.stats
    }

    /// Players currently online.
    pub fn online(&self) -> &[PlayerId] {
        &self.online
    }

    /// Run every configured tick, sleeping between them.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Plugin`] if a hook reports the plugin is not
    /// running.
    pub fn run(&mut self, plugin: &mut PersistencePlugin) -> Result<HarnessStats, HostError> {
        let mut rng = rand::rng();
        for _ in 0..self.config.ticks {
            self.tick(plugin, &mut rng)?;
            std::thread::sleep(self.config.tick_interval);
        }
        info!(stats = %json!(self.stats), "Simulation finished");
        Ok(self.stats)
    }

    /// One tick: sessions, gameplay writes, checkpoint, poll.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Plugin`] if a hook fails.
    pub fn tick<R: Rng>(
        &mut self,
        plugin: &mut PersistencePlugin,
        rng: &mut R,
    ) -> Result<(), HostError> {
        self.stats.ticks = self.stats.ticks.saturating_add(1);
        let tick = self.stats.ticks;

        if self.online.len() < self.config.max_online && rng.random_bool(JOIN_CHANCE) {
            self.join(plugin, rng)?;
        }
        if !self.online.is_empty() && rng.random_bool(LEAVE_CHANCE) {
            let index = rng.random_range(0..self.online.len());
            let id = self.online.swap_remove(index);
            plugin.on_session_end(id)?;
            self.offline.push(id);
            self.stats.leaves = self.stats.leaves.saturating_add(1);
            debug!(player = %id, tick, "Player left");
        }

        for id in self.online.clone() {
            let coins: i64 = rng.random_range(0..5);
            match plugin.update(id, |record| {
                let played = record
                    .attribute("ticks_played")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0);
                let balance = record
                    .attribute("coins")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0);
                record.set_attribute("ticks_played", json!(played.saturating_add(1)));
                record.set_attribute("coins", json!(balance.saturating_add(coins)));
            }) {
                Ok(_) => self.stats.updates = self.stats.updates.saturating_add(1),
                Err(PluginError::NotLoaded(_) | PluginError::Unavailable(_)) => {
                    self.stats.skipped_updates = self.stats.skipped_updates.saturating_add(1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if tick.checked_rem(self.config.checkpoint_every) == Some(0) {
            let enqueued = plugin.checkpoint()?;
            info!(tick, enqueued, status = %json!(plugin.status()), "Checkpoint");
        }

        for event in plugin.poll() {
            self.record(&event);
        }
        Ok(())
    }

    fn join<R: Rng>(
        &mut self,
        plugin: &mut PersistencePlugin,
        rng: &mut R,
    ) -> Result<(), HostError> {
        let id = if !self.offline.is_empty() && rng.random_bool(RETURN_CHANCE) {
            let index = rng.random_range(0..self.offline.len());
            self.offline.swap_remove(index)
        } else {
            PlayerId::new()
        };
        plugin.on_session_start(id)?;
        self.online.push(id);
        self.stats.joins = self.stats.joins.saturating_add(1);
        debug!(player = %id, "Player joined");
        Ok(())
    }

    fn record(&mut self, event: &PollEvent) {
        match event {
            PollEvent::Loaded { player, found } => {
                debug!(player = %player, found, "Record cached");
            }
            PollEvent::Saved { .. } => self.stats.saves = self.stats.saves.saturating_add(1),
            PollEvent::LoadFailed { .. } | PollEvent::SaveFailed { .. } => {
                self.stats.failures = self.stats.failures.saturating_add(1);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::collections::HashMap;

    use playervault_core::PersistenceConfig;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn harness_config_defaults_and_overrides() {
        assert_eq!(HarnessConfig::from_lookup(|_| None).unwrap(), HarnessConfig::default());

        let vars: HashMap<&str, &str> = [
            ("PLAYERVAULT_HARNESS_TICKS", "12"),
            ("PLAYERVAULT_HARNESS_TICK_MS", "1"),
        ]
        .into_iter()
        .collect();
        let config =
            HarnessConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_owned())).unwrap();
        assert_eq!(config.ticks, 12);
        assert_eq!(config.tick_interval, Duration::from_millis(1));
        assert_eq!(config.checkpoint_every, 20);
    }

    #[test]
    fn harness_config_rejects_zero_and_garbage() {
        let zero = HarnessConfig::from_lookup(|name| {
            (name == "PLAYERVAULT_HARNESS_CHECKPOINT_EVERY").then(|| String::from("0"))
        });
        assert!(matches!(
            zero,
            Err(HostError::Harness { name: "PLAYERVAULT_HARNESS_CHECKPOINT_EVERY", .. })
        ));
        let garbage = HarnessConfig::from_lookup(|name| {
            (name == "PLAYERVAULT_HARNESS_TICKS").then(|| String::from("lots"))
        });
        assert!(garbage.is_err());
    }

    #[test]
    fn simulated_run_leaves_nothing_dirty() {
        let mut plugin = PersistencePlugin::new();
        plugin.on_enable(&PersistenceConfig::in_memory()).unwrap();

        let mut server = SimulatedServer::new(HarnessConfig {
            ticks: 60,
            tick_interval: Duration::from_millis(1),
            checkpoint_every: 10,
            max_online: 6,
        });
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..60 {
            server.tick(&mut plugin, &mut rng).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        let stats = server.stats();
        assert_eq!(stats.ticks, 60);
        assert!(stats.joins > 0);
        assert!(server.online().len() <= 6);

        let report = plugin.on_disable().unwrap();
        assert!(report.still_dirty.is_empty(), "{report:?}");
        assert_eq!(stats.failures, 0);
    }
}
