//! Player persistence for a single-threaded game simulation.
//!
//! The simulation thread never waits on the database. Reads are served
//! from an in-memory cache; loads, saves, and purges run on a dedicated
//! worker runtime and their results are applied at the host's poll point.
//!
//! # Modules
//!
//! - [`bridge`] -- Task bridge between the simulation thread and the
//!   worker runtime, with per-player ordering lanes and retry.
//! - [`cache`] -- Player cache with dirty tracking and flush bookkeeping.
//! - [`config`] -- Configuration loading from environment variables.
//! - [`error`] -- Bridge and lifecycle error types.
//! - [`plugin`] -- The lifecycle hooks the host calls.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod plugin;

pub use bridge::{TaskBridge, TaskHandle, TaskKind, TaskOutcome, TaskState};
pub use cache::{CacheEntry, PlayerCache};
pub use config::{BridgeConfig, ConfigError, PersistenceConfig, StorageTarget};
pub use error::{BridgeError, PluginError};
pub use plugin::{PersistencePlugin, PluginState, PluginStatus, PollEvent, ShutdownReport};
