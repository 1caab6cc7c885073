//! Error types for the task bridge and the plugin lifecycle.

use std::time::Duration;

use playervault_db::DbError;
use playervault_types::PlayerId;

use crate::plugin::PluginState;

/// Errors returned by the [`TaskBridge`](crate::bridge::TaskBridge).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The bridge is draining and accepts no new work.
    #[error("task bridge is draining")]
    Draining,

    /// The bridge has shut down.
    #[error("task bridge is stopped")]
    Stopped,

    /// The worker runtime could not be built.
    #[error("failed to start worker runtime: {0}")]
    Runtime(#[from] std::io::Error),

    /// Work was still in flight when the drain deadline passed.
    #[error("{pending} task(s) still in flight after {timeout:?}")]
    DrainTimeout {
        /// Tasks that had not finished.
        pending: usize,
        /// The deadline that elapsed.
        timeout: Duration,
    },
}

/// Errors returned to the host by the plugin lifecycle hooks.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The hook is not valid in the current lifecycle state.
    #[error("plugin is {0:?}")]
    InvalidState(PluginState),

    /// Startup persistence work failed.
    #[error("storage error: {0}")]
    Store(#[from] DbError),

    /// The task bridge refused or failed.
    #[error("task bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// The player has no cached record (not loaded or already evicted).
    #[error("player {0} is not loaded")]
    NotLoaded(PlayerId),

    /// The player's stored record could not be read; it is not defaulted.
    #[error("record for player {0} is unavailable")]
    Unavailable(PlayerId),
}
