//! Host harness for `PlayerVault`.
//!
//! Plays the part of the game server: it owns the simulation thread and
//! calls the plugin's lifecycle hooks the way a real host would. Useful
//! for manual runs against a development database, or against the
//! in-memory backend with `PLAYERVAULT_BACKEND=memory`.
//!
//! # Startup Sequence
//!
//! 1. Load `.env` if present
//! 2. Initialize structured logging (tracing)
//! 3. Load persistence and harness configuration
//! 4. Enable the plugin (connect pool, ensure schema)
//! 5. Run the simulated ticks
//! 6. Disable the plugin and log the shutdown report

mod error;
mod server;

use playervault_core::{PersistenceConfig, PersistencePlugin};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::HostError;
use crate::server::{HarnessConfig, SimulatedServer};

/// Application entry point for the host harness.
///
/// # Errors
///
/// Returns an error if configuration is invalid, the plugin fails to
/// enable, or a lifecycle hook is called out of order.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Seed the environment from `.env`; a missing file is fine.
    dotenvy::dotenv().ok();

    // 2. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("playervault-host starting");

    // 3. Load configuration.
    let config = PersistenceConfig::from_env().map_err(HostError::from)?;
    let harness = HarnessConfig::from_lookup(|name| std::env::var(name).ok())?;
    info!(
        schema_version = config.schema_version,
        workers = config.bridge.workers,
        lanes = config.bridge.lanes,
        ticks = harness.ticks,
        "Configuration loaded"
    );

    // 4. Enable persistence.
    let mut plugin = PersistencePlugin::new();
    plugin.on_enable(&config).map_err(HostError::from)?;

    // 5. Simulate. A failed run still disables so nothing is left dirty.
    let mut server = SimulatedServer::new(harness);
    let outcome = server.run(&mut plugin);
    if let Err(e) = &outcome {
        warn!(error = %e, "Simulation aborted; disabling persistence");
    }

    // 6. Disable and report.
    let report = plugin.on_disable().map_err(HostError::from)?;
    info!(
        flushed = report.flushed,
        failed = report.failed,
        still_dirty = report.still_dirty.len(),
        timed_out = report.timed_out,
        "playervault-host shutdown complete"
    );

    outcome?;
    Ok(())
}
