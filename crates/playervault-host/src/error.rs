//! Error types for the host harness binary.
//!
//! [`HostError`] wraps every failure `main` can propagate with `?`.

/// Top-level error for the host harness.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Persistence configuration could not be loaded.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: playervault_core::ConfigError,
    },

    /// A plugin lifecycle hook failed.
    #[error("plugin error: {source}")]
    Plugin {
        /// The underlying plugin error.
        #[from]
        source: playervault_core::PluginError,
    },

    /// A harness setting was malformed.
    #[error("invalid harness setting {name}: {message}")]
    Harness {
        /// The environment variable at fault.
        name: &'static str,
        /// Why it was rejected.
        message: String,
    },
}
