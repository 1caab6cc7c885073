//! Shared type definitions for the `PlayerVault` persistence plugin.
//!
//! This crate is the single source of truth for the values that flow between
//! the cache, the task bridge and the record store.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrapper for player identity keys
//! - [`record`] -- The persisted [`PlayerRecord`] and its attribute/secret sets

pub mod ids;
pub mod record;

// Re-export all public types at crate root for convenience.
pub use ids::PlayerId;
pub use record::{AttributeMap, PlayerRecord, SecretMap};
