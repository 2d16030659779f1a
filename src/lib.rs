//! SettleBot Backend Library
//!
//! Market resolution and settlement engine for pari-mutuel betting markets.
//! Exposes core modules for use by the server binary and integration tests.

pub mod api;
pub mod errors;
pub mod ingest;
pub mod ledger;
pub mod models;
pub mod oracle;
pub mod resolution;
pub mod settlement;
pub mod stores;
pub mod subscriptions;

pub use api::AppState;
pub use errors::EngineError;
