//! `slotwise` - Over-the-air updates for device fleets
//!
//! This library provides the update server (release registry, content-addressed
//! package store, binary delta codec, signed manifests and the HTTP API) and the
//! device agent that downloads, verifies, stages and applies updates into A/B
//! slots with automatic rollback.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod agent;
pub mod cli;
pub mod config;
pub mod delta;
mod durable;
pub mod error;
pub mod hash;
pub mod logging;
pub mod manifest;
pub mod model;
pub mod publish;
pub mod registry;
pub mod server;
pub mod storage;
pub mod store;
pub mod trust;

pub use config::Config;
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use logging::init_logging;
pub use storage::{Storage, StorageStats};
