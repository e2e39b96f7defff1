#![warn(clippy::unwrap_used)]

pub mod client;
pub mod local;

use std::sync::Arc;

use abtrack_core::config::{StoreBackend, StoreConfig};
use abtrack_core::error::AbTrackResult;
use abtrack_core::store::RecordStore;

pub use client::RedisStore;
pub use local::LocalStore;

/// Build the configured record store backend.
///
/// Both backends are synchronous; a Redis call blocks the calling thread for
/// one round trip.
pub fn open_store(config: &StoreConfig) -> AbTrackResult<Arc<dyn RecordStore>> {
    match config.backend {
        StoreBackend::Local => Ok(Arc::new(LocalStore::new(config.local_max_entries))),
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(&config.redis_url)?)),
    }
}
