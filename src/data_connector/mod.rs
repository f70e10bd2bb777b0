//! Registry storage backends.

mod core;
mod memory;
mod postgres;

use std::sync::Arc;

pub use self::core::{
    HealthStatus, NewServer, REGISTRATION_ID_PREFIX, RegistryError, RegistryResult,
    RegistryStats, RegistryStorage, ServerFilter, ServerId, ServerRecord, ServerUpdate,
    make_registration_id, sort_by_least_recent_success, sort_by_newest,
};
pub use memory::MemoryRegistryStorage;
pub use postgres::PostgresRegistryStorage;
use tracing::info;

use crate::config::StorageConfig;

/// Builds the backend selected by configuration.
pub async fn create_storage(config: &StorageConfig) -> RegistryResult<Arc<dyn RegistryStorage>> {
    match config {
        StorageConfig::Memory => {
            info!("Using in-memory registry");
            Ok(Arc::new(MemoryRegistryStorage::new()))
        }
        StorageConfig::Postgres(pg) => {
            info!("Using Postgres registry");
            Ok(Arc::new(PostgresRegistryStorage::connect(pg).await?))
        }
    }
}
