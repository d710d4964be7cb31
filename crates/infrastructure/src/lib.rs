//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod in_memory_coordination_store;
mod in_memory_durable_store;
mod postgres_pod_repository;
mod postgres_request_archive;
mod redis_coordination_store;

use sqlx::migrate::Migrator;

pub use in_memory_coordination_store::InMemoryCoordinationStore;
pub use in_memory_durable_store::{InMemoryPodRepository, InMemoryRequestArchive};
pub use postgres_pod_repository::PostgresPodRepository;
pub use postgres_request_archive::PostgresRequestArchive;
pub use redis_coordination_store::RedisCoordinationStore;

/// Schema migrations for the durable store.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");
