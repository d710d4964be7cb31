use std::sync::Arc;
use std::time::Duration;

use kestrel_application::{
    BuildJobHandler, CoordinationStore, HandlerRegistry, Instance, KeyNamespace, PodRepository,
    RequestArchive, RequestRegistry, RequestStatusRecorder,
};
use kestrel_core::{AppError, AppResult, InstanceName};
use kestrel_domain::BUILD_JOB_PREFIX;
use kestrel_infrastructure::{
    InMemoryCoordinationStore, InMemoryPodRepository, InMemoryRequestArchive, MIGRATOR,
    PostgresPodRepository, PostgresRequestArchive, RedisCoordinationStore,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::worker_config::WorkerConfig;

/// Durable adapters selected for this process.
pub struct DurableStores {
    pub archive: Arc<dyn RequestArchive>,
    pub pods: Arc<dyn PodRepository>,
}

pub fn build_coordination_store(config: &WorkerConfig) -> AppResult<Arc<dyn CoordinationStore>> {
    match config.redis_url.as_deref() {
        Some(redis_url) => {
            let client = redis::Client::open(redis_url).map_err(|error| {
                AppError::Validation(format!("invalid REDIS_URL: {error}"))
            })?;
            info!("using redis coordination store");
            Ok(Arc::new(RedisCoordinationStore::new(client)))
        }
        None => {
            warn!("REDIS_URL is not set; coordination state is local to this process");
            Ok(Arc::new(InMemoryCoordinationStore::new()))
        }
    }
}

pub async fn build_durable_stores(config: &WorkerConfig) -> AppResult<DurableStores> {
    match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = connect_pool(database_url).await?;
            MIGRATOR.run(&pool).await.map_err(|error| {
                AppError::Internal(format!("failed to run database migrations: {error}"))
            })?;
            info!("using postgres durable store");

            Ok(DurableStores {
                archive: Arc::new(PostgresRequestArchive::new(pool.clone())),
                pods: Arc::new(PostgresPodRepository::new(pool)),
            })
        }
        None => {
            warn!("DATABASE_URL is not set; failed requests and pods are kept in memory");
            Ok(DurableStores {
                archive: Arc::new(InMemoryRequestArchive::new()),
                pods: Arc::new(InMemoryPodRepository::new()),
            })
        }
    }
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

/// Registers every request handler this worker serves.
pub fn build_handlers(
    store: Arc<dyn CoordinationStore>,
    keys: KeyNamespace,
    durable: &DurableStores,
    buildjob_processing_delay: Duration,
) -> AppResult<HandlerRegistry> {
    let recorder = RequestStatusRecorder::new(
        RequestRegistry::new(store, keys),
        durable.archive.clone(),
    );

    let mut handlers = HandlerRegistry::new();
    handlers.register(
        BUILD_JOB_PREFIX,
        Arc::new(BuildJobHandler::new(
            recorder,
            durable.pods.clone(),
            buildjob_processing_delay,
        )),
    )?;

    Ok(handlers)
}

pub fn build_instance(
    config: &WorkerConfig,
    store: Arc<dyn CoordinationStore>,
    durable: &DurableStores,
) -> AppResult<Instance> {
    let keys = config.key_namespace()?;
    let handlers = build_handlers(
        store.clone(),
        keys.clone(),
        durable,
        config.buildjob_processing_delay(),
    )?;

    Instance::new(
        InstanceName::generate(),
        store,
        keys,
        handlers,
        config.controller_settings(),
        config.instance_settings(),
    )
}
