use async_trait::async_trait;
use sqlx::PgPool;

use kestrel_application::PodRepository;
use kestrel_core::{AppError, AppResult};
use kestrel_domain::PodRecord;

/// PostgreSQL-backed pod storage.
#[derive(Clone)]
pub struct PostgresPodRepository {
    pool: PgPool,
}

impl PostgresPodRepository {
    /// Creates a repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PodRepository for PostgresPodRepository {
    async fn insert_pod(&self, pod: &PodRecord) -> AppResult<()> {
        let mut transaction = self.pool.begin().await.map_err(|error| {
            AppError::Internal(format!(
                "failed to start pod transaction for '{}': {error}",
                pod.name
            ))
        })?;

        let pod_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pods (name, cluster_name, labels, namespace, status, node_ip)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(pod.name.as_str())
        .bind(pod.cluster_name.as_str())
        .bind(pod.labels.as_str())
        .bind(pod.namespace.as_str())
        .bind(pod.status.as_str())
        .bind(pod.node_ip.as_str())
        .fetch_one(&mut *transaction)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to insert pod '{}': {error}", pod.name))
        })?;

        for container in &pod.containers {
            sqlx::query(
                r#"
                INSERT INTO pod_containers (
                    pod_id,
                    name,
                    image,
                    commands,
                    request_cpu,
                    request_mem,
                    limit_cpu,
                    limit_mem
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(pod_id)
            .bind(container.name.as_str())
            .bind(container.image.as_str())
            .bind(&container.commands)
            .bind(container.request_cpu.as_deref())
            .bind(container.request_mem.as_deref())
            .bind(container.limit_cpu.as_deref())
            .bind(container.limit_mem.as_deref())
            .execute(&mut *transaction)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to insert container '{}' of pod '{}': {error}",
                    container.name, pod.name
                ))
            })?;
        }

        transaction.commit().await.map_err(|error| {
            AppError::Internal(format!(
                "failed to commit pod transaction for '{}': {error}",
                pod.name
            ))
        })?;

        Ok(())
    }
}
