use async_trait::async_trait;
use sqlx::PgPool;

use kestrel_application::RequestArchive;
use kestrel_core::{AppError, AppResult};
use kestrel_domain::Request;

/// PostgreSQL-backed append-only archive of failed requests.
#[derive(Clone)]
pub struct PostgresRequestArchive {
    pool: PgPool,
}

impl PostgresRequestArchive {
    /// Creates an archive with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestArchive for PostgresRequestArchive {
    async fn append_failed_request(&self, request: &Request) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO failed_requests (
                name,
                request_type,
                instance_name,
                status,
                payload,
                message
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(request.name())
        .bind(request.request_type().as_str())
        .bind(request.instance_name().as_str())
        .bind(request.status().as_str())
        .bind(request.payload())
        .bind(request.message())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to archive failed request '{}': {error}",
                request.name()
            ))
        })?;

        Ok(())
    }
}
