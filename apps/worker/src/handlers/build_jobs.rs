use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use kestrel_core::AppError;
use kestrel_domain::BUILD_JOB_CREATE_REQUEST_TYPE;
use serde_json::Value;
use tracing::info;

use crate::dto::ResponseEnvelope;
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn create_build_job_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ResponseEnvelope>)> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|error| AppError::Validation(format!("invalid build job body: {error}")))?;

    info!(
        instance = %state.instance.name(),
        build_job = payload.get("name").and_then(serde_json::Value::as_str).unwrap_or_default(),
        "create build job"
    );

    let accepted = state
        .instance
        .accept_request(payload, BUILD_JOB_CREATE_REQUEST_TYPE)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ResponseEnvelope::success(
            "create build job success",
            accepted.response,
        )),
    ))
}

pub async fn get_build_job_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ResponseEnvelope>> {
    let request = state
        .instance
        .find_request(name.as_str(), BUILD_JOB_CREATE_REQUEST_TYPE)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("build job '{name}' is not in flight")))?;

    let data = serde_json::to_value(&request).map_err(|error| {
        AppError::Internal(format!("failed to serialize build job request: {error}"))
    })?;

    Ok(Json(ResponseEnvelope::success("get build job success", data)))
}
