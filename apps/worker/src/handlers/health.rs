use axum::Json;
use axum::extract::State;

use crate::dto::{HealthResponse, LivenessResponse};
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn liveness_handler(State(state): State<AppState>) -> ApiResult<Json<LivenessResponse>> {
    let instance = &state.instance;
    let lease_live = instance.is_live().await?;
    let election_role = instance.election_role().await.map(|role| role.as_str());

    Ok(Json(LivenessResponse {
        instance: instance.name().to_string(),
        state: instance.state().as_str(),
        lease_live,
        election_role,
        in_flight: instance.controller().in_flight(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::extract::State;

    use super::{health_handler, liveness_handler};
    use crate::handlers::test_support::{live_state, unstarted_state};

    #[tokio::test]
    async fn health_is_static_ok() {
        let response = health_handler().await;
        assert_eq!(response.0.status, "ok");
    }

    #[tokio::test]
    async fn liveness_reports_started_instance() {
        let state = live_state().await;

        let response = liveness_handler(State(state.clone())).await;
        assert!(response.is_ok());
        let response = response.unwrap_or_else(|_| unreachable!()).0;

        assert_eq!(response.instance, state.instance.name().as_str());
        assert_eq!(response.state, "live");
        assert!(response.lease_live);
        assert!(response.election_role.is_some());

        assert!(state.instance.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn liveness_before_start_has_no_lease() {
        let state = unstarted_state().await;

        let response = liveness_handler(State(state))
            .await
            .unwrap_or_else(|_| unreachable!())
            .0;

        assert_eq!(response.state, "starting");
        assert!(!response.lease_live);
        assert!(response.election_role.is_none());
    }
}
