use serde::Serialize;
use serde_json::Value;

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_FAILED: &str = "failed";

/// Envelope wrapping every build job API response.
#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    pub result: &'static str,
    pub message: String,
    pub data: Value,
}

impl ResponseEnvelope {
    pub fn success(message: impl Into<String>, data: Value) -> Self {
        Self {
            result: RESULT_SUCCESS,
            message: message.into(),
            data,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            result: RESULT_FAILED,
            message: message.into(),
            data: Value::Null,
        }
    }
}

/// Health response payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Liveness of this instance inside the fleet.
#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub instance: String,
    pub state: &'static str,
    pub lease_live: bool,
    pub election_role: Option<&'static str>,
    pub in_flight: usize,
}
