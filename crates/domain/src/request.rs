use std::fmt::{Display, Formatter};

use kestrel_core::{AppError, AppResult, InstanceName, NonEmptyString};
use serde::{Deserialize, Serialize};

/// Separator between the handler prefix and the verb of a request type.
pub const REQUEST_TYPE_SEPARATOR: char = '_';

/// Dispatch key of one request, shaped `<prefix>_<verb>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestType(NonEmptyString);

impl RequestType {
    /// Parses and validates a request type.
    pub fn parse(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        let trimmed = value.trim();

        if trimmed.contains('/') {
            return Err(AppError::Validation(format!(
                "request type '{value}' must not contain '/'"
            )));
        }

        if trimmed.starts_with(REQUEST_TYPE_SEPARATOR) {
            return Err(AppError::Validation(format!(
                "request type '{value}' must start with a handler prefix"
            )));
        }

        NonEmptyString::new(trimmed)
            .map(Self)
            .map_err(|_| AppError::Validation("request type must not be empty".to_owned()))
    }

    /// Returns the handler prefix (the part before the first separator).
    #[must_use]
    pub fn prefix(&self) -> &str {
        let value = self.0.as_str();
        value
            .split_once(REQUEST_TYPE_SEPARATOR)
            .map_or(value, |(prefix, _)| prefix)
    }

    /// Returns the verb following the prefix, when present.
    #[must_use]
    pub fn verb(&self) -> Option<&str> {
        self.0
            .as_str()
            .split_once(REQUEST_TYPE_SEPARATOR)
            .map(|(_, verb)| verb)
    }

    /// Returns the full request type value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for RequestType {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RequestType> for String {
    fn from(value: RequestType) -> Self {
        value.0.into()
    }
}

impl Display for RequestType {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0.as_str())
    }
}

/// Lifecycle status of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Accepted and waiting for a worker.
    Pending,
    /// Picked up by a worker.
    Executing,
    /// Finished with an error.
    Failed,
    /// Finished successfully.
    Success,
}

impl RequestStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Failed => "failed",
            Self::Success => "success",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "failed" => Ok(Self::Failed),
            "success" => Ok(Self::Success),
            _ => Err(AppError::Validation(format!(
                "unknown request status '{value}'"
            ))),
        }
    }

    /// Returns whether the status ends the request lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Success)
    }

    /// Returns whether a worker may move a request from this status to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Executing | Self::Failed | Self::Success)
                | (Self::Executing, Self::Failed | Self::Success)
        )
    }
}

/// Durable record of one unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    name: NonEmptyString,
    request_type: RequestType,
    status: RequestStatus,
    instance_name: InstanceName,
    payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl Request {
    /// Creates a pending request owned by `instance_name`.
    pub fn new(
        name: impl Into<String>,
        request_type: RequestType,
        instance_name: InstanceName,
        payload: impl Into<String>,
    ) -> AppResult<Self> {
        let name = NonEmptyString::new(name)
            .map_err(|_| AppError::Validation("request name must not be empty".to_owned()))?;

        Ok(Self {
            name,
            request_type,
            status: RequestStatus::Pending,
            instance_name,
            payload: payload.into(),
            message: None,
        })
    }

    /// Returns the logical request name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the dispatch key.
    #[must_use]
    pub fn request_type(&self) -> &RequestType {
        &self.request_type
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Returns the owning instance.
    #[must_use]
    pub fn instance_name(&self) -> &InstanceName {
        &self.instance_name
    }

    /// Returns the serialized handler payload.
    #[must_use]
    pub fn payload(&self) -> &str {
        self.payload.as_str()
    }

    /// Returns the failure message recorded on the request.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the hash field identifying this request inside an owner's registry slot.
    #[must_use]
    pub fn registry_field(&self) -> String {
        registry_field(&self.request_type, self.name.as_str())
    }

    /// Moves the request to `next`.
    ///
    /// Returns `false` when the request already has that status.
    pub fn transition_to(&mut self, next: RequestStatus) -> AppResult<bool> {
        if self.status == next {
            return Ok(false);
        }

        if !self.status.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "request '{}' cannot move from {} to {}",
                self.name.as_str(),
                self.status.as_str(),
                next.as_str()
            )));
        }

        self.status = next;
        Ok(true)
    }

    /// Marks the request failed and records the reason.
    pub fn fail_with(&mut self, message: impl Into<String>) -> AppResult<()> {
        self.transition_to(RequestStatus::Failed)?;
        self.message = Some(message.into());
        Ok(())
    }

    /// Hands the request to a new owner and resets it for re-execution.
    pub fn reassign_to(&mut self, new_owner: InstanceName) {
        self.instance_name = new_owner;
        self.status = RequestStatus::Pending;
        self.message = None;
    }
}

/// Builds the registry hash field for a request type and name.
#[must_use]
pub fn registry_field(request_type: &RequestType, name: &str) -> String {
    format!("{}/{name}", request_type.as_str())
}
