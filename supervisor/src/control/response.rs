use crate::supervisor::error::ErrorRecord;
use crate::utils::time::now_unix_timestamp;
use serde::Serialize;
use serde_json::Value;

/// Uniform response envelope published on the broadcast response channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: i64,
}

impl ManagerResponse {
    pub fn ok(data: Value, request_id: Option<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            request_id,
            timestamp: now_unix_timestamp(),
        }
    }

    pub fn err(error: ErrorRecord, request_id: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            request_id,
            timestamp: now_unix_timestamp(),
        }
    }

    /// Attaches supporting data to a failure response, e.g. the dependency
    /// reports behind a `DependencyUnavailable`.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
