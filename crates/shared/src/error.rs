use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl From<PermissionError> for ApiError {
    fn from(value: PermissionError) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            message: value.to_string(),
        }
    }
}

/// The kind of store operation an access rule rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ReadOne,
    ReadMany,
    Write,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ReadOne => "read_one",
            OperationKind::ReadMany => "read_many",
            OperationKind::Write => "write",
        }
    }
}

/// Structured rejection from the access-rule layer: the target path, the
/// attempted operation, and (for writes) the payload that was refused.
///
/// This is the one error kind live subscriptions surface to consumers and
/// fan out to registered observers.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("permission denied for {} at '{path}'", .operation.as_str())]
pub struct PermissionError {
    pub path: String,
    pub operation: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
}

impl PermissionError {
    pub fn new(path: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            path: path.into(),
            operation,
            request: None,
        }
    }

    pub fn with_request(mut self, request: Value) -> Self {
        self.request = Some(request);
        self
    }
}
