//! Shared error type across Chainward crates.

use thiserror::Error;

/// Stable error codes (reported in NACK details and error response bodies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed protocol message.
    BadRequest,
    /// Configuration failed validation.
    InvalidConfig,
    /// No definition registered for a policy name/version.
    UnknownPolicy,
    /// A policy parameter failed its schema.
    InvalidParameter,
    /// A condition or constraint expression failed to compile.
    InvalidExpression,
    /// An expression failed while being evaluated.
    Evaluation,
    /// A policy returned an error.
    PolicyFailed,
    /// A policy exceeded its execution budget.
    PolicyTimeout,
    /// No chain is bound to the route key.
    RouteNotFound,
    /// Optimistic concurrency check failed.
    Conflict,
    /// Internal server error.
    Internal,
}

impl ErrorCode {
    /// String representation used in JSON payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::UnknownPolicy => "UNKNOWN_POLICY",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::InvalidExpression => "INVALID_EXPRESSION",
            ErrorCode::Evaluation => "EVALUATION",
            ErrorCode::PolicyFailed => "POLICY_FAILED",
            ErrorCode::PolicyTimeout => "POLICY_TIMEOUT",
            ErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Unified error type used by core and kernel.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unknown policy: {name}@{version}")]
    UnknownPolicy { name: String, version: String },
    #[error("policy {policy}: parameter `{param}` {reason}")]
    InvalidParameter {
        policy: String,
        param: String,
        reason: String,
    },
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    #[error("policy {policy} failed: {reason}")]
    PolicyFailed { policy: String, reason: String },
    #[error("policy {policy} timed out after {timeout_ms}ms")]
    PolicyTimeout { policy: String, timeout_ms: u64 },
    #[error("no policy chain for route: {0}")]
    RouteNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    /// Map an error to its stable code.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::BadRequest(_) => ErrorCode::BadRequest,
            EngineError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            EngineError::UnknownPolicy { .. } => ErrorCode::UnknownPolicy,
            EngineError::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            EngineError::InvalidExpression(_) => ErrorCode::InvalidExpression,
            EngineError::Evaluation(_) => ErrorCode::Evaluation,
            EngineError::PolicyFailed { .. } => ErrorCode::PolicyFailed,
            EngineError::PolicyTimeout { .. } => ErrorCode::PolicyTimeout,
            EngineError::RouteNotFound(_) => ErrorCode::RouteNotFound,
            EngineError::Conflict(_) => ErrorCode::Conflict,
            EngineError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Convenience constructor for policy implementations.
    pub fn policy_failed(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::PolicyFailed {
            policy: policy.into(),
            reason: reason.into(),
        }
    }

    /// Prefix the message with `ctx`, keeping the error code.
    pub fn context(self, ctx: &str) -> Self {
        match self {
            EngineError::BadRequest(m) => EngineError::BadRequest(format!("{ctx}: {m}")),
            EngineError::InvalidConfig(m) => EngineError::InvalidConfig(format!("{ctx}: {m}")),
            EngineError::InvalidExpression(m) => EngineError::InvalidExpression(format!("{ctx}: {m}")),
            EngineError::Evaluation(m) => EngineError::Evaluation(format!("{ctx}: {m}")),
            EngineError::RouteNotFound(m) => EngineError::RouteNotFound(format!("{ctx}: {m}")),
            EngineError::Conflict(m) => EngineError::Conflict(format!("{ctx}: {m}")),
            EngineError::Internal(m) => EngineError::Internal(format!("{ctx}: {m}")),
            EngineError::InvalidParameter { policy, param, reason } => EngineError::InvalidParameter {
                policy: format!("{ctx}: {policy}"),
                param,
                reason,
            },
            EngineError::PolicyFailed { policy, reason } => EngineError::PolicyFailed {
                policy: format!("{ctx}: {policy}"),
                reason,
            },
            other => other,
        }
    }

    /// True for the configuration-time error family (rejects a whole push).
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidConfig(_)
                | EngineError::UnknownPolicy { .. }
                | EngineError::InvalidParameter { .. }
                | EngineError::InvalidExpression(_)
        )
    }
}
