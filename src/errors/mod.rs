use thiserror::Error;

/// Stable error codes surfaced on the wire and inside tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AuthInvalidKey,
    AuthExpired,
    AuthMissing,
    ValidationError,
    MissingRequired,
    NotFound,
    AlreadyExists,
    QuotaExceeded,
    OperationFailed,
    Timeout,
    RateLimited,
    ConnectionFailed,
    NetworkError,
    ServerError,
    ToolNotFound,
    ToolForbidden,
    ToolPairingViolation,
    CircuitOpen,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthInvalidKey => "AUTH_INVALID_KEY",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::AuthMissing => "AUTH_MISSING",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::MissingRequired => "MISSING_REQUIRED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::OperationFailed => "OPERATION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ServerError => "SERVER_ERROR",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::ToolForbidden => "TOOL_FORBIDDEN",
            Self::ToolPairingViolation => "TOOL_PAIRING_VIOLATION",
            Self::CircuitOpen => "CIRCUIT_OPEN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed error hierarchy for MXF.
///
/// Use at module boundaries (auth, tool dispatch, provider calls, store
/// access, lifecycle management). Internal/leaf functions can continue using
/// `anyhow::Result` — the `Internal` variant allows seamless conversion via
/// the `?` operator.
#[derive(Debug, Error)]
pub enum MxfError {
    #[error("authentication failed: {message}")]
    Auth { code: ErrorCode, message: String },

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        /// Structured issues, one entry per failed schema constraint.
        issues: Vec<ValidationIssue>,
    },

    #[error("tool '{name}' not found")]
    ToolNotFound { name: String },

    #[error("tool '{name}' forbidden for agent {agent_id}")]
    ToolForbidden { name: String, agent_id: String },

    #[error("tool-call pairing violated: {0}")]
    PairingViolation(String),

    #[error("circuit open for tool '{name}'")]
    CircuitOpen { name: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation failed: {0}")]
    Operation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// One structured issue produced by argument validation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationIssue {
    /// "error" blocks the operation, "warning" does not.
    pub severity: String,
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: "error".to_string(),
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: "warning".to_string(),
            path: path.into(),
            message: message.into(),
        }
    }
}

impl MxfError {
    pub fn validation(message: impl Into<String>, issues: Vec<ValidationIssue>) -> Self {
        Self::Validation {
            message: message.into(),
            issues,
        }
    }

    /// The stable wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth { code, .. } => *code,
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::ToolNotFound { .. } => ErrorCode::ToolNotFound,
            Self::ToolForbidden { .. } => ErrorCode::ToolForbidden,
            Self::PairingViolation(_) => ErrorCode::ToolPairingViolation,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Provider { .. } => ErrorCode::NetworkError,
            Self::Connection(_) => ErrorCode::ConnectionFailed,
            Self::Config(_) | Self::Operation(_) => ErrorCode::OperationFailed,
            Self::Internal(_) => ErrorCode::ServerError,
        }
    }

    /// Whether this error is transient and the operation should be retried.
    /// Auth, validation, and permission failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::Timeout(_) | Self::Connection(_) | Self::Internal(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests;
