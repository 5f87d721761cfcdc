use thiserror::Error;

/// Gateway operation errors.
///
/// Every plugin method and every layer above it returns this type so the
/// surfaces (GraphQL, MCP, CLI) can translate failures uniformly. Drivers
/// classify native errors into one of these kinds at the driver boundary;
/// the registry and cache propagate them untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request shape is wrong (bad operator, malformed filter, etc.).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Authentication failed or no usable credential was presented.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Referenced object (database, schema, storage unit) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write pre-condition was violated (missing key columns, constraint).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The engine cannot perform this operation at all.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Transport or driver failure. Idempotent calls may be retried once
    /// with a fresh handle.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Request or header exceeded a configured size cap.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// The gate timeout elapsed before the operation finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The client went away; the operation was abandoned.
    #[error("canceled")]
    Canceled,

    /// Anything that should never happen. Reported with a correlation id.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self::PayloadTooLarge(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine code carried in GraphQL `extensions.code`, MCP error
    /// objects, and used for CLI exit-code mapping.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Canceled => "CANCELED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the caller may retry once after evicting the cached handle.
    ///
    /// Only transport failures qualify; mutating operations never auto-retry
    /// regardless of this flag.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::unauthorized("x").code(), "UNAUTHORIZED");
        assert_eq!(EngineError::payload_too_large("x").code(), "PAYLOAD_TOO_LARGE");
        assert_eq!(EngineError::DeadlineExceeded.code(), "DEADLINE_EXCEEDED");
    }

    #[test]
    fn only_unavailable_is_retriable() {
        assert!(EngineError::unavailable("gone").is_retriable());
        assert!(!EngineError::conflict("dup").is_retriable());
        assert!(!EngineError::Canceled.is_retriable());
    }
}
