/// Provider error with retry classification.
///
/// **Retryable**: busy or locked files, interrupted I/O, timeouts, anything
/// that may succeed on the next attempt.
///
/// **Permanent**: missing instances, stale executions, malformed data.
/// Retrying these only repeats the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g. "append", "enqueue_work")
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Create a retryable (transient) error.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Classify an I/O failure: not-found and invalid-data are permanent, the rest transient.
    pub fn io(operation: impl Into<String>, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound | ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::AlreadyExists => {
                Self::permanent(operation, err.to_string())
            }
            _ => Self::retryable(operation, err.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// String errors are treated as retryable.
impl From<String> for ProviderError {
    fn from(s: String) -> Self {
        Self::retryable("unknown", s)
    }
}

impl From<&str> for ProviderError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}
