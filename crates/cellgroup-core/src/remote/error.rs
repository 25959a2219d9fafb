use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - check the API key")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Whether retrying the same request can be expected to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let cut = (0..=MAX_ERROR_BODY_LENGTH)
                .rev()
                .find(|&i| body.is_char_boundary(i))
                .unwrap_or(0);
            format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            401 => RemoteError::Unauthorized,
            403 => RemoteError::AccessDenied(truncated),
            404 => RemoteError::NotFound(truncated),
            408 => RemoteError::ServerError(format!("Status 408: {}", truncated)),
            409 => RemoteError::Conflict(truncated),
            429 => RemoteError::RateLimited,
            400..=499 => RemoteError::Rejected(format!("Status {}: {}", status, truncated)),
            500..=599 => RemoteError::ServerError(truncated),
            _ => RemoteError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteError::RateLimited
            | RemoteError::ServerError(_)
            | RemoteError::Timeout(_)
            | RemoteError::Unreachable(_) => FailureKind::Transient,
            RemoteError::NetworkError(e) => {
                if e.is_decode() || e.is_builder() {
                    FailureKind::Permanent
                } else {
                    FailureKind::Transient
                }
            }
            RemoteError::Unauthorized
            | RemoteError::AccessDenied(_)
            | RemoteError::NotFound(_)
            | RemoteError::Conflict(_)
            | RemoteError::Rejected(_)
            | RemoteError::InvalidResponse(_) => FailureKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// True when the device could not reach the server at all, meaning the
    /// rest of a drain would fail the same way.
    pub fn is_connectivity_loss(&self) -> bool {
        match self {
            RemoteError::Unreachable(_) => true,
            RemoteError::NetworkError(e) => e.is_connect(),
            _ => false,
        }
    }
}
