use std::path::PathBuf;

use thiserror::Error;

const MESSAGE_MAX_CHARS: usize = 512;

/// Missing or invalid settings. Always raised before a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn missing(key: &str) -> Self {
        Self(format!("{key} not set"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    RateLimited,
    Unauthorized,
    MalformedRequest,
    Rejected,
    Unreachable,
    InvalidResponse,
}

impl ServiceErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::MalformedRequest => "malformed_request",
            Self::Rejected => "rejected",
            Self::Unreachable => "unreachable",
            Self::InvalidResponse => "invalid_response",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::RateLimited => "rate limited the request",
            Self::Unauthorized => "rejected the credentials",
            Self::MalformedRequest => "rejected a malformed request",
            Self::Rejected => "rejected the request",
            Self::Unreachable => "is unreachable",
            Self::InvalidResponse => "returned an unusable response",
        }
    }
}

/// A collaborator call failed. Recoverable at the session level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{service} {}: {message}", .kind.describe())]
pub struct ServiceError {
    pub service: String,
    pub kind: ServiceErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ServiceError {
    pub fn new(
        service: impl Into<String>,
        kind: ServiceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            kind,
            status: None,
            message: truncate_text(&message.into(), MESSAGE_MAX_CHARS),
        }
    }

    pub fn from_status(service: impl Into<String>, status: u16, body: &str) -> Self {
        let kind = match status {
            429 => ServiceErrorKind::RateLimited,
            401 | 403 => ServiceErrorKind::Unauthorized,
            400 | 404 | 413 | 422 => ServiceErrorKind::MalformedRequest,
            _ => ServiceErrorKind::Rejected,
        };
        let body = body.trim();
        let message = if body.is_empty() {
            format!("status {status}")
        } else {
            format!("status {status}: {body}")
        };
        Self {
            status: Some(status),
            ..Self::new(service, kind, message)
        }
    }

    pub fn unreachable(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(service, ServiceErrorKind::Unreachable, message)
    }

    pub fn invalid_response(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(service, ServiceErrorKind::InvalidResponse, message)
    }

    /// False only when the request never got an answer from the service.
    pub fn is_reachable(&self) -> bool {
        self.kind != ServiceErrorKind::Unreachable
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode session: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("{} is not a saved session: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that stop a session before its first iteration.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("a session is already running on this orchestrator")]
    AlreadyRunning,
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
