use reqwest::StatusCode;
use thiserror::Error;

/// Stable error kind identifiers, used in logs, tests, and job `last_error` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputInvalid,
    ProviderUnreachable,
    ProviderTimeout,
    ProviderRateLimited,
    ProviderServerError,
    ProviderAuth,
    ProviderBadResponse,
    PlaceholderMismatch,
    ChunkExhausted,
    Canceled,
}

impl ErrorKind {
    /// The stable string identifier for this kind, as named in the error taxonomy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputInvalid => "input_invalid",
            Self::ProviderUnreachable => "provider_unreachable",
            Self::ProviderTimeout => "provider_timeout",
            Self::ProviderRateLimited => "provider_rate_limited",
            Self::ProviderServerError => "provider_server_error",
            Self::ProviderAuth => "provider_auth",
            Self::ProviderBadResponse => "provider_bad_response",
            Self::PlaceholderMismatch => "placeholder_mismatch",
            Self::ChunkExhausted => "chunk_exhausted",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("checkpoint store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("input file could not be parsed: {0}")]
    InputInvalid(String),

    #[error("provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("provider request timed out after {0:?}")]
    ProviderTimeout(std::time::Duration),

    #[error("provider rate limited{}", .retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    ProviderRateLimited { retry_after_secs: Option<u64> },

    #[error("provider server error (HTTP {status})")]
    ProviderServerError { status: StatusCode },

    #[error("provider authentication failed (HTTP {status})")]
    ProviderAuth { status: StatusCode },

    #[error("provider returned an unparseable or empty response: {0}")]
    ProviderBadResponse(String),

    #[error("placeholder restoration failed after all fallback strategies: {0}")]
    PlaceholderMismatch(String),

    #[error("chunk {chunk_index} exhausted {attempts} attempts")]
    ChunkExhausted { chunk_index: u64, attempts: u32 },

    #[error("job was canceled")]
    Canceled,
}

impl EngineError {
    /// Stable kind identifier for this error, per the error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputInvalid(_) => ErrorKind::InputInvalid,
            Self::ProviderUnreachable(_) => ErrorKind::ProviderUnreachable,
            Self::ProviderTimeout(_) => ErrorKind::ProviderTimeout,
            Self::ProviderRateLimited { .. } => ErrorKind::ProviderRateLimited,
            Self::ProviderServerError { .. } => ErrorKind::ProviderServerError,
            Self::ProviderAuth { .. } => ErrorKind::ProviderAuth,
            Self::ProviderBadResponse(_) => ErrorKind::ProviderBadResponse,
            Self::PlaceholderMismatch(_) => ErrorKind::PlaceholderMismatch,
            Self::ChunkExhausted { .. } => ErrorKind::ChunkExhausted,
            Self::Canceled => ErrorKind::Canceled,
            Self::Http(e) => {
                if e.is_timeout() {
                    ErrorKind::ProviderTimeout
                } else if e.is_connect() {
                    ErrorKind::ProviderUnreachable
                } else if let Some(status) = e.status() {
                    Self::kind_from_status(status)
                } else {
                    ErrorKind::ProviderBadResponse
                }
            }
            Self::Io(_) | Self::Json(_) | Self::Store(_) | Self::Xml(_) | Self::Zip(_) => {
                ErrorKind::InputInvalid
            }
        }
    }

    fn kind_from_status(status: StatusCode) -> ErrorKind {
        match status.as_u16() {
            401 | 403 => ErrorKind::ProviderAuth,
            429 => ErrorKind::ProviderRateLimited,
            400..=499 => ErrorKind::ProviderBadResponse,
            500..=599 => ErrorKind::ProviderServerError,
            _ => ErrorKind::ProviderBadResponse,
        }
    }

    /// Build the correct variant from an HTTP status returned by a provider.
    pub fn from_status(status: StatusCode, retry_after_secs: Option<u64>) -> Self {
        match status.as_u16() {
            401 | 403 => Self::ProviderAuth { status },
            429 => Self::ProviderRateLimited { retry_after_secs },
            500..=599 => Self::ProviderServerError { status },
            _ => Self::ProviderBadResponse(format!("HTTP {status}")),
        }
    }

    /// Whether the Chunk Translator should retry on this error.
    /// `provider_auth` and `provider_unreachable` fail fast; everything else transient retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProviderTimeout
                | ErrorKind::ProviderRateLimited
                | ErrorKind::ProviderServerError
                | ErrorKind::ProviderBadResponse
        )
    }

    /// Whether the Job Orchestrator should treat this error as job-fatal.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ChunkExhausted | ErrorKind::PlaceholderMismatch
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::ProviderRateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_taxonomy() {
        assert_eq!(ErrorKind::InputInvalid.as_str(), "input_invalid");
        assert_eq!(
            ErrorKind::ProviderRateLimited.as_str(),
            "provider_rate_limited"
        );
        assert_eq!(ErrorKind::ChunkExhausted.as_str(), "chunk_exhausted");
        assert_eq!(ErrorKind::Canceled.as_str(), "canceled");
    }

    #[test]
    fn retryable_errors() {
        assert!(EngineError::ProviderRateLimited {
            retry_after_secs: None
        }
        .is_retryable());
        assert!(EngineError::ProviderServerError {
            status: StatusCode::BAD_GATEWAY
        }
        .is_retryable());
        assert!(EngineError::ProviderTimeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(!EngineError::ProviderAuth {
            status: StatusCode::UNAUTHORIZED
        }
        .is_retryable());
        assert!(!EngineError::ProviderUnreachable("dns failure".into()).is_retryable());
    }

    #[test]
    fn job_fatal_errors() {
        assert!(EngineError::ChunkExhausted {
            chunk_index: 3,
            attempts: 2
        }
        .is_job_fatal());
        assert!(EngineError::PlaceholderMismatch("stray token".into()).is_job_fatal());
        assert!(!EngineError::Canceled.is_job_fatal());
    }

    #[test]
    fn from_status_maps_correctly() {
        assert!(matches!(
            EngineError::from_status(StatusCode::UNAUTHORIZED, None),
            EngineError::ProviderAuth { .. }
        ));
        assert!(matches!(
            EngineError::from_status(StatusCode::TOO_MANY_REQUESTS, Some(5)),
            EngineError::ProviderRateLimited {
                retry_after_secs: Some(5)
            }
        ));
        assert!(matches!(
            EngineError::from_status(StatusCode::BAD_GATEWAY, None),
            EngineError::ProviderServerError { .. }
        ));
    }

    #[test]
    fn retry_after_extraction() {
        let err = EngineError::ProviderRateLimited {
            retry_after_secs: Some(30),
        };
        assert_eq!(err.retry_after_secs(), Some(30));
        assert_eq!(EngineError::Canceled.retry_after_secs(), None);
    }

    #[test]
    fn canceled_is_not_retryable_or_fatal() {
        assert!(!EngineError::Canceled.is_retryable());
        assert!(!EngineError::Canceled.is_job_fatal());
    }
}
