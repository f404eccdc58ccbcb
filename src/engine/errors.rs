use std::time::Duration;

/// Classified failures surfaced by the matching engine.
///
/// Messages are written for people: the presentation layer shows them as-is.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("AI model initialization timed out after {0:?}. Check your internet connection and try again.")]
    InitializationTimeout(Duration),

    #[error("Network error during AI model loading: {0}")]
    InitializationNetwork(String),

    #[error("Insufficient memory to load AI model: {0}")]
    InitializationMemory(String),

    #[error("All {attempts} model configurations failed to initialize (last error: {last})")]
    InitializationExhausted { attempts: usize, last: String },

    #[error("AI model is not ready")]
    ModelNotReady,

    #[error("Invalid image reference: {0}. Provide an http(s) URL or a data URI.")]
    InvalidImageReference(String),

    #[error("Image is not accessible: {0}")]
    ImageInaccessible(String),

    #[error("Unsupported image format: {0}. Use JPEG, PNG, WebP, GIF or BMP images.")]
    ImageFormatUnsupported(String),

    #[error("Vector length mismatch: expected {expected}, got {got}")]
    VectorLengthMismatch { expected: usize, got: usize },

    #[error("Feature extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Feature extraction failed after {attempts} attempts: {last}")]
    ExtractionExhausted { attempts: u32, last: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MatchError {
    /// Errors worth another extraction attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MatchError::ImageInaccessible(_) | MatchError::ExtractionFailed(_)
        )
    }

    /// Caller supplied something unusable; no backend can fix it.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            MatchError::InvalidImageReference(_) | MatchError::ImageFormatUnsupported(_)
        )
    }

    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            MatchError::InitializationTimeout(_)
                | MatchError::InitializationNetwork(_)
                | MatchError::InitializationMemory(_)
                | MatchError::InitializationExhausted { .. }
                | MatchError::ModelNotReady
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    Network,
    Memory,
    Other,
}

/// Opaque failure reported by a model backend, a model loader or an image fetcher.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    /// Build an error, guessing its kind from the message text.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_message(&message),
            message,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Network,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Other,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            BackendError::network(err.to_string())
        } else {
            BackendError::new(err.to_string())
        }
    }
}

fn classify_message(msg: &str) -> BackendErrorKind {
    let msg_lower = msg.to_lowercase();

    if msg_lower.contains("out of memory")
        || msg_lower.contains("memory allocation")
        || msg_lower.contains("failed to allocate")
    {
        return BackendErrorKind::Memory;
    }

    if msg_lower.contains("network")
        || msg_lower.contains("connection")
        || msg_lower.contains("dns")
        || msg_lower.contains("timed out")
        || msg_lower.contains("fetch")
        || msg_lower.contains("download")
    {
        return BackendErrorKind::Network;
    }

    BackendErrorKind::Other
}
