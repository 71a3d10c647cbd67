use mstorage::errors::StorageError;
use thiserror::Error;
use tigrisfetcher::FetchError;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("transient failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("destination #{destination_id} cannot be claimed: {reason}")]
    Conflict { destination_id: u64, reason: String },

    /// The destination is in a shape the run cannot continue from.
    #[error("structural error: {0}")]
    Structural(String),

    #[error("gave up on source {source_id} -> #{destination_id} after {attempts} attempts during {operation}: {last_error}")]
    Exhausted {
        source_id: u64,
        destination_id: u64,
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("source error: {0}")]
    Source(#[from] FetchError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PushError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        PushError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            PushError::Transient { .. } => true,
            PushError::Source(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Name of the operation that failed, when the error carries one.
    pub fn operation(&self) -> &str {
        match self {
            PushError::Transient { operation, .. } | PushError::Exhausted { operation, .. } => {
                operation
            }
            PushError::Source(_) => "fetch attachment",
            _ => "upsert",
        }
    }
}

/// Maps an octocrab failure onto the push taxonomy.
///
/// 404/410 become `NotFound`; rate limiting, permission throttling and server
/// errors are `Transient`; validation failures are `Conflict`. Failures that
/// never reached GitHub (transport, TLS, decoding) are treated as transient.
pub fn classify(err: octocrab::Error, operation: &str) -> PushError {
    match &err {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            match status {
                404 | 410 => PushError::NotFound(format!("{operation}: {}", source.message)),
                403 | 429 | 500..=599 => PushError::transient(operation, err.to_string()),
                409 | 422 => PushError::Conflict {
                    destination_id: 0,
                    reason: format!("{operation}: {}", source.message),
                },
                _ => PushError::Structural(format!(
                    "{operation} returned HTTP {status}: {}",
                    source.message
                )),
            }
        }
        _ => PushError::transient(operation, err.to_string()),
    }
}

pub type Result<T> = std::result::Result<T, PushError>;
