use thiserror::Error;

/// Errors raised while talking to the source tracker or decoding its exports.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("XML decoding failed: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("invalid record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("attachment {attach_id} has neither inline data nor a download URL")]
    AttachmentUnavailable { attach_id: String },

    #[error("attachment payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("batch {first}-{last} failed: {source}")]
    Batch {
        first: u64,
        last: u64,
        #[source]
        source: Box<FetchError>,
    },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("storage error: {0}")]
    Storage(#[from] mstorage::errors::StorageError),
}

impl FetchError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Batch { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Result type for source operations
pub type Result<T> = std::result::Result<T, FetchError>;
