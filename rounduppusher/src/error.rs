use thiserror::Error;

/// Errors raised while importing into a Roundup tracker.
#[derive(Error, Debug)]
pub enum RoundupError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("tracker returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("tracker fault {code}: {message}")]
    Fault { code: i64, message: String },

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed XML-RPC response: {0}")]
    Malformed(String),

    #[error("base64 payload is invalid: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("member list is unreadable: {0}")]
    Csv(#[from] csv::Error),

    #[error("storage error: {0}")]
    Storage(#[from] mstorage::errors::StorageError),
}

pub type Result<T> = std::result::Result<T, RoundupError>;
