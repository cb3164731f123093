use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("TiKV error: {0}")]
    TikvError(#[from] tikv_client::Error),
    #[error("Prost error: {0}")]
    SerializationError(#[from] prost::EncodeError),
    #[error("Prost error: {0}")]
    DeserializationError(#[from] prost::DecodeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid utf8: {0}")]
    InvalidUtf8(std::string::FromUtf8Error),
    #[error("Connection failed: {0}")]
    Connection(#[source] Arc<Error>),
    #[error("Not connected")]
    NotConnected,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
    #[error("CAS mismatch: {0}")]
    CasMismatch(String),
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("Wrong model: expected {expected}, found {}", .found.as_deref().unwrap_or("<none>"))]
    WrongModel {
        expected: String,
        found: Option<String>,
    },
    #[error("View not found: {design_document}/{view}")]
    ViewNotFound {
        design_document: String,
        view: String,
    },
    #[error("Unsupported view: {0}")]
    UnsupportedView(String),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// `true` when the store reported the key as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
