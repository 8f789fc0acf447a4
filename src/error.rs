use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum NmdcError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    RemoteRequestFailed(String),

    #[error("NMDC API returned status {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    #[error("local database error: {0}")]
    Store(String),

    #[error("invalid API environment: {0} (expected prod, dev or backup)")]
    InvalidEnvironment(String),

    #[error("invalid filter syntax: {0}")]
    InvalidFilter(String),

    #[error("failed to parse JSON: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("malformed GFF line {line}: {message}")]
    GffParse { line: usize, message: String },

    #[error("IDs not found in collection: {}", .0.join(", "))]
    IdsNotFound(Vec<String>),

    #[error("enrichment analysis failed: {0}")]
    Enrichment(String),
}

impl From<rusqlite::Error> for NmdcError {
    fn from(err: rusqlite::Error) -> Self {
        NmdcError::Store(err.to_string())
    }
}

impl NmdcError {
    /// True for failures raised by the remote API or the transport under it.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            NmdcError::RemoteRequestFailed(_) | NmdcError::RemoteStatus { .. }
        )
    }
}
