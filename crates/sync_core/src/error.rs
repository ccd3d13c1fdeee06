use shared::error::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unusable response: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("push channel failure: {0}")]
    Channel(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("export failed: {0}")]
    Export(String),
}

impl SyncError {
    /// Only configuration problems stop a session; everything else degrades to stale data.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Config(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        SyncError::Transport(value.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(value: url::ParseError) -> Self {
        SyncError::Config(value.to_string())
    }
}

impl From<csv::Error> for SyncError {
    fn from(value: csv::Error) -> Self {
        SyncError::Export(value.to_string())
    }
}
