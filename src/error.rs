use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted session data: {0}")]
    Corruption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl HistoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HistoryError::NotFound(_))
    }

    /// Lets a UI show "corrupted" instead of "missing" for an unreadable file.
    pub fn is_corrupted(&self) -> bool {
        matches!(self, HistoryError::Corruption(_))
    }
}

impl From<anyhow::Error> for HistoryError {
    fn from(err: anyhow::Error) -> Self {
        HistoryError::Unknown(err.to_string())
    }
}
