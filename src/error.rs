use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum or format mismatch in a WAL record, table block or manifest.
    #[error("Corrupted data: {0}")]
    Corruption(String),

    /// Internal consistency error, e.g. out-of-order keys fed to a table
    /// builder. Never recovered silently.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Database is closed")]
    Closed,
}

impl StorageError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corruption(_))
    }
}

// Conversion for channel errors
impl<T> From<crossbeam_channel::SendError<T>> for StorageError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        StorageError::ChannelSend(err.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
