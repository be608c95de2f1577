use std::path::PathBuf;

use thiserror::Error;

use crate::types::FileState;

/// Convenience result type for harvesting operations.
pub type HarvestResult<T> = Result<T, HarvestError>;

/// Error type returned across classification, parsing, derivation and loading.
///
/// Classification failures ([`HarvestError::UnsupportedFileType`]) are an expected outcome for
/// foreign files in a monitored directory; callers skip the file and carry on.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Underlying I/O error (e.g. file vanished between poll and import).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "excel")]
    /// Spreadsheet read error (feature-gated behind `excel`).
    #[error("excel error: {0}")]
    Excel(#[from] calamine::Error),

    /// Delimited-text read or write error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration or checkpoint (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No adapter recognises the file, or it does not follow the grammar its tags promise.
    #[error("unsupported file type ({}): {reason}", path.display())]
    UnsupportedFileType { path: PathBuf, reason: String },

    /// A required canonical column can neither be read from the file nor derived.
    #[error("data generation error: {message}")]
    DataGeneration { message: String },

    /// An import was attempted on a file that is not eligible for import.
    #[error("file state conflict ({}): state is {state}", path.display())]
    FileStateConflict { path: PathBuf, state: FileState },

    /// A raw value could not be read as a number.
    #[error("failed to parse value at row {row} column '{column}': {message} (raw='{raw}')")]
    ParseError {
        row: usize,
        column: String,
        raw: String,
        message: String,
    },

    /// A line of the canonical wire format is malformed.
    #[error("wire format error at line {line}: {message}")]
    WireFormat { line: usize, message: String },

    /// Harvester configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The observed-file store failed.
    #[error("state store error: {message}")]
    StateStore { message: String },

    /// The row sink rejected a row or failed to commit.
    #[error("sink error: {message}")]
    Sink { message: String },
}

impl HarvestError {
    pub(crate) fn unsupported(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::UnsupportedFileType {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn data_generation(message: impl Into<String>) -> Self {
        Self::DataGeneration {
            message: message.into(),
        }
    }

    /// Whether this failure should leave the file's lifecycle state untouched.
    ///
    /// Classification and metadata failures are retried on the next cycle; everything else
    /// that happens after the import started is recorded as `IMPORT_FAILED`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFileType { .. } | Self::FileStateConflict { .. }
        )
    }
}
