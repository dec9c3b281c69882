//! Error handling for the shard store
//!
//! This module provides the error type shared by the registry, the database
//! indexes and the storage engines, together with the retryability
//! classification callers use to decide whether a failed write may be resent.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in store operations
#[derive(Error, Debug)]
pub enum Error {
    /// The store is shutting down or has not been opened
    #[error("store is closed")]
    StoreClosed,

    /// No shard is registered under the id
    #[error("shard not found: {0}")]
    ShardNotFound(u64),

    /// The database has no measurement with this name
    #[error("measurement not found: {0}")]
    MeasurementNotFound(String),

    /// The database has no index
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// A source reference that is not a measurement
    #[error("unsupported source type: {0}")]
    UnsupportedSource(String),

    /// Input the store refuses to act on (field predicates in a delete,
    /// time predicates in a tag-value listing, ...)
    #[error("{0}")]
    Unsupported(String),

    /// A condition expression that cannot be evaluated against the index
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// A field was written with a type other than the one already recorded
    #[error("field type conflict: input field \"{field}\" on measurement \"{measurement}\" is type {requested}, already exists as type {existing}")]
    FieldTypeConflict {
        measurement: String,
        field: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// The database index refuses to create more series
    #[error("max series per database exceeded: database {database} limit {limit}")]
    MaxSeriesExceeded { database: String, limit: usize },

    /// A point that cannot be stored
    #[error("invalid point: {0}")]
    InvalidPoint(String),

    /// Errors reported by a shard's storage engine
    #[error("engine error: {0}")]
    Engine(String),

    /// Errors tied to a specific file or directory
    #[error("path error for {path:?}: {message}")]
    Path { path: PathBuf, message: String },

    /// Errors related to I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors encoding or decoding engine records
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Errors related to compression
    #[error("compression error: {0}")]
    Compression(String),

    /// Invalid regular expression in a source or condition
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    /// Data read back from disk failed validation
    #[error("data corruption detected: {0}")]
    Corruption(String),

    /// Errors related to configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new unsupported-input error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Create a new invalid expression error
    pub fn invalid_expression(message: impl Into<String>) -> Self {
        Self::InvalidExpression(message.into())
    }

    /// Create a new invalid point error
    pub fn invalid_point(message: impl Into<String>) -> Self {
        Self::InvalidPoint(message.into())
    }

    /// Create a new engine error
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    /// Create a new path error
    pub fn path(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new encoding error
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    /// Create a new compression error
    pub fn compression(message: impl Into<String>) -> Self {
        Self::Compression(message.into())
    }

    /// Create a new corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption(message.into())
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check if this is one of the not-found conditions
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ShardNotFound(_) | Self::MeasurementNotFound(_) | Self::DatabaseNotFound(_)
        )
    }

    /// Check if this is the closed-store condition
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::StoreClosed)
    }

    /// Check if this is an I/O error
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Path { .. })
    }

    /// Check if this is a field type conflict
    pub fn is_field_type_conflict(&self) -> bool {
        matches!(self, Self::FieldTypeConflict { .. })
    }

    /// Whether the failed operation may succeed if sent again unchanged.
    ///
    /// Schema conflicts, series limits and rejected input are permanent;
    /// everything else is treated as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::FieldTypeConflict { .. }
                | Self::MaxSeriesExceeded { .. }
                | Self::UnsupportedSource(_)
                | Self::Unsupported(_)
                | Self::InvalidExpression(_)
                | Self::InvalidPoint(_)
        )
    }

    /// Get a user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::StoreClosed => Some("Open the store before issuing requests".to_string()),
            Self::Io(err) if err.kind() == io::ErrorKind::NotFound => {
                Some("The specified file or directory does not exist".to_string())
            }
            Self::Io(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                Some("You don't have permission to access this file or directory".to_string())
            }
            Self::FieldTypeConflict { .. } => {
                Some("Write the field with the type it was first written with".to_string())
            }
            Self::MaxSeriesExceeded { .. } => {
                Some("Drop unused series or raise max_series_per_database".to_string())
            }
            Self::Corruption(_) => {
                Some("Data corruption detected. Consider restoring the shard from a backup".to_string())
            }
            _ => None,
        }
    }
}

/// Classify an optional error as retryable.
///
/// `None` counts as retryable: callers that branch on this helper must run
/// the same follow-up check after a success as after a transient failure.
pub fn is_retryable(err: Option<&Error>) -> bool {
    err.map_or(true, Error::is_retryable)
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::encoding(format!("bincode error: {}", err))
    }
}
