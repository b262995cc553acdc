use thiserror::Error;

/// Main error type for gencat
#[derive(Error, Debug)]
pub enum GencatError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Embedded metadata could not be parsed
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Model registry errors
    #[error("Registry error: {0}")]
    Registry(String),

    /// Image decoding / encoding errors
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// File watcher errors
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Catalog row could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Failures of the embedded-metadata grammar.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetadataError {
    /// No generation-parameter text was found in the image
    #[error("no generation metadata found")]
    MissingText,

    /// Structural deviation from the expected grammar
    #[error("format error: {0}")]
    Format(String),

    /// A recognized key carried a value of the wrong shape
    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },
}

impl MetadataError {
    pub(crate) fn format(message: impl Into<String>) -> Self {
        MetadataError::Format(message.into())
    }

    pub(crate) fn invalid(key: &str, value: &str) -> Self {
        MetadataError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Convenient Result type using GencatError
pub type Result<T> = std::result::Result<T, GencatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GencatError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: GencatError = rusqlite_err.into();
        assert!(matches!(err, GencatError::Database(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GencatError = io_err.into();
        assert!(matches!(err, GencatError::Io(_)));
    }

    #[test]
    fn test_error_from_metadata() {
        let err: GencatError = MetadataError::invalid("steps", "abc").into();
        assert!(matches!(err, GencatError::Metadata(_)));
        assert!(err.to_string().contains("'steps'"));
    }
}
