//! Error types for the sharing subsystem

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by sharing operations.
///
/// Every failure is mapped to the class the coordinators route on:
/// network failures send the import flow back to its input phase,
/// validation failures distinguish "not a package" from "broken package",
/// and tunnel/packaging/import failures return the export or import
/// state machine to its nearest interactive state.
#[derive(Debug, Error)]
pub enum ShareError {
    /// Unreachable host, timeout, or a non-success HTTP status.
    #[error("Network error: {0}")]
    Network(String),

    /// The data is readable but is not a recognized share package or
    /// manifest (missing manifest entry, unsupported version, bad JSON).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The archive itself cannot be read.
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// A public endpoint could not be established.
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// The export package could not be built.
    #[error("Packaging error: {0}")]
    Packaging(String),

    /// A verified package could not be materialized as an instance.
    #[error("Import error: {0}")]
    Import(String),

    /// Password required or rejected by the serving side.
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Serialize for ShareError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type ShareResult<T> = Result<T, ShareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_class_and_message() {
        let err = ShareError::Network("connection refused".to_string());
        assert_eq!(err.to_string(), "Network error: connection refused");

        let err = ShareError::CorruptArchive("bad central directory".to_string());
        assert!(err.to_string().starts_with("Corrupt archive:"));
    }

    #[test]
    fn json_errors_convert() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ShareError = parse_err.into();
        assert!(matches!(err, ShareError::Json(_)));
    }
}
