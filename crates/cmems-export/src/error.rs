//! Engine-level errors

use cmems_common::CommonError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::confirmation::ConfirmationError;
use crate::manifest::ManifestError;
use crate::remote::RemoteError;
use crate::transfer::TransferError;

/// Any failure that stops an export run or a producer registration
#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),
}

pub type ExportResult<T> = Result<T, ExportError>;

/// Per-file failures collected over a run and reported together at the end
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BatchErrors {
    entries: Vec<String>,
}

impl BatchErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl fmt::Display) {
        self.entries.push(message.to_string());
    }

    /// Record a failure attributed to one file
    pub fn push_for(&mut self, filename: &str, error: impl fmt::Display) {
        self.entries.push(format!("{}: {}", filename, error));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

impl fmt::Display for BatchErrors {
    /// One operator-facing line: `N error(s): a; b; c`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("no errors");
        }
        write!(f, "{} error(s): {}", self.entries.len(), self.entries.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_errors_message() {
        let mut errors = BatchErrors::new();
        assert_eq!(errors.to_string(), "no errors");

        errors.push_for("A_20240101.nc", "upload refused");
        errors.push("index not rebuilt");
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.to_string(),
            "2 error(s): A_20240101.nc: upload refused; index not rebuilt"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: ExportError = CatalogError::NotFound("A_20240101.nc".to_string()).into();
        assert_eq!(err.to_string(), "File 'A_20240101.nc' is not in the catalog");
    }
}
