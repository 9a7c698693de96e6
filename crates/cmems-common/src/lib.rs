//! CMEMS Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the CMEMS export workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: MD5 helpers matching the `Checksum` attribute the
//!   ingestion service verifies
//! - **Logging**: tracing subscriber bootstrap shared by every binary
//! - **Types**: artifact kinds and the per-file metadata used by the index
//!
//! # Example
//!
//! ```no_run
//! use cmems_common::checksum::compute_file_md5;
//! use cmems_common::Result;
//!
//! fn fingerprint(path: &str) -> Result<String> {
//!     compute_file_md5(path)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{ArtifactKind, FileMetadata, DNT_DATETIME_FORMAT};
