//! Index and delivery-note artifacts
//!
//! All are rebuilt from scratch every batch. A file whose metadata cannot
//! be read fails the build; nothing partial is ever written.

pub mod index;
pub mod notification;
pub mod platform;

pub use index::{render_index, write_index, INDEX_FILENAME};
pub use platform::{render_platform_index, write_platform_index, PLATFORM_INDEX_FILENAME};
pub use notification::{DeliveryNotification, NotificationBuilder, NotificationEntry};

use cmems_common::CommonError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Cannot read metadata of '{filename}': {source}")]
    Metadata {
        filename: String,
        #[source]
        source: CommonError,
    },

    #[error("'{filename}' has no remote path and cannot be listed")]
    NotDelivered { filename: String },

    #[error("'{filename}' changed since upload (sent {expected}, local copy is {actual})")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("Failed to write artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to render delivery note: {0}")]
    Xml(String),
}
