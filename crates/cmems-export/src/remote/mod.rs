//! Remote store access
//!
//! The engine decides what to transfer; a [`RemoteStore`] only moves bytes
//! and answers questions about paths. All paths handed to a store are
//! absolute, `/`-separated, and without a trailing slash.

pub mod ftp;
pub mod memory;
pub mod surface;

pub use ftp::FtpRemoteStore;
pub use memory::MemoryRemoteStore;
pub use surface::{check_remote_surface, SurfaceReport};

use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Cannot reach remote store: {0}")]
    Connection(String),

    #[error("Remote operation on '{path}' failed: {message}")]
    Transport { path: String, message: String },

    #[error("Remote path '{0}' does not exist")]
    NotFound(String),

    #[error("Local file error: {0}")]
    Local(#[from] std::io::Error),

    #[error("Remote session is unusable: {0}")]
    Session(String),
}

impl RemoteError {
    pub fn transport(path: &str, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: Option<u64>,
}

/// Byte-level access to the push server
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn is_dir(&self, path: &str) -> RemoteResult<bool>;

    /// Create one directory; its parent must exist
    async fn mkdir(&self, path: &str) -> RemoteResult<()>;

    /// Whether a file exists at `path`
    async fn exists(&self, path: &str) -> RemoteResult<bool>;

    /// Upload a local file, replacing any file at `remote`. Returns bytes sent.
    async fn put(&self, local: &Path, remote: &str) -> RemoteResult<u64>;

    async fn get(&self, remote: &str) -> RemoteResult<Vec<u8>>;

    async fn remove(&self, remote: &str) -> RemoteResult<()>;

    /// Remove an empty directory
    async fn rmdir(&self, path: &str) -> RemoteResult<()>;

    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>>;

    /// Create `path` and any missing ancestors
    async fn ensure_dir(&self, path: &str) -> RemoteResult<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if !self.is_dir(&current).await? {
                self.mkdir(&current).await?;
            }
        }
        Ok(())
    }
}

/// Directory part of a remote path (`/` for top-level entries)
pub fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// Join a remote directory and a name
pub fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Where each artifact lives on the push server
///
/// ```text
/// /<product>/<dataset>/latest/<YYYYMMDD>/<file>.nc   data
/// /<product>/<dataset>/index_latest.txt              index
/// /<product>/DNT/<product>_P<timestamp>.xml          delivery note
/// /<product>/DNT_response/<note stem>_response.xml   ingestion response
/// ```
///
/// Delivery notes and the catalog address files relative to the dataset
/// folder, e.g. `latest/20240101/A_20240101.nc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    product_id: String,
    dataset_id: String,
}

impl RemoteLayout {
    pub fn new(product_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            dataset_id: dataset_id.into(),
        }
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn dataset_dir(&self) -> String {
        format!("/{}/{}", self.product_id, self.dataset_id)
    }

    /// Root of the data tree; must be empty between runs
    pub fn data_root(&self) -> String {
        join(&self.dataset_dir(), "latest")
    }

    pub fn index_dir(&self) -> String {
        self.dataset_dir()
    }

    pub fn notification_dir(&self) -> String {
        format!("/{}/DNT", self.product_id)
    }

    pub fn response_dir(&self) -> String {
        format!("/{}/DNT_response", self.product_id)
    }

    /// Dataset-relative destination of a data file
    pub fn data_relative(&self, source_date: NaiveDate, filename: &str) -> String {
        format!("latest/{}/{}", source_date.format("%Y%m%d"), filename)
    }

    /// Absolute path of a dataset-relative path
    pub fn absolute(&self, relative: &str) -> String {
        join(&self.dataset_dir(), relative)
    }

    pub fn notification_path(&self, notification_name: &str) -> String {
        join(&self.notification_dir(), notification_name)
    }

    /// Where the ingestion service answers a delivery note
    pub fn response_path(&self, notification_name: &str) -> String {
        let stem = notification_name
            .strip_suffix(".xml")
            .unwrap_or(notification_name);
        join(&self.response_dir(), &format!("{}_response.xml", stem))
    }
}
