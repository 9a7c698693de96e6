//! Transfer driver
//!
//! Decides per artifact where it goes and whether it may be written, then
//! hands the bytes to the [`RemoteStore`]. A remote file that is already
//! present is a conflict, never a silent success; only the index may replace
//! its predecessor.

use chrono::{DateTime, Utc};
use cmems_common::checksum::compute_file_md5;
use cmems_common::{ArtifactKind, CommonError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::DeliverableFile;
use crate::remote::{join, parent_dir, RemoteError, RemoteLayout, RemoteStore};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("'{remote_path}' already exists on the push server")]
    AlreadyExists { filename: String, remote_path: String },

    #[error("Transfer of '{filename}' failed: {source}")]
    Remote {
        filename: String,
        #[source]
        source: RemoteError,
    },

    #[error("'{filename}' no longer matches its catalog checksum (expected {expected}, found {actual})")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("Cannot read local artifact '{filename}': {source}")]
    Local {
        filename: String,
        #[source]
        source: CommonError,
    },

    #[error("'{0}' has no remote copy to delete")]
    NoRemoteCopy(String),
}

impl TransferError {
    pub fn filename(&self) -> &str {
        match self {
            TransferError::AlreadyExists { filename, .. }
            | TransferError::Remote { filename, .. }
            | TransferError::ChecksumMismatch { filename, .. }
            | TransferError::Local { filename, .. }
            | TransferError::NoRemoteCopy(filename) => filename,
        }
    }
}

/// Acknowledged upload of one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub filename: String,
    pub kind: ArtifactKind,
    pub local_path: PathBuf,
    /// Path relative to the dataset folder, as written in delivery notes
    pub remote_path: String,
    pub absolute_path: String,
    /// MD5 of the bytes that were sent
    pub checksum: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A confirmed file scheduled for removal by the ingestion service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDelete {
    pub filename: String,
    /// Dataset-relative path of the copy to remove
    pub remote_path: String,
}

pub struct TransferDriver<'a> {
    store: &'a dyn RemoteStore,
    layout: &'a RemoteLayout,
}

impl<'a> TransferDriver<'a> {
    pub fn new(store: &'a dyn RemoteStore, layout: &'a RemoteLayout) -> Self {
        Self { store, layout }
    }

    /// Upload a data file to `latest/<YYYYMMDD>/`.
    ///
    /// The local bytes are re-hashed first; a file that drifted from the
    /// catalog's content hash is not delivered.
    pub async fn upload_data(&self, file: &DeliverableFile) -> Result<TransferReceipt, TransferError> {
        let checksum = self.local_checksum(&file.filename, &file.local_path)?;
        if !checksum.eq_ignore_ascii_case(&file.content_hash) {
            return Err(TransferError::ChecksumMismatch {
                filename: file.filename.clone(),
                expected: file.content_hash.clone(),
                actual: checksum,
            });
        }

        let remote_path = self.layout.data_relative(file.source_date, &file.filename);
        let absolute_path = self.layout.absolute(&remote_path);
        self.send(
            &file.filename,
            &file.local_path,
            remote_path,
            absolute_path,
            ArtifactKind::Data,
            checksum,
        )
        .await
    }

    /// Upload the index to the dataset folder, replacing the previous one
    pub async fn upload_index(&self, local: &Path) -> Result<TransferReceipt, TransferError> {
        let filename = local_name(local);
        let checksum = self.local_checksum(&filename, local)?;
        let absolute_path = join(&self.layout.index_dir(), &filename);
        self.send(&filename, local, filename.clone(), absolute_path, ArtifactKind::Index, checksum)
            .await
    }

    /// Upload a delivery note to the notification folder
    pub async fn upload_notification(&self, local: &Path) -> Result<TransferReceipt, TransferError> {
        let filename = local_name(local);
        let checksum = self.local_checksum(&filename, local)?;
        let absolute_path = self.layout.notification_path(&filename);
        self.send(
            &filename,
            local,
            filename.clone(),
            absolute_path,
            ArtifactKind::Notification,
            checksum,
        )
        .await
    }

    /// Schedule removal of a confirmed file. Nothing touches the push
    /// server; the ingestion service removes the file once the delivery
    /// note says so.
    pub fn stage_delete(&self, file: &DeliverableFile) -> Result<StagedDelete, TransferError> {
        let remote_path = file
            .remote_path()
            .ok_or_else(|| TransferError::NoRemoteCopy(file.filename.clone()))?
            .to_string();

        debug!(filename = %file.filename, %remote_path, "Staged delete");
        Ok(StagedDelete {
            filename: file.filename.clone(),
            remote_path,
        })
    }

    /// Take an upload back during an abort
    pub async fn remove(&self, receipt: &TransferReceipt) -> Result<(), TransferError> {
        self.store
            .remove(&receipt.absolute_path)
            .await
            .map_err(|source| remote_error(&receipt.filename, source))
    }

    fn local_checksum(&self, filename: &str, local: &Path) -> Result<String, TransferError> {
        compute_file_md5(local).map_err(|source| TransferError::Local {
            filename: filename.to_string(),
            source,
        })
    }

    async fn send(
        &self,
        filename: &str,
        local: &Path,
        remote_path: String,
        absolute_path: String,
        kind: ArtifactKind,
        checksum: String,
    ) -> Result<TransferReceipt, TransferError> {
        let folder = parent_dir(&absolute_path);
        let started_at = Utc::now();

        let folder_exists = self
            .store
            .is_dir(folder)
            .await
            .map_err(|source| remote_error(filename, source))?;
        if !folder_exists {
            self.store
                .ensure_dir(folder)
                .await
                .map_err(|source| remote_error(filename, source))?;
        } else if !kind.allows_overwrite()
            && self
                .store
                .exists(&absolute_path)
                .await
                .map_err(|source| remote_error(filename, source))?
        {
            return Err(TransferError::AlreadyExists {
                filename: filename.to_string(),
                remote_path: absolute_path,
            });
        }

        let bytes = self
            .store
            .put(local, &absolute_path)
            .await
            .map_err(|source| remote_error(filename, source))?;
        let finished_at = Utc::now();

        info!(%filename, %kind, remote_path = %absolute_path, bytes, "Uploaded artifact");
        Ok(TransferReceipt {
            filename: filename.to_string(),
            kind,
            local_path: local.to_path_buf(),
            remote_path,
            absolute_path,
            checksum,
            started_at,
            finished_at,
        })
    }
}

fn remote_error(filename: &str, source: RemoteError) -> TransferError {
    TransferError::Remote {
        filename: filename.to_string(),
        source,
    }
}

fn local_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
