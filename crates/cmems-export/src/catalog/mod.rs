//! Persistent catalog of deliverable files
//!
//! One row per file the producer has ever rendered. Rows are never deleted;
//! their [`DeliveryState`] moves through the transitions in [`state`] and the
//! row itself is the audit trail. Two backends implement [`CatalogStore`]:
//! [`PgCatalogStore`] for deployments and [`MemoryCatalogStore`] for tests
//! and dry runs.

pub mod memory;
pub mod postgres;
pub mod state;

pub use memory::MemoryCatalogStore;
pub use postgres::PgCatalogStore;
pub use state::{DeliverableFile, DeliveryState, DeliveryStatus, Transition};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::planner::RetentionWindow;

/// Catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Catalog migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("File '{0}' is not in the catalog")]
    NotFound(String),

    #[error("Illegal transition '{transition}' for '{filename}' in state '{from}'")]
    IllegalTransition {
        filename: String,
        from: DeliveryStatus,
        transition: &'static str,
    },

    #[error("Catalog row for '{filename}' is corrupt: {reason}")]
    Corrupt { filename: String, reason: String },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Producer-side registration of a rendered file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedFile {
    pub filename: String,
    pub content_hash: String,
    pub source_date: NaiveDate,
    pub source_dataset: String,
    pub local_path: PathBuf,
}

impl ProducedFile {
    fn into_row(self) -> DeliverableFile {
        DeliverableFile {
            filename: self.filename,
            content_hash: self.content_hash,
            source_date: self.source_date,
            source_dataset: self.source_dataset,
            local_path: self.local_path,
            state: DeliveryState::NotUploaded,
            notification_batch_id: None,
        }
    }
}

/// Merge a registration into an existing row.
///
/// Unchanged content keeps the row as is. New content resets the row to
/// `NotUploaded`, except while an upload is awaiting its verdict.
pub(crate) fn merge_registration(
    existing: Option<&DeliverableFile>,
    produced: ProducedFile,
) -> CatalogResult<DeliverableFile> {
    let Some(existing) = existing else {
        return Ok(produced.into_row());
    };

    if existing.content_hash == produced.content_hash {
        return Ok(existing.clone());
    }

    if existing.status() == DeliveryStatus::Uploaded {
        return Err(CatalogError::IllegalTransition {
            filename: existing.filename.clone(),
            from: DeliveryStatus::Uploaded,
            transition: "register",
        });
    }

    let mut row = produced.into_row();
    row.notification_batch_id = existing.notification_batch_id.clone();
    Ok(row)
}

/// Durable per-file delivery state.
///
/// Every mutation touches a single row, is atomic, and is idempotent for
/// identical arguments. Implementations never talk to the remote store.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert a freshly rendered file or refresh one whose content changed
    async fn register(&self, file: ProducedFile) -> CatalogResult<DeliverableFile>;

    async fn get(&self, filename: &str) -> CatalogResult<Option<DeliverableFile>>;

    /// Confirmed files whose source date fell out of the retention window
    async fn list_eligible_for_delete(
        &self,
        window: &RetentionWindow,
    ) -> CatalogResult<Vec<DeliverableFile>>;

    /// NotUploaded or Rejected files still inside the retention window
    async fn list_eligible_for_upload(
        &self,
        window: &RetentionWindow,
    ) -> CatalogResult<Vec<DeliverableFile>>;

    /// Files with a remote copy that is live or awaiting ingestion
    async fn list_live(&self) -> CatalogResult<Vec<DeliverableFile>>;

    async fn list_in_batch(&self, batch_id: &str) -> CatalogResult<Vec<DeliverableFile>>;

    /// Apply one transition to one row, atomically
    async fn transition(
        &self,
        filename: &str,
        transition: Transition,
    ) -> CatalogResult<DeliverableFile>;

    async fn mark_uploaded(
        &self,
        filename: &str,
        remote_path: &str,
        batch_id: &str,
    ) -> CatalogResult<DeliverableFile> {
        self.transition(
            filename,
            Transition::Upload {
                remote_path: remote_path.to_string(),
                batch_id: batch_id.to_string(),
            },
        )
        .await
    }

    async fn mark_confirmed(&self, filename: &str) -> CatalogResult<DeliverableFile> {
        self.transition(filename, Transition::Confirm).await
    }

    async fn mark_rejected(&self, filename: &str, reason: &str) -> CatalogResult<DeliverableFile> {
        self.transition(
            filename,
            Transition::Reject {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Roll an unverified upload back
    async fn mark_not_uploaded(&self, filename: &str) -> CatalogResult<DeliverableFile> {
        self.transition(filename, Transition::Rollback).await
    }

    /// Record that the confirmed remote copy was deleted by `batch_id`
    async fn mark_withdrawn(&self, filename: &str, batch_id: &str) -> CatalogResult<DeliverableFile> {
        self.transition(
            filename,
            Transition::Withdraw {
                batch_id: batch_id.to_string(),
            },
        )
        .await
    }
}
