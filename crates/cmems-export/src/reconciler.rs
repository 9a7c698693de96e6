//! Applying ingestion verdicts, and taking a failed batch back

use cmems_common::ArtifactKind;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{CatalogStore, DeliveryStatus};
use crate::confirmation::{ConfirmationArtifact, FileVerdict};
use crate::error::BatchErrors;
use crate::remote::{check_remote_surface, RemoteLayout, RemoteStore};
use crate::transfer::{StagedDelete, TransferDriver, TransferReceipt};

/// What a parsed response changed in the catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub confirmed: Vec<String>,
    /// `(filename, reason)` pairs
    pub rejected: Vec<(String, String)>,
    pub withdrawn: Vec<String>,
}

/// What an abort managed to undo
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AbortSummary {
    pub rolled_back: Vec<String>,
    /// Remote copies that were removed again
    pub removed: Vec<String>,
    /// Remote copies that could not be removed and stay behind
    pub orphaned: Vec<String>,
}

pub struct Reconciler<'a> {
    catalog: &'a dyn CatalogStore,
    store: &'a dyn RemoteStore,
    layout: &'a RemoteLayout,
}

impl<'a> Reconciler<'a> {
    pub fn new(catalog: &'a dyn CatalogStore, store: &'a dyn RemoteStore, layout: &'a RemoteLayout) -> Self {
        Self { catalog, store, layout }
    }

    /// Move every row uploaded by `batch_id` to Confirmed or Rejected, and
    /// withdraw the deletions the service acknowledged.
    ///
    /// Catalog failures are collected per file; the remaining rows are
    /// still processed.
    pub async fn apply_confirmation(
        &self,
        batch_id: &str,
        artifact: &ConfirmationArtifact,
        deletes: &[StagedDelete],
        errors: &mut BatchErrors,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let rows = match self.catalog.list_in_batch(batch_id).await {
            Ok(rows) => rows,
            Err(e) => {
                errors.push(format!("cannot list batch {}: {}", batch_id, e));
                return summary;
            },
        };

        for row in rows.iter().filter(|r| r.status() == DeliveryStatus::Uploaded) {
            let Some(remote_path) = row.remote_path() else {
                continue;
            };
            match artifact.verdict_for(remote_path) {
                FileVerdict::Ingested => match self.catalog.mark_confirmed(&row.filename).await {
                    Ok(_) => summary.confirmed.push(row.filename.clone()),
                    Err(e) => errors.push_for(&row.filename, e),
                },
                FileVerdict::Rejected { reason } => {
                    warn!(filename = %row.filename, %reason, "File rejected by ingestion service");
                    match self.catalog.mark_rejected(&row.filename, &reason).await {
                        Ok(_) => summary.rejected.push((row.filename.clone(), reason)),
                        Err(e) => errors.push_for(&row.filename, e),
                    }
                },
            }
        }

        for staged in deletes {
            match artifact.verdict_for(&staged.remote_path) {
                FileVerdict::Ingested => match self.catalog.mark_withdrawn(&staged.filename, batch_id).await {
                    Ok(_) => summary.withdrawn.push(staged.filename.clone()),
                    Err(e) => errors.push_for(&staged.filename, e),
                },
                FileVerdict::Rejected { reason } => {
                    // stays Confirmed; the next run plans the delete again
                    warn!(filename = %staged.filename, %reason, "Delete not acknowledged");
                    errors.push_for(&staged.filename, format!("delete not acknowledged: {}", reason));
                },
            }
        }

        info!(
            %batch_id,
            confirmed = summary.confirmed.len(),
            rejected = summary.rejected.len(),
            withdrawn = summary.withdrawn.len(),
            "Batch reconciled"
        );
        summary
    }

    /// Undo a batch that failed before its delivery note went out.
    ///
    /// Data rows go back to NotUploaded first, then the remote copies are
    /// removed best-effort and empty folders swept. A copy that cannot be
    /// removed is reported as orphaned and left in place.
    pub async fn abort(&self, receipts: &[TransferReceipt], errors: &mut BatchErrors) -> AbortSummary {
        let mut summary = AbortSummary::default();
        warn!(artifacts = receipts.len(), "Aborting batch");

        for receipt in receipts.iter().filter(|r| r.kind == ArtifactKind::Data) {
            match self.catalog.mark_not_uploaded(&receipt.filename).await {
                Ok(_) => summary.rolled_back.push(receipt.filename.clone()),
                Err(e) => errors.push_for(&receipt.filename, format!("rollback failed: {}", e)),
            }
        }

        let driver = TransferDriver::new(self.store, self.layout);
        for receipt in receipts {
            match driver.remove(receipt).await {
                Ok(()) => summary.removed.push(receipt.absolute_path.clone()),
                Err(e) => {
                    warn!(remote_path = %receipt.absolute_path, error = %e, "Orphaned remote artifact");
                    errors.push_for(&receipt.filename, format!("orphaned at {}: {}", receipt.absolute_path, e));
                    summary.orphaned.push(receipt.absolute_path.clone());
                },
            }
        }

        if let Err(e) = check_remote_surface(self.store, &self.layout.data_root()).await {
            errors.push(format!("cleanup of {} failed: {}", self.layout.data_root(), e));
        }

        info!(
            rolled_back = summary.rolled_back.len(),
            removed = summary.removed.len(),
            orphaned = summary.orphaned.len(),
            "Batch aborted"
        );
        summary
    }
}
