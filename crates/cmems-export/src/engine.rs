//! One export run, start to finish
//!
//! ```text
//! plan ─► surface check ─► data uploads ─► staged deletes ─► index ─► delivery note
//!                                                                         │
//!            folder cleanup ◄── reconcile ◄── ingestion response ◄────────┘
//! ```
//!
//! Per-file failures are collected and the batch carries on. A failure while
//! building or sending an index or the delivery note aborts the batch and
//! takes its uploads back.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::{error, info, warn};

use crate::catalog::{CatalogResult, CatalogStore, DeliverableFile};
use crate::config::ExportConfig;
use crate::confirmation::{ConfirmationPoller, PollOutcome};
use crate::error::{BatchErrors, ExportResult};
use crate::manifest::{write_index, write_platform_index, DeliveryNotification, NotificationBuilder};
use crate::planner::{plan, Batch, RetentionWindow};
use crate::reconciler::Reconciler;
use crate::remote::{check_remote_surface, parent_dir, RemoteLayout, RemoteStore};
use crate::transfer::{StagedDelete, TransferDriver, TransferReceipt};

/// Plan a batch from the rows the catalog reports as eligible
pub async fn plan_from_catalog(
    catalog: &dyn CatalogStore,
    now: DateTime<Utc>,
    retention_days: u32,
) -> CatalogResult<Batch> {
    let window = RetentionWindow::new(now, retention_days);
    let mut snapshot = catalog.list_eligible_for_delete(&window).await?;
    snapshot.extend(catalog.list_eligible_for_upload(&window).await?);
    Ok(plan(&snapshot, now, retention_days))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Nothing to upload or delete; the push server was not contacted
    NoOp,
    Completed,
    /// The response rejected at least one file
    PartiallyRejected,
    /// No usable response within the polling budget
    NoResponse,
    /// Uningested files were found on the push server
    Refused,
    Aborted,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunOutcome::NoOp => "no-op",
            RunOutcome::Completed => "completed",
            RunOutcome::PartiallyRejected => "partially rejected",
            RunOutcome::NoResponse => "no response",
            RunOutcome::Refused => "refused",
            RunOutcome::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub batch_id: String,
    pub uploaded: Vec<String>,
    pub confirmed: Vec<String>,
    pub rejected: Vec<(String, String)>,
    pub withdrawn: Vec<String>,
    pub rolled_back: Vec<String>,
    pub orphaned: Vec<String>,
    pub errors: BatchErrors,
}

impl RunReport {
    fn new(batch_id: String) -> Self {
        Self {
            outcome: RunOutcome::NoOp,
            batch_id,
            uploaded: Vec::new(),
            confirmed: Vec::new(),
            rejected: Vec::new(),
            withdrawn: Vec::new(),
            rolled_back: Vec::new(),
            orphaned: Vec::new(),
            errors: BatchErrors::new(),
        }
    }

    /// Process exit code for the scheduler
    pub fn exit_code(&self) -> u8 {
        match self.outcome {
            RunOutcome::Aborted => 1,
            RunOutcome::Refused => 2,
            _ if !self.errors.is_empty() => 3,
            _ => 0,
        }
    }
}

pub struct ExportEngine<'a> {
    catalog: &'a dyn CatalogStore,
    store: &'a dyn RemoteStore,
    config: &'a ExportConfig,
}

impl<'a> ExportEngine<'a> {
    pub fn new(catalog: &'a dyn CatalogStore, store: &'a dyn RemoteStore, config: &'a ExportConfig) -> Self {
        Self { catalog, store, config }
    }

    /// Run one batch as of `now`.
    ///
    /// `Err` means the run could not start: the catalog could not be read or
    /// the push server could not be inspected. Everything after that ends
    /// in a [`RunReport`].
    pub async fn run(&self, now: DateTime<Utc>) -> ExportResult<RunReport> {
        let layout = self.config.product.layout();
        let batch = plan_from_catalog(self.catalog, now, self.config.retention_days).await?;
        let mut report = RunReport::new(batch.batch_id.clone());

        if batch.is_noop() {
            info!(batch_id = %batch.batch_id, "Nothing to deliver");
            return Ok(report);
        }
        info!(
            batch_id = %batch.batch_id,
            uploads = batch.upload_set.len(),
            deletes = batch.delete_set.len(),
            "Starting export batch"
        );

        let surface = check_remote_surface(self.store, &layout.data_root()).await?;
        if !surface.is_clean() {
            error!(
                stranded = surface.stranded_files.len(),
                "Push server holds uningested files, refusing to run"
            );
            for path in &surface.stranded_files {
                report.errors.push(format!("uningested file {}", path));
            }
            report.outcome = RunOutcome::Refused;
            return Ok(report);
        }

        let driver = TransferDriver::new(self.store, &layout);
        let reconciler = Reconciler::new(self.catalog, self.store, &layout);
        let mut receipts: Vec<TransferReceipt> = Vec::new();

        for file in &batch.upload_set {
            let receipt = match driver.upload_data(file).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!(filename = %file.filename, error = %e, "Upload failed");
                    report.errors.push_for(&file.filename, e);
                    continue;
                },
            };
            let marked = self
                .catalog
                .mark_uploaded(&file.filename, &receipt.remote_path, &batch.batch_id)
                .await;
            if let Err(e) = marked {
                error!(filename = %file.filename, error = %e, "Cannot record upload");
                report.errors.push_for(&file.filename, e);
                // the row never reached Uploaded; only its remote copy is taken back
                let stray = driver.remove(&receipt).await.err();
                let mut report = self.abort(report, &reconciler, &receipts).await;
                if let Some(e) = stray {
                    report
                        .errors
                        .push_for(&receipt.filename, format!("orphaned at {}: {}", receipt.absolute_path, e));
                    report.orphaned.push(receipt.absolute_path);
                }
                return Ok(report);
            }
            receipts.push(receipt);
            report.uploaded.push(file.filename.clone());
        }

        let mut deletes = Vec::new();
        for file in &batch.delete_set {
            match driver.stage_delete(file) {
                Ok(staged) => deletes.push(staged),
                Err(e) => report.errors.push_for(&file.filename, e),
            }
        }

        if receipts.is_empty() && deletes.is_empty() {
            error!(errors = %report.errors, "No file of the batch could be delivered");
            report.outcome = RunOutcome::Aborted;
            return Ok(report);
        }

        let notification = match self.publish(&driver, now, &mut receipts, &deletes).await {
            Ok(notification) => notification,
            Err(e) => {
                error!(error = %e, "Cannot publish batch");
                report.errors.push(e);
                return Ok(self.abort(report, &reconciler, &receipts).await);
            },
        };

        let poller = ConfirmationPoller::new(self.store, &layout, self.config.poll);
        match poller.wait_for(&notification.file_name()).await {
            Ok(PollOutcome::Received(artifact)) => {
                let summary = reconciler
                    .apply_confirmation(&batch.batch_id, &artifact, &deletes, &mut report.errors)
                    .await;
                report.outcome = if summary.rejected.is_empty() {
                    RunOutcome::Completed
                } else {
                    RunOutcome::PartiallyRejected
                };
                report.confirmed = summary.confirmed;
                report.rejected = summary.rejected;
                report.withdrawn = summary.withdrawn;
            },
            Ok(PollOutcome::NoResponse { attempts }) => {
                warn!(batch_id = %batch.batch_id, attempts, "Batch left awaiting ingestion");
                report.outcome = RunOutcome::NoResponse;
            },
            Err(e) => {
                error!(error = %e, "Unusable ingestion response");
                report.errors.push(e);
                report.outcome = RunOutcome::NoResponse;
            },
        }

        if !report.withdrawn.is_empty() {
            self.clean_folders(&driver, &layout, now, &deletes, &mut report).await;
        }

        info!(
            batch_id = %report.batch_id,
            outcome = %report.outcome,
            uploaded = report.uploaded.len(),
            confirmed = report.confirmed.len(),
            rejected = report.rejected.len(),
            withdrawn = report.withdrawn.len(),
            errors = report.errors.len(),
            "Export batch finished"
        );
        if !report.errors.is_empty() {
            warn!("{}", report.errors);
        }
        Ok(report)
    }

    /// Rebuild and upload both indexes, then write and upload the delivery
    /// note. The index receipts join `receipts` so an abort removes them too.
    async fn publish(
        &self,
        driver: &TransferDriver<'_>,
        now: DateTime<Utc>,
        receipts: &mut Vec<TransferReceipt>,
        deletes: &[StagedDelete],
    ) -> ExportResult<DeliveryNotification> {
        let product = &self.config.product;

        let leaving: HashSet<&str> = deletes.iter().map(|d| d.filename.as_str()).collect();
        let live: Vec<DeliverableFile> = self
            .catalog
            .list_live()
            .await?
            .into_iter()
            .filter(|f| !leaving.contains(f.filename.as_str()))
            .collect();

        let index_path = write_index(product, &live, now, &product.local_folder)?;
        receipts.push(driver.upload_index(&index_path).await?);
        let platform_path = write_platform_index(product, &live, now, &product.local_folder)?;
        receipts.push(driver.upload_index(&platform_path).await?);

        let mut builder = NotificationBuilder::new(product, now);
        for receipt in receipts.iter() {
            builder.deliver(receipt)?;
        }
        for staged in deletes {
            builder.delete(staged);
        }
        let notification = builder.build();

        let local = notification.write_to(&product.notification_folder())?;
        driver.upload_notification(&local).await?;
        info!(
            notification = %notification.file_name(),
            entries = notification.entries().len(),
            "Delivery note sent"
        );
        Ok(notification)
    }

    async fn abort(
        &self,
        mut report: RunReport,
        reconciler: &Reconciler<'_>,
        receipts: &[TransferReceipt],
    ) -> RunReport {
        let summary = reconciler.abort(receipts, &mut report.errors).await;
        report.outcome = RunOutcome::Aborted;
        report.uploaded.clear();
        report.rolled_back = summary.rolled_back;
        report.orphaned = summary.orphaned;
        error!(
            batch_id = %report.batch_id,
            rolled_back = report.rolled_back.len(),
            orphaned = report.orphaned.len(),
            "{}",
            report.errors
        );
        report
    }

    /// Ask the service to drop date folders emptied by this batch's deletes.
    /// Failures are recorded; nothing is rolled back.
    async fn clean_folders(
        &self,
        driver: &TransferDriver<'_>,
        layout: &RemoteLayout,
        now: DateTime<Utc>,
        deletes: &[StagedDelete],
        report: &mut RunReport,
    ) {
        let live = match self.catalog.list_live().await {
            Ok(live) => live,
            Err(e) => {
                report.errors.push(format!("folder cleanup skipped: {}", e));
                return;
            },
        };
        let occupied: HashSet<&str> = live.iter().filter_map(|f| f.remote_path()).map(parent_dir).collect();

        let folders: BTreeSet<&str> = deletes
            .iter()
            .filter(|d| report.withdrawn.contains(&d.filename))
            .map(|d| parent_dir(&d.remote_path))
            .filter(|folder| !occupied.contains(folder))
            .collect();
        if folders.is_empty() {
            return;
        }

        // the cleanup note must not reuse the batch note's name
        let created_at = std::cmp::max(Utc::now(), now + Duration::seconds(1));
        let mut builder = NotificationBuilder::new(&self.config.product, created_at);
        for folder in &folders {
            builder.delete_directory(*folder);
        }
        let note = builder.build();

        match self.send_note(driver, layout, &note).await {
            Ok(PollOutcome::Received(artifact)) if artifact.batch_ingested => {
                info!(folders = folders.len(), "Folder cleanup acknowledged");
            },
            Ok(PollOutcome::Received(_)) => {
                report.errors.push(format!("folder cleanup {} not acknowledged", note.file_name()));
            },
            Ok(PollOutcome::NoResponse { .. }) => {
                report.errors.push(format!("no response to folder cleanup {}", note.file_name()));
            },
            Err(e) => report.errors.push(format!("folder cleanup failed: {}", e)),
        }
    }

    async fn send_note(
        &self,
        driver: &TransferDriver<'_>,
        layout: &RemoteLayout,
        note: &DeliveryNotification,
    ) -> ExportResult<PollOutcome> {
        let local = note.write_to(&self.config.product.notification_folder())?;
        driver.upload_notification(&local).await?;
        let poller = ConfirmationPoller::new(self.store, layout, self.config.poll);
        Ok(poller.wait_for(&note.file_name()).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn report(outcome: RunOutcome, errors: usize) -> RunReport {
        let mut report = RunReport::new("2024-01-02T00:00:00Z".to_string());
        report.outcome = outcome;
        for i in 0..errors {
            report.errors.push(format!("error {}", i));
        }
        report
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(RunOutcome::NoOp, 0).exit_code(), 0);
        assert_eq!(report(RunOutcome::Completed, 0).exit_code(), 0);
        assert_eq!(report(RunOutcome::PartiallyRejected, 0).exit_code(), 0);
        assert_eq!(report(RunOutcome::NoResponse, 0).exit_code(), 0);
        assert_eq!(report(RunOutcome::Completed, 2).exit_code(), 3);
        assert_eq!(report(RunOutcome::Refused, 1).exit_code(), 2);
        assert_eq!(report(RunOutcome::Aborted, 1).exit_code(), 1);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(RunOutcome::PartiallyRejected.to_string(), "partially rejected");
        assert_eq!(
            serde_json::to_string(&RunOutcome::NoResponse).unwrap(),
            "\"no_response\""
        );
    }
}
