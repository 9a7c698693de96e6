//! Batch planning
//!
//! [`plan`] is a pure function of a catalog snapshot and the clock. It never
//! touches the catalog or the remote store.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use cmems_common::DNT_DATETIME_FORMAT;

use crate::catalog::{DeliverableFile, DeliveryStatus};

/// Age threshold, in days of `source_date`, for live files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    cutoff: NaiveDate,
}

impl RetentionWindow {
    pub fn new(now: DateTime<Utc>, retention_days: u32) -> Self {
        Self {
            cutoff: now.date_naive() - Duration::days(i64::from(retention_days)),
        }
    }

    /// Oldest source date still inside the window
    pub fn cutoff(&self) -> NaiveDate {
        self.cutoff
    }

    pub fn is_expired(&self, source_date: NaiveDate) -> bool {
        source_date < self.cutoff
    }

    /// Confirmed and past the window
    pub fn should_delete(&self, file: &DeliverableFile) -> bool {
        file.status() == DeliveryStatus::Confirmed && self.is_expired(file.source_date)
    }

    /// Awaiting (re)delivery and still inside the window
    pub fn may_upload(&self, file: &DeliverableFile) -> bool {
        matches!(file.status(), DeliveryStatus::NotUploaded | DeliveryStatus::Rejected)
            && !self.is_expired(file.source_date)
    }
}

/// One run's unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Delivery-note timestamp, also stamped on every row the batch touches
    pub batch_id: String,
    pub delete_set: Vec<DeliverableFile>,
    pub upload_set: Vec<DeliverableFile>,
}

impl Batch {
    pub fn is_noop(&self) -> bool {
        self.delete_set.is_empty() && self.upload_set.is_empty()
    }
}

/// Batch id for a run started at `now`
pub fn batch_id(now: DateTime<Utc>) -> String {
    now.format(DNT_DATETIME_FORMAT).to_string()
}

/// Split a snapshot into this run's delete and upload sets, both ordered by
/// filename.
pub fn plan<'a>(
    snapshot: impl IntoIterator<Item = &'a DeliverableFile>,
    now: DateTime<Utc>,
    retention_days: u32,
) -> Batch {
    let window = RetentionWindow::new(now, retention_days);
    let mut delete_set = Vec::new();
    let mut upload_set = Vec::new();

    for file in snapshot {
        if window.should_delete(file) {
            delete_set.push(file.clone());
        } else if window.may_upload(file) {
            upload_set.push(file.clone());
        }
    }

    delete_set.sort_by(|a, b| a.filename.cmp(&b.filename));
    delete_set.dedup_by(|a, b| a.filename == b.filename);
    upload_set.sort_by(|a, b| a.filename.cmp(&b.filename));
    upload_set.dedup_by(|a, b| a.filename == b.filename);

    Batch {
        batch_id: batch_id(now),
        delete_set,
        upload_set,
    }
}
