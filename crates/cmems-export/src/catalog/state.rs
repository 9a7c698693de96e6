//! Delivery state machine
//!
//! ```text
//! NotUploaded --upload--> Uploaded --confirm--> Confirmed --withdraw--> NotUploaded
//!                            |  \
//!                            |   --reject--> Rejected --upload--> Uploaded
//!                            --rollback--> NotUploaded
//! ```
//!
//! Every catalog backend funnels its mutations through [`apply`], so the
//! backends cannot disagree about what is legal.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::CatalogError;

/// Where a file stands with the remote ingestion service.
///
/// The remote path lives inside the variants that have one, so a row can
/// never claim a remote copy while `NotUploaded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    NotUploaded,
    Uploaded { remote_path: String },
    Confirmed { remote_path: String },
    Rejected { remote_path: String, reason: String },
}

impl DeliveryState {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            DeliveryState::NotUploaded => DeliveryStatus::NotUploaded,
            DeliveryState::Uploaded { .. } => DeliveryStatus::Uploaded,
            DeliveryState::Confirmed { .. } => DeliveryStatus::Confirmed,
            DeliveryState::Rejected { .. } => DeliveryStatus::Rejected,
        }
    }

    pub fn remote_path(&self) -> Option<&str> {
        match self {
            DeliveryState::NotUploaded => None,
            DeliveryState::Uploaded { remote_path }
            | DeliveryState::Confirmed { remote_path }
            | DeliveryState::Rejected { remote_path, .. } => Some(remote_path),
        }
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            DeliveryState::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Rebuild a state from its persisted columns
    pub fn from_columns(
        status: DeliveryStatus,
        remote_path: Option<String>,
        reason: Option<String>,
    ) -> Result<Self, String> {
        match (status, remote_path, reason) {
            (DeliveryStatus::NotUploaded, None, None) => Ok(DeliveryState::NotUploaded),
            (DeliveryStatus::Uploaded, Some(remote_path), None) => {
                Ok(DeliveryState::Uploaded { remote_path })
            },
            (DeliveryStatus::Confirmed, Some(remote_path), None) => {
                Ok(DeliveryState::Confirmed { remote_path })
            },
            (DeliveryStatus::Rejected, Some(remote_path), Some(reason)) => {
                Ok(DeliveryState::Rejected { remote_path, reason })
            },
            (status, remote_path, reason) => Err(format!(
                "state '{}' with remote_path={:?} rejection_reason={:?}",
                status, remote_path, reason
            )),
        }
    }
}

/// Bare discriminant of [`DeliveryState`], as stored in the catalog table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    NotUploaded,
    Uploaded,
    Confirmed,
    Rejected,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::NotUploaded => "not_uploaded",
            DeliveryStatus::Uploaded => "uploaded",
            DeliveryStatus::Confirmed => "confirmed",
            DeliveryStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_uploaded" => Ok(DeliveryStatus::NotUploaded),
            "uploaded" => Ok(DeliveryStatus::Uploaded),
            "confirmed" => Ok(DeliveryStatus::Confirmed),
            "rejected" => Ok(DeliveryStatus::Rejected),
            other => Err(format!("unknown delivery state '{}'", other)),
        }
    }
}

/// One row of the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverableFile {
    pub filename: String,
    /// Lowercase hex MD5 of the rendered artifact
    pub content_hash: String,
    pub source_date: NaiveDate,
    pub source_dataset: String,
    pub local_path: PathBuf,
    pub state: DeliveryState,
    /// Timestamp id of the delivery note that last mentioned this file
    pub notification_batch_id: Option<String>,
}

impl DeliverableFile {
    pub fn status(&self) -> DeliveryStatus {
        self.state.status()
    }

    pub fn remote_path(&self) -> Option<&str> {
        self.state.remote_path()
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.state.rejection_reason()
    }
}

/// A requested change to one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Transfer acknowledged by the remote store
    Upload { remote_path: String, batch_id: String },
    /// Ingestion service accepted the file
    Confirm,
    /// Ingestion service refused the file
    Reject { reason: String },
    /// Abort path: the upload is being taken back
    Rollback,
    /// Retention: the confirmed remote copy has been deleted
    Withdraw { batch_id: String },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Upload { .. } => "upload",
            Transition::Confirm => "confirm",
            Transition::Reject { .. } => "reject",
            Transition::Rollback => "rollback",
            Transition::Withdraw { .. } => "withdraw",
        }
    }
}

/// Apply `transition` to `file`, returning the updated row.
///
/// Repeating a transition that already took effect returns the row
/// unchanged, so a crashed run can be replayed safely.
pub fn apply(file: &DeliverableFile, transition: &Transition) -> Result<DeliverableFile, CatalogError> {
    use DeliveryState::*;

    let mut next = file.clone();
    match (&file.state, transition) {
        (NotUploaded | Rejected { .. }, Transition::Upload { remote_path, batch_id }) => {
            next.state = Uploaded { remote_path: remote_path.clone() };
            next.notification_batch_id = Some(batch_id.clone());
        },
        (Uploaded { remote_path: current }, Transition::Upload { remote_path, batch_id })
            if current == remote_path
                && file.notification_batch_id.as_deref() == Some(batch_id.as_str()) => {},

        (Uploaded { remote_path }, Transition::Confirm) => {
            next.state = Confirmed { remote_path: remote_path.clone() };
        },
        (Confirmed { .. }, Transition::Confirm) => {},

        (Uploaded { remote_path }, Transition::Reject { reason }) => {
            next.state = Rejected {
                remote_path: remote_path.clone(),
                reason: reason.clone(),
            };
        },
        (Rejected { reason: current, .. }, Transition::Reject { reason }) if current == reason => {},

        (Uploaded { .. }, Transition::Rollback) => next.state = NotUploaded,
        (NotUploaded, Transition::Rollback) => {},

        (Confirmed { .. }, Transition::Withdraw { batch_id }) => {
            next.state = NotUploaded;
            next.notification_batch_id = Some(batch_id.clone());
        },
        (NotUploaded, Transition::Withdraw { batch_id })
            if file.notification_batch_id.as_deref() == Some(batch_id.as_str()) => {},

        (state, transition) => {
            return Err(CatalogError::IllegalTransition {
                filename: file.filename.clone(),
                from: state.status(),
                transition: transition.name(),
            })
        },
    }
    Ok(next)
}
