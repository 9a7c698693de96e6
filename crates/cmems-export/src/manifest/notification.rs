//! Delivery notes (DNT)
//!
//! A delivery note tells the ingestion service what changed in one batch:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <delivery PushingEntity="CopernicusMarine-InSitu-Global" date="2024-01-02T03:04:05Z" product="...">
//!   <dataset DatasetName="NRT_202003">
//!     <file Checksum="..." FileName="latest/20240101/A_20240101.nc" FinalStatus="Delivered"
//!           StartUploadTime="..." StopUploadTime="..."/>
//!     <file FileName="latest/20231201/B_20231201.nc"><KeyWord>Delete</KeyWord></file>
//!     <directory DestinationFolderName="" SourceFolderName="latest/20231201"><KeyWord>Delete</KeyWord></directory>
//!   </dataset>
//! </delivery>
//! ```

use chrono::{DateTime, Utc};
use cmems_common::checksum::compute_file_md5;
use cmems_common::DNT_DATETIME_FORMAT;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::ManifestError;
use crate::config::ProductConfig;
use crate::transfer::{StagedDelete, TransferReceipt};

/// One line of a delivery note
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEntry {
    Deliver {
        remote_path: String,
        checksum: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Delete {
        remote_path: String,
    },
    DeleteDirectory {
        folder: String,
    },
}

/// Collects entries, then freezes them into a [`DeliveryNotification`]
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    pushing_entity: String,
    product_id: String,
    dataset_id: String,
    created_at: DateTime<Utc>,
    delivered: Vec<NotificationEntry>,
    deleted: Vec<NotificationEntry>,
}

impl NotificationBuilder {
    pub fn new(product: &ProductConfig, created_at: DateTime<Utc>) -> Self {
        Self {
            pushing_entity: product.pushing_entity.clone(),
            product_id: product.product_id.clone(),
            dataset_id: product.dataset_id.clone(),
            created_at,
            delivered: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// List an uploaded artifact. The local copy is hashed again and must
    /// still match what was sent.
    pub fn deliver(&mut self, receipt: &TransferReceipt) -> Result<&mut Self, ManifestError> {
        let actual = compute_file_md5(&receipt.local_path).map_err(|source| ManifestError::Metadata {
            filename: receipt.filename.clone(),
            source,
        })?;
        if !actual.eq_ignore_ascii_case(&receipt.checksum) {
            return Err(ManifestError::ChecksumMismatch {
                filename: receipt.filename.clone(),
                expected: receipt.checksum.clone(),
                actual,
            });
        }

        self.delivered.push(NotificationEntry::Deliver {
            remote_path: receipt.remote_path.clone(),
            checksum: actual,
            started_at: receipt.started_at,
            finished_at: receipt.finished_at,
        });
        Ok(self)
    }

    pub fn delete(&mut self, staged: &StagedDelete) -> &mut Self {
        self.deleted.push(NotificationEntry::Delete {
            remote_path: staged.remote_path.clone(),
        });
        self
    }

    /// Ask for removal of a dataset-relative folder, e.g. `latest/20231201`
    pub fn delete_directory(&mut self, folder: impl Into<String>) -> &mut Self {
        self.deleted.push(NotificationEntry::DeleteDirectory {
            folder: folder.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty() && self.deleted.is_empty()
    }

    pub fn build(&self) -> DeliveryNotification {
        DeliveryNotification {
            pushing_entity: self.pushing_entity.clone(),
            product_id: self.product_id.clone(),
            dataset_id: self.dataset_id.clone(),
            created_at: self.created_at,
            entries: self
                .delivered
                .iter()
                .chain(self.deleted.iter())
                .cloned()
                .collect(),
        }
    }
}

/// An immutable delivery note
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryNotification {
    pushing_entity: String,
    product_id: String,
    dataset_id: String,
    created_at: DateTime<Utc>,
    entries: Vec<NotificationEntry>,
}

fn xml_error(e: impl std::fmt::Display) -> ManifestError {
    ManifestError::Xml(e.to_string())
}

impl DeliveryNotification {
    /// Timestamp that names the note and identifies its batch
    pub fn batch_id(&self) -> String {
        self.created_at.format(DNT_DATETIME_FORMAT).to_string()
    }

    /// `<product>_P<timestamp>.xml`
    pub fn file_name(&self) -> String {
        format!("{}_P{}.xml", self.product_id, self.batch_id())
    }

    pub fn entries(&self) -> &[NotificationEntry] {
        &self.entries
    }

    pub fn to_xml(&self) -> Result<String, ManifestError> {
        let mut writer = Writer::new(Vec::new());
        let date = self.batch_id();

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;

        let mut delivery = BytesStart::new("delivery");
        delivery.push_attribute(("PushingEntity", self.pushing_entity.as_str()));
        delivery.push_attribute(("date", date.as_str()));
        delivery.push_attribute(("product", self.product_id.as_str()));
        writer.write_event(Event::Start(delivery)).map_err(xml_error)?;

        let mut dataset = BytesStart::new("dataset");
        dataset.push_attribute(("DatasetName", self.dataset_id.as_str()));
        writer.write_event(Event::Start(dataset)).map_err(xml_error)?;

        for entry in &self.entries {
            match entry {
                NotificationEntry::Deliver {
                    remote_path,
                    checksum,
                    started_at,
                    finished_at,
                } => {
                    let started = started_at.format(DNT_DATETIME_FORMAT).to_string();
                    let finished = finished_at.format(DNT_DATETIME_FORMAT).to_string();
                    let mut file = BytesStart::new("file");
                    file.push_attribute(("Checksum", checksum.as_str()));
                    file.push_attribute(("FileName", remote_path.as_str()));
                    file.push_attribute(("FinalStatus", "Delivered"));
                    file.push_attribute(("StartUploadTime", started.as_str()));
                    file.push_attribute(("StopUploadTime", finished.as_str()));
                    writer.write_event(Event::Empty(file)).map_err(xml_error)?;
                },
                NotificationEntry::Delete { remote_path } => {
                    let mut file = BytesStart::new("file");
                    file.push_attribute(("FileName", remote_path.as_str()));
                    write_delete_marker(&mut writer, file, "file")?;
                },
                NotificationEntry::DeleteDirectory { folder } => {
                    let mut directory = BytesStart::new("directory");
                    directory.push_attribute(("DestinationFolderName", ""));
                    directory.push_attribute(("SourceFolderName", folder.as_str()));
                    write_delete_marker(&mut writer, directory, "directory")?;
                },
            }
        }

        writer
            .write_event(Event::End(BytesEnd::new("dataset")))
            .map_err(xml_error)?;
        writer
            .write_event(Event::End(BytesEnd::new("delivery")))
            .map_err(xml_error)?;

        String::from_utf8(writer.into_inner()).map_err(xml_error)
    }

    /// Write the note into `dir` under its own file name
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, ManifestError> {
        let xml = self.to_xml()?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, xml)?;
        debug!(path = %path.display(), entries = self.entries.len(), "Delivery note written");
        Ok(path)
    }
}

fn write_delete_marker(
    writer: &mut Writer<Vec<u8>>,
    element: BytesStart<'_>,
    name: &str,
) -> Result<(), ManifestError> {
    writer.write_event(Event::Start(element)).map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new("KeyWord")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new("Delete")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new("KeyWord")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)?;
    Ok(())
}
