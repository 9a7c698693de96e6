//! Producer intake
//!
//! The renderer hands over finished files through [`register_produced`]: the
//! bytes and their metadata sidecar are written to the working folder and
//! the catalog row is created or refreshed.

use chrono::NaiveDate;
use cmems_common::checksum::compute_md5;
use cmems_common::FileMetadata;
use std::path::Path;
use tracing::info;

use crate::catalog::{CatalogError, CatalogStore, DeliverableFile, DeliveryStatus, ProducedFile};
use crate::error::{ExportError, ExportResult};

/// A finished data file as handed over by the renderer
#[derive(Debug, Clone)]
pub struct RenderedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Name of the upstream dataset the file was rendered from
    pub source_dataset: String,
    pub metadata: FileMetadata,
}

/// Date encoded as the last `_`-separated token of a file name,
/// e.g. `GL_TS_TS_LMEL_20240101.nc` -> 2024-01-01
pub fn source_date_from_filename(filename: &str) -> Option<NaiveDate> {
    let stem = filename.rsplit_once('.').map_or(filename, |(stem, _)| stem);
    let token = stem.rsplit('_').next()?;
    NaiveDate::parse_from_str(token, "%Y%m%d").ok()
}

/// Write a rendered file and its sidecar into `folder` and register it
pub async fn register_produced(
    catalog: &dyn CatalogStore,
    folder: &Path,
    file: RenderedFile,
) -> ExportResult<DeliverableFile> {
    if file.filename.is_empty() || file.filename.contains('/') {
        return Err(ExportError::InvalidArtifact(format!(
            "unusable file name '{}'",
            file.filename
        )));
    }

    let content_hash = compute_md5(&file.bytes);
    let source_date = source_date_from_filename(&file.filename)
        .unwrap_or_else(|| file.metadata.time_coverage_start.date_naive());

    // Never overwrite bytes the ingestion service has not yet judged
    if let Some(existing) = catalog.get(&file.filename).await? {
        if existing.status() == DeliveryStatus::Uploaded && existing.content_hash != content_hash {
            return Err(CatalogError::IllegalTransition {
                filename: existing.filename,
                from: DeliveryStatus::Uploaded,
                transition: "register",
            }
            .into());
        }
    }

    std::fs::create_dir_all(folder).map_err(cmems_common::CommonError::from)?;
    let local_path = folder.join(&file.filename);
    std::fs::write(&local_path, &file.bytes).map_err(cmems_common::CommonError::from)?;
    file.metadata.write_for(&local_path)?;

    let row = catalog
        .register(ProducedFile {
            filename: file.filename,
            content_hash,
            source_date,
            source_dataset: file.source_dataset,
            local_path,
        })
        .await?;

    info!(
        filename = %row.filename,
        content_hash = %row.content_hash,
        state = %row.status(),
        "Registered rendered file"
    );
    Ok(row)
}
