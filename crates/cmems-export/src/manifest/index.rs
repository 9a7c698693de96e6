//! `index_latest.txt`: the public catalog of live files

use chrono::{DateTime, Utc};
use cmems_common::{FileMetadata, DNT_DATETIME_FORMAT};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::ManifestError;
use crate::catalog::DeliverableFile;
use crate::config::ProductConfig;

pub const INDEX_FILENAME: &str = "index_latest.txt";

const COLUMNS: &str = "# catalog_id,file_name,geospatial_lat_min,geospatial_lat_max,\
geospatial_lon_min,geospatial_lon_max,time_coverage_start,time_coverage_end,\
provider,date_update,data_mode,parameters";

/// Render the index for `files`, ordered by filename.
///
/// Each file's bounds come from its metadata sidecar; a missing or
/// unreadable sidecar fails the whole index.
pub fn render_index(
    product: &ProductConfig,
    files: &[DeliverableFile],
    generated_at: DateTime<Utc>,
) -> Result<String, ManifestError> {
    let mut out = String::new();
    // trailing spaces are part of the published header
    out.push_str("# Title : Carbon in-situ observations catalog \n");
    out.push_str("# Description : catalog of available in-situ observations per platform.\n");
    out.push_str("# Project : Copernicus \n");
    out.push_str("# Format version : 1.0 \n");
    out.push_str(&format!("# Date of update : {}\n", generated_at.format("%Y%m%d%H%M%S")));
    out.push_str(COLUMNS);
    out.push('\n');

    let mut ordered: Vec<&DeliverableFile> = files.iter().collect();
    ordered.sort_by(|a, b| a.filename.cmp(&b.filename));

    for file in ordered {
        let remote_path = file.remote_path().ok_or_else(|| ManifestError::NotDelivered {
            filename: file.filename.clone(),
        })?;
        let meta = FileMetadata::read_for(&file.local_path).map_err(|source| ManifestError::Metadata {
            filename: file.filename.clone(),
            source,
        })?;

        // writing to a String cannot fail
        let _ = writeln!(
            out,
            "{},{}/{}/{}/{},{},{},{},{},{},{},{},{},R,{}",
            product.catalog_id,
            product.server_location.trim_end_matches('/'),
            product.product_id,
            product.public_alias,
            remote_path,
            meta.lat_min,
            meta.lat_max,
            meta.lon_min,
            meta.lon_max,
            meta.time_coverage_start.format(DNT_DATETIME_FORMAT),
            meta.time_coverage_end.format(DNT_DATETIME_FORMAT),
            product.institution,
            meta.date_update.format(DNT_DATETIME_FORMAT),
            meta.parameter_list(),
        );
    }

    Ok(out)
}

/// Render the index and write it to `dir/index_latest.txt`
pub fn write_index(
    product: &ProductConfig,
    files: &[DeliverableFile],
    generated_at: DateTime<Utc>,
    dir: &Path,
) -> Result<PathBuf, ManifestError> {
    let body = render_index(product, files, generated_at)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(INDEX_FILENAME);
    std::fs::write(&path, body)?;
    debug!(path = %path.display(), entries = files.len(), "Index written");
    Ok(path)
}
