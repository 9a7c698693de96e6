//! `index_platform.txt`: one record per platform with live files

use chrono::{DateTime, Utc};
use cmems_common::{FileMetadata, DNT_DATETIME_FORMAT};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::ManifestError;
use crate::catalog::DeliverableFile;
use crate::config::ProductConfig;

pub const PLATFORM_INDEX_FILENAME: &str = "index_platform.txt";

const COLUMNS: &str = "# platform_code,creation_date,update_date,wmo_platform_code,data_source,\
institution,institution_edmo_code,parameter,last_latitude_observation,\
last_longitude_observation,last_date_observation ";

struct PlatformRecord {
    first_observation: DateTime<Utc>,
    latest_file: String,
    latest: FileMetadata,
}

impl PlatformRecord {
    fn new(filename: &str, meta: FileMetadata) -> Self {
        Self {
            first_observation: meta.time_coverage_start,
            latest_file: filename.to_string(),
            latest: meta,
        }
    }

    fn add(&mut self, filename: &str, meta: FileMetadata) {
        self.first_observation = self.first_observation.min(meta.time_coverage_start);
        let newer = (meta.time_coverage_end, filename) > (self.latest.time_coverage_end, self.latest_file.as_str());
        if newer {
            self.latest_file = filename.to_string();
            self.latest = meta;
        }
    }

    /// `GL_TS_TS_LMEL_20240101.nc` is published as `GL_TS_TS_LMEL_XXXXXX`
    fn data_source(&self) -> String {
        let stem = self.latest_file.strip_suffix(".nc").unwrap_or(&self.latest_file);
        match stem.rsplit_once('_') {
            Some((prefix, _)) => format!("{}_XXXXXX", prefix),
            None => stem.to_string(),
        }
    }
}

fn cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Render the platform index for `files`, ordered by platform code.
///
/// Each platform is described by its most recent file. A missing or
/// unreadable sidecar fails the whole index.
pub fn render_platform_index(
    product: &ProductConfig,
    files: &[DeliverableFile],
    generated_at: DateTime<Utc>,
) -> Result<String, ManifestError> {
    let mut platforms: BTreeMap<String, PlatformRecord> = BTreeMap::new();
    for file in files {
        let meta = FileMetadata::read_for(&file.local_path).map_err(|source| ManifestError::Metadata {
            filename: file.filename.clone(),
            source,
        })?;
        match platforms.get_mut(&meta.platform_code) {
            Some(record) => record.add(&file.filename, meta),
            None => {
                platforms.insert(meta.platform_code.clone(), PlatformRecord::new(&file.filename, meta));
            },
        }
    }

    let mut out = String::new();
    out.push_str("# Title : In Situ platforms catalog \n");
    out.push_str("# Description : catalog of available In Situ platforms.\n");
    out.push_str("# Project : Copernicus \n");
    out.push_str("# Format version : 1.0 \n");
    out.push_str(&format!("# Date of update : {}\n", generated_at.format("%Y%m%d%H%M%S")));
    out.push_str(COLUMNS);
    out.push('\n');

    for (code, record) in &platforms {
        let latest = &record.latest;
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{}",
            code,
            record.first_observation.format(DNT_DATETIME_FORMAT),
            latest.date_update.format(DNT_DATETIME_FORMAT),
            cell(latest.wmo_platform_code.as_deref()),
            record.data_source(),
            product.institution,
            product.institution_edmo,
            latest.parameter_list(),
            cell(latest.last_latitude),
            cell(latest.last_longitude),
            latest.time_coverage_end.format(DNT_DATETIME_FORMAT),
        );
    }

    Ok(out)
}

/// Render the platform index and write it to `dir/index_platform.txt`
pub fn write_platform_index(
    product: &ProductConfig,
    files: &[DeliverableFile],
    generated_at: DateTime<Utc>,
    dir: &Path,
) -> Result<PathBuf, ManifestError> {
    let body = render_platform_index(product, files, generated_at)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(PLATFORM_INDEX_FILENAME);
    std::fs::write(&path, body)?;
    debug!(path = %path.display(), "Platform index written");
    Ok(path)
}
