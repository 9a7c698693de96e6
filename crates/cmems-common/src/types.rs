//! Common types used across the export workspace

use crate::error::{CommonError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Timestamp format used in delivery notes and their file names
pub const DNT_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Kind of artifact pushed to the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A rendered netCDF data file
    Data,
    /// The plaintext catalog of live files
    Index,
    /// A delivery note (DNT)
    Notification,
}

impl ArtifactKind {
    /// Whether an upload may replace a remote file of the same name.
    ///
    /// Only the index is regenerated in full and replaces its predecessor;
    /// a pre-existing data file or delivery note is a conflict.
    pub fn allows_overwrite(self) -> bool {
        matches!(self, ArtifactKind::Index)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Data => "data",
            ArtifactKind::Index => "index",
            ArtifactKind::Notification => "notification",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discovery metadata for one rendered data file.
///
/// Written by the producer as a JSON sidecar next to the artifact
/// (`<file>.nc.json`) and read back when the index is rebuilt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub platform_code: String,
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
    pub time_coverage_start: DateTime<Utc>,
    pub time_coverage_end: DateTime<Utc>,
    pub date_update: DateTime<Utc>,
    /// Measured parameter codes, e.g. `["TEMP", "PSAL", "FCO2"]`
    pub parameters: Vec<String>,
    #[serde(default)]
    pub wmo_platform_code: Option<String>,
    /// Position of the last observation in the file
    #[serde(default)]
    pub last_latitude: Option<f64>,
    #[serde(default)]
    pub last_longitude: Option<f64>,
}

impl FileMetadata {
    /// Location of the sidecar for a given artifact
    pub fn sidecar_path(artifact: impl AsRef<Path>) -> PathBuf {
        let mut path = artifact.as_ref().as_os_str().to_owned();
        path.push(".json");
        PathBuf::from(path)
    }

    /// Read the sidecar belonging to `artifact`
    pub fn read_for(artifact: impl AsRef<Path>) -> Result<Self> {
        let sidecar = Self::sidecar_path(&artifact);
        let raw = std::fs::read(&sidecar).map_err(|e| CommonError::MetadataUnavailable {
            path: sidecar.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&raw).map_err(|e| CommonError::MetadataUnavailable {
            path: sidecar,
            reason: e.to_string(),
        })
    }

    /// Write the sidecar belonging to `artifact`
    pub fn write_for(&self, artifact: impl AsRef<Path>) -> Result<PathBuf> {
        let sidecar = Self::sidecar_path(artifact);
        std::fs::write(&sidecar, serde_json::to_vec_pretty(self)?)?;
        Ok(sidecar)
    }

    /// Space-joined parameter list as it appears in the index
    pub fn parameter_list(&self) -> String {
        self.parameters.join(" ")
    }
}
