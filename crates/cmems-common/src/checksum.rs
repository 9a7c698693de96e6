//! MD5 checksum utilities for delivered artifacts
//!
//! The ingestion service verifies every delivered file against the MD5 listed
//! in the delivery note, so MD5 is the content hash stored in the catalog.

use crate::error::Result;
use std::io::Read;
use std::path::Path;

/// Compute the lowercase hex MD5 of a byte slice
pub fn compute_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Compute the MD5 of any readable source without buffering it whole
pub fn compute_md5_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut context = md5::Context::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        context.consume(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", context.compute()))
}

/// Compute the MD5 of a file on disk
pub fn compute_file_md5(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_md5_reader(&mut file)
}
