//! Release archive extraction.

use std::fs::File;
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::debug;

use super::InstallError;

/// Unpack a `.tar.gz` into `dest`, keeping the archive's directory layout.
///
/// Entries that would land outside `dest` are skipped by `tar`.
pub fn extract_tarball(tarball: &Path, dest: &Path) -> Result<(), InstallError> {
    let file = File::open(tarball)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .unpack(dest)
        .map_err(|e| InstallError::Extract(e.to_string()))?;
    debug!(tarball = %tarball.display(), dest = %dest.display(), "Extracted archive");
    Ok(())
}
