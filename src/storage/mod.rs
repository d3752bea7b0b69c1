#[cfg(not(feature = "sqlite"))]
pub mod bitcode_store;
pub mod snapshot_store;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};
use crate::manifest::Manifest;

/// Durable per-region manifest persistence.
///
/// `save` replaces the whole record at once: a crash mid-write must leave
/// the previous manifest intact, never a half-written one.
pub trait ManifestStore {
    /// Load a region's manifest. A region never saved before yields an empty manifest.
    fn load(&mut self, region: &str) -> Result<Manifest>;

    /// Atomically replace a region's manifest.
    fn save(&mut self, region: &str, manifest: &Manifest) -> Result<()>;
}

pub fn default_manifest_store(state_dir: &Path) -> Result<Box<dyn ManifestStore>> {
    #[cfg(feature = "sqlite")]
    {
        Ok(Box::new(sqlite_store::SqliteManifestStore::open(
            &state_dir.join("manifests.db"),
        )?))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        Ok(Box::new(bitcode_store::BitcodeManifestStore::new(
            state_dir.join("manifests"),
        )))
    }
}

/// Region codes become file names and row keys; keep them to a safe alphabet.
pub(crate) fn check_region_name(region: &str) -> Result<()> {
    let valid = !region.is_empty()
        && region
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid region name {region:?}")))
    }
}

/// Write to a sibling temp file, fsync, then rename over the target.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let store_err = |what: &str, e: std::io::Error| {
        Error::Store(format!("failed to {what} {}: {e}", path.display()))
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| store_err("create parent of", e))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);

    let mut file = fs::File::create(tmp).map_err(|e| store_err("create temp file for", e))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|e| store_err("write temp file for", e))?;
    drop(file);

    fs::rename(tmp, path).map_err(|e| store_err("replace", e))
}
