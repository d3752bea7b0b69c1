use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use super::{check_region_name, write_atomic, ManifestStore};
use crate::error::{Error, Result};
use crate::manifest::Manifest;

/// One file per region: `{state_dir}/manifests/{region}.bin`
///
/// Each region is loaded and replaced independently so a failed save for
/// one region never touches another region's progress.
pub struct BitcodeManifestStore {
    dir: PathBuf,
}

impl BitcodeManifestStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, region: &str) -> Result<PathBuf> {
        check_region_name(region)?;
        Ok(self.dir.join(format!("{region}.bin")))
    }
}

impl ManifestStore for BitcodeManifestStore {
    fn load(&mut self, region: &str) -> Result<Manifest> {
        let path = self.path_for(region)?;
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(e) => {
                return Err(Error::Store(format!(
                    "failed to read manifest {}: {e}",
                    path.display()
                )))
            }
        };

        bitcode::deserialize(&data).map_err(|e| Error::CorruptState {
            what: "manifest",
            location: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn save(&mut self, region: &str, manifest: &Manifest) -> Result<()> {
        let path = self.path_for(region)?;
        let data = bitcode::serialize(manifest)
            .map_err(|e| Error::Store(format!("failed to serialize {region} manifest: {e}")))?;
        write_atomic(&path, &data)
    }
}
