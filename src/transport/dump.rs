use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{ObjectEntry, ObjectStore};
use crate::error::TransportError;
use crate::parser::decompress;

/// Passes every call through and writes each fetched object, decompressed,
/// to `<dir>/<region>/<key>` for offline inspection.
pub struct DumpingObjectStore<'a> {
    inner: &'a dyn ObjectStore,
    dir: PathBuf,
}

impl<'a> DumpingObjectStore<'a> {
    pub fn new(inner: &'a dyn ObjectStore, dir: PathBuf) -> Self {
        Self { inner, dir }
    }

    fn dump(&self, region: &str, key: &str, bytes: &[u8]) {
        let path = dump_path(&self.dir, region, key);
        let result = decompress(key, bytes)
            .map_err(|e| e.to_string())
            .and_then(|body| {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                fs::write(&path, body).map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to dump raw object");
        }
    }
}

/// `.gz` is dropped and extensionless keys get `.json`. Empty, `.` and `..`
/// segments are skipped so a key can never leave `dir`.
fn dump_path(dir: &Path, region: &str, key: &str) -> PathBuf {
    let mut path = dir.join(region);
    for segment in key.split('/').filter(|s| !matches!(*s, "" | "." | "..")) {
        path.push(segment);
    }
    if path.extension().is_some_and(|e| e == "gz") {
        path.set_extension("");
    }
    if path.extension().is_none() {
        path.set_extension("json");
    }
    path
}

impl ObjectStore for DumpingObjectStore<'_> {
    fn list(&self, region: &str, prefix: &str) -> Result<Vec<ObjectEntry>, TransportError> {
        self.inner.list(region, prefix)
    }

    fn fetch(&self, region: &str, key: &str) -> Result<Vec<u8>, TransportError> {
        let bytes = self.inner.fetch(region, key)?;
        self.dump(region, key, &bytes);
        Ok(bytes)
    }
}
