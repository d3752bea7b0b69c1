use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use super::{ObjectEntry, ObjectStore};
use crate::error::TransportError;

/// Buckets mirrored onto the local filesystem, e.g. with `aws s3 sync`.
///
/// Object keys are paths relative to the bucket root with `/` separators;
/// the etag is derived from size and mtime.
pub struct LocalObjectStore {
    buckets: BTreeMap<String, PathBuf>,
}

impl LocalObjectStore {
    pub fn new(buckets: BTreeMap<String, PathBuf>) -> Self {
        Self { buckets }
    }

    fn bucket_root(&self, region: &str) -> Result<&Path, TransportError> {
        self.buckets
            .get(region)
            .map(PathBuf::as_path)
            .ok_or_else(|| TransportError::permanent("resolve bucket", format!("no bucket configured for {region}")))
    }
}

fn etag_for(meta: &std::fs::Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{}-{mtime}", meta.len())
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

impl ObjectStore for LocalObjectStore {
    fn list(&self, region: &str, prefix: &str) -> Result<Vec<ObjectEntry>, TransportError> {
        let root = self.bucket_root(region)?;
        if !root.is_dir() {
            return Err(TransportError::permanent(
                "list",
                format!("bucket root {} does not exist", root.display()),
            ));
        }

        // Scan prefixes end with '/', so they name a directory under the root.
        let dir = root.join(prefix.trim_end_matches('/'));
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let op = format!("list {}", dir.display());
                match e.io_error() {
                    Some(io) => TransportError::from_io(op, io),
                    None => TransportError::permanent(op, e.to_string()),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = relative_key(root, entry.path()) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| TransportError::transient(format!("stat {key}"), e.to_string()))?;
            objects.push(ObjectEntry {
                key,
                etag: etag_for(&meta),
            });
        }
        Ok(objects)
    }

    fn fetch(&self, region: &str, key: &str) -> Result<Vec<u8>, TransportError> {
        let root = self.bucket_root(region)?;
        if key.split('/').any(|seg| seg == "..") {
            return Err(TransportError::permanent(
                format!("fetch {key}"),
                "key escapes bucket root",
            ));
        }
        std::fs::read(root.join(key)).map_err(|e| TransportError::from_io(format!("fetch {key}"), &e))
    }
}
