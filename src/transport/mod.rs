pub mod dump;
pub mod local;
pub mod s3;
pub mod sigv4;
#[cfg(test)]
pub mod memory;

use crate::error::TransportError;

/// One object as returned by a listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    /// Changes whenever the object's content changes.
    pub etag: String,
}

/// Prefix-scoped object listing and fetching, one bucket per region.
///
/// Implementations must be callable from several threads at once: objects
/// of a region are fetched in parallel.
pub trait ObjectStore: Sync {
    fn list(&self, region: &str, prefix: &str) -> Result<Vec<ObjectEntry>, TransportError>;
    fn fetch(&self, region: &str, key: &str) -> Result<Vec<u8>, TransportError>;
}
