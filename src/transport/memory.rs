use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use super::{ObjectEntry, ObjectStore};
use crate::error::TransportError;

/// In-memory buckets for tests. Can be told to fail the next N calls transiently.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    transient_failures: AtomicU32,
    fetches: AtomicU32,
}

impl MemoryObjectStore {
    pub fn put(&self, region: &str, key: &str, body: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap()
            .insert((region.to_string(), key.to_string()), body.into());
    }

    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self, op: &str) -> Result<(), TransportError> {
        let took = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(TransportError::transient(op, "injected failure")),
            Err(_) => Ok(()),
        }
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list(&self, region: &str, prefix: &str) -> Result<Vec<ObjectEntry>, TransportError> {
        self.maybe_fail("list")?;
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((r, k), _)| r == region && k.starts_with(prefix))
            .map(|((_, k), body)| ObjectEntry {
                key: k.clone(),
                etag: format!("{}", body.len()),
            })
            .collect())
    }

    fn fetch(&self, region: &str, key: &str) -> Result<Vec<u8>, TransportError> {
        self.maybe_fail("fetch")?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .get(&(region.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| TransportError::permanent(format!("fetch {key}"), "no such key"))
    }
}
