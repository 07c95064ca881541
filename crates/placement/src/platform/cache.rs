//! Container cache interface
//!
//! The runtime shim owns the authoritative container store; the policy
//! reaches it through these traits to pin containers and to persist its
//! own state through the cache's blob API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};

/// A container as seen by the cache. Setters stage cgroup changes that
/// the shim pushes to the runtime; they fail when the OS rejects the
/// write, which the policy logs without rolling back the grant.
pub trait Container {
    fn id(&self) -> String;

    /// `namespace/pod:container`
    fn pretty_name(&self) -> String;

    fn namespace(&self) -> String;

    /// Effective pod + container annotation lookup.
    fn annotation(&self, key: &str) -> Option<String>;

    fn millicpu_request(&self) -> i64;

    fn get_cpuset_cpus(&self) -> String;

    fn get_cpuset_mems(&self) -> String;

    fn set_cpuset_cpus(&self, cpus: &str) -> Result<()>;

    fn set_cpuset_mems(&self, mems: &str) -> Result<()>;

    fn set_cpu_shares(&self, shares: u64) -> Result<()>;
}

/// The cache the policy consumes: container lookup plus an opaque blob
/// store for the allocations snapshot.
pub trait Cache {
    fn lookup_container(&self, id: &str) -> Option<Arc<dyn Container>>;

    fn set_blob(&self, key: &str, data: &[u8]) -> Result<()>;

    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// File-backed blob store. Writes are atomic (temp file plus rename),
/// so a crash mid-write can never produce a loadable half-snapshot.
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn set_blob(&self, key: &str, data: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        utils::fs::atomic_write(&self.dir.join(key), data)
    }

    pub fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.dir.join(key);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        assert!(store.get_blob("allocations").unwrap().is_none());
        store.set_blob("allocations", b"{}").unwrap();
        assert_eq!(store.get_blob("allocations").unwrap().unwrap(), b"{}");

        store.set_blob("allocations", b"{\"c0\":1}").unwrap();
        assert_eq!(
            store.get_blob("allocations").unwrap().unwrap(),
            b"{\"c0\":1}"
        );
    }
}
