//! The content-addressed store contract the core is given (spec §6 "Cache
//! content store"): `put`/`get` by blobref, idempotent, with no durability
//! guarantee beyond "ack implies visible to subsequent get on this node."

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;

use weft_base::{not_found, Result};

use crate::blobref::Blobref;

/// External content-addressed store contract. Implementations may back
/// this with a filesystem, a database, or (for tests) memory; the core
/// never assumes anything about durability beyond what's documented here.
pub trait ContentStore {
    /// Stores `bytes` under `blobref`. Idempotent: storing the same
    /// blobref twice is a no-op success.
    fn put(&self, blobref: &Blobref, bytes: Vec<u8>) -> Result<()>;

    /// Fetches the bytes stored under `blobref`, or a `NOT_FOUND` error.
    fn get(&self, blobref: &Blobref) -> Result<Vec<u8>>;

    fn contains(&self, blobref: &Blobref) -> bool;
}

/// An in-memory content store, for tests and single-process use.
#[derive(Default)]
pub struct MemContentStore {
    blobs: RefCell<HashMap<Blobref, Vec<u8>>>,
}

impl MemContentStore {
    pub fn new() -> MemContentStore {
        MemContentStore::default()
    }
}

impl ContentStore for MemContentStore {
    fn put(&self, blobref: &Blobref, bytes: Vec<u8>) -> Result<()> {
        self.blobs.borrow_mut().entry(blobref.clone()).or_insert(bytes);
        Ok(())
    }

    fn get(&self, blobref: &Blobref) -> Result<Vec<u8>> {
        self.blobs
            .borrow()
            .get(blobref)
            .cloned()
            .ok_or_else(|| not_found(format!("no content for {blobref}")))
    }

    fn contains(&self, blobref: &Blobref) -> bool {
        self.blobs.borrow().contains_key(blobref)
    }
}

/// A content store backed by one file per blobref under `root`. Every
/// blobref's hex digest is already filesystem-safe, so it doubles as the
/// filename.
pub struct FileContentStore {
    root: PathBuf,
}

impl FileContentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<FileContentStore> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(FileContentStore { root })
    }

    fn path_for(&self, blobref: &Blobref) -> PathBuf {
        self.root.join(blobref.as_str())
    }
}

impl ContentStore for FileContentStore {
    fn put(&self, blobref: &Blobref, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(blobref);
        if path.exists() {
            return Ok(());
        }
        // Write to a temp path and rename, so a concurrent reader never
        // observes a partially-written blob.
        let tmp = self.root.join(format!("{}.tmp-{}", blobref.as_str(), std::process::id()));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, blobref: &Blobref) -> Result<Vec<u8>> {
        std::fs::read(self.path_for(blobref)).map_err(|_| not_found(format!("no content for {blobref}")))
    }

    fn contains(&self, blobref: &Blobref) -> bool {
        self.path_for(blobref).exists()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = MemContentStore::new();
        let r = Blobref::of(b"hello");
        store.put(&r, b"hello".to_vec()).unwrap();
        assert_eq!(store.get(&r).unwrap(), b"hello");
    }

    #[test]
    fn duplicate_put_is_a_noop_success() {
        let store = MemContentStore::new();
        let r = Blobref::of(b"hello");
        store.put(&r, b"hello".to_vec()).unwrap();
        store.put(&r, b"hello".to_vec()).unwrap();
        assert_eq!(store.get(&r).unwrap(), b"hello");
    }

    #[test]
    fn missing_blob_is_not_found() {
        let store = MemContentStore::new();
        let r = Blobref::of(b"never stored");
        assert!(store.get(&r).is_err());
        assert!(!store.contains(&r));
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("weft-kvs-store-test-{tag}-{}", std::process::id()))
    }

    #[test]
    fn file_store_round_trips_and_is_idempotent() {
        let dir = scratch_dir("roundtrip");
        let store = FileContentStore::open(&dir).unwrap();
        let r = Blobref::of(b"on disk");
        store.put(&r, b"on disk".to_vec()).unwrap();
        store.put(&r, b"on disk".to_vec()).unwrap();
        assert_eq!(store.get(&r).unwrap(), b"on disk");
        assert!(store.contains(&r));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn file_store_missing_blob_is_not_found() {
        let dir = scratch_dir("missing");
        let store = FileContentStore::open(&dir).unwrap();
        let r = Blobref::of(b"never stored on disk");
        assert!(store.get(&r).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
