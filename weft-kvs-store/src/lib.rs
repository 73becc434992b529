//! Content-addressed cache entries and cache, tree objects, and the
//! content store contract. See spec §4.5 "Tree Objects", §4.6 "Cache", §6
//! "Cache content store".

mod blobref;
mod cache;
mod cacheentry;
mod contentstore;
mod treeobject;

pub use blobref::{Algo, Blobref};
pub use cache::{Cache, CacheStats};
pub use cacheentry::CacheEntry;
pub use contentstore::{ContentStore, FileContentStore, MemContentStore};
pub use treeobject::TreeObject;
