//! Wires the content-addressed store, commit engine, and fence manager
//! together into a single node. Illustrative: nothing prevents embedding
//! [`weft_kvs_store`] and [`weft_kvs`] directly without this layer.

use std::rc::Rc;

use weft_base::{fatal, Config, Result};
use weft_kvs::{Manager, Op, ProcessResult};
use weft_kvs_store::{Blobref, Cache, ContentStore, MemContentStore, TreeObject};

/// One replica's local state: a content store, the cache fronting it, and
/// the fence/commit machinery driving writes against a single root.
pub struct Node {
    config: Config,
    cache: Cache,
    manager: Manager,
}

impl Node {
    /// Starts a node with an empty tree over `store`.
    pub fn new(config: Config, store: Rc<dyn ContentStore>) -> Result<Node> {
        let cache = Cache::new(store);
        let empty_root = TreeObject::Dir(Default::default());
        let bytes = serde_json::to_vec(&empty_root.to_json())?;
        let root_ref = Blobref::of(&bytes);
        cache.insert(root_ref.clone(), bytes)?;
        let manager = Manager::new(root_ref, config.symlink_hop_limit);
        Ok(Node { config, cache, manager })
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn manager(&mut self) -> &mut Manager {
        &mut self.manager
    }

    pub fn current_root(&self) -> &Blobref {
        self.manager.current_root()
    }

    /// Submits `ops` as a single-participant fence under `name` and drives
    /// the resulting commit through to FINISHED, flushing dirty entries as
    /// they come due. On success, the node's current root advances.
    pub fn commit(&mut self, name: &str, ops: Vec<Op>) -> Result<Blobref> {
        self.manager.add_fence(name, 1)?;
        self.manager.process_fence_request(name, ops)?;
        self.manager.merge_ready_commits();
        let mut commit = self.manager.remove_commit().expect("single-participant fence is immediately ready");

        let root = loop {
            match commit.process(&self.cache, self.config.inline_value_threshold)? {
                ProcessResult::Finished => break commit.newroot().expect("FINISHED implies newroot").clone(),
                ProcessResult::DirtyCacheEntries => {
                    for entry in commit.dirty_entries()?.to_vec() {
                        self.cache.flush(&entry)?;
                    }
                }
                ProcessResult::LoadMissingRefs => {
                    return Err(fatal(format!(
                        "commit {name:?} references content this node's store does not have: {:?}",
                        commit.missing_refs()?
                    )));
                }
                ProcessResult::Error => return Err(fatal(format!("commit {name:?} aborted"))),
            }
        };
        self.manager.record_noop_stores(&commit);
        self.manager.set_current_root(root.clone());
        Ok(root)
    }
}

/// Convenience constructor for a node with an in-memory content store,
/// used by tests and the demonstration binary.
pub fn in_memory_node(config: Config) -> Result<Node> {
    Node::new(config, Rc::new(MemContentStore::new()))
}

/// Installs a `tracing` subscriber at the level implied by
/// `config.debug_level`.
pub fn init_tracing(config: &Config) {
    let _ = tracing_subscriber::fmt().with_max_level(config.trace_level()).try_init();
}

#[cfg(test)]
mod test {
    use super::*;
    use weft_kvs_store::TreeObject;

    #[test]
    fn commit_advances_the_current_root() {
        let mut node = in_memory_node(Config::default()).unwrap();
        let before = node.current_root().clone();
        let after = node.commit("c1", vec![Op::write("a.b", TreeObject::Val(b"hi".to_vec()))]).unwrap();
        assert_ne!(before, after);
        assert_eq!(node.current_root(), &after);
    }

    #[test]
    fn sequential_commits_chain_off_each_other() {
        let mut node = in_memory_node(Config::default()).unwrap();
        node.commit("c1", vec![Op::write("a", TreeObject::Val(b"1".to_vec()))]).unwrap();
        let root2 = node.commit("c2", vec![Op::write("b", TreeObject::Val(b"2".to_vec()))]).unwrap();

        let entry = node.cache().lookup(&root2, node.cache().tick());
        let TreeObject::Dir(map) = TreeObject::try_decode(&entry.bytes().unwrap()).unwrap() else { panic!() };
        assert_eq!(map.get("a"), Some(&TreeObject::Val(b"1".to_vec())));
        assert_eq!(map.get("b"), Some(&TreeObject::Val(b"2".to_vec())));
    }
}
