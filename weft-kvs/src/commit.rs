//! The commit engine: INIT -> LOAD_ROOT -> APPLY_OPS -> STORE ->
//! PRE_FINISHED -> FINISHED (spec §4.6 "Commit Engine").

use std::collections::BTreeMap;

use weft_base::{err, fatal, invalid, ErrorKind, Result};
use weft_kvs_store::{Blobref, Cache, CacheEntry, TreeObject};

use crate::op::{normalize_key, require_non_root, split_target, Op, OpFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    LoadRoot,
    ApplyOps,
    Store,
    PreFinished,
    Finished,
    Error,
}

/// What [`Commit::process`] needs from the caller before it can continue,
/// mirroring cobo's own stalling protocol (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// The commit reached FINISHED; `newroot()` is now populated.
    Finished,
    /// Blocked on cache entries that are not yet valid. The caller must
    /// load them into the cache (e.g. via [`Cache::lookup`]) and call
    /// `process` again.
    LoadMissingRefs,
    /// STORE completed; the caller must flush each of `dirty_entries()` to
    /// the content store (clearing their dirty bit) and call `process`
    /// again.
    DirtyCacheEntries,
    /// The commit aborted; see `errnum()`.
    Error,
}

/// One atomic batch of ops against a tree rooted at a blobref, driven to
/// completion by repeated calls to [`Commit::process`].
pub struct Commit {
    name: String,
    root_ref: Blobref,
    rootcpy: Option<TreeObject>,
    ops: Vec<Op>,
    applied: Vec<bool>,
    state: State,
    last_result: Option<ProcessResult>,
    missing_refs: Vec<Blobref>,
    dirty_entries: Vec<CacheEntry>,
    newroot: Option<Blobref>,
    errnum: Option<ErrorKind>,
    no_merge: bool,
    noop_stores: u64,
    hop_limit: u32,
}

impl Commit {
    pub fn new(name: impl Into<String>, root_ref: Blobref, ops: Vec<Op>, hop_limit: u32) -> Commit {
        let no_merge = ops.iter().any(|o| o.flags.contains(OpFlags::NO_MERGE));
        let applied = vec![false; ops.len()];
        Commit {
            name: name.into(),
            root_ref,
            rootcpy: None,
            ops,
            applied,
            state: State::Init,
            last_result: None,
            missing_refs: Vec::new(),
            dirty_entries: Vec::new(),
            newroot: None,
            errnum: None,
            no_merge,
            noop_stores: 0,
            hop_limit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn newroot(&self) -> Option<&Blobref> {
        self.newroot.as_ref()
    }

    pub fn errnum(&self) -> Option<ErrorKind> {
        self.errnum
    }

    pub fn noop_stores(&self) -> u64 {
        self.noop_stores
    }

    /// Whether this commit and `other` may be combined into one (spec
    /// §4.6 "Merging"): neither carries `NO_MERGE`, and both are still
    /// before STORE.
    pub fn is_mergeable_with(&self, other: &Commit) -> bool {
        !self.no_merge
            && !other.no_merge
            && matches!(self.state, State::Init | State::LoadRoot | State::ApplyOps)
            && matches!(other.state, State::Init | State::LoadRoot | State::ApplyOps)
    }

    /// Appends `other`'s ops onto this commit, in queue order. Caller must
    /// have checked [`Commit::is_mergeable_with`] first.
    pub fn absorb(&mut self, other: Commit) {
        self.name = format!("{}+{}", self.name, other.name);
        self.ops.extend(other.ops);
        self.applied.extend(other.applied);
    }

    pub fn missing_refs(&self) -> Result<&[Blobref]> {
        if self.last_result != Some(ProcessResult::LoadMissingRefs) {
            return Err(invalid("missing_refs() is only valid after process() returns LOAD_MISSING_REFS"));
        }
        Ok(&self.missing_refs)
    }

    pub fn dirty_entries(&self) -> Result<&[CacheEntry]> {
        if self.last_result != Some(ProcessResult::DirtyCacheEntries) {
            return Err(invalid("dirty_entries() is only valid after process() returns DIRTY_CACHE_ENTRIES"));
        }
        Ok(&self.dirty_entries)
    }

    /// Drives the state machine as far as it can go without blocking.
    pub fn process(&mut self, cache: &Cache, inline_threshold: usize) -> Result<ProcessResult> {
        if self.state == State::Finished {
            self.last_result = Some(ProcessResult::Finished);
            return Ok(ProcessResult::Finished);
        }
        if self.state == State::Error {
            return Err(fatal("process() called again on a commit that already errored"));
        }
        let result = self.process_inner(cache, inline_threshold);
        match result {
            Ok(r) => {
                self.last_result = Some(r);
                Ok(r)
            }
            Err(e) => {
                self.abort(cache);
                self.errnum = Some(e.kind());
                self.state = State::Error;
                self.last_result = Some(ProcessResult::Error);
                Err(e)
            }
        }
    }

    fn process_inner(&mut self, cache: &Cache, inline_threshold: usize) -> Result<ProcessResult> {
        loop {
            match self.state {
                State::Init => self.state = State::LoadRoot,
                State::LoadRoot => {
                    let entry = cache.lookup(&self.root_ref, cache.tick());
                    if !entry.is_valid() {
                        self.missing_refs = vec![self.root_ref.clone()];
                        return Ok(ProcessResult::LoadMissingRefs);
                    }
                    let bytes = entry.bytes().expect("valid entry has bytes");
                    let decoded = TreeObject::try_decode(&bytes).unwrap_or(TreeObject::Val(bytes));
                    self.rootcpy = Some(decoded);
                    self.state = State::ApplyOps;
                }
                State::ApplyOps => {
                    self.missing_refs.clear();
                    let mut all_applied = true;
                    for i in 0..self.ops.len() {
                        if self.applied[i] {
                            continue;
                        }
                        if self.apply_one_op(i, cache)? {
                            self.applied[i] = true;
                        } else {
                            all_applied = false;
                        }
                    }
                    if !all_applied {
                        return Ok(ProcessResult::LoadMissingRefs);
                    }
                    self.state = State::Store;
                }
                State::Store => {
                    let mut root = self.rootcpy.take().expect("rootcpy is populated once ApplyOps finishes");
                    store_tree(&mut root, cache, self, inline_threshold)?;
                    let TreeObject::DirRef(blobref) = root else {
                        return Err(fatal("commit root did not reduce to a DIRREF after STORE"));
                    };
                    self.newroot = Some(blobref);
                    self.state = State::PreFinished;
                }
                State::PreFinished => {
                    if self.dirty_entries.iter().all(|e| !e.is_dirty()) {
                        self.dirty_entries.clear();
                        self.state = State::Finished;
                    } else {
                        return Ok(ProcessResult::DirtyCacheEntries);
                    }
                }
                State::Finished => return Ok(ProcessResult::Finished),
                State::Error => unreachable!("Error is handled by the caller before process_inner runs"),
            }
        }
    }

    /// Stores `bytes` as a new cache entry dirty-owned by this commit,
    /// unless it's already present and valid (a "noop store": the content
    /// is already durable, so there's nothing new to flush).
    fn store_object(&mut self, cache: &Cache, bytes: Vec<u8>) -> Result<Blobref> {
        let blobref = Blobref::of(&bytes);
        if let Some(existing) = cache.peek(&blobref) {
            if existing.is_valid() {
                self.noop_stores += 1;
                return Ok(blobref);
            }
        }
        let entry = cache.insert(blobref.clone(), bytes)?;
        entry.set_dirty()?;
        self.dirty_entries.push(entry);
        Ok(blobref)
    }

    /// Re-attempts op `index` from scratch. Already-applied ops are
    /// skipped by the caller; this may be re-entered after a stall once
    /// the missing refs it reported have become valid.
    fn apply_one_op(&mut self, index: usize, cache: &Cache) -> Result<bool> {
        let op = self.ops[index].clone();
        let mut components = normalize_key(&op.key);
        require_non_root(&components)?;

        let mut hops = 0u32;
        loop {
            hops += 1;
            if hops > self.hop_limit {
                return Err(fatal("symlink hop limit exceeded while resolving a commit op's path"));
            }
            let is_write = op.value.is_some();
            let root = self.rootcpy.as_mut().expect("rootcpy is populated before ApplyOps runs");
            match descend(root, &components, is_write, cache, &mut self.missing_refs)? {
                Descend::Stalled => return Ok(false),
                Descend::Redirect(next) => {
                    components = next;
                    continue;
                }
                Descend::NoSuchDirForDelete => return Ok(true),
                Descend::At(parent, last) => {
                    apply_leaf(parent, &last, op.value.clone(), op.flags.contains(OpFlags::APPEND), cache, self)?;
                    return Ok(true);
                }
            }
        }
    }

    /// On error, drop every still-dirty entry this commit had staged and
    /// discard its working tree. Entries already handed off and flushed
    /// by the caller are left alone.
    fn abort(&mut self, cache: &Cache) {
        for entry in self.dirty_entries.drain(..) {
            let _ = entry.clear_dirty();
            let _ = cache.remove(&entry.blobref());
        }
        self.rootcpy = None;
    }
}

enum Descend<'a> {
    At(&'a mut BTreeMap<String, TreeObject>, String),
    Stalled,
    Redirect(Vec<String>),
    NoSuchDirForDelete,
}

/// Walks `components[..len-1]` from `node`, resolving DIRREFs (loading
/// from `cache`, recording misses) and following SYMLINKs (handing back a
/// redirected path for the caller to restart from the root), auto-creating
/// missing intermediate directories when `is_write`. Returns the map that
/// should hold the final component, paired with that component's name.
fn descend<'a>(
    mut node: &'a mut TreeObject,
    components: &[String],
    is_write: bool,
    cache: &Cache,
    missing: &mut Vec<Blobref>,
) -> Result<Descend<'a>> {
    let (dirs, last) = components.split_at(components.len() - 1);
    let last = last[0].clone();

    for (i, comp) in dirs.iter().enumerate() {
        match deref_to_dir(node, cache, missing, &components[i..])? {
            DerefOutcome::Redirect(next) => return Ok(Descend::Redirect(next)),
            DerefOutcome::Stalled => return Ok(Descend::Stalled),
            DerefOutcome::Dir => {}
        }
        let TreeObject::Dir(map) = node else { unreachable!("deref_to_dir guarantees Dir") };
        if !map.contains_key(comp) {
            if is_write {
                map.insert(comp.clone(), TreeObject::Dir(BTreeMap::new()));
            } else {
                return Ok(Descend::NoSuchDirForDelete);
            }
        }
        node = map.get_mut(comp).expect("just inserted or already present");
    }

    match deref_to_dir(node, cache, missing, &components[dirs.len()..])? {
        DerefOutcome::Redirect(next) => return Ok(Descend::Redirect(next)),
        DerefOutcome::Stalled => return Ok(Descend::Stalled),
        DerefOutcome::Dir => {}
    }
    let TreeObject::Dir(map) = node else { unreachable!("deref_to_dir guarantees Dir") };
    Ok(Descend::At(map, last))
}

enum DerefOutcome {
    Dir,
    Stalled,
    Redirect(Vec<String>),
}

/// Ensures `*node` behaves as a directory in place, dereferencing a
/// DIRREF (loading it from the cache) or reporting a SYMLINK redirect.
/// `remainder` is the not-yet-consumed tail of the path starting at
/// `node`'s own component, so a redirect can splice the symlink's target
/// onto `remainder[1..]`.
fn deref_to_dir(node: &mut TreeObject, cache: &Cache, missing: &mut Vec<Blobref>, remainder: &[String]) -> Result<DerefOutcome> {
    loop {
        match node {
            TreeObject::Dir(_) => return Ok(DerefOutcome::Dir),
            TreeObject::DirRef(r) => {
                let r = r.clone();
                let entry = cache.lookup(&r, cache.tick());
                if !entry.is_valid() {
                    missing.push(r);
                    return Ok(DerefOutcome::Stalled);
                }
                let bytes = entry.bytes().expect("valid entry has bytes");
                let decoded = TreeObject::try_decode(&bytes).unwrap_or(TreeObject::Val(bytes));
                *node = decoded;
            }
            TreeObject::Symlink(target) => {
                let mut redirected = split_target(target);
                redirected.extend_from_slice(&remainder[1..]);
                return Ok(DerefOutcome::Redirect(redirected));
            }
            TreeObject::Val(_) | TreeObject::ValRef(_) => {
                return Err(invalid(format!(
                    "key path component {:?} traverses through a non-directory value",
                    remainder[0]
                )));
            }
        }
    }
}

/// Applies a resolved write/delete/append at `parent[last]`.
fn apply_leaf(
    parent: &mut BTreeMap<String, TreeObject>,
    last: &str,
    value: Option<TreeObject>,
    append: bool,
    cache: &Cache,
    commit: &mut Commit,
) -> Result<()> {
    let Some(value) = value else {
        parent.remove(last);
        return Ok(());
    };
    if !append {
        parent.insert(last.to_string(), value);
        return Ok(());
    }
    let TreeObject::Val(new_bytes) = &value else {
        return Err(invalid("APPEND value must be a VAL"));
    };
    match parent.get(last) {
        None => {
            parent.insert(last.to_string(), value);
        }
        Some(TreeObject::Val(old_bytes)) => {
            let old_ref = commit.store_object(cache, old_bytes.clone())?;
            let new_ref = commit.store_object(cache, new_bytes.clone())?;
            parent.insert(last.to_string(), TreeObject::ValRef(vec![old_ref, new_ref]));
        }
        Some(TreeObject::ValRef(existing)) => {
            let mut refs = existing.clone();
            refs.push(commit.store_object(cache, new_bytes.clone())?);
            parent.insert(last.to_string(), TreeObject::ValRef(refs));
        }
        Some(TreeObject::Symlink(_)) => {
            return Err(err(ErrorKind::Unsupported, "append onto a symlink is not supported"));
        }
        Some(TreeObject::Dir(_)) | Some(TreeObject::DirRef(_)) => {
            return Err(err(ErrorKind::IsDir, "append target is a directory"));
        }
    }
    Ok(())
}

/// Depth-first unroll: every inline DIR (including the root) is serialized
/// and replaced by a DIRREF; a VAL over `inline_threshold` bytes becomes a
/// one-element VALREF. Leaves already expressed as refs are untouched.
fn store_tree(node: &mut TreeObject, cache: &Cache, commit: &mut Commit, inline_threshold: usize) -> Result<()> {
    match node {
        TreeObject::Dir(map) => {
            for child in map.values_mut() {
                store_tree(child, cache, commit, inline_threshold)?;
            }
            let bytes = serde_json::to_vec(&node.to_json())?;
            let blobref = commit.store_object(cache, bytes)?;
            *node = TreeObject::DirRef(blobref);
        }
        TreeObject::Val(bytes) if bytes.len() > inline_threshold => {
            let blobref = commit.store_object(cache, bytes.clone())?;
            *node = TreeObject::ValRef(vec![blobref]);
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::rc::Rc;
    use weft_kvs_store::MemContentStore;

    fn seeded_cache(root: &TreeObject) -> (Cache, Blobref) {
        let cache = Cache::new(Rc::new(MemContentStore::new()));
        let bytes = serde_json::to_vec(&root.to_json()).unwrap();
        let blobref = Blobref::of(&bytes);
        cache.insert(blobref.clone(), bytes).unwrap();
        (cache, blobref)
    }

    #[test]
    fn plain_write_and_read_back() {
        let (cache, root) = seeded_cache(&TreeObject::Dir(BTreeMap::new()));
        let mut commit = Commit::new("c1", root, vec![Op::write("a.b", TreeObject::Val(b"x".to_vec()))], 40);
        loop {
            match commit.process(&cache, 256).unwrap() {
                ProcessResult::Finished => break,
                ProcessResult::DirtyCacheEntries => {
                    for e in commit.dirty_entries().unwrap().to_vec() {
                        cache.flush(&e).unwrap();
                    }
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        let newroot = commit.newroot().unwrap().clone();
        let entry = cache.lookup(&newroot, cache.tick());
        let TreeObject::Dir(map) = TreeObject::try_decode(&entry.bytes().unwrap()).unwrap() else { panic!() };
        let TreeObject::Dir(inner) = map.get("a").unwrap() else { panic!() };
        assert_eq!(inner.get("b"), Some(&TreeObject::Val(b"x".to_vec())));
    }

    #[test]
    fn append_onto_existing_val_produces_ordered_valref() {
        let mut top = BTreeMap::new();
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), TreeObject::Val(b"first".to_vec()));
        top.insert("a".to_string(), TreeObject::Dir(a));
        let (cache, root) = seeded_cache(&TreeObject::Dir(top));

        let mut commit = Commit::new("c1", root, vec![Op::append("a.b", TreeObject::Val(b"second".to_vec()))], 40);
        loop {
            match commit.process(&cache, 4096).unwrap() {
                ProcessResult::Finished => break,
                ProcessResult::DirtyCacheEntries => {
                    for e in commit.dirty_entries().unwrap().to_vec() {
                        cache.flush(&e).unwrap();
                    }
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        let newroot = commit.newroot().unwrap().clone();
        let entry = cache.lookup(&newroot, cache.tick());
        let TreeObject::Dir(map) = TreeObject::try_decode(&entry.bytes().unwrap()).unwrap() else { panic!() };
        let TreeObject::Dir(inner) = map.get("a").unwrap() else { panic!() };
        let TreeObject::ValRef(refs) = inner.get("b").unwrap() else { panic!("expected VALREF") };
        assert_eq!(refs.len(), 2);
        assert_eq!(cache.lookup(&refs[0], cache.tick()).bytes().unwrap(), b"first");
        assert_eq!(cache.lookup(&refs[1], cache.tick()).bytes().unwrap(), b"second");
    }

    #[test]
    fn delete_of_nonexistent_key_is_a_silent_noop() {
        let (cache, root) = seeded_cache(&TreeObject::Dir(BTreeMap::new()));
        let mut commit = Commit::new("c1", root.clone(), vec![Op::delete("nope.nothing")], 40);
        loop {
            match commit.process(&cache, 256).unwrap() {
                ProcessResult::Finished => break,
                ProcessResult::DirtyCacheEntries => {
                    for e in commit.dirty_entries().unwrap().to_vec() {
                        cache.flush(&e).unwrap();
                    }
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(commit.newroot().unwrap(), &root);
    }

    #[test]
    fn missing_root_stalls_with_load_missing_refs() {
        let cache = Cache::new(Rc::new(MemContentStore::new()));
        let absent = Blobref::of(b"never inserted");
        let mut commit = Commit::new("c1", absent.clone(), vec![Op::write("a", TreeObject::Val(b"x".to_vec()))], 40);
        let result = commit.process(&cache, 256).unwrap();
        assert_eq!(result, ProcessResult::LoadMissingRefs);
        assert_eq!(commit.missing_refs().unwrap(), &[absent]);
    }

    #[test]
    fn writing_the_root_itself_is_rejected() {
        let (cache, root) = seeded_cache(&TreeObject::Dir(BTreeMap::new()));
        let mut commit = Commit::new("c1", root, vec![Op::write(".", TreeObject::Val(b"x".to_vec()))], 40);
        assert!(commit.process(&cache, 256).is_err());
    }

    #[test]
    fn symlink_is_followed_by_prefixing_its_target() {
        let mut top = BTreeMap::new();
        top.insert("link".to_string(), TreeObject::Symlink("real".to_string()));
        let mut real = BTreeMap::new();
        real.insert("leaf".to_string(), TreeObject::Val(b"seed".to_vec()));
        top.insert("real".to_string(), TreeObject::Dir(real));
        let (cache, root) = seeded_cache(&TreeObject::Dir(top));

        let mut commit = Commit::new("c1", root, vec![Op::write("link.leaf", TreeObject::Val(b"via-link".to_vec()))], 40);
        loop {
            match commit.process(&cache, 4096).unwrap() {
                ProcessResult::Finished => break,
                ProcessResult::DirtyCacheEntries => {
                    for e in commit.dirty_entries().unwrap().to_vec() {
                        cache.flush(&e).unwrap();
                    }
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        let newroot = commit.newroot().unwrap().clone();
        let entry = cache.lookup(&newroot, cache.tick());
        let TreeObject::Dir(map) = TreeObject::try_decode(&entry.bytes().unwrap()).unwrap() else { panic!() };
        let TreeObject::Dir(real) = map.get("real").unwrap() else { panic!() };
        assert_eq!(real.get("leaf"), Some(&TreeObject::Val(b"via-link".to_vec())));
    }
}
