//! The fence/transaction manager: collects per-participant op batches
//! under a named fence, promotes a full fence to a ready [`Commit`], and
//! lets a driver pull ready commits off a FIFO queue, merging adjacent
//! compatible ones (spec §4.7 "Fence/Txn Manager").

use std::collections::{HashMap, VecDeque};

use weft_base::{err, not_found, ErrorKind, Result};
use weft_kvs_store::Blobref;

use crate::commit::Commit;
use crate::op::Op;

/// A named rendezvous point: `participants` batches of ops must arrive
/// before the fence is materialized into a commit.
pub struct Fence {
    name: String,
    participants: u32,
    batches: Vec<Vec<Op>>,
}

impl Fence {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn participants_expected(&self) -> u32 {
        self.participants
    }

    pub fn participants_arrived(&self) -> u32 {
        self.batches.len() as u32
    }
}

/// Drives fences to readiness and ready commits to completion. Holds the
/// single current root blobref that the next promoted fence's commit is
/// rooted at; the driver advances it via [`Manager::set_current_root`]
/// once a commit finishes.
pub struct Manager {
    fences: HashMap<String, Fence>,
    ready: VecDeque<Commit>,
    current_root: Blobref,
    hop_limit: u32,
    iterating: bool,
    pending_removals: Vec<String>,
    fences_created: u64,
    commits_promoted: u64,
    noop_stores_total: u64,
}

impl Manager {
    pub fn new(initial_root: Blobref, hop_limit: u32) -> Manager {
        Manager {
            fences: HashMap::new(),
            ready: VecDeque::new(),
            current_root: initial_root,
            hop_limit,
            iterating: false,
            pending_removals: Vec::new(),
            fences_created: 0,
            commits_promoted: 0,
            noop_stores_total: 0,
        }
    }

    pub fn current_root(&self) -> &Blobref {
        &self.current_root
    }

    pub fn set_current_root(&mut self, root: Blobref) {
        self.current_root = root;
    }

    pub fn fence_count(&self) -> usize {
        self.fences.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn fences_created(&self) -> u64 {
        self.fences_created
    }

    pub fn commits_promoted(&self) -> u64 {
        self.commits_promoted
    }

    pub fn noop_stores(&self) -> u64 {
        self.noop_stores_total
    }

    pub fn add_fence(&mut self, name: impl Into<String>, participants: u32) -> Result<()> {
        let name = name.into();
        if self.fences.contains_key(&name) {
            return Err(err(ErrorKind::Exists, format!("fence {name:?} already exists")));
        }
        self.fences.insert(name.clone(), Fence { name, participants, batches: Vec::new() });
        self.fences_created += 1;
        Ok(())
    }

    pub fn lookup_fence(&self, name: &str) -> Option<&Fence> {
        self.fences.get(name)
    }

    /// Removes a fence by name. If called from within [`Manager::iter_not_ready`],
    /// the removal is deferred until that iteration completes (spec §4.7:
    /// "deletions during iteration are queued and applied after").
    pub fn remove_fence(&mut self, name: &str) {
        if self.iterating {
            self.pending_removals.push(name.to_string());
        } else {
            self.fences.remove(name);
        }
    }

    /// Visits every fence that has not yet reached its participant count.
    pub fn iter_not_ready(&self, mut visit: impl FnMut(&Fence)) {
        for fence in self.fences.values() {
            if (fence.batches.len() as u32) < fence.participants {
                visit(fence);
            }
        }
    }

    /// Same as [`Manager::iter_not_ready`], but allows the visitor to call
    /// [`Manager::remove_fence`] on the manager passed back to it (the
    /// removal queues rather than invalidating the iteration in progress).
    pub fn iter_not_ready_mut(&mut self, mut visit: impl FnMut(&Fence, &mut Vec<String>)) {
        self.iterating = true;
        for fence in self.fences.values() {
            if (fence.batches.len() as u32) < fence.participants {
                visit(fence, &mut self.pending_removals);
            }
        }
        self.iterating = false;
        for name in self.pending_removals.drain(..) {
            self.fences.remove(&name);
        }
    }

    /// Adds one participant's `ops` to fence `name`. Once the expected
    /// number of participants has arrived, the fence's combined ops are
    /// materialized into a [`Commit`] rooted at the manager's current root
    /// and appended to the ready queue.
    pub fn process_fence_request(&mut self, name: &str, ops: Vec<Op>) -> Result<()> {
        let fence = self.fences.get_mut(name).ok_or_else(|| not_found(format!("no such fence {name:?}")))?;
        fence.batches.push(ops);
        if fence.batches.len() as u32 >= fence.participants {
            let fence = self.fences.remove(name).expect("just looked it up above");
            let all_ops: Vec<Op> = fence.batches.into_iter().flatten().collect();
            let commit = Commit::new(fence.name, self.current_root.clone(), all_ops, self.hop_limit);
            self.ready.push_back(commit);
            self.commits_promoted += 1;
        }
        Ok(())
    }

    /// The commit at the head of the ready queue, if any.
    pub fn get_ready_commit(&mut self) -> Option<&mut Commit> {
        self.ready.front_mut()
    }

    /// Pops and returns the commit at the head of the ready queue.
    pub fn remove_commit(&mut self) -> Option<Commit> {
        self.ready.pop_front()
    }

    /// Collapses adjacent ready commits that are still mergeable (neither
    /// carries `NO_MERGE`, neither has reached STORE) into one, strictly
    /// in queue order. Call before [`Manager::get_ready_commit`] to give
    /// the driver fewer, larger commits to push through STORE.
    pub fn merge_ready_commits(&mut self) {
        let mut i = 0;
        while i + 1 < self.ready.len() {
            if self.ready[i].is_mergeable_with(&self.ready[i + 1]) {
                let next = self.ready.remove(i + 1).expect("index checked above");
                self.ready[i].absorb(next);
            } else {
                i += 1;
            }
        }
    }

    /// Folds a finished commit's noop-store count into the manager's
    /// running total. Call once per commit after it reaches `FINISHED`.
    pub fn record_noop_stores(&mut self, commit: &Commit) {
        self.noop_stores_total += commit.noop_stores();
    }
}
