//! Lock-minimal map from OS process id to graph node.
//!
//! The map exists to collapse one race: after a fork, the worker thread
//! registers the child here while the reaper thread may already have
//! collected its exit status. Whichever side arrives first inserts its half
//! of the pair; the second side consumes the entry and carries both halves
//! away. No entry ever holds both halves at rest.
//!
//! Structure: a fixed arena of tree nodes forming a binary trie keyed on the
//! pid's bits, with the free list threaded through the same arena. A single
//! atomic word holds the root index and doubles as the structural lock (the
//! root is swapped for a sentinel while a thread mutates the tree). There
//! are no per-entry locks.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

/// Stable address of a process node: group index + node index within the
/// group. Carried through the map instead of a pointer so that ownership
/// stays with the manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub group: u16,
    pub node: u16,
}

/// One half of a register/reap pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Node(NodeRef),
    Status(i32),
}

/// Outcome of [`ProcessMap::register_if_not_reaped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The pid was unknown; the node is now registered.
    Inserted,
    /// The child already exited; the entry was consumed and this is its
    /// exit status.
    AlreadyReaped(i32),
    /// Arena exhausted.
    Full,
}

/// Outcome of [`ProcessMap::report_reaped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// No registration yet; the status is parked under the pid.
    Inserted,
    /// A node was registered; the entry was consumed. The caller must
    /// notify the node of the exit status.
    Consumed(NodeRef, i32),
    /// Arena exhausted.
    Full,
}

const NO_NODE: u32 = u32::MAX;
const LOCKED: u32 = u32::MAX - 1;

struct TreeNode {
    pid: i32,
    left: u32,
    /// Doubles as the free-list link while the node is unused.
    right: u32,
    slot: Option<Slot>,
}

struct MapInner {
    items: Box<[TreeNode]>,
    free: u32,
}

pub struct ProcessMap {
    /// Trie root index, `NO_NODE`, or `LOCKED` while a thread holds the
    /// structure.
    root: AtomicU32,
    inner: UnsafeCell<MapInner>,
}

// Safety: `inner` is only touched between a successful swap of `root` to
// LOCKED (acquire) and the store releasing it, which serializes all access.
unsafe impl Send for ProcessMap {}
unsafe impl Sync for ProcessMap {}

impl ProcessMap {
    pub fn new(capacity: usize) -> ProcessMap {
        assert!(capacity > 0 && capacity < LOCKED as usize);
        let mut items = Vec::with_capacity(capacity);
        for i in 0..capacity {
            items.push(TreeNode {
                pid: 0,
                left: NO_NODE,
                right: if i + 1 < capacity {
                    (i + 1) as u32
                } else {
                    NO_NODE
                },
                slot: None,
            });
        }
        ProcessMap {
            root: AtomicU32::new(NO_NODE),
            inner: UnsafeCell::new(MapInner {
                items: items.into_boxed_slice(),
                free: 0,
            }),
        }
    }

    /// Called by a worker thread right after fork. See [`RegisterOutcome`].
    pub fn register_if_not_reaped(&self, pid: i32, node: NodeRef) -> RegisterOutcome {
        match self.search(pid, Slot::Node(node)) {
            SearchOutcome::Inserted => RegisterOutcome::Inserted,
            SearchOutcome::Consumed(_, status) => RegisterOutcome::AlreadyReaped(status),
            SearchOutcome::Full => RegisterOutcome::Full,
            SearchOutcome::Anomaly => unreachable!("search() never returns Anomaly"),
        }
    }

    /// Called by the reaper with a collected exit. See [`ReapOutcome`].
    pub fn report_reaped(&self, pid: i32, status: i32) -> ReapOutcome {
        match self.search(pid, Slot::Status(status)) {
            SearchOutcome::Inserted => ReapOutcome::Inserted,
            SearchOutcome::Consumed(node, status) => ReapOutcome::Consumed(node, status),
            SearchOutcome::Full => ReapOutcome::Full,
            SearchOutcome::Anomaly => unreachable!("search() never returns Anomaly"),
        }
    }

    /// Drop a status-only entry left by an exit nobody was registered
    /// for. Used by the shutdown sweep; a node-bearing entry is kept.
    pub fn discard_status(&self, pid: i32) -> Option<i32> {
        let mut root = self.lock();
        // Safety: the structural lock is held.
        let inner = unsafe { &mut *self.inner.get() };
        let result = match find(inner, root, pid) {
            Found::At { index, parent } => {
                if let Some(Slot::Status(status)) = inner.items[index as usize].slot {
                    remove(inner, &mut root, index, parent);
                    Some(status)
                } else {
                    None
                }
            }
            Found::Missing { .. } => None,
        };
        self.unlock(root);
        result
    }

    /// True when no pid is tracked. After shutdown this must hold, or a
    /// child has been leaked.
    pub fn is_empty(&self) -> bool {
        let root = self.lock();
        let empty = root == NO_NODE;
        self.unlock(root);
        empty
    }

    fn lock(&self) -> u32 {
        loop {
            let root = self.root.swap(LOCKED, Ordering::Acquire);
            if root != LOCKED {
                return root;
            }
            thread::yield_now();
        }
    }

    fn unlock(&self, root: u32) {
        self.root.store(root, Ordering::Release);
    }

    fn search(&self, pid: i32, incoming: Slot) -> SearchOutcome {
        assert!(pid > 0, "pid must be positive");
        loop {
            let mut root = self.lock();
            // Safety: the structural lock is held.
            let inner = unsafe { &mut *self.inner.get() };

            let result = match find(inner, root, pid) {
                Found::Missing { parent, went_left } => {
                    insert(inner, &mut root, parent, went_left, pid, incoming)
                }
                Found::At { index, parent } => consume(inner, &mut root, index, parent, incoming),
            };
            self.unlock(root);

            match result {
                // A pid-reuse collision put two same-kind halves on one
                // entry. Let the other thread resolve its half first.
                SearchOutcome::Anomaly => thread::yield_now(),
                SearchOutcome::Inserted => return SearchOutcome::Inserted,
                SearchOutcome::Consumed(n, s) => return SearchOutcome::Consumed(n, s),
                SearchOutcome::Full => return SearchOutcome::Full,
            }
        }
    }
}

enum SearchOutcome {
    Inserted,
    Consumed(NodeRef, i32),
    Full,
    Anomaly,
}

enum Found {
    /// Key present at `index`; `parent` is its trie parent (or `NO_NODE`).
    At { index: u32, parent: u32 },
    /// Key absent; insertion hangs off `parent` on the given side
    /// (`parent == NO_NODE` means the tree is empty).
    Missing { parent: u32, went_left: bool },
}

/// Walk the trie by pid bits: bit set → left, clear → right.
fn find(inner: &MapInner, root: u32, pid: i32) -> Found {
    let mut mask: u32 = 1;
    let mut parent = NO_NODE;
    let mut went_left = false;
    let mut current = root;
    while current != NO_NODE && inner.items[current as usize].pid != pid {
        parent = current;
        went_left = (pid as u32) & mask != 0;
        current = if went_left {
            inner.items[current as usize].left
        } else {
            inner.items[current as usize].right
        };
        mask <<= 1;
    }
    if current == NO_NODE {
        Found::Missing { parent, went_left }
    } else {
        Found::At {
            index: current,
            parent,
        }
    }
}

fn insert(
    inner: &mut MapInner,
    root: &mut u32,
    parent: u32,
    went_left: bool,
    pid: i32,
    slot: Slot,
) -> SearchOutcome {
    let index = inner.free;
    if index == NO_NODE {
        return SearchOutcome::Full;
    }
    inner.free = inner.items[index as usize].right;
    let item = &mut inner.items[index as usize];
    item.pid = pid;
    item.slot = Some(slot);
    item.left = NO_NODE;
    item.right = NO_NODE;
    if parent == NO_NODE {
        *root = index;
    } else if went_left {
        inner.items[parent as usize].left = index;
    } else {
        inner.items[parent as usize].right = index;
    }
    SearchOutcome::Inserted
}

fn consume(
    inner: &mut MapInner,
    root: &mut u32,
    index: u32,
    parent: u32,
    incoming: Slot,
) -> SearchOutcome {
    let stored = inner.items[index as usize].slot;
    let (node, status) = match (incoming, stored) {
        (Slot::Status(status), Some(Slot::Node(node))) => (node, status),
        (Slot::Node(node), Some(Slot::Status(status))) => (node, status),
        // Same-kind halves on one pid: the register/reap pairing broke,
        // which only happens transiently under pid reuse.
        _ => return SearchOutcome::Anomaly,
    };
    remove(inner, root, index, parent);
    SearchOutcome::Consumed(node, status)
}

/// Unlink `index` by swapping in a leaf from its subtree, then return the
/// freed arena cell to the free list.
fn remove(inner: &mut MapInner, root: &mut u32, index: u32, parent: u32) {
    let mut leaf = index;
    let mut leaf_parent = index;
    loop {
        let item = &inner.items[leaf as usize];
        let next = if item.left != NO_NODE {
            item.left
        } else if item.right != NO_NODE {
            item.right
        } else {
            break;
        };
        leaf_parent = leaf;
        leaf = next;
    }

    if leaf == *root {
        *root = NO_NODE;
    } else if leaf == index {
        // The entry itself is a leaf: unlink it from its parent.
        if inner.items[parent as usize].left == index {
            inner.items[parent as usize].left = NO_NODE;
        } else {
            inner.items[parent as usize].right = NO_NODE;
        }
    } else {
        // Move the leaf's payload into the vacated entry, then drop the
        // leaf from its old parent.
        inner.items[index as usize].pid = inner.items[leaf as usize].pid;
        inner.items[index as usize].slot = inner.items[leaf as usize].slot;
        if inner.items[leaf_parent as usize].left == leaf {
            inner.items[leaf_parent as usize].left = NO_NODE;
        } else {
            inner.items[leaf_parent as usize].right = NO_NODE;
        }
    }

    let freed = &mut inner.items[leaf as usize];
    freed.pid = 0;
    freed.slot = None;
    freed.left = NO_NODE;
    freed.right = inner.free;
    inner.free = leaf;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn node(n: u16) -> NodeRef {
        NodeRef { group: 0, node: n }
    }

    #[test]
    fn register_then_reap_consumes() {
        let map = ProcessMap::new(8);
        assert_eq!(map.register_if_not_reaped(100, node(1)), RegisterOutcome::Inserted);
        assert_eq!(map.report_reaped(100, 0), ReapOutcome::Consumed(node(1), 0));
        assert!(map.is_empty());
    }

    #[test]
    fn reap_then_register_consumes() {
        let map = ProcessMap::new(8);
        assert_eq!(map.report_reaped(200, 7), ReapOutcome::Inserted);
        assert_eq!(
            map.register_if_not_reaped(200, node(2)),
            RegisterOutcome::AlreadyReaped(7)
        );
        assert!(map.is_empty());
    }

    #[test]
    fn many_pids_interleave() {
        let map = ProcessMap::new(64);
        for pid in 1..=40 {
            assert_eq!(
                map.register_if_not_reaped(pid, node(pid as u16)),
                RegisterOutcome::Inserted
            );
        }
        // Consume in a scrambled order to exercise leaf replacement.
        for pid in (1..=40).rev() {
            assert_eq!(
                map.report_reaped(pid, pid),
                ReapOutcome::Consumed(node(pid as u16), pid)
            );
        }
        assert!(map.is_empty());
    }

    #[test]
    fn capacity_exhaustion_reports_full() {
        let map = ProcessMap::new(2);
        assert_eq!(map.register_if_not_reaped(1, node(1)), RegisterOutcome::Inserted);
        assert_eq!(map.register_if_not_reaped(2, node(2)), RegisterOutcome::Inserted);
        assert_eq!(map.register_if_not_reaped(3, node(3)), RegisterOutcome::Full);
    }

    #[test]
    fn arena_cells_recycle() {
        let map = ProcessMap::new(2);
        for round in 0..100 {
            let pid = 1 + (round % 7);
            assert_eq!(
                map.register_if_not_reaped(pid, node(0)),
                RegisterOutcome::Inserted
            );
            assert_eq!(map.report_reaped(pid, 0), ReapOutcome::Consumed(node(0), 0));
        }
        assert!(map.is_empty());
    }

    /// The register-vs-reap race: exactly one side consumes, the map ends
    /// empty, and the status is never lost.
    #[test]
    fn concurrent_register_and_reap() {
        for _ in 0..200 {
            let map = Arc::new(ProcessMap::new(4));
            let reg = {
                let map = Arc::clone(&map);
                std::thread::spawn(move || map.register_if_not_reaped(321, node(9)))
            };
            let reap = {
                let map = Arc::clone(&map);
                std::thread::spawn(move || map.report_reaped(321, 3))
            };
            let reg = reg.join().unwrap();
            let reap = reap.join().unwrap();
            match (reg, reap) {
                (RegisterOutcome::Inserted, ReapOutcome::Consumed(n, s)) => {
                    assert_eq!(n, node(9));
                    assert_eq!(s, 3);
                }
                (RegisterOutcome::AlreadyReaped(s), ReapOutcome::Inserted) => {
                    assert_eq!(s, 3);
                }
                other => panic!("unexpected outcome pair: {other:?}"),
            }
            assert!(map.is_empty());
        }
    }
}
