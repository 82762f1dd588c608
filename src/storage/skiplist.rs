//! Probabilistic forward-linked skip list with bounded depth.
//!
//! The list backs both the per-page insert chains and the overflow trackers.
//! Readers are lock-free: searches and iteration follow forward pointers with
//! acquire loads and never require exclusion, so a search that read a pointer
//! before a racing insert linked its node is allowed to miss that node.
//! Writers are serialized by an internal mutex, matching the serialized
//! insert path of the surrounding page code. Nodes are never unlinked on the
//! read path; bulk removal takes `&mut self` and happens only when the owning
//! page is reconciled or destroyed.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::Rng;

/// Maximum number of forward-pointer levels, shared by every list in the
/// system; a node's level array never exceeds this bound.
pub const SKIP_MAXDEPTH: usize = 10;

struct Node<K, V> {
    key: K,
    value: V,
    /// Forward pointers, one per level in `0..depth`.
    next: Box<[AtomicPtr<Node<K, V>>]>,
}

impl<K, V> Node<K, V> {
    fn alloc(key: K, value: V, depth: usize) -> *mut Self {
        let next = (0..depth)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(Node { key, value, next }))
    }
}

/// Ordered forward-linked skip list.
///
/// Duplicate keys are permitted; new duplicates link after existing ones, so
/// level-0 iteration yields equal keys in insertion order.
pub struct SkipList<K, V> {
    head: [AtomicPtr<Node<K, V>>; SKIP_MAXDEPTH],
    tail: [AtomicPtr<Node<K, V>>; SKIP_MAXDEPTH],
    len: AtomicUsize,
    writer: Mutex<()>,
}

impl<K: Ord, V> SkipList<K, V> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            head: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            tail: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            len: AtomicUsize::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Number of nodes in the list (approximate under concurrent inserts).
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the list holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `key`/`value` at a randomly drawn depth.
    pub fn insert(&self, key: K, value: V) -> &V {
        let depth = random_depth(&mut rand::thread_rng());
        self.insert_at_depth(key, value, depth)
    }

    /// Inserts at an explicit depth in `[1, SKIP_MAXDEPTH]`.
    ///
    /// Exposed for deterministic tests; `insert` is the normal entry point.
    pub fn insert_at_depth(&self, key: K, value: V, depth: usize) -> &V {
        let depth = depth.clamp(1, SKIP_MAXDEPTH);
        let _serial = self.writer.lock();
        let update = self.search_path(&key);
        unsafe { &(*self.link(key, value, depth, &update)).value }
    }

    /// Returns the value of the first node matching `key`, if any.
    pub fn get(&self, key: &K) -> Option<&V> {
        let node = self.find_ge(key);
        if node.is_null() {
            return None;
        }
        let node = unsafe { &*node };
        if node.key == *key {
            Some(&node.value)
        } else {
            None
        }
    }

    /// Whether any node matches `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns the existing value for `key`, or inserts one built by `init`
    /// at a randomly drawn depth.
    ///
    /// The lookup and insert happen under the writer lock, so two racing
    /// writers of the same new key converge on a single node.
    pub fn get_or_insert_with<F>(&self, key: K, init: F) -> &V
    where
        F: FnOnce() -> V,
    {
        let _serial = self.writer.lock();
        let node = self.find_ge(&key);
        if !node.is_null() {
            let node = unsafe { &*node };
            if node.key == key {
                return &node.value;
            }
        }
        let depth = random_depth(&mut rand::thread_rng());
        let update = self.search_path(&key);
        unsafe { &(*self.link(key, init(), depth, &update)).value }
    }

    /// Lazy level-0 iteration in sorted order, starting from the smallest
    /// key. The iterator is finite and restartable.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cur: self.head[0].load(Ordering::Acquire),
            _list: PhantomData,
        }
    }

    /// Level-0 iteration starting from the first node with key >= `key`.
    pub fn range_from(&self, key: &K) -> Iter<'_, K, V> {
        Iter {
            cur: self.find_ge(key),
            _list: PhantomData,
        }
    }

    /// The largest key and its value, in O(1) via the level-0 tail.
    pub fn last(&self) -> Option<(&K, &V)> {
        let tail = self.tail[0].load(Ordering::Acquire);
        if tail.is_null() {
            None
        } else {
            let node = unsafe { &*tail };
            Some((&node.key, &node.value))
        }
    }

    /// Mutable access to the value of the first node matching `key`.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let node = self.find_ge(key);
        if node.is_null() {
            return None;
        }
        let node = unsafe { &mut *node };
        if node.key == *key {
            Some(&mut node.value)
        } else {
            None
        }
    }

    /// Exclusive level-0 iteration with mutable access to values.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        IterMut {
            cur: self.head[0].load(Ordering::Relaxed),
            _list: PhantomData,
        }
    }

    /// Exclusive level-0 iteration starting from the first node with key
    /// >= `key`, so a duplicate run can be visited without walking the
    /// whole list.
    pub fn range_from_mut(&mut self, key: &K) -> IterMut<'_, K, V> {
        IterMut {
            cur: self.find_ge(key),
            _list: PhantomData,
        }
    }

    /// Unlinks every node for which `doomed` returns true and returns the
    /// removed pairs in key order.
    ///
    /// Requires exclusive access; the read path never removes nodes.
    pub fn remove_where<F>(&mut self, mut doomed: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut victims: Vec<*mut Node<K, V>> = Vec::new();
        let mut cur = self.head[0].load(Ordering::Relaxed);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if doomed(&node.key, &node.value) {
                victims.push(cur);
            }
            cur = node.next[0].load(Ordering::Relaxed);
        }
        if victims.is_empty() {
            return Vec::new();
        }
        let victim_set: rustc_hash::FxHashSet<usize> =
            victims.iter().map(|p| *p as usize).collect();
        for level in 0..SKIP_MAXDEPTH {
            let mut cell: *const AtomicPtr<Node<K, V>> = &self.head[level];
            let mut last_kept: *mut Node<K, V> = ptr::null_mut();
            loop {
                let next = unsafe { (*cell).load(Ordering::Relaxed) };
                if next.is_null() {
                    break;
                }
                if victim_set.contains(&(next as usize)) {
                    let after = unsafe { (*next).next[level].load(Ordering::Relaxed) };
                    unsafe { (*cell).store(after, Ordering::Relaxed) };
                } else {
                    last_kept = next;
                    cell = unsafe { &(*next).next[level] };
                }
            }
            self.tail[level].store(last_kept, Ordering::Relaxed);
        }
        self.len.fetch_sub(victims.len(), Ordering::Relaxed);
        victims
            .into_iter()
            .map(|p| {
                let node = unsafe { Box::from_raw(p) };
                (node.key, node.value)
            })
            .collect()
    }

    /// Walks from the top populated level down, recording for each level the
    /// pointer cell after which a node sorting at `key` links in. Advancing
    /// past equal keys keeps duplicate inserts in arrival order.
    ///
    /// Caller holds the writer lock, so the recorded cells stay valid.
    fn search_path(&self, key: &K) -> [*const AtomicPtr<Node<K, V>>; SKIP_MAXDEPTH] {
        let mut update: [*const AtomicPtr<Node<K, V>>; SKIP_MAXDEPTH] =
            [ptr::null(); SKIP_MAXDEPTH];
        let mut owner: *const Node<K, V> = ptr::null();
        for level in (0..SKIP_MAXDEPTH).rev() {
            loop {
                let cell: &AtomicPtr<Node<K, V>> = if owner.is_null() {
                    &self.head[level]
                } else {
                    unsafe { &(*owner).next[level] }
                };
                let next = cell.load(Ordering::Acquire);
                if next.is_null() || unsafe { (*next).key > *key } {
                    update[level] = cell;
                    break;
                }
                owner = next;
            }
        }
        update
    }

    /// Links a freshly allocated node into levels `0..depth` at the cells
    /// recorded by `search_path`, bottom level first so a node visible at any
    /// level is already reachable at level 0.
    fn link(
        &self,
        key: K,
        value: V,
        depth: usize,
        update: &[*const AtomicPtr<Node<K, V>>; SKIP_MAXDEPTH],
    ) -> *mut Node<K, V> {
        let node = Node::alloc(key, value, depth);
        for level in 0..depth {
            let cell = unsafe { &*update[level] };
            let succ = cell.load(Ordering::Relaxed);
            unsafe { (*node).next[level].store(succ, Ordering::Relaxed) };
            cell.store(node, Ordering::Release);
            if succ.is_null() {
                self.tail[level].store(node, Ordering::Release);
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        node
    }

    /// First node whose key sorts at or after `key`, or null.
    fn find_ge(&self, key: &K) -> *mut Node<K, V> {
        let mut owner: *const Node<K, V> = ptr::null();
        for level in (0..SKIP_MAXDEPTH).rev() {
            loop {
                let cell: &AtomicPtr<Node<K, V>> = if owner.is_null() {
                    &self.head[level]
                } else {
                    unsafe { &(*owner).next[level] }
                };
                let next = cell.load(Ordering::Acquire);
                if next.is_null() || unsafe { (*next).key >= *key } {
                    break;
                }
                owner = next;
            }
        }
        let cell: &AtomicPtr<Node<K, V>> = if owner.is_null() {
            &self.head[0]
        } else {
            unsafe { &(*owner).next[0] }
        };
        cell.load(Ordering::Acquire)
    }
}

impl<K: Ord + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for SkipList<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Ord, V> Default for SkipList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for SkipList<K, V> {
    fn drop(&mut self) {
        let mut cur = self.head[0].load(Ordering::Relaxed);
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next[0].load(Ordering::Relaxed);
        }
    }
}

// Nodes are reachable from any thread holding a reference to the list, and
// values hand out shared references across threads.
unsafe impl<K: Send, V: Send> Send for SkipList<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SkipList<K, V> {}

/// Shared level-0 iterator.
pub struct Iter<'a, K, V> {
    cur: *mut Node<K, V>,
    _list: PhantomData<&'a SkipList<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        let node = unsafe { &*self.cur };
        self.cur = node.next[0].load(Ordering::Acquire);
        Some((&node.key, &node.value))
    }
}

/// Exclusive level-0 iterator with mutable value access.
pub struct IterMut<'a, K, V> {
    cur: *mut Node<K, V>,
    _list: PhantomData<&'a mut SkipList<K, V>>,
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        // Each node is yielded exactly once and the list is exclusively
        // borrowed for 'a.
        let node = unsafe { &mut *self.cur };
        self.cur = node.next[0].load(Ordering::Relaxed);
        Some((&node.key, &mut node.value))
    }
}

/// Draws a level count in `[1, SKIP_MAXDEPTH]`; each additional level is
/// half as likely as the previous one.
fn random_depth<R: Rng>(rng: &mut R) -> usize {
    let mut depth = 1;
    while depth < SKIP_MAXDEPTH && rng.gen_bool(0.5) {
        depth += 1;
    }
    depth
}
