//! Newest-first version chains.
//!
//! Every modified or inserted key carries a singly linked chain of updates
//! ordered newest to oldest. New versions are prepended with a compare and
//! swap, so concurrent writers of the same key never lose an update and
//! readers walking the chain always see a fully initialized node.

#![allow(unsafe_code)]

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use bytes::Bytes;

use crate::types::TxnId;

/// The value carried by one version of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePayload {
    /// A regular value.
    Put(Bytes),
    /// A removal marker; readers positioned on it treat the key as absent.
    Tombstone,
}

/// One version in a chain.
#[derive(Debug)]
pub struct Update {
    /// Transaction that produced this version.
    pub txnid: TxnId,
    /// The version's value or removal marker.
    pub payload: UpdatePayload,
    next: AtomicPtr<Update>,
}

impl Update {
    /// Size accounted against the owning page for this version.
    pub fn footprint(&self) -> usize {
        std::mem::size_of::<Update>()
            + match &self.payload {
                UpdatePayload::Put(data) => data.len(),
                UpdatePayload::Tombstone => 0,
            }
    }
}

/// A chain of versions for one key, newest first.
pub struct VersionChain {
    head: AtomicPtr<Update>,
}

impl VersionChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Creates a chain seeded with a single version.
    pub fn with_update(txnid: TxnId, payload: UpdatePayload) -> Self {
        let chain = Self::new();
        chain.prepend(txnid, payload);
        chain
    }

    /// Whether the chain holds no versions.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Prepends a new version, making it the chain's newest. Returns the
    /// new version's footprint so the caller can account it.
    pub fn prepend(&self, txnid: TxnId, payload: UpdatePayload) -> usize {
        let node = Box::into_raw(Box::new(Update {
            txnid,
            payload,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let mut cur = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next.store(cur, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange(cur, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        unsafe { (*node).footprint() }
    }

    /// The newest version, if any.
    pub fn newest(&self) -> Option<&Update> {
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            None
        } else {
            Some(unsafe { &*head })
        }
    }

    /// Walks versions newest to oldest.
    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            cur: self.head.load(Ordering::Acquire),
            _chain: std::marker::PhantomData,
        }
    }

    /// The newest version for which `visible` accepts the producing
    /// transaction, walking newest to oldest.
    pub fn visible<F>(&self, mut visible: F) -> Option<&Update>
    where
        F: FnMut(TxnId) -> bool,
    {
        self.iter().find(|update| visible(update.txnid))
    }
}

impl Default for VersionChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VersionChain {
    fn drop(&mut self) {
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

unsafe impl Send for VersionChain {}
unsafe impl Sync for VersionChain {}

impl std::fmt::Debug for VersionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Newest-first iterator over a chain.
pub struct ChainIter<'a> {
    cur: *mut Update,
    _chain: std::marker::PhantomData<&'a VersionChain>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a Update;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        let node = unsafe { &*self.cur };
        self.cur = node.next.load(Ordering::Acquire);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_orders_newest_first() {
        let chain = VersionChain::new();
        chain.prepend(10, UpdatePayload::Put(Bytes::from_static(b"a")));
        chain.prepend(20, UpdatePayload::Put(Bytes::from_static(b"b")));
        chain.prepend(30, UpdatePayload::Tombstone);
        let txns: Vec<TxnId> = chain.iter().map(|u| u.txnid).collect();
        assert_eq!(txns, vec![30, 20, 10]);
        assert_eq!(chain.newest().unwrap().payload, UpdatePayload::Tombstone);
    }

    #[test]
    fn visible_skips_to_first_accepted() {
        let chain = VersionChain::new();
        chain.prepend(5, UpdatePayload::Put(Bytes::from_static(b"old")));
        chain.prepend(50, UpdatePayload::Put(Bytes::from_static(b"new")));
        let seen = chain.visible(|txn| txn <= 10).unwrap();
        assert_eq!(seen.txnid, 5);
        assert!(chain.visible(|txn| txn <= 1).is_none());
    }

    #[test]
    fn footprint_accounts_payload() {
        let chain = VersionChain::new();
        let put = chain.prepend(1, UpdatePayload::Put(Bytes::from(vec![0u8; 64])));
        let tomb = chain.prepend(2, UpdatePayload::Tombstone);
        assert_eq!(put - tomb, 64);
    }

    #[test]
    fn concurrent_prepends_all_land() {
        use std::sync::Arc;

        let chain = Arc::new(VersionChain::new());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let chain = Arc::clone(&chain);
            handles.push(std::thread::spawn(move || {
                for i in 0..256u64 {
                    chain.prepend(t * 1000 + i, UpdatePayload::Tombstone);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(chain.iter().count(), 1024);
    }
}
