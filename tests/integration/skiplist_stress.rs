//! Concurrent stress on the insert skip list and version chains.

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use shadetree::storage::{SkipList, UpdatePayload, VersionChain};

#[test]
fn concurrent_inserts_all_land_sorted() {
    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 2_000;

    let list: Arc<SkipList<u64, u64>> = Arc::new(SkipList::new());
    thread::scope(|scope| {
        for w in 0..WRITERS {
            let list = Arc::clone(&list);
            scope.spawn(move || {
                // Writers interleave across the key space.
                for i in 0..PER_WRITER {
                    let key = i * WRITERS + w;
                    list.insert(key, key * 2);
                }
            });
        }
    });

    assert_eq!(list.len() as u64, WRITERS * PER_WRITER);
    let mut expected = 0u64;
    for (key, value) in list.iter() {
        assert_eq!(*key, expected);
        assert_eq!(*value, expected * 2);
        expected += 1;
    }
    assert_eq!(expected, WRITERS * PER_WRITER);
}

#[test]
fn readers_race_writers_without_missing_settled_keys() {
    const KEYS: u64 = 4_000;

    let list: Arc<SkipList<u64, u64>> = Arc::new(SkipList::new());
    thread::scope(|scope| {
        let writer = Arc::clone(&list);
        scope.spawn(move || {
            for key in 0..KEYS {
                writer.insert(key, key);
            }
        });
        for _ in 0..3 {
            let reader = Arc::clone(&list);
            scope.spawn(move || {
                // Once a key is observed, every earlier key must be too.
                loop {
                    let settled = match reader.last() {
                        Some((k, _)) => *k,
                        None => continue,
                    };
                    for key in (0..=settled).step_by(61) {
                        assert_eq!(reader.get(&key), Some(&key));
                    }
                    if settled == KEYS - 1 {
                        break;
                    }
                }
            });
        }
    });
}

#[test]
fn version_chains_in_lists_accumulate_under_contention() {
    const THREADS: u64 = 4;
    const ROUNDS: u64 = 500;

    let list: Arc<SkipList<Bytes, VersionChain>> = Arc::new(SkipList::new());
    thread::scope(|scope| {
        for t in 0..THREADS {
            let list = Arc::clone(&list);
            scope.spawn(move || {
                for i in 0..ROUNDS {
                    let chain = list
                        .get_or_insert_with(Bytes::from_static(b"contended"), VersionChain::new);
                    chain.prepend(t * ROUNDS + i, UpdatePayload::Tombstone);
                }
            });
        }
    });

    assert_eq!(list.len(), 1);
    let chain = list.get(&Bytes::from_static(b"contended")).unwrap();
    assert_eq!(chain.iter().count() as u64, THREADS * ROUNDS);
    // Newest-first order holds per writer.
    for t in 0..THREADS {
        let mine: Vec<u64> = chain
            .iter()
            .map(|u| u.txnid)
            .filter(|txn| txn / ROUNDS == t)
            .collect();
        let mut sorted = mine.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(mine, sorted);
    }
}

#[test]
fn duplicate_keys_preserve_arrival_order_single_threaded() {
    let list: SkipList<u8, u32> = SkipList::new();
    for i in 0..64 {
        list.insert(1, i);
    }
    let values: Vec<u32> = list.iter().map(|(_, v)| *v).collect();
    assert_eq!(values, (0..64).collect::<Vec<_>>());
}
