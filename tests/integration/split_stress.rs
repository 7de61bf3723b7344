#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use blocktree::{
    primitives::io::{FileIo, MemFileIo},
    storage::btree::{KeyPage, PageRef, SplitPool, SplitRequest, SplitSide},
    BTree, Result, Store, StoreError, StoreOptions,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const THREADS: usize = 4;
const KEYS_PER_THREAD: u64 = 250;

fn mem_store(options: StoreOptions) -> Result<Store> {
    let files: Vec<Arc<dyn FileIo>> = (0..options.shards)
        .map(|_| Arc::new(MemFileIo::new()) as Arc<dyn FileIo>)
        .collect();
    Store::with_files(files, options)
}

fn full_page(store: &Store) -> Result<PageRef<u64, u64>> {
    let env = store.page_env();
    let page = KeyPage::create(&env, true)?;
    {
        let mut guard = page.lock();
        for k in 0..store.layout().max_keys() as u64 {
            guard.insert_entry(k as usize, k, Some(k))?;
        }
    }
    Ok(page)
}

#[test]
fn racing_splits_of_one_side_move_entries_once() -> Result<()> {
    let store = mem_store(StoreOptions::default().max_keys(7))?;
    let page = full_page(&store)?;
    let pool = SplitPool::new(4)?;
    let requests = (0..4)
        .map(|_| SplitRequest::new(Arc::clone(&page), SplitSide::Right))
        .collect();
    let err = pool.dispatch(requests).unwrap_err();
    assert!(matches!(err, StoreError::Invariant(_)));

    let mut guard = page.lock();
    guard.check_slots()?;
    let sibling = guard.child(4)?.expect("one sibling installed");
    for i in 4..7 {
        assert_eq!(guard.key(i)?, None);
    }
    drop(guard);
    let moved: Vec<Option<u64>> = (0..3).map(|i| sibling.get_key(i)).collect::<Result<_>>()?;
    assert_eq!(moved, vec![Some(4), Some(5), Some(6)]);
    Ok(())
}

#[test]
fn repeated_root_splits_through_the_pool_keep_slots_consistent() -> Result<()> {
    let store = mem_store(StoreOptions::default().max_keys(5).split_workers(3))?;
    let pool = SplitPool::new(2)?;
    for _ in 0..32 {
        let page = full_page(&store)?;
        let done = pool.dispatch(vec![
            SplitRequest::new(Arc::clone(&page), SplitSide::Left),
            SplitRequest::new(Arc::clone(&page), SplitSide::Right),
        ])?;
        assert_eq!(done.len(), 2);
        let mut guard = page.lock();
        assert!(guard.child_id(2).is_some());
        assert!(guard.child_id(3).is_some());
        guard.check_slots()?;
        assert_eq!(guard.key(2)?, Some(2));
    }
    Ok(())
}

#[test]
fn concurrent_writers_and_readers_share_one_tree() -> Result<()> {
    let store = mem_store(StoreOptions::default().shards(2).max_keys(5).split_workers(4))?;
    let tree: Arc<BTree<u64, u64>> = Arc::new(store.create_tree()?);
    let start = Arc::new(Barrier::new(THREADS * 2));

    thread::scope(|scope| -> Result<()> {
        let mut writers = Vec::new();
        for t in 0..THREADS as u64 {
            let tree = Arc::clone(&tree);
            let start = Arc::clone(&start);
            writers.push(scope.spawn(move || -> Result<()> {
                start.wait();
                for i in 0..KEYS_PER_THREAD {
                    let key = i * THREADS as u64 + t;
                    tree.insert(key, key * 2)?;
                }
                Ok(())
            }));
        }
        let mut readers = Vec::new();
        for seed in 0..THREADS as u64 {
            let tree = Arc::clone(&tree);
            let start = Arc::clone(&start);
            readers.push(scope.spawn(move || -> Result<usize> {
                start.wait();
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let mut hits = 0;
                for _ in 0..400 {
                    let key = rng.gen_range(0..THREADS as u64 * KEYS_PER_THREAD);
                    if let Some(value) = tree.get(&key)? {
                        assert_eq!(value, key * 2);
                        hits += 1;
                    }
                }
                Ok(hits)
            }));
        }
        for handle in writers {
            handle.join().expect("writer panicked")?;
        }
        for handle in readers {
            handle.join().expect("reader panicked")?;
        }
        Ok(())
    })?;

    let report = tree.verify()?;
    assert_eq!(report.keys, THREADS * KEYS_PER_THREAD as usize);
    let keys: BTreeSet<u64> = tree.entries()?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys.len(), report.keys);
    assert!(tree.stats().root_splits > 0);
    assert!(tree.stats().right_splits > tree.stats().left_splits);
    tree.flush()?;
    store.close()
}

#[test]
fn independent_trees_split_in_parallel() -> Result<()> {
    let store = mem_store(StoreOptions::default().max_keys(3).split_workers(2))?;
    let trees: Vec<BTree<u64, String>> = (0..THREADS)
        .map(|_| store.create_tree())
        .collect::<Result<_>>()?;

    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = trees
            .iter()
            .enumerate()
            .map(|(t, tree)| {
                scope.spawn(move || -> Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(t as u64);
                    for _ in 0..300 {
                        let key = rng.gen_range(0..10_000u64);
                        tree.insert(key, format!("t{t}-{key}"))?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("inserter panicked")?;
        }
        Ok(())
    })?;

    for (t, tree) in trees.iter().enumerate() {
        tree.verify()?;
        for (key, value) in tree.entries()? {
            assert_eq!(value, Some(format!("t{t}-{key}")));
        }
    }
    store.close()
}
