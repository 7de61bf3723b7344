#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use blocktree::{
    primitives::io::{FileIo, MemFileIo},
    storage::btree::PageRef,
    BTree, Result, Store, StoreOptions,
};
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn mem_files(count: usize) -> (Vec<MemFileIo>, Vec<Arc<dyn FileIo>>) {
    let mems: Vec<MemFileIo> = (0..count).map(|_| MemFileIo::new()).collect();
    let files = mems
        .iter()
        .map(|mem| Arc::new(mem.clone()) as Arc<dyn FileIo>)
        .collect();
    (mems, files)
}

fn page_keys(page: &PageRef<u64, String>) -> Result<Vec<u64>> {
    let mut keys = Vec::new();
    for i in 0..page.num_keys() {
        keys.extend(page.get_key(i)?);
    }
    Ok(keys)
}

#[test]
fn eighth_insert_splits_the_root() -> Result<()> {
    let (_mems, files) = mem_files(1);
    let store = Store::with_files(files, StoreOptions::default().max_keys(7))?;
    let tree: BTree<u64, String> = store.create_tree()?;
    for k in (10..=80).step_by(10) {
        tree.insert(k, format!("v{k}"))?;
    }

    let root = tree.root();
    assert_eq!(page_keys(&root)?, vec![40]);
    assert!(!root.is_leaf());
    let left = root.get_child(0)?.expect("left child");
    let right = root.get_child(1)?.expect("right child");
    assert_eq!(page_keys(&left)?, vec![10, 20, 30]);
    assert_eq!(page_keys(&right)?, vec![50, 60, 70, 80]);
    assert!(left.is_leaf() && right.is_leaf());
    assert_eq!(tree.get(&40)?, Some("v40".to_string()));
    assert_eq!(tree.len()?, 8);
    Ok(())
}

#[test]
fn replacing_a_value_keeps_the_key_count() -> Result<()> {
    let (_mems, files) = mem_files(1);
    let store = Store::with_files(files, StoreOptions::default().max_keys(5))?;
    let tree: BTree<u64, String> = store.create_tree()?;
    for k in 0..40 {
        tree.insert(k, "old".to_string())?;
    }
    for k in 0..40 {
        assert!(!tree.insert(k, format!("new-{k}"))?);
    }
    assert_eq!(tree.len()?, 40);
    tree.flush()?;
    for k in 0..40 {
        assert_eq!(tree.get(&k)?, Some(format!("new-{k}")));
    }
    Ok(())
}

#[test]
fn shuffled_inserts_across_shards_survive_reopen() -> Result<()> {
    let (mems, files) = mem_files(3);
    let options = StoreOptions::default().shards(3).max_keys(9);
    let mut keys: Vec<u64> = (0..500).collect();
    keys.shuffle(&mut ChaCha8Rng::seed_from_u64(17));

    let root_id = {
        let store = Store::with_files(files, options.clone())?;
        let tree: BTree<u64, String> = store.create_tree()?;
        for &k in &keys {
            tree.insert(k, format!("value-{k:04}"))?;
        }
        tree.verify()?;
        tree.flush()?;
        let root_id = tree.root_id();
        store.close()?;
        root_id
    };
    assert!(mems.iter().all(|mem| mem.write_count() > 0));

    let files = mems
        .iter()
        .map(|mem| Arc::new(mem.clone()) as Arc<dyn FileIo>)
        .collect();
    let store = Store::with_files(files, options)?;
    let tree: BTree<u64, String> = store.open_tree(root_id)?;
    let report = tree.verify()?;
    assert_eq!(report.keys, 500);
    let expected: Vec<(u64, Option<String>)> =
        (0..500).map(|k| (k, Some(format!("value-{k:04}")))).collect();
    assert_eq!(tree.entries()?, expected);
    store.close()?;
    Ok(())
}

#[test]
fn tree_persists_in_shard_files() -> Result<()> {
    let dir = tempdir()?;
    let options = StoreOptions::default().shards(2).max_keys(7);
    let mut reference = BTreeMap::new();

    let root_id = {
        let store = Store::open(dir.path(), options.clone())?;
        let tree: BTree<String, u64> = store.create_tree()?;
        for i in 0u64..120 {
            let key = format!("user:{:05}", i * 7919 % 1000);
            tree.insert(key.clone(), i)?;
            reference.insert(key, i);
        }
        tree.flush()?;
        let root_id = tree.root_id();
        store.close()?;
        root_id
    };
    assert!(dir.path().join("shard-0.blk").exists());
    assert!(dir.path().join("shard-1.blk").exists());

    let store = Store::open(dir.path(), options)?;
    let tree: BTree<String, u64> = store.open_tree(root_id)?;
    tree.verify()?;
    let actual: BTreeMap<String, u64> = tree
        .entries()?
        .into_iter()
        .map(|(k, v)| (k, v.expect("value")))
        .collect();
    assert_eq!(actual, reference);

    tree.insert("user:99999".to_string(), 1)?;
    assert_eq!(tree.last()?, Some("user:99999".to_string()));
    store.close()?;
    Ok(())
}

#[test]
fn remote_workers_serve_a_full_tree() -> Result<()> {
    let (mems, files) = mem_files(2);
    let options = StoreOptions::default()
        .shards(2)
        .max_keys(5)
        .node_cache_blocks(64);
    let store = Store::with_files(files, options.clone())?;
    let tree: BTree<u64, u64> = store.create_tree()?;
    for k in 0..300 {
        tree.insert(k * 3, k)?;
    }
    tree.flush()?;
    let root_id = tree.root_id();
    store.close()?;

    let files = mems
        .iter()
        .map(|mem| Arc::new(mem.clone()) as Arc<dyn FileIo>)
        .collect();
    let store = Store::with_files(files, options)?;
    let tree: BTree<u64, u64> = store.open_tree(root_id)?;
    assert_eq!(tree.get(&297)?, Some(99));
    assert_eq!(tree.get(&298)?, None);
    assert_eq!(tree.verify()?.keys, 300);
    store.close()?;
    Ok(())
}

#[test]
fn inline_splits_match_pooled_splits() -> Result<()> {
    let build = |workers: usize| -> Result<Vec<(u64, Option<u64>)>> {
        let (_mems, files) = mem_files(1);
        let store = Store::with_files(
            files,
            StoreOptions::default().max_keys(3).split_workers(workers),
        )?;
        let tree: BTree<u64, u64> = store.create_tree()?;
        for k in (0..150).rev() {
            tree.insert(k, k * k)?;
        }
        tree.verify()?;
        tree.entries()
    };
    assert_eq!(build(0)?, build(4)?);
    Ok(())
}
