//! End-to-end ledger scenarios against the public API

use std::sync::Arc;

use securechat_ledger::storage::BlockStorage;
use securechat_ledger::{
    ChainStore, CodecConfig, LedgerConfig, LedgerError, MemoryBlockStorage, PlainCodec,
    RetryConfig, SledBlockStorage, Validation, ValidationReport,
};
use tempfile::tempdir;

#[test]
fn test_initialize_append_tamper_validate() {
    let storage = Arc::new(MemoryBlockStorage::new());
    let store = ChainStore::new(storage.clone(), Arc::new(PlainCodec));

    store.initialize().unwrap();
    let chain = store.full_chain().unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].index, 0);
    assert_eq!(chain[0].prev_hash, "0");

    store.append("alice", "bob", "ct1").unwrap();
    let chain = store.full_chain().unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].index, 1);
    assert_eq!(chain[1].prev_hash, chain[0].hash);
    assert_eq!(store.validate().unwrap(), Validation::Valid);

    let mut record = storage.get(1).unwrap().unwrap();
    record.payload = "ct1-edited".to_string();
    assert!(storage.overwrite(record));

    let validation = store.validate().unwrap();
    assert_eq!(validation.position(), Some(1));
    let report = ValidationReport::from(&validation);
    assert!(!report.valid);
    assert_eq!(report.error.as_deref(), Some("hash invalid at position 1"));
}

#[test]
fn test_stored_hashes_recompute() {
    let store = ChainStore::in_memory();
    store.initialize().unwrap();
    for (from, to) in [("alice", "bob"), ("bob", "alice"), ("carol", "bob")] {
        store.append(from, to, "opaque").unwrap();
    }

    for block in store.full_chain().unwrap() {
        assert_eq!(block.compute_hash(), block.hash);
    }
}

#[test]
fn test_participant_view_is_subset_of_full_chain() {
    let store = ChainStore::in_memory();
    store.initialize().unwrap();
    store.append("alice", "bob", "ct1").unwrap();
    store.append("carol", "dave", "ct2").unwrap();
    store.append("bob", "alice", "ct3").unwrap();

    let full = store.full_chain().unwrap();
    let view = store.chain_for_participant("alice").unwrap();

    assert_eq!(
        view.iter().map(|b| b.index).collect::<Vec<_>>(),
        vec![0, 1, 3]
    );
    assert!(view.iter().all(|b| full.contains(b)));
}

#[test]
fn test_sled_restart_continues_chain() {
    let dir = tempdir().unwrap();
    let config = LedgerConfig::with_storage_path(dir.path().to_string_lossy());

    let first = {
        let store = ChainStore::open(&config).unwrap();
        store.initialize().unwrap();
        store.append("alice", "bob", "ct1").unwrap()
    };

    let store = ChainStore::open(&config).unwrap();
    // Existing chain, no second genesis
    assert!(store.initialize().unwrap().is_none());
    assert_eq!(store.tail().unwrap().unwrap(), first);

    let second = store.append("bob", "alice", "ct2").unwrap();
    assert_eq!(second.index, 2);
    assert_eq!(second.prev_hash, first.hash);
    assert!(store.validate().unwrap().is_valid());
}

#[test]
fn test_encrypted_sled_chain() {
    let dir = tempdir().unwrap();
    let mut config = LedgerConfig::with_storage_path(dir.path().to_string_lossy());
    config.codec = CodecConfig::encrypted("an-example-master-key-of-32-bytes!");

    {
        let store = ChainStore::open(&config).unwrap();
        store.initialize().unwrap();
        store.append("alice", "bob", "ct1").unwrap();
        store.append("bob", "carol", "ct2").unwrap();

        assert_eq!(store.chain_for_participant("carol").unwrap().len(), 2);
        assert!(store.validate().unwrap().is_valid());
    }

    // Wrong key cannot adopt the chain
    config.codec = CodecConfig::encrypted("a-different-master-key-of-32-bytes");
    let store = ChainStore::open(&config).unwrap();
    assert!(matches!(store.initialize(), Err(LedgerError::Config(_))));
}

#[test]
fn test_two_handles_share_one_chain() {
    let storage: Arc<dyn BlockStorage> = Arc::new(SledBlockStorage::temporary().unwrap());
    let retry = RetryConfig {
        max_retries: 50,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    };

    let a = Arc::new(ChainStore::new(storage.clone(), Arc::new(PlainCodec)).with_retry(retry.clone()));
    let b = Arc::new(ChainStore::new(storage, Arc::new(PlainCodec)).with_retry(retry));
    a.initialize().unwrap();
    assert!(b.initialize().unwrap().is_none());

    let workers: Vec<_> = [a.clone(), b.clone(), a.clone(), b.clone()]
        .into_iter()
        .enumerate()
        .map(|(w, store)| {
            std::thread::spawn(move || {
                let mut committed = 0u64;
                for i in 0..20 {
                    match store.append(&format!("user{}", w), "bob", &format!("ct{}", i)) {
                        Ok(_) => committed += 1,
                        Err(e) if e.is_transient() => {}
                        Err(e) => panic!("append failed: {}", e),
                    }
                }
                committed
            })
        })
        .collect();

    let committed: u64 = workers.into_iter().map(|w| w.join().unwrap()).sum();

    assert!(committed > 0);

    let chain = a.full_chain().unwrap();
    assert_eq!(chain.len() as u64, committed + 1);
    assert_eq!(b.full_chain().unwrap(), chain);
    for (position, block) in chain.iter().enumerate() {
        assert_eq!(block.index, position as u64);
    }
    let hashes: std::collections::HashSet<_> = chain.iter().map(|b| &b.hash).collect();
    assert_eq!(hashes.len(), chain.len());
    assert!(a.validate().unwrap().is_valid());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_from_tasks() {
    let store = Arc::new(ChainStore::in_memory());
    store.initialize().unwrap();

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let store = store.clone();
            tokio::task::spawn_blocking(move || store.append("alice", "bob", &format!("ct{}", i)))
        })
        .collect();

    let mut indices = Vec::new();
    for task in tasks {
        indices.push(task.await.unwrap().unwrap().index);
    }
    indices.sort_unstable();

    assert_eq!(indices, (1..=32).collect::<Vec<u64>>());
    assert!(store.validate().unwrap().is_valid());
}
