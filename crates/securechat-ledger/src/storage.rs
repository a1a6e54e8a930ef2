//! Block persistence
//!
//! Storage deals in [`BlockRecord`]s: blocks whose sender, recipient and
//! payload have already passed through the field codec. Every backend keeps
//! blocks ordered by index, enforces hash uniqueness, maintains sender and
//! recipient indexes keyed by blind tags, and commits a block together with
//! its index entries atomically.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use tracing::{debug, info};

use crate::codec::BlindTag;
use crate::error::{LedgerError, Result};

/// A block as persisted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block index
    pub index: u64,
    /// ISO-8601 timestamp
    pub timestamp: String,
    /// Encoded sender
    pub from: String,
    /// Encoded recipient
    pub to: String,
    /// Encoded payload
    pub payload: String,
    /// Hash of the previous block
    pub prev_hash: String,
    /// Block hash
    pub hash: String,
}

/// Index entries committed alongside a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordTags {
    /// Blind tag of the sender
    pub sender: BlindTag,
    /// Blind tag of the recipient
    pub recipient: BlindTag,
}

/// Records whose sender or recipient tag matches any of the listed tags
#[derive(Clone, Debug, Default)]
pub struct ParticipantQuery {
    /// Match records sent by any of these tags
    pub senders: Vec<BlindTag>,
    /// Match records received by any of these tags
    pub recipients: Vec<BlindTag>,
}

/// Storage trait for block persistence
pub trait BlockStorage: Send + Sync {
    /// Record with the highest index
    fn tail(&self) -> Result<Option<BlockRecord>>;

    /// Record at `index`
    fn get(&self, index: u64) -> Result<Option<BlockRecord>>;

    /// All records ordered by index
    fn scan(&self) -> Result<Vec<BlockRecord>>;

    /// All records ordered by index, each decoded on its own so that one
    /// unreadable record does not hide the ones around it.
    ///
    /// The outer error is a storage failure; an inner error is a record
    /// that could not be decoded.
    fn walk(&self) -> Result<Vec<Result<BlockRecord>>> {
        Ok(self.scan()?.into_iter().map(Ok).collect())
    }

    /// Records matching the query, ordered by index
    fn participant_records(&self, query: &ParticipantQuery) -> Result<Vec<BlockRecord>>;

    /// Number of stored records
    fn len(&self) -> Result<u64>;

    /// Atomically store `record` as the new tail.
    ///
    /// Fails with [`LedgerError::Conflict`] unless the current tail index is
    /// exactly `record.index - 1` (or the store is empty for index 0) and no
    /// stored record already carries `record.hash`.
    fn commit(&self, record: &BlockRecord, tags: &RecordTags) -> Result<()>;

    /// Whether no records are stored
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Tail index a record must follow, `None` for genesis
fn expected_tail(index: u64) -> Option<u64> {
    index.checked_sub(1)
}

#[derive(Default)]
struct MemoryState {
    blocks: BTreeMap<u64, BlockRecord>,
    hashes: HashSet<String>,
    senders: HashMap<BlindTag, BTreeSet<u64>>,
    recipients: HashMap<BlindTag, BTreeSet<u64>>,
}

/// In-memory block storage (for testing and embedding)
#[derive(Default)]
pub struct MemoryBlockStorage {
    state: RwLock<MemoryState>,
}

impl MemoryBlockStorage {
    /// Create new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record at `record.index` in place, bypassing every
    /// append-only check. Only meant for corruption drills.
    pub fn overwrite(&self, record: BlockRecord) -> bool {
        let mut state = self.state.write();
        match state.blocks.get_mut(&record.index) {
            Some(slot) => {
                *slot = record;
                true
            }
            None => false,
        }
    }
}

impl BlockStorage for MemoryBlockStorage {
    fn tail(&self) -> Result<Option<BlockRecord>> {
        Ok(self.state.read().blocks.values().next_back().cloned())
    }

    fn get(&self, index: u64) -> Result<Option<BlockRecord>> {
        Ok(self.state.read().blocks.get(&index).cloned())
    }

    fn scan(&self) -> Result<Vec<BlockRecord>> {
        Ok(self.state.read().blocks.values().cloned().collect())
    }

    fn participant_records(&self, query: &ParticipantQuery) -> Result<Vec<BlockRecord>> {
        let state = self.state.read();
        let mut indices = BTreeSet::new();

        for tag in &query.senders {
            if let Some(set) = state.senders.get(tag) {
                indices.extend(set.iter().copied());
            }
        }
        for tag in &query.recipients {
            if let Some(set) = state.recipients.get(tag) {
                indices.extend(set.iter().copied());
            }
        }

        Ok(indices
            .into_iter()
            .filter_map(|index| state.blocks.get(&index).cloned())
            .collect())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.state.read().blocks.len() as u64)
    }

    fn commit(&self, record: &BlockRecord, tags: &RecordTags) -> Result<()> {
        let mut state = self.state.write();

        let tail = state.blocks.keys().next_back().copied();
        if tail != expected_tail(record.index)
            || state.blocks.contains_key(&record.index)
            || state.hashes.contains(&record.hash)
        {
            return Err(LedgerError::Conflict {
                index: record.index,
            });
        }

        state.hashes.insert(record.hash.clone());
        state.senders.entry(tags.sender).or_default().insert(record.index);
        state
            .recipients
            .entry(tags.recipient)
            .or_default()
            .insert(record.index);
        state.blocks.insert(record.index, record.clone());

        debug!("Stored block {} in memory", record.index);
        Ok(())
    }
}

const TAIL_KEY: &[u8] = b"tail";

/// Sled-based persistent storage
pub struct SledBlockStorage {
    db: sled::Db,
    /// index (big-endian) -> record
    blocks: sled::Tree,
    /// hash -> index
    hashes: sled::Tree,
    /// sender tag ++ index -> ()
    by_sender: sled::Tree,
    /// recipient tag ++ index -> ()
    by_recipient: sled::Tree,
    /// tail index
    meta: sled::Tree,
    flush_on_commit: bool,
}

impl SledBlockStorage {
    /// Open or create storage at path
    pub fn open<P: AsRef<Path>>(path: P, flush_on_commit: bool) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let db = sled::open(path)?;
        let storage = Self {
            blocks: db.open_tree("blocks")?,
            hashes: db.open_tree("hashes")?,
            by_sender: db.open_tree("by_sender")?,
            by_recipient: db.open_tree("by_recipient")?,
            meta: db.open_tree("meta")?,
            db,
            flush_on_commit,
        };

        info!(
            "Block storage opened at {:?} ({} blocks)",
            path,
            storage.blocks.len()
        );
        Ok(storage)
    }

    /// Open a throwaway database, removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            hashes: db.open_tree("hashes")?,
            by_sender: db.open_tree("by_sender")?,
            by_recipient: db.open_tree("by_recipient")?,
            meta: db.open_tree("meta")?,
            db,
            flush_on_commit: false,
        })
    }

    fn index_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn tag_key(tag: &BlindTag, index: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(tag.len() + 8);
        key.extend_from_slice(tag);
        key.extend_from_slice(&Self::index_key(index));
        key
    }

    fn decode_index(bytes: &[u8]) -> Option<u64> {
        let bytes: [u8; 8] = bytes.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    fn decode_record(key: &[u8], value: &[u8]) -> Result<BlockRecord> {
        bincode::deserialize(value).map_err(|e| LedgerError::Corrupt {
            index: Self::decode_index(key).unwrap_or_default(),
            reason: e.to_string(),
        })
    }

    fn collect_indices(tree: &sled::Tree, tag: &BlindTag, out: &mut BTreeSet<u64>) -> Result<()> {
        for entry in tree.scan_prefix(tag) {
            let (key, _) = entry?;
            if let Some(index) = Self::decode_index(&key[tag.len()..]) {
                out.insert(index);
            }
        }
        Ok(())
    }
}

impl BlockStorage for SledBlockStorage {
    fn tail(&self) -> Result<Option<BlockRecord>> {
        match self.blocks.last()? {
            Some((key, value)) => Ok(Some(Self::decode_record(&key, &value)?)),
            None => Ok(None),
        }
    }

    fn get(&self, index: u64) -> Result<Option<BlockRecord>> {
        let key = Self::index_key(index);
        match self.blocks.get(key)? {
            Some(value) => Ok(Some(Self::decode_record(&key, &value)?)),
            None => Ok(None),
        }
    }

    fn scan(&self) -> Result<Vec<BlockRecord>> {
        self.blocks
            .iter()
            .map(|entry| {
                let (key, value) = entry?;
                Self::decode_record(&key, &value)
            })
            .collect()
    }

    fn walk(&self) -> Result<Vec<Result<BlockRecord>>> {
        self.blocks
            .iter()
            .map(|entry| {
                let (key, value) = entry?;
                Ok(Self::decode_record(&key, &value))
            })
            .collect()
    }

    fn participant_records(&self, query: &ParticipantQuery) -> Result<Vec<BlockRecord>> {
        let mut indices = BTreeSet::new();
        for tag in &query.senders {
            Self::collect_indices(&self.by_sender, tag, &mut indices)?;
        }
        for tag in &query.recipients {
            Self::collect_indices(&self.by_recipient, tag, &mut indices)?;
        }

        let mut records = Vec::with_capacity(indices.len());
        for index in indices {
            if let Some(record) = self.get(index)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.blocks.len() as u64)
    }

    fn commit(&self, record: &BlockRecord, tags: &RecordTags) -> Result<()> {
        let value = bincode::serialize(record)?;
        let index_key = Self::index_key(record.index);
        let sender_key = Self::tag_key(&tags.sender, record.index);
        let recipient_key = Self::tag_key(&tags.recipient, record.index);
        let expected = expected_tail(record.index);

        let result = (
            &self.blocks,
            &self.hashes,
            &self.by_sender,
            &self.by_recipient,
            &self.meta,
        )
            .transaction(|(blocks, hashes, by_sender, by_recipient, meta)| {
                let tail = meta
                    .get(TAIL_KEY)?
                    .and_then(|bytes| Self::decode_index(&bytes));

                if tail != expected
                    || blocks.get(&index_key[..])?.is_some()
                    || hashes.get(record.hash.as_bytes())?.is_some()
                {
                    return Err(ConflictableTransactionError::Abort(LedgerError::Conflict {
                        index: record.index,
                    }));
                }

                blocks.insert(&index_key[..], value.clone())?;
                hashes.insert(record.hash.as_bytes(), &index_key[..])?;
                by_sender.insert(sender_key.clone(), &b""[..])?;
                by_recipient.insert(recipient_key.clone(), &b""[..])?;
                meta.insert(TAIL_KEY, &index_key[..])?;
                Ok(())
            });

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(e.into()),
        }

        if self.flush_on_commit {
            self.db.flush()?;
        }

        debug!("Stored block {} in sled", record.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(index: u64, hash: &str) -> BlockRecord {
        BlockRecord {
            index,
            timestamp: "2024-05-01T12:00:00.000Z".to_string(),
            from: "alice".to_string(),
            to: "bob".to_string(),
            payload: "ct".to_string(),
            prev_hash: "0".to_string(),
            hash: hash.to_string(),
        }
    }

    fn tags(sender: u8, recipient: u8) -> RecordTags {
        RecordTags {
            sender: [sender; 32],
            recipient: [recipient; 32],
        }
    }

    fn exercise_commit_rules(storage: &dyn BlockStorage) {
        assert!(storage.is_empty().unwrap());
        assert!(storage.tail().unwrap().is_none());

        // First record must be index 0
        assert!(matches!(
            storage.commit(&record(1, "h1"), &tags(1, 2)),
            Err(LedgerError::Conflict { index: 1 })
        ));

        storage.commit(&record(0, "h0"), &tags(9, 9)).unwrap();
        storage.commit(&record(1, "h1"), &tags(1, 2)).unwrap();

        // Same index twice
        assert!(matches!(
            storage.commit(&record(1, "other"), &tags(1, 2)),
            Err(LedgerError::Conflict { index: 1 })
        ));
        // Gap
        assert!(storage.commit(&record(3, "h3"), &tags(1, 2)).is_err());
        // Duplicate hash
        assert!(storage.commit(&record(2, "h1"), &tags(1, 2)).is_err());

        storage.commit(&record(2, "h2"), &tags(2, 1)).unwrap();

        assert_eq!(storage.len().unwrap(), 3);
        assert_eq!(storage.tail().unwrap().unwrap().index, 2);
        assert_eq!(storage.get(1).unwrap().unwrap().hash, "h1");
        assert!(storage.get(7).unwrap().is_none());

        let indices: Vec<u64> = storage.scan().unwrap().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    fn exercise_participant_query(storage: &dyn BlockStorage) {
        storage.commit(&record(0, "h0"), &tags(9, 8)).unwrap();
        storage.commit(&record(1, "h1"), &tags(1, 2)).unwrap();
        storage.commit(&record(2, "h2"), &tags(3, 4)).unwrap();
        storage.commit(&record(3, "h3"), &tags(2, 1)).unwrap();

        let query = ParticipantQuery {
            senders: vec![[1; 32], [9; 32]],
            recipients: vec![[1; 32]],
        };
        let indices: Vec<u64> = storage
            .participant_records(&query)
            .unwrap()
            .iter()
            .map(|r| r.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 3]);

        let nobody = ParticipantQuery {
            senders: vec![[7; 32]],
            recipients: vec![[7; 32]],
        };
        assert!(storage.participant_records(&nobody).unwrap().is_empty());
    }

    #[test]
    fn test_memory_commit_rules() {
        exercise_commit_rules(&MemoryBlockStorage::new());
    }

    #[test]
    fn test_memory_participant_query() {
        exercise_participant_query(&MemoryBlockStorage::new());
    }

    #[test]
    fn test_memory_overwrite() {
        let storage = MemoryBlockStorage::new();
        storage.commit(&record(0, "h0"), &tags(9, 9)).unwrap();

        let mut edited = record(0, "h0");
        edited.payload = "edited".to_string();
        assert!(storage.overwrite(edited));
        assert_eq!(storage.get(0).unwrap().unwrap().payload, "edited");
        assert!(!storage.overwrite(record(5, "h5")));
    }

    #[test]
    fn test_sled_commit_rules() {
        let dir = tempdir().unwrap();
        let storage = SledBlockStorage::open(dir.path(), true).unwrap();
        exercise_commit_rules(&storage);
    }

    #[test]
    fn test_sled_participant_query() {
        exercise_participant_query(&SledBlockStorage::temporary().unwrap());
    }

    #[test]
    fn test_sled_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = SledBlockStorage::open(dir.path(), true).unwrap();
            storage.commit(&record(0, "h0"), &tags(9, 9)).unwrap();
            storage.commit(&record(1, "h1"), &tags(1, 2)).unwrap();
        }

        let storage = SledBlockStorage::open(dir.path(), true).unwrap();
        assert_eq!(storage.len().unwrap(), 2);
        assert_eq!(storage.tail().unwrap().unwrap().hash, "h1");
        storage.commit(&record(2, "h2"), &tags(1, 2)).unwrap();
    }

    #[test]
    fn test_sled_corrupt_record() {
        let storage = SledBlockStorage::temporary().unwrap();
        storage.commit(&record(0, "h0"), &tags(9, 9)).unwrap();
        storage
            .blocks
            .insert(SledBlockStorage::index_key(0), &b"garbage"[..])
            .unwrap();

        assert!(matches!(
            storage.scan(),
            Err(LedgerError::Corrupt { index: 0, .. })
        ));
    }

    #[test]
    fn test_sled_walk_isolates_corrupt_record() {
        let storage = SledBlockStorage::temporary().unwrap();
        for index in 0..3 {
            storage
                .commit(&record(index, &format!("h{}", index)), &tags(1, 2))
                .unwrap();
        }
        storage
            .blocks
            .insert(SledBlockStorage::index_key(1), &b"garbage"[..])
            .unwrap();

        let walked = storage.walk().unwrap();
        assert_eq!(walked.len(), 3);
        assert_eq!(walked[0].as_ref().unwrap().hash, "h0");
        assert!(matches!(walked[1], Err(LedgerError::Corrupt { index: 1, .. })));
        assert_eq!(walked[2].as_ref().unwrap().hash, "h2");
    }

    #[test]
    fn test_big_endian_keys_sort_numerically() {
        let storage = SledBlockStorage::temporary().unwrap();
        let mut prev = "0".to_string();
        for index in 0..300u64 {
            let mut r = record(index, &format!("h{}", index));
            r.prev_hash = prev.clone();
            prev = r.hash.clone();
            storage.commit(&r, &tags(1, 2)).unwrap();
        }

        assert_eq!(storage.tail().unwrap().unwrap().index, 299);
        let indices: Vec<u64> = storage.scan().unwrap().iter().map(|r| r.index).collect();
        assert_eq!(indices, (0..300).collect::<Vec<_>>());
    }
}
