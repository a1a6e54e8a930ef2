//! Chain store: the single source of truth for chain order

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::codec::{FieldCodec, PlainCodec};
use crate::config::{LedgerConfig, RetryConfig};
use crate::error::{LedgerError, Result};
use crate::hash::now_timestamp;
use crate::storage::{
    BlockRecord, BlockStorage, MemoryBlockStorage, ParticipantQuery, RecordTags, SledBlockStorage,
};
use crate::validator::{ChainValidator, Validation};
use crate::{DEFAULT_MAX_PAYLOAD_BYTES, SYSTEM_IDENTITY};

/// Append-only store of ledger blocks
pub struct ChainStore {
    /// Persistent storage
    storage: Arc<dyn BlockStorage>,
    /// Codec applied to sender, recipient and payload
    codec: Arc<dyn FieldCodec>,
    /// Serializes tail-read-then-commit within this process
    writer: Mutex<()>,
    retry: RetryConfig,
    max_payload_bytes: usize,
}

impl ChainStore {
    /// Create a store over the given storage and codec
    pub fn new(storage: Arc<dyn BlockStorage>, codec: Arc<dyn FieldCodec>) -> Self {
        Self {
            storage,
            codec,
            writer: Mutex::new(()),
            retry: RetryConfig::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Create an in-memory store with plain fields
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlockStorage::new()), Arc::new(PlainCodec))
    }

    /// Open a sled-backed store as configured
    pub fn open(config: &LedgerConfig) -> Result<Self> {
        config.validate()?;

        let storage = SledBlockStorage::open(&config.storage_path, config.flush_on_append)?;
        let codec = config.codec.build()?;
        info!("Chain store using {} field codec", codec.name());

        Ok(Self::new(Arc::new(storage), codec)
            .with_retry(config.retry.clone())
            .with_max_payload_bytes(config.max_payload_bytes))
    }

    /// Set the conflict retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the payload size limit
    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    /// Create the genesis block if the store is empty.
    ///
    /// Returns the new genesis block, or `None` when the chain already
    /// existed. Must complete before any [`append`](Self::append).
    pub fn initialize(&self) -> Result<Option<Block>> {
        let _writer = self.writer.lock();

        if let Some(existing) = self.storage.get(crate::GENESIS_INDEX)? {
            self.check_codec(&existing)?;
            debug!("Chain already initialized ({} blocks)", self.storage.len()?);
            return Ok(None);
        }

        let genesis = Block::genesis(now_timestamp());
        self.commit(&genesis)?;

        info!(hash = %genesis.hash, "Genesis block created");
        Ok(Some(genesis))
    }

    /// Whether the genesis block exists
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(!self.storage.is_empty()?)
    }

    /// Append a message block after the current tail.
    ///
    /// Conflicting commits are retried against a freshly read tail; once the
    /// retry budget is spent the caller gets [`LedgerError::RetriesExhausted`].
    ///
    /// # Errors
    ///
    /// * [`LedgerError::NotInitialized`] before [`initialize`](Self::initialize)
    /// * [`LedgerError::InvalidInput`] for an empty sender or recipient, the
    ///   reserved `system` sender, or a payload over the size limit
    /// * [`LedgerError::RetriesExhausted`] when conflicts outlast the retry policy
    pub fn append(&self, from: &str, to: &str, payload: &str) -> Result<Block> {
        self.check_input(from, to, payload)?;

        let _writer = self.writer.lock();
        let mut attempt = 0;

        loop {
            match self.try_append(from, to, payload) {
                Ok(block) => {
                    info!(
                        index = block.index,
                        from = %block.from,
                        to = %block.to,
                        "Message block committed"
                    );
                    return Ok(block);
                }
                Err(LedgerError::Conflict { index }) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(index, attempt, "Append conflict, retrying in {:?}", delay);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(LedgerError::Conflict { index }) => {
                    warn!(index, "Append conflict, retries exhausted");
                    return Err(LedgerError::RetriesExhausted {
                        attempts: attempt + 1,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// All blocks ordered by index
    pub fn full_chain(&self) -> Result<Vec<Block>> {
        self.storage
            .scan()?
            .into_iter()
            .map(|record| self.decode(record))
            .collect()
    }

    /// Every stored block in index order, decoded one at a time.
    ///
    /// Unlike [`full_chain`](Self::full_chain), an unreadable record shows
    /// up as an `Err(LedgerError::Corrupt)` entry in place.
    pub fn blocks(&self) -> Result<Vec<Result<Block>>> {
        Ok(self
            .storage
            .walk()?
            .into_iter()
            .map(|record| record.and_then(|record| self.decode(record)))
            .collect())
    }

    /// Blocks sent or received by `identity`, plus every system block,
    /// ordered by index
    pub fn chain_for_participant(&self, identity: &str) -> Result<Vec<Block>> {
        let query = ParticipantQuery {
            senders: vec![self.codec.blind(identity), self.codec.blind(SYSTEM_IDENTITY)],
            recipients: vec![self.codec.blind(identity)],
        };

        self.storage
            .participant_records(&query)?
            .into_iter()
            .map(|record| self.decode(record))
            // Blind tags are digests; confirm on the decoded values
            .filter(|block| match block {
                Ok(block) => block.visible_to(identity),
                Err(_) => true,
            })
            .collect()
    }

    /// Block with the highest index
    pub fn tail(&self) -> Result<Option<Block>> {
        self.storage
            .tail()?
            .map(|record| self.decode(record))
            .transpose()
    }

    /// Block at `index`
    pub fn block(&self, index: u64) -> Result<Option<Block>> {
        self.storage
            .get(index)?
            .map(|record| self.decode(record))
            .transpose()
    }

    /// Number of blocks in the chain
    pub fn len(&self) -> Result<u64> {
        self.storage.len()
    }

    /// Whether the chain has no blocks yet
    pub fn is_empty(&self) -> Result<bool> {
        self.storage.is_empty()
    }

    /// Run the chain validator over the stored chain
    pub fn validate(&self) -> Result<Validation> {
        ChainValidator::new(self).validate()
    }

    fn try_append(&self, from: &str, to: &str, payload: &str) -> Result<Block> {
        let tail = self.storage.tail()?.ok_or(LedgerError::NotInitialized)?;

        let block = Block::successor(tail.index, &tail.hash, now_timestamp(), from, to, payload);
        self.commit(&block)?;
        Ok(block)
    }

    fn commit(&self, block: &Block) -> Result<()> {
        let record = BlockRecord {
            index: block.index,
            timestamp: block.timestamp.clone(),
            from: self.codec.encode(&block.from)?,
            to: self.codec.encode(&block.to)?,
            payload: self.codec.encode(&block.payload)?,
            prev_hash: block.prev_hash.clone(),
            hash: block.hash.clone(),
        };
        let tags = RecordTags {
            sender: self.codec.blind(&block.from),
            recipient: self.codec.blind(&block.to),
        };

        self.storage.commit(&record, &tags)
    }

    fn decode(&self, record: BlockRecord) -> Result<Block> {
        let corrupt = |e: LedgerError| LedgerError::Corrupt {
            index: record.index,
            reason: e.to_string(),
        };

        Ok(Block {
            from: self.codec.decode(&record.from).map_err(corrupt)?,
            to: self.codec.decode(&record.to).map_err(corrupt)?,
            payload: self.codec.decode(&record.payload).map_err(corrupt)?,
            index: record.index,
            timestamp: record.timestamp,
            prev_hash: record.prev_hash,
            hash: record.hash,
        })
    }

    /// Reject opening a chain written under a different field codec
    fn check_codec(&self, genesis: &BlockRecord) -> Result<()> {
        match self.codec.decode(&genesis.from) {
            Ok(from) if from == SYSTEM_IDENTITY => Ok(()),
            _ => Err(LedgerError::Config(format!(
                "stored chain is not readable with the {} field codec",
                self.codec.name()
            ))),
        }
    }

    fn check_input(&self, from: &str, to: &str, payload: &str) -> Result<()> {
        if from.trim().is_empty() || to.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "sender and recipient must not be empty".to_string(),
            ));
        }
        if from == SYSTEM_IDENTITY {
            return Err(LedgerError::InvalidInput(format!(
                "'{}' is a reserved sender",
                SYSTEM_IDENTITY
            )));
        }
        if payload.len() > self.max_payload_bytes {
            return Err(LedgerError::InvalidInput(format!(
                "payload of {} bytes exceeds maximum {}",
                payload.len(),
                self.max_payload_bytes
            )));
        }
        Ok(())
    }
}
