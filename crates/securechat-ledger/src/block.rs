//! Ledger block

use serde::{Deserialize, Serialize};

use crate::hash::calculate_hash;
use crate::{
    BROADCAST_IDENTITY, GENESIS_INDEX, GENESIS_PAYLOAD, GENESIS_PREV_HASH, SYSTEM_IDENTITY,
};

/// One immutable ledger record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Position in the chain, contiguous from 0
    pub index: u64,
    /// ISO-8601 creation time, captured once
    pub timestamp: String,
    /// Sender identity
    pub from: String,
    /// Recipient identity
    pub to: String,
    /// Opaque end-to-end encrypted payload
    pub payload: String,
    /// Hash of the preceding block, `"0"` for genesis
    pub prev_hash: String,
    /// Hash over all of the fields above
    pub hash: String,
}

impl Block {
    /// Build a block and compute its hash
    pub fn new(
        index: u64,
        timestamp: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: impl Into<String>,
        prev_hash: impl Into<String>,
    ) -> Self {
        let mut block = Self {
            index,
            timestamp: timestamp.into(),
            from: from.into(),
            to: to.into(),
            payload: payload.into(),
            prev_hash: prev_hash.into(),
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Build the genesis block for the given timestamp
    pub fn genesis(timestamp: impl Into<String>) -> Self {
        Self::new(
            GENESIS_INDEX,
            timestamp,
            SYSTEM_IDENTITY,
            BROADCAST_IDENTITY,
            GENESIS_PAYLOAD,
            GENESIS_PREV_HASH,
        )
    }

    /// Build the successor of `prev`
    pub fn successor(
        prev_index: u64,
        prev_hash: &str,
        timestamp: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(prev_index + 1, timestamp, from, to, payload, prev_hash)
    }

    /// Recompute the hash from the stored fields
    pub fn compute_hash(&self) -> String {
        calculate_hash(
            self.index,
            &self.timestamp,
            &self.from,
            &self.to,
            &self.payload,
            &self.prev_hash,
        )
    }

    /// Check that the stored hash matches the fields
    pub fn has_valid_hash(&self) -> bool {
        self.compute_hash() == self.hash
    }

    /// Whether this is the index-0 block
    pub fn is_genesis(&self) -> bool {
        self.index == GENESIS_INDEX
    }

    /// Whether `identity` sent or received this block
    pub fn involves(&self, identity: &str) -> bool {
        self.from == identity || self.to == identity
    }

    /// Whether the block belongs in `identity`'s participant view
    pub fn visible_to(&self, identity: &str) -> bool {
        self.involves(identity) || self.from == SYSTEM_IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis() {
        let genesis = Block::genesis("2024-05-01T12:00:00.000Z");

        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.from, "system");
        assert_eq!(genesis.to, "all");
        assert_eq!(genesis.payload, "Genesis Block");
        assert_eq!(genesis.prev_hash, "0");
        assert!(genesis.is_genesis());
        assert!(genesis.has_valid_hash());
    }

    #[test]
    fn test_successor_links() {
        let genesis = Block::genesis("2024-05-01T12:00:00.000Z");
        let next = Block::successor(
            genesis.index,
            &genesis.hash,
            "2024-05-01T12:00:01.000Z",
            "alice",
            "bob",
            "ct1",
        );

        assert_eq!(next.index, 1);
        assert_eq!(next.prev_hash, genesis.hash);
        assert!(next.has_valid_hash());
    }

    #[test]
    fn test_edit_breaks_hash() {
        let mut block = Block::new(4, "2024-05-01T12:00:00.000Z", "alice", "bob", "ct", "ff");
        block.payload.push('!');
        assert!(!block.has_valid_hash());
    }

    #[test]
    fn test_visibility() {
        let genesis = Block::genesis("t");
        let block = Block::new(1, "t", "alice", "bob", "ct", &genesis.hash);

        assert!(genesis.visible_to("carol"));
        assert!(block.visible_to("alice"));
        assert!(block.visible_to("bob"));
        assert!(!block.visible_to("carol"));
    }

    #[test]
    fn test_json_field_names() {
        let block = Block::genesis("2024-05-01T12:00:00.000Z");
        let json = serde_json::to_value(&block).unwrap();

        assert_eq!(json["prevHash"], "0");
        assert_eq!(json["from"], "system");
        assert!(json.get("prev_hash").is_none());
    }
}
