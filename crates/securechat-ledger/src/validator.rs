//! Chain validator
//!
//! Walks the chain in index order and stops at the first offending block.
//! A broken chain is a normal, structured result ([`Validation::Invalid`]);
//! only storage failures surface as errors. Validation never writes.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::block::Block;
use crate::error::{LedgerError, Result};
use crate::store::ChainStore;
use crate::{GENESIS_INDEX, GENESIS_PREV_HASH};

/// Why a block failed validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidReason {
    /// Index does not follow its predecessor
    IndexGap {
        /// Index the position called for
        expected: u64,
        /// Index actually stored
        found: u64,
    },
    /// `prevHash` does not match the predecessor's hash
    PrevHashMismatch,
    /// Stored hash does not match the recomputed one
    HashInvalid,
    /// Record could not be decoded
    Unreadable(String),
}

/// Outcome of a chain validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Validation {
    /// Every block checked out
    Valid,
    /// First offending block
    Invalid {
        /// Position in the chain
        position: u64,
        /// Failure reason
        reason: InvalidReason,
    },
}

impl Validation {
    /// Whether the chain is intact
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }

    /// Position of the first offending block
    pub fn position(&self) -> Option<u64> {
        match self {
            Validation::Valid => None,
            Validation::Invalid { position, .. } => Some(*position),
        }
    }

    fn invalid(position: u64, reason: InvalidReason) -> Self {
        warn!(position, ?reason, "Chain integrity failure");
        Validation::Invalid { position, reason }
    }
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validation::Valid => write!(f, "chain valid"),
            Validation::Invalid { position, reason } => match reason {
                InvalidReason::IndexGap { expected, found } => write!(
                    f,
                    "index gap at position {}: expected {}, found {}",
                    position, expected, found
                ),
                InvalidReason::PrevHashMismatch => {
                    write!(f, "prevHash mismatch at position {}", position)
                }
                InvalidReason::HashInvalid => write!(f, "hash invalid at position {}", position),
                InvalidReason::Unreadable(detail) => {
                    write!(f, "record unreadable at position {}: {}", position, detail)
                }
            },
        }
    }
}

/// Wire form of a validation: `{"valid": true}` or
/// `{"valid": false, "error": "...", "position": n}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether the chain is intact
    pub valid: bool,
    /// Description of the first failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Position of the first failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
}

impl From<&Validation> for ValidationReport {
    fn from(validation: &Validation) -> Self {
        match validation {
            Validation::Valid => Self {
                valid: true,
                error: None,
                position: None,
            },
            Validation::Invalid { position, .. } => Self {
                valid: false,
                error: Some(validation.to_string()),
                position: Some(*position),
            },
        }
    }
}

/// Validates the chain held by a [`ChainStore`]
pub struct ChainValidator<'a> {
    store: &'a ChainStore,
}

impl<'a> ChainValidator<'a> {
    /// Validator over `store`
    pub fn new(store: &'a ChainStore) -> Self {
        Self { store }
    }

    /// Walk the stored chain and validate it
    pub fn validate(&self) -> Result<Validation> {
        let validation = validate_entries(self.store.blocks()?)?;

        if validation.is_valid() {
            info!("Chain integrity verified");
        }
        Ok(validation)
    }
}

/// Validate an ordered sequence of blocks.
///
/// The genesis block must sit at index 0 with `prevHash == "0"` and a hash
/// that recomputes. Every later block must follow its predecessor's index by
/// one, carry its predecessor's hash, and have a hash that recomputes.
pub fn validate_blocks(chain: &[Block]) -> Validation {
    let mut prev = None;
    for (position, block) in chain.iter().enumerate() {
        if let Some(reason) = check_link(prev, block) {
            return Validation::invalid(position as u64, reason);
        }
        prev = Some(block);
    }
    Validation::Valid
}

/// Validate blocks as they are read, in index order.
///
/// An entry that failed with [`LedgerError::Corrupt`] is reported as
/// [`InvalidReason::Unreadable`] at its position, but only once every block
/// before it has passed. Any other error aborts the walk.
pub fn validate_entries<I>(entries: I) -> Result<Validation>
where
    I: IntoIterator<Item = Result<Block>>,
{
    let mut prev: Option<Block> = None;
    for (position, entry) in entries.into_iter().enumerate() {
        let position = position as u64;
        let block = match entry {
            Ok(block) => block,
            Err(LedgerError::Corrupt { reason, .. }) => {
                return Ok(Validation::invalid(position, InvalidReason::Unreadable(reason)))
            }
            Err(e) => return Err(e),
        };

        if let Some(reason) = check_link(prev.as_ref(), &block) {
            return Ok(Validation::invalid(position, reason));
        }
        prev = Some(block);
    }
    Ok(Validation::Valid)
}

/// Check `block` against its predecessor, or as genesis when there is none
fn check_link(prev: Option<&Block>, block: &Block) -> Option<InvalidReason> {
    let expected = prev.map_or(GENESIS_INDEX, |prev| prev.index + 1);
    if block.index != expected {
        return Some(InvalidReason::IndexGap {
            expected,
            found: block.index,
        });
    }

    let expected_prev_hash = prev.map_or(GENESIS_PREV_HASH, |prev| prev.hash.as_str());
    if block.prev_hash != expected_prev_hash {
        return Some(InvalidReason::PrevHashMismatch);
    }
    if !block.has_valid_hash() {
        return Some(InvalidReason::HashInvalid);
    }
    None
}
