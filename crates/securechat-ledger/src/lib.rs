//! # SecureChat Ledger
//!
//! Append-only, hash-linked record of every message exchanged through
//! SecureChat. Each block commits to its predecessor by SHA-256, so any
//! edit to a stored block is detectable by re-walking the chain.
//!
//! ## Features
//!
//! - **Single-writer append**: appends are serialized and committed with a
//!   conditional insert on the expected tail
//! - **Participant views**: per-identity projections rooted at the genesis block
//! - **Integrity checking**: detect tampering, gaps and unreadable records
//! - **Encryption at rest**: optional field codec for sender, recipient and payload

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod block;
pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod storage;
pub mod store;
pub mod validator;

pub use block::Block;
pub use codec::{AesGcmCodec, FieldCodec, PlainCodec};
pub use config::{CodecConfig, LedgerConfig, RetryConfig};
pub use error::{LedgerError, Result};
pub use storage::{BlockStorage, MemoryBlockStorage, SledBlockStorage};
pub use store::ChainStore;
pub use validator::{
    validate_blocks, validate_entries, ChainValidator, InvalidReason, Validation, ValidationReport,
};

/// Index of the genesis block
pub const GENESIS_INDEX: u64 = 0;

/// `prevHash` recorded on the genesis block
pub const GENESIS_PREV_HASH: &str = "0";

/// Payload of the genesis block
pub const GENESIS_PAYLOAD: &str = "Genesis Block";

/// Sender identity of system-authored blocks
pub const SYSTEM_IDENTITY: &str = "system";

/// Recipient identity of the genesis block
pub const BROADCAST_IDENTITY: &str = "all";

/// Default upper bound on an opaque payload, in bytes
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;
