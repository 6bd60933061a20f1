//! Ember Core - metabolism, policy, receipts and seeds
//!
//! Everything in this crate is synchronous and owns no threads. The daemon
//! crate wraps these types in its single mutation boundary.

pub mod crypto;
pub mod error;
pub mod metabolism;
pub mod policy;
pub mod receipt;
pub mod snapshot;
pub mod types;

pub use crypto::{sha256, Digest32, Identity, TrustedKey};
pub use error::{DeathKind, Error, ImportError, Result};
pub use metabolism::{MetabolismConfig, ResourceLedger};
pub use policy::{PolicyConfig, PolicySelector};
pub use receipt::{
    ChainFault, JsonlSink, MemorySink, Receipt, ReceiptChain, ReceiptKind, ReceiptPayload,
    ReceiptSink, read_jsonl, GENESIS_HASH,
};
pub use snapshot::{MindSeed, SeedBody, SnapshotCodec, SEED_FORMAT, SEED_SCHEMA_VERSION};
pub use types::*;
