//! # arbokv
//!
//! An embedded, single-writer/many-reader, ACID-capable ordered
//! key-value store built on a copy-on-write radix trie laid out in a
//! segmented, memory-mapped address space with background compaction.
//!
//! ## Architecture
//!
//! - `segment`: the segment block allocator and per-session bump log
//! - `cbt`: the control-block table, COW relocation's indirection layer
//! - `compactor`: background segment compaction
//! - `cache`: `mlock`'d read-cache pinning and read-bit decay
//! - `node`: inner/inner-prefix/leaf/value node formats
//! - `trie`: the mutation engine and point lookups
//! - `txn`: read and write transactions over the top-root table
//! - `epoch`: the read-lock queue shared by the segment log, compactor,
//!   and transactions
//! - `registry`: the process-wide database-instance registry
//! - `database`: the top-level [`Database`] handle wiring all of the above

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod cbt;
pub mod compactor;
pub mod config;
pub mod database;
pub mod epoch;
pub mod error;
pub mod node;
pub mod registry;
pub mod segment;
pub mod trie;
pub mod txn;

pub use cbt::Address;
pub use config::{Config, SyncMode};
pub use database::Database;
pub use error::{AllocError, Error, Result, TrieError, TxnError};
pub use txn::{ReadTxn, WriteTxn};

/// Crate version, as declared in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as declared in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
