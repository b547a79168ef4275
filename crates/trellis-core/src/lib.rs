//! trellis-core — Persistent Copy-on-Write Radix Trie Storage Engine
//!
//! A key-value map with ordered iteration, multi-version snapshots and
//! crash-consistent persistence, backed by two memory-mapped files.
//!
//! # Architecture
//!
//! - **Trie**: a 64-ary radix trie over 6-bit key nibbles; nodes are shared
//!   across revisions through reference-counted copy-on-write
//! - **Id directory**: maps 40-bit object ids to payload locations, holds
//!   refcounts, move-locks and the free list
//! - **Region allocator**: bump allocation inside fixed-size regions of a
//!   mapped file; a background evacuator repacks sparse regions
//! - **Sessions**: readers pin a root revision and never block the writer;
//!   the single writer mutates a private root and publishes it atomically
//!
//! # Crash safety
//!
//! Every structure that matters lives in the mapped files: the published
//! root, the slot array, the relocation queue. Reopening after a kill clears
//! stale move-locks, reconciles the queue, and (on request) replays an
//! interrupted mark-and-sweep, after which the last published revision is
//! intact and every refcount invariant holds.

pub mod config;
pub mod database;
pub mod directory;
pub mod error;
pub mod gc;
pub mod key;
pub mod mapping;
pub mod node;
pub mod region;
pub mod session;
pub mod write;

// Re-export key types for convenience
pub use config::Config;
pub use database::{Database, DatabaseStats};
pub use directory::{ObjectId, ObjectLocation};
pub use error::{TrellisError, TrellisResult};
pub use mapping::AccessMode;
pub use node::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use session::{Cursor, ReadSession};
pub use write::WriteSession;
