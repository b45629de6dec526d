//! The transactional storage environment backing one index.
//!
//! Every index owns exactly one [`Environment`]: a snapshot-isolated
//! key-value store with a single writer at a time. An environment is either
//! memory-only or bound to a filesystem path, in which case the committed
//! snapshot is persisted atomically on every commit and reloaded on open.
//! The full-text entries and the index metadata live in the same
//! environment so that a single commit covers both.

mod ds;
mod tx;

pub use ds::Environment;
pub use tx::{Snapshot, Transaction, TransactionType};

/// The key part of a key-value pair. An alias for [`Vec<u8>`].
pub type Key = Vec<u8>;

/// The value part of a key-value pair. An alias for [`Vec<u8>`].
pub type Val = Vec<u8>;
