use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use revision::revisioned;
use serde::{Deserialize, Serialize};

use crate::doc::{CollectionName, Etag};
use crate::idx::definition::{IndexPriority, LockMode};

/// Milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// The cumulative counters persisted for an index.
#[revisioned(revision = 1)]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct IndexingStats {
	/// Committed batches over the lifetime of the index
	pub batches: u64,
	/// Documents the map function was invoked for
	pub maps_attempted: u64,
	/// Documents that produced an entry
	pub maps_succeeded: u64,
	/// Tombstones processed into entry deletions
	pub documents_deleted: u64,
	/// Batch-level failures recorded in the error ring
	pub indexing_errors: u64,
	/// Per-document analyzer failures
	pub analyzer_errors: u64,
	/// When the last batch finished, in epoch milliseconds; 0 = never
	pub last_indexing_time: u64,
	/// The next error-ring sequence number
	pub(crate) error_seq: u64,
}

/// One recorded indexing failure.
#[revisioned(revision = 1)]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct IndexingError {
	/// When the failure was recorded, in epoch milliseconds
	pub timestamp: u64,
	/// What the index was doing, e.g. `"Map"` or `"Write"`
	pub action: String,
	/// The failure rendered as text
	pub message: String,
}

/// The counters accumulated by a single batch.
#[derive(Debug, Default)]
pub(crate) struct BatchStats {
	pub(crate) maps_attempted: u64,
	pub(crate) maps_succeeded: u64,
	pub(crate) documents_deleted: u64,
	pub(crate) analyzer_errors: u64,
	pub(crate) bytes_processed: usize,
	/// Failures to append to the persisted ring, as (action, message)
	pub(crate) errors: Vec<(String, String)>,
}

impl BatchStats {
	pub(crate) fn record_error(&mut self, action: &str, message: impl ToString) {
		self.errors.push((action.to_string(), message.to_string()));
	}
}

/// A point-in-time statistics snapshot of one index.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct IndexStats {
	pub name: String,
	pub priority: IndexPriority,
	pub lock_mode: LockMode,
	/// Entries currently visible to the searcher
	pub entries_count: u64,
	/// The persisted cumulative counters
	pub indexing: IndexingStats,
	/// When the index last answered a query, in epoch milliseconds
	pub last_querying_time: Option<u64>,
	/// Whether a batch is running right now
	pub indexing_in_progress: bool,
	/// Consecutive non-transient write failures since the last good batch
	pub write_errors: u32,
	pub last_mapped_etags: BTreeMap<CollectionName, Etag>,
	pub last_processed_tombstone_etags: BTreeMap<CollectionName, Etag>,
}
