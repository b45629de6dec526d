//! The document store contract the indexing engine consumes.
//!
//! The engine never owns documents: it reads them, and their tombstones,
//! from a [`DocumentSource`] supplied by the host database. All progress
//! accounting is in terms of the etags the store assigns; the engine only
//! assumes they are 64-bit and monotonically increasing across writes and
//! deletes alike.

mod mem;

pub use mem::MemoryDocumentStore;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use revision::revisioned;
use serde::{Deserialize, Serialize};

/// A monotonic change sequence number assigned by the document store.
pub type Etag = u64;

/// A case-insensitive collection identifier.
///
/// The original spelling is retained for display; comparison, hashing,
/// ordering and key encoding all use the lowercase form.
#[revisioned(revision = 1)]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionName {
	name: String,
	lower: String,
}

impl CollectionName {
	pub fn new(name: impl Into<String>) -> Self {
		let name = name.into();
		let lower = name.to_lowercase();
		Self { name, lower }
	}

	/// The collection name as originally spelled.
	pub fn as_str(&self) -> &str {
		&self.name
	}

	/// The lowercase form used for comparison and key encoding.
	pub fn lowered(&self) -> &str {
		&self.lower
	}
}

impl fmt::Display for CollectionName {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(&self.name)
	}
}

impl PartialEq for CollectionName {
	fn eq(&self, other: &Self) -> bool {
		self.lower == other.lower
	}
}

impl Eq for CollectionName {}

impl Hash for CollectionName {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.lower.hash(state)
	}
}

impl PartialOrd for CollectionName {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for CollectionName {
	fn cmp(&self, other: &Self) -> Ordering {
		self.lower.cmp(&other.lower)
	}
}

impl From<&str> for CollectionName {
	fn from(name: &str) -> Self {
		Self::new(name)
	}
}

/// A document as served by the document store.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Document {
	/// The document key, unique within the store
	pub key: String,
	/// The collection the document belongs to
	pub collection: CollectionName,
	/// The etag assigned to this version of the document
	pub etag: Etag,
	/// The source content the map function projects from
	pub fields: HashMap<String, String>,
}

impl Document {
	/// An estimate of the document's size in bytes, used for batch budgets.
	pub fn size(&self) -> usize {
		self.key.len() + self.fields.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
	}
}

/// The marker of a deleted document.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Tombstone {
	/// The key of the deleted document
	pub key: String,
	/// The collection the document belonged to
	pub collection: CollectionName,
	/// The etag assigned to the deletion itself
	pub etag: Etag,
	/// The etag the document last had
	pub doc_etag: Etag,
}

/// A source of documents and tombstones, typically the host database.
#[async_trait]
pub trait DocumentSource: Send + Sync + 'static {
	/// Acquire a scoped operation context pinned to the store's current
	/// state.
	async fn context(&self) -> Result<Box<dyn DocumentContext>>;
}

/// A scoped, point-in-time view of the document store.
///
/// All readers answer from the pinned state; [`reset`](Self::reset)
/// re-pins to the store's current state. Contexts are released by drop.
pub trait DocumentContext: Send + Sync {
	/// The highest document etag in a collection.
	fn last_document_etag(&self, collection: &CollectionName) -> Etag;

	/// The highest tombstone etag in a collection.
	fn last_tombstone_etag(&self, collection: &CollectionName) -> Etag;

	/// Documents of a collection with an etag above `after`, ascending.
	fn documents_after(
		&self,
		collection: &CollectionName,
		after: Etag,
		limit: usize,
	) -> Vec<Arc<Document>>;

	/// Tombstones of a collection with an etag above `after`, ascending.
	fn tombstones_after(
		&self,
		collection: &CollectionName,
		after: Etag,
		limit: usize,
	) -> Vec<Arc<Tombstone>>;

	/// Tombstones of a collection whose deleted document's etag is at or
	/// below the cutoff.
	fn tombstones_with_doc_etag_below(
		&self,
		collection: &CollectionName,
		cutoff: Etag,
	) -> Vec<Arc<Tombstone>>;

	/// Re-pin the context to the store's current state.
	fn reset(&mut self) -> Result<()>;
}
