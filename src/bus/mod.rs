//! The notification bus connecting the document store, the indexes, and
//! any observers the host wires up.
//!
//! Document-change notifications wake the indexing loops of the indexes
//! that map the changed collection. Index-change notifications carry batch
//! completions and priority transitions; an index also listens to them to
//! stop itself when it observes that it was marked as errored.

use tokio::sync::broadcast;

use crate::doc::{CollectionName, Etag};

/// The default buffer size of the bus channels.
const BUS_CAPACITY: usize = 1024;

/// The kind of an index-change notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum IndexChangeKind {
	BatchCompleted,
	IndexDemotedToIdle,
	IndexDemotedToDisabled,
	IndexPromotedFromIdle,
	IndexMarkedAsErrored,
}

/// A notification that an index changed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct IndexChange {
	/// The name of the index concerned
	pub name: String,
	/// What happened to it
	pub kind: IndexChangeKind,
}

/// The kind of a document-change notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DocumentChangeKind {
	Put,
	Delete,
}

/// A notification that a document changed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct DocumentChange {
	/// The collection the document belongs to
	pub collection: CollectionName,
	/// The document key
	pub key: String,
	/// The etag assigned to the change
	pub etag: Etag,
	/// Whether the document was written or deleted
	pub kind: DocumentChangeKind,
}

/// A broadcast bus for change notifications.
pub struct Bus {
	documents: broadcast::Sender<DocumentChange>,
	indexes: broadcast::Sender<IndexChange>,
}

impl Default for Bus {
	fn default() -> Self {
		Self::new()
	}
}

impl Bus {
	pub fn new() -> Self {
		let (documents, _) = broadcast::channel(BUS_CAPACITY);
		let (indexes, _) = broadcast::channel(BUS_CAPACITY);
		Self { documents, indexes }
	}

	/// Publish a document-change notification.
	pub fn publish_document_change(&self, change: DocumentChange) {
		// A send only fails when nobody subscribes, which is fine
		let _ = self.documents.send(change);
	}

	/// Publish an index-change notification.
	pub fn publish_index_change(&self, change: IndexChange) {
		trace!("index change: {} {:?}", change.name, change.kind);
		let _ = self.indexes.send(change);
	}

	/// Subscribe to document-change notifications.
	pub fn subscribe_document_changes(&self) -> broadcast::Receiver<DocumentChange> {
		self.documents.subscribe()
	}

	/// Subscribe to index-change notifications.
	pub fn subscribe_index_changes(&self) -> broadcast::Receiver<IndexChange> {
		self.indexes.subscribe()
	}
}
