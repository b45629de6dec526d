use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use anyhow::Result;
use async_trait::async_trait;

use crate::bus::{Bus, DocumentChange, DocumentChangeKind};
use crate::doc::{CollectionName, Document, DocumentContext, DocumentSource, Etag, Tombstone};

/// An in-memory document store.
///
/// This is the reference implementation of the consumed document-store
/// contract: a snapshot-per-context store assigning one global etag
/// sequence to writes and deletes, publishing a document-change
/// notification for each. The test suite drives the engine with it, and
/// embedders without a database of their own can too.
pub struct MemoryDocumentStore {
	/// The current store state, replaced wholesale on every write
	state: Arc<RwLock<Arc<StoreState>>>,
	/// The etag sequence
	clock: AtomicU64,
	/// Where to announce document changes
	bus: Option<Arc<Bus>>,
}

#[derive(Clone, Default)]
struct StoreState {
	collections: BTreeMap<CollectionName, CollectionState>,
}

#[derive(Clone, Default)]
struct CollectionState {
	/// Live documents by etag
	docs: BTreeMap<Etag, Arc<Document>>,
	/// The current etag of each live document key
	keys: AHashMap<String, Etag>,
	/// Tombstones by their own etag
	tombstones: BTreeMap<Etag, Arc<Tombstone>>,
	last_document_etag: Etag,
	last_tombstone_etag: Etag,
}

impl Default for MemoryDocumentStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryDocumentStore {
	pub fn new() -> Self {
		Self {
			state: Arc::new(RwLock::new(Arc::new(StoreState::default()))),
			clock: AtomicU64::new(0),
			bus: None,
		}
	}

	/// Create a store that announces every change on the given bus.
	pub fn with_bus(bus: Arc<Bus>) -> Self {
		Self {
			state: Arc::new(RwLock::new(Arc::new(StoreState::default()))),
			clock: AtomicU64::new(0),
			bus: Some(bus),
		}
	}

	/// Store a document, assigning it the next etag.
	pub fn put(
		&self,
		collection: impl Into<CollectionName>,
		key: impl Into<String>,
		fields: HashMap<String, String>,
	) -> Etag {
		let collection = collection.into();
		let key = key.into();
		let etag = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
		{
			let mut guard = self.state.write().unwrap();
			let mut state = (**guard).clone();
			let cs = state.collections.entry(collection.clone()).or_default();
			// A rewrite supersedes the previous version of the document
			if let Some(old) = cs.keys.insert(key.clone(), etag) {
				cs.docs.remove(&old);
			}
			cs.docs.insert(
				etag,
				Arc::new(Document { key: key.clone(), collection: collection.clone(), etag, fields }),
			);
			cs.last_document_etag = etag;
			*guard = Arc::new(state);
		}
		if let Some(bus) = &self.bus {
			bus.publish_document_change(DocumentChange {
				collection,
				key,
				etag,
				kind: DocumentChangeKind::Put,
			});
		}
		etag
	}

	/// Delete a document, recording a tombstone under the next etag.
	///
	/// Returns the tombstone etag, or `None` when no such document exists.
	pub fn delete(&self, collection: impl Into<CollectionName>, key: &str) -> Option<Etag> {
		let collection = collection.into();
		let etag = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
		{
			let mut guard = self.state.write().unwrap();
			let mut state = (**guard).clone();
			let cs = state.collections.get_mut(&collection)?;
			let doc_etag = cs.keys.remove(key)?;
			cs.docs.remove(&doc_etag);
			cs.tombstones.insert(
				etag,
				Arc::new(Tombstone {
					key: key.to_string(),
					collection: collection.clone(),
					etag,
					doc_etag,
				}),
			);
			cs.last_tombstone_etag = etag;
			*guard = Arc::new(state);
		}
		if let Some(bus) = &self.bus {
			bus.publish_document_change(DocumentChange {
				collection,
				key: key.to_string(),
				etag,
				kind: DocumentChangeKind::Delete,
			});
		}
		Some(etag)
	}

	/// Purge a tombstone, as the host's tombstone cleaner would once every
	/// subscriber has processed past it.
	pub fn purge_tombstone(&self, collection: impl Into<CollectionName>, etag: Etag) {
		let collection = collection.into();
		let mut guard = self.state.write().unwrap();
		let mut state = (**guard).clone();
		if let Some(cs) = state.collections.get_mut(&collection) {
			cs.tombstones.remove(&etag);
		}
		*guard = Arc::new(state);
	}
}

#[async_trait]
impl DocumentSource for MemoryDocumentStore {
	async fn context(&self) -> Result<Box<dyn DocumentContext>> {
		let view = self.state.read().unwrap().clone();
		Ok(Box::new(MemoryDocumentContext { origin: self.state.clone(), view }))
	}
}

struct MemoryDocumentContext {
	origin: Arc<RwLock<Arc<StoreState>>>,
	view: Arc<StoreState>,
}

impl MemoryDocumentContext {
	fn collection(&self, collection: &CollectionName) -> Option<&CollectionState> {
		self.view.collections.get(collection)
	}
}

impl DocumentContext for MemoryDocumentContext {
	fn last_document_etag(&self, collection: &CollectionName) -> Etag {
		self.collection(collection).map(|c| c.last_document_etag).unwrap_or(0)
	}

	fn last_tombstone_etag(&self, collection: &CollectionName) -> Etag {
		self.collection(collection).map(|c| c.last_tombstone_etag).unwrap_or(0)
	}

	fn documents_after(
		&self,
		collection: &CollectionName,
		after: Etag,
		limit: usize,
	) -> Vec<Arc<Document>> {
		match self.collection(collection) {
			Some(c) => c.docs.range(after + 1..).take(limit).map(|(_, d)| d.clone()).collect(),
			None => Vec::new(),
		}
	}

	fn tombstones_after(
		&self,
		collection: &CollectionName,
		after: Etag,
		limit: usize,
	) -> Vec<Arc<Tombstone>> {
		match self.collection(collection) {
			Some(c) => c.tombstones.range(after + 1..).take(limit).map(|(_, t)| t.clone()).collect(),
			None => Vec::new(),
		}
	}

	fn tombstones_with_doc_etag_below(
		&self,
		collection: &CollectionName,
		cutoff: Etag,
	) -> Vec<Arc<Tombstone>> {
		match self.collection(collection) {
			Some(c) => {
				c.tombstones.values().filter(|t| t.doc_etag <= cutoff).cloned().collect()
			}
			None => Vec::new(),
		}
	}

	fn reset(&mut self) -> Result<()> {
		self.view = self.origin.read().unwrap().clone();
		Ok(())
	}
}
