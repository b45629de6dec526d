use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cnf::{BATCH_DOC_LIMIT, BATCH_SIZE_LIMIT};
use crate::doc::DocumentContext;
use crate::err::Error;
use crate::idx::persistence::LazyWriter;
use crate::idx::stats::BatchStats;
use crate::idx::storage::IndexStorage;
use crate::kvs::Transaction;

/// One unit of work inside a batch.
///
/// Work units run in the order the index variant defines, all inside the
/// same write transaction, consuming from the document context and writing
/// through the lazily created writer. A unit returns `true` when it
/// stopped because of a batch budget rather than because its source was
/// exhausted, which makes the loop run the next batch immediately.
#[async_trait]
pub(crate) trait IndexingWork: Send + Sync {
	fn name(&self) -> &'static str;

	async fn execute(
		&self,
		doc_ctx: &dyn DocumentContext,
		tx: &Arc<Transaction>,
		writer: &LazyWriter,
		stats: &mut BatchStats,
		cancel: &CancellationToken,
	) -> Result<bool>;
}

/// Consumes tombstones per collection, deleting the entries of deleted
/// documents, starting after the last processed tombstone etag.
pub(crate) struct CleanupDeletedDocuments {
	storage: Arc<IndexStorage>,
}

impl CleanupDeletedDocuments {
	pub(crate) fn new(storage: Arc<IndexStorage>) -> Self {
		Self { storage }
	}
}

#[async_trait]
impl IndexingWork for CleanupDeletedDocuments {
	fn name(&self) -> &'static str {
		"CleanupDeletedDocuments"
	}

	async fn execute(
		&self,
		doc_ctx: &dyn DocumentContext,
		tx: &Arc<Transaction>,
		writer: &LazyWriter,
		stats: &mut BatchStats,
		cancel: &CancellationToken,
	) -> Result<bool> {
		let mut budget = *BATCH_DOC_LIMIT;
		for collection in self.storage.collections() {
			if budget == 0 {
				return Ok(true);
			}
			let processed =
				self.storage.read_last_processed_tombstone_etag(tx, collection).await?;
			let tombstones = doc_ctx.tombstones_after(collection, processed, budget);
			let exhausted = tombstones.len() == budget;
			for tombstone in tombstones {
				if cancel.is_cancelled() {
					bail!(Error::Cancelled);
				}
				writer.get().await.handle_delete(&tombstone.key).await?;
				stats.documents_deleted += 1;
				budget -= 1;
				// Advance the watermark in place; a failed batch discards
				// this along with the entry deletions
				self.storage
					.write_last_processed_tombstone_etag(tx, collection, tombstone.etag)
					.await?;
			}
			if exhausted {
				return Ok(true);
			}
		}
		Ok(false)
	}
}

/// Consumes documents per collection, mapping them into entries, starting
/// after the last mapped etag.
pub(crate) struct MapDocuments {
	storage: Arc<IndexStorage>,
}

impl MapDocuments {
	pub(crate) fn new(storage: Arc<IndexStorage>) -> Self {
		Self { storage }
	}
}

#[async_trait]
impl IndexingWork for MapDocuments {
	fn name(&self) -> &'static str {
		"MapDocuments"
	}

	async fn execute(
		&self,
		doc_ctx: &dyn DocumentContext,
		tx: &Arc<Transaction>,
		writer: &LazyWriter,
		stats: &mut BatchStats,
		cancel: &CancellationToken,
	) -> Result<bool> {
		let mut budget = *BATCH_DOC_LIMIT;
		for collection in self.storage.collections() {
			if budget == 0 || stats.bytes_processed >= *BATCH_SIZE_LIMIT {
				return Ok(true);
			}
			let mapped = self.storage.read_last_mapped_etag(tx, collection).await?;
			let documents = doc_ctx.documents_after(collection, mapped, budget);
			let exhausted = documents.len() == budget;
			for document in documents {
				if cancel.is_cancelled() {
					bail!(Error::Cancelled);
				}
				stats.maps_attempted += 1;
				stats.bytes_processed += document.size();
				match writer.get().await.handle_map(&document).await {
					Ok(()) => stats.maps_succeeded += 1,
					Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::IndexAnalyzer(_))) => {
						// Analyzer failures are per-document: record, skip
						// the document, and keep the batch going
						debug!("{}: skipping document '{}': {e}", self.name(), document.key);
						stats.analyzer_errors += 1;
						stats.record_error("Map", &e);
					}
					Err(e) => return Err(e),
				}
				budget -= 1;
				// The watermark advances past failed documents too
				self.storage.write_last_mapped_etag(tx, collection, document.etag).await?;
				if stats.bytes_processed >= *BATCH_SIZE_LIMIT {
					// Size budget tripped mid-collection
					return Ok(true);
				}
			}
			if exhausted {
				return Ok(true);
			}
		}
		Ok(false)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::doc::{CollectionName, DocumentSource, MemoryDocumentStore};
	use crate::idx::definition::IndexDefinition;
	use crate::idx::persistence::IndexPersistence;
	use crate::kvs::{Environment, TransactionType};

	struct Rig {
		env: Arc<Environment>,
		storage: Arc<IndexStorage>,
		persistence: Arc<IndexPersistence>,
		store: Arc<MemoryDocumentStore>,
	}

	async fn rig() -> Rig {
		let env = Arc::new(Environment::open("memory").await.unwrap());
		let def = Arc::new(IndexDefinition::auto_map("by-body", ["Users"], ["body"]));
		let storage = Arc::new(IndexStorage::new(def.clone()));
		let persistence = Arc::new(IndexPersistence::new(env.clone(), def).unwrap());
		let store = Arc::new(MemoryDocumentStore::new());
		Rig { env, storage, persistence, store }
	}

	async fn run_worker(rig: &Rig, worker: &dyn IndexingWork) -> (BatchStats, bool) {
		let doc_ctx = rig.store.context().await.unwrap();
		let tx = Arc::new(rig.env.transaction(TransactionType::Write).await.unwrap());
		let writer = LazyWriter::new(rig.persistence.clone(), tx.clone());
		let mut stats = BatchStats::default();
		let cancel = CancellationToken::new();
		let more =
			worker.execute(doc_ctx.as_ref(), &tx, &writer, &mut stats, &cancel).await.unwrap();
		if let Some(w) = writer.take() {
			w.finish().await.unwrap();
		}
		tx.commit().await.unwrap();
		rig.persistence.recreate_searcher().unwrap();
		(stats, more)
	}

	fn fields(body: &str) -> HashMap<String, String> {
		HashMap::from([("body".to_string(), body.to_string())])
	}

	#[tokio::test]
	async fn map_documents_advances_the_watermark() {
		let rig = rig().await;
		for i in 0..5 {
			rig.store.put("Users", format!("users/{i}"), fields("hello"));
		}
		let worker = MapDocuments::new(rig.storage.clone());
		let (stats, more) = run_worker(&rig, &worker).await;
		assert_eq!(stats.maps_attempted, 5);
		assert_eq!(stats.maps_succeeded, 5);
		assert!(!more);
		let tx = rig.env.transaction(TransactionType::Read).await.unwrap();
		let users = CollectionName::new("users");
		assert_eq!(rig.storage.read_last_mapped_etag(&tx, &users).await.unwrap(), 5);
		tx.cancel().await.unwrap();
		// A second run finds nothing new
		let (stats, more) = run_worker(&rig, &worker).await;
		assert_eq!(stats.maps_attempted, 0);
		assert!(!more);
	}

	#[tokio::test]
	async fn analyzer_failures_skip_the_document_but_advance() {
		let rig = rig().await;
		rig.store.put("Users", "users/1", fields("fine"));
		rig.store.put("Users", "users/2", fields(&"x".repeat(600)));
		rig.store.put("Users", "users/3", fields("also fine"));
		let worker = MapDocuments::new(rig.storage.clone());
		let (stats, _) = run_worker(&rig, &worker).await;
		assert_eq!(stats.maps_attempted, 3);
		assert_eq!(stats.maps_succeeded, 2);
		assert_eq!(stats.analyzer_errors, 1);
		assert_eq!(stats.errors.len(), 1);
		let tx = rig.env.transaction(TransactionType::Read).await.unwrap();
		let users = CollectionName::new("users");
		assert_eq!(rig.storage.read_last_mapped_etag(&tx, &users).await.unwrap(), 3);
		tx.cancel().await.unwrap();
	}

	#[tokio::test]
	async fn cleanup_processes_tombstones() {
		let rig = rig().await;
		rig.store.put("Users", "users/1", fields("hello"));
		let worker = MapDocuments::new(rig.storage.clone());
		run_worker(&rig, &worker).await;
		let tombstone_etag = rig.store.delete("Users", "users/1").unwrap();
		let cleanup = CleanupDeletedDocuments::new(rig.storage.clone());
		let (stats, more) = run_worker(&rig, &cleanup).await;
		assert_eq!(stats.documents_deleted, 1);
		assert!(!more);
		let tx = rig.env.transaction(TransactionType::Read).await.unwrap();
		let users = CollectionName::new("users");
		assert_eq!(
			rig.storage.read_last_processed_tombstone_etag(&tx, &users).await.unwrap(),
			tombstone_etag
		);
		tx.cancel().await.unwrap();
	}

	#[tokio::test]
	async fn cancellation_aborts_the_worker() {
		let rig = rig().await;
		rig.store.put("Users", "users/1", fields("hello"));
		let worker = MapDocuments::new(rig.storage.clone());
		let doc_ctx = rig.store.context().await.unwrap();
		let tx = Arc::new(rig.env.transaction(TransactionType::Write).await.unwrap());
		let writer = LazyWriter::new(rig.persistence.clone(), tx.clone());
		let mut stats = BatchStats::default();
		let cancel = CancellationToken::new();
		cancel.cancel();
		let err = worker
			.execute(doc_ctx.as_ref(), &tx, &writer, &mut stats, &cancel)
			.await
			.unwrap_err();
		assert!(Error::is_cancelled(&err));
		tx.cancel().await.unwrap();
	}
}
