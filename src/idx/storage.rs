use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use crate::cnf::{ERROR_RING_CAPACITY, NORMAL_FETCH_SIZE};
use crate::doc::{CollectionName, Etag};
use crate::err::Error;
use crate::idx::definition::{IndexDefinition, IndexPriority, IndexType, LockMode};
use crate::idx::stats::{BatchStats, IndexingError, IndexingStats};
use crate::key::index::{Df, Er, Lk, Me, Pr, St, Te};
use crate::kvs::{Environment, Transaction, Val};

/// The persisted metadata of one index.
///
/// Every reader takes a caller-provided transaction and every writer a
/// caller-provided write transaction; the storage never begins or commits
/// one itself, so a batch's metadata updates commit atomically with its
/// full-text writes.
pub(crate) struct IndexStorage {
	definition: Arc<IndexDefinition>,
}

impl IndexStorage {
	pub(crate) fn new(definition: Arc<IndexDefinition>) -> Self {
		Self { definition }
	}

	pub(crate) fn collections(&self) -> &[CollectionName] {
		&self.definition.collections
	}

	/// Read the index type recorded in an environment, without
	/// instantiating the index. Used to decide which variant to build at
	/// open time.
	pub(crate) fn index_type(env: &Environment) -> Result<Option<IndexType>> {
		let snapshot = env.snapshot()?;
		match snapshot.get(Df::new())? {
			Some(val) => {
				let definition: IndexDefinition = revision::from_slice(&val)?;
				Ok(Some(definition.index_type))
			}
			None => Ok(None),
		}
	}

	/// Read the persisted definition of an environment.
	pub(crate) async fn read_definition(tx: &Transaction) -> Result<Option<IndexDefinition>> {
		match tx.get(Df::new()).await? {
			Some(val) => Ok(Some(revision::from_slice(&val)?)),
			None => Ok(None),
		}
	}

	pub(crate) async fn write_definition(tx: &Transaction, def: &IndexDefinition) -> Result<()> {
		tx.set(Df::new(), revision::to_vec(def)?).await
	}

	pub(crate) async fn read_priority(&self, tx: &Transaction) -> Result<IndexPriority> {
		match tx.get(Pr::new()).await? {
			Some(val) => Ok(revision::from_slice(&val)?),
			None => Ok(IndexPriority::NORMAL),
		}
	}

	pub(crate) async fn write_priority(&self, tx: &Transaction, p: IndexPriority) -> Result<()> {
		tx.set(Pr::new(), revision::to_vec(&p)?).await
	}

	pub(crate) async fn read_lock(&self, tx: &Transaction) -> Result<LockMode> {
		match tx.get(Lk::new()).await? {
			Some(val) => Ok(revision::from_slice(&val)?),
			None => Ok(self.definition.lock_mode),
		}
	}

	pub(crate) async fn write_lock(&self, tx: &Transaction, mode: LockMode) -> Result<()> {
		tx.set(Lk::new(), revision::to_vec(&mode)?).await
	}

	pub(crate) async fn read_last_mapped_etag(
		&self,
		tx: &Transaction,
		collection: &CollectionName,
	) -> Result<Etag> {
		decode_etag(tx.get(Me::new(collection.lowered())).await?)
	}

	pub(crate) async fn write_last_mapped_etag(
		&self,
		tx: &Transaction,
		collection: &CollectionName,
		etag: Etag,
	) -> Result<()> {
		tx.set(Me::new(collection.lowered()), etag.to_be_bytes().to_vec()).await
	}

	pub(crate) async fn read_last_processed_tombstone_etag(
		&self,
		tx: &Transaction,
		collection: &CollectionName,
	) -> Result<Etag> {
		decode_etag(tx.get(Te::new(collection.lowered())).await?)
	}

	pub(crate) async fn write_last_processed_tombstone_etag(
		&self,
		tx: &Transaction,
		collection: &CollectionName,
		etag: Etag,
	) -> Result<()> {
		tx.set(Te::new(collection.lowered()), etag.to_be_bytes().to_vec()).await
	}

	/// Read the last mapped etag of every collection the index maps.
	pub(crate) async fn read_last_mapped_etags(
		&self,
		tx: &Transaction,
	) -> Result<BTreeMap<CollectionName, Etag>> {
		let mut out = BTreeMap::new();
		for collection in self.collections() {
			out.insert(collection.clone(), self.read_last_mapped_etag(tx, collection).await?);
		}
		Ok(out)
	}

	/// Read the last processed tombstone etag of every collection the
	/// index maps. The tombstone cleaner takes minima over these.
	pub(crate) async fn read_last_processed_tombstone_etags(
		&self,
		tx: &Transaction,
	) -> Result<BTreeMap<CollectionName, Etag>> {
		let mut out = BTreeMap::new();
		for collection in self.collections() {
			out.insert(
				collection.clone(),
				self.read_last_processed_tombstone_etag(tx, collection).await?,
			);
		}
		Ok(out)
	}

	pub(crate) async fn read_stats(&self, tx: &Transaction) -> Result<IndexingStats> {
		match tx.get(St::new()).await? {
			Some(val) => Ok(revision::from_slice(&val)?),
			None => Ok(IndexingStats::default()),
		}
	}

	/// Fold a batch's counters into the persisted statistics.
	///
	/// Records last-indexing-time as batch start plus duration, appends
	/// the batch's failures to the error ring, and prunes the ring to its
	/// capacity.
	pub(crate) async fn update_stats(
		&self,
		tx: &Transaction,
		batch_start_ms: u64,
		duration_ms: u64,
		batch: &BatchStats,
	) -> Result<()> {
		let mut stats = self.read_stats(tx).await?;
		stats.batches += 1;
		stats.maps_attempted += batch.maps_attempted;
		stats.maps_succeeded += batch.maps_succeeded;
		stats.documents_deleted += batch.documents_deleted;
		stats.analyzer_errors += batch.analyzer_errors;
		stats.indexing_errors += batch.errors.len() as u64;
		stats.last_indexing_time = batch_start_ms + duration_ms;
		for (action, message) in &batch.errors {
			let entry = IndexingError {
				timestamp: stats.last_indexing_time,
				action: action.clone(),
				message: message.clone(),
			};
			tx.set(Er::new(stats.error_seq), revision::to_vec(&entry)?).await?;
			stats.error_seq += 1;
		}
		self.prune_errors(tx).await?;
		tx.set(St::new(), revision::to_vec(&stats)?).await
	}

	/// Drop the oldest ring entries beyond the retention capacity.
	async fn prune_errors(&self, tx: &Transaction) -> Result<()> {
		let (beg, end) = Er::range()?;
		let keys = tx.keys(beg..end, *NORMAL_FETCH_SIZE).await?;
		if keys.len() > ERROR_RING_CAPACITY {
			let excess = keys.len() - ERROR_RING_CAPACITY;
			for key in keys.into_iter().take(excess) {
				tx.del(key).await?;
			}
		}
		Ok(())
	}

	/// The retained failures, oldest first.
	pub(crate) async fn read_errors(&self, tx: &Transaction) -> Result<Vec<IndexingError>> {
		let (beg, end) = Er::range()?;
		let mut out = Vec::new();
		for (_, val) in tx.scan(beg..end, *NORMAL_FETCH_SIZE).await? {
			out.push(revision::from_slice(&val)?);
		}
		Ok(out)
	}
}

fn decode_etag(val: Option<Val>) -> Result<Etag> {
	match val {
		Some(val) => {
			let bytes: [u8; 8] =
				val.as_slice().try_into().map_err(|_| Error::CorruptedIndex("etag width"))?;
			Ok(Etag::from_be_bytes(bytes))
		}
		None => Ok(0),
	}
}
