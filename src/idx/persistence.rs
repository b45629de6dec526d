use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::doc::Document;
use crate::err::Error;
use crate::idx::definition::IndexDefinition;
use crate::idx::ft::{analyze, EntryRecord, QueryMatch, Searcher};
use crate::idx::query::IndexQuery;
use crate::key::index::{Dk, Ec, Td};
use crate::kvs::{Environment, Transaction};

/// The full-text writer and reader lifecycle of one index.
///
/// The write handle binds to the batch transaction and is held only by the
/// indexing loop. The searcher is a pinned committed snapshot, recreated
/// exactly once after a commit in which any write occurred; readers opened
/// before the recreation keep observing the pre-batch entries.
pub(crate) struct IndexPersistence {
	env: Arc<Environment>,
	definition: Arc<IndexDefinition>,
	searcher: RwLock<Arc<Searcher>>,
	#[cfg(test)]
	write_failures: Arc<WriteFailures>,
}

/// A test-only countdown injecting write failures into open handles.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct WriteFailures {
	remaining: std::sync::atomic::AtomicU32,
	transient: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl WriteFailures {
	fn take(&self) -> Option<bool> {
		self.remaining
			.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
			.ok()
			.map(|_| self.transient.load(Ordering::Relaxed))
	}
}

impl IndexPersistence {
	pub(crate) fn new(env: Arc<Environment>, definition: Arc<IndexDefinition>) -> Result<Self> {
		let searcher = RwLock::new(Arc::new(Searcher::new(env.snapshot()?)));
		Ok(Self {
			env,
			definition,
			searcher,
			#[cfg(test)]
			write_failures: Arc::new(WriteFailures::default()),
		})
	}

	/// Open a write handle bound to the given batch transaction.
	pub(crate) fn open_writer(&self, tx: Arc<Transaction>) -> IndexWriteHandle {
		IndexWriteHandle {
			definition: self.definition.clone(),
			tx,
			delta: AtomicI64::new(0),
			#[cfg(test)]
			write_failures: self.write_failures.clone(),
		}
	}

	/// Re-pin the searcher to the environment's current committed state.
	///
	/// Called by the indexing loop after a writing commit; everything else
	/// keeps the searcher it already holds.
	pub(crate) fn recreate_searcher(&self) -> Result<()> {
		let searcher = Arc::new(Searcher::new(self.env.snapshot()?));
		*self.searcher.write().unwrap() = searcher;
		Ok(())
	}

	/// Open a read handle over the current searcher.
	///
	/// The transaction scopes the reader's lifetime; the entries served
	/// are those of the last recreated searcher, which never runs ahead
	/// of any committed transaction.
	pub(crate) fn open_reader(&self, _tx: &Transaction) -> IndexReadHandle {
		IndexReadHandle { searcher: self.searcher.read().unwrap().clone() }
	}

	/// Arrange for the next `n` entry writes to fail.
	#[cfg(test)]
	pub(crate) fn inject_write_failures(&self, n: u32, transient: bool) {
		self.write_failures.transient.store(transient, Ordering::Relaxed);
		self.write_failures.remaining.store(n, Ordering::Relaxed);
	}
}

/// Classify a storage failure from the entry-writing path.
fn write_error(err: anyhow::Error) -> anyhow::Error {
	let transient = matches!(err.downcast_ref::<Error>(), Some(Error::Datastore(_)));
	anyhow!(Error::IndexWrite { message: err.to_string(), transient })
}

/// A write handle over the entries of one batch transaction.
///
/// Not thread-safe by contract: only the indexing loop holds one, and it
/// must be finished before the enclosing transaction commits.
pub(crate) struct IndexWriteHandle {
	definition: Arc<IndexDefinition>,
	tx: Arc<Transaction>,
	/// The entries added minus the entries removed by this batch
	delta: AtomicI64,
	#[cfg(test)]
	write_failures: Arc<WriteFailures>,
}

impl IndexWriteHandle {
	/// Map one document into its entry, replacing any previous entry.
	pub(crate) async fn handle_map(&self, doc: &Document) -> Result<()> {
		#[cfg(test)]
		if let Some(transient) = self.write_failures.take() {
			return Err(anyhow!(Error::IndexWrite {
				message: "injected write failure".to_string(),
				transient,
			}));
		}
		// Analyzer failures are per-document and are the caller's to count
		let record = analyze(&self.definition, doc)?;
		self.remove_entry(&doc.key).await?;
		for term in &record.terms {
			let posting = Td::new(term, &doc.key);
			self.tx.set(posting, doc.key.clone().into_bytes()).await.map_err(write_error)?;
		}
		self.tx
			.set(Dk::new(&doc.key), revision::to_vec(&record).map_err(anyhow::Error::from)?)
			.await
			.map_err(write_error)?;
		self.delta.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	/// Remove the entry of a deleted document, if one exists.
	pub(crate) async fn handle_delete(&self, key: &str) -> Result<()> {
		if self.remove_entry(key).await? {
			self.delta.fetch_sub(1, Ordering::Relaxed);
		}
		Ok(())
	}

	async fn remove_entry(&self, key: &str) -> Result<bool> {
		let Some(val) = self.tx.get(Dk::new(key)).await.map_err(write_error)? else {
			return Ok(false);
		};
		let record: EntryRecord = revision::from_slice(&val)?;
		for term in &record.terms {
			self.tx.del(Td::new(term, key)).await.map_err(write_error)?;
		}
		self.tx.del(Dk::new(key)).await.map_err(write_error)?;
		Ok(true)
	}

	/// Flush the entries count. Must be called before the transaction
	/// commits; the handle is unusable afterwards.
	pub(crate) async fn finish(self) -> Result<()> {
		let delta = self.delta.load(Ordering::Relaxed);
		let count = match self.tx.get(Ec::new()).await.map_err(write_error)? {
			Some(val) => {
				let bytes: [u8; 8] =
					val.as_slice().try_into().map_err(|_| Error::CorruptedIndex("count width"))?;
				u64::from_be_bytes(bytes)
			}
			None => 0,
		};
		let count = count.saturating_add_signed(delta);
		self.tx.set(Ec::new(), count.to_be_bytes().to_vec()).await.map_err(write_error)
	}
}

/// A lazily created write handle.
///
/// A batch that processes no documents and no tombstones never opens the
/// writer, and the searcher is left alone after its commit.
pub(crate) struct LazyWriter {
	persistence: Arc<IndexPersistence>,
	tx: Arc<Transaction>,
	cell: OnceCell<IndexWriteHandle>,
}

impl LazyWriter {
	pub(crate) fn new(persistence: Arc<IndexPersistence>, tx: Arc<Transaction>) -> Self {
		Self { persistence, tx, cell: OnceCell::new() }
	}

	/// The write handle, created on first use.
	pub(crate) async fn get(&self) -> &IndexWriteHandle {
		self.cell
			.get_or_init(|| async { self.persistence.open_writer(self.tx.clone()) })
			.await
	}

	/// Whether any worker asked for the writer.
	pub(crate) fn created(&self) -> bool {
		self.cell.initialized()
	}

	/// Take the handle out for finishing, if it was ever created.
	pub(crate) fn take(self) -> Option<IndexWriteHandle> {
		self.cell.into_inner()
	}
}

/// A read handle over the searcher current at open time.
pub(crate) struct IndexReadHandle {
	searcher: Arc<Searcher>,
}

impl IndexReadHandle {
	/// The number of entries visible to this reader.
	pub(crate) fn entries_count(&self) -> Result<u64> {
		self.searcher.entries_count()
	}

	/// Run a query, returning the page of matches, the total number of
	/// matches, and how many were skipped by paging.
	pub(crate) fn query(
		&self,
		query: &IndexQuery,
		cancel: &CancellationToken,
	) -> Result<(Vec<QueryMatch>, usize, usize)> {
		let terms: Vec<String> = crate::idx::ft::tokenize(&query.query).collect();
		let keys = self.searcher.matches(&terms)?;
		let total = keys.len();
		let skipped = query.start.min(total);
		let mut matches = Vec::new();
		for key in keys.into_iter().skip(query.start).take(query.page_size) {
			if cancel.is_cancelled() {
				return Err(anyhow!(Error::Cancelled));
			}
			let entry = self
				.searcher
				.entry(&key)?
				.ok_or(Error::CorruptedIndex("posting without entry"))?;
			matches.push(QueryMatch { key, fields: entry.fields });
		}
		Ok((matches, total, skipped))
	}
}
