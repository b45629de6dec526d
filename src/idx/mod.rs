//! The per-index runtime.
//!
//! An [`Index`] owns one storage environment and one background worker.
//! The worker batches map and delete work from the document store, commits
//! each batch atomically together with the per-collection etag watermarks,
//! then suspends on a wake-event until a mapped collection changes.
//! Queries check the watermarks against the live document store to decide
//! staleness, optionally waiting for the index to catch up, and carry a
//! cache validator committing to the exact progress they were answered
//! from.

mod batch;
mod definition;
mod ft;
mod persistence;
mod query;
mod stale;
mod stats;
mod storage;
mod worker;

#[cfg(test)]
mod tests;

pub use definition::{IndexDefinition, IndexId, IndexPriority, IndexType, LockMode};
pub use ft::QueryMatch;
pub use query::{IndexQuery, QueryResult};
pub use stats::{IndexStats, IndexingError, IndexingStats};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, ensure, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, DocumentChange, IndexChange, IndexChangeKind};
use crate::doc::{CollectionName, DocumentContext, DocumentSource, Etag};
use crate::err::Error;
use crate::idx::persistence::IndexPersistence;
use crate::idx::storage::IndexStorage;
use crate::idx::worker::{CleanupDeletedDocuments, IndexingWork, MapDocuments};
use crate::kvs::{Environment, TransactionType};

/// What the host database hands every index at initialization.
#[derive(Clone)]
pub struct IndexHost {
	/// The source of documents and tombstones
	pub documents: Arc<dyn DocumentSource>,
	/// The notification bus of the host
	pub bus: Arc<Bus>,
	/// The host-wide shutdown token; every index run derives from it
	pub shutdown: CancellationToken,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LifecycleState {
	Uninitialized,
	Initialized,
	Running,
	Stopped,
	Disposed,
}

/// A per-index background indexing engine.
///
/// Lifecycle: construct with [`create`](Index::create) or
/// [`open`](Index::open), then `initialize` → `start` → `stop` →
/// `dispose`. The index subscribes to the host bus at initialization and
/// stops itself when it observes its own error notification.
pub struct Index {
	inner: Arc<IndexInner>,
}

impl std::fmt::Debug for Index {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Index").finish_non_exhaustive()
	}
}

pub(crate) struct IndexInner {
	id: IndexId,
	pub(crate) definition: Arc<IndexDefinition>,
	pub(crate) env: Arc<Environment>,
	pub(crate) storage: Arc<IndexStorage>,
	pub(crate) persistence: Arc<IndexPersistence>,
	pub(crate) workers: Vec<Box<dyn IndexingWork>>,
	/// Set once at initialization
	pub(crate) host: OnceLock<IndexHost>,
	/// Guards lifecycle and priority transitions
	state: tokio::sync::Mutex<LifecycleState>,
	/// In-memory cache of the persisted priority
	pub(crate) priority: std::sync::RwLock<IndexPriority>,
	/// In-memory cache of the persisted lock mode
	lock_mode: std::sync::RwLock<LockMode>,
	/// Raised by document changes and by workers with more work; the loop
	/// consumes it after every batch
	pub(crate) wake: Notify,
	/// Broadcast to queries waiting for the index to catch up
	pub(crate) batch_completed: Notify,
	/// Cancels the current run; replaced on every start
	run_cancel: std::sync::Mutex<CancellationToken>,
	pub(crate) loop_running: AtomicBool,
	pub(crate) loop_exited: Notify,
	/// Consecutive non-transient write failures since the last good batch
	pub(crate) write_errors: AtomicU32,
	pub(crate) indexing_in_progress: AtomicBool,
	/// Epoch milliseconds of the last query; 0 = never
	pub(crate) last_querying_time: AtomicU64,
	/// The bus listener tasks, aborted at dispose
	listeners: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Index {
	/// Create a fresh index over an environment, persisting its
	/// definition.
	///
	/// Re-creating over an environment that already holds a definition is
	/// allowed only when the collection set is unchanged; anything else
	/// needs a new index.
	pub async fn create(
		id: IndexId,
		definition: IndexDefinition,
		env: Arc<Environment>,
	) -> Result<Index> {
		ensure!(id > 0, Error::InvalidArgument(format!("invalid index id {id}")));
		definition.validate()?;
		let tx = env.transaction(TransactionType::Write).await?;
		match catch!(tx, IndexStorage::read_definition(&tx).await) {
			Some(existing) => {
				let same = existing.collections == definition.collections;
				tx.cancel().await?;
				ensure!(
					same,
					Error::InvalidState(format!(
						"the environment of index '{}' was created over different collections",
						definition.name
					))
				);
			}
			None => {
				run!(tx, IndexStorage::write_definition(&tx, &definition).await)?;
			}
		}
		Self::build(id, definition, env)
	}

	/// Open an index over an environment that already holds a definition,
	/// dispatching on the recorded index type.
	pub async fn open(id: IndexId, env: Arc<Environment>) -> Result<Index> {
		ensure!(id > 0, Error::InvalidArgument(format!("invalid index id {id}")));
		// Decide which variant to instantiate before loading anything else
		match IndexStorage::index_type(&env)? {
			Some(IndexType::AutoMap) => {}
			Some(other) => bail!(Error::NotImplementedIndexType(other.as_str().to_string())),
			None => {
				bail!(Error::InvalidState(
					"the environment holds no index definition".to_string()
				))
			}
		}
		let tx = env.transaction(TransactionType::Read).await?;
		let definition = catch!(tx, IndexStorage::read_definition(&tx).await);
		tx.cancel().await?;
		let Some(definition) = definition else {
			bail!(Error::InvalidState("the environment holds no index definition".to_string()));
		};
		Self::build(id, definition, env)
	}

	fn build(id: IndexId, definition: IndexDefinition, env: Arc<Environment>) -> Result<Index> {
		let definition = Arc::new(definition);
		let storage = Arc::new(IndexStorage::new(definition.clone()));
		let persistence = Arc::new(IndexPersistence::new(env.clone(), definition.clone())?);
		// The work units of a map-only index, in execution order
		let workers: Vec<Box<dyn IndexingWork>> = vec![
			Box::new(CleanupDeletedDocuments::new(storage.clone())),
			Box::new(MapDocuments::new(storage.clone())),
		];
		Ok(Index {
			inner: Arc::new(IndexInner {
				id,
				definition,
				env,
				storage,
				persistence,
				workers,
				host: OnceLock::new(),
				state: tokio::sync::Mutex::new(LifecycleState::Uninitialized),
				priority: std::sync::RwLock::new(IndexPriority::NORMAL),
				lock_mode: std::sync::RwLock::new(LockMode::default()),
				wake: Notify::new(),
				batch_completed: Notify::new(),
				run_cancel: std::sync::Mutex::new(CancellationToken::new()),
				loop_running: AtomicBool::new(false),
				loop_exited: Notify::new(),
				write_errors: AtomicU32::new(0),
				indexing_in_progress: AtomicBool::new(false),
				last_querying_time: AtomicU64::new(0),
				listeners: std::sync::Mutex::new(Vec::new()),
			}),
		})
	}

	pub fn id(&self) -> IndexId {
		self.inner.id
	}

	pub fn name(&self) -> &str {
		&self.inner.definition.name
	}

	pub fn definition(&self) -> &IndexDefinition {
		&self.inner.definition
	}

	/// Load the persisted state and subscribe to the host's notifications.
	pub async fn initialize(&self, host: IndexHost) -> Result<()> {
		let mut state = self.inner.state.lock().await;
		match *state {
			LifecycleState::Uninitialized => {}
			LifecycleState::Disposed => bail!(Error::Disposed(self.name().to_string())),
			_ => bail!(Error::InvalidState(format!(
				"the index '{}' is already initialized",
				self.name()
			))),
		}
		let tx = self.inner.env.transaction(TransactionType::Read).await?;
		let priority = catch!(tx, self.inner.storage.read_priority(&tx).await);
		let lock_mode = catch!(tx, self.inner.storage.read_lock(&tx).await);
		tx.cancel().await?;
		*self.inner.priority.write().unwrap() = priority;
		*self.inner.lock_mode.write().unwrap() = lock_mode;
		self.inner
			.host
			.set(host)
			.map_err(|_| Error::InvalidState("the index host was already set".to_string()))?;
		self.spawn_listeners();
		*state = LifecycleState::Initialized;
		debug!("index '{}' initialized with priority {priority}", self.name());
		Ok(())
	}

	/// Start the background indexing loop.
	pub async fn start(&self) -> Result<()> {
		let mut state = self.inner.state.lock().await;
		match *state {
			LifecycleState::Initialized | LifecycleState::Stopped => {}
			LifecycleState::Running => {
				bail!(Error::InvalidState(format!(
					"the index '{}' is already running",
					self.name()
				)))
			}
			LifecycleState::Uninitialized => {
				bail!(Error::InvalidState(format!(
					"the index '{}' was not initialized",
					self.name()
				)))
			}
			LifecycleState::Disposed => bail!(Error::Disposed(self.name().to_string())),
		}
		// The host is present once initialized
		let host = self.inner.host.get().unwrap();
		let cancel = host.shutdown.child_token();
		*self.inner.run_cancel.lock().unwrap() = cancel.clone();
		self.inner.loop_running.store(true, Ordering::Release);
		let inner = self.inner.clone();
		tokio::spawn(async move { inner.indexing_loop(cancel).await });
		*state = LifecycleState::Running;
		Ok(())
	}

	/// Stop the background indexing loop, joining it.
	pub async fn stop(&self) -> Result<()> {
		self.inner.internal_stop().await
	}

	/// Tear the index down: unsubscribe from the bus, stop the loop, and
	/// release the storage environment. Secondary failures are aggregated
	/// into one error; the teardown itself always completes.
	pub async fn dispose(&self) -> Result<()> {
		{
			let state = self.inner.state.lock().await;
			if *state == LifecycleState::Disposed {
				return Ok(());
			}
			// Unsubscribe before releasing anything the listeners use
			for listener in self.inner.listeners.lock().unwrap().drain(..) {
				listener.abort();
			}
			self.inner.run_cancel.lock().unwrap().cancel();
			self.inner.wake.notify_one();
		}
		// Join the loop outside the lifecycle lock; it may still persist
		// a final priority transition while draining
		self.inner.wait_for_loop_exit().await;
		let mut failures = Vec::new();
		if let Err(e) = self.inner.env.shutdown().await {
			failures.push(e.to_string());
		}
		let mut state = self.inner.state.lock().await;
		*state = LifecycleState::Disposed;
		drop(state);
		debug!("index '{}' disposed", self.name());
		if failures.is_empty() {
			Ok(())
		} else {
			bail!(Error::Internal(format!(
				"the index '{}' was disposed with failures: {}",
				self.name(),
				failures.join("; ")
			)))
		}
	}

	/// Answer a query, waiting for freshness within the query's timeout.
	///
	/// The retriever materializes each matched entry into the caller's
	/// result type.
	pub async fn query<R, F>(
		&self,
		query: IndexQuery,
		doc_ctx: &mut dyn DocumentContext,
		cancel: &CancellationToken,
		retriever: F,
	) -> Result<QueryResult<R>>
	where
		F: FnMut(QueryMatch) -> Result<R>,
	{
		self.ensure_usable().await?;
		self.inner.run_query(query, doc_ctx, cancel, retriever).await
	}

	/// Whether the index lags behind the document store.
	pub async fn is_stale(&self, doc_ctx: &dyn DocumentContext) -> Result<bool> {
		self.is_stale_up_to(doc_ctx, None).await
	}

	/// Whether the index lags behind the document store, ignoring changes
	/// above the cutoff.
	pub async fn is_stale_up_to(
		&self,
		doc_ctx: &dyn DocumentContext,
		cutoff: Option<Etag>,
	) -> Result<bool> {
		self.ensure_usable().await?;
		let tx = self.inner.env.transaction(TransactionType::Read).await?;
		let stale = catch!(tx, stale::is_stale(doc_ctx, &tx, &self.inner.storage, cutoff).await);
		tx.cancel().await?;
		Ok(stale)
	}

	/// The cache validator a query would carry right now.
	pub async fn index_etag(&self, doc_ctx: &dyn DocumentContext) -> Result<u64> {
		self.ensure_usable().await?;
		let tx = self.inner.env.transaction(TransactionType::Read).await?;
		let stale = catch!(tx, stale::is_stale(doc_ctx, &tx, &self.inner.storage, None).await);
		let mut progress = Vec::with_capacity(self.inner.storage.collections().len());
		for collection in self.inner.storage.collections() {
			let last_doc = doc_ctx.last_document_etag(collection);
			let mapped = catch!(tx, self.inner.storage.read_last_mapped_etag(&tx, collection).await);
			progress.push((last_doc, mapped));
		}
		tx.cancel().await?;
		Ok(query::index_etag(&self.inner.definition, stale, &progress))
	}

	/// A point-in-time statistics snapshot.
	pub async fn stats(&self) -> Result<IndexStats> {
		self.ensure_usable().await?;
		let tx = self.inner.env.transaction(TransactionType::Read).await?;
		let indexing = catch!(tx, self.inner.storage.read_stats(&tx).await);
		let last_mapped_etags = catch!(tx, self.inner.storage.read_last_mapped_etags(&tx).await);
		let last_processed_tombstone_etags =
			catch!(tx, self.inner.storage.read_last_processed_tombstone_etags(&tx).await);
		let entries_count = self.inner.persistence.open_reader(&tx).entries_count()?;
		tx.cancel().await?;
		let last_querying_time = match self.inner.last_querying_time.load(Ordering::Relaxed) {
			0 => None,
			ms => Some(ms),
		};
		Ok(IndexStats {
			name: self.name().to_string(),
			priority: *self.inner.priority.read().unwrap(),
			lock_mode: *self.inner.lock_mode.read().unwrap(),
			entries_count,
			indexing,
			last_querying_time,
			indexing_in_progress: self.inner.indexing_in_progress.load(Ordering::Relaxed),
			write_errors: self.inner.write_errors.load(Ordering::Acquire),
			last_mapped_etags,
			last_processed_tombstone_etags,
		})
	}

	/// The retained indexing failures, oldest first.
	pub async fn errors(&self) -> Result<Vec<IndexingError>> {
		self.ensure_usable().await?;
		let tx = self.inner.env.transaction(TransactionType::Read).await?;
		let errors = catch!(tx, self.inner.storage.read_errors(&tx).await);
		tx.cancel().await?;
		Ok(errors)
	}

	/// The current priority, from the in-memory cache.
	pub fn priority(&self) -> IndexPriority {
		*self.inner.priority.read().unwrap()
	}

	/// The current lock mode, from the in-memory cache.
	pub fn lock_mode(&self) -> LockMode {
		*self.inner.lock_mode.read().unwrap()
	}

	/// Transition the index priority, persisting it and emitting the
	/// matching notification. Setting the current priority is a no-op.
	pub async fn set_priority(&self, priority: IndexPriority) -> Result<()> {
		self.inner.set_priority(priority).await
	}

	/// Change the lock mode. Setting the current mode is a no-op.
	pub async fn set_lock(&self, mode: LockMode) -> Result<()> {
		let state = self.inner.state.lock().await;
		match *state {
			LifecycleState::Disposed => bail!(Error::Disposed(self.name().to_string())),
			LifecycleState::Uninitialized => bail!(Error::InvalidState(format!(
				"the index '{}' was not initialized",
				self.name()
			))),
			_ => {}
		}
		if *self.inner.lock_mode.read().unwrap() == mode {
			return Ok(());
		}
		let tx = self.inner.env.transaction(TransactionType::Write).await?;
		run!(tx, self.inner.storage.write_lock(&tx, mode).await)?;
		*self.inner.lock_mode.write().unwrap() = mode;
		Ok(())
	}

	/// The highest document etag mapped for one collection.
	pub async fn last_mapped_etag_for(&self, collection: &CollectionName) -> Result<Etag> {
		self.ensure_usable().await?;
		let tx = self.inner.env.transaction(TransactionType::Read).await?;
		let etag = catch!(tx, self.inner.storage.read_last_mapped_etag(&tx, collection).await);
		tx.cancel().await?;
		Ok(etag)
	}

	/// The per-collection tombstone progress, for the host's tombstone
	/// cleaner to take minima over.
	pub async fn last_processed_document_tombstones(
		&self,
	) -> Result<BTreeMap<CollectionName, Etag>> {
		self.ensure_usable().await?;
		let tx = self.inner.env.transaction(TransactionType::Read).await?;
		let etags =
			catch!(tx, self.inner.storage.read_last_processed_tombstone_etags(&tx).await);
		tx.cancel().await?;
		Ok(etags)
	}

	/// Fail unless the index is initialized and not disposed.
	async fn ensure_usable(&self) -> Result<()> {
		let state = self.inner.state.lock().await;
		match *state {
			LifecycleState::Disposed => bail!(Error::Disposed(self.name().to_string())),
			LifecycleState::Uninitialized => bail!(Error::InvalidState(format!(
				"the index '{}' was not initialized",
				self.name()
			))),
			_ => Ok(()),
		}
	}

	/// Subscribe to the host bus: document changes raise the wake-event,
	/// and observing our own error notification stops the index.
	fn spawn_listeners(&self) {
		let host = self.inner.host.get().unwrap().clone();
		let mut handles = self.inner.listeners.lock().unwrap();
		{
			let inner = self.inner.clone();
			let shutdown = host.shutdown.clone();
			let mut rx = host.bus.subscribe_document_changes();
			handles.push(tokio::spawn(async move {
				loop {
					tokio::select! {
						_ = shutdown.cancelled() => break,
						received = rx.recv() => match received {
							Ok(change) => inner.handle_document_change(&change),
							// Dropped notifications only cost one wake
							Err(RecvError::Lagged(_)) => inner.wake.notify_one(),
							Err(RecvError::Closed) => break,
						}
					}
				}
			}));
		}
		{
			let inner = self.inner.clone();
			let shutdown = host.shutdown.clone();
			let mut rx = host.bus.subscribe_index_changes();
			handles.push(tokio::spawn(async move {
				loop {
					tokio::select! {
						_ = shutdown.cancelled() => break,
						received = rx.recv() => match received {
							Ok(change) => inner.handle_index_change(&change).await,
							Err(RecvError::Lagged(_)) => continue,
							Err(RecvError::Closed) => break,
						}
					}
				}
			}));
		}
	}
}

impl IndexInner {
	/// A document changed: wake the loop when the collection is ours.
	/// Waking is cheap, so there is no filtering by etag.
	fn handle_document_change(&self, change: &DocumentChange) {
		if self.definition.maps(&change.collection) {
			self.wake.notify_one();
		}
	}

	/// An index changed: when we observe ourselves marked as errored,
	/// stop the indexing loop.
	async fn handle_index_change(&self, change: &IndexChange) {
		if change.kind == IndexChangeKind::IndexMarkedAsErrored
			&& change.name == self.definition.name
		{
			warn!("index '{}' observed its error notification, stopping", self.definition.name);
			if let Err(e) = self.internal_stop().await {
				error!("index '{}': failed to stop after error: {e}", self.definition.name);
			}
		}
	}

	/// Transition the priority under the lifecycle mutex, persist it, and
	/// emit at most one notification.
	pub(crate) async fn set_priority(&self, priority: IndexPriority) -> Result<()> {
		let state = self.state.lock().await;
		match *state {
			LifecycleState::Disposed => bail!(Error::Disposed(self.definition.name.clone())),
			LifecycleState::Uninitialized => bail!(Error::InvalidState(format!(
				"the index '{}' was not initialized",
				self.definition.name
			))),
			_ => {}
		}
		let previous = *self.priority.read().unwrap();
		if previous == priority {
			return Ok(());
		}
		let tx = self.env.transaction(TransactionType::Write).await?;
		run!(tx, self.storage.write_priority(&tx, priority).await)?;
		*self.priority.write().unwrap() = priority;
		drop(state);
		debug!("index '{}': priority {previous} -> {priority}", self.definition.name);
		let kind = if priority.contains(IndexPriority::DISABLED) {
			Some(IndexChangeKind::IndexDemotedToDisabled)
		} else if priority.contains(IndexPriority::ERROR) {
			Some(IndexChangeKind::IndexMarkedAsErrored)
		} else if priority.contains(IndexPriority::IDLE) {
			Some(IndexChangeKind::IndexDemotedToIdle)
		} else if priority.contains(IndexPriority::NORMAL)
			&& previous.contains(IndexPriority::IDLE)
		{
			Some(IndexChangeKind::IndexPromotedFromIdle)
		} else {
			None
		};
		if let (Some(kind), Some(host)) = (kind, self.host.get()) {
			host.bus.publish_index_change(IndexChange {
				name: self.definition.name.clone(),
				kind,
			});
		}
		Ok(())
	}

	/// Stop the indexing loop and join it.
	pub(crate) async fn internal_stop(&self) -> Result<()> {
		{
			let state = self.state.lock().await;
			match *state {
				LifecycleState::Disposed => {
					bail!(Error::Disposed(self.definition.name.clone()))
				}
				LifecycleState::Running => {}
				_ => return Ok(()),
			}
			self.run_cancel.lock().unwrap().cancel();
			self.wake.notify_one();
		}
		// Join outside the lifecycle lock: the draining loop may still
		// need it for a final priority transition
		self.wait_for_loop_exit().await;
		let mut state = self.state.lock().await;
		if *state == LifecycleState::Running {
			*state = LifecycleState::Stopped;
		}
		Ok(())
	}

	/// Wait until the indexing loop task has fully exited.
	pub(crate) async fn wait_for_loop_exit(&self) {
		while self.loop_running.load(Ordering::Acquire) {
			let mut exited = std::pin::pin!(self.loop_exited.notified());
			exited.as_mut().enable();
			// Re-check after registering interest to close the gap
			if !self.loop_running.load(Ordering::Acquire) {
				return;
			}
			exited.await;
		}
	}
}
