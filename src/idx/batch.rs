use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use tokio_util::sync::CancellationToken;

use crate::bus::{IndexChange, IndexChangeKind};
use crate::cnf::WRITE_ERRORS_LIMIT;
use crate::err::Error;
use crate::idx::definition::IndexPriority;
use crate::idx::persistence::LazyWriter;
use crate::idx::stats::{now_ms, BatchStats};
use crate::idx::IndexInner;
use crate::kvs::TransactionType;

/// Marks the indexing loop as exited when the task unwinds or returns.
struct LoopGuard(Arc<IndexInner>);

impl Drop for LoopGuard {
	fn drop(&mut self) {
		self.0.indexing_in_progress.store(false, Ordering::Relaxed);
		self.0.loop_running.store(false, Ordering::Release);
		self.0.loop_exited.notify_waiters();
	}
}

impl IndexInner {
	/// The long-running indexing loop of one index.
	///
	/// Runs one batch per iteration inside a single write transaction,
	/// commits atomically, then suspends on the wake-event until a mapped
	/// collection changes, a worker reports more work, or the run is
	/// cancelled. Batch-internal failures are recorded and never kill the
	/// loop.
	pub(crate) async fn indexing_loop(self: Arc<Self>, cancel: CancellationToken) {
		debug!("index '{}': indexing loop started", self.definition.name);
		let _guard = LoopGuard(self.clone());
		loop {
			if cancel.is_cancelled() {
				break;
			}
			let started_ms = now_ms();
			let started = Instant::now();
			self.indexing_in_progress.store(true, Ordering::Relaxed);
			let mut stats = BatchStats::default();
			let outcome = self.execute_batch(started_ms, &started, &mut stats, &cancel).await;
			let mut more = false;
			let mut succeeded = false;
			match outcome {
				Ok(m) => {
					more = m;
					succeeded = true;
					// Let queries waiting for freshness re-check, and the
					// host observe the batch
					self.batch_completed.notify_waiters();
					if let Some(host) = self.host.get() {
						host.bus.publish_index_change(IndexChange {
							name: self.definition.name.clone(),
							kind: IndexChangeKind::BatchCompleted,
						});
					}
				}
				Err(e) if Error::is_cancelled(&e) => break,
				Err(e) => {
					match Error::as_write_error(&e) {
						Some(transient) => {
							warn!(
								"index '{}': write failure, batch discarded: {e}",
								self.definition.name
							);
							stats.record_error("Write", &e);
							if !transient {
								self.note_write_error().await;
							}
						}
						None => match e.downcast_ref::<Error>() {
							Some(Error::OutOfMemory(_)) => {
								error!(
									"index '{}': out of memory, batch discarded: {e}",
									self.definition.name
								);
								stats.record_error("Memory", &e);
							}
							Some(Error::IndexAnalyzer(_)) => {
								// Normally counted inside the batch; reaching
								// here still only costs the one batch
								stats.analyzer_errors += 1;
								stats.record_error("Analyzer", &e);
							}
							_ => {
								warn!("index '{}': batch failed: {e}", self.definition.name);
								stats.record_error("Indexing", &e);
							}
						},
					}
					// The batch transaction is gone; the failure record
					// gets its own short transaction, and losing it must
					// not stop the loop
					if let Err(e) = self.persist_stats(started_ms, started.elapsed(), &stats).await
					{
						error!(
							"index '{}': failed to persist statistics: {e}",
							self.definition.name
						);
					}
				}
			}
			if succeeded {
				self.reset_write_errors();
			}
			self.indexing_in_progress.store(false, Ordering::Relaxed);
			if more {
				continue;
			}
			let wake = self.wake.notified();
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = wake => {}
			}
		}
		debug!("index '{}': indexing loop stopped", self.definition.name);
	}

	/// Run every worker once inside one write transaction.
	///
	/// Returns whether any worker stopped on a batch budget. The batch's
	/// statistics fold into the same transaction, so entries, watermarks
	/// and metadata commit or roll back together. The transaction is
	/// cancelled on every failure path, so an aborted batch leaves no
	/// trace.
	async fn execute_batch(
		&self,
		started_ms: u64,
		started: &Instant,
		stats: &mut BatchStats,
		cancel: &CancellationToken,
	) -> Result<bool> {
		let host = self
			.host
			.get()
			.ok_or_else(|| anyhow!(Error::Internal("the index host is not set".to_string())))?;
		let doc_ctx = host.documents.context().await?;
		let tx = Arc::new(self.env.transaction(TransactionType::Write).await?);
		let writer = LazyWriter::new(self.persistence.clone(), tx.clone());
		let mut more = false;
		for worker in &self.workers {
			if cancel.is_cancelled() {
				let _ = tx.cancel().await;
				bail!(Error::Cancelled);
			}
			trace!("index '{}': running {}", self.definition.name, worker.name());
			match worker.execute(doc_ctx.as_ref(), &tx, &writer, stats, cancel).await {
				Ok(worker_has_more) => more |= worker_has_more,
				Err(e) => {
					let _ = tx.cancel().await;
					return Err(e);
				}
			}
		}
		// The writer must be gone before the commit, and the searcher is
		// recreated only when a writer existed
		let wrote = writer.created();
		if let Some(handle) = writer.take() {
			catch!(tx, handle.finish().await);
		}
		let duration_ms = started.elapsed().as_millis() as u64;
		catch!(tx, self.storage.update_stats(&tx, started_ms, duration_ms, stats).await);
		tx.commit().await?;
		if wrote {
			self.persistence.recreate_searcher()?;
		}
		Ok(more)
	}

	/// Record a failed batch's counters and error entries. The failed
	/// batch's own transaction was already cancelled, so there is nothing
	/// left for these to be atomic with.
	async fn persist_stats(
		&self,
		started_ms: u64,
		elapsed: Duration,
		stats: &BatchStats,
	) -> Result<()> {
		let tx = self.env.transaction(TransactionType::Write).await?;
		run!(tx, self.storage.update_stats(&tx, started_ms, elapsed.as_millis() as u64, stats).await)
	}

	/// Account one persistent write failure; reaching the limit demotes
	/// the index to the error priority.
	pub(crate) async fn note_write_error(&self) {
		let count = self.write_errors.fetch_add(1, Ordering::AcqRel) + 1;
		if count < WRITE_ERRORS_LIMIT {
			return;
		}
		let current = *self.priority.read().unwrap();
		if current.contains(IndexPriority::ERROR) {
			return;
		}
		warn!(
			"index '{}': {count} consecutive write failures, marking as errored",
			self.definition.name
		);
		if let Err(e) = self.set_priority(IndexPriority::ERROR).await {
			error!("index '{}': failed to persist the error priority: {e}", self.definition.name);
		}
	}

	/// Reset the write-error counter to zero atomically.
	pub(crate) fn reset_write_errors(&self) {
		self.write_errors.store(0, Ordering::Release);
	}
}
