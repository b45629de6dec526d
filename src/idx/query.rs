use std::pin::pin;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh64::xxh64;

use crate::doc::{DocumentContext, Etag};
use crate::err::Error;
use crate::idx::definition::{IndexDefinition, IndexPriority};
use crate::idx::ft::QueryMatch;
use crate::idx::stale;
use crate::idx::stats::now_ms;
use crate::idx::IndexInner;
use crate::kvs::TransactionType;

/// A query against one index.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct IndexQuery {
	/// The query text, analyzed with the indexing analyzer; every term
	/// must match. Empty matches all entries.
	pub query: String,
	/// How many matches to skip
	pub start: usize,
	/// How many matches to return
	pub page_size: usize,
	/// Ignore changes above this etag when deciding staleness
	pub cutoff_etag: Option<Etag>,
	/// Resolve the cutoff to the store's latest etag at query time
	pub wait_for_non_stale_as_of_now: bool,
	/// How long to wait for the index to catch up; `None` serves stale
	/// results immediately
	pub wait_timeout: Option<Duration>,
}

impl IndexQuery {
	pub fn new(query: impl Into<String>) -> Self {
		Self {
			query: query.into(),
			start: 0,
			page_size: usize::MAX,
			cutoff_etag: None,
			wait_for_non_stale_as_of_now: false,
			wait_timeout: None,
		}
	}

	/// Page the results.
	pub fn page(mut self, start: usize, page_size: usize) -> Self {
		self.start = start;
		self.page_size = page_size;
		self
	}

	/// Wait up to `timeout` until the index has caught up with the
	/// document store as it is now.
	pub fn wait_for_non_stale_as_of_now(mut self, timeout: Duration) -> Self {
		self.wait_for_non_stale_as_of_now = true;
		self.wait_timeout = Some(timeout);
		self
	}

	/// Wait up to `timeout` until the index has caught up to the cutoff.
	pub fn wait_for_cutoff(mut self, cutoff: Etag, timeout: Duration) -> Self {
		self.cutoff_etag = Some(cutoff);
		self.wait_timeout = Some(timeout);
		self
	}
}

/// The outcome of a query.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct QueryResult<R> {
	/// The name of the answering index
	pub index_name: String,
	/// Whether the results lag behind the reference point
	pub is_stale: bool,
	/// The cache validator; identical repeat queries yield the same value
	pub etag: u64,
	/// When the index last finished a batch, in epoch milliseconds
	pub index_timestamp: u64,
	/// When the index last answered a query, in epoch milliseconds
	pub last_query_time: u64,
	/// The retrieved page of results
	pub results: Vec<R>,
	/// How many entries matched in total
	pub total_results: usize,
	/// How many matches paging skipped
	pub skipped_results: usize,
}

/// Compute the cache validator of a query answer.
///
/// The hash commits to the definition, the staleness verdict, and the
/// per-collection progress vector in definition order: first every
/// last-document etag, then every last-mapped etag, all as little-endian
/// 64-bit integers. Reduce progress and document touches are deliberately
/// not part of the hash.
pub(crate) fn index_etag(
	definition: &IndexDefinition,
	is_stale: bool,
	progress: &[(Etag, Etag)],
) -> u64 {
	let mut buf = Vec::with_capacity((2 + progress.len() * 2) * 8);
	buf.extend_from_slice(&definition.stable_hash().to_le_bytes());
	buf.extend_from_slice(&u64::from(!is_stale).to_le_bytes());
	for (last_doc, _) in progress {
		buf.extend_from_slice(&last_doc.to_le_bytes());
	}
	for (_, last_mapped) in progress {
		buf.extend_from_slice(&last_mapped.to_le_bytes());
	}
	xxh64(&buf, 0)
}

impl IndexInner {
	/// Answer a query, waiting for freshness within the query's timeout.
	pub(crate) async fn run_query<R, F>(
		&self,
		mut q: IndexQuery,
		doc_ctx: &mut dyn DocumentContext,
		cancel: &CancellationToken,
		mut retriever: F,
	) -> Result<QueryResult<R>>
	where
		F: FnMut(QueryMatch) -> Result<R>,
	{
		// Query activity promotes an idle index back to normal, unless
		// the idling was forced
		let current = *self.priority.read().unwrap();
		if current.base() == IndexPriority::IDLE && !current.is_forced() {
			self.set_priority(IndexPriority::NORMAL).await?;
		}
		self.last_querying_time.fetch_max(now_ms(), Ordering::Relaxed);
		// An as-of-now wait pins the cutoff to the store's present state
		if q.wait_for_non_stale_as_of_now && q.cutoff_etag.is_none() {
			q.cutoff_etag = self
				.storage
				.collections()
				.iter()
				.map(|c| doc_ctx.last_document_etag(c))
				.max();
		}
		let started = Instant::now();
		loop {
			if cancel.is_cancelled() {
				bail!(Error::Cancelled);
			}
			// Register interest in the next batch completion before
			// checking staleness, so a batch finishing in between is not
			// missed
			let mut completed = pin!(self.batch_completed.notified());
			completed.as_mut().enable();
			// The index transaction opens before the document view is
			// pinned: whatever progress the index exposes, the document
			// view is at least as fresh
			let tx = self.env.transaction(TransactionType::Read).await?;
			doc_ctx.reset()?;
			let is_stale =
				catch!(tx, stale::is_stale(doc_ctx, &tx, &self.storage, q.cutoff_etag).await);
			if !self.acceptable(is_stale, &q, &started) {
				tx.cancel().await?;
				let timeout = q.wait_timeout.unwrap_or_default();
				let remaining = timeout.saturating_sub(started.elapsed());
				tokio::select! {
					_ = cancel.cancelled() => bail!(Error::Cancelled),
					_ = tokio::time::timeout(remaining, completed) => {}
				}
				continue;
			}
			// Compute the cache validator from the progress vector the
			// result was computed against
			let mut progress = Vec::with_capacity(self.storage.collections().len());
			for collection in self.storage.collections() {
				let last_doc = doc_ctx.last_document_etag(collection);
				let mapped =
					catch!(tx, self.storage.read_last_mapped_etag(&tx, collection).await);
				progress.push((last_doc, mapped));
			}
			let etag = index_etag(&self.definition, is_stale, &progress);
			let indexing = catch!(tx, self.storage.read_stats(&tx).await);
			let reader = self.persistence.open_reader(&tx);
			let (matches, total_results, skipped_results) = match reader.query(&q, cancel) {
				Ok(answer) => answer,
				Err(e) => {
					let _ = tx.cancel().await;
					return Err(e);
				}
			};
			tx.cancel().await?;
			let mut results = Vec::with_capacity(matches.len());
			for matched in matches {
				results.push(retriever(matched)?);
			}
			return Ok(QueryResult {
				index_name: self.definition.name.clone(),
				is_stale,
				etag,
				index_timestamp: indexing.last_indexing_time,
				last_query_time: self.last_querying_time.load(Ordering::Relaxed),
				results,
				total_results,
				skipped_results,
			});
		}
	}

	/// Whether a result computed now would satisfy the caller: fresh
	/// results always do, and stale ones do when the caller configured no
	/// wait or the wait has run out.
	fn acceptable(&self, is_stale: bool, q: &IndexQuery, started: &Instant) -> bool {
		if !is_stale {
			return true;
		}
		match q.wait_timeout {
			None => true,
			Some(timeout) => started.elapsed() >= timeout,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn definition() -> IndexDefinition {
		IndexDefinition::auto_map("by-body", ["Users"], ["body"])
	}

	#[test]
	fn identical_inputs_hash_identically() {
		let def = definition();
		let a = index_etag(&def, false, &[(100, 100)]);
		let b = index_etag(&def, false, &[(100, 100)]);
		assert_eq!(a, b);
	}

	#[test]
	fn every_component_changes_the_hash() {
		let def = definition();
		let base = index_etag(&def, false, &[(100, 100)]);
		assert_ne!(base, index_etag(&def, true, &[(100, 100)]));
		assert_ne!(base, index_etag(&def, false, &[(101, 100)]));
		assert_ne!(base, index_etag(&def, false, &[(100, 99)]));
		let other = IndexDefinition::auto_map("by-text", ["Users"], ["body"]);
		assert_ne!(base, index_etag(&other, false, &[(100, 100)]));
	}

	#[test]
	fn progress_order_matters() {
		let def = IndexDefinition::auto_map("two", ["Users", "Orders"], ["body"]);
		let a = index_etag(&def, false, &[(1, 2), (3, 4)]);
		let b = index_etag(&def, false, &[(3, 4), (1, 2)]);
		assert_ne!(a, b);
	}
}
