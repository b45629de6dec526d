use anyhow::Result;

use crate::doc::{DocumentContext, Etag};
use crate::idx::storage::IndexStorage;
use crate::kvs::Transaction;

/// Decide whether the index lags behind the document store.
///
/// Without a cutoff, the index is stale as soon as any mapped collection
/// has a document or tombstone etag beyond what the index has processed.
/// With a cutoff, changes above the cutoff are ignored: documents count
/// only up to `min(cutoff, last_doc_etag)`, and only tombstones of
/// documents at or below the cutoff that the index has not yet processed
/// keep it stale.
pub(crate) async fn is_stale(
	doc_ctx: &dyn DocumentContext,
	tx: &Transaction,
	storage: &IndexStorage,
	cutoff: Option<Etag>,
) -> Result<bool> {
	for collection in storage.collections() {
		let last_doc = doc_ctx.last_document_etag(collection);
		let mapped = storage.read_last_mapped_etag(tx, collection).await?;
		match cutoff {
			None => {
				if last_doc > mapped {
					return Ok(true);
				}
				let last_tombstone = doc_ctx.last_tombstone_etag(collection);
				let processed =
					storage.read_last_processed_tombstone_etag(tx, collection).await?;
				if last_tombstone > processed {
					return Ok(true);
				}
			}
			Some(cutoff) => {
				if cutoff.min(last_doc) > mapped {
					return Ok(true);
				}
				let processed =
					storage.read_last_processed_tombstone_etag(tx, collection).await?;
				let pending = doc_ctx
					.tombstones_with_doc_etag_below(collection, cutoff)
					.iter()
					.any(|t| t.etag > processed);
				if pending {
					return Ok(true);
				}
			}
		}
	}
	Ok(false)
}
