//! The full-text substructure of an index environment.
//!
//! Entries are stored as an inverted index inside the index's own
//! environment: one record per document key carrying the analyzed terms
//! and the stored fields, one posting per (term, key) pair whose value is
//! the document key, and a running entries count. Writing goes
//! through the batch transaction, so search entries commit atomically with
//! the etag watermarks; reading goes through a [`Searcher`] pinned to a
//! committed snapshot.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use revision::revisioned;
use serde::{Deserialize, Serialize};

use crate::cnf::MAX_TERM_LENGTH;
use crate::doc::Document;
use crate::err::Error;
use crate::idx::definition::IndexDefinition;
use crate::key::index::{Dk, Ec, Td};
use crate::kvs::Snapshot;

/// The stored form of one indexed document.
#[revisioned(revision = 1)]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct EntryRecord {
	/// The document key the entry was mapped from
	pub(crate) key: String,
	/// The analyzed terms, for posting removal on delete or re-map
	pub(crate) terms: Vec<String>,
	/// The stored field projection handed to query retrievers
	pub(crate) fields: BTreeMap<String, String>,
}

/// Analyze a document into its sorted, deduplicated terms and the stored
/// field projection.
///
/// Tokens are lowercased alphanumeric runs of the definition's mapped
/// fields (every field when the mapped set is empty). A token longer than
/// [`MAX_TERM_LENGTH`] fails the document with an analyzer error.
pub(crate) fn analyze(def: &IndexDefinition, doc: &Document) -> Result<EntryRecord> {
	let mut terms = BTreeSet::new();
	let mut fields = BTreeMap::new();
	for (name, value) in &doc.fields {
		if !def.fields.is_empty() && !def.fields.contains(name) {
			continue;
		}
		for token in tokenize(value) {
			if token.len() > MAX_TERM_LENGTH {
				bail!(Error::IndexAnalyzer(format!(
					"token of {} bytes in field '{name}' of document '{}' exceeds the {MAX_TERM_LENGTH} byte limit",
					token.len(),
					doc.key,
				)));
			}
			terms.insert(token);
		}
		fields.insert(name.clone(), value.clone());
	}
	Ok(EntryRecord { key: doc.key.clone(), terms: terms.into_iter().collect(), fields })
}

/// Split a text into lowercased alphanumeric tokens.
pub(crate) fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
	text.split(|c: char| !c.is_alphanumeric())
		.filter(|t| !t.is_empty())
		.map(|t| t.to_lowercase())
}

/// A match produced by a searcher.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct QueryMatch {
	/// The key of the matched document
	pub key: String,
	/// The stored fields of its entry
	pub fields: BTreeMap<String, String>,
}

/// A read handle over the entries committed up to the last searcher
/// recreation.
///
/// A searcher pins one committed snapshot; it never observes uncommitted
/// writes, and it keeps answering from the pre-batch state until the
/// indexing loop recreates it after a commit.
pub(crate) struct Searcher {
	snapshot: Snapshot,
}

impl Searcher {
	pub(crate) fn new(snapshot: Snapshot) -> Self {
		Self { snapshot }
	}

	/// The number of entries visible to this searcher.
	pub(crate) fn entries_count(&self) -> Result<u64> {
		match self.snapshot.get(Ec::new())? {
			Some(val) => {
				let bytes: [u8; 8] =
					val.as_slice().try_into().map_err(|_| Error::CorruptedIndex("count width"))?;
				Ok(u64::from_be_bytes(bytes))
			}
			None => Ok(0),
		}
	}

	/// The document keys matching every given term, in key order.
	///
	/// With no terms every entry matches.
	pub(crate) fn matches(&self, terms: &[String]) -> Result<Vec<String>> {
		let mut out = Vec::new();
		match terms.split_first() {
			None => {
				let (beg, end) = Dk::range()?;
				for (_, val) in self.snapshot.scan(beg..end, None) {
					let record: EntryRecord = revision::from_slice(&val)?;
					out.push(record.key);
				}
			}
			Some((first, rest)) => {
				let (beg, end) = Td::term_range(first)?;
				'posting: for (_, val) in self.snapshot.scan(beg..end, None) {
					let key = String::from_utf8_lossy(&val).into_owned();
					for term in rest {
						if self.snapshot.get(Td::new(term, &key))?.is_none() {
							continue 'posting;
						}
					}
					out.push(key);
				}
			}
		}
		Ok(out)
	}

	/// The stored entry of a document, if the searcher sees one.
	pub(crate) fn entry(&self, key: &str) -> Result<Option<EntryRecord>> {
		match self.snapshot.get(Dk::new(key))? {
			Some(val) => Ok(Some(revision::from_slice(&val)?)),
			None => Ok(None),
		}
	}
}
