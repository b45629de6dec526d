//! # Tidemark
//!
//! An embeddable background indexing engine for document databases. Each
//! [`Index`](idx::Index) continuously consumes documents and tombstones from
//! a set of named collections, transforms them into searchable entries
//! inside its own transactional storage environment, and answers queries
//! with well-defined staleness semantics.
//!
//! The engine is built around monotonic per-collection change sequence
//! numbers ("etags"): every document write and every delete is assigned one
//! by the document store, and the index persists the highest etag it has
//! processed per collection. Staleness is etag arithmetic, queries may wait
//! for the index to catch up to a cutoff, and a cache validator commits to
//! the exact progress vector a result was computed from.

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod bus;
pub mod cnf;
pub mod doc;
pub mod err;
pub mod idx;
pub mod key;
pub mod kvs;

pub use bus::Bus;
pub use doc::{
	CollectionName, Document, DocumentContext, DocumentSource, Etag, MemoryDocumentStore, Tombstone,
};
pub use idx::{
	Index, IndexDefinition, IndexHost, IndexPriority, IndexQuery, IndexStats, IndexType, LockMode,
	QueryMatch, QueryResult,
};
pub use kvs::Environment;
