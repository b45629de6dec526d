use anyhow::{ensure, Result};
use revision::revisioned;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::doc::CollectionName;
use crate::err::Error;

/// The identifier of an index within its host database. Always positive.
pub type IndexId = i64;

/// The variant tag of an index.
///
/// Only auto-map indexes are runnable in this build; the tag is persisted
/// so that opening an environment created by a richer build fails cleanly.
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum IndexType {
	AutoMap,
	AutoMapReduce,
	Map,
	MapReduce,
}

impl IndexType {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::AutoMap => "AutoMap",
			Self::AutoMapReduce => "AutoMapReduce",
			Self::Map => "Map",
			Self::MapReduce => "MapReduce",
		}
	}
}

/// How an index definition is protected against modification.
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LockMode {
	Unlock,
	LockedIgnore,
	LockedError,
	SideBySide,
}

impl Default for LockMode {
	fn default() -> Self {
		Self::Unlock
	}
}

/// The scheduling state of an index.
///
/// Exactly one of `NORMAL`, `IDLE`, `DISABLED` or `ERROR` is meaningful at
/// a time; `FORCED` is an orthogonal flag suppressing automatic
/// transitions such as the idle-to-normal promotion on query.
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IndexPriority(u8);

impl Default for IndexPriority {
	fn default() -> Self {
		Self::NORMAL
	}
}

impl IndexPriority {
	pub const NORMAL: Self = Self(1);
	pub const IDLE: Self = Self(2);
	pub const DISABLED: Self = Self(4);
	pub const ERROR: Self = Self(8);
	pub const FORCED: Self = Self(16);

	/// Whether all bits of `other` are set.
	pub fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}

	/// This priority with the forced flag added.
	pub fn forced(self) -> Self {
		Self(self.0 | Self::FORCED.0)
	}

	/// Whether automatic transitions are suppressed.
	pub fn is_forced(self) -> bool {
		self.contains(Self::FORCED)
	}

	/// The meaningful state with the forced flag masked off.
	pub fn base(self) -> Self {
		Self(self.0 & !Self::FORCED.0)
	}
}

impl std::fmt::Display for IndexPriority {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let base = match self.base() {
			Self::IDLE => "Idle",
			Self::DISABLED => "Disabled",
			Self::ERROR => "Error",
			_ => "Normal",
		};
		if self.is_forced() {
			write!(f, "{base},Forced")
		} else {
			f.write_str(base)
		}
	}
}

/// The immutable definition of an index.
///
/// The collection set is fixed for the lifetime of the index; changing it
/// requires a new index. The definition is persisted in the index
/// environment and its stable hash feeds the query cache validator.
#[revisioned(revision = 1)]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct IndexDefinition {
	/// The human-readable index name
	pub name: String,
	/// The collections the index maps, in definition order
	pub collections: Vec<CollectionName>,
	/// The default lock mode recorded at creation
	pub lock_mode: LockMode,
	/// The index variant
	pub index_type: IndexType,
	/// The mapped field set; empty means every field
	pub fields: Vec<String>,
}

impl IndexDefinition {
	/// Define an auto-map index over the given collections and fields.
	pub fn auto_map<C, F>(name: impl Into<String>, collections: C, fields: F) -> Self
	where
		C: IntoIterator,
		C::Item: Into<CollectionName>,
		F: IntoIterator,
		F::Item: Into<String>,
	{
		Self {
			name: name.into(),
			collections: collections.into_iter().map(Into::into).collect(),
			lock_mode: LockMode::default(),
			index_type: IndexType::AutoMap,
			fields: fields.into_iter().map(Into::into).collect(),
		}
	}

	pub fn validate(&self) -> Result<()> {
		ensure!(
			!self.name.is_empty(),
			Error::InvalidArgument("the index name must not be empty".to_string())
		);
		ensure!(
			!self.collections.is_empty(),
			Error::InvalidArgument("an index must map at least one collection".to_string())
		);
		Ok(())
	}

	/// Whether the index maps the given collection.
	pub fn maps(&self, collection: &CollectionName) -> bool {
		self.collections.contains(collection)
	}

	/// A stable content hash of the definition.
	///
	/// Feeds the query cache validator, so it must not vary across
	/// processes or depend on field ordering beyond definition order.
	pub fn stable_hash(&self) -> u64 {
		let mut buf = Vec::new();
		buf.extend_from_slice(self.name.as_bytes());
		buf.push(0);
		buf.push(match self.index_type {
			IndexType::AutoMap => 1,
			IndexType::AutoMapReduce => 2,
			IndexType::Map => 3,
			IndexType::MapReduce => 4,
		});
		for collection in &self.collections {
			buf.extend_from_slice(collection.lowered().as_bytes());
			buf.push(0);
		}
		for field in &self.fields {
			buf.extend_from_slice(field.as_bytes());
			buf.push(0);
		}
		xxh64(&buf, 0)
	}
}
