use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{ensure, Result};
use tokio::sync::OwnedMutexGuard;

use crate::err::Error;
use crate::key::KeyEncode;
use crate::kvs::{Key, Val};

/// Whether a transaction may mutate the environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionType {
	Read,
	Write,
}

/// An immutable view of the environment at one committed point in time.
///
/// Snapshots are cheap to clone and outlive the transaction they were
/// pinned by; the query searcher holds one across batches.
#[derive(Clone)]
pub struct Snapshot {
	inner: Arc<BTreeMap<Key, Val>>,
}

impl Snapshot {
	pub(crate) fn new(inner: Arc<BTreeMap<Key, Val>>) -> Self {
		Self { inner }
	}

	/// Fetch a key from the snapshot.
	pub fn get<K: KeyEncode>(&self, key: K) -> Result<Option<Val>> {
		Ok(self.inner.get(&key.encode()?).cloned())
	}

	/// Retrieve a range of key-value pairs from the snapshot.
	pub fn scan(&self, rng: Range<Key>, limit: Option<usize>) -> Vec<(Key, Val)> {
		let iter = self.inner.range(rng).map(|(k, v)| (k.clone(), v.clone()));
		match limit {
			Some(l) => iter.take(l).collect(),
			None => iter.collect(),
		}
	}
}

/// Where a write transaction publishes its effects on commit.
pub(crate) struct Commitable {
	pub(crate) committed: Arc<RwLock<Arc<BTreeMap<Key, Val>>>>,
	pub(crate) path: Option<PathBuf>,
	pub(crate) closed: Arc<AtomicBool>,
}

impl Commitable {
	/// Persist a snapshot to disk atomically, writing a scratch file and
	/// renaming it over the destination.
	pub(crate) async fn persist(path: &Path, map: &BTreeMap<Key, Val>) -> Result<()> {
		let bytes = revision::to_vec(map)?;
		let tmp = path.with_extension("tmp");
		tokio::fs::write(&tmp, bytes).await.map_err(|e| Error::Datastore(e.to_string()))?;
		tokio::fs::rename(&tmp, path).await.map_err(|e| Error::Datastore(e.to_string()))?;
		Ok(())
	}
}

/// A transaction over an index environment.
///
/// Reads observe the snapshot pinned when the transaction began, overlaid
/// with this transaction's own writes. Writers are serialized by the
/// environment, so a write transaction never conflicts.
pub struct Transaction {
	/// Is the transaction complete?
	done: AtomicBool,
	/// Is the transaction writeable?
	write: bool,
	/// The snapshot pinned at transaction start
	snapshot: Snapshot,
	/// This transaction's uncommitted writes; `None` marks a deletion
	pending: Mutex<BTreeMap<Key, Option<Val>>>,
	/// The environment write lock, held for the transaction's lifetime
	guard: Mutex<Option<OwnedMutexGuard<()>>>,
	/// The commit destination
	dest: Commitable,
}

impl Transaction {
	pub(crate) fn new(
		write: TransactionType,
		snapshot: Snapshot,
		guard: Option<OwnedMutexGuard<()>>,
		dest: Commitable,
	) -> Self {
		Self {
			done: AtomicBool::new(false),
			write: matches!(write, TransactionType::Write),
			snapshot,
			pending: Mutex::new(BTreeMap::new()),
			guard: Mutex::new(guard),
			dest,
		}
	}

	/// Check if closed.
	pub fn closed(&self) -> bool {
		self.done.load(Ordering::Acquire)
	}

	/// Check if writeable.
	pub fn writeable(&self) -> bool {
		self.write
	}

	/// Cancels the transaction.
	pub async fn cancel(&self) -> Result<()> {
		ensure!(!self.closed(), Error::TxFinished);
		self.done.store(true, Ordering::Release);
		self.pending.lock().unwrap().clear();
		self.guard.lock().unwrap().take();
		Ok(())
	}

	/// Commits the transaction, publishing a new committed snapshot.
	pub async fn commit(&self) -> Result<()> {
		ensure!(!self.closed(), Error::TxFinished);
		ensure!(self.writeable(), Error::TxReadonly);
		ensure!(
			!self.dest.closed.load(Ordering::Acquire),
			Error::Datastore("the environment is closed".to_string())
		);
		self.done.store(true, Ordering::Release);
		let pending = std::mem::take(&mut *self.pending.lock().unwrap());
		// Apply the write set onto the committed state
		let mut map = (**self.dest.committed.read().unwrap()).clone();
		for (key, val) in pending {
			match val {
				Some(val) => {
					map.insert(key, val);
				}
				None => {
					map.remove(&key);
				}
			}
		}
		// A durable environment flushes before the snapshot is published
		if let Some(path) = &self.dest.path {
			if let Err(e) = Commitable::persist(path, &map).await {
				self.guard.lock().unwrap().take();
				return Err(e);
			}
		}
		*self.dest.committed.write().unwrap() = Arc::new(map);
		self.guard.lock().unwrap().take();
		Ok(())
	}

	/// Fetch a key from the transaction.
	pub async fn get<K: KeyEncode>(&self, key: K) -> Result<Option<Val>> {
		ensure!(!self.closed(), Error::TxFinished);
		let key = key.encode()?;
		if let Some(val) = self.pending.lock().unwrap().get(&key) {
			return Ok(val.clone());
		}
		self.snapshot.get(key)
	}

	/// Insert or update a key in the transaction.
	pub async fn set<K: KeyEncode>(&self, key: K, val: Val) -> Result<()> {
		ensure!(!self.closed(), Error::TxFinished);
		ensure!(self.writeable(), Error::TxReadonly);
		self.pending.lock().unwrap().insert(key.encode()?, Some(val));
		Ok(())
	}

	/// Delete a key from the transaction.
	pub async fn del<K: KeyEncode>(&self, key: K) -> Result<()> {
		ensure!(!self.closed(), Error::TxFinished);
		ensure!(self.writeable(), Error::TxReadonly);
		self.pending.lock().unwrap().insert(key.encode()?, None);
		Ok(())
	}

	/// Retrieve a range of keys, lowest first, up to a limit.
	pub async fn keys(&self, rng: Range<Key>, limit: u32) -> Result<Vec<Key>> {
		let scan = self.scan(rng, limit).await?;
		Ok(scan.into_iter().map(|(k, _)| k).collect())
	}

	/// Retrieve a range of key-value pairs, lowest first, up to a limit.
	pub async fn scan(&self, rng: Range<Key>, limit: u32) -> Result<Vec<(Key, Val)>> {
		ensure!(!self.closed(), Error::TxFinished);
		let pending = self.pending.lock().unwrap();
		let mut out = Vec::new();
		let mut snap = self.snapshot.inner.range(rng.clone()).peekable();
		let mut ours = pending.range(rng).peekable();
		// Merge the pinned snapshot with this transaction's write set
		while out.len() < limit as usize {
			match (snap.peek(), ours.peek()) {
				(Some((sk, _)), Some((ok, _))) if sk < ok => {
					let (k, v) = snap.next().unwrap();
					out.push((k.clone(), v.clone()));
				}
				(Some((sk, _)), Some((ok, _))) => {
					if sk == ok {
						snap.next();
					}
					let (k, v) = ours.next().unwrap();
					if let Some(v) = v {
						out.push((k.clone(), v.clone()));
					}
				}
				(Some(_), None) => {
					let (k, v) = snap.next().unwrap();
					out.push((k.clone(), v.clone()));
				}
				(None, Some(_)) => {
					let (k, v) = ours.next().unwrap();
					if let Some(v) = v {
						out.push((k.clone(), v.clone()));
					}
				}
				(None, None) => break,
			}
		}
		Ok(out)
	}
}
