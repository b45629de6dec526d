use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{bail, ensure, Result};

use crate::cnf::SCHEMA_VERSION;
use crate::err::Error;
use crate::key::index::Sv;
use crate::key::KeyEncode;
use crate::kvs::tx::{Commitable, Snapshot, Transaction, TransactionType};
use crate::kvs::{Key, Val};

/// A transactional storage environment for one index.
///
/// The committed state is a shared immutable snapshot. Read transactions
/// and searchers pin the snapshot current at the time they are opened;
/// write transactions are serialized by an environment-level lock and
/// publish a new snapshot on commit.
pub struct Environment {
	/// The filesystem path this environment persists to, if any
	path: Option<PathBuf>,
	/// The committed snapshot
	committed: Arc<RwLock<Arc<BTreeMap<Key, Val>>>>,
	/// Serializes write transactions
	write_lock: Arc<tokio::sync::Mutex<()>>,
	/// Whether the environment has been shut down
	closed: Arc<AtomicBool>,
}

impl Environment {
	/// Open a storage environment.
	///
	/// Pass `"memory"` for a memory-only environment, or a filesystem path
	/// for a durable one. Opening an environment whose persisted schema
	/// version differs from [`SCHEMA_VERSION`] is a fatal error.
	pub async fn open(path: &str) -> Result<Environment> {
		let (path, mut map) = match path {
			"memory" => (None, BTreeMap::new()),
			path => {
				let path = PathBuf::from(path);
				let map = match tokio::fs::read(&path).await {
					Ok(bytes) => revision::from_slice::<BTreeMap<Key, Val>>(&bytes)
						.map_err(|e| Error::Datastore(e.to_string()))?,
					Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
					Err(e) => bail!(Error::Datastore(e.to_string())),
				};
				(Some(path), map)
			}
		};
		// Verify or initialise the schema version record
		let sv = Sv::new().encode()?;
		match map.get(&sv) {
			Some(val) => {
				let found: u16 = revision::from_slice(val)?;
				ensure!(
					found == SCHEMA_VERSION,
					Error::SchemaVersion { expected: SCHEMA_VERSION, found }
				);
			}
			None => {
				map.insert(sv, revision::to_vec(&SCHEMA_VERSION)?);
			}
		}
		Ok(Environment {
			path,
			committed: Arc::new(RwLock::new(Arc::new(map))),
			write_lock: Arc::new(tokio::sync::Mutex::new(())),
			closed: Arc::new(AtomicBool::new(false)),
		})
	}

	/// Start a new transaction on this environment.
	pub async fn transaction(&self, write: TransactionType) -> Result<Transaction> {
		ensure!(!self.closed(), Error::Datastore("the environment is closed".to_string()));
		// Writers queue on the environment lock; the snapshot is pinned
		// only once the lock is held, so a writer always sees the state
		// left by the previous one.
		let guard = match write {
			TransactionType::Write => Some(self.write_lock.clone().lock_owned().await),
			TransactionType::Read => None,
		};
		let snapshot = Snapshot::new(self.committed.read().unwrap().clone());
		Ok(Transaction::new(
			write,
			snapshot,
			guard,
			Commitable {
				committed: self.committed.clone(),
				path: self.path.clone(),
				closed: self.closed.clone(),
			},
		))
	}

	/// Pin the currently committed snapshot.
	pub fn snapshot(&self) -> Result<Snapshot> {
		ensure!(!self.closed(), Error::Datastore("the environment is closed".to_string()));
		Ok(Snapshot::new(self.committed.read().unwrap().clone()))
	}

	/// Whether the environment has been shut down.
	pub fn closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Shut the environment down, flushing a durable environment to disk.
	///
	/// Any transaction started afterwards fails; transactions already open
	/// can still read their pinned snapshot but can no longer commit.
	pub async fn shutdown(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		// Wait for any in-flight writer to finish before the final flush
		let _guard = self.write_lock.lock().await;
		if let Some(path) = &self.path {
			let map = self.committed.read().unwrap().clone();
			Commitable::persist(path, &map).await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn schema_version_is_written_and_verified() {
		let env = Environment::open("memory").await.unwrap();
		let tx = env.transaction(TransactionType::Read).await.unwrap();
		let val = tx.get(Sv::new()).await.unwrap().unwrap();
		let found: u16 = revision::from_slice(&val).unwrap();
		assert_eq!(found, SCHEMA_VERSION);
		tx.cancel().await.unwrap();
	}

	#[tokio::test]
	async fn wrong_schema_version_is_fatal() {
		let dir = std::env::temp_dir().join(format!("tidemark-sv-{}", std::process::id()));
		let _ = tokio::fs::remove_file(&dir).await;
		let path = dir.to_string_lossy().to_string();
		{
			// Forge an environment persisted at a future schema version
			let sv = Sv::new().encode().unwrap();
			let entries = BTreeMap::from([(sv, revision::to_vec(&2u16).unwrap())]);
			let bytes = revision::to_vec(&entries).unwrap();
			tokio::fs::write(&dir, bytes).await.unwrap();
		}
		let res = Environment::open(&path).await;
		let err = res.err().expect("open must fail");
		match err.downcast_ref::<Error>() {
			Some(Error::SchemaVersion { expected, found }) => {
				assert_eq!(*expected, SCHEMA_VERSION);
				assert_eq!(*found, 2);
			}
			other => panic!("unexpected error: {other:?}"),
		}
		let _ = tokio::fs::remove_file(&dir).await;
	}

	#[tokio::test]
	async fn closed_environment_rejects_transactions() {
		let env = Environment::open("memory").await.unwrap();
		env.shutdown().await.unwrap();
		assert!(env.transaction(TransactionType::Write).await.is_err());
		assert!(env.snapshot().is_err());
	}
}
