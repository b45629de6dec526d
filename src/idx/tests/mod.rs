//! End-to-end scenarios driving a full index against the in-memory
//! document store and bus.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, IndexChangeKind};
use crate::doc::{CollectionName, DocumentSource, MemoryDocumentStore};
use crate::err::Error;
use crate::idx::{
	Index, IndexDefinition, IndexHost, IndexPriority, IndexQuery, IndexType, LockMode,
};
use crate::kvs::{Environment, TransactionType};

struct Rig {
	bus: Arc<Bus>,
	store: Arc<MemoryDocumentStore>,
	env: Arc<Environment>,
	index: Index,
	host: IndexHost,
}

async fn rig() -> Rig {
	let bus = Arc::new(Bus::new());
	let store = Arc::new(MemoryDocumentStore::with_bus(bus.clone()));
	let env = Arc::new(Environment::open("memory").await.unwrap());
	let definition = IndexDefinition::auto_map("Users/ByBody", ["Users"], ["body"]);
	let index = Index::create(1, definition, env.clone()).await.unwrap();
	let host = IndexHost {
		documents: store.clone(),
		bus: bus.clone(),
		shutdown: CancellationToken::new(),
	};
	index.initialize(host.clone()).await.unwrap();
	Rig { bus, store, env, index, host }
}

fn fields(body: &str) -> HashMap<String, String> {
	HashMap::from([("body".to_string(), body.to_string())])
}

/// Poll a condition for up to ten seconds.
macro_rules! eventually {
	($cond:expr) => {{
		let deadline = Instant::now() + Duration::from_secs(10);
		loop {
			if $cond {
				break;
			}
			assert!(Instant::now() < deadline, "condition not met within 10s");
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	}};
}

async fn hits(rig: &Rig, query: &str) -> Vec<String> {
	let mut doc_ctx = rig.store.context().await.unwrap();
	let result = rig
		.index
		.query(IndexQuery::new(query), doc_ctx.as_mut(), &CancellationToken::new(), |m| {
			Ok(m.key)
		})
		.await
		.unwrap();
	result.results
}

#[test_log::test(tokio::test)]
async fn maps_a_preloaded_collection() {
	let rig = rig().await;
	for i in 1..=100 {
		rig.store.put("Users", format!("users/{i}"), fields(&format!("hello doc{i}")));
	}
	rig.index.start().await.unwrap();
	let users = CollectionName::new("Users");
	eventually!(rig.index.last_mapped_etag_for(&users).await.unwrap() == 100);
	let doc_ctx = rig.store.context().await.unwrap();
	assert!(!rig.index.is_stale(doc_ctx.as_ref()).await.unwrap());
	assert_eq!(hits(&rig, "hello").await.len(), 100);
	let stats = rig.index.stats().await.unwrap();
	assert_eq!(stats.entries_count, 100);
	// Counters commit together with the watermarks of the batch that
	// produced them, so they are never behind what is observable
	assert_eq!(stats.indexing.maps_succeeded, 100);
	assert!(stats.indexing.batches >= 1);
	rig.index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn processes_tombstones_raised_while_running() {
	let rig = rig().await;
	for i in 1..=100 {
		rig.store.put("Users", format!("users/{i}"), fields(&format!("hello doc{i}")));
	}
	rig.index.start().await.unwrap();
	let users = CollectionName::new("Users");
	eventually!(rig.index.last_mapped_etag_for(&users).await.unwrap() == 100);
	// The deletion is assigned the next etag and wakes the loop
	let tombstone = rig.store.delete("Users", "users/50").unwrap();
	assert_eq!(tombstone, 101);
	eventually!({
		let map = rig.index.last_processed_document_tombstones().await.unwrap();
		map[&users] == 101
	});
	assert_eq!(hits(&rig, "doc50").await.len(), 0);
	assert_eq!(hits(&rig, "hello").await.len(), 99);
	rig.index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn a_query_can_wait_for_freshness_as_of_now() {
	let rig = rig().await;
	rig.index.start().await.unwrap();
	rig.store.put("Users", "users/1", fields("hello"));
	let mut doc_ctx = rig.store.context().await.unwrap();
	let query = IndexQuery::new("hello").wait_for_non_stale_as_of_now(Duration::from_secs(10));
	let result = rig
		.index
		.query(query, doc_ctx.as_mut(), &CancellationToken::new(), |m| Ok(m.key))
		.await
		.unwrap();
	assert!(!result.is_stale);
	assert_eq!(result.results, vec!["users/1"]);
	assert_eq!(result.total_results, 1);
	rig.index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn a_stopped_index_times_out_into_stale_results() {
	let rig = rig().await;
	rig.index.start().await.unwrap();
	rig.store.put("Users", "users/1", fields("hello"));
	let users = CollectionName::new("Users");
	eventually!(rig.index.last_mapped_etag_for(&users).await.unwrap() == 1);
	rig.index.stop().await.unwrap();
	// With the loop stopped this write can never be indexed in time
	rig.store.put("Users", "users/2", fields("hello again"));
	let mut doc_ctx = rig.store.context().await.unwrap();
	let started = Instant::now();
	let query = IndexQuery::new("hello").wait_for_non_stale_as_of_now(Duration::from_millis(250));
	let result = rig
		.index
		.query(query, doc_ctx.as_mut(), &CancellationToken::new(), |m| Ok(m.key))
		.await
		.unwrap();
	assert!(result.is_stale);
	assert!(started.elapsed() >= Duration::from_millis(250));
	// The stale answer still reflects everything already committed
	assert_eq!(result.results, vec!["users/1"]);
	rig.index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn repeated_write_failures_demote_the_index_to_error() {
	let rig = rig().await;
	let mut changes = rig.bus.subscribe_index_changes();
	rig.index.start().await.unwrap();
	rig.index.inner.persistence.inject_write_failures(10, false);
	for i in 1..=10u32 {
		rig.store.put("Users", format!("users/{i}"), fields("hello"));
		eventually!({
			let errors = rig.index.inner.write_errors.load(Ordering::Acquire);
			let priority = rig.index.priority();
			errors >= i || priority.contains(IndexPriority::ERROR)
		});
	}
	eventually!(rig.index.priority().contains(IndexPriority::ERROR));
	// The index observes its own error notification and stops itself
	eventually!(!rig.index.inner.loop_running.load(Ordering::Acquire));
	// Exactly one error notification was emitted
	let mut errored = 0;
	loop {
		match changes.try_recv() {
			Ok(change) if change.kind == IndexChangeKind::IndexMarkedAsErrored => errored += 1,
			Ok(_) => {}
			Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
			Err(TryRecvError::Lagged(_)) => {}
		}
	}
	assert_eq!(errored, 1);
	// The failures were recorded in the error ring
	let errors = rig.index.errors().await.unwrap();
	assert!(!errors.is_empty());
	assert!(errors.iter().all(|e| e.action == "Write"));
	// A later successful batch clears the counter but not the priority.
	// The self-stop finishes shortly after the loop exits, so retry the
	// restart until the state settles.
	eventually!(rig.index.start().await.is_ok());
	let users = CollectionName::new("Users");
	rig.store.put("Users", "users/11", fields("hello"));
	eventually!(rig.index.last_mapped_etag_for(&users).await.unwrap() == 11);
	// The counter resets after the batch's statistics are persisted
	eventually!(rig.index.inner.write_errors.load(Ordering::Acquire) == 0);
	assert!(rig.index.priority().contains(IndexPriority::ERROR));
	// Only an explicit transition clears the error state
	rig.index.set_priority(IndexPriority::NORMAL).await.unwrap();
	assert!(!rig.index.priority().contains(IndexPriority::ERROR));
	rig.index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn identical_queries_share_a_cache_validator() {
	let rig = rig().await;
	for i in 1..=10 {
		rig.store.put("Users", format!("users/{i}"), fields("hello"));
	}
	rig.index.start().await.unwrap();
	let users = CollectionName::new("Users");
	eventually!(rig.index.last_mapped_etag_for(&users).await.unwrap() == 10);
	let mut doc_ctx = rig.store.context().await.unwrap();
	let one = rig
		.index
		.query(IndexQuery::new("hello"), doc_ctx.as_mut(), &CancellationToken::new(), |m| {
			Ok(m.key)
		})
		.await
		.unwrap();
	let two = rig
		.index
		.query(IndexQuery::new("hello"), doc_ctx.as_mut(), &CancellationToken::new(), |m| {
			Ok(m.key)
		})
		.await
		.unwrap();
	assert_eq!(one.etag, two.etag);
	// A further write changes the validator
	rig.store.put("Users", "users/11", fields("hello"));
	eventually!(rig.index.last_mapped_etag_for(&users).await.unwrap() == 11);
	let three = rig
		.index
		.query(IndexQuery::new("hello"), doc_ctx.as_mut(), &CancellationToken::new(), |m| {
			Ok(m.key)
		})
		.await
		.unwrap();
	assert_ne!(one.etag, three.etag);
	rig.index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn a_memory_environment_starts_from_scratch() {
	let rig = rig().await;
	for i in 1..=50 {
		rig.store.put("Users", format!("users/{i}"), fields("hello"));
	}
	rig.index.start().await.unwrap();
	let users = CollectionName::new("Users");
	eventually!(rig.index.last_mapped_etag_for(&users).await.unwrap() == 50);
	rig.index.dispose().await.unwrap();
	// A new memory environment holds nothing: the index re-maps from zero
	let env = Arc::new(Environment::open("memory").await.unwrap());
	let definition = IndexDefinition::auto_map("Users/ByBody", ["Users"], ["body"]);
	let index = Index::create(1, definition, env).await.unwrap();
	index.initialize(rig.host.clone()).await.unwrap();
	assert_eq!(index.last_mapped_etag_for(&users).await.unwrap(), 0);
	index.start().await.unwrap();
	eventually!(index.last_mapped_etag_for(&users).await.unwrap() == 50);
	assert_eq!(index.stats().await.unwrap().entries_count, 50);
	index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn a_durable_environment_resumes_where_it_left() {
	let dir = std::env::temp_dir().join(format!("tidemark-e2e-{}", std::process::id()));
	let _ = tokio::fs::remove_file(&dir).await;
	let path = dir.to_string_lossy().to_string();
	let bus = Arc::new(Bus::new());
	let store = Arc::new(MemoryDocumentStore::with_bus(bus.clone()));
	let host = IndexHost {
		documents: store.clone(),
		bus: bus.clone(),
		shutdown: CancellationToken::new(),
	};
	let users = CollectionName::new("Users");
	{
		let env = Arc::new(Environment::open(&path).await.unwrap());
		let definition = IndexDefinition::auto_map("Users/ByBody", ["Users"], ["body"]);
		let index = Index::create(1, definition, env).await.unwrap();
		index.initialize(host.clone()).await.unwrap();
		for i in 1..=20 {
			store.put("Users", format!("users/{i}"), fields("hello"));
		}
		index.start().await.unwrap();
		eventually!(index.last_mapped_etag_for(&users).await.unwrap() == 20);
		index.dispose().await.unwrap();
	}
	{
		// Reopening dispatches on the persisted definition
		let env = Arc::new(Environment::open(&path).await.unwrap());
		let index = Index::open(1, env).await.unwrap();
		assert_eq!(index.definition().index_type, IndexType::AutoMap);
		index.initialize(host.clone()).await.unwrap();
		assert_eq!(index.last_mapped_etag_for(&users).await.unwrap(), 20);
		assert_eq!(index.stats().await.unwrap().entries_count, 20);
		index.dispose().await.unwrap();
	}
	let _ = tokio::fs::remove_file(&dir).await;
}

#[test_log::test(tokio::test)]
async fn priority_transitions_notify_exactly_once() {
	let rig = rig().await;
	let mut changes = rig.bus.subscribe_index_changes();
	// Idempotent: the second identical transition is a no-op
	rig.index.set_priority(IndexPriority::IDLE).await.unwrap();
	rig.index.set_priority(IndexPriority::IDLE).await.unwrap();
	rig.index.set_priority(IndexPriority::NORMAL).await.unwrap();
	rig.index.set_priority(IndexPriority::DISABLED).await.unwrap();
	let mut kinds = Vec::new();
	while let Ok(change) = changes.try_recv() {
		kinds.push(change.kind);
	}
	assert_eq!(
		kinds,
		vec![
			IndexChangeKind::IndexDemotedToIdle,
			IndexChangeKind::IndexPromotedFromIdle,
			IndexChangeKind::IndexDemotedToDisabled,
		]
	);
	rig.index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn querying_promotes_an_idle_index() {
	let rig = rig().await;
	rig.index.start().await.unwrap();
	rig.index.set_priority(IndexPriority::IDLE).await.unwrap();
	hits(&rig, "anything").await;
	assert_eq!(rig.index.priority(), IndexPriority::NORMAL);
	// A forced idle survives query activity
	rig.index.set_priority(IndexPriority::IDLE.forced()).await.unwrap();
	hits(&rig, "anything").await;
	assert_eq!(rig.index.priority(), IndexPriority::IDLE.forced());
	rig.index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn lifecycle_misuse_fails_precisely() {
	let rig = rig().await;
	// Initialize twice
	let err = rig.index.initialize(rig.host.clone()).await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidState(_))));
	// Start twice
	rig.index.start().await.unwrap();
	let err = rig.index.start().await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidState(_))));
	// Stop is idempotent
	rig.index.stop().await.unwrap();
	rig.index.stop().await.unwrap();
	// Everything fails after dispose
	rig.index.dispose().await.unwrap();
	rig.index.dispose().await.unwrap();
	let err = rig.index.start().await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Disposed(_))));
	let err = rig.index.stats().await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Disposed(_))));
	// The environment was released
	assert!(rig.env.closed());
	assert!(!rig.index.inner.loop_running.load(Ordering::Acquire));
}

#[test_log::test(tokio::test)]
async fn start_requires_initialization() {
	let env = Arc::new(Environment::open("memory").await.unwrap());
	let definition = IndexDefinition::auto_map("Users/ByBody", ["Users"], ["body"]);
	let index = Index::create(1, definition, env).await.unwrap();
	let err = index.start().await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidState(_))));
}

#[test_log::test(tokio::test)]
async fn lock_and_priority_transitions_require_initialization() {
	let bus = Arc::new(Bus::new());
	let store = Arc::new(MemoryDocumentStore::with_bus(bus.clone()));
	let env = Arc::new(Environment::open("memory").await.unwrap());
	let definition = IndexDefinition::auto_map("Users/ByBody", ["Users"], ["body"]);
	let index = Index::create(1, definition, env).await.unwrap();
	let err = index.set_lock(LockMode::LockedIgnore).await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidState(_))));
	assert_eq!(index.lock_mode(), LockMode::Unlock);
	let err = index.set_priority(IndexPriority::IDLE).await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidState(_))));
	// Both transitions work once the index is initialized
	let host = IndexHost { documents: store, bus, shutdown: CancellationToken::new() };
	index.initialize(host).await.unwrap();
	index.set_lock(LockMode::LockedIgnore).await.unwrap();
	assert_eq!(index.lock_mode(), LockMode::LockedIgnore);
	index.set_priority(IndexPriority::IDLE).await.unwrap();
	assert_eq!(index.priority(), IndexPriority::IDLE);
	index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn construction_validates_its_arguments() {
	let env = Arc::new(Environment::open("memory").await.unwrap());
	let definition = IndexDefinition::auto_map("Users/ByBody", ["Users"], ["body"]);
	let err = Index::create(0, definition.clone(), env.clone()).await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidArgument(_))));
	// Opening an empty environment has no definition to dispatch on
	let err = Index::open(1, env.clone()).await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidState(_))));
	// The collection set is fixed at creation
	Index::create(1, definition, env.clone()).await.unwrap();
	let other = IndexDefinition::auto_map("Users/ByBody", ["Orders"], ["body"]);
	let err = Index::create(1, other, env).await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidState(_))));
}

#[test_log::test(tokio::test)]
async fn unimplemented_index_types_fail_to_open() {
	let env = Arc::new(Environment::open("memory").await.unwrap());
	let mut definition = IndexDefinition::auto_map("Users/ByBody", ["Users"], ["body"]);
	definition.index_type = IndexType::MapReduce;
	let tx = env.transaction(TransactionType::Write).await.unwrap();
	crate::idx::storage::IndexStorage::write_definition(&tx, &definition).await.unwrap();
	tx.commit().await.unwrap();
	let err = Index::open(1, env).await.unwrap_err();
	match err.downcast_ref::<Error>() {
		Some(Error::NotImplementedIndexType(t)) => assert_eq!(t, "MapReduce"),
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test_log::test(tokio::test)]
async fn a_cancelled_query_aborts() {
	let rig = rig().await;
	rig.index.start().await.unwrap();
	let cancel = CancellationToken::new();
	cancel.cancel();
	let mut doc_ctx = rig.store.context().await.unwrap();
	let err = rig
		.index
		.query::<String, _>(IndexQuery::new("x"), doc_ctx.as_mut(), &cancel, |m| Ok(m.key))
		.await
		.unwrap_err();
	assert!(Error::is_cancelled(&err));
	rig.index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn host_shutdown_cancels_the_run() {
	let rig = rig().await;
	rig.index.start().await.unwrap();
	rig.host.shutdown.cancel();
	rig.index.inner.wake.notify_one();
	eventually!(!rig.index.inner.loop_running.load(Ordering::Acquire));
	rig.index.dispose().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn processed_tombstones_can_be_purged_without_going_stale() {
	let rig = rig().await;
	rig.store.put("Users", "users/1", fields("hello"));
	rig.store.put("Users", "users/2", fields("hello"));
	rig.index.start().await.unwrap();
	let users = CollectionName::new("Users");
	let tombstone = rig.store.delete("Users", "users/1").unwrap();
	eventually!({
		let map = rig.index.last_processed_document_tombstones().await.unwrap();
		map[&users] >= tombstone
	});
	// The host's tombstone cleaner purges everything at or below the
	// minimum across subscribers; a purge of processed tombstones leaves
	// the index fresh
	rig.store.purge_tombstone("Users", tombstone);
	let doc_ctx = rig.store.context().await.unwrap();
	assert!(!rig.index.is_stale(doc_ctx.as_ref()).await.unwrap());
	assert_eq!(hits(&rig, "hello").await, vec!["users/2"]);
	rig.index.dispose().await.unwrap();
}
