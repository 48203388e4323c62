use pto_core::query_contracts::{Fingerprint, QueryEntry, QueryState};
use pto_ingest::{load_observation_file, InternCache, LoadConfig};
use pto_query::{OwnerLease, Query, QueryCache, QueryCacheConfig, QueryError, INTERRUPTED_ERROR};
use pto_storage::{ObservationStore, StorageError, StoreOptions};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

const OBSERVATIONS: &str = concat!(
    "{\"_analyzer\":\"https://an.example/ecn\",\"description\":\"fixture\"}\n",
    "[0,\"2020-01-01T00:00:00Z\",\"2020-01-01T00:00:01Z\",\"10.0.0.1 * 10.0.0.2\",\"ecn.connectivity.works\"]\n",
    "[0,\"2020-01-01T01:00:00Z\",\"2020-01-01T01:00:01Z\",\"10.0.0.1 * 10.0.0.3\",\"ecn.connectivity.works\"]\n",
    "[0,\"2020-01-02T00:00:00Z\",\"2020-01-02T00:00:01Z\",\"10.0.0.1 * 10.0.0.3\",\"ecn.connectivity.broken\"]\n",
    "[0,\"2020-01-02T05:00:00Z\",\"2020-01-02T05:00:01Z\",\"10.0.0.4 * 10.0.0.2\",\"tcp.option.sack\",2]\n",
);

const BY_CONDITION: &str =
    "time_start=2020-01-01&time_end=2020-01-03&group=condition";

struct Fixture {
    _dir: TempDir,
    database: PathBuf,
    cache_root: PathBuf,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().expect("temp dir");
    let database = dir.path().join("obs.db");
    let mut store = ObservationStore::open(&database).expect("open db");
    load_observation_file(
        &mut store,
        OBSERVATIONS.as_bytes(),
        &InternCache::conditions(),
        &InternCache::paths(),
        &LoadConfig::default(),
    )
    .expect("load fixture");
    let cache_root = dir.path().join("cache");
    Fixture {
        _dir: dir,
        database,
        cache_root,
    }
}

fn open_cache(fixture: &Fixture) -> QueryCache {
    open_cache_with(fixture, StoreOptions::default())
}

fn open_cache_with(fixture: &Fixture, store: StoreOptions) -> QueryCache {
    QueryCache::open(
        &fixture.database,
        QueryCacheConfig {
            cache_root: fixture.cache_root.clone(),
            store,
            ..QueryCacheConfig::default()
        },
    )
    .expect("open cache")
}

async fn settle(done: oneshot::Receiver<QueryEntry>) -> QueryEntry {
    tokio::time::timeout(Duration::from_secs(10), done)
        .await
        .expect("completion in time")
        .expect("notified")
}

async fn run_to_end(cache: &QueryCache, query: &Query) -> (QueryEntry, bool) {
    let (notify, done) = oneshot::channel();
    let (_, is_new) = cache.submit(query, notify).await.expect("execute");
    (settle(done).await, is_new)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_execute_runs_one_body() {
    let fixture = fixture();
    let cache = open_cache(&fixture);
    let query = Query::parse(BY_CONDITION).expect("parse");

    let tasks = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let query = query.clone();
            tokio::spawn(async move { run_to_end(&cache, &query).await })
        })
        .collect::<Vec<_>>();

    let mut fresh = 0;
    for task in tasks {
        let (entry, is_new) = task.await.expect("task");
        assert_eq!(entry.state, QueryState::Complete);
        assert_eq!(entry.fingerprint, query.fingerprint());
        if is_new {
            fresh += 1;
        }
    }

    assert_eq!(fresh, 1);
    assert_eq!(cache.executions(), 1);

    let stored = cache
        .get(&query.fingerprint())
        .expect("get")
        .expect("present");
    assert_eq!(stored.row_count, Some(3));
    assert_eq!(stored.sources.len(), 1);
    assert!(cache.artifact_path(&query.fingerprint()).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn complete_entry_is_served_from_cache() {
    let fixture = fixture();
    let cache = open_cache(&fixture);
    let query = Query::parse(BY_CONDITION).expect("parse");

    let (first, is_new) = run_to_end(&cache, &query).await;
    assert!(is_new);

    let (notify, done) = oneshot::channel();
    let (entry, is_new) = cache.execute(&query, notify).expect("execute");
    assert!(!is_new);
    assert_eq!(entry, first);
    assert_eq!(done.await.expect("immediate notify"), first);
    assert_eq!(cache.executions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn purge_then_execute_runs_again() {
    let fixture = fixture();
    let cache = open_cache(&fixture);
    let query = Query::parse(BY_CONDITION).expect("parse");
    let fingerprint = query.fingerprint();

    run_to_end(&cache, &query).await;
    cache.purge(&query).expect("purge");
    assert!(cache.get(&fingerprint).expect("get").is_none());
    assert!(!cache.artifact_path(&fingerprint).exists());

    let (entry, is_new) = run_to_end(&cache, &query).await;
    assert!(is_new);
    assert_eq!(entry.state, QueryState::Complete);
    assert_eq!(cache.executions(), 2);

    cache.purge(&query).expect("second purge");
    let err = cache.purge(&query).expect_err("nothing left");
    assert!(matches!(err, QueryError::NotFound(found) if found == fingerprint));
}

#[tokio::test]
async fn purge_while_executing_starts_a_follow_up() {
    let fixture = fixture();
    let cache = open_cache(&fixture);
    let query = Query::parse(BY_CONDITION).expect("parse");
    let fingerprint = query.fingerprint();

    let (first_notify, first_done) = oneshot::channel();
    let (_, first_new) = cache.execute(&query, first_notify).expect("first");
    cache.purge(&query).expect("purge running");
    assert!(cache.get(&fingerprint).expect("get").is_none());

    let (second_notify, second_done) = oneshot::channel();
    let (pending, second_new) = cache.execute(&query, second_notify).expect("follow-up");
    assert_eq!(pending.state, QueryState::Executing);
    let (third_notify, third_done) = oneshot::channel();
    let (_, third_new) = cache.execute(&query, third_notify).expect("join follow-up");
    assert_eq!((first_new, second_new, third_new), (true, true, false));

    for done in [first_done, second_done, third_done] {
        assert_eq!(settle(done).await.state, QueryState::Complete);
    }
    assert_eq!(cache.executions(), 2);

    let stored = cache.get(&fingerprint).expect("get").expect("present");
    assert_eq!(stored.state, QueryState::Complete);
    assert_eq!(stored.row_count, Some(3));
    assert!(cache.artifact_path(&fingerprint).exists());
}

#[tokio::test]
async fn terminal_write_failure_still_notifies() {
    let fixture = fixture();
    let cache = open_cache_with(
        &fixture,
        StoreOptions {
            busy_timeout: Duration::from_millis(50),
        },
    );
    let query = Query::parse(BY_CONDITION).expect("parse");

    let (notify, done) = oneshot::channel();
    let (_, is_new) = cache.execute(&query, notify).expect("execute");
    assert!(is_new);

    // an ingestion-sized write transaction outlasts every busy timeout
    let barrier = Arc::new(Barrier::new(2));
    let holder = {
        let barrier = Arc::clone(&barrier);
        let database = fixture.database.clone();
        thread::spawn(move || {
            let mut store = ObservationStore::open(&database).expect("open db");
            store
                .transaction(|_| -> Result<(), StorageError> {
                    barrier.wait();
                    thread::sleep(Duration::from_millis(800));
                    Ok(())
                })
                .expect("hold write lock");
        })
    };
    barrier.wait();

    let failed = tokio::time::timeout(Duration::from_secs(5), done)
        .await
        .expect("waiter fires while the store is locked")
        .expect("notified");
    assert_eq!(failed.state, QueryState::Failed);
    assert!(failed
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("could not record result"));
    assert!(!cache.artifact_path(&query.fingerprint()).exists());

    holder.join().expect("holder thread");
    assert!(cache.get(&query.fingerprint()).expect("get").is_some());
    let (entry, is_new) = run_to_end(&cache, &query).await;
    assert!(is_new);
    assert_eq!(entry.state, QueryState::Complete);
    assert_eq!(cache.executions(), 2);
}

#[tokio::test]
async fn second_instance_waits_for_a_live_owner() {
    let fixture = fixture();
    let first = open_cache(&fixture);
    let query = Query::parse(BY_CONDITION).expect("parse");

    let (first_notify, first_done) = oneshot::channel();
    let (_, is_new) = first.execute(&query, first_notify).expect("execute");
    assert!(is_new);

    let second = open_cache(&fixture);
    assert_ne!(first.owner_id(), second.owner_id());
    let seen = second
        .get(&query.fingerprint())
        .expect("get")
        .expect("present");
    assert_eq!(seen.state, QueryState::Executing);

    let (second_notify, second_done) = oneshot::channel();
    let (joined, is_new) = second.execute(&query, second_notify).expect("join");
    assert!(!is_new);
    assert_eq!(joined.state, QueryState::Executing);

    let from_first = settle(first_done).await;
    let from_second = settle(second_done).await;
    assert_eq!(from_first.state, QueryState::Complete);
    assert_eq!(from_second, from_first);
    assert_eq!(first.executions(), 1);
    assert_eq!(second.executions(), 0);
}

#[tokio::test]
async fn watcher_fails_entry_when_owner_lease_ends() {
    let fixture = fixture();
    let query = Query::parse(BY_CONDITION).expect("parse");
    fs::create_dir_all(&fixture.cache_root).expect("cache root");
    let lease = OwnerLease::acquire(&fixture.cache_root).expect("foreign lease");
    {
        let store = ObservationStore::open(&fixture.database).expect("open db");
        let running = QueryEntry::executing(query.fingerprint(), query.encoded(), chrono::Utc::now());
        store
            .upsert_owned_query_entry(&running, lease.id())
            .expect("seed running entry");
    }

    let cache = open_cache(&fixture);
    let (notify, done) = oneshot::channel();
    let (entry, is_new) = cache.execute(&query, notify).expect("join");
    assert!(!is_new);
    assert_eq!(entry.state, QueryState::Executing);

    drop(lease);
    let interrupted = settle(done).await;
    assert_eq!(interrupted.state, QueryState::Failed);
    assert_eq!(interrupted.error.as_deref(), Some(INTERRUPTED_ERROR));
    assert_eq!(cache.executions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_entry_is_served_until_purged() {
    let fixture = fixture();
    let cache = open_cache(&fixture);
    let query = Query::parse(BY_CONDITION).expect("parse");
    fs::remove_dir_all(&fixture.cache_root).expect("remove cache root");

    let (failed, is_new) = run_to_end(&cache, &query).await;
    assert!(is_new);
    assert_eq!(failed.state, QueryState::Failed);
    assert!(failed.error.as_deref().unwrap_or_default().contains("io error"));

    let (notify, done) = oneshot::channel();
    let (entry, is_new) = cache.execute(&query, notify).expect("execute");
    assert!(!is_new);
    assert_eq!(entry.state, QueryState::Failed);
    assert_eq!(done.await.expect("immediate notify").state, QueryState::Failed);
    assert_eq!(cache.executions(), 1);

    fs::create_dir_all(&fixture.cache_root).expect("restore cache root");
    cache.purge(&query).expect("purge failed entry");
    let (retried, is_new) = run_to_end(&cache, &query).await;
    assert!(is_new);
    assert_eq!(retried.state, QueryState::Complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pages_metadata_and_immediate_wait() {
    let fixture = fixture();
    let cache = open_cache(&fixture);
    let query = Query::parse(BY_CONDITION).expect("parse");
    let fingerprint = query.fingerprint();

    let (entry, is_new) = cache
        .execute_wait_immediate(&query)
        .await
        .expect("execute");
    assert!(is_new);
    assert_eq!(entry.state, QueryState::Complete);

    let first = cache.result_page(&fingerprint, 0, 2).expect("first page");
    assert_eq!(first.label, "groups");
    assert_eq!(
        first.rows,
        vec![
            serde_json::json!(["ecn.connectivity.broken", 1]),
            serde_json::json!(["ecn.connectivity.works", 2]),
        ]
    );
    assert!(first.more);

    let rest = cache.result_page(&fingerprint, 2, 10).expect("second page");
    assert_eq!(rest.rows, vec![serde_json::json!(["tcp.option.sack", 1])]);
    assert!(!rest.more);

    let reserved = BTreeMap::from([("__id".to_string(), "x".to_string())]);
    assert!(matches!(
        cache.annotate(&fingerprint, reserved),
        Err(QueryError::ReservedMetadataKey(key)) if key == "__id"
    ));

    let annotated = cache
        .annotate(
            &fingerprint,
            BTreeMap::from([("_ext_ref".to_string(), "doi:10.0/pto".to_string())]),
        )
        .expect("annotate");
    assert_eq!(
        annotated.metadata.get("_ext_ref").map(String::as_str),
        Some("doi:10.0/pto")
    );
    let stored = cache.get(&fingerprint).expect("get").expect("present");
    assert_eq!(stored.metadata, annotated.metadata);
    assert_eq!(cache.entries().expect("entries").len(), 1);

    let unknown = Fingerprint::of_encoded("time_start=never");
    assert!(matches!(
        cache.result_page(&unknown, 0, 1),
        Err(QueryError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn executing_entries_fail_on_reopen() {
    let fixture = fixture();
    let query = Query::parse(BY_CONDITION).expect("parse");
    let orphaned = Query::parse("time_start=2020-01-01&time_end=2020-01-03&set=1").expect("parse");
    {
        let store = ObservationStore::open(&fixture.database).expect("open db");
        let stale = QueryEntry::executing(query.fingerprint(), query.encoded(), chrono::Utc::now());
        store.upsert_query_entry(&stale).expect("seed executing entry");
        let abandoned =
            QueryEntry::executing(orphaned.fingerprint(), orphaned.encoded(), chrono::Utc::now());
        store
            .upsert_owned_query_entry(&abandoned, "5f0c9d0e00000000000000000000dead")
            .expect("seed entry of a vanished owner");
    }

    let cache = open_cache(&fixture);
    for fingerprint in [query.fingerprint(), orphaned.fingerprint()] {
        let recovered = cache.get(&fingerprint).expect("get").expect("present");
        assert_eq!(recovered.state, QueryState::Failed);
        assert_eq!(recovered.error.as_deref(), Some(INTERRUPTED_ERROR));
    }
    assert!(matches!(
        cache.result_page(&query.fingerprint(), 0, 1),
        Err(QueryError::NotReady {
            state: QueryState::Failed,
            ..
        })
    ));
}

#[test]
fn open_requires_a_runtime() {
    let fixture = fixture();
    let err = QueryCache::open(&fixture.database, QueryCacheConfig::default())
        .err()
        .expect("no runtime");
    assert!(matches!(err, QueryError::Runtime(_)));
}
