use datastore_harness::api_proxy::{ApiProxy, Delegate, LogRecord};
use datastore_harness::config::HarnessConfig;
use datastore_harness::datastore::local::LocalDatastoreDelegate;
use datastore_harness::datastore::service::{DatastoreService, RpcDatastoreService};
use datastore_harness::datastore::{Entity, Key, Query};
use datastore_harness::environment::Environment;
use datastore_harness::errors::HarnessError;
use datastore_harness::fixture::DatastoreTestHelper;
use datastore_harness::interception::{
    named, AlwaysCollide, BatchRecorder, CollideAfter, CollideTimes,
    CollidingUpdateDatastoreDelegate, ExceptionPolicy, RecordingDatastoreService, WriteBlocker,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records every RPC it sees and answers with the method name.
#[derive(Default)]
struct SpyDelegate {
    calls: Mutex<Vec<String>>,
    logs: AtomicUsize,
}

impl SpyDelegate {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Delegate for SpyDelegate {
    fn make_sync_call(
        &self,
        _env: &Environment,
        package: &str,
        method: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, HarnessError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(method.to_string());
        let mut reply = format!("{package}/{method}:").into_bytes();
        reply.extend_from_slice(request);
        Ok(reply)
    }

    fn log(&self, _env: &Environment, _record: &LogRecord) {
        self.logs.fetch_add(1, Ordering::SeqCst);
    }
}

fn started_helper() -> DatastoreTestHelper {
    let mut helper = DatastoreTestHelper::new(HarnessConfig::default()).expect("helper");
    helper.set_up().expect("set up");
    helper
}

#[test]
fn unwatched_rpcs_pass_through_with_exact_result() {
    let spy = Arc::new(SpyDelegate::default());
    let colliding = CollidingUpdateDatastoreDelegate::always_colliding(spy.clone());
    let env = Environment::default();

    for method in ["Get", "BeginTransaction", "Rollback", "RunQuery", "Next", "PUT", "commit"] {
        let direct = spy
            .make_sync_call(&env, "datastore_v3", method, b"payload")
            .expect("direct");
        let wrapped = colliding
            .make_sync_call(&env, "datastore_v3", method, b"payload")
            .expect("wrapped");
        assert_eq!(direct, wrapped);
    }
    assert_eq!(spy.calls().len(), 14);
}

#[test]
fn watched_rpcs_collide_without_reaching_inner() {
    let spy = Arc::new(SpyDelegate::default());
    let colliding = CollidingUpdateDatastoreDelegate::new(spy.clone(), Arc::new(AlwaysCollide));
    let env = Environment::default();

    for method in ["Put", "Commit", "Delete"] {
        let err = colliding
            .make_sync_call(&env, "datastore_v3", method, b"")
            .expect_err("collision");
        assert_eq!(
            err,
            HarnessError::ConcurrentModification {
                method: method.to_string()
            }
        );
    }
    assert!(spy.calls().is_empty());
}

#[test]
fn colliding_delegate_fails_commit_through_fixture() {
    let helper = started_helper();
    helper.proxy().set_delegate(Arc::new(CollidingUpdateDatastoreDelegate::new(
        helper.delegate().clone(),
        Arc::new(CollideTimes::new(1)),
    )));
    let ds = helper.ds().expect("ds");

    let txn = ds.begin_transaction().expect("begin");
    let key = Key::named("Flight", "f1");
    let err = ds
        .put(Some(&txn), Entity::new(key.clone()))
        .expect_err("first write collides");
    assert!(err.is_concurrent_modification());

    ds.put(Some(&txn), Entity::new(key.clone())).expect("retry");
    ds.commit(&txn).expect("commit");
    assert_eq!(ds.get(None, &key).expect("get").key, key);

    let mut helper = helper;
    helper.tear_down(true).expect("tear down");
}

#[test]
fn failed_commit_leaves_transaction_for_teardown_to_roll_back() {
    let mut helper = started_helper();
    helper.proxy().set_delegate(Arc::new(CollidingUpdateDatastoreDelegate::new(
        helper.delegate().clone(),
        Arc::new(CollideAfter::new(1)),
    )));
    let ds = helper.ds().expect("ds");

    let txn = ds.begin_transaction().expect("begin");
    ds.put(Some(&txn), Entity::new(Key::named("Flight", "f1")))
        .expect("first write allowed");
    assert!(ds.commit(&txn).expect_err("commit collides").is_concurrent_modification());
    assert_eq!(ds.current_transaction().expect("current"), Some(txn));

    assert_eq!(helper.tear_down(true), Err(HarnessError::DanglingTransaction));
}

#[test]
fn exception_policy_also_fails_queries() {
    let helper = started_helper();
    helper.proxy().set_delegate(Arc::new(CollidingUpdateDatastoreDelegate::new(
        helper.delegate().clone(),
        Arc::new(ExceptionPolicy::new(
            AlwaysCollide,
            HarnessError::Datastore("backend unavailable".to_string()),
        )),
    )));
    let ds = helper.ds().expect("ds");

    assert_eq!(
        ds.prepare(None, Query::new("Flight")),
        Err(HarnessError::Datastore("backend unavailable".to_string()))
    );
    assert!(matches!(
        ds.get(None, &Key::named("Flight", "missing")),
        Err(HarnessError::EntityNotFound(_))
    ));
}

#[test]
fn swapped_out_delegate_sees_no_further_calls() {
    let first = Arc::new(SpyDelegate::default());
    let proxy = ApiProxy::with_delegate(first.clone());
    datastore_harness::environment::set_environment_for_current_thread(Environment::default());
    let service = RpcDatastoreService::new(proxy.clone());

    let _ = service.delete(None, &[Key::named("Book", "a")]);
    proxy.set_delegate(Arc::new(LocalDatastoreDelegate::in_memory()));
    service
        .delete(None, &[Key::named("Book", "a")])
        .expect("delete on local backend");

    assert_eq!(first.calls(), vec!["Delete"]);
    datastore_harness::environment::clear_environment_for_current_thread();
}

#[test]
fn recorder_counts_put_and_delete_as_batch_operations() {
    let helper = started_helper();
    let recorder = BatchRecorder::install(helper.factory(), named(&["put", "delete"]))
        .expect("install recorder");
    let ds = helper.ds().expect("ds");

    let first = ds
        .put(None, Entity::new(Key::named("Book", "a")))
        .expect("put a");
    assert!(matches!(
        ds.get(None, &Key::named("Book", "missing")),
        Err(HarnessError::EntityNotFound(_))
    ));
    ds.put(None, Entity::new(Key::named("Book", "b")))
        .expect("put b");
    ds.delete(None, &[first]).expect("delete");

    assert_eq!(recorder.count(), 3);
    recorder.uninstall();
    drop(helper);
}

#[test]
fn recorder_counts_only_matching_calls_in_any_order() {
    let helper = started_helper();
    let recorder = BatchRecorder::install(
        helper.factory(),
        datastore_harness::interception::multi_put(),
    )
    .expect("install recorder");
    let ds = helper.ds().expect("ds");

    let batch = |n: i64| {
        (0..n)
            .map(|i| Entity::new(Key::with_id("Flight", 100 * n + i)))
            .collect::<Vec<_>>()
    };
    ds.put_many(None, batch(2)).expect("batch");
    ds.put(None, Entity::new(Key::with_id("Flight", 1))).expect("single");
    ds.prepare(None, Query::new("Flight")).expect("query");
    ds.put_many(None, batch(3)).expect("batch");
    ds.get(None, &Key::with_id("Flight", 1)).expect("get");

    assert_eq!(recorder.uninstall(), 2);
    assert_eq!(
        helper
            .ds()
            .expect("ds")
            .prepare(None, Query::new("Flight"))
            .expect("query")
            .len(),
        6
    );
}

#[test]
fn write_blocker_round_trip() {
    let helper = started_helper();
    let original = helper.ds().expect("ds");
    let existing = original
        .put(None, Entity::new(Key::named("Book", "seed")).with_property("n", 1))
        .expect("seed");

    let blocker = WriteBlocker::install(helper.factory()).expect("install blocker");
    let ds = helper.ds().expect("ds");

    assert_eq!(
        ds.get(None, &existing).expect("get through blocker"),
        original.get(None, &existing).expect("direct get")
    );
    assert_eq!(
        ds.prepare(None, Query::new("Book")).expect("query"),
        original.prepare(None, Query::new("Book")).expect("query")
    );
    let err = ds
        .put(None, Entity::new(Key::named("Book", "new")))
        .expect_err("blocked");
    assert!(err.is_write_blocked());
    assert!(ds.delete(None, &[existing.clone()]).expect_err("blocked").is_write_blocked());

    blocker.uninstall();
    let ds = helper.ds().expect("ds");
    let key = ds
        .put(None, Entity::new(Key::named("Book", "new")))
        .expect("put reaches backend");
    assert_eq!(ds.get(None, &key).expect("get").key, key);
}

#[test]
fn recording_service_wraps_fixture_service() {
    let helper = started_helper();
    let recording = Arc::new(RecordingDatastoreService::new(helper.ds().expect("ds")));
    helper.factory().set_service(recording.clone());
    let ds = helper.ds().expect("ds");

    let txn = ds.begin_transaction().expect("begin");
    ds.put(Some(&txn), Entity::new(Key::named("Book", "t")))
        .expect("put");
    ds.rollback(&txn).expect("rollback");
    assert!(ds.get(None, &Key::named("Book", "t")).is_err());

    assert_eq!(
        recording.methods(),
        vec!["beginTransaction", "put", "rollback", "get"]
    );
    let jsonl = recording.to_jsonl().expect("jsonl");
    assert_eq!(jsonl.lines().count(), 4);
    assert!(jsonl.lines().last().is_some_and(|line| line.contains("\"outcome\":\"err\"")));
}
