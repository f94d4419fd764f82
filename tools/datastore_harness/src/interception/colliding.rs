use crate::api_proxy::{Delegate, LogRecord};
use crate::datastore::wire::{COMMIT, DELETE, NEXT, PUT, RUN_QUERY};
use crate::environment::Environment;
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// RPCs a collision policy looks at unless it says otherwise.
pub const COLLIDING_METHODS: &[&str] = &[PUT, COMMIT, DELETE];

/// Wider RPC set watched by `ExceptionPolicy`, which also covers reads.
pub const EXCEPTION_METHODS: &[&str] = &[PUT, DELETE, COMMIT, RUN_QUERY, NEXT];

/// Decides whether an RPC conflicts with a simulated concurrent writer.
///
/// Implementors supply `do_collide`; `collide` only consults it for watched
/// method names (exact, case-sensitive match).
pub trait CollisionPolicy: Send + Sync {
    fn watched_methods(&self) -> &[&'static str] {
        COLLIDING_METHODS
    }

    fn do_collide(&self, method: &str) -> bool;

    fn failure(&self, method: &str) -> HarnessError {
        HarnessError::ConcurrentModification {
            method: method.to_string(),
        }
    }

    fn collide(&self, method: &str) -> Result<(), HarnessError> {
        let watched = self.watched_methods().iter().any(|name| *name == method);
        if watched && self.do_collide(method) {
            return Err(self.failure(method));
        }
        Ok(())
    }
}

/// Every watched RPC collides.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysCollide;

impl CollisionPolicy for AlwaysCollide {
    fn do_collide(&self, _method: &str) -> bool {
        true
    }
}

/// The first `n` watched RPCs collide, later ones succeed.
#[derive(Debug, Default)]
pub struct CollideTimes {
    remaining: AtomicUsize,
}

impl CollideTimes {
    pub fn new(times: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(times),
        }
    }
}

impl CollisionPolicy for CollideTimes {
    fn do_collide(&self, _method: &str) -> bool {
        take_one(&self.remaining)
    }
}

/// The first `n` watched RPCs succeed, every later one collides.
#[derive(Debug, Default)]
pub struct CollideAfter {
    allowed: AtomicUsize,
}

impl CollideAfter {
    pub fn new(allowed: usize) -> Self {
        Self {
            allowed: AtomicUsize::new(allowed),
        }
    }
}

impl CollisionPolicy for CollideAfter {
    fn do_collide(&self, _method: &str) -> bool {
        !take_one(&self.allowed)
    }
}

/// Decrement `counter` if positive. True when a unit was taken.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Widens `inner` to the read RPCs and fails with a caller-chosen error.
pub struct ExceptionPolicy<P> {
    inner: P,
    error: HarnessError,
}

impl<P: CollisionPolicy> ExceptionPolicy<P> {
    pub fn new(inner: P, error: HarnessError) -> Self {
        Self { inner, error }
    }
}

impl<P: CollisionPolicy> CollisionPolicy for ExceptionPolicy<P> {
    fn watched_methods(&self) -> &[&'static str] {
        EXCEPTION_METHODS
    }

    fn do_collide(&self, method: &str) -> bool {
        self.inner.do_collide(method)
    }

    fn failure(&self, _method: &str) -> HarnessError {
        self.error.clone()
    }
}

/// Delegate that fails writes according to a `CollisionPolicy` before they
/// reach `inner`. Logging and lifecycle calls pass straight through.
pub struct CollidingUpdateDatastoreDelegate {
    inner: Arc<dyn Delegate>,
    policy: Arc<dyn CollisionPolicy>,
}

impl CollidingUpdateDatastoreDelegate {
    pub fn new(inner: Arc<dyn Delegate>, policy: Arc<dyn CollisionPolicy>) -> Self {
        Self { inner, policy }
    }

    pub fn always_colliding(inner: Arc<dyn Delegate>) -> Self {
        Self::new(inner, Arc::new(AlwaysCollide))
    }

    pub fn inner(&self) -> &Arc<dyn Delegate> {
        &self.inner
    }
}

impl Delegate for CollidingUpdateDatastoreDelegate {
    fn make_sync_call(
        &self,
        env: &Environment,
        package: &str,
        method: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, HarnessError> {
        if let Err(err) = self.policy.collide(method) {
            append_run_log(
                "info",
                "colliding_delegate.collision",
                json!({ "package": package, "method": method, "error": err.to_string() }),
            );
            return Err(err);
        }
        self.inner.make_sync_call(env, package, method, request)
    }

    fn log(&self, env: &Environment, record: &LogRecord) {
        self.inner.log(env, record);
    }

    fn flush_logs(&self, env: &Environment) {
        self.inner.flush_logs(env);
    }

    fn set_up(&self) -> Result<(), HarnessError> {
        self.inner.set_up()
    }

    fn tear_down(&self) -> Result<(), HarnessError> {
        self.inner.tear_down()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AlwaysCollide, CollideAfter, CollideTimes, CollidingUpdateDatastoreDelegate,
        CollisionPolicy, ExceptionPolicy,
    };
    use crate::api_proxy::{Delegate, LogLevel, LogRecord};
    use crate::environment::Environment;
    use crate::errors::HarnessError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CountingDelegate {
        calls: Mutex<Vec<String>>,
        logs: AtomicUsize,
        torn_down: AtomicUsize,
    }

    impl Delegate for CountingDelegate {
        fn make_sync_call(
            &self,
            _env: &Environment,
            _package: &str,
            method: &str,
            _request: &[u8],
        ) -> Result<Vec<u8>, HarnessError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(method.to_string());
            Ok(b"ok".to_vec())
        }

        fn log(&self, _env: &Environment, _record: &LogRecord) {
            self.logs.fetch_add(1, Ordering::SeqCst);
        }

        fn tear_down(&self) -> Result<(), HarnessError> {
            self.torn_down.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn always_collide_blocks_writes_and_passes_reads() {
        let inner = Arc::new(CountingDelegate::default());
        let delegate = CollidingUpdateDatastoreDelegate::always_colliding(inner.clone());
        let env = Environment::default();

        for method in ["Put", "Commit", "Delete"] {
            let err = delegate
                .make_sync_call(&env, "datastore_v3", method, b"")
                .expect_err("collision");
            assert!(err.is_concurrent_modification());
        }
        for method in ["Get", "RunQuery", "put", "BeginTransaction"] {
            delegate
                .make_sync_call(&env, "datastore_v3", method, b"")
                .expect("pass through");
        }
        assert_eq!(
            *inner.calls.lock().expect("calls lock"),
            vec!["Get", "RunQuery", "put", "BeginTransaction"]
        );

        delegate.log(
            &env,
            &LogRecord {
                level: LogLevel::Warn,
                timestamp_us: 0,
                message: "still logged".to_string(),
            },
        );
        delegate.tear_down().expect("tear down");
        assert_eq!(inner.logs.load(Ordering::SeqCst), 1);
        assert_eq!(inner.torn_down.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn collide_times_fails_first_calls_only() {
        let policy = CollideTimes::new(2);
        assert!(policy.collide("Put").is_err());
        assert!(policy.collide("Get").is_ok());
        assert!(policy.collide("Commit").is_err());
        assert!(policy.collide("Put").is_ok());
        assert!(policy.collide("Delete").is_ok());
    }

    #[test]
    fn collide_after_allows_first_calls_only() {
        let policy = CollideAfter::new(1);
        assert!(policy.collide("Put").is_ok());
        assert!(policy.collide("RunQuery").is_ok());
        assert!(policy.collide("Put").is_err());
        assert!(policy.collide("Commit").is_err());
    }

    #[test]
    fn exception_policy_widens_watched_set_and_uses_custom_error() {
        let policy = ExceptionPolicy::new(
            AlwaysCollide,
            HarnessError::Datastore("deadline exceeded".to_string()),
        );
        assert_eq!(
            policy.collide("RunQuery"),
            Err(HarnessError::Datastore("deadline exceeded".to_string()))
        );
        assert!(policy.collide("Next").is_err());
        assert!(policy.collide("Get").is_ok());
        assert!(AlwaysCollide.collide("RunQuery").is_ok());
    }
}
