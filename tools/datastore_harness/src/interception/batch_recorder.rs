use crate::datastore::service::{DatastoreServiceFactory, ServiceCall};
use crate::errors::HarnessError;
use crate::interception::service_interceptor::{Interception, ServicePolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub type BatchPredicate = Arc<dyn Fn(&ServiceCall) -> bool + Send + Sync>;

/// A put of an entity list.
pub fn multi_put() -> BatchPredicate {
    Arc::new(|call: &ServiceCall| matches!(call, ServiceCall::PutMany { .. }))
}

/// Any call whose method name is in `names`.
pub fn named(names: &[&'static str]) -> BatchPredicate {
    let names = names.to_vec();
    Arc::new(move |call: &ServiceCall| names.contains(&call.name()))
}

struct BatchCounter {
    predicate: BatchPredicate,
    count: AtomicUsize,
}

impl ServicePolicy for BatchCounter {
    fn intercept(&self, call: &ServiceCall) -> Result<(), HarnessError> {
        if (self.predicate)(call) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Counts calls the predicate classifies as batch operations. Every call is
/// still forwarded unchanged.
pub struct BatchRecorder {
    counter: Arc<BatchCounter>,
    interception: Interception,
}

impl BatchRecorder {
    pub fn install(
        factory: &DatastoreServiceFactory,
        predicate: BatchPredicate,
    ) -> Result<Self, HarnessError> {
        let counter = Arc::new(BatchCounter {
            predicate,
            count: AtomicUsize::new(0),
        });
        let interception = Interception::install(factory, counter.clone())?;
        Ok(Self {
            counter,
            interception,
        })
    }

    pub fn count(&self) -> usize {
        self.counter.count.load(Ordering::SeqCst)
    }

    /// Restore the wrapped service. Returns the final count.
    pub fn uninstall(self) -> usize {
        let count = self.count();
        self.interception.uninstall();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::{multi_put, named, BatchRecorder};
    use crate::datastore::service::{
        DatastoreService, DatastoreServiceFactory, ServiceCall, ServiceReply,
    };
    use crate::datastore::{Entity, Key};
    use crate::errors::HarnessError;
    use std::sync::Arc;

    struct FailingPuts;

    impl DatastoreService for FailingPuts {
        fn call(&self, call: ServiceCall) -> Result<ServiceReply, HarnessError> {
            match call {
                ServiceCall::PutMany { .. } => Err(HarnessError::Datastore("quota".to_string())),
                _ => Ok(ServiceReply::Unit),
            }
        }
    }

    #[test]
    fn counts_matching_calls_even_when_they_fail() {
        let factory = DatastoreServiceFactory::new();
        factory.set_service(Arc::new(FailingPuts));
        let recorder = BatchRecorder::install(&factory, multi_put()).expect("install");
        let ds = factory.service().expect("service");

        let err = ds
            .put_many(None, vec![Entity::new(Key::named("Book", "a"))])
            .expect_err("backend failure");
        assert_eq!(err, HarnessError::Datastore("quota".to_string()));
        ds.delete(None, &[Key::named("Book", "a")]).expect("delete");
        assert_eq!(recorder.count(), 1);
        assert_eq!(recorder.uninstall(), 1);
    }

    #[test]
    fn named_predicate_matches_method_names() {
        let predicate = named(&["put", "delete"]);
        assert!(predicate(&ServiceCall::Delete {
            transaction: None,
            keys: vec![],
        }));
        assert!(predicate(&ServiceCall::PutMany {
            transaction: None,
            entities: vec![],
        }));
        assert!(!predicate(&ServiceCall::BeginTransaction));
    }
}
