use crate::datastore::service::{
    DatastoreService, DatastoreServiceFactory, ServiceCall, ServiceReply,
};
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use serde_json::json;
use std::sync::Arc;

/// Hook run before every intercepted call. An error stops the call before it
/// reaches the wrapped service.
pub trait ServicePolicy: Send + Sync {
    fn intercept(&self, call: &ServiceCall) -> Result<(), HarnessError>;
}

impl<F> ServicePolicy for F
where
    F: Fn(&ServiceCall) -> Result<(), HarnessError> + Send + Sync,
{
    fn intercept(&self, call: &ServiceCall) -> Result<(), HarnessError> {
        self(call)
    }
}

/// Runs `policy` then forwards the untouched call to `inner`, returning its
/// reply or error as-is.
pub struct ServiceInterceptor {
    inner: Arc<dyn DatastoreService>,
    policy: Arc<dyn ServicePolicy>,
}

impl ServiceInterceptor {
    pub fn new(inner: Arc<dyn DatastoreService>, policy: Arc<dyn ServicePolicy>) -> Self {
        Self { inner, policy }
    }
}

impl DatastoreService for ServiceInterceptor {
    fn call(&self, call: ServiceCall) -> Result<ServiceReply, HarnessError> {
        self.policy.intercept(&call)?;
        self.inner.call(call)
    }
}

/// An interceptor installed into a factory. Holds the handle it displaced.
pub struct Interception {
    factory: DatastoreServiceFactory,
    original: Arc<dyn DatastoreService>,
}

impl Interception {
    /// Wrap the factory's active service with `policy`.
    pub fn install(
        factory: &DatastoreServiceFactory,
        policy: Arc<dyn ServicePolicy>,
    ) -> Result<Self, HarnessError> {
        let original = factory.service()?;
        factory.set_service(Arc::new(ServiceInterceptor::new(original.clone(), policy)));
        append_run_log("debug", "service_interceptor.installed", json!({}));
        Ok(Self {
            factory: factory.clone(),
            original,
        })
    }

    pub fn original(&self) -> &Arc<dyn DatastoreService> {
        &self.original
    }

    /// Put the displaced handle back into the factory.
    pub fn uninstall(self) {
        self.factory.set_service(self.original);
        append_run_log("debug", "service_interceptor.uninstalled", json!({}));
    }
}
