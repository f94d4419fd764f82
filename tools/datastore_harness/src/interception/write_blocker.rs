use crate::datastore::service::{DatastoreServiceFactory, ServiceCall};
use crate::errors::HarnessError;
use crate::interception::service_interceptor::{Interception, ServicePolicy};
use crate::logging::append_run_log;
use serde_json::json;
use std::sync::Arc;

const WRITE_METHODS: &[&str] = &["put", "delete"];

struct BlockWrites;

impl ServicePolicy for BlockWrites {
    fn intercept(&self, call: &ServiceCall) -> Result<(), HarnessError> {
        let method = call.name();
        if WRITE_METHODS.contains(&method) {
            append_run_log("warn", "write_blocker.rejected", json!({ "method": method }));
            return Err(HarnessError::WriteBlocked {
                method: method.to_string(),
            });
        }
        Ok(())
    }
}

/// Rejects `put` and `delete` on the factory's service until uninstalled.
/// Callers must uninstall on every exit path, or use `with_writes_blocked`.
pub struct WriteBlocker {
    interception: Interception,
}

impl WriteBlocker {
    pub fn install(factory: &DatastoreServiceFactory) -> Result<Self, HarnessError> {
        Ok(Self {
            interception: Interception::install(factory, Arc::new(BlockWrites))?,
        })
    }

    pub fn uninstall(self) {
        self.interception.uninstall();
    }
}

/// Run `body` with writes blocked, restoring the service however it exits.
pub fn with_writes_blocked<T>(
    factory: &DatastoreServiceFactory,
    body: impl FnOnce() -> Result<T, HarnessError>,
) -> Result<T, HarnessError> {
    let blocker = WriteBlocker::install(factory)?;
    let result = body();
    blocker.uninstall();
    result
}
