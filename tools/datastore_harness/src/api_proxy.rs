use crate::environment::{require_environment, Environment};
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub timestamp_us: u64,
    pub message: String,
}

/// Backend handle for named remote calls.
///
/// Implementations receive the already-serialized request payload and return
/// the serialized response. Decorators wrap another `Delegate` and forward.
pub trait Delegate: Send + Sync {
    fn make_sync_call(
        &self,
        env: &Environment,
        package: &str,
        method: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, HarnessError>;

    fn log(&self, env: &Environment, record: &LogRecord);

    fn flush_logs(&self, _env: &Environment) {}

    fn set_up(&self) -> Result<(), HarnessError> {
        Ok(())
    }

    fn tear_down(&self) -> Result<(), HarnessError> {
        Ok(())
    }
}

/// Slot holding the active delegate.
///
/// Clones share the slot. Every call resolves the delegate at call time, so a
/// swapped-out delegate never sees another call through this proxy.
#[derive(Clone, Default)]
pub struct ApiProxy {
    active: Arc<RwLock<Option<Arc<dyn Delegate>>>>,
}

impl ApiProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delegate(delegate: Arc<dyn Delegate>) -> Self {
        let proxy = Self::new();
        let _ = proxy.set_delegate(delegate);
        proxy
    }

    /// Install `delegate`, returning the one it replaced.
    pub fn set_delegate(&self, delegate: Arc<dyn Delegate>) -> Option<Arc<dyn Delegate>> {
        let previous = match self.active.write() {
            Ok(mut slot) => slot.replace(delegate),
            Err(poisoned) => poisoned.into_inner().replace(delegate),
        };
        append_run_log(
            "debug",
            "api_proxy.delegate.installed",
            json!({ "replaced": previous.is_some() }),
        );
        previous
    }

    pub fn clear_delegate(&self) -> Option<Arc<dyn Delegate>> {
        let previous = match self.active.write() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        append_run_log(
            "debug",
            "api_proxy.delegate.cleared",
            json!({ "had_delegate": previous.is_some() }),
        );
        previous
    }

    pub fn delegate(&self) -> Option<Arc<dyn Delegate>> {
        match self.active.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Route a call through the active delegate using the current thread's
    /// environment.
    pub fn make_sync_call(
        &self,
        package: &str,
        method: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, HarnessError> {
        let env = require_environment()?;
        let delegate = self.delegate().ok_or(HarnessError::NoDelegate)?;
        delegate.make_sync_call(&env, package, method, request)
    }

    pub fn log(&self, record: &LogRecord) -> Result<(), HarnessError> {
        let env = require_environment()?;
        let delegate = self.delegate().ok_or(HarnessError::NoDelegate)?;
        delegate.log(&env, record);
        Ok(())
    }

    pub fn flush_logs(&self) -> Result<(), HarnessError> {
        let env = require_environment()?;
        let delegate = self.delegate().ok_or(HarnessError::NoDelegate)?;
        delegate.flush_logs(&env);
        Ok(())
    }
}
