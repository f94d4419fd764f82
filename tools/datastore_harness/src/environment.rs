//! Ambient request context bound to the current thread.
//!
//! Backend calls read the installed [`Environment`] instead of taking it as a
//! parameter. There is no nesting: installing a context replaces whatever the
//! thread had before.

use crate::errors::HarnessError;
use crate::logging::append_run_log;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::RefCell;

pub const DEFAULT_APP_ID: &str = "test";
pub const DEFAULT_VERSION_ID: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    app_id: String,
    version_id: String,
    namespace: String,
}

impl Environment {
    pub fn new(
        app_id: impl Into<String>,
        version_id: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            version_id: version_id.into(),
            namespace: namespace.into(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn email(&self) -> Result<String, HarnessError> {
        Err(HarnessError::UnsupportedEnvironment("email"))
    }

    pub fn is_logged_in(&self) -> Result<bool, HarnessError> {
        Err(HarnessError::UnsupportedEnvironment("is_logged_in"))
    }

    pub fn is_admin(&self) -> Result<bool, HarnessError> {
        Err(HarnessError::UnsupportedEnvironment("is_admin"))
    }

    pub fn auth_domain(&self) -> Result<String, HarnessError> {
        Err(HarnessError::UnsupportedEnvironment("auth_domain"))
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(DEFAULT_APP_ID, DEFAULT_VERSION_ID, "")
    }
}

thread_local! {
    static CURRENT_ENVIRONMENT: RefCell<Option<Environment>> = const { RefCell::new(None) };
}

pub fn set_environment_for_current_thread(env: Environment) {
    append_run_log(
        "debug",
        "environment.installed",
        json!({
            "app_id": env.app_id(),
            "version_id": env.version_id(),
            "namespace": env.namespace(),
        }),
    );
    CURRENT_ENVIRONMENT.with(|cell| *cell.borrow_mut() = Some(env));
}

pub fn clear_environment_for_current_thread() {
    let had_env = CURRENT_ENVIRONMENT.with(|cell| cell.borrow_mut().take().is_some());
    append_run_log(
        "debug",
        "environment.cleared",
        json!({ "had_environment": had_env }),
    );
}

pub fn current_environment() -> Option<Environment> {
    CURRENT_ENVIRONMENT.with(|cell| cell.borrow().clone())
}

pub fn require_environment() -> Result<Environment, HarnessError> {
    current_environment().ok_or(HarnessError::NoEnvironment)
}
