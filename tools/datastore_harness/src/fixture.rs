use crate::api_proxy::{ApiProxy, Delegate};
use crate::config::HarnessConfig;
use crate::datastore::local::LocalDatastoreDelegate;
use crate::datastore::service::{DatastoreService, DatastoreServiceFactory, RpcDatastoreService};
use crate::environment::{clear_environment_for_current_thread, set_environment_for_current_thread};
use crate::errors::HarnessError;
use crate::logging::{append_run_log, clear_run_logger, init_run_logger, JsonlLogger};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixturePhase {
    Uninitialized,
    ContextInstalled,
    HandleInstalled,
    TransactionChecked,
    HandleCleared,
    ContextCleared,
}

/// Fixtures may be set up again once fully torn down.
pub fn validate_transition(from: FixturePhase, to: FixturePhase) -> Result<(), HarnessError> {
    use FixturePhase as P;

    let allowed = match from {
        P::Uninitialized | P::ContextCleared => matches!(to, P::ContextInstalled),
        P::ContextInstalled => matches!(to, P::HandleInstalled | P::ContextCleared),
        P::HandleInstalled => matches!(to, P::TransactionChecked),
        P::TransactionChecked => matches!(to, P::HandleCleared),
        P::HandleCleared => matches!(to, P::ContextCleared),
    };

    if !allowed {
        return Err(HarnessError::InvalidTransition(format!(
            "{:?} -> {:?}",
            from, to
        )));
    }
    Ok(())
}

pub type DelegateConstructor =
    Arc<dyn Fn(&HarnessConfig) -> Result<Arc<dyn Delegate>, HarnessError> + Send + Sync>;

/// Delegate constructors by configuration name.
#[derive(Default)]
pub struct DelegateRegistry {
    constructors: BTreeMap<String, DelegateConstructor>,
}

impl DelegateRegistry {
    pub fn with_defaults() -> Self {
        let mut this = Self::default();
        this.register(
            "local",
            Arc::new(|cfg: &HarnessConfig| -> Result<Arc<dyn Delegate>, HarnessError> {
                Ok(Arc::new(
                    LocalDatastoreDelegate::in_memory()
                        .with_query_batch_size(cfg.local.query_batch_size),
                ))
            }),
        );
        this.register(
            "sqlite",
            Arc::new(|cfg: &HarnessConfig| -> Result<Arc<dyn Delegate>, HarnessError> {
                Ok(Arc::new(
                    LocalDatastoreDelegate::sqlite_in_memory()?
                        .with_query_batch_size(cfg.local.query_batch_size),
                ))
            }),
        );
        this
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: DelegateConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn create(
        &self,
        name: &str,
        cfg: &HarnessConfig,
    ) -> Result<Arc<dyn Delegate>, HarnessError> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            HarnessError::Setup(format!(
                "no delegate registered as `{name}` (known: {})",
                self.names().join(", ")
            ))
        })?;
        constructor(cfg).map_err(|e| HarnessError::Setup(format!("delegate `{name}`: {e}")))
    }
}

/// Per-test fixture: installs the environment, the configured delegate and
/// a datastore service, and removes them again at teardown.
pub struct DatastoreTestHelper {
    config: HarnessConfig,
    delegate: Arc<dyn Delegate>,
    proxy: ApiProxy,
    factory: DatastoreServiceFactory,
    phase: FixturePhase,
    owns_run_logger: bool,
}

impl DatastoreTestHelper {
    pub fn new(config: HarnessConfig) -> Result<Self, HarnessError> {
        Self::with_registry(config, &DelegateRegistry::with_defaults())
    }

    pub fn with_registry(
        config: HarnessConfig,
        registry: &DelegateRegistry,
    ) -> Result<Self, HarnessError> {
        let delegate = registry.create(&config.datastore.delegate, &config)?;
        Ok(Self {
            config,
            delegate,
            proxy: ApiProxy::new(),
            factory: DatastoreServiceFactory::new(),
            phase: FixturePhase::Uninitialized,
            owns_run_logger: false,
        })
    }

    pub fn phase(&self) -> FixturePhase {
        self.phase
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The configured delegate, undecorated.
    pub fn delegate(&self) -> &Arc<dyn Delegate> {
        &self.delegate
    }

    pub fn proxy(&self) -> &ApiProxy {
        &self.proxy
    }

    pub fn factory(&self) -> &DatastoreServiceFactory {
        &self.factory
    }

    /// The service currently installed in the factory, decorators included.
    pub fn ds(&self) -> Result<Arc<dyn DatastoreService>, HarnessError> {
        self.factory.service()
    }

    pub fn set_up(&mut self) -> Result<(), HarnessError> {
        validate_transition(self.phase, FixturePhase::ContextInstalled)?;
        if let Some(path) = &self.config.logging.path {
            init_run_logger(JsonlLogger {
                path: path.clone(),
                max_payload_bytes: self.config.logging.max_payload_bytes,
            });
            self.owns_run_logger = true;
        }

        set_environment_for_current_thread(self.config.environment());
        self.phase = FixturePhase::ContextInstalled;

        if let Err(err) = self.delegate.set_up() {
            clear_environment_for_current_thread();
            self.phase = FixturePhase::ContextCleared;
            self.release_run_logger();
            return Err(HarnessError::Setup(err.to_string()));
        }
        self.proxy.set_delegate(self.delegate.clone());
        self.factory.set_service(Arc::new(
            RpcDatastoreService::new(self.proxy.clone())
                .with_query_batch_size(self.config.local.query_batch_size),
        ));
        self.phase = FixturePhase::HandleInstalled;
        append_run_log(
            "info",
            "fixture.set_up",
            json!({
                "delegate": self.config.datastore.delegate,
                "app_id": self.config.environment.app_id,
            }),
        );
        Ok(())
    }

    /// Roll back any open transaction, uninstall everything `set_up`
    /// installed and tear the delegate down. With `exception_if_active_txn`
    /// an open transaction is reported as `DanglingTransaction`.
    ///
    /// All steps run even when an earlier one fails; the first error wins.
    pub fn tear_down(&mut self, exception_if_active_txn: bool) -> Result<(), HarnessError> {
        validate_transition(self.phase, FixturePhase::TransactionChecked)?;
        let mut first_error = self.check_transactions(exception_if_active_txn).err();
        self.phase = FixturePhase::TransactionChecked;

        self.factory.clear_service();
        self.proxy.clear_delegate();
        if let Err(err) = self.delegate.tear_down() {
            first_error.get_or_insert(err);
        }
        self.phase = FixturePhase::HandleCleared;

        clear_environment_for_current_thread();
        self.phase = FixturePhase::ContextCleared;
        append_run_log(
            "info",
            "fixture.tear_down",
            json!({
                "strict": exception_if_active_txn,
                "error": first_error.as_ref().map(ToString::to_string),
            }),
        );
        self.release_run_logger();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Later fixtures must not write into this fixture's log file.
    fn release_run_logger(&mut self) {
        if std::mem::take(&mut self.owns_run_logger) {
            clear_run_logger();
        }
    }

    fn check_transactions(&self, exception_if_active_txn: bool) -> Result<(), HarnessError> {
        let Some(service) = self.factory.current() else {
            return Ok(());
        };
        let Some(txn) = service.current_transaction()? else {
            return Ok(());
        };
        let rollback = service.rollback(&txn);
        if exception_if_active_txn {
            return Err(HarnessError::DanglingTransaction);
        }
        append_run_log(
            "warn",
            "fixture.dangling_transaction",
            json!({ "handle": txn.handle, "rolled_back": rollback.is_ok() }),
        );
        rollback
    }
}

impl Drop for DatastoreTestHelper {
    fn drop(&mut self) {
        match self.phase {
            FixturePhase::HandleInstalled => {
                let _ = self.tear_down(false);
            }
            FixturePhase::ContextInstalled => {
                clear_environment_for_current_thread();
                self.release_run_logger();
            }
            _ => {}
        }
    }
}

/// Run `body` inside a fully set-up fixture, tearing it down on every exit
/// path. A body error takes precedence over a teardown error.
pub fn with_datastore<T>(
    config: HarnessConfig,
    exception_if_active_txn: bool,
    body: impl FnOnce(&DatastoreTestHelper) -> Result<T, HarnessError>,
) -> Result<T, HarnessError> {
    let mut helper = DatastoreTestHelper::new(config)?;
    helper.set_up()?;
    let result = body(&helper);
    let teardown = helper.tear_down(exception_if_active_txn);
    let value = result?;
    teardown?;
    Ok(value)
}
