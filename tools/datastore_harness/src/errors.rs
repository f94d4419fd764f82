use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HarnessError {
    #[error("concurrent modification detected on {method}")]
    ConcurrentModification { method: String },
    #[error("detected a write: {method}")]
    WriteBlocked { method: String },
    #[error("fixture setup failed: {0}")]
    Setup(String),
    #[error(
        "datastore service still has an active txn. Please rollback or commit all txns before test completes."
    )]
    DanglingTransaction,
    #[error("{0} is not supported by the test environment")]
    UnsupportedEnvironment(&'static str),
    #[error("no environment installed for the current thread")]
    NoEnvironment,
    #[error("no delegate installed")]
    NoDelegate,
    #[error("no datastore service installed")]
    NoService,
    #[error("invalid fixture transition: {0}")]
    InvalidTransition(String),
    #[error("no entity found for key {0}")]
    EntityNotFound(String),
    #[error("datastore error: {0}")]
    Datastore(String),
    #[error("wire error: {0}")]
    Wire(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl HarnessError {
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    pub fn is_write_blocked(&self) -> bool {
        matches!(self, Self::WriteBlocked { .. })
    }
}
