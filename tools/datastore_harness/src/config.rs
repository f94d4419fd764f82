use crate::datastore::local::DEFAULT_QUERY_BATCH_SIZE;
use crate::environment::Environment;
use crate::errors::HarnessError;
use crate::logging::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::runtime::{FileSystem, ProductionFileSystem};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Property naming the delegate the fixture installs.
pub const DATASTORE_DELEGATE_PROP: &str = "orm.DatastoreDelegate";
pub const DATASTORE_DELEGATE_ENV: &str = "ORM_DATASTORE_DELEGATE";
pub const DEFAULT_DELEGATE: &str = "local";

/// System-property style overrides, applied after the config file.
pub type Properties = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessConfig {
    pub datastore: DatastoreConfig,
    pub environment: EnvironmentConfig,
    pub local: LocalConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatastoreConfig {
    pub delegate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub app_id: String,
    pub version_id: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalConfig {
    pub query_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    pub max_payload_bytes: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let env = Environment::default();
        Self {
            datastore: DatastoreConfig {
                delegate: DEFAULT_DELEGATE.to_string(),
            },
            environment: EnvironmentConfig {
                app_id: env.app_id().to_string(),
                version_id: env.version_id().to_string(),
                namespace: env.namespace().to_string(),
            },
            local: LocalConfig {
                query_batch_size: DEFAULT_QUERY_BATCH_SIZE,
            },
            logging: LoggingConfig {
                path: None,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            },
        }
    }
}

impl HarnessConfig {
    pub fn with_delegate(mut self, name: impl Into<String>) -> Self {
        self.datastore.delegate = name.into();
        self
    }

    pub fn environment(&self) -> Environment {
        Environment::new(
            &self.environment.app_id,
            &self.environment.version_id,
            &self.environment.namespace,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialHarnessConfig {
    datastore: Option<PartialDatastoreConfig>,
    environment: Option<PartialEnvironmentConfig>,
    local: Option<PartialLocalConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialDatastoreConfig {
    delegate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialEnvironmentConfig {
    app_id: Option<String>,
    version_id: Option<String>,
    namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLocalConfig {
    query_batch_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
}

/// Defaults, then the optional TOML file, then `properties`.
pub fn load_config(
    config_path: Option<&Path>,
    properties: &Properties,
    fs: &dyn FileSystem,
) -> Result<HarnessConfig, HarnessError> {
    let mut cfg = HarnessConfig::default();

    if let Some(path) = config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialHarnessConfig = toml::from_str(&file_contents)
            .map_err(|e| HarnessError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_properties(&mut cfg, properties);
    validate_config(&cfg)?;
    Ok(cfg)
}

/// `load_config` against the real disk with properties from the process
/// environment.
pub fn load_config_from_disk(config_path: Option<&Path>) -> Result<HarnessConfig, HarnessError> {
    load_config(config_path, &properties_from_env(), &ProductionFileSystem)
}

/// Collect recognized properties from the process environment.
pub fn properties_from_env() -> Properties {
    let mut properties = Properties::new();
    if let Ok(value) = std::env::var(DATASTORE_DELEGATE_ENV) {
        properties.insert(DATASTORE_DELEGATE_PROP.to_string(), value);
    }
    properties
}

fn merge_partial_config(cfg: &mut HarnessConfig, partial: PartialHarnessConfig) {
    if let Some(datastore) = partial.datastore {
        if let Some(delegate) = datastore.delegate {
            cfg.datastore.delegate = delegate;
        }
    }

    if let Some(environment) = partial.environment {
        if let Some(app_id) = environment.app_id {
            cfg.environment.app_id = app_id;
        }
        if let Some(version_id) = environment.version_id {
            cfg.environment.version_id = version_id;
        }
        if let Some(namespace) = environment.namespace {
            cfg.environment.namespace = namespace;
        }
    }

    if let Some(local) = partial.local {
        if let Some(query_batch_size) = local.query_batch_size {
            cfg.local.query_batch_size = query_batch_size;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.path {
            cfg.logging.path = Some(path);
        }
        if let Some(max_payload_bytes) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = max_payload_bytes;
        }
    }
}

fn apply_properties(cfg: &mut HarnessConfig, properties: &Properties) {
    if let Some(delegate) = properties.get(DATASTORE_DELEGATE_PROP) {
        cfg.datastore.delegate = delegate.clone();
    }
}

fn validate_config(cfg: &HarnessConfig) -> Result<(), HarnessError> {
    if cfg.datastore.delegate.trim().is_empty() {
        return Err(HarnessError::InvalidConfig(
            "datastore.delegate must name a registered delegate".to_string(),
        ));
    }

    if cfg.environment.app_id.trim().is_empty() {
        return Err(HarnessError::InvalidConfig(
            "environment.app_id must not be empty".to_string(),
        ));
    }

    if cfg.local.query_batch_size == 0 {
        return Err(HarnessError::InvalidConfig(
            "local.query_batch_size must be greater than zero".to_string(),
        ));
    }

    Ok(())
}
