use crate::error::WorkerError;
use cellar_client::{resolve_site_config, ClientOptions, ConnectionConfig, EnvSnapshot};
use cellar_common::ConfigError;
use cellar_engine::{
    MutationConfig, MutationOptions, ReadConfig, ReadOptions, ScanConfig, ScanOptions, WriteConfig, WriteOptions,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_VAR: &str = "CELLAR_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "crates/worker/config/default.toml";

/// Where the connection comes from. At most one of the two files may be
/// named; with neither, the site file is resolved from the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// JSON service credentials.
    pub credentials_file: Option<PathBuf>,
    /// Site-configuration document.
    pub site_file: Option<PathBuf>,
    /// Where a site file generated from `HADOOP_HOST_PORT` is written.
    pub generated_dir: Option<PathBuf>,
}

impl ConnectionSettings {
    pub fn resolve(&self, env: &EnvSnapshot) -> Result<ConnectionConfig, WorkerError> {
        match (&self.credentials_file, &self.site_file) {
            (Some(_), Some(_)) => Err(ConfigError::Conflict(vec![
                "connection.credentials_file".to_string(),
                "connection.site_file".to_string(),
            ])
            .into()),
            (Some(path), None) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ConfigError::Missing(format!("credentials file {}: {}", path.display(), e))
                })?;
                let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                    ConfigError::invalid_type("connection.credentials_file", &format!("a JSON document ({})", e))
                })?;
                Ok(ConnectionConfig::from_service_credentials(&value)?)
            }
            (None, Some(path)) => Ok(ConnectionConfig::from_site_file(path)?),
            (None, None) => {
                let out_dir = self.generated_dir.clone().unwrap_or_else(std::env::temp_dir);
                let path = resolve_site_config(env, &out_dir)?;
                Ok(ConnectionConfig::from_site_file(path)?)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub client: ClientOptions,
    /// Capacity of the queues between workers.
    pub queue_capacity: usize,
    pub scan: Option<ScanOptions>,
    pub read: Option<ReadOptions>,
    pub write: Option<WriteOptions>,
    pub mutation: Option<MutationOptions>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            client: ClientOptions::default(),
            queue_capacity: default_queue_capacity(),
            scan: None,
            read: None,
            write: None,
            mutation: None,
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

/// Connector configurations after one validation pass.
#[derive(Debug, Clone, Default)]
pub struct Validated {
    pub scan: Option<ScanConfig>,
    pub read: Option<ReadConfig>,
    pub write: Option<WriteConfig>,
    pub mutation: Option<MutationConfig>,
}

impl Settings {
    /// Loads `path` (or `CELLAR_CONFIG_PATH`, or the default file), then
    /// applies `CELLAR__SECTION__KEY` environment overrides.
    pub fn new(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let config_file_path = match path {
            Some(path) => path.display().to_string(),
            None => std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
        };

        let s = config::Config::builder()
            .add_source(config::File::with_name(&config_file_path).required(path.is_some()))
            .add_source(config::Environment::with_prefix("CELLAR").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn from_toml(text: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<Validated, WorkerError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid_value("queue_capacity", "must be at least 1").into());
        }
        if self.read.is_some() && self.scan.is_none() {
            return Err(ConfigError::Missing("scan section to feed the read connector".to_string()).into());
        }
        Ok(Validated {
            scan: self.scan.clone().map(ScanOptions::validate).transpose()?,
            read: self.read.clone().map(ReadOptions::validate).transpose()?,
            write: self.write.clone().map(WriteOptions::validate).transpose()?,
            mutation: self.mutation.clone().map(MutationOptions::validate).transpose()?,
        })
    }
}
