//! Environment-derived site configuration.
//!
//! Resolution works on an explicit `EnvSnapshot` so callers (and tests)
//! decide what the environment is; nothing here reads process state except
//! `EnvSnapshot::from_process`.

use cellar_common::{ConfigError, Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// `HOST:PORT` of a cluster; triggers generation of a site file from the template.
pub const HOST_PORT_VAR: &str = "HADOOP_HOST_PORT";
/// Path to an existing site-configuration file.
pub const SITE_FILE_VAR: &str = "HBASE_SITE_XML";
/// File name of the generated site configuration.
pub const GENERATED_SITE_FILE: &str = "hbase-site.xml";

pub const HOST_TOKEN: &str = "%HOST%";
pub const PORT_TOKEN: &str = "%PORT%";

/// Site document rendered when only `HADOOP_HOST_PORT` is known.
pub const SITE_TEMPLATE: &str = r#"<?xml version="1.0"?>
<?xml-stylesheet type="text/xsl" href="configuration.xsl"?>
<configuration>
  <property>
    <name>hbase.zookeeper.quorum</name>
    <value>%HOST%</value>
  </property>
  <property>
    <name>hbase.zookeeper.property.clientPort</name>
    <value>%PORT%</value>
  </property>
  <property>
    <name>hbase.cluster.distributed</name>
    <value>true</value>
  </property>
</configuration>
"#;

#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn from_process() -> Self {
        Self { vars: std::env::vars().collect() }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self { vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    /// Returns the value, treating blank values as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.trim().is_empty())
    }
}

pub fn render_site_template(template: &str, host: &str, port: u16) -> String {
    template.replace(HOST_TOKEN, host).replace(PORT_TOKEN, &port.to_string())
}

fn parse_host_port(value: &str) -> std::result::Result<(String, u16), ConfigError> {
    let (host, port) = value
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::invalid_value(HOST_PORT_VAR, "expected HOST:PORT"))?;
    if host.is_empty() {
        return Err(ConfigError::invalid_value(HOST_PORT_VAR, "empty host"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::invalid_value(HOST_PORT_VAR, format!("bad port '{}'", port)))?;
    Ok((host.to_string(), port))
}

/// Resolves the site-configuration file to connect with.
///
/// Exactly one of `HADOOP_HOST_PORT` and `HBASE_SITE_XML` must be set. The
/// former renders `SITE_TEMPLATE` into `out_dir`; the latter must name an
/// existing file.
pub fn resolve_site_config(env: &EnvSnapshot, out_dir: &Path) -> Result<PathBuf> {
    match (env.get(HOST_PORT_VAR), env.get(SITE_FILE_VAR)) {
        (Some(_), Some(_)) => Err(Error::Config(ConfigError::Conflict(vec![
            HOST_PORT_VAR.to_string(),
            SITE_FILE_VAR.to_string(),
        ]))),
        (None, None) => Err(Error::Config(ConfigError::Missing(format!(
            "site configuration: set {} or {}",
            HOST_PORT_VAR, SITE_FILE_VAR
        )))),
        (None, Some(site)) => {
            let path = PathBuf::from(site);
            if !path.is_file() {
                return Err(Error::Config(ConfigError::Missing(format!(
                    "{} points to {}, which does not exist",
                    SITE_FILE_VAR,
                    path.display()
                ))));
            }
            Ok(path)
        }
        (Some(host_port), None) => {
            let (host, port) = parse_host_port(host_port)?;
            std::fs::create_dir_all(out_dir)?;
            let path = out_dir.join(GENERATED_SITE_FILE);
            std::fs::write(&path, render_site_template(SITE_TEMPLATE, &host, port))?;
            info!("Generated site configuration {} for {}:{}", path.display(), host, port);
            Ok(path)
        }
    }
}
