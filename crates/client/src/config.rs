//! Connection configuration.
//!
//! A `ConnectionConfig` is built from exactly one credential source: the
//! structured service credentials object, or a site-configuration file. The
//! two forms have separate constructors; there is no runtime type sniffing.

use cellar_common::ConfigError;
use roxmltree::{Document, Node, ParsingOptions};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// Scheme used for endpoints derived from service credentials.
pub const SERVICE_SCHEME: &str = "webhbase";

/// Property holding the full gateway URL from the service credentials,
/// gateway path included.
pub const SERVICE_URL_PROPERTY: &str = "webhbase.service.url";

/// A string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeytabAuth {
    pub principal: String,
    pub keytab: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// User/password from the service credentials object.
    Service { user: String, password: Secret },
    /// A site-configuration file, optionally carrying keytab/principal auth.
    SiteFile { path: PathBuf, keytab: Option<KeytabAuth> },
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    endpoint: String,
    source: CredentialSource,
    properties: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Builds a config from the service credentials object:
    ///
    /// ```json
    /// { "cluster": { "user": "u", "password": "p",
    ///                "service_endpoints": { "webhbase": "https://host:8443/gateway/default/webhbase/v1/" } } }
    /// ```
    pub fn from_service_credentials(credentials: &Value) -> Result<Self, ConfigError> {
        let object = credentials
            .as_object()
            .ok_or_else(|| ConfigError::invalid_type("credentials", "a JSON object"))?;
        let cluster = object
            .get("cluster")
            .ok_or_else(|| ConfigError::invalid_value("credentials", "missing 'cluster' section"))?;
        if !cluster.is_object() {
            return Err(ConfigError::invalid_type("credentials.cluster", "a JSON object"));
        }

        let user = required_string(cluster, &["user"], "cluster.user")?;
        let password = required_string(cluster, &["password"], "cluster.password")?;
        let uri = required_string(
            cluster,
            &["service_endpoints", "webhbase"],
            "cluster.service_endpoints.webhbase",
        )?;
        let endpoint = endpoint_from_uri(&uri, Some(SERVICE_SCHEME))?;

        Ok(Self {
            endpoint,
            source: CredentialSource::Service { user, password: Secret::new(password) },
            properties: BTreeMap::from([(SERVICE_URL_PROPERTY.to_string(), uri)]),
        })
    }

    /// Builds a config from a site-configuration file on disk.
    pub fn from_site_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Missing(format!("site configuration {}: {}", path.display(), e))
        })?;
        Self::from_site_document(path, &text)
    }

    /// Parses an already-loaded site-configuration document.
    pub fn from_site_document(path: impl Into<PathBuf>, text: &str) -> Result<Self, ConfigError> {
        let properties = parse_site_properties(text)?;
        let endpoint = endpoint_from_properties(&properties)?;

        let keytab = match (
            properties.get("hbase.client.keytab.principal"),
            properties.get("hbase.client.keytab.file"),
        ) {
            (Some(principal), Some(file)) => Some(KeytabAuth {
                principal: principal.clone(),
                keytab: PathBuf::from(file),
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::invalid_value(
                    "hbase.client.keytab",
                    "principal and keytab file must be given together",
                ))
            }
        };

        Ok(Self {
            endpoint,
            source: CredentialSource::SiteFile { path: path.into(), keytab },
            properties,
        })
    }

    /// `scheme://host:port` (or `file:///path` for local stores).
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn scheme(&self) -> &str {
        self.endpoint.split("://").next().unwrap_or_default()
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

fn required_string(root: &Value, path: &[&str], param: &str) -> Result<String, ConfigError> {
    let mut current = root;
    for key in path {
        current = current
            .get(key)
            .ok_or_else(|| ConfigError::invalid_value(param, "missing"))?;
    }
    let value = current
        .as_str()
        .ok_or_else(|| ConfigError::invalid_type(param, "a string"))?;
    if value.trim().is_empty() {
        return Err(ConfigError::invalid_value(param, "must not be empty"));
    }
    Ok(value.to_string())
}

/// Strips a URI down to its network authority and rebuilds it as
/// `scheme://host:port`. `file:` URIs keep their path instead.
pub fn endpoint_from_uri(uri: &str, scheme: Option<&str>) -> Result<String, ConfigError> {
    let parsed = Url::parse(uri)
        .map_err(|e| ConfigError::invalid_value("endpoint", format!("'{}': {}", uri, e)))?;
    if parsed.scheme() == "file" {
        return Ok(format!("file://{}", parsed.path()));
    }
    if parsed.scheme() == "memory" {
        return Ok(format!("memory://{}", parsed.host_str().unwrap_or_default()));
    }
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ConfigError::invalid_value("endpoint", format!("'{}' has no host", uri)))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| ConfigError::invalid_value("endpoint", format!("'{}' has no port", uri)))?;
    Ok(format!("{}://{}:{}", scheme.unwrap_or(parsed.scheme()), host, port))
}

fn endpoint_from_properties(properties: &BTreeMap<String, String>) -> Result<String, ConfigError> {
    if let Some(default_fs) = properties.get("fs.defaultFS") {
        return endpoint_from_uri(default_fs, None);
    }
    if let Some(host) = properties.get("hbase.rest.host") {
        let port = properties
            .get("hbase.rest.port")
            .ok_or_else(|| ConfigError::invalid_value("hbase.rest.port", "missing"))?;
        return host_port_endpoint(host, port, "hbase.rest.port");
    }
    if let Some(quorum) = properties.get("hbase.zookeeper.quorum") {
        let host = quorum.split(',').map(str::trim).find(|h| !h.is_empty()).ok_or_else(|| {
            ConfigError::invalid_value("hbase.zookeeper.quorum", "no host listed")
        })?;
        let port = properties.get("hbase.zookeeper.property.clientPort").ok_or_else(|| {
            ConfigError::invalid_value("hbase.zookeeper.property.clientPort", "missing")
        })?;
        return host_port_endpoint(host, port, "hbase.zookeeper.property.clientPort");
    }
    Err(ConfigError::invalid_value(
        "site configuration",
        "no host/port pair (fs.defaultFS, hbase.rest.host or hbase.zookeeper.quorum)",
    ))
}

fn host_port_endpoint(host: &str, port: &str, param: &str) -> Result<String, ConfigError> {
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid_type(param, "a port number"))?;
    Ok(format!("hbase://{}:{}", host.trim(), port))
}

/// Extracts `<property><name/><value/></property>` pairs from a Hadoop-style
/// site document. Comments are skipped; CDATA and entities are decoded.
pub fn parse_site_properties(text: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let options = ParsingOptions { allow_dtd: true, ..ParsingOptions::default() };
    let doc = Document::parse_with_options(text, options)
        .map_err(|e| ConfigError::invalid_value("site configuration", e.to_string()))?;
    let root = doc.root_element();
    if !root.has_tag_name("configuration") {
        return Err(ConfigError::invalid_value(
            "site configuration",
            format!("root element is <{}>, not <configuration>", root.tag_name().name()),
        ));
    }

    let mut properties = BTreeMap::new();
    for property in root.children().filter(|n| n.has_tag_name("property")) {
        let Some(name) = child_text(property, "name") else {
            return Err(ConfigError::invalid_value("site configuration", "property without <name>"));
        };
        let value = child_text(property, "value").unwrap_or_default();
        properties.insert(name, value);
    }
    Ok(properties)
}

fn child_text(node: Node<'_, '_>, tag: &str) -> Option<String> {
    let child = node.children().find(|n| n.has_tag_name(tag))?;
    let text: String = child.children().filter(|n| n.is_text()).filter_map(|n| n.text()).collect();
    Some(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service_credentials() -> Value {
        json!({
            "cluster": {
                "user": "clsadmin",
                "password": "s3cret",
                "service_endpoints": {
                    "webhbase": "https://chs-abc.example.net:8443/gateway/default/webhbase/v1/"
                }
            }
        })
    }

    #[test]
    fn service_credentials_strip_to_authority() {
        let config = ConnectionConfig::from_service_credentials(&service_credentials()).unwrap();
        assert_eq!(config.endpoint(), "webhbase://chs-abc.example.net:8443");
        assert_eq!(config.scheme(), "webhbase");
        assert_eq!(
            config.property(SERVICE_URL_PROPERTY),
            Some("https://chs-abc.example.net:8443/gateway/default/webhbase/v1/")
        );
        match config.source() {
            CredentialSource::Service { user, password } => {
                assert_eq!(user, "clsadmin");
                assert_eq!(password.expose(), "s3cret");
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn service_credentials_wrong_type() {
        let err = ConnectionConfig::from_service_credentials(&json!(["not", "an", "object"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidType { .. }));
    }

    #[test]
    fn service_credentials_wrong_shape() {
        let err = ConnectionConfig::from_service_credentials(&json!({"user": "x"})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let mut creds = service_credentials();
        creds["cluster"]["service_endpoints"] = json!({});
        let err = ConnectionConfig::from_service_credentials(&creds).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let config = ConnectionConfig::from_service_credentials(&service_credentials()).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn site_document_zookeeper_quorum() {
        let doc = r#"<?xml version="1.0"?>
<configuration>
  <property>
    <name>hbase.zookeeper.quorum</name>
    <value>zk1.example.net,zk2.example.net</value>
  </property>
  <property>
    <name>hbase.zookeeper.property.clientPort</name>
    <value>2181</value>
    <description>ZooKeeper client port</description>
  </property>
</configuration>"#;
        let config = ConnectionConfig::from_site_document("/etc/hbase-site.xml", doc).unwrap();
        assert_eq!(config.endpoint(), "hbase://zk1.example.net:2181");
        assert_eq!(config.property("hbase.zookeeper.property.clientPort"), Some("2181"));
        assert!(matches!(config.source(), CredentialSource::SiteFile { keytab: None, .. }));
    }

    #[test]
    fn site_document_default_fs_file_url() {
        let doc = "<configuration><property><name>fs.defaultFS</name>\
                   <value>file:///var/lib/cellar</value></property></configuration>";
        let config = ConnectionConfig::from_site_document("core-site.xml", doc).unwrap();
        assert_eq!(config.endpoint(), "file:///var/lib/cellar");
    }

    #[test]
    fn site_document_keytab_auth() {
        let doc = "<configuration>\
            <property><name>hbase.rest.host</name><value>rest.example.net</value></property>\
            <property><name>hbase.rest.port</name><value>8080</value></property>\
            <property><name>hbase.client.keytab.principal</name><value>streams@EXAMPLE.NET</value></property>\
            <property><name>hbase.client.keytab.file</name><value>/etc/security/streams.keytab</value></property>\
            </configuration>";
        let config = ConnectionConfig::from_site_document("hbase-site.xml", doc).unwrap();
        match config.source() {
            CredentialSource::SiteFile { keytab: Some(auth), .. } => {
                assert_eq!(auth.principal, "streams@EXAMPLE.NET");
            }
            other => panic!("expected keytab auth, got {:?}", other),
        }
    }

    #[test]
    fn site_document_without_host_port_is_rejected() {
        let doc = "<configuration><property><name>x</name><value>y</value></property></configuration>";
        let err = ConnectionConfig::from_site_document("x.xml", doc).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn site_document_bad_port_is_wrong_type() {
        let doc = "<configuration>\
            <property><name>hbase.rest.host</name><value>h</value></property>\
            <property><name>hbase.rest.port</name><value>eighty</value></property>\
            </configuration>";
        let err = ConnectionConfig::from_site_document("x.xml", doc).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidType { .. }));
    }

    #[test]
    fn missing_site_file() {
        let err = ConnectionConfig::from_site_file("/definitely/not/here.xml").unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn unescapes_entities() {
        let props = parse_site_properties(
            "<configuration><property><name>k</name><value>a&amp;b</value></property></configuration>",
        )
        .unwrap();
        assert_eq!(props.get("k").map(String::as_str), Some("a&b"));
    }

    #[test]
    fn commented_out_properties_are_ignored() {
        let doc = r#"<?xml version="1.0"?>
<configuration>
  <!--
  <property><name>hbase.rest.host</name><value>old.example.net</value></property>
  <property><name>hbase.rest.port</name><value>8080</value></property>
  -->
  <property><name>hbase.zookeeper.quorum</name><value>zk.example.net</value></property>
  <property><name>hbase.zookeeper.property.clientPort</name><value>2181</value></property>
</configuration>"#;
        let config = ConnectionConfig::from_site_document("hbase-site.xml", doc).unwrap();
        assert_eq!(config.endpoint(), "hbase://zk.example.net:2181");
        assert_eq!(config.property("hbase.rest.host"), None);
    }

    #[test]
    fn cdata_values_are_read() {
        let props = parse_site_properties(
            "<configuration><property><name>k</name><value><![CDATA[a<b>&c]]></value></property></configuration>",
        )
        .unwrap();
        assert_eq!(props.get("k").map(String::as_str), Some("a<b>&c"));
    }

    #[test]
    fn empty_configuration_has_no_properties() {
        assert!(parse_site_properties("<configuration/>").unwrap().is_empty());
        assert!(parse_site_properties("<properties/>").is_err());
        assert!(parse_site_properties("<configuration><property>").is_err());
    }
}
