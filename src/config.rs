//! Persisted JSON configuration
//! Holds the domain -> path -> route document stored at `<volume>/config.json`

use crate::error::ConfigError;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Key inside a domain object naming the certificate bundle
pub const CERT_NAME: &str = "cert-name";

const CONFIG_FILE: &str = "config.json";

/// Allowed origins for a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsPolicy {
    /// `"*"`: origin checking disabled
    Any,
    /// Origin suffixes that are admitted
    Origins(Vec<String>),
}

impl Serialize for CorsPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CorsPolicy::Any => serializer.serialize_str("*"),
            CorsPolicy::Origins(origins) => origins.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CorsPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Wildcard(String),
            Origins(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Wildcard(s) if s == "*" => Ok(CorsPolicy::Any),
            Raw::Wildcard(s) => Err(de::Error::custom(format!(
                "cors must be \"*\" or a list of origins, got \"{}\"",
                s
            ))),
            Raw::Origins(origins) => Ok(CorsPolicy::Origins(origins)),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Serve files from a folder inside the data volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRule {
    pub folder: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsPolicy>,

    /// Strip the matched prefix from the served path
    #[serde(default, skip_serializing_if = "is_false")]
    pub relative: bool,
}

/// Forward to an HTTP(S) server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamRule {
    /// Upstream domain or IP
    #[serde(rename = "domain")]
    pub target_host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Default headers; inbound request headers win on collision
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(rename = "https", default, skip_serializing_if = "is_false")]
    pub use_https: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsPolicy>,

    /// Send `Host: <target_host>` instead of the requested hostname
    #[serde(rename = "rewriteDomain", default, skip_serializing_if = "is_false")]
    pub rewrite_host: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub relative: bool,
}

/// A single path binding. Entries carrying `folder` are static.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteRule {
    Static(StaticRule),
    Upstream(UpstreamRule),
}

impl RouteRule {
    pub fn cors(&self) -> Option<&CorsPolicy> {
        match self {
            RouteRule::Static(rule) => rule.cors.as_ref(),
            RouteRule::Upstream(rule) => rule.cors.as_ref(),
        }
    }

    pub fn relative(&self) -> bool {
        match self {
            RouteRule::Static(rule) => rule.relative,
            RouteRule::Upstream(rule) => rule.relative,
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, RouteRule::Static(_))
    }
}

/// Everything configured under one hostname
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainConfig {
    pub cert_name: Option<String>,
    /// Path rules in declaration order
    pub routes: Vec<(String, RouteRule)>,
}

impl DomainConfig {
    pub fn route(&self, path: &str) -> Option<&RouteRule> {
        self.routes.iter().find(|(key, _)| key == path).map(|(_, rule)| rule)
    }

    /// Insert or replace the rule at `path`, keeping its position if it exists
    pub fn set_route(&mut self, path: impl Into<String>, rule: RouteRule) {
        let path = path.into();
        match self.routes.iter_mut().find(|(key, _)| *key == path) {
            Some(entry) => entry.1 = rule,
            None => self.routes.push((path, rule)),
        }
    }

    pub fn remove_route(&mut self, path: &str) -> Option<RouteRule> {
        let index = self.routes.iter().position(|(key, _)| key == path)?;
        Some(self.routes.remove(index).1)
    }
}

impl Serialize for DomainConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.routes.len() + usize::from(self.cert_name.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(cert_name) = &self.cert_name {
            map.serialize_entry(CERT_NAME, cert_name)?;
        }
        for (path, rule) in &self.routes {
            map.serialize_entry(path, rule)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DomainConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DomainVisitor;

        impl<'de> Visitor<'de> for DomainVisitor {
            type Value = DomainConfig;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of paths to routes")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut domain = DomainConfig::default();

                while let Some(key) = access.next_key::<String>()? {
                    let value: serde_json::Value = access.next_value()?;
                    match value {
                        serde_json::Value::String(name) => {
                            if key == CERT_NAME {
                                domain.cert_name = Some(name);
                            }
                        }
                        value => {
                            let rule = serde_json::from_value::<RouteRule>(value).map_err(|e| {
                                de::Error::custom(format!("route `{}`: {}", key, e))
                            })?;
                            domain.routes.push((key, rule));
                        }
                    }
                }

                Ok(domain)
            }
        }

        deserializer.deserialize_map(DomainVisitor)
    }
}

mod ordered_domains {
    use super::DomainConfig;
    use serde::de::{MapAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(
        domains: &[(String, DomainConfig)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(domains.iter().map(|(name, domain)| (name, domain)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, DomainConfig)>, D::Error> {
        struct DomainsVisitor;

        impl<'de> Visitor<'de> for DomainsVisitor {
            type Value = Vec<(String, DomainConfig)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of domain names")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut domains = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, domain)) = access.next_entry::<String, DomainConfig>()? {
                    domains.push((name, domain));
                }
                Ok(domains)
            }
        }

        deserializer.deserialize_map(DomainsVisitor)
    }
}

/// Root configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(with = "ordered_domains")]
    pub domains: Vec<(String, DomainConfig)>,
}

impl Config {
    /// Document written when no usable config exists yet
    pub fn default_document() -> Self {
        let mut test_com = DomainConfig {
            cert_name: Some("test.com".to_string()),
            routes: Vec::new(),
        };
        test_com.set_route("/", RouteRule::Upstream(UpstreamRule {
            target_host: "web-docker-container".to_string(),
            port: Some(8080),
            headers: BTreeMap::new(),
            use_https: false,
            cors: None,
            rewrite_host: false,
            relative: false,
        }));
        test_com.set_route("/api/", RouteRule::Upstream(UpstreamRule {
            target_host: "api-docker-container".to_string(),
            port: Some(8081),
            headers: BTreeMap::new(),
            use_https: false,
            cors: Some(CorsPolicy::Origins(vec!["test.com".to_string()])),
            rewrite_host: false,
            relative: true,
        }));

        let mut mirror = DomainConfig {
            cert_name: Some("test.com".to_string()),
            routes: Vec::new(),
        };
        mirror.set_route("/", RouteRule::Upstream(UpstreamRule {
            target_host: "test.cc".to_string(),
            port: None,
            headers: BTreeMap::new(),
            use_https: true,
            cors: Some(CorsPolicy::Any),
            rewrite_host: true,
            relative: false,
        }));

        let mut static_site = DomainConfig {
            cert_name: Some("test.com".to_string()),
            routes: Vec::new(),
        };
        static_site.set_route("/", RouteRule::Static(StaticRule {
            folder: "volFolder".to_string(),
            cors: Some(CorsPolicy::Any),
            relative: false,
        }));
        static_site.set_route("/extra/", RouteRule::Static(StaticRule {
            folder: "extraVolFolder".to_string(),
            cors: Some(CorsPolicy::Origins(vec![
                "test.com".to_string(),
                "test.cc".to_string(),
            ])),
            relative: true,
        }));

        Self {
            domains: vec![
                ("test.com".to_string(), test_com),
                ("mirror.test.com".to_string(), mirror),
                ("static.test.com".to_string(), static_site),
            ],
        }
    }

    /// Location of the config document inside a volume
    pub fn config_path<P: AsRef<Path>>(volume_path: P) -> PathBuf {
        volume_path.as_ref().join(CONFIG_FILE)
    }

    /// Strict load, used for reloads where a broken file must not be replaced
    pub fn read<P: AsRef<Path>>(volume_path: P) -> Result<Self, ConfigError> {
        let path = Self::config_path(&volume_path);
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load the config, writing the default document when it is missing or unreadable
    pub fn load<P: AsRef<Path>>(volume_path: P) -> Result<Self, ConfigError> {
        match Self::read(&volume_path) {
            Ok(config) => {
                info!(
                    "Loaded config with {} domains from {}",
                    config.domains.len(),
                    Self::config_path(&volume_path).display()
                );
                Ok(config)
            }
            Err(e) => {
                warn!("Config unusable ({}), replacing it with defaults", e);
                let config = Self::default_document();
                config.save(&volume_path)?;
                Ok(config)
            }
        }
    }

    /// Write the document as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, volume_path: P) -> Result<(), ConfigError> {
        let path = Self::config_path(&volume_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|source| ConfigError::Io { path, source })
    }

    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|(key, _)| key == name).map(|(_, domain)| domain)
    }

    pub fn domain_mut(&mut self, name: &str) -> Option<&mut DomainConfig> {
        self.domains
            .iter_mut()
            .find(|(key, _)| key == name)
            .map(|(_, domain)| domain)
    }

    /// Get a domain for editing, creating an empty one if needed
    pub fn domain_entry(&mut self, name: &str) -> &mut DomainConfig {
        let index = match self.domains.iter().position(|(key, _)| key == name) {
            Some(index) => index,
            None => {
                self.domains.push((name.to_string(), DomainConfig::default()));
                self.domains.len() - 1
            }
        };
        &mut self.domains[index].1
    }

    pub fn remove_domain(&mut self, name: &str) -> Option<DomainConfig> {
        let index = self.domains.iter().position(|(key, _)| key == name)?;
        Some(self.domains.remove(index).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_document() {
        let raw = r#"{
            "domains": {
                "test.com": {
                    "cert-name": "test.com",
                    "/": { "domain": "web", "port": 8080 },
                    "/api/": { "domain": "api", "cors": ["test.com"], "relative": true,
                               "headers": { "x-api-key": "secret" } }
                },
                "static.test.com": {
                    "/": { "folder": "volFolder", "cors": "*" }
                }
            }
        }"#;

        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.domains.len(), 2);

        let test_com = config.domain("test.com").unwrap();
        assert_eq!(test_com.cert_name.as_deref(), Some("test.com"));
        assert_eq!(test_com.routes[0].0, "/");
        assert_eq!(test_com.routes[1].0, "/api/");

        match test_com.route("/api/").unwrap() {
            RouteRule::Upstream(rule) => {
                assert_eq!(rule.target_host, "api");
                assert_eq!(rule.port, None);
                assert!(rule.relative);
                assert_eq!(rule.headers.get("x-api-key").map(String::as_str), Some("secret"));
                assert_eq!(rule.cors, Some(CorsPolicy::Origins(vec!["test.com".to_string()])));
            }
            other => panic!("expected upstream rule, got {:?}", other),
        }

        let static_site = config.domain("static.test.com").unwrap();
        assert!(static_site.cert_name.is_none());
        assert!(static_site.route("/").unwrap().is_static());
        assert_eq!(static_site.route("/").unwrap().cors(), Some(&CorsPolicy::Any));
    }

    #[test]
    fn test_folder_wins_over_domain() {
        let rule: RouteRule =
            serde_json::from_str(r#"{ "folder": "site", "domain": "ignored" }"#).unwrap();
        assert!(rule.is_static());
    }

    #[test]
    fn test_bad_cors_string_rejected() {
        let result = serde_json::from_str::<RouteRule>(r#"{ "folder": "site", "cors": "test.com" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_read_round_trip() {
        let dir = tempdir().unwrap();
        let config = Config::default_document();

        config.save(dir.path()).unwrap();
        let reloaded = Config::read(dir.path()).unwrap();

        assert_eq!(config, reloaded);
        let names: Vec<&str> = reloaded.domains.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["test.com", "mirror.test.com", "static.test.com"]);
    }

    #[test]
    fn test_load_missing_writes_defaults() {
        let dir = tempdir().unwrap();

        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config, Config::default_document());
        assert!(Config::config_path(dir.path()).exists());
    }

    #[test]
    fn test_load_corrupt_replaces_file() {
        let dir = tempdir().unwrap();
        fs::write(Config::config_path(dir.path()), "{ not json").unwrap();

        assert!(Config::read(dir.path()).is_err());
        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config, Config::default_document());
        assert_eq!(Config::read(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_domain_editing() {
        let mut config = Config::default();
        let domain = config.domain_entry("example.com");
        domain.set_route("/", RouteRule::Static(StaticRule {
            folder: "site".to_string(),
            cors: None,
            relative: false,
        }));
        domain.set_route("/", RouteRule::Static(StaticRule {
            folder: "other".to_string(),
            cors: None,
            relative: false,
        }));

        let domain = config.domain("example.com").unwrap();
        assert_eq!(domain.routes.len(), 1);
        assert!(matches!(domain.route("/"), Some(RouteRule::Static(rule)) if rule.folder == "other"));

        assert!(config.domain_mut("example.com").unwrap().remove_route("/").is_some());
        assert!(config.remove_domain("example.com").is_some());
        assert!(config.domains.is_empty());
    }
}
