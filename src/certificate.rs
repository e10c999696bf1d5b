//! Certificate resolution for SNI
//! Maps a handshake's server name to a TLS context, loading declared bundles from disk
//! and issuing self-signed certificates on demand

use crate::error::{CertificateError, ProxyError};
use crate::routes::RouteStore;
use dashmap::DashMap;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const PRIVKEY_FILE: &str = "privkey.pem";
pub const FULLCHAIN_FILE: &str = "fullchain.pem";

/// Suffix of the bundle name used for issued certificates
pub const AUTO_CERT_SUFFIX: &str = "-auto-generated";

pub const CERT_VALIDITY_DAYS: i64 = 395;
pub const RENEW_BEFORE_DAYS: i64 = 30;

/// Concurrent issuances allowed before handshakes fail fast
const MAX_CONCURRENT_ISSUES: usize = 4;

/// TLS context handed to a single handshake
pub type SecureContext = Arc<ServerConfig>;

/// Issues and checks certificate bundles stored as `privkey.pem` + `fullchain.pem`
pub trait CertificateIssuer: Send + Sync + 'static {
    /// Write a new key and certificate for `domain` into `dir`
    fn issue(&self, domain: &str, dir: &Path) -> Result<(), CertificateError>;

    /// Succeeds only when the bundle in `dir` is complete, matches, and is not near expiry
    fn validate(&self, dir: &Path) -> Result<(), CertificateError>;
}

/// Self-signed issuance backed by rcgen
#[derive(Debug, Clone)]
pub struct SelfSignedIssuer {
    validity: Duration,
    renew_before: Duration,
}

impl Default for SelfSignedIssuer {
    fn default() -> Self {
        Self {
            validity: Duration::days(CERT_VALIDITY_DAYS),
            renew_before: Duration::days(RENEW_BEFORE_DAYS),
        }
    }
}

impl SelfSignedIssuer {
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }
}

impl CertificateIssuer for SelfSignedIssuer {
    fn issue(&self, domain: &str, dir: &Path) -> Result<(), CertificateError> {
        let mut params = CertificateParams::new(vec![domain.to_string()]);
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, domain);
        params.distinguished_name = name;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + self.validity;

        let cert = Certificate::from_params(params)
            .map_err(|e| CertificateError::Generate(e.to_string()))?;
        let chain_pem = cert
            .serialize_pem()
            .map_err(|e| CertificateError::Generate(e.to_string()))?;
        let key_pem = cert.serialize_private_key_pem();

        fs::create_dir_all(dir)?;
        write_private(&dir.join(PRIVKEY_FILE), key_pem.as_bytes())?;
        fs::write(dir.join(FULLCHAIN_FILE), chain_pem)?;

        info!("Generated self-signed certificate for: {}", domain);
        Ok(())
    }

    fn validate(&self, dir: &Path) -> Result<(), CertificateError> {
        let key_path = dir.join(PRIVKEY_FILE);
        let chain_path = dir.join(FULLCHAIN_FILE);

        let chain = read_chain(&chain_path)?;
        let leaf = chain.first().ok_or_else(|| CertificateError::Parse {
            path: chain_path.clone(),
            reason: "no certificates found".to_string(),
        })?;
        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref()).map_err(|e| {
            CertificateError::Parse {
                path: chain_path.clone(),
                reason: e.to_string(),
            }
        })?;

        let expires_at = parsed.validity().not_after.timestamp();
        let renew_at = (OffsetDateTime::now_utc() + self.renew_before).unix_timestamp();
        if expires_at <= renew_at {
            return Err(CertificateError::Expiring(dir.display().to_string()));
        }

        let key_pem = read_file(&key_path)?;
        let key_pem = String::from_utf8(key_pem).map_err(|e| CertificateError::Parse {
            path: key_path.clone(),
            reason: e.to_string(),
        })?;

        // rustls must be able to sign with it
        let key = parse_key(&key_path, key_pem.as_bytes())?;
        rustls::crypto::ring::sign::any_supported_type(&key)?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CertificateError::Parse {
            path: key_path.clone(),
            reason: e.to_string(),
        })?;
        if key_pair.public_key_raw() != parsed.public_key().subject_public_key.data.as_ref() {
            return Err(CertificateError::KeyMismatch(dir.display().to_string()));
        }

        Ok(())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

fn read_file(path: &Path) -> Result<Vec<u8>, CertificateError> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CertificateError::MissingFile(path.to_path_buf()),
        _ => CertificateError::Io(e),
    })
}

fn read_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let pem = read_file(path)?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn parse_key(path: &Path, mut pem: &[u8]) -> Result<PrivateKeyDer<'static>, CertificateError> {
    rustls_pemfile::private_key(&mut pem)
        .map_err(|e| CertificateError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertificateError::Parse {
            path: path.to_path_buf(),
            reason: "no private key found".to_string(),
        })
}

/// Build a TLS context from `<dir>/privkey.pem` and `<dir>/fullchain.pem`
pub fn load_context(dir: &Path) -> Result<SecureContext, CertificateError> {
    let key_path = dir.join(PRIVKEY_FILE);
    let chain_path = dir.join(FULLCHAIN_FILE);

    let chain = read_chain(&chain_path)?;
    if chain.is_empty() {
        return Err(CertificateError::Parse {
            path: chain_path,
            reason: "no certificates found".to_string(),
        });
    }
    let key = parse_key(&key_path, &read_file(&key_path)?)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Bundle name used for an issued certificate
pub fn auto_cert_name(domain: &str) -> String {
    format!("{}{}", domain, AUTO_CERT_SUFFIX)
}

/// Reuse a still-valid bundle in `<root>/<name>` or replace it with a fresh one
fn provision(
    issuer: &dyn CertificateIssuer,
    root: &Path,
    domain: &str,
    name: &str,
) -> Result<SecureContext, CertificateError> {
    let dir = root.join(name);

    if dir.exists() {
        match issuer.validate(&dir) {
            Ok(()) => {
                debug!("Reusing certificate bundle {}", dir.display());
                return load_context(&dir);
            }
            Err(e) => {
                warn!("Certificate bundle {} invalid ({}), regenerating", dir.display(), e);
                fs::remove_dir_all(&dir)?;
            }
        }
    }

    fs::create_dir_all(root)?;
    let staging = root.join(format!(".{}.{}", name, Uuid::new_v4()));
    if let Err(e) = issuer.issue(domain, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    if let Err(e) = fs::rename(&staging, &dir) {
        let _ = fs::remove_dir_all(&staging);
        // Another process published the bundle first
        if !dir.exists() {
            return Err(e.into());
        }
        debug!("Certificate bundle {} created concurrently", dir.display());
    }

    load_context(&dir)
}

/// Resolves SNI names to TLS contexts
///
/// Contexts are cached by bundle name. Issuance for a bundle is serialized in process
/// and bounded globally; handshakes fail fast when the budget is exhausted.
pub struct CertificateResolver {
    certs_root: PathBuf,
    auto_issue: bool,
    routes: RouteStore,
    issuer: Arc<dyn CertificateIssuer>,
    contexts: DashMap<String, SecureContext>,
    issue_locks: DashMap<String, Arc<TokioMutex<()>>>,
    issue_budget: Arc<Semaphore>,
}

impl CertificateResolver {
    pub fn new<P: AsRef<Path>>(certs_root: P, routes: RouteStore, auto_issue: bool) -> Self {
        Self::with_issuer(certs_root, routes, auto_issue, Arc::new(SelfSignedIssuer::default()))
    }

    pub fn with_issuer<P: AsRef<Path>>(
        certs_root: P,
        routes: RouteStore,
        auto_issue: bool,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Self {
        Self {
            certs_root: certs_root.as_ref().to_path_buf(),
            auto_issue,
            routes,
            issuer,
            contexts: DashMap::new(),
            issue_locks: DashMap::new(),
            issue_budget: Arc::new(Semaphore::new(MAX_CONCURRENT_ISSUES)),
        }
    }

    /// Load every declared bundle. A missing or broken bundle is a configuration error.
    pub fn preload(&self) -> Result<usize, CertificateError> {
        let names = self.routes.load().cert_names();
        let mut loaded = 0;

        for (domain, name) in names {
            if self.contexts.contains_key(&name) {
                continue;
            }
            let context = load_context(&self.certs_root.join(&name))?;
            info!("Loaded certificate {} for {}", name, domain);
            self.contexts.insert(name, context);
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Whether the bundle stored under `name` can be reused
    pub fn validate(&self, name: &str) -> bool {
        self.issuer.validate(&self.certs_root.join(name)).is_ok()
    }

    /// TLS context for a server name
    pub async fn resolve(&self, domain: &str) -> Result<SecureContext, ProxyError> {
        let domain = domain.to_ascii_lowercase();
        let table = self.routes.load();

        if let Some(name) = table.cert_name(&domain) {
            if let Some(context) = self.contexts.get(name) {
                return Ok(context.clone());
            }
            let dir = self.certs_root.join(name);
            let context = tokio::task::spawn_blocking(move || load_context(&dir))
                .await
                .map_err(|e| ProxyError::NoCertificateContext(e.to_string()))?
                .map_err(|e| {
                    warn!("Failed to load certificate {} for {}: {}", name, domain, e);
                    ProxyError::NoCertificateContext(domain.clone())
                })?;
            self.contexts.insert(name.to_string(), context.clone());
            return Ok(context);
        }

        if !self.auto_issue || !table.contains_domain(&domain) || !is_plain_hostname(&domain) {
            return Err(ProxyError::NoCertificateContext(domain));
        }

        let name = auto_cert_name(&domain);
        if let Some(context) = self.contexts.get(&name) {
            return Ok(context.clone());
        }

        let lock = self
            .issue_locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(context) = self.contexts.get(&name) {
            return Ok(context.clone());
        }

        let _permit = self.issue_budget.clone().try_acquire_owned().map_err(|_| {
            warn!("Certificate issuance budget exhausted, rejecting {}", domain);
            ProxyError::NoCertificateContext(domain.clone())
        })?;

        let issuer = self.issuer.clone();
        let root = self.certs_root.clone();
        let (task_domain, task_name) = (domain.clone(), name.clone());
        let context = tokio::task::spawn_blocking(move || {
            provision(issuer.as_ref(), &root, &task_domain, &task_name)
        })
        .await
        .map_err(|e| ProxyError::NoCertificateContext(e.to_string()))?
        .map_err(|e| {
            warn!("Failed to provision certificate for {}: {}", domain, e);
            ProxyError::NoCertificateContext(domain.clone())
        })?;

        self.contexts.insert(name, context.clone());
        Ok(context)
    }
}

/// Server names become directory names; refuse anything that could leave the root
fn is_plain_hostname(domain: &str) -> bool {
    !domain.is_empty()
        && !domain.starts_with('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DomainConfig};
    use tempfile::tempdir;

    fn store(domains: &[(&str, Option<&str>)]) -> RouteStore {
        let mut config = Config::default();
        for (name, cert) in domains {
            config.domains.push((
                name.to_string(),
                DomainConfig {
                    cert_name: cert.map(str::to_string),
                    routes: Vec::new(),
                },
            ));
        }
        RouteStore::from_config(&config)
    }

    fn not_after(dir: &Path) -> i64 {
        let chain = read_chain(&dir.join(FULLCHAIN_FILE)).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(chain[0].as_ref()).unwrap();
        cert.validity().not_after.timestamp()
    }

    #[test]
    fn test_issue_and_validate() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("example.com");
        let issuer = SelfSignedIssuer::default();

        issuer.issue("example.com", &bundle).unwrap();

        assert!(bundle.join(PRIVKEY_FILE).exists());
        assert!(bundle.join(FULLCHAIN_FILE).exists());
        assert!(issuer.validate(&bundle).is_ok());
        assert!(load_context(&bundle).is_ok());
    }

    #[test]
    fn test_issued_validity_window() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("example.com");
        SelfSignedIssuer::default().issue("example.com", &bundle).unwrap();

        let remaining = not_after(&bundle) - OffsetDateTime::now_utc().unix_timestamp();
        let days = remaining / 86_400;
        assert!((394..=395).contains(&days), "unexpected validity: {} days", days);
    }

    #[test]
    fn test_expiring_bundle_is_invalid() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("example.com");
        SelfSignedIssuer::default()
            .with_validity(Duration::days(10))
            .issue("example.com", &bundle)
            .unwrap();

        let result = SelfSignedIssuer::default().validate(&bundle);
        assert!(matches!(result, Err(CertificateError::Expiring(_))));
    }

    #[test]
    fn test_missing_file_is_invalid() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("example.com");
        let issuer = SelfSignedIssuer::default();
        issuer.issue("example.com", &bundle).unwrap();

        fs::remove_file(bundle.join(PRIVKEY_FILE)).unwrap();
        assert!(matches!(issuer.validate(&bundle), Err(CertificateError::MissingFile(_))));

        fs::remove_file(bundle.join(FULLCHAIN_FILE)).unwrap();
        assert!(matches!(issuer.validate(&bundle), Err(CertificateError::MissingFile(_))));
    }

    #[test]
    fn test_mismatched_key_is_invalid() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        let issuer = SelfSignedIssuer::default();
        issuer.issue("first.com", &first).unwrap();
        issuer.issue("second.com", &second).unwrap();

        fs::copy(second.join(PRIVKEY_FILE), first.join(PRIVKEY_FILE)).unwrap();

        assert!(matches!(issuer.validate(&first), Err(CertificateError::KeyMismatch(_))));
    }

    #[test]
    fn test_garbage_key_is_invalid() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("example.com");
        let issuer = SelfSignedIssuer::default();
        issuer.issue("example.com", &bundle).unwrap();

        fs::write(bundle.join(PRIVKEY_FILE), "not a key").unwrap();
        assert!(issuer.validate(&bundle).is_err());
    }

    #[test]
    fn test_auto_cert_name() {
        assert_eq!(auto_cert_name("test.com"), "test.com-auto-generated");
    }

    #[test]
    fn test_plain_hostname() {
        assert!(is_plain_hostname("sub.test.com"));
        assert!(!is_plain_hostname("../etc"));
        assert!(!is_plain_hostname("a/b"));
        assert!(!is_plain_hostname(""));
    }

    #[test]
    fn test_preload_declared() {
        let dir = tempdir().unwrap();
        SelfSignedIssuer::default()
            .issue("test.com", &dir.path().join("bundle"))
            .unwrap();

        let resolver = CertificateResolver::new(
            dir.path(),
            store(&[("test.com", Some("bundle")), ("www.test.com", Some("bundle"))]),
            false,
        );

        assert_eq!(resolver.preload().unwrap(), 1);
    }

    #[test]
    fn test_preload_missing_bundle_fails() {
        let dir = tempdir().unwrap();
        let resolver =
            CertificateResolver::new(dir.path(), store(&[("test.com", Some("absent"))]), false);

        assert!(matches!(resolver.preload(), Err(CertificateError::MissingFile(_))));
    }

    #[tokio::test]
    async fn test_resolve_declared_bundle() {
        let dir = tempdir().unwrap();
        SelfSignedIssuer::default()
            .issue("test.com", &dir.path().join("bundle"))
            .unwrap();
        let resolver =
            CertificateResolver::new(dir.path(), store(&[("test.com", Some("bundle"))]), false);

        let first = resolver.resolve("test.com").await.unwrap();
        let second = resolver.resolve("TEST.com").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_no_context_without_auto_issue() {
        let dir = tempdir().unwrap();
        let resolver = CertificateResolver::new(dir.path(), store(&[("test.com", None)]), false);

        let result = resolver.resolve("test.com").await;
        assert!(matches!(result, Err(ProxyError::NoCertificateContext(_))));
        assert!(!dir.path().join(auto_cert_name("test.com")).exists());
    }

    #[tokio::test]
    async fn test_auto_issue_generates_bundle() {
        let dir = tempdir().unwrap();
        let resolver = CertificateResolver::new(dir.path(), store(&[("test.com", None)]), true);

        resolver.resolve("test.com").await.unwrap();

        let bundle = dir.path().join("test.com-auto-generated");
        assert!(resolver.validate("test.com-auto-generated"));
        let days = (not_after(&bundle) - OffsetDateTime::now_utc().unix_timestamp()) / 86_400;
        assert!((394..=395).contains(&days));
    }

    #[tokio::test]
    async fn test_auto_issue_ignores_unknown_domains() {
        let dir = tempdir().unwrap();
        let resolver = CertificateResolver::new(dir.path(), store(&[("test.com", None)]), true);

        let result = resolver.resolve("elsewhere.org").await;
        assert!(matches!(result, Err(ProxyError::NoCertificateContext(_))));
    }

    #[tokio::test]
    async fn test_valid_bundle_reused_after_restart() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("test.com-auto-generated");

        CertificateResolver::new(dir.path(), store(&[("test.com", None)]), true)
            .resolve("test.com")
            .await
            .unwrap();
        let before = fs::read(bundle.join(FULLCHAIN_FILE)).unwrap();

        CertificateResolver::new(dir.path(), store(&[("test.com", None)]), true)
            .resolve("test.com")
            .await
            .unwrap();
        let after = fs::read(bundle.join(FULLCHAIN_FILE)).unwrap();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_expiring_bundle_regenerated() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("test.com-auto-generated");
        SelfSignedIssuer::default()
            .with_validity(Duration::days(5))
            .issue("test.com", &bundle)
            .unwrap();
        let stale = not_after(&bundle);

        let resolver = CertificateResolver::new(dir.path(), store(&[("test.com", None)]), true);
        assert!(!resolver.validate("test.com-auto-generated"));
        resolver.resolve("test.com").await.unwrap();

        assert!(not_after(&bundle) > stale);
        assert!(resolver.validate("test.com-auto-generated"));
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_bundle() {
        let dir = tempdir().unwrap();
        let resolver = Arc::new(CertificateResolver::new(
            dir.path(),
            store(&[("test.com", None)]),
            true,
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve("test.com").await })
            })
            .collect();

        let mut contexts = Vec::new();
        for task in tasks {
            contexts.push(task.await.unwrap().unwrap());
        }
        assert!(contexts.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
