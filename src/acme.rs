//! On-demand TLS certificates
//!
//! Certificates are issued the first time a TLS client asks for a name:
//! - subdomains of the platform domain share one wildcard certificate,
//!   issued with a DNS-01 challenge through the DNS provider API
//! - any other routed domain gets its own certificate via HTTP-01, served
//!   by the web proxy at /.well-known/acme-challenge/
//!
//! Names that are not routed are never sent to the CA. Failed issuance is
//! backed off per name (doubling up to a ceiling) so a broken domain cannot
//! burn through CA rate limits. Certificates live in memory only; the ACME
//! account credentials are cached on disk.

use crate::config::Config;
use crate::dns01::{challenge_record_name, Dns01Error, DnsProvider};
use crate::routing::RoutingTable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt, NewAccount,
    NewOrder, OrderStatus,
};
use parking_lot::{Mutex, RwLock};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("TLS client sent no server name")]
    MissingServerName,

    #[error("no service is routed for {0}")]
    UnknownDomain(String),

    #[error("issuance for {name} is backing off for {retry_in:?}")]
    BackingOff { name: String, retry_in: Duration },

    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("certificate request error: {0}")]
    Csr(#[from] rcgen::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Dns01(#[from] Dns01Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ACME account error: {0}")]
    Account(String),

    #[error("challenge failed for {domain}: {reason}")]
    Challenge { domain: String, reason: String },
}

/// How a certificate is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssuanceMethod {
    #[serde(rename = "ACME-HTTP01")]
    Http01,
    #[serde(rename = "ACME-DNS01-wildcard")]
    Dns01Wildcard,
}

/// Certificate chain and private key returned by an [`Issuer`]
pub struct IssuedCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

#[async_trait]
pub trait Issuer: Send + Sync {
    async fn issue(&self, name: &str, method: IssuanceMethod) -> Result<IssuedCert, CertError>;
}

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<tokio::sync::RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Issues certificates from an ACME CA
pub struct AcmeIssuer {
    email: Option<String>,
    directory_url: String,
    cache_dir: PathBuf,
    account: OnceCell<Account>,
    http01: Http01Challenges,
    dns: Option<Arc<dyn DnsProvider>>,
    propagation_delay: Duration,
}

impl AcmeIssuer {
    pub fn new(
        config: &Config,
        http01: Http01Challenges,
        dns: Option<Arc<dyn DnsProvider>>,
    ) -> Result<Self, CertError> {
        let acme = &config.web.acme;
        Ok(Self {
            email: acme.email.clone(),
            directory_url: acme
                .directory_url
                .clone()
                .unwrap_or_else(|| LetsEncrypt::Production.url().to_string()),
            cache_dir: validate_cache_dir(&acme.cache_dir)?,
            account: OnceCell::new(),
            http01,
            dns,
            propagation_delay: acme.dns.propagation_delay(),
        })
    }

    async fn account(&self) -> Result<&Account, CertError> {
        self.account.get_or_try_init(|| self.load_or_create_account()).await
    }

    /// Load the cached ACME account or register a new one
    async fn load_or_create_account(&self) -> Result<Account, CertError> {
        let account_path = self.cache_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = tokio::fs::read_to_string(&account_path).await?;
            let credentials: AccountCredentials =
                serde_json::from_str(&data).map_err(|e| CertError::Account(e.to_string()))?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!(directory = %self.directory_url, "Creating new ACME account");
        let email = self
            .email
            .as_ref()
            .ok_or_else(|| CertError::Account("ACME email is required for account creation".to_string()))?;

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let data = serde_json::to_string_pretty(&credentials).map_err(|e| CertError::Account(e.to_string()))?;
        write_private(&account_path, data.as_bytes())?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    async fn wait_for_authorization(
        &self,
        order: &mut instant_acme::Order,
        identifier: &str,
    ) -> Result<(), CertError> {
        let mut attempts = 0;
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;

            order.refresh().await?;
            let auths = order.authorizations().await?;
            let current = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == identifier));

            match current.map(|a| &a.status) {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain = %identifier, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > 30 {
                        return Err(challenge_error(identifier, "authorization timed out"));
                    }
                    debug!(domain = %identifier, attempt = attempts, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => {
                    return Err(challenge_error(identifier, "authorization invalid"));
                }
                Some(status) => {
                    debug!(domain = %identifier, status = ?status, "Authorization status");
                }
                None => return Err(challenge_error(identifier, "authorization not found")),
            }
        }
    }
}

#[async_trait]
impl Issuer for AcmeIssuer {
    async fn issue(&self, name: &str, method: IssuanceMethod) -> Result<IssuedCert, CertError> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(name.to_string())];

        info!(name, ?method, "Requesting certificate");
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge_type = match method {
                IssuanceMethod::Http01 => ChallengeType::Http01,
                IssuanceMethod::Dns01Wildcard => ChallengeType::Dns01,
            };
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == challenge_type)
                .ok_or_else(|| challenge_error(&identifier, "challenge type not offered"))?;

            let key_auth = order.key_authorization(challenge);

            let mut dns_record = None;
            match method {
                IssuanceMethod::Http01 => {
                    debug!(domain = %identifier, token = %challenge.token, "Publishing HTTP-01 challenge");
                    self.http01
                        .set(challenge.token.clone(), key_auth.as_str().to_string())
                        .await;
                }
                IssuanceMethod::Dns01Wildcard => {
                    let dns = self.dns.as_ref().ok_or(Dns01Error::NotConfigured)?;
                    let record_name = challenge_record_name(&identifier);
                    let record_id = dns.create_txt(&record_name, &key_auth.dns_value()).await?;
                    dns_record = Some(record_id);
                    tokio::time::sleep(self.propagation_delay).await;
                }
            }

            order.set_challenge_ready(&challenge.url).await?;
            let result = self.wait_for_authorization(&mut order, &identifier).await;

            match method {
                IssuanceMethod::Http01 => self.http01.remove(&challenge.token).await,
                IssuanceMethod::Dns01Wildcard => {
                    if let (Some(dns), Some(record_id)) = (&self.dns, dns_record) {
                        if let Err(e) = dns.delete_txt(&record_id).await {
                            warn!(domain = %identifier, error = %e, "Failed to remove DNS-01 record");
                        }
                    }
                }
            }
            result?;
        }

        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => return Err(challenge_error(name, "order invalid")),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > 30 {
                        return Err(challenge_error(name, "order timed out"));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![name.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, name.to_string());
        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let chain_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(chain) => break chain,
                    None => return Err(challenge_error(name, "order valid but no certificate returned")),
                },
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > 30 {
                        return Err(challenge_error(name, "certificate timed out"));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                status => return Err(challenge_error(name, &format!("unexpected order status {:?}", status))),
            }
        };

        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(chain_pem.as_bytes()))
            .filter_map(|c| c.ok())
            .collect();
        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| CertError::Tls(rustls::Error::General(e.to_string())))?;

        info!(name, "Certificate obtained");
        Ok(IssuedCert { chain, key })
    }
}

fn challenge_error(domain: &str, reason: &str) -> CertError {
    CertError::Challenge {
        domain: domain.to_string(),
        reason: reason.to_string(),
    }
}

/// Summary of a held certificate
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    pub domain: String,
    pub expires_at: DateTime<Utc>,
    pub issuance_method: IssuanceMethod,
}

struct HeldCert {
    key: Arc<CertifiedKey>,
    info: CertificateInfo,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: Instant,
}

#[derive(Debug, Clone)]
pub struct CertSettings {
    /// Suffix served by the wildcard certificate, e.g. `apps.example.com`
    pub platform_domain: Option<String>,
    pub renew_before: Duration,
    pub renewal_check_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl CertSettings {
    pub fn from_config(config: &Config) -> Self {
        let acme = &config.web.acme;
        Self {
            platform_domain: config
                .web
                .platform_domain
                .as_deref()
                .map(|d| d.trim_end_matches('.').to_ascii_lowercase()),
            renew_before: acme.renew_before(),
            renewal_check_interval: acme.renewal_check_interval(),
            backoff_initial: acme.issuance_backoff_initial(),
            backoff_max: acme.issuance_backoff_max(),
        }
    }

    /// Delay before retrying after `failures` consecutive failures
    fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_initial.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Holds certificates and issues them on first use
pub struct CertificateManager {
    settings: CertSettings,
    issuer: Arc<dyn Issuer>,
    routing: Arc<RoutingTable>,
    certs: RwLock<HashMap<String, HeldCert>>,
    backoff: Mutex<HashMap<String, Backoff>>,
    issuing: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CertificateManager {
    pub fn new(settings: CertSettings, issuer: Arc<dyn Issuer>, routing: Arc<RoutingTable>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            issuer,
            routing,
            certs: RwLock::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
            issuing: DashMap::new(),
        })
    }

    /// Certificate name and method that would serve `host`
    pub fn plan(&self, host: &str) -> Result<(String, IssuanceMethod), CertError> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return Err(CertError::MissingServerName);
        }

        if let Some(platform) = &self.settings.platform_domain {
            if let Some(label) = host.strip_suffix(platform.as_str()).and_then(|p| p.strip_suffix('.')) {
                // A wildcard covers exactly one label
                if !label.is_empty() && !label.contains('.') {
                    return Ok((format!("*.{}", platform), IssuanceMethod::Dns01Wildcard));
                }
            }
        }

        if self.routing.lookup(&host).is_none() {
            return Err(CertError::UnknownDomain(host));
        }
        Ok((host, IssuanceMethod::Http01))
    }

    /// Certificate for `server_name`, issuing it if necessary
    pub async fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertError> {
        let (name, method) = self.plan(server_name)?;
        if let Some(key) = self.held(&name) {
            return Ok(key);
        }
        self.issue(&name, method, false).await
    }

    fn held(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        let certs = self.certs.read();
        let held = certs.get(name)?;
        (held.info.expires_at > Utc::now()).then(|| Arc::clone(&held.key))
    }

    fn check_backoff(&self, name: &str) -> Result<(), CertError> {
        if let Some(backoff) = self.backoff.lock().get(name) {
            let now = Instant::now();
            if backoff.retry_at > now {
                return Err(CertError::BackingOff {
                    name: name.to_string(),
                    retry_in: backoff.retry_at - now,
                });
            }
        }
        Ok(())
    }

    /// Issue `name` once even when many callers ask concurrently
    async fn issue(&self, name: &str, method: IssuanceMethod, renewal: bool) -> Result<Arc<CertifiedKey>, CertError> {
        self.check_backoff(name)?;

        let lock = Arc::clone(
            self.issuing
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );
        let _issuing = lock.lock().await;

        // Another caller may have finished while we waited
        if !renewal {
            if let Some(key) = self.held(name) {
                return Ok(key);
            }
        }
        self.check_backoff(name)?;

        let result = self
            .issuer
            .issue(name, method)
            .await
            .and_then(|issued| certified_key(name, method, issued));

        match result {
            Ok((key, info)) => {
                info!(name, expires_at = %info.expires_at, "Certificate installed");
                self.backoff.lock().remove(name);
                self.certs.write().insert(
                    name.to_string(),
                    HeldCert {
                        key: Arc::clone(&key),
                        info,
                    },
                );
                Ok(key)
            }
            Err(e) => {
                let mut backoff = self.backoff.lock();
                let failures = backoff.get(name).map(|b| b.failures).unwrap_or(0) + 1;
                let delay = self.settings.backoff_delay(failures);
                backoff.insert(
                    name.to_string(),
                    Backoff {
                        failures,
                        retry_at: Instant::now() + delay,
                    },
                );
                error!(name, error = %e, failures, retry_in_secs = delay.as_secs(), "Certificate issuance failed");
                Err(e)
            }
        }
    }

    /// Held certificates, sorted by name
    pub fn certificates(&self) -> Vec<CertificateInfo> {
        let mut infos: Vec<_> = self.certs.read().values().map(|h| h.info.clone()).collect();
        infos.sort_by(|a, b| a.domain.cmp(&b.domain));
        infos
    }

    /// Renew every certificate close to expiry; returns how many were renewed
    pub async fn renew_due(&self) -> usize {
        let cutoff = Utc::now() + chrono::Duration::from_std(self.settings.renew_before).unwrap_or_else(|_| chrono::Duration::zero());
        let due: Vec<(String, IssuanceMethod)> = self
            .certs
            .read()
            .values()
            .filter(|h| h.info.expires_at <= cutoff)
            .map(|h| (h.info.domain.clone(), h.info.issuance_method))
            .collect();

        let mut renewed = 0;
        for (name, method) in due {
            info!(name, "Certificate renewal needed");
            match self.issue(&name, method, true).await {
                Ok(_) => renewed += 1,
                Err(CertError::BackingOff { retry_in, .. }) => {
                    debug!(name, retry_in_secs = retry_in.as_secs(), "Renewal deferred");
                }
                Err(_) => {}
            }
        }
        renewed
    }

    /// Periodic renewal until shutdown
    pub async fn run_renewal(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.renewal_check_interval) => {
                    let renewed = self.renew_due().await;
                    if renewed > 0 {
                        info!(renewed, "Certificates renewed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Certificate renewal shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// rustls configuration serving the certificate for `server_name`
    pub async fn server_config(&self, server_name: Option<&str>) -> Result<Arc<ServerConfig>, CertError> {
        let server_name = server_name.ok_or(CertError::MissingServerName)?;
        let key = self.get_certificate(server_name).await?;
        let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(FixedCert(key)));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

/// Resolver handing out one already-chosen certificate
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

fn certified_key(
    name: &str,
    method: IssuanceMethod,
    issued: IssuedCert,
) -> Result<(Arc<CertifiedKey>, CertificateInfo), CertError> {
    let leaf = issued
        .chain
        .first()
        .ok_or_else(|| challenge_error(name, "empty certificate chain"))?;
    let expires_at = certificate_expiry(leaf).ok_or_else(|| challenge_error(name, "unreadable certificate"))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&issued.key)?;
    let key = Arc::new(CertifiedKey::new(issued.chain, signing_key));
    let info = CertificateInfo {
        domain: name.to_string(),
        expires_at,
        issuance_method: method,
    };
    Ok((key, info))
}

fn certificate_expiry(cert: &CertificateDer<'_>) -> Option<DateTime<Utc>> {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return None;
        }
    };
    DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0)
}

fn write_private(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, data)
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
    }
}

/// Validate and canonicalize the ACME cache directory path
fn validate_cache_dir(path: &str) -> Result<PathBuf, CertError> {
    if path.contains("..") {
        return Err(CertError::Account("ACME cache directory path must not contain '..'".to_string()));
    }

    let path_buf = PathBuf::from(path);
    if path_buf.exists() {
        let canonical = path_buf.canonicalize()?;
        if !canonical.is_dir() {
            return Err(CertError::Account(format!(
                "ACME cache path '{}' exists but is not a directory",
                path
            )));
        }
        return Ok(canonical);
    }

    Ok(path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ServiceInfo;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Issues self-signed certificates
    #[derive(Default)]
    struct FakeIssuer {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Issuer for FakeIssuer {
        async fn issue(&self, name: &str, _method: IssuanceMethod) -> Result<IssuedCert, CertError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(challenge_error(name, "rate limited"));
            }
            let params = CertificateParams::new(vec![name.to_string()])?;
            let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
            let cert = params.self_signed(&key_pair)?;
            Ok(IssuedCert {
                chain: vec![CertificateDer::from(cert.der().to_vec())],
                key: PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap(),
            })
        }
    }

    fn settings() -> CertSettings {
        CertSettings {
            platform_domain: Some("apps.example.com".to_string()),
            renew_before: Duration::from_secs(30 * 24 * 60 * 60),
            renewal_check_interval: Duration::from_secs(60),
            backoff_initial: Duration::from_secs(60),
            backoff_max: Duration::from_secs(6 * 60 * 60),
        }
    }

    fn manager(settings: CertSettings) -> (Arc<CertificateManager>, Arc<FakeIssuer>) {
        let routing = RoutingTable::new();
        routing.add(ServiceInfo {
            name: "shop".to_string(),
            namespace: "tenant".to_string(),
            port: 8080,
            identities: vec!["shop.example.com".to_string()],
            scale_to_zero: false,
        });
        let issuer = Arc::new(FakeIssuer::default());
        (CertificateManager::new(settings, issuer.clone(), routing), issuer)
    }

    #[test]
    fn test_plan_chooses_method() {
        let (manager, _) = manager(settings());
        assert_eq!(
            manager.plan("blog.apps.example.com").unwrap(),
            ("*.apps.example.com".to_string(), IssuanceMethod::Dns01Wildcard)
        );
        assert_eq!(
            manager.plan("Shop.Example.com.").unwrap(),
            ("shop.example.com".to_string(), IssuanceMethod::Http01)
        );
        // Nested subdomains are outside the wildcard
        assert!(matches!(manager.plan("a.b.apps.example.com"), Err(CertError::UnknownDomain(_))));
        assert!(matches!(manager.plan("evil.example.net"), Err(CertError::UnknownDomain(_))));
        assert!(matches!(manager.plan(""), Err(CertError::MissingServerName)));
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let s = settings();
        assert_eq!(s.backoff_delay(1), Duration::from_secs(60));
        assert_eq!(s.backoff_delay(2), Duration::from_secs(120));
        assert_eq!(s.backoff_delay(4), Duration::from_secs(480));
        assert_eq!(s.backoff_delay(20), Duration::from_secs(6 * 60 * 60));
        assert_eq!(s.backoff_delay(64), Duration::from_secs(6 * 60 * 60));
    }

    #[tokio::test]
    async fn test_wildcard_shared_by_subdomains() {
        let (manager, issuer) = manager(settings());
        manager.get_certificate("a.apps.example.com").await.unwrap();
        manager.get_certificate("b.apps.example.com").await.unwrap();

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        let certs = manager.certificates();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].domain, "*.apps.example.com");
        assert_eq!(certs[0].issuance_method, IssuanceMethod::Dns01Wildcard);
    }

    #[tokio::test]
    async fn test_concurrent_requests_issue_once() {
        let (manager, issuer) = manager(settings());
        let (a, b, c) = tokio::join!(
            manager.get_certificate("shop.example.com"),
            manager.get_certificate("shop.example.com"),
            manager.get_certificate("shop.example.com"),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_issuance_backs_off() {
        let (manager, issuer) = manager(settings());
        issuer.fail.store(true, Ordering::SeqCst);

        assert!(matches!(
            manager.get_certificate("shop.example.com").await,
            Err(CertError::Challenge { .. })
        ));
        assert!(matches!(
            manager.get_certificate("shop.example.com").await,
            Err(CertError::BackingOff { .. })
        ));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_domain_never_reaches_ca() {
        let (manager, issuer) = manager(settings());
        assert!(manager.get_certificate("random.example.org").await.is_err());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_renewal_reissues_expiring_certificates() {
        let mut s = settings();
        // Self-signed test certificates expire far in the future
        s.renew_before = Duration::from_secs(3000 * 365 * 24 * 60 * 60);
        let (manager, issuer) = manager(s);

        manager.get_certificate("shop.example.com").await.unwrap();
        assert_eq!(manager.renew_due().await, 1);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_config_requires_sni() {
        let (manager, _) = manager(settings());
        assert!(matches!(manager.server_config(None).await, Err(CertError::MissingServerName)));
        assert!(manager.server_config(Some("shop.example.com")).await.is_ok());
    }

    #[tokio::test]
    async fn test_http01_challenges() {
        let challenges = Http01Challenges::new();
        challenges.set("token123".to_string(), "key_auth_123".to_string()).await;
        assert_eq!(challenges.get("token123").await, Some("key_auth_123".to_string()));
        assert_eq!(challenges.get("nonexistent").await, None);

        challenges.remove("token123").await;
        assert_eq!(challenges.get("token123").await, None);
    }

    #[test]
    fn test_validate_cache_dir() {
        assert!(validate_cache_dir("../etc/passwd").is_err());
        assert!(validate_cache_dir("foo/../../bar").is_err());
        assert!(validate_cache_dir("./acme_cache").is_ok());

        let dir = tempfile::tempdir().unwrap();
        let canonical = validate_cache_dir(dir.path().to_str().unwrap()).unwrap();
        assert!(canonical.is_absolute());
    }
}
