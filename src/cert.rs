//! Per-host leaf certificate minting, signed by the proxy's root CA.
//!
//! The root PEM pair is parsed at most once per proxy instance; the outcome
//! (good or bad) is cached for the process lifetime of the proxy. Minted
//! leaves are cached per canonical host and never evicted. Lookups and
//! inserts may race across sessions: a fresh leaf for the same host is
//! functionally interchangeable, so last write wins.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::{ErrorContext, OpaqueError};

const LEAF_ORGANIZATION: &str = "Alpha-Firm";
const LEAF_KEY_BITS: usize = 2048;

/// Parsed root CA material, shared by all leaf mints.
pub(crate) struct RootMaterial {
    issuer_cert: rcgen::Certificate,
    issuer_key: rcgen::KeyPair,
    not_after: time::OffsetDateTime,
}

/// Terminal outcome of a failed root parse, cached and cloned to every
/// session that asks.
#[derive(Debug, Clone)]
pub(crate) struct RootLoadError(String);

impl std::fmt::Display for RootLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for RootLoadError {}

/// A minted leaf: a one-entry certificate chain plus its private key.
pub(crate) struct MintedCert {
    chain: Vec<CertificateDer<'static>>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl MintedCert {
    pub(crate) fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// A rustls server configuration presenting this leaf.
    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, OpaqueError> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                self.chain.clone(),
                PrivateKeyDer::from(self.key.clone_key()),
            )
            .context("build tls server config from minted leaf")?;
        Ok(Arc::new(config))
    }
}

/// Mints and memoizes per-host leaf certificates.
pub(crate) struct CertMint {
    root_pem: Option<(String, String)>,
    root: OnceLock<Result<Arc<RootMaterial>, RootLoadError>>,
    cache: Mutex<HashMap<String, Arc<MintedCert>>>,
}

impl CertMint {
    /// `root_pem` is the externally supplied `(certificate, key)` PEM pair:
    /// one X.509 certificate and one PKCS#1 RSA private key.
    pub(crate) fn new(root_pem: Option<(String, String)>) -> Self {
        Self {
            root_pem,
            root: OnceLock::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Parse the root material, at most once. Subsequent calls return the
    /// cached outcome; a parse failure permanently disables MITM.
    pub(crate) fn load_root(&self) -> Result<Arc<RootMaterial>, RootLoadError> {
        self.root
            .get_or_init(|| {
                parse_root(self.root_pem.as_ref())
                    .map(Arc::new)
                    .map_err(|err| RootLoadError(err.to_string()))
            })
            .clone()
    }

    /// The leaf certificate for `host`, minting it if absent.
    pub(crate) fn cert_for_host(&self, host: &str) -> Result<Arc<MintedCert>, OpaqueError> {
        let root = self.load_root().map_err(OpaqueError::new)?;
        let canonical = canonical_host(host);
        if let Some(hit) = self.cache.lock().get(&canonical) {
            return Ok(hit.clone());
        }
        let minted = Arc::new(mint_leaf(&root, &canonical)?);
        self.cache.lock().insert(canonical, minted.clone());
        Ok(minted)
    }
}

/// Cache key and certificate subject: lowercased, port stripped.
pub(crate) fn canonical_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((inner, _)) = rest.split_once(']') {
            return inner.to_owned();
        }
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.is_empty()
                && !name.contains(':')
                && !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name.to_owned()
        }
        _ => host,
    }
}

fn parse_root(root_pem: Option<&(String, String)>) -> Result<RootMaterial, OpaqueError> {
    let (cert_pem, key_pem) = root_pem.context("no root ca material configured")?;

    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .context("decode root certificate pem")?;
    let root_x509 = pem.parse_x509().context("parse root certificate")?;
    let not_after = root_x509.validity().not_after.to_datetime();

    let rsa_key =
        rsa::RsaPrivateKey::from_pkcs1_pem(key_pem).context("parse pkcs#1 root private key")?;
    let pkcs8 = rsa_key
        .to_pkcs8_der()
        .context("re-encode root private key")?;
    let issuer_key =
        rcgen::KeyPair::try_from(pkcs8.as_bytes()).context("load root key pair for signing")?;

    let issuer_params = rcgen::CertificateParams::from_ca_cert_pem(cert_pem)
        .context("read issuer parameters from root certificate")?;
    let issuer_cert = issuer_params
        .self_signed(&issuer_key)
        .context("rebuild issuer certificate")?;

    Ok(RootMaterial {
        issuer_cert,
        issuer_key,
        not_after,
    })
}

fn mint_leaf(root: &RootMaterial, host: &str) -> Result<MintedCert, OpaqueError> {
    let rsa_key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, LEAF_KEY_BITS)
        .context("generate leaf rsa key")?;
    let pkcs8 = rsa_key
        .to_pkcs8_der()
        .context("encode leaf private key")?;
    let key_pair =
        rcgen::KeyPair::try_from(pkcs8.as_bytes()).context("load leaf key pair for signing")?;

    let mut params =
        rcgen::CertificateParams::new(vec![host.to_owned()]).context("leaf parameters")?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, LEAF_ORGANIZATION);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, host);

    let mut serial = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial));

    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = root.not_after;
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params
        .signed_by(&key_pair, &root.issuer_cert, &root.issuer_key)
        .context("sign leaf certificate")?;

    Ok(MintedCert {
        chain: vec![cert.der().clone()],
        key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
    })
}
