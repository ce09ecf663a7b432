//! Root certificate loading and ephemeral trust store construction.
//!
//! The trust store is a PEM bundle with two extra header lines so any PEM
//! consumer can still read it as a CA file:
//!
//! ```text
//! # iamdb trust store
//! alias: rootCaCertificate
//! -----BEGIN CERTIFICATE-----
//! ...
//! -----END CERTIFICATE-----
//! mac: <hex HMAC-SHA256 over (alias, 0x00, der)* keyed by the store password>
//! ```
//!
//! The store password only guards integrity, the same way a Java key store
//! password does; certificates are public material.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use sha2::Sha256;
use tempfile::TempPath;

use crate::error::{PoolError, PoolResult};

type HmacSha256 = Hmac<Sha256>;

/// Root CA bundled into the binary. Server certificates presented by the
/// database must chain to it.
pub const EMBEDDED_ROOT_CA: &[u8] = include_bytes!("../certs/root-ca.pem");

/// Alias under which the root certificate is stored.
pub const ROOT_CA_ALIAS: &str = "rootCaCertificate";

/// Default trust store password.
pub const DEFAULT_STORE_PASSWORD: &str = "changeit";

const STORE_FILE_PREFIX: &str = "iamdb-cacerts-";
const STORE_FILE_SUFFIX: &str = ".pem";
const STORE_HEADER: &str = "# iamdb trust store";
const ALIAS_PREFIX: &str = "alias: ";
const MAC_PREFIX: &str = "mac: ";
const PEM_LINE_WIDTH: usize = 64;

/// Produces the root certificate and materializes it into a trust store.
///
/// [`CertificateLoader`] is the production implementation; tests substitute
/// counting doubles.
pub trait CertificateSource: Send + Sync {
    /// Load the trusted root certificate.
    fn load_root_certificate(&self) -> PoolResult<CertificateDer<'static>>;

    /// Write `cert` into a new password-protected trust store file.
    fn build_trust_store(
        &self,
        cert: &CertificateDer<'static>,
        password: &str,
    ) -> PoolResult<TrustAnchor>;
}

/// Where the root certificate comes from.
#[derive(Clone, Debug)]
enum RootSource {
    Embedded,
    File(PathBuf),
    Pem(Vec<u8>),
}

/// Loads the root CA and writes trust stores to a temporary directory.
#[derive(Clone, Debug)]
pub struct CertificateLoader {
    source: RootSource,
    store_dir: Option<PathBuf>,
}

impl Default for CertificateLoader {
    fn default() -> Self {
        Self::embedded()
    }
}

impl CertificateLoader {
    /// Use the root certificate compiled into the binary.
    pub fn embedded() -> Self {
        Self {
            source: RootSource::Embedded,
            store_dir: None,
        }
    }

    /// Read the root certificate from a PEM file; the first certificate wins.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: RootSource::File(path.into()),
            store_dir: None,
        }
    }

    /// Use in-memory PEM bytes.
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Self {
        Self {
            source: RootSource::Pem(pem.into()),
            store_dir: None,
        }
    }

    /// Builder method: write trust stores into `dir` instead of the system temp dir.
    pub fn with_store_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: Some(dir.into()),
            ..self
        }
    }
}

impl CertificateSource for CertificateLoader {
    fn load_root_certificate(&self) -> PoolResult<CertificateDer<'static>> {
        match &self.source {
            RootSource::Embedded => parse_root_certificate(EMBEDDED_ROOT_CA),
            RootSource::Pem(pem) => parse_root_certificate(pem),
            RootSource::File(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    PoolError::Certificate(format!("read {}: {e}", path.display()))
                })?;
                parse_root_certificate(&pem)
            }
        }
    }

    fn build_trust_store(
        &self,
        cert: &CertificateDer<'static>,
        password: &str,
    ) -> PoolResult<TrustAnchor> {
        let contents = render_store(&[(ROOT_CA_ALIAS, cert)], password)?;

        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix(STORE_FILE_PREFIX).suffix(STORE_FILE_SUFFIX);
            b
        };
        let mut file = match &self.store_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| PoolError::KeyStore(format!("create store file: {e}")))?;

        file.write_all(contents.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| PoolError::KeyStore(format!("write {}: {e}", file.path().display())))?;

        let path = file.into_temp_path();
        tracing::debug!(path = %path.display(), alias = ROOT_CA_ALIAS, "trust store written");

        Ok(TrustAnchor {
            certificate: cert.clone(),
            path,
            password: password.to_string(),
            alias: ROOT_CA_ALIAS.to_string(),
        })
    }
}

/// Parse and validate the first certificate of a PEM document.
pub fn parse_root_certificate(pem: &[u8]) -> PoolResult<CertificateDer<'static>> {
    let cert = CertificateDer::pem_slice_iter(pem)
        .next()
        .ok_or_else(|| PoolError::Certificate("no certificate found in PEM data".into()))?
        .map_err(|e| PoolError::Certificate(format!("malformed PEM: {e}")))?;

    // Rejects DER that does not parse as an X.509 trust anchor.
    rustls::RootCertStore::empty()
        .add(cert.clone())
        .map_err(|e| PoolError::Certificate(format!("unusable root certificate: {e}")))?;

    Ok(cert)
}

/// A materialized trust store. The backing file is removed when this is dropped.
pub struct TrustAnchor {
    certificate: CertificateDer<'static>,
    path: TempPath,
    password: String,
    alias: String,
}

impl TrustAnchor {
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    pub fn store_path(&self) -> &Path {
        &self.path
    }

    /// `file://` URI of the store.
    pub fn store_uri(&self) -> PoolResult<String> {
        url::Url::from_file_path(&self.path)
            .map(|u| u.to_string())
            .map_err(|()| {
                PoolError::KeyStore(format!("{} is not an absolute path", self.path.display()))
            })
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Delete the store file now, reporting failures instead of ignoring them.
    pub fn remove(self) -> PoolResult<()> {
        self.path
            .close()
            .map_err(|e| PoolError::KeyStore(format!("remove store file: {e}")))
    }

    /// Detach the store file from this anchor so it outlives the process.
    pub fn keep(self) -> PoolResult<PathBuf> {
        self.path
            .keep()
            .map_err(|e| PoolError::KeyStore(format!("keep store file: {e}")))
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("path", &self.path.display())
            .field("alias", &self.alias)
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

/// A trust store read back from disk.
#[derive(Debug)]
pub struct TrustStore {
    entries: Vec<(String, CertificateDer<'static>)>,
}

impl TrustStore {
    /// Load a store written by [`CertificateSource::build_trust_store`],
    /// verifying its integrity MAC against `password`.
    pub fn load(path: &Path, password: &str) -> PoolResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PoolError::KeyStore(format!("read {}: {e}", path.display())))?;

        let aliases: Vec<String> = contents
            .lines()
            .filter_map(|line| line.strip_prefix(ALIAS_PREFIX))
            .map(|alias| alias.trim().to_string())
            .collect();

        let mac = contents
            .lines()
            .find_map(|line| line.strip_prefix(MAC_PREFIX))
            .ok_or_else(|| PoolError::KeyStore(format!("{}: missing mac", path.display())))?;
        let mac = hex::decode(mac.trim())
            .map_err(|e| PoolError::KeyStore(format!("{}: bad mac: {e}", path.display())))?;

        let certificates = CertificateDer::pem_slice_iter(contents.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PoolError::KeyStore(format!("{}: {e}", path.display())))?;

        if certificates.len() != aliases.len() {
            return Err(PoolError::KeyStore(format!(
                "{}: {} aliases for {} certificates",
                path.display(),
                aliases.len(),
                certificates.len()
            )));
        }

        let entries: Vec<(String, CertificateDer<'static>)> =
            aliases.into_iter().zip(certificates).collect();

        let mut expected = store_mac(password)?;
        for (alias, cert) in &entries {
            feed_entry(&mut expected, alias, cert);
        }
        expected
            .verify_slice(&mac)
            .map_err(|_| PoolError::KeyStore("trust store password incorrect or store tampered".into()))?;

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a certificate by alias.
    pub fn certificate(&self, alias: &str) -> Option<&CertificateDer<'static>> {
        self.entries
            .iter()
            .find(|(a, _)| a == alias)
            .map(|(_, cert)| cert)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &CertificateDer<'static>)> {
        self.entries.iter().map(|(alias, cert)| (alias.as_str(), cert))
    }

    /// Build a `rustls` root store holding exactly these entries.
    pub fn root_cert_store(&self) -> PoolResult<rustls::RootCertStore> {
        let mut roots = rustls::RootCertStore::empty();
        for (alias, cert) in &self.entries {
            roots
                .add(cert.clone())
                .map_err(|e| PoolError::KeyStore(format!("entry {alias}: {e}")))?;
        }
        Ok(roots)
    }
}

fn store_mac(password: &str) -> PoolResult<HmacSha256> {
    if password.is_empty() {
        return Err(PoolError::KeyStore("trust store password must not be empty".into()));
    }
    HmacSha256::new_from_slice(password.as_bytes())
        .map_err(|e| PoolError::KeyStore(format!("store mac: {e}")))
}

fn feed_entry(mac: &mut HmacSha256, alias: &str, cert: &CertificateDer<'_>) {
    mac.update(alias.as_bytes());
    mac.update(&[0]);
    mac.update(cert.as_ref());
}

fn render_store(entries: &[(&str, &CertificateDer<'_>)], password: &str) -> PoolResult<String> {
    let mut mac = store_mac(password)?;
    let mut out = String::new();
    out.push_str(STORE_HEADER);
    out.push('\n');

    for (alias, cert) in entries {
        feed_entry(&mut mac, alias, cert);

        out.push_str(ALIAS_PREFIX);
        out.push_str(alias);
        out.push('\n');
        out.push_str("-----BEGIN CERTIFICATE-----\n");
        let encoded = STANDARD.encode(cert.as_ref());
        for chunk in encoded.as_bytes().chunks(PEM_LINE_WIDTH) {
            // base64 output is ASCII
            out.push_str(&String::from_utf8_lossy(chunk));
            out.push('\n');
        }
        out.push_str("-----END CERTIFICATE-----\n");
    }

    out.push_str(MAC_PREFIX);
    out.push_str(&hex::encode(mac.finalize().into_bytes()));
    out.push('\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedded_der() -> CertificateDer<'static> {
        CertificateLoader::embedded().load_root_certificate().unwrap()
    }

    #[test]
    fn embedded_certificate_parses() {
        let cert = embedded_der();
        assert!(!cert.is_empty());
    }

    #[test]
    fn from_pem_rejects_empty_input() {
        let err = CertificateLoader::from_pem(Vec::new())
            .load_root_certificate()
            .unwrap_err();
        assert!(matches!(err, PoolError::Certificate(_)));
    }

    #[test]
    fn from_pem_rejects_non_certificate_der() {
        let pem = "-----BEGIN CERTIFICATE-----\nAAECAwQF\n-----END CERTIFICATE-----\n";
        let err = CertificateLoader::from_pem(pem).load_root_certificate().unwrap_err();
        assert!(matches!(err, PoolError::Certificate(_)));
    }

    #[test]
    fn from_missing_file_is_certificate_error() {
        let err = CertificateLoader::from_file("/nonexistent/root.pem")
            .load_root_certificate()
            .unwrap_err();
        assert!(matches!(err, PoolError::Certificate(_)));
    }

    #[test]
    fn trust_store_contains_exactly_the_root() {
        let loader = CertificateLoader::embedded();
        let cert = loader.load_root_certificate().unwrap();
        let anchor = loader.build_trust_store(&cert, DEFAULT_STORE_PASSWORD).unwrap();

        let store = TrustStore::load(anchor.store_path(), DEFAULT_STORE_PASSWORD).unwrap();
        assert_eq!(store.len(), 1);
        let stored = store.certificate(ROOT_CA_ALIAS).expect("root alias present");
        assert_eq!(stored.as_ref(), cert.as_ref());
        assert_eq!(anchor.alias(), ROOT_CA_ALIAS);
        assert_eq!(anchor.password(), DEFAULT_STORE_PASSWORD);
    }

    #[test]
    fn trust_store_rejects_wrong_password() {
        let loader = CertificateLoader::embedded();
        let anchor = loader
            .build_trust_store(&embedded_der(), "s3cret")
            .unwrap();
        let err = TrustStore::load(anchor.store_path(), "changeit").unwrap_err();
        assert!(matches!(err, PoolError::KeyStore(_)));
    }

    #[test]
    fn trust_store_detects_tampering() {
        let loader = CertificateLoader::embedded();
        let anchor = loader.build_trust_store(&embedded_der(), "pw").unwrap();
        let contents = std::fs::read_to_string(anchor.store_path()).unwrap();
        let tampered = contents.replace(ROOT_CA_ALIAS, "otherAlias");
        std::fs::write(anchor.store_path(), tampered).unwrap();

        assert!(TrustStore::load(anchor.store_path(), "pw").is_err());
    }

    #[test]
    fn each_build_creates_a_new_file() {
        let loader = CertificateLoader::embedded();
        let cert = embedded_der();
        let a = loader.build_trust_store(&cert, "pw").unwrap();
        let b = loader.build_trust_store(&cert, "pw").unwrap();
        assert_ne!(a.store_path(), b.store_path());
    }

    #[test]
    fn store_file_removed_on_drop() {
        let loader = CertificateLoader::embedded();
        let anchor = loader.build_trust_store(&embedded_der(), "pw").unwrap();
        let path = anchor.store_path().to_path_buf();
        assert!(path.exists());
        drop(anchor);
        assert!(!path.exists());
    }

    #[test]
    fn remove_deletes_store_file() {
        let loader = CertificateLoader::embedded();
        let anchor = loader.build_trust_store(&embedded_der(), "pw").unwrap();
        let path = anchor.store_path().to_path_buf();
        anchor.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn kept_store_survives_drop() {
        let dir = tempfile::tempdir().unwrap();
        let loader = CertificateLoader::embedded().with_store_dir(dir.path());
        let anchor = loader.build_trust_store(&embedded_der(), "pw").unwrap();
        let path = anchor.keep().unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());
    }

    #[test]
    fn store_uri_is_file_url() {
        let loader = CertificateLoader::embedded();
        let anchor = loader.build_trust_store(&embedded_der(), "pw").unwrap();
        let uri = anchor.store_uri().unwrap();
        assert!(uri.starts_with("file:///"), "got {uri}");
        assert!(uri.ends_with(STORE_FILE_SUFFIX));
    }

    #[test]
    fn empty_password_rejected() {
        let err = CertificateLoader::embedded()
            .build_trust_store(&embedded_der(), "")
            .unwrap_err();
        assert!(matches!(err, PoolError::KeyStore(_)));
    }

    #[test]
    fn store_roots_feed_rustls() {
        let loader = CertificateLoader::embedded();
        let anchor = loader.build_trust_store(&embedded_der(), "pw").unwrap();
        let store = TrustStore::load(anchor.store_path(), "pw").unwrap();
        let roots = store.root_cert_store().unwrap();
        assert_eq!(roots.len(), 1);
    }
}
