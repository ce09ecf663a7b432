//! TLS property set handed to the underlying pool.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{PoolError, PoolResult};
use crate::certificate::TrustStore;

/// TLS options that make server-certificate verification mandatory.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsProperties {
    pub require_tls: bool,
    pub verify_server_certificate: bool,
    /// `file://` URI of the trust store.
    pub trust_store_uri: String,
    pub trust_store_password: String,
}

impl std::fmt::Debug for TlsProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsProperties")
            .field("require_tls", &self.require_tls)
            .field("verify_server_certificate", &self.verify_server_certificate)
            .field("trust_store_uri", &self.trust_store_uri)
            .finish_non_exhaustive()
    }
}

/// Build the fixed TLS-enforcing property set for a trust store.
pub fn build_tls_properties(store_uri: &str, password: &str) -> TlsProperties {
    TlsProperties {
        require_tls: true,
        verify_server_certificate: true,
        trust_store_uri: store_uri.to_string(),
        trust_store_password: password.to_string(),
    }
}

impl TlsProperties {
    /// Driver-style property map, one key per setting.
    pub fn to_properties(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("useSSL", self.require_tls.to_string()),
            ("requireSSL", self.require_tls.to_string()),
            ("verifyServerCertificate", self.verify_server_certificate.to_string()),
            ("trustCertificateKeyStoreUrl", self.trust_store_uri.clone()),
            ("trustCertificateKeyStorePassword", self.trust_store_password.clone()),
        ])
    }

    /// Filesystem path behind `trust_store_uri`.
    pub fn trust_store_path(&self) -> PoolResult<PathBuf> {
        let url = url::Url::parse(&self.trust_store_uri)
            .map_err(|e| PoolError::KeyStore(format!("{}: {e}", self.trust_store_uri)))?;
        url.to_file_path()
            .map_err(|()| PoolError::KeyStore(format!("{} is not a file uri", self.trust_store_uri)))
    }

    /// Check the store's integrity and that every entry is a usable root.
    ///
    /// Returns the store's path, ready to hand to the driver as its CA file.
    /// Reads the file, so call it off the async runtime.
    pub fn verify_store(&self) -> PoolResult<PathBuf> {
        let path = self.trust_store_path()?;
        let store = TrustStore::load(&path, &self.trust_store_password)?;
        let roots = store.root_cert_store()?;
        if roots.is_empty() {
            return Err(PoolError::KeyStore(format!("{}: no trusted roots", path.display())));
        }
        Ok(path)
    }
}
